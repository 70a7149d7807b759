// Raster primitives over ndarray images. Index order is always [[row, col]],
// i.e. [[y, x]], while point coordinates are (x, y) in pixel units with
// pixel (i, j) covering [j, j+1) x [i, i+1).

use itertools::iproduct;
use ndarray::{Array2, Zip};
use std::collections::VecDeque;

pub type LabelImage = Array2<u32>;
pub type Mask = Array2<bool>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Connectivity {
    Four,
    Eight,
}

const OFFSETS_4: [(isize, isize); 4] = [(-1, 0), (0, -1), (0, 1), (1, 0)];
const OFFSETS_8: [(isize, isize); 8] = [
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, -1),
    (0, 1),
    (1, -1),
    (1, 0),
    (1, 1),
];

impl Connectivity {
    pub fn offsets(self) -> &'static [(isize, isize)] {
        match self {
            Connectivity::Four => &OFFSETS_4,
            Connectivity::Eight => &OFFSETS_8,
        }
    }
}

#[inline]
pub fn neighbours(
    dim: (usize, usize),
    index: (usize, usize),
    conn: Connectivity,
) -> impl Iterator<Item = (usize, usize)> {
    let (m, n) = (dim.0 as isize, dim.1 as isize);
    let (i, j) = (index.0 as isize, index.1 as isize);
    conn.offsets().iter().filter_map(move |&(di, dj)| {
        let (ii, jj) = (i + di, j + dj);
        if ii < 0 || jj < 0 || ii >= m || jj >= n {
            None
        } else {
            Some((ii as usize, jj as usize))
        }
    })
}

// Pixel containing the point (x, y), if it lies inside the image.
pub fn pixel_of(dim: (usize, usize), point: (f64, f64)) -> Option<(usize, usize)> {
    let (x, y) = (point.0.floor(), point.1.floor());
    if x < 0.0 || y < 0.0 || y >= dim.0 as f64 || x >= dim.1 as f64 {
        return None;
    }
    return Some((y as usize, x as usize));
}

// Pixels within `radius` of the pixel containing `centre`, clipped to the image.
pub fn disk_pixels(dim: (usize, usize), centre: (f64, f64), radius: usize) -> Vec<(usize, usize)> {
    let (m, n) = (dim.0 as i64, dim.1 as i64);
    let (cx, cy) = (centre.0.floor() as i64, centre.1.floor() as i64);
    let r = radius as i64;

    return iproduct!(-r..=r, -r..=r)
        .filter(|(di, dj)| di * di + dj * dj <= r * r)
        .map(|(di, dj)| (cy + di, cx + dj))
        .filter(|&(i, j)| i >= 0 && j >= 0 && i < m && j < n)
        .map(|(i, j)| (i as usize, j as usize))
        .collect();
}

#[inline]
pub fn in_border_band(dim: (usize, usize), index: (usize, usize), width: usize) -> bool {
    let (i, j) = index;
    return i < width || j < width || i + width >= dim.0 || j + width >= dim.1;
}

// Label connected foreground components 1..=n, numbered in raster-scan order
// of their first pixel. Returns the label image and n.
pub fn connected_components(mask: &Mask, conn: Connectivity) -> (LabelImage, u32) {
    let dim = mask.dim();
    let mut labels = Array2::zeros(dim);
    let mut count = 0;
    let mut queue = VecDeque::new();

    for ((i, j), &fg) in mask.indexed_iter() {
        if !fg || labels[[i, j]] != 0 {
            continue;
        }

        count += 1;
        labels[[i, j]] = count;
        queue.push_back((i, j));
        while let Some(p) = queue.pop_front() {
            for q in neighbours(dim, p, conn) {
                if mask[q] && labels[q] == 0 {
                    labels[q] = count;
                    queue.push_back(q);
                }
            }
        }
    }

    return (labels, count);
}

// 3x3 maximum filter: every label grows by one pixel along both axes.
pub fn maximum_box(labels: &LabelImage) -> LabelImage {
    let dim = labels.dim();
    let mut out = Array2::zeros(dim);
    Zip::indexed(&mut out).par_for_each(|(i, j), v| {
        let mut m = labels[[i, j]];
        for q in neighbours(dim, (i, j), Connectivity::Eight) {
            m = m.max(labels[q]);
        }
        *v = m;
    });
    return out;
}

#[inline]
fn clamped(dim: (usize, usize), i: isize, j: isize) -> (usize, usize) {
    let i = i.clamp(0, dim.0 as isize - 1) as usize;
    let j = j.clamp(0, dim.1 as isize - 1) as usize;
    return (i, j);
}

// 3x3 correlation with edge pixels replicated.
fn filter3x3(img: &Array2<f32>, kernel: &[[f32; 3]; 3], scale: f32) -> Array2<f32> {
    let dim = img.dim();
    let mut out = Array2::zeros(dim);
    Zip::indexed(&mut out).par_for_each(|(i, j), v| {
        let mut acc = 0.0;
        for (ki, row) in kernel.iter().enumerate() {
            for (kj, &w) in row.iter().enumerate() {
                let q = clamped(dim, i as isize + ki as isize - 1, j as isize + kj as isize - 1);
                acc += w * img[q];
            }
        }
        *v = acc / scale;
    });
    return out;
}

// 3x3 mean blur.
pub fn smooth(img: &Array2<f32>) -> Array2<f32> {
    return filter3x3(img, &[[1.0; 3]; 3], 9.0);
}

// Sobel gradient magnitude.
pub fn find_edges(img: &Array2<f32>) -> Array2<f32> {
    let gx = filter3x3(img, &[[-1.0, 0.0, 1.0], [-2.0, 0.0, 2.0], [-1.0, 0.0, 1.0]], 1.0);
    let gy = filter3x3(img, &[[-1.0, -2.0, -1.0], [0.0, 0.0, 0.0], [1.0, 2.0, 1.0]], 1.0);
    let mut out = gx;
    Zip::from(&mut out).and(&gy).for_each(|x, &y| *x = (*x * *x + y * y).sqrt());
    return out;
}

// Mean over a circular kernel. The kernel covers offsets with
// di² + dj² <= radius² + 1, which keeps small radii from degenerating into
// a cross.
pub fn circular_mean(img: &Array2<f32>, radius: f32) -> Array2<f32> {
    let dim = img.dim();
    let r2 = radius * radius + 1.0;
    let r = r2.sqrt().floor() as isize;
    let offsets: Vec<(isize, isize)> = iproduct!(-r..=r, -r..=r)
        .filter(|&(di, dj)| (di * di + dj * dj) as f32 <= r2)
        .collect();
    let norm = offsets.len() as f32;

    let mut out = Array2::zeros(dim);
    Zip::indexed(&mut out).par_for_each(|(i, j), v| {
        let mut acc = 0.0;
        for &(di, dj) in &offsets {
            acc += img[clamped(dim, i as isize + di, j as isize + dj)];
        }
        *v = acc / norm;
    });
    return out;
}
