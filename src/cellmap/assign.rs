// Grow each nucleus into a cell footprint. A small disk marker is painted at
// every nucleus centroid and the plane is flooded from the markers in order
// of distance to the marker centre, leaving one pixel watershed lines where
// two basins meet. Each nucleus then takes the basin under its centroid.

use super::instances::InstanceSet;
use super::raster::{disk_pixels, neighbours, pixel_of, Connectivity, LabelImage, Mask};

use log::trace;
use ndarray::Array2;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

pub const DEFAULT_MARKER_RADIUS: usize = 2;

#[derive(Clone, Debug, PartialEq)]
pub struct CellRegion {
    pub source_instance_id: u32,
    pub pixels: Vec<(usize, usize)>,
    pub touches_border: bool,
}

impl CellRegion {
    pub fn area(&self) -> f64 {
        self.pixels.len() as f64
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CellAssigner {
    pub marker_radius: usize,

    // basins stop growing this far (in pixels) from their marker centre
    pub max_reach: Option<f64>,
}

impl CellAssigner {
    pub fn new(marker_radius: usize, max_reach: Option<f64>) -> CellAssigner {
        CellAssigner {
            marker_radius,
            max_reach,
        }
    }

    // Later instances overwrite earlier ones where markers overlap.
    pub fn paint_markers(&self, instances: &InstanceSet, dim: (usize, usize)) -> LabelImage {
        let mut markers = LabelImage::zeros(dim);
        for instance in instances {
            for p in disk_pixels(dim, instance.centroid, self.marker_radius) {
                markers[p] = instance.id;
            }
        }
        return markers;
    }

    // One cell per input instance, in input order. An empty region means the
    // nucleus was not turned into a cell.
    pub fn assign(
        &self,
        instances: &InstanceSet,
        dim: (usize, usize),
        foreground: Option<&Mask>,
    ) -> Vec<CellRegion> {
        let t0 = Instant::now();
        let markers = self.paint_markers(instances, dim);
        let centres = centroid_pixels(instances, dim);
        let basins = flood(&markers, &centres, self.max_reach);
        trace!("flood: {:?}", t0.elapsed());

        let mut basin_pixels: HashMap<u32, Vec<(usize, usize)>> = HashMap::new();
        for ((i, j), &label) in basins.indexed_iter() {
            if label != 0 {
                basin_pixels.entry(label).or_default().push((i, j));
            }
        }

        return instances
            .iter()
            .map(|instance| {
                let label = centres.get(&instance.id).map(|&p| basins[p]).unwrap_or(0);
                let mut pixels = if label == 0 {
                    Vec::new()
                } else {
                    basin_pixels.get(&label).cloned().unwrap_or_default()
                };
                if let Some(foreground) = foreground {
                    pixels.retain(|&p| foreground[p]);
                }

                CellRegion {
                    source_instance_id: instance.id,
                    pixels,
                    touches_border: false,
                }
            })
            .collect();
    }
}

pub fn centroid_pixels(instances: &InstanceSet, dim: (usize, usize)) -> HashMap<u32, (usize, usize)> {
    instances
        .iter()
        .filter_map(|instance| pixel_of(dim, instance.centroid).map(|p| (instance.id, p)))
        .collect()
}

// Priority flood from labelled markers, 0 on watershed lines and beyond
// reach. A pixel whose already labelled
// 8-neighbours carry more than one label becomes a line pixel (0), so no two
// distinct basins are ever 8-adjacent.
pub fn flood(
    markers: &LabelImage,
    centres: &HashMap<u32, (usize, usize)>,
    max_reach: Option<f64>,
) -> LabelImage {
    let dim = markers.dim();
    let mut labels = markers.clone();
    let mut done = markers.mapv(|l| l != 0);
    let reach2 = max_reach.map(|r| r * r);

    let mut heap = BinaryHeap::new();
    let mut seq: u64 = 0;

    let mut push = |heap: &mut BinaryHeap<_>, q: (usize, usize), label: u32| {
        let Some(&(ci, cj)) = centres.get(&label) else {
            return;
        };
        let (di, dj) = (q.0 as i64 - ci as i64, q.1 as i64 - cj as i64);
        let d2 = (di * di + dj * dj) as u64;
        if let Some(reach2) = reach2 {
            if d2 as f64 > reach2 {
                return;
            }
        }
        heap.push(Reverse((d2, seq, q.0, q.1, label)));
        seq += 1;
    };

    for ((i, j), &label) in markers.indexed_iter() {
        if label == 0 {
            continue;
        }
        for q in neighbours(dim, (i, j), Connectivity::Eight) {
            if !done[q] {
                push(&mut heap, q, label);
            }
        }
    }

    while let Some(Reverse((_, _, i, j, label))) = heap.pop() {
        if done[[i, j]] {
            continue;
        }
        done[[i, j]] = true;

        let conflict = neighbours(dim, (i, j), Connectivity::Eight)
            .any(|q| labels[q] != 0 && labels[q] != label);
        if conflict {
            continue;
        }

        labels[[i, j]] = label;
        for q in neighbours(dim, (i, j), Connectivity::Eight) {
            if !done[q] {
                push(&mut heap, q, label);
            }
        }
    }

    return labels;
}

// Union of cell regions, optionally including cells flagged at the border.
pub fn combined_mask(cells: &[CellRegion], dim: (usize, usize), include_border: bool) -> Mask {
    let mut mask = Array2::from_elem(dim, false);
    for cell in cells {
        if cell.touches_border && !include_border {
            continue;
        }
        for &p in &cell.pixels {
            mask[p] = true;
        }
    }
    return mask;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cellmap::instances::Instance;

    fn nucleus(id: u32, x: usize, y: usize) -> Instance {
        let mut pixels = Vec::new();
        for i in y - 2..=y + 2 {
            for j in x - 2..=x + 2 {
                pixels.push((i, j));
            }
        }
        Instance::new(id, pixels)
    }

    #[test]
    fn test_basins_are_separated_by_lines() {
        let instances = InstanceSet::new(vec![
            nucleus(1, 10, 20),
            nucleus(2, 30, 20),
            nucleus(3, 20, 8),
        ])
        .unwrap();
        let dim = (40, 40);
        let assigner = CellAssigner::new(2, None);
        let basins = flood(
            &assigner.paint_markers(&instances, dim),
            &centroid_pixels(&instances, dim),
            None,
        );

        for ((i, j), &l) in basins.indexed_iter() {
            if l == 0 {
                continue;
            }
            for q in neighbours(dim, (i, j), Connectivity::Eight) {
                let lq = basins[q];
                assert!(lq == 0 || lq == l, "basins {} and {} touch at {:?}", l, lq, (i, j));
            }
        }

        let cells = assigner.assign(&instances, dim, None);
        assert_eq!(cells.len(), 3);
        for (cell, instance) in cells.iter().zip(instances.iter()) {
            assert_eq!(cell.source_instance_id, instance.id);
            assert!(!cell.is_empty());
            let centre = pixel_of(dim, instance.centroid).unwrap();
            assert!(cell.pixels.contains(&centre));
        }

        // without a reach limit the basins cover nearly the whole plane
        let covered: f64 = cells.iter().map(|c| c.area()).sum();
        assert!(covered > 0.9 * 1600.0);
    }

    #[test]
    fn test_foreground_discards_background_cells() {
        let instances = InstanceSet::new(vec![nucleus(1, 10, 20), nucleus(2, 30, 20)]).unwrap();
        let dim = (40, 40);
        let foreground = Mask::from_shape_fn(dim, |(_, j)| j < 18);

        let cells = CellAssigner::new(2, None).assign(&instances, dim, Some(&foreground));
        assert!(!cells[0].is_empty());
        assert!(cells[0].pixels.iter().all(|&(_, j)| j < 18));
        assert!(cells[1].is_empty());
    }

    #[test]
    fn test_coincident_centroids_share_a_basin() {
        let instances = InstanceSet::new(vec![nucleus(1, 20, 20), nucleus(2, 20, 20)]).unwrap();
        let assigner = CellAssigner::new(2, None);
        let markers = assigner.paint_markers(&instances, (40, 40));
        assert!(markers.iter().all(|&l| l != 1));

        let cells = assigner.assign(&instances, (40, 40), None);
        assert_eq!(cells[0].pixels, cells[1].pixels);
        assert!(!cells[0].is_empty());
    }

    #[test]
    fn test_reach_limits_basin() {
        let instances = InstanceSet::new(vec![nucleus(1, 50, 50)]).unwrap();
        let cells = CellAssigner::new(2, Some(10.0)).assign(&instances, (100, 100), None);

        let cell = &cells[0];
        assert!(!cell.is_empty());
        for &(i, j) in &cell.pixels {
            let (di, dj) = (i as f64 - 50.0, j as f64 - 50.0);
            assert!(di * di + dj * dj <= 100.0);
        }
    }

    #[test]
    fn test_combined_mask() {
        let cells = vec![
            CellRegion {
                source_instance_id: 1,
                pixels: vec![(0, 0)],
                touches_border: true,
            },
            CellRegion {
                source_instance_id: 2,
                pixels: vec![(2, 2)],
                touches_border: false,
            },
        ];
        let inner = combined_mask(&cells, (4, 4), false);
        assert!(!inner[[0, 0]] && inner[[2, 2]]);
        let all = combined_mask(&cells, (4, 4), true);
        assert!(all[[0, 0]] && all[[2, 2]]);
    }
}
