// Histogram based automatic thresholds. Both methods return the lower edge
// of the foreground range: a pixel is foreground iff value >= threshold.

pub const HISTOGRAM_BINS: usize = 256;

#[derive(Clone, Debug)]
pub struct Histogram {
    pub counts: Vec<u64>,
    pub min: f32,
    pub max: f32,
}

impl Histogram {
    // None if there are no finite values.
    pub fn new<I>(values: I, nbins: usize) -> Option<Histogram>
    where
        I: IntoIterator<Item = f32> + Clone,
    {
        let (mut min, mut max) = (f32::INFINITY, f32::NEG_INFINITY);
        for v in values.clone().into_iter().filter(|v| v.is_finite()) {
            min = min.min(v);
            max = max.max(v);
        }
        if min > max {
            return None;
        }

        let mut counts = vec![0; nbins];
        let width = (max - min) / nbins as f32;
        for v in values.into_iter().filter(|v| v.is_finite()) {
            let bin = if width > 0.0 {
                (((v - min) / width).floor() as usize).min(nbins - 1)
            } else {
                0
            };
            counts[bin] += 1;
        }

        return Some(Histogram { counts, min, max });
    }

    pub fn bin_width(&self) -> f32 {
        (self.max - self.min) / self.counts.len() as f32
    }

    pub fn bin_value(&self, bin: usize) -> f32 {
        self.min + bin as f32 * self.bin_width()
    }

    fn is_degenerate(&self) -> bool {
        !(self.max > self.min)
    }
}

// Otsu's method: maximise the between-class variance.
pub fn otsu(hist: &Histogram) -> f32 {
    if hist.is_degenerate() {
        return f32::INFINITY;
    }

    let total: f64 = hist.counts.iter().map(|&c| c as f64).sum();
    let sum: f64 = hist
        .counts
        .iter()
        .enumerate()
        .map(|(i, &c)| i as f64 * c as f64)
        .sum();

    let mut sum_b = 0.0;
    let mut weight_b = 0.0;
    let mut max_variance = 0.0;
    let mut split = 0;

    for (i, &count) in hist.counts.iter().enumerate() {
        weight_b += count as f64;
        if weight_b == 0.0 {
            continue;
        }

        let weight_f = total - weight_b;
        if weight_f == 0.0 {
            break;
        }

        sum_b += i as f64 * count as f64;
        let mean_b = sum_b / weight_b;
        let mean_f = (sum - sum_b) / weight_f;

        let variance = weight_b * weight_f * (mean_b - mean_f).powi(2);
        if variance > max_variance {
            max_variance = variance;
            split = i;
        }
    }

    return hist.bin_value(split + 1);
}

// Triangle method (Zack et al. 1977): the split is the bin farthest from the
// line joining the histogram peak to the far end of its longer tail. The
// foreground is taken to be the bright side, i.e. a dark background.
pub fn triangle(hist: &Histogram) -> f32 {
    if hist.is_degenerate() {
        return f32::INFINITY;
    }

    let n = hist.counts.len();
    let mut data: Vec<f64> = hist.counts.iter().map(|&c| c as f64).collect();

    let mut min = data.iter().position(|&c| c > 0.0).unwrap_or(0);
    if min > 0 {
        min -= 1;
    }
    let mut min2 = data.iter().rposition(|&c| c > 0.0).unwrap_or(n - 1);
    if min2 < n - 1 {
        min2 += 1;
    }
    let mut dmax = 0;
    for (i, &c) in data.iter().enumerate() {
        if c > data[dmax] {
            dmax = i;
        }
    }

    // work on the longer tail, flipping the histogram if it is on the left
    let inverted = (dmax - min) < (min2 - dmax);
    if inverted {
        data.reverse();
        min = n - 1 - min2;
        dmax = n - 1 - dmax;
    }

    if min == dmax {
        let split = if inverted { n - 1 - min } else { min };
        return hist.bin_value(split + 1);
    }

    let mut nx = data[dmax];
    let mut ny = min as f64 - dmax as f64;
    let d = (nx * nx + ny * ny).sqrt();
    nx /= d;
    ny /= d;
    let d = nx * min as f64 + ny * data[min];

    let mut split = min;
    let mut split_distance = 0.0;
    for (i, &c) in data.iter().enumerate().take(dmax + 1).skip(min + 1) {
        let distance = nx * i as f64 + ny * c - d;
        if distance > split_distance {
            split = i;
            split_distance = distance;
        }
    }
    split = split.saturating_sub(1);

    if inverted {
        split = n - 1 - split;
    }

    return hist.bin_value(split + 1);
}
