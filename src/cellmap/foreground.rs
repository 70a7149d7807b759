// Signal/background segmentation of the second channel. The channel is
// smoothed, turned into an edge-strength map and blurred, so textured cell
// bodies stand out from flat background. The intensity range selected on
// the first slice is reused for every slice of the run.

use super::picker::{ForegroundPreview, ThresholdPicker};
use super::raster::{circular_mean, find_edges, smooth, Mask};
use super::threshold::{triangle, Histogram, HISTOGRAM_BINS};
use crate::errors::CellDensityError;

use log::{info, warn};
use ndarray::{Array2, Zip};

const EDGE_MEAN_RADIUS: f32 = 5.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ForegroundMode {
    // Triangle threshold of the first slice
    Auto,
    // lower bound, upper bound open
    Fixed(f32),
    // Triangle threshold of the first slice, adjusted by the operator
    InteractiveFirstSlice,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ForegroundThreshold {
    pub min: f32,
    pub max: f32,
}

pub fn preprocess(channel: &Array2<f32>) -> Array2<f32> {
    circular_mean(&find_edges(&smooth(channel)), EDGE_MEAN_RADIUS)
}

// Triangle threshold for a dark background: everything from the split up to
// the brightest pixel is foreground.
pub fn auto_range(processed: &Array2<f32>) -> (f32, f32) {
    match Histogram::new(processed.iter().copied(), HISTOGRAM_BINS) {
        Some(hist) => (triangle(&hist), hist.max),
        None => (f32::INFINITY, f32::INFINITY),
    }
}

impl ForegroundThreshold {
    pub fn freeze(
        mode: ForegroundMode,
        first_channel: &Array2<f32>,
        picker: Option<&mut dyn ThresholdPicker>,
    ) -> ForegroundThreshold {
        let threshold = match mode {
            ForegroundMode::Fixed(min) => ForegroundThreshold {
                min,
                max: f32::INFINITY,
            },
            ForegroundMode::Auto => {
                let (min, max) = auto_range(&preprocess(first_channel));
                ForegroundThreshold { min, max }
            }
            ForegroundMode::InteractiveFirstSlice => {
                let processed = preprocess(first_channel);
                let auto = auto_range(&processed);
                let (min, max) = match picker {
                    Some(picker) => match picker.pick_foreground(&ForegroundPreview::new(&processed, auto)) {
                        Ok(range) => range,
                        Err(CellDensityError::ThresholdCancelled) => {
                            warn!("Foreground threshold selection cancelled, using automatic range");
                            auto
                        }
                        Err(err) => {
                            warn!("Foreground threshold selection failed ({}), using automatic range", err);
                            auto
                        }
                    },
                    None => auto,
                };
                ForegroundThreshold { min, max }
            }
        };
        info!("Foreground threshold range: [{}, {}]", threshold.min, threshold.max);

        return threshold;
    }

    pub fn mask(&self, channel: &Array2<f32>) -> Mask {
        let processed = preprocess(channel);
        let mut mask = Mask::from_elem(processed.dim(), false);
        Zip::from(&mut mask).and(&processed).for_each(|m, &v| {
            *m = v >= self.min && v <= self.max;
        });
        return mask;
    }
}
