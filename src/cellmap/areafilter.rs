use super::instances::InstanceSet;
use super::picker::{AreaPreview, ThresholdPicker};
use crate::errors::CellDensityError;

use log::{info, warn};

// Used when the first slice offers nothing to choose from.
pub const DEFAULT_AREA_THRESHOLD: f64 = 1.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ThresholdMode {
    Fixed(f64),
    InteractiveFirstSlice,
}

// Removes nuclei whose area is at or below a threshold. The threshold is
// chosen once, on the first slice of a run, and never changes afterwards.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AreaFilter {
    threshold: f64,
}

impl AreaFilter {
    pub fn freeze(
        mode: ThresholdMode,
        first_slice: &InstanceSet,
        picker: Option<&mut dyn ThresholdPicker>,
    ) -> AreaFilter {
        let threshold = match mode {
            ThresholdMode::Fixed(threshold) => threshold,
            ThresholdMode::InteractiveFirstSlice => {
                pick_interactively(first_slice, picker)
            }
        };
        info!("Nucleus area threshold: {}", threshold);

        return AreaFilter { threshold };
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn apply(&self, instances: &InstanceSet) -> InstanceSet {
        instances.retain(|instance| instance.area > self.threshold)
    }
}

fn pick_interactively(first_slice: &InstanceSet, picker: Option<&mut dyn ThresholdPicker>) -> f64 {
    let Some((min_area, max_area)) = first_slice.area_range() else {
        warn!("First slice has no nuclei, using area threshold {}", DEFAULT_AREA_THRESHOLD);
        return DEFAULT_AREA_THRESHOLD;
    };

    // one below the smallest nucleus keeps everything
    let lower = min_area - 1.0;
    let preview = AreaPreview::new(first_slice.iter().map(|i| i.area).collect(), lower, max_area);

    let Some(picker) = picker else {
        warn!("No threshold picker available, using area threshold {}", lower);
        return lower;
    };

    match picker.pick_area(&preview) {
        Ok(threshold) => threshold.clamp(lower, max_area),
        Err(CellDensityError::ThresholdCancelled) => {
            warn!("Area threshold selection cancelled, using {}", lower);
            lower
        }
        Err(err) => {
            warn!("Area threshold selection failed ({}), using {}", err, lower);
            lower
        }
    }
}
