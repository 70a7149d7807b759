pub mod areafilter;
pub mod assign;
pub mod border;
pub mod density;
pub mod driver;
pub mod foreground;
pub mod instances;
pub mod neighbors;
pub mod picker;
pub mod raster;
pub mod threshold;
pub mod voronoi;

use areafilter::{ThresholdMode, DEFAULT_AREA_THRESHOLD};
use assign::{CellAssigner, DEFAULT_MARKER_RADIUS};
use border::{BorderPolicy, DEFAULT_BORDER_WIDTH};
use density::{BinSize, Calibration, DensityMapper};
use foreground::ForegroundMode;
use instances::InstanceSet;
use voronoi::Tessellator;

// Reach as a multiple of the typical spacing between neighbouring nuclei.
pub const DEFAULT_REACH_FACTOR: f64 = 1.5;

// Used when a slice has fewer than two nuclei to measure spacing from.
pub const FALLBACK_REACH: f64 = 32.0;

// How far (in pixels) cells and Voronoi regions may grow from their centroid.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Reach {
    // factor times the median nearest-centroid distance of the slice
    Auto { factor: f64 },
    Fixed(f64),
    Unbounded,
}

impl Default for Reach {
    fn default() -> Self {
        Reach::Auto {
            factor: DEFAULT_REACH_FACTOR,
        }
    }
}

impl Reach {
    pub fn resolve(&self, nuclei: &InstanceSet) -> Option<f64> {
        match *self {
            Reach::Auto { factor } => Some(
                nuclei
                    .median_nearest_distance()
                    .filter(|&d| d > 0.0)
                    .map(|d| factor * d)
                    .unwrap_or(FALLBACK_REACH),
            ),
            Reach::Fixed(reach) => Some(reach),
            Reach::Unbounded => None,
        }
    }
}

// Geometric tuning constants shared by every slice of a run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CellMapParams {
    // pixels from the image edge
    pub border_width: usize,

    // radius of the disks painted at nucleus centroids
    pub marker_radius: usize,

    // growth limit for cells and Voronoi regions
    pub reach: Reach,

    pub bin: BinSize,
}

impl Default for CellMapParams {
    fn default() -> Self {
        CellMapParams {
            border_width: DEFAULT_BORDER_WIDTH,
            marker_radius: DEFAULT_MARKER_RADIUS,
            reach: Reach::default(),
            bin: BinSize::default(),
        }
    }
}

impl CellMapParams {
    pub fn assigner(&self, max_reach: Option<f64>) -> CellAssigner {
        CellAssigner::new(self.marker_radius, max_reach)
    }

    pub fn border_policy(&self) -> BorderPolicy {
        BorderPolicy::new(self.border_width)
    }

    pub fn tessellator(&self, max_reach: Option<f64>) -> Tessellator {
        Tessellator::new(self.marker_radius, max_reach)
    }

    pub fn density_mapper(&self) -> DensityMapper {
        DensityMapper::new(self.bin)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunConfig {
    pub params: CellMapParams,
    pub area_mode: ThresholdMode,

    // Some for the two channel variant
    pub foreground_mode: Option<ForegroundMode>,

    pub calibration: Calibration,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            params: CellMapParams::default(),
            area_mode: ThresholdMode::Fixed(DEFAULT_AREA_THRESHOLD),
            foreground_mode: None,
            calibration: Calibration::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cellmap::instances::Instance;

    fn dot(id: u32, i: usize, j: usize) -> Instance {
        Instance::new(id, vec![(i, j)])
    }

    #[test]
    fn test_reach_follows_nucleus_spacing() {
        let grid = InstanceSet::new(vec![dot(1, 10, 10), dot(2, 10, 90), dot(3, 90, 10), dot(4, 90, 90)]).unwrap();
        let reach = Reach::default().resolve(&grid).unwrap();
        assert!((reach - DEFAULT_REACH_FACTOR * 80.0).abs() < 1e-4);

        // spacing doubles, so does the reach
        let sparse = InstanceSet::new(vec![dot(1, 10, 10), dot(2, 10, 170)]).unwrap();
        assert!((Reach::default().resolve(&sparse).unwrap() - 2.0 * reach).abs() < 1e-3);
    }

    #[test]
    fn test_reach_fallbacks() {
        let single = InstanceSet::new(vec![dot(1, 5, 5)]).unwrap();
        assert_eq!(Reach::default().resolve(&single), Some(FALLBACK_REACH));

        let coincident = InstanceSet::new(vec![dot(1, 5, 5), dot(2, 5, 5)]).unwrap();
        assert_eq!(Reach::default().resolve(&coincident), Some(FALLBACK_REACH));

        assert_eq!(Reach::Fixed(12.0).resolve(&single), Some(12.0));
        assert_eq!(Reach::Unbounded.resolve(&single), None);
    }
}
