// Local cell density: every pixel of the valid region counts the cell
// centroids within `bin_size` pixels and is scaled to cells per physical
// area. Pixels outside the valid region are NaN.

use super::raster::{disk_pixels, Mask};
use crate::errors::{CellDensityError, Result};

use log::debug;
use ndarray::{Array2, Zip};
use std::f64::consts::PI;

pub const DEFAULT_BIN_WEIGHT: f64 = 0.9;

pub type DensityMap = Array2<f32>;

#[derive(Clone, Debug, PartialEq)]
pub struct Calibration {
    pub pixel_size: f64,
    pub unit: String,
}

impl Default for Calibration {
    fn default() -> Self {
        Calibration {
            pixel_size: 1.0,
            unit: String::from("pixel"),
        }
    }
}

impl Calibration {
    pub fn new(pixel_size: f64, unit: &str) -> Calibration {
        Calibration {
            pixel_size,
            unit: unit.to_string(),
        }
    }

    // Densities of micrometre calibrated images are reported per mm².
    pub fn density_scale(&self) -> Calibration {
        match self.unit.as_str() {
            "micron" | "microns" | "um" | "\u{b5}m" | "\u{3bc}m" => Calibration {
                pixel_size: self.pixel_size / 1000.0,
                unit: String::from("mm"),
            },
            _ => self.clone(),
        }
    }

    pub fn density_unit(&self) -> String {
        format!("cells/{}^2", self.density_scale().unit)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BinSize {
    Auto { weight: f64 },
    Fixed(usize),
}

impl Default for BinSize {
    fn default() -> Self {
        BinSize::Auto {
            weight: DEFAULT_BIN_WEIGHT,
        }
    }
}

pub fn auto_bin_size(mean_cell_area: f64, weight: f64) -> usize {
    let bin_size = (weight * 2.0 * mean_cell_area).sqrt().round();
    if !bin_size.is_finite() || bin_size < 1.0 {
        return 1;
    }
    return bin_size as usize;
}

#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct DensityMapper {
    pub bin: BinSize,
}

impl DensityMapper {
    pub fn new(bin: BinSize) -> DensityMapper {
        DensityMapper { bin }
    }

    // None when the bin size is automatic and there are no cells to average.
    pub fn bin_size(&self, cell_areas: &[f64]) -> Option<usize> {
        match self.bin {
            BinSize::Fixed(bin_size) => Some(bin_size.max(1)),
            BinSize::Auto { weight } => {
                if cell_areas.is_empty() {
                    return None;
                }
                let mean = cell_areas.iter().sum::<f64>() / cell_areas.len() as f64;
                Some(auto_bin_size(mean, weight))
            }
        }
    }

    pub fn density_map(
        &self,
        centroids: &[(f64, f64)],
        valid: &Mask,
        bin_size: usize,
        calibration: &Calibration,
    ) -> DensityMap {
        let dim = valid.dim();
        let mut counts = Array2::<u32>::zeros(dim);
        for &centroid in centroids {
            for p in disk_pixels(dim, centroid, bin_size) {
                counts[p] += 1;
            }
        }

        let scale = calibration.density_scale();
        let radius = bin_size as f64 * scale.pixel_size;
        let norm = (1.0 / (PI * radius * radius)) as f32;
        debug!("density bin size {} px, {} {} per count", bin_size, norm, calibration.density_unit());

        let mut density = DensityMap::from_elem(dim, f32::NAN);
        Zip::from(&mut density)
            .and(&counts)
            .and(valid)
            .par_for_each(|d, &count, &valid| {
                if valid {
                    *d = count as f32 * norm;
                }
            });
        return density;
    }
}

pub fn empty_density_map(dim: (usize, usize)) -> DensityMap {
    DensityMap::from_elem(dim, f32::NAN)
}

// Cells per physical area over the whole slice. `slice` is 1-based.
pub fn mean_density(
    cell_count: usize,
    total_cell_area: f64,
    calibration: &Calibration,
    slice: usize,
) -> Result<f64> {
    if cell_count == 0 || !(total_cell_area > 0.0) {
        return Err(CellDensityError::DegenerateSlice { slice });
    }
    let pixel_size = calibration.density_scale().pixel_size;
    return Ok(cell_count as f64 / total_cell_area / (pixel_size * pixel_size));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_bin_size() {
        // four nuclei of 100 px² each
        let mapper = DensityMapper::default();
        assert_eq!(mapper.bin_size(&[100.0, 100.0, 100.0, 100.0]), Some(13));
        assert_eq!(auto_bin_size(0.1, DEFAULT_BIN_WEIGHT), 1);
        assert_eq!(mapper.bin_size(&[]), None);
        assert_eq!(DensityMapper::new(BinSize::Fixed(7)).bin_size(&[]), Some(7));
    }

    #[test]
    fn test_density_map_sentinel_outside_mask() {
        let dim = (30, 30);
        let valid = Mask::from_shape_fn(dim, |(i, j)| i >= 10 && i < 20 && j >= 10 && j < 20);
        let centroids = [(12.5, 12.5), (14.5, 12.5), (25.5, 25.5)];
        let calibration = Calibration::default();
        let map = DensityMapper::default().density_map(&centroids, &valid, 3, &calibration);

        for (p, &d) in map.indexed_iter() {
            if valid[p] {
                assert!(d >= 0.0);
            } else {
                assert!(d.is_nan());
            }
        }

        let unit = (1.0 / (PI * 9.0)) as f32;
        assert!((map[[12, 13]] - 2.0 * unit).abs() < 1e-6);
        assert!((map[[19, 19]] - 0.0).abs() < 1e-6);
    }

    #[test]
    fn test_micron_calibration() {
        let calibration = Calibration::new(0.5, "micron");
        let scaled = calibration.density_scale();
        assert_eq!(scaled.unit, "mm");
        assert!((scaled.pixel_size - 0.0005).abs() < 1e-12);
        assert_eq!(calibration.density_unit(), "cells/mm^2");

        let inches = Calibration::new(0.1, "inch");
        assert_eq!(inches.density_scale(), inches);
    }

    #[test]
    fn test_mean_density() {
        let calibration = Calibration::new(2.0, "pixel");
        let density = mean_density(1, 50.0, &calibration, 1).unwrap();
        assert!((density - 1.0 / 50.0 / 4.0).abs() < 1e-12);

        assert!(matches!(
            mean_density(0, 0.0, &calibration, 3),
            Err(CellDensityError::DegenerateSlice { slice: 3 })
        ));
    }
}
