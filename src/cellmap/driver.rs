// Runs the per-slice pipeline over a stack. Thresholds are frozen on the
// first slice, which is processed alone; the remaining slices run in
// parallel and are reassembled in slice order.

use super::areafilter::AreaFilter;
use super::assign::{combined_mask, CellRegion};
use super::density::{empty_density_map, mean_density, DensityMap};
use super::foreground::ForegroundThreshold;
use super::instances::InstanceSet;
use super::neighbors::{mean_neighbor_count, neighbor_map, NeighborMap};
use super::picker::ThresholdPicker;
use super::raster::{pixel_of, LabelImage};
use super::RunConfig;
use crate::errors::{CellDensityError, Result};

use indicatif::ProgressBar;
use log::{debug, info, warn};
use ndarray::Array2;
use rayon::prelude::*;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

// Source of nucleus instance labels, one label image per slice.
pub trait Segmenter: Sync {
    fn slice_count(&self) -> usize;
    fn segment(&self, index: usize) -> Result<LabelImage>;
}

// Label images produced ahead of time by an external segmentation service.
pub struct PrecomputedLabels {
    pages: Vec<LabelImage>,
}

impl PrecomputedLabels {
    pub fn new(pages: Vec<LabelImage>) -> PrecomputedLabels {
        PrecomputedLabels { pages }
    }
}

impl Segmenter for PrecomputedLabels {
    fn slice_count(&self) -> usize {
        self.pages.len()
    }

    fn segment(&self, index: usize) -> Result<LabelImage> {
        self.pages.get(index).cloned().ok_or_else(|| {
            CellDensityError::InvalidInput(format!("no label image for slice {}", index + 1))
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SliceStatus {
    Ok,
    Degenerate,
    SegmentationEmpty,
}

impl SliceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SliceStatus::Ok => "ok",
            SliceStatus::Degenerate => "degenerate",
            SliceStatus::SegmentationEmpty => "empty",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SliceSummary {
    // 1-based
    pub slice: usize,
    pub status: SliceStatus,
    pub nuclei: usize,

    // cells away from the border
    pub cells: usize,
    pub cell_area: f64,

    pub mean_density: Option<f64>,
    pub mean_neighbors: Option<f64>,
    pub bin_size: Option<usize>,
}

// The rasters and statistics of one slice.
pub struct SliceResult {
    // nuclei surviving the area filter
    pub nuclei: LabelImage,
    pub density: DensityMap,
    pub neighbors: NeighborMap,

    // footprints of all accepted cells, two channel runs only
    pub cell_map: Option<LabelImage>,

    pub summary: SliceSummary,
}

impl SliceResult {
    fn empty(
        slice: usize,
        dim: (usize, usize),
        status: SliceStatus,
        nuclei: LabelImage,
        cells: &[CellRegion],
        two_channel: bool,
    ) -> SliceResult {
        let nuclei_count = InstanceSet::from_label_image(&nuclei).len();
        let cell_map = if two_channel {
            Some(paint_cells(cells, dim))
        } else {
            None
        };

        return SliceResult {
            nuclei,
            density: empty_density_map(dim),
            neighbors: NeighborMap::zeros(dim),
            cell_map,
            summary: SliceSummary {
                slice,
                status,
                nuclei: nuclei_count,
                cells: 0,
                cell_area: 0.0,
                mean_density: None,
                mean_neighbors: None,
                bin_size: None,
            },
        };
    }
}

#[derive(Default)]
pub struct StackOutput {
    pub nuclei: Vec<LabelImage>,
    pub density: Vec<DensityMap>,
    pub neighbors: Vec<NeighborMap>,
    pub cell_maps: Vec<LabelImage>,
}

impl StackOutput {
    fn push(&mut self, output: SliceResult) -> SliceSummary {
        self.nuclei.push(output.nuclei);
        self.density.push(output.density);
        self.neighbors.push(output.neighbors);
        if let Some(cell_map) = output.cell_map {
            self.cell_maps.push(cell_map);
        }
        return output.summary;
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    pub slices: Vec<SliceSummary>,
    pub area_threshold: f64,
    pub foreground: Option<ForegroundThreshold>,
    pub density_unit: String,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn degenerate_slices(&self) -> Vec<usize> {
        self.slices
            .iter()
            .filter(|s| s.status != SliceStatus::Ok)
            .map(|s| s.slice)
            .collect()
    }
}

pub struct SliceDriver<'a, S: Segmenter> {
    segmenter: &'a S,
    channel2: Option<&'a [Array2<f32>]>,
    config: RunConfig,
    progress: ProgressBar,
}

// Parameters fixed by the first slice.
#[derive(Clone, Copy, Debug)]
struct Frozen {
    filter: AreaFilter,
    foreground: Option<ForegroundThreshold>,
}

// The first slice's labels with the thresholds chosen on them.
pub struct FirstSlice {
    labels: LabelImage,
    frozen: Frozen,
}

// Slices finished after the first skipped one are dropped, so the stacks
// always hold slices 1..=k without gaps.
fn completed_prefix<T>(outputs: Vec<Option<T>>) -> (Vec<T>, bool) {
    let total = outputs.len();
    let done: Vec<T> = outputs.into_iter().map_while(|output| output).collect();
    let cancelled = done.len() < total;
    return (done, cancelled);
}

impl<'a, S: Segmenter> SliceDriver<'a, S> {
    pub fn new(
        segmenter: &'a S,
        channel2: Option<&'a [Array2<f32>]>,
        config: RunConfig,
    ) -> Result<SliceDriver<'a, S>> {
        if segmenter.slice_count() == 0 {
            return Err(CellDensityError::InvalidInput(String::from(
                "label stack has no slices",
            )));
        }
        if let Some(channel2) = channel2 {
            if channel2.len() != segmenter.slice_count() {
                return Err(CellDensityError::InvalidInput(format!(
                    "label stack has {} slices but the second channel has {}",
                    segmenter.slice_count(),
                    channel2.len()
                )));
            }
            if config.foreground_mode.is_none() {
                return Err(CellDensityError::InvalidInput(String::from(
                    "second channel given without a foreground threshold mode",
                )));
            }
        }

        return Ok(SliceDriver {
            segmenter,
            channel2,
            config,
            progress: ProgressBar::hidden(),
        });
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    fn two_channel(&self) -> bool {
        self.channel2.is_some()
    }

    // Fix the area threshold, and the foreground range for two channel runs,
    // from the first slice.
    fn freeze_thresholds(
        &self,
        first: &LabelImage,
        mut picker: Option<&mut dyn ThresholdPicker>,
    ) -> Frozen {
        let instances = InstanceSet::from_label_image(first);
        let filter = AreaFilter::freeze(
            self.config.area_mode,
            &instances,
            picker.as_mut().map(|p| &mut **p as &mut dyn ThresholdPicker),
        );

        let foreground = match (self.channel2, self.config.foreground_mode) {
            (Some(channel2), Some(mode)) => {
                Some(ForegroundThreshold::freeze(mode, &channel2[0], picker))
            }
            _ => None,
        };

        return Frozen { filter, foreground };
    }

    // Segments the first slice and consults the picker. This is the only
    // step that talks to the operator.
    pub fn freeze(&self, picker: Option<&mut dyn ThresholdPicker>) -> Result<FirstSlice> {
        let labels = self.segmenter.segment(0)?;
        let frozen = self.freeze_thresholds(&labels, picker);
        return Ok(FirstSlice { labels, frozen });
    }

    pub fn run(
        &self,
        picker: Option<&mut dyn ThresholdPicker>,
        cancel: &AtomicBool,
    ) -> Result<(StackOutput, RunSummary)> {
        if cancel.load(Ordering::Relaxed) {
            let mut summary = self.new_summary(0.0, None);
            summary.cancelled = true;
            return Ok((StackOutput::default(), summary));
        }
        let first = self.freeze(picker)?;
        return self.run_frozen(first, cancel);
    }

    fn new_summary(&self, area_threshold: f64, foreground: Option<ForegroundThreshold>) -> RunSummary {
        RunSummary {
            slices: Vec::with_capacity(self.segmenter.slice_count()),
            area_threshold,
            foreground,
            density_unit: self.config.calibration.density_unit(),
            cancelled: false,
        }
    }

    pub fn run_frozen(&self, first: FirstSlice, cancel: &AtomicBool) -> Result<(StackOutput, RunSummary)> {
        let nslices = self.segmenter.slice_count();
        let frozen = first.frozen;
        let mut stack = StackOutput::default();
        let mut summary = self.new_summary(frozen.filter.threshold(), frozen.foreground);

        if cancel.load(Ordering::Relaxed) {
            summary.cancelled = true;
            return Ok((stack, summary));
        }

        let result = self.process_labels(0, first.labels, &frozen)?;
        self.report(&result.summary);
        summary.slices.push(stack.push(result));

        let rest = (1..nslices)
            .into_par_iter()
            .map(|index| -> Result<Option<SliceResult>> {
                if cancel.load(Ordering::Relaxed) {
                    return Ok(None);
                }
                let result = self.process_slice(index, &frozen)?;
                self.report(&result.summary);
                Ok(Some(result))
            })
            .collect::<Result<Vec<_>>>()?;

        let (rest, cancelled) = completed_prefix(rest);
        for result in rest {
            summary.slices.push(stack.push(result));
        }
        summary.cancelled = cancelled;
        if cancelled {
            warn!(
                "Run cancelled after {} of {} slices",
                summary.slices.len(),
                nslices
            );
        }
        self.progress.finish_and_clear();

        return Ok((stack, summary));
    }

    // Degenerate slices are logged where they are detected.
    fn report(&self, summary: &SliceSummary) {
        if summary.status == SliceStatus::Ok {
            info!(
                "Slice {}: {} cells, {} px² cell area, bin size {}",
                summary.slice,
                summary.cells,
                summary.cell_area,
                summary.bin_size.unwrap_or(0)
            );
        }
        self.progress.inc(1);
    }

    fn process_slice(&self, index: usize, frozen: &Frozen) -> Result<SliceResult> {
        let labels = self.segmenter.segment(index)?;
        return self.process_labels(index, labels, frozen);
    }

    fn process_labels(&self, index: usize, labels: LabelImage, frozen: &Frozen) -> Result<SliceResult> {
        let slice = index + 1;
        let dim = labels.dim();
        let params = &self.config.params;
        let t0 = Instant::now();

        let instances = InstanceSet::from_label_image(&labels);
        drop(labels);
        if instances.is_empty() {
            warn!("{}", CellDensityError::SegmentationEmpty { slice });
            return Ok(SliceResult::empty(
                slice,
                dim,
                SliceStatus::SegmentationEmpty,
                LabelImage::zeros(dim),
                &[],
                self.two_channel(),
            ));
        }

        let kept = frozen.filter.apply(&instances);
        let nuclei = kept.paint(dim);
        debug!(
            "Slice {}: {} of {} nuclei above area threshold",
            slice,
            kept.len(),
            instances.len()
        );

        let crowded = kept.crowded_pairs(2.0 * params.marker_radius as f64);
        if !crowded.is_empty() {
            warn!(
                "Slice {}: {} pairs of nuclei have overlapping markers and may share a cell",
                slice,
                crowded.len()
            );
        }

        let foreground = match (self.channel2, frozen.foreground) {
            (Some(channel2), Some(threshold)) => {
                let channel = &channel2[index];
                if channel.dim() != dim {
                    return Err(CellDensityError::InvalidInput(format!(
                        "slice {}: second channel is {:?}, labels are {:?}",
                        slice,
                        channel.dim(),
                        dim
                    )));
                }
                Some(threshold.mask(channel))
            }
            _ => None,
        };

        let reach = params.reach.resolve(&kept);
        debug!("Slice {}: growth reach {:?}", slice, reach);

        let mut cells: Vec<CellRegion> = params
            .assigner(reach)
            .assign(&kept, dim, foreground.as_ref())
            .into_iter()
            .filter(|cell| !cell.is_empty())
            .collect();
        let flagged = params.border_policy().apply(&mut cells, dim);
        debug!("Slice {}: {} cells, {} at the border", slice, cells.len(), flagged);

        let interior_areas: Vec<f64> = cells
            .iter()
            .filter(|cell| !cell.touches_border)
            .map(|cell| cell.area())
            .collect();
        if interior_areas.is_empty() {
            warn!("{}", CellDensityError::DegenerateSlice { slice });
            return Ok(SliceResult::empty(
                slice,
                dim,
                SliceStatus::Degenerate,
                nuclei,
                &cells,
                self.two_channel(),
            ));
        }

        // every accepted cell seeds the tessellation, border cells included
        let centroids: Vec<(f64, f64)> = cells
            .iter()
            .filter_map(|cell| kept.get(cell.source_instance_id))
            .map(|instance| instance.centroid)
            .collect();
        let tessellation = params.tessellator(reach).tessellate_points(&centroids, dim);
        debug!("Slice {}: {} Voronoi regions", slice, tessellation.label_count());

        let excluded: HashSet<u32> = cells
            .iter()
            .filter(|cell| cell.touches_border)
            .filter_map(|cell| kept.get(cell.source_instance_id))
            .filter_map(|instance| pixel_of(dim, instance.centroid))
            .map(|p| tessellation.label_map[p])
            .filter(|&label| label != 0)
            .collect();
        let neighbors = neighbor_map(&tessellation, &excluded);
        let mean_neighbors = mean_neighbor_count(&tessellation, &excluded);

        let mapper = params.density_mapper();
        let calibration = &self.config.calibration;
        let valid = combined_mask(&cells, dim, false);
        let (density, bin_size) = match mapper.bin_size(&interior_areas) {
            Some(bin_size) => (
                mapper.density_map(&centroids, &valid, bin_size, calibration),
                Some(bin_size),
            ),
            None => (empty_density_map(dim), None),
        };

        let cell_area: f64 = interior_areas.iter().sum();
        let (status, mean) = match mean_density(interior_areas.len(), cell_area, calibration, slice) {
            Ok(mean) => (SliceStatus::Ok, Some(mean)),
            Err(err) if err.is_slice_local() => {
                warn!("{}", err);
                (SliceStatus::Degenerate, None)
            }
            Err(err) => return Err(err),
        };

        let cell_map = if self.two_channel() {
            Some(paint_cells(&cells, dim))
        } else {
            None
        };
        debug!("Slice {}: processed in {:?}", slice, t0.elapsed());

        return Ok(SliceResult {
            summary: SliceSummary {
                slice,
                status,
                nuclei: kept.len(),
                cells: interior_areas.len(),
                cell_area,
                mean_density: mean,
                mean_neighbors,
                bin_size,
            },
            nuclei,
            density,
            neighbors,
            cell_map,
        });
    }
}

fn paint_cells(cells: &[CellRegion], dim: (usize, usize)) -> LabelImage {
    let mut map = LabelImage::zeros(dim);
    for cell in cells {
        for &p in &cell.pixels {
            map[p] = cell.source_instance_id;
        }
    }
    return map;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cellmap::areafilter::ThresholdMode;
    use crate::cellmap::density::Calibration;
    use crate::cellmap::foreground::{auto_range, preprocess, ForegroundMode};
    use crate::cellmap::picker::{AreaPreview, ForegroundPreview};
    use crate::cellmap::Reach;

    fn square(labels: &mut LabelImage, id: u32, top: usize, left: usize, size: usize) {
        for i in top..top + size {
            for j in left..left + size {
                labels[[i, j]] = id;
            }
        }
    }

    fn config(area_threshold: f64) -> RunConfig {
        RunConfig {
            area_mode: ThresholdMode::Fixed(area_threshold),
            ..RunConfig::default()
        }
    }

    // flat background with a textured square over rows and columns 20..40
    fn textured(dim: (usize, usize), base: f32, amplitude: f32) -> Array2<f32> {
        Array2::from_shape_fn(dim, |(i, j)| {
            if (20..40).contains(&i) && (20..40).contains(&j) {
                base + amplitude * ((i * i + 3 * j) % 5) as f32
            } else {
                10.0
            }
        })
    }

    #[test]
    fn test_single_cell_slice() {
        let mut labels = LabelImage::zeros((200, 200));
        square(&mut labels, 1, 95, 95, 10);
        let segmenter = PrecomputedLabels::new(vec![labels]);

        let mut config = config(1.0);
        config.calibration = Calibration::new(2.0, "pixel");
        let driver = SliceDriver::new(&segmenter, None, config).unwrap();
        let first = driver.freeze(None).unwrap();
        let result = driver.process_labels(0, first.labels, &first.frozen).unwrap();
        let summary = &result.summary;

        assert_eq!(summary.status, SliceStatus::Ok);
        assert_eq!(summary.cells, 1);
        assert_eq!(summary.mean_neighbors, Some(0.0));
        assert!(result.neighbors.iter().all(|&n| n == 0));

        let area = summary.cell_area;
        assert!(area > 100.0);
        let mean = summary.mean_density.unwrap();
        assert!((mean - 1.0 / area / 4.0).abs() < 1e-12);

        let defined = result.density.iter().filter(|d| !d.is_nan()).count();
        assert_eq!(defined as f64, area);
        assert!(result.density.iter().all(|&d| d.is_nan() || d >= 0.0));
        assert!(result.density[[99, 99]] > 0.0);
        assert!(result.density[[0, 0]].is_nan());
    }

    #[test]
    fn test_neighbours_at_wide_spacing() {
        // 3x3 grid of nuclei 80 px apart, centroids at 70, 150, 230
        let dim = (300, 300);
        let mut labels = LabelImage::zeros(dim);
        let mut id = 0;
        for top in [65, 145, 225] {
            for left in [65, 145, 225] {
                id += 1;
                square(&mut labels, id, top, left, 10);
            }
        }
        let segmenter = PrecomputedLabels::new(vec![labels]);

        let driver = SliceDriver::new(&segmenter, None, config(1.0)).unwrap();
        let (stack, summary) = driver.run(None, &AtomicBool::new(false)).unwrap();

        // the outer ring reaches the image border, the centre cell does not
        assert_eq!(summary.slices[0].cells, 1);
        assert_eq!(summary.slices[0].mean_neighbors, Some(8.0));
        assert_eq!(stack.neighbors[0][[150, 150]], 8);
        assert_eq!(stack.neighbors[0][[70, 70]], 0);

        // a reach well below the spacing isolates every cell
        let mut config = config(1.0);
        config.params.reach = Reach::Fixed(32.0);
        let driver = SliceDriver::new(&segmenter, None, config).unwrap();
        let (stack, summary) = driver.run(None, &AtomicBool::new(false)).unwrap();
        assert_eq!(summary.slices[0].cells, 9);
        assert_eq!(summary.slices[0].mean_neighbors, Some(0.0));
        assert!(stack.neighbors[0].iter().all(|&n| n == 0));
    }

    #[test]
    fn test_degenerate_slice_does_not_stop_run() {
        let dim = (160, 160);
        let mut big = LabelImage::zeros(dim);
        square(&mut big, 1, 50, 50, 6);
        square(&mut big, 2, 90, 90, 6);

        // every nucleus at or below the threshold
        let mut small = LabelImage::zeros(dim);
        square(&mut small, 1, 50, 50, 2);
        square(&mut small, 2, 90, 90, 3);

        let segmenter = PrecomputedLabels::new(vec![big.clone(), small, LabelImage::zeros(dim), big]);
        let mut config = config(9.0);
        config.params.reach = Reach::Fixed(32.0);
        let driver = SliceDriver::new(&segmenter, None, config).unwrap();
        let (stack, summary) = driver.run(None, &AtomicBool::new(false)).unwrap();

        assert_eq!(summary.slices.len(), 4);
        assert!(!summary.cancelled);
        assert_eq!(summary.degenerate_slices(), vec![2, 3]);
        assert_eq!(summary.slices[1].status, SliceStatus::Degenerate);
        assert_eq!(summary.slices[2].status, SliceStatus::SegmentationEmpty);
        assert_eq!(summary.slices[1].mean_density, None);
        assert_eq!(summary.slices[3].status, SliceStatus::Ok);
        assert_eq!(summary.slices[0], SliceSummary { slice: 1, ..summary.slices[3].clone() });

        assert_eq!(stack.density.len(), 4);
        assert!(stack.density[1].iter().all(|d| d.is_nan()));
        assert!(stack.neighbors[1].iter().all(|&n| n == 0));
        assert!(stack.nuclei[1].iter().all(|&l| l == 0));
        assert!(stack.density[3].iter().any(|d| !d.is_nan()));
        assert!(stack.cell_maps.is_empty());
    }

    struct CountingPicker {
        area_calls: usize,
        foreground_calls: usize,
    }

    impl CountingPicker {
        fn new() -> CountingPicker {
            CountingPicker {
                area_calls: 0,
                foreground_calls: 0,
            }
        }
    }

    impl ThresholdPicker for CountingPicker {
        fn pick_area(&mut self, _preview: &AreaPreview) -> Result<f64> {
            self.area_calls += 1;
            Ok(20.0)
        }

        fn pick_foreground(&mut self, preview: &ForegroundPreview) -> Result<(f32, f32)> {
            self.foreground_calls += 1;
            Ok(preview.auto_range())
        }
    }

    #[test]
    fn test_threshold_frozen_on_first_slice() {
        let dim = (60, 60);
        let mut first = LabelImage::zeros(dim);
        square(&mut first, 1, 10, 10, 4);
        square(&mut first, 2, 30, 30, 6);

        // the second slice alone would offer a different range
        let mut second = LabelImage::zeros(dim);
        square(&mut second, 1, 10, 10, 2);
        square(&mut second, 2, 30, 30, 5);
        square(&mut second, 3, 30, 10, 8);

        let segmenter = PrecomputedLabels::new(vec![first, second]);
        let config = RunConfig {
            area_mode: ThresholdMode::InteractiveFirstSlice,
            ..RunConfig::default()
        };
        let driver = SliceDriver::new(&segmenter, None, config).unwrap();
        let mut picker = CountingPicker::new();
        let (stack, summary) = driver.run(Some(&mut picker), &AtomicBool::new(false)).unwrap();

        assert_eq!(picker.area_calls, 1);
        assert_eq!(picker.foreground_calls, 0);
        assert_eq!(summary.area_threshold, 20.0);
        assert_eq!(summary.slices[0].nuclei, 1);
        assert_eq!(summary.slices[1].nuclei, 2);
        assert!(stack.nuclei[1].iter().all(|&l| l != 1));
    }

    #[test]
    fn test_two_channel_run() {
        let dim = (100, 100);
        let mut labels = LabelImage::zeros(dim);
        square(&mut labels, 1, 28, 28, 4);
        square(&mut labels, 2, 84, 84, 4);

        let channel2 = vec![textured(dim, 100.0, 40.0)];
        let segmenter = PrecomputedLabels::new(vec![labels]);
        let config = RunConfig {
            foreground_mode: Some(ForegroundMode::Auto),
            ..RunConfig::default()
        };
        let driver = SliceDriver::new(&segmenter, Some(channel2.as_slice()), config).unwrap();
        let (stack, summary) = driver.run(None, &AtomicBool::new(false)).unwrap();

        assert!(summary.foreground.is_some());
        assert_eq!(stack.cell_maps.len(), 1);
        let cell_map = &stack.cell_maps[0];
        assert_eq!(cell_map[[30, 30]], 1);
        assert!(cell_map.iter().all(|&l| l != 2));
        assert!(cell_map[[2, 2]] == 0 && cell_map[[57, 57]] == 0);
        assert_eq!(summary.slices[0].cells, 1);
    }

    #[test]
    fn test_foreground_range_frozen_on_first_slice() {
        let dim = (100, 100);
        let mut labels = LabelImage::zeros(dim);
        square(&mut labels, 1, 28, 28, 4);
        square(&mut labels, 2, 84, 84, 4);

        // same layout, but the second slice is far fainter
        let faint = textured(dim, 10.0, 0.5);
        let channel2 = vec![textured(dim, 100.0, 40.0), faint.clone()];
        let segmenter = PrecomputedLabels::new(vec![labels.clone(), labels]);
        let config = RunConfig {
            foreground_mode: Some(ForegroundMode::InteractiveFirstSlice),
            ..RunConfig::default()
        };
        let driver = SliceDriver::new(&segmenter, Some(channel2.as_slice()), config).unwrap();
        let mut picker = CountingPicker::new();
        let (stack, summary) = driver.run(Some(&mut picker), &AtomicBool::new(false)).unwrap();

        assert_eq!(picker.foreground_calls, 1);
        assert_eq!(picker.area_calls, 0);
        let frozen = summary.foreground.unwrap();
        assert_eq!((frozen.min, frozen.max), auto_range(&preprocess(&channel2[0])));

        // thresholded on its own, the faint slice would keep its textured cell
        let (own_min, own_max) = auto_range(&preprocess(&faint));
        assert!(own_min < frozen.min);
        let own = ForegroundThreshold {
            min: own_min,
            max: own_max,
        };
        assert!(own.mask(&faint)[[30, 30]]);

        assert_eq!(stack.cell_maps.len(), 2);
        assert_eq!(stack.cell_maps[0][[30, 30]], 1);
        assert_eq!(summary.slices[0].status, SliceStatus::Ok);
        assert!(stack.cell_maps[1].iter().all(|&l| l == 0));
        assert_eq!(summary.slices[1].status, SliceStatus::Degenerate);
    }

    #[test]
    fn test_cancelled_before_start() {
        let mut labels = LabelImage::zeros((20, 20));
        square(&mut labels, 1, 8, 8, 4);
        let segmenter = PrecomputedLabels::new(vec![labels.clone(), labels]);
        let driver = SliceDriver::new(&segmenter, None, config(1.0)).unwrap();

        let (stack, summary) = driver.run(None, &AtomicBool::new(true)).unwrap();
        assert!(summary.cancelled);
        assert!(summary.slices.is_empty());
        assert!(stack.density.is_empty());
    }

    #[test]
    fn test_completed_prefix() {
        let (done, cancelled) = completed_prefix(vec![Some(2), Some(3), None, Some(5), None, Some(7)]);
        assert_eq!(done, vec![2, 3]);
        assert!(cancelled);

        let (done, cancelled) = completed_prefix(vec![Some(2), Some(3)]);
        assert_eq!(done, vec![2, 3]);
        assert!(!cancelled);

        let (done, cancelled) = completed_prefix::<usize>(vec![None, Some(3)]);
        assert!(done.is_empty());
        assert!(cancelled);
    }

    // Sets the cancel flag while segmenting one slice.
    struct StopDuring<'a> {
        pages: Vec<LabelImage>,
        stop_at: usize,
        cancel: &'a AtomicBool,
    }

    impl Segmenter for StopDuring<'_> {
        fn slice_count(&self) -> usize {
            self.pages.len()
        }

        fn segment(&self, index: usize) -> Result<LabelImage> {
            if index == self.stop_at {
                self.cancel.store(true, Ordering::Relaxed);
            }
            Ok(self.pages[index].clone())
        }
    }

    #[test]
    fn test_cancel_mid_run_keeps_slices_contiguous() {
        let mut labels = LabelImage::zeros((40, 40));
        square(&mut labels, 1, 18, 18, 4);

        let cancel = AtomicBool::new(false);
        let segmenter = StopDuring {
            pages: vec![labels; 8],
            stop_at: 3,
            cancel: &cancel,
        };
        let driver = SliceDriver::new(&segmenter, None, config(1.0)).unwrap();

        // one worker visits the slices in order
        let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
        let (stack, summary) = pool.install(|| driver.run(None, &cancel)).unwrap();

        assert!(summary.cancelled);
        let slices: Vec<usize> = summary.slices.iter().map(|s| s.slice).collect();
        assert_eq!(slices, vec![1, 2, 3, 4]);
        assert_eq!(stack.nuclei.len(), 4);
        assert_eq!(stack.density.len(), 4);
        assert_eq!(stack.neighbors.len(), 4);
    }

    #[test]
    fn test_mismatched_channel2() {
        let segmenter = PrecomputedLabels::new(vec![LabelImage::zeros((4, 4))]);
        let channel2: Vec<Array2<f32>> = Vec::new();
        let config = RunConfig {
            foreground_mode: Some(ForegroundMode::Auto),
            ..RunConfig::default()
        };
        assert!(SliceDriver::new(&segmenter, Some(channel2.as_slice()), config).is_err());
        assert!(SliceDriver::new(&PrecomputedLabels::new(Vec::new()), None, RunConfig::default()).is_err());
    }
}
