use flate2::write::GzEncoder;
use flate2::Compression;
use log::{info, warn};
use ndarray::Array2;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tiff::encoder::colortype::{self, ColorType};
use tiff::encoder::{Rational, TiffEncoder, TiffValue};
use tiff::tags::{ResolutionUnit, Tag};

use super::cellmap::density::Calibration;
use super::cellmap::driver::{RunSummary, StackOutput};
use super::errors::{CellDensityError, Result};
use super::schemas::{
    OutputFormat, CELLS_FILENAME, DENSITY_FILENAME, LABELS_FILENAME, NEIGHBORS_FILENAME,
    SUMMARY_COLUMNS,
};

pub fn determine_format(filename: &str, fmt: OutputFormat) -> Result<OutputFormat> {
    if fmt != OutputFormat::Infer {
        return Ok(fmt);
    }

    if filename.ends_with(".csv.gz") {
        return Ok(OutputFormat::CsvGz);
    } else if filename.ends_with(".csv") {
        return Ok(OutputFormat::Csv);
    } else {
        return Err(CellDensityError::InvalidInput(format!(
            "Unknown file format for: {}",
            filename
        )));
    }
}

pub fn write_summary(filename: &str, fmt: OutputFormat, summary: &RunSummary) -> Result<()> {
    let fmt = determine_format(filename, fmt)?;
    let file = File::create(filename)?;

    match fmt {
        OutputFormat::CsvGz => {
            let encoder = GzEncoder::new(file, Compression::default());
            write_summary_csv(encoder, summary)?.finish()?;
        }
        _ => {
            write_summary_csv(file, summary)?;
        }
    }
    info!("Wrote summary to {}", filename);

    return Ok(());
}

fn optional<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn write_summary_csv<W: Write>(output: W, summary: &RunSummary) -> Result<W> {
    let mut writer = csv::Writer::from_writer(output);
    writer.write_record(SUMMARY_COLUMNS)?;
    for slice in &summary.slices {
        writer.write_record(&[
            slice.slice.to_string(),
            slice.status.as_str().to_string(),
            slice.nuclei.to_string(),
            slice.cells.to_string(),
            slice.cell_area.to_string(),
            optional(slice.mean_density),
            summary.density_unit.clone(),
            optional(slice.bin_size),
            optional(slice.mean_neighbors),
        ])?;
    }
    writer.flush()?;

    return writer
        .into_inner()
        .map_err(|err| CellDensityError::Io(err.into_error()));
}

// ImageJ header so that the stack opens with its calibration.
fn imagej_description(pages: usize, calibration: &Calibration) -> String {
    let unit = calibration
        .unit
        .replace('\u{b5}', "\\u00B5")
        .replace('\u{3bc}', "\\u00B5");
    return format!(
        "ImageJ=1.54f\nimages={}\nslices={}\nunit={}\nloop=false\n",
        pages, pages, unit
    );
}

// Uncalibrated stacks carry no resolution.
fn resolution(calibration: &Calibration) -> Option<Rational> {
    if !(calibration.pixel_size > 0.0) || calibration.unit == "pixel" {
        return None;
    }
    let d: u32 = 1_000_000;
    let n = (d as f64 / calibration.pixel_size).round();
    if !(n >= 1.0 && n <= u32::MAX as f64) {
        return None;
    }
    return Some(Rational { n: n as u32, d });
}

pub fn write_stack<C>(path: &Path, pages: &[Array2<C::Inner>], calibration: &Calibration) -> Result<()>
where
    C: ColorType,
    C::Inner: Copy,
    [C::Inner]: TiffValue,
{
    if pages.is_empty() {
        warn!("Nothing to write to {}", path.display());
        return Ok(());
    }

    let file = BufWriter::new(File::create(path)?);
    let mut encoder = TiffEncoder::new(file)?;
    let description = imagej_description(pages.len(), calibration);

    for (k, page) in pages.iter().enumerate() {
        let (height, width) = page.dim();
        let data: Vec<C::Inner> = page.iter().copied().collect();

        let mut image = encoder.new_image::<C>(width as u32, height as u32)?;
        if k == 0 {
            image
                .encoder()
                .write_tag(Tag::ImageDescription, description.as_str())?;
        }
        if let Some(value) = resolution(calibration) {
            image.resolution(ResolutionUnit::None, value);
        }
        image.write_data(&data)?;
    }

    return Ok(());
}

// Writes every raster stack of a run into `dir` and returns the paths written.
pub fn write_stacks(dir: &Path, stack: &StackOutput, calibration: &Calibration) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();

    let path = dir.join(LABELS_FILENAME);
    write_stack::<colortype::Gray32>(&path, &stack.nuclei, calibration)?;
    written.push(path);

    let path = dir.join(DENSITY_FILENAME);
    write_stack::<colortype::Gray32Float>(&path, &stack.density, calibration)?;
    written.push(path);

    let path = dir.join(NEIGHBORS_FILENAME);
    write_stack::<colortype::Gray16>(&path, &stack.neighbors, calibration)?;
    written.push(path);

    if !stack.cell_maps.is_empty() {
        let path = dir.join(CELLS_FILENAME);
        write_stack::<colortype::Gray32>(&path, &stack.cell_maps, calibration)?;
        written.push(path);
    }

    return Ok(written);
}
