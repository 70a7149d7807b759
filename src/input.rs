// Multi-page grayscale TIFF reading. Every page becomes one [[row, col]]
// array; the first page also supplies the spatial calibration.

use crate::cellmap::density::Calibration;
use crate::cellmap::raster::LabelImage;
use crate::errors::{CellDensityError, Result};

use log::{debug, warn};
use ndarray::Array2;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::tags::Tag;

pub struct Stack<T> {
    pub pages: Vec<Array2<T>>,
    pub calibration: Option<Calibration>,
}

fn open(path: &Path) -> Result<Decoder<BufReader<File>>> {
    let file = File::open(path)?;
    return Ok(Decoder::new(BufReader::new(file))?);
}

fn read_pages<T, F>(path: &Path, convert: F) -> Result<Stack<T>>
where
    F: Fn(DecodingResult) -> Result<Vec<T>>,
{
    let mut decoder = open(path)?;
    let calibration = read_calibration(&mut decoder);
    let mut pages = Vec::new();

    loop {
        match decoder.colortype()? {
            tiff::ColorType::Gray(_) => {}
            other => {
                return Err(CellDensityError::InvalidInput(format!(
                    "{}: page {} is {:?}, expected grayscale",
                    path.display(),
                    pages.len() + 1,
                    other
                )))
            }
        }

        let (width, height) = decoder.dimensions()?;
        let data = convert(decoder.read_image()?)?;
        let page = Array2::from_shape_vec((height as usize, width as usize), data).map_err(|err| {
            CellDensityError::InvalidInput(format!("{}: page {}: {}", path.display(), pages.len() + 1, err))
        })?;
        pages.push(page);

        if !decoder.more_images() {
            break;
        }
        decoder.next_image()?;
    }
    debug!("Read {} pages from {}", pages.len(), path.display());

    return Ok(Stack { pages, calibration });
}

fn as_labels(image: DecodingResult) -> Result<Vec<u32>> {
    fn checked<I: Iterator<Item = i64>>(values: I) -> Result<Vec<u32>> {
        values
            .map(|v| {
                u32::try_from(v).map_err(|_| {
                    CellDensityError::InvalidInput(format!("{} is not a valid instance label", v))
                })
            })
            .collect()
    }

    fn checked_float<I: Iterator<Item = f64>>(values: I) -> Result<Vec<u32>> {
        values
            .map(|v| {
                if v >= 0.0 && v <= u32::MAX as f64 && v.fract() == 0.0 {
                    Ok(v as u32)
                } else {
                    Err(CellDensityError::InvalidInput(format!(
                        "{} is not a valid instance label",
                        v
                    )))
                }
            })
            .collect()
    }

    match image {
        DecodingResult::U8(buf) => Ok(buf.into_iter().map(u32::from).collect()),
        DecodingResult::U16(buf) => Ok(buf.into_iter().map(u32::from).collect()),
        DecodingResult::U32(buf) => Ok(buf),
        DecodingResult::U64(buf) => checked(buf.into_iter().map(|v| v.min(i64::MAX as u64) as i64)),
        DecodingResult::I8(buf) => checked(buf.into_iter().map(i64::from)),
        DecodingResult::I16(buf) => checked(buf.into_iter().map(i64::from)),
        DecodingResult::I32(buf) => checked(buf.into_iter().map(i64::from)),
        DecodingResult::I64(buf) => checked(buf.into_iter()),
        DecodingResult::F32(buf) => checked_float(buf.into_iter().map(f64::from)),
        DecodingResult::F64(buf) => checked_float(buf.into_iter()),
    }
}

fn as_intensities(image: DecodingResult) -> Result<Vec<f32>> {
    let values = match image {
        DecodingResult::U8(buf) => buf.into_iter().map(f32::from).collect(),
        DecodingResult::U16(buf) => buf.into_iter().map(f32::from).collect(),
        DecodingResult::U32(buf) => buf.into_iter().map(|v| v as f32).collect(),
        DecodingResult::U64(buf) => buf.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I8(buf) => buf.into_iter().map(f32::from).collect(),
        DecodingResult::I16(buf) => buf.into_iter().map(f32::from).collect(),
        DecodingResult::I32(buf) => buf.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I64(buf) => buf.into_iter().map(|v| v as f32).collect(),
        DecodingResult::F32(buf) => buf,
        DecodingResult::F64(buf) => buf.into_iter().map(|v| v as f32).collect(),
    };
    return Ok(values);
}

pub fn read_label_stack(path: &Path) -> Result<Stack<u32>> {
    read_pages(path, as_labels)
}

pub fn read_intensity_stack(path: &Path) -> Result<Stack<f32>> {
    read_pages(path, as_intensities)
}

// ImageJ keeps the unit in the image description ("unit=micron") and the
// scale in XResolution as pixels per unit.
fn read_calibration<R: std::io::Read + std::io::Seek>(decoder: &mut Decoder<R>) -> Option<Calibration> {
    let description = decoder.get_tag_ascii_string(Tag::ImageDescription).ok()?;
    let unit = parse_unit(&description)?;

    let pixels_per_unit = match decoder.find_tag(Tag::XResolution) {
        Ok(Some(tiff::decoder::ifd::Value::Rational(n, d))) if n > 0 && d > 0 => n as f64 / d as f64,
        Ok(_) => {
            warn!("Image has unit '{}' but no usable XResolution", unit);
            return None;
        }
        Err(err) => {
            warn!("Could not read XResolution: {}", err);
            return None;
        }
    };

    return Some(Calibration::new(1.0 / pixels_per_unit, &unit));
}

pub fn parse_unit(description: &str) -> Option<String> {
    description
        .lines()
        .filter_map(|line| line.trim().strip_prefix("unit="))
        .map(|unit| unit.replace("\\u00B5", "\u{b5}"))
        .find(|unit| !unit.is_empty())
}

// Pages of both stacks must agree in number and shape.
pub fn check_shapes(labels: &[LabelImage], channel2: &[Array2<f32>]) -> Result<()> {
    if labels.len() != channel2.len() {
        return Err(CellDensityError::InvalidInput(format!(
            "label stack has {} slices, second channel has {}",
            labels.len(),
            channel2.len()
        )));
    }
    for (k, (a, b)) in labels.iter().zip(channel2).enumerate() {
        if a.dim() != b.dim() {
            return Err(CellDensityError::InvalidInput(format!(
                "slice {}: labels are {:?}, second channel is {:?}",
                k + 1,
                a.dim(),
                b.dim()
            )));
        }
    }
    return Ok(());
}
