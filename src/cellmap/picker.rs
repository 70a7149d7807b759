// Operator threshold selection. A picker is consulted at most once per run,
// on the first slice, and its answers are frozen for the remaining slices.

use crate::errors::{CellDensityError, Result};

use log::warn;
use ndarray::Array2;
use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub trait ThresholdPicker {
    // Nucleus area cutoff. Nuclei with area <= cutoff are dropped.
    fn pick_area(&mut self, preview: &AreaPreview) -> Result<f64>;

    // Inclusive [min, max] intensity range of the channel-2 foreground.
    fn pick_foreground(&mut self, preview: &ForegroundPreview) -> Result<(f32, f32)>;
}

pub struct AreaPreview {
    areas: Vec<f64>,
    pub lower: f64,
    pub upper: f64,
}

impl AreaPreview {
    pub fn new(areas: Vec<f64>, lower: f64, upper: f64) -> AreaPreview {
        AreaPreview { areas, lower, upper }
    }

    pub fn count(&self) -> usize {
        self.areas.len()
    }

    pub fn surviving(&self, cutoff: f64) -> usize {
        self.areas.iter().filter(|&&a| a > cutoff).count()
    }
}

pub struct ForegroundPreview<'a> {
    image: &'a Array2<f32>,
    auto: (f32, f32),
}

impl<'a> ForegroundPreview<'a> {
    pub fn new(image: &'a Array2<f32>, auto: (f32, f32)) -> ForegroundPreview<'a> {
        ForegroundPreview { image, auto }
    }

    pub fn auto_range(&self) -> (f32, f32) {
        self.auto
    }

    // Fraction of pixels that fall in [lo, hi].
    pub fn coverage(&self, lo: f32, hi: f32) -> f64 {
        if self.image.is_empty() {
            return 0.0;
        }
        let n = self.image.iter().filter(|&&v| v >= lo && v <= hi).count();
        return n as f64 / self.image.len() as f64;
    }
}

// Line oriented prompt: an empty line confirms the current value, a number
// (or a pair of numbers for ranges) replaces it and shows the effect, and
// `q` or end of input cancels.
pub struct PromptPicker<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> PromptPicker<R, W> {
    pub fn new(input: R, output: W) -> Self {
        PromptPicker { input, output }
    }

    fn read_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        let line = line.trim().to_string();
        if line == "q" {
            return Ok(None);
        }
        return Ok(Some(line));
    }
}

impl<R: BufRead, W: Write> ThresholdPicker for PromptPicker<R, W> {
    fn pick_area(&mut self, preview: &AreaPreview) -> Result<f64> {
        let mut cutoff = preview.lower;
        writeln!(
            self.output,
            "Nucleus areas on the first slice range from {} to {} px² ({} nuclei).",
            preview.lower + 1.0,
            preview.upper,
            preview.count()
        )?;

        loop {
            write!(
                self.output,
                "Area cutoff [{}] keeps {} nuclei. New cutoff, enter to confirm, q to cancel: ",
                cutoff,
                preview.surviving(cutoff)
            )?;
            self.output.flush()?;

            let Some(line) = self.read_line()? else {
                return Err(CellDensityError::ThresholdCancelled);
            };
            if line.is_empty() {
                return Ok(cutoff);
            }
            match line.parse::<f64>() {
                Ok(v) if v.is_finite() => cutoff = v.clamp(preview.lower, preview.upper),
                _ => writeln!(self.output, "Not a number: {}", line)?,
            }
        }
    }

    fn pick_foreground(&mut self, preview: &ForegroundPreview) -> Result<(f32, f32)> {
        let (mut lo, mut hi) = preview.auto_range();

        loop {
            write!(
                self.output,
                "Foreground range [{} {}] covers {:.1}% of the slice. New 'min max', enter to confirm, q to cancel: ",
                lo,
                hi,
                100.0 * preview.coverage(lo, hi)
            )?;
            self.output.flush()?;

            let Some(line) = self.read_line()? else {
                return Err(CellDensityError::ThresholdCancelled);
            };
            if line.is_empty() {
                return Ok((lo, hi));
            }
            let values: Vec<f32> = line
                .split_whitespace()
                .filter_map(|v| v.parse::<f32>().ok())
                .collect();
            match values[..] {
                [a, b] if a <= b => {
                    lo = a;
                    hi = b;
                }
                [a] => lo = a,
                _ => writeln!(self.output, "Expected 'min max': {}", line)?,
            }
        }
    }
}

// Sets `cancel` once a line reading `q` arrives, so the remaining slices are
// skipped. Returns when the flag is set or the input ends.
pub fn watch_for_stop<R>(input: R, cancel: Arc<AtomicBool>) -> JoinHandle<()>
where
    R: BufRead + Send + 'static,
{
    thread::spawn(move || {
        for line in input.lines() {
            match line {
                Ok(line) if line.trim() == "q" => {
                    warn!("Stop requested, skipping the remaining slices");
                    cancel.store(true, Ordering::Relaxed);
                    return;
                }
                Ok(_) => {}
                Err(_) => return,
            }
        }
    })
}
