use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use rayon::current_num_threads;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

mod cellmap;
mod errors;
mod input;
mod output;
mod schemas;

use cellmap::areafilter::{ThresholdMode, DEFAULT_AREA_THRESHOLD};
use cellmap::assign::DEFAULT_MARKER_RADIUS;
use cellmap::border::DEFAULT_BORDER_WIDTH;
use cellmap::density::{BinSize, Calibration, DEFAULT_BIN_WEIGHT};
use cellmap::driver::{PrecomputedLabels, SliceDriver};
use cellmap::foreground::ForegroundMode;
use cellmap::picker::{watch_for_stop, PromptPicker, ThresholdPicker};
use cellmap::{CellMapParams, Reach, RunConfig, DEFAULT_REACH_FACTOR};
use errors::Result;
use input::{check_shapes, read_intensity_stack, read_label_stack};
use output::{determine_format, write_stacks, write_summary};
use schemas::{OutputFormat, SUMMARY_FILENAME};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    // Multi-page TIFF of nucleus instance labels, one page per slice
    nuclei_labels: String,

    // Second channel used to separate cells from background
    #[arg(long, default_value=None)]
    channel2: Option<String>,

    #[arg(long, default_value=None)]
    output_dir: Option<String>,

    #[arg(long, default_value=None)]
    pixel_size: Option<f64>,

    #[arg(long, default_value=None)]
    unit: Option<String>,

    #[arg(long, default_value_t=DEFAULT_AREA_THRESHOLD)]
    min_nucleus_area: f64,

    // Choose thresholds on the first slice at a prompt
    #[arg(long, default_value_t=false)]
    interactive: bool,

    #[arg(long, default_value=None)]
    foreground_threshold: Option<f32>,

    #[arg(long, default_value=None)]
    bin_size: Option<usize>,

    #[arg(long, default_value_t=DEFAULT_BIN_WEIGHT)]
    bin_weight: f64,

    #[arg(long, default_value_t=DEFAULT_BORDER_WIDTH)]
    border_width: usize,

    #[arg(long, default_value_t=DEFAULT_MARKER_RADIUS)]
    marker_radius: usize,

    // Fixed growth limit in pixels for cells and Voronoi regions, 0 for none.
    // Without it the limit follows the nucleus spacing of each slice.
    #[arg(long, default_value=None)]
    max_reach: Option<f64>,

    #[arg(long, default_value_t=DEFAULT_REACH_FACTOR)]
    reach_factor: f64,

    #[arg(long, value_enum, default_value_t=OutputFormat::Infer)]
    summary_fmt: OutputFormat,

    #[arg(long, default_value=None)]
    summary: Option<String>,

    #[arg(short = 't', long, default_value=None)]
    nthreads: Option<usize>,
}

fn output_directory(args: &Args) -> PathBuf {
    if let Some(output_dir) = &args.output_dir {
        return PathBuf::from(output_dir);
    }

    let input = Path::new(&args.nuclei_labels);
    let name = input
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_lowercase())
        .unwrap_or_else(|| String::from("celldensity"));
    let parent = input.parent().unwrap_or_else(|| Path::new("."));
    return parent.join(name);
}

// Where the summary goes and in which format, checked before any work is done.
fn summary_target(args: &Args, dir: &Path) -> Result<(String, OutputFormat)> {
    let path = match &args.summary {
        Some(summary) => summary.clone(),
        None => dir.join(SUMMARY_FILENAME).to_string_lossy().into_owned(),
    };
    let fmt = determine_format(&path, args.summary_fmt)?;
    return Ok((path, fmt));
}

fn run_config(args: &Args, calibration: Calibration) -> RunConfig {
    let params = CellMapParams {
        border_width: args.border_width,
        marker_radius: args.marker_radius,
        reach: match args.max_reach {
            Some(reach) if reach > 0.0 => Reach::Fixed(reach),
            Some(_) => Reach::Unbounded,
            None => Reach::Auto {
                factor: args.reach_factor,
            },
        },
        bin: match args.bin_size {
            Some(bin_size) => BinSize::Fixed(bin_size),
            None => BinSize::Auto {
                weight: args.bin_weight,
            },
        },
    };

    let area_mode = if args.interactive {
        ThresholdMode::InteractiveFirstSlice
    } else {
        ThresholdMode::Fixed(args.min_nucleus_area)
    };

    let foreground_mode = args.channel2.as_ref().map(|_| match args.foreground_threshold {
        Some(threshold) => ForegroundMode::Fixed(threshold),
        None if args.interactive => ForegroundMode::InteractiveFirstSlice,
        None => ForegroundMode::Auto,
    });

    return RunConfig {
        params,
        area_mode,
        foreground_mode,
        calibration,
    };
}

fn run(args: Args) -> Result<()> {
    if let Some(nthreads) = args.nthreads {
        if let Err(err) = rayon::ThreadPoolBuilder::new()
            .num_threads(nthreads)
            .build_global()
        {
            warn!("Could not configure thread pool: {}", err);
        }
    }
    println!("Using {} threads", current_num_threads());

    let dir = output_directory(&args);
    let (summary_path, summary_fmt) = summary_target(&args, &dir)?;

    let labels = read_label_stack(Path::new(&args.nuclei_labels))?;
    println!("Read {} slices from {}", labels.pages.len(), args.nuclei_labels);

    let channel2 = match &args.channel2 {
        Some(path) => {
            let stack = read_intensity_stack(Path::new(path))?;
            check_shapes(&labels.pages, &stack.pages)?;
            println!("Read {} slices from {}", stack.pages.len(), path);
            Some(stack.pages)
        }
        None => None,
    };

    let mut calibration = labels.calibration.clone().unwrap_or_default();
    if let Some(pixel_size) = args.pixel_size {
        calibration.pixel_size = pixel_size;
    }
    if let Some(unit) = &args.unit {
        calibration.unit = unit.clone();
    }
    info!("Calibration: {} {} per pixel", calibration.pixel_size, calibration.unit);

    std::fs::create_dir_all(&dir)?;

    let nslices = labels.pages.len();
    let segmenter = PrecomputedLabels::new(labels.pages);
    let config = run_config(&args, calibration.clone());

    let driver = SliceDriver::new(&segmenter, channel2.as_deref(), config)?;
    let first = if args.interactive {
        let mut picker = PromptPicker::new(std::io::stdin().lock(), std::io::stdout());
        driver.freeze(Some(&mut picker as &mut dyn ThresholdPicker))?
    } else {
        driver.freeze(None)?
    };

    let cancel = Arc::new(AtomicBool::new(false));
    if nslices > 1 {
        println!("Enter q to stop after the slices in progress");
        watch_for_stop(BufReader::new(std::io::stdin()), cancel.clone());
    }

    let progress = ProgressBar::new(nslices as u64);
    if let Ok(style) = ProgressStyle::default_bar().template("{bar:40.cyan/blue} {pos}/{len} slices ({eta})") {
        progress.set_style(style.progress_chars("##-"));
    }
    let (stack, summary) = driver.with_progress(progress).run_frozen(first, &cancel)?;

    for path in write_stacks(&dir, &stack, &calibration)? {
        println!("Wrote {}", path.display());
    }

    write_summary(&summary_path, summary_fmt, &summary)?;

    println!("Area threshold: {}", summary.area_threshold);
    if let Some(foreground) = summary.foreground {
        println!("Foreground range: [{}, {}]", foreground.min, foreground.max);
    }
    for slice in &summary.slices {
        match slice.mean_density {
            Some(density) => println!(
                "Slice {}: {} cells, cell area {} px², mean density {} {}, bin size {}",
                slice.slice,
                slice.cells,
                slice.cell_area,
                density,
                summary.density_unit,
                slice.bin_size.unwrap_or(0)
            ),
            None => println!("Slice {}: {}", slice.slice, slice.status.as_str()),
        }
    }

    let degenerate = summary.degenerate_slices();
    if degenerate.is_empty() {
        println!("All {} slices produced cells", summary.slices.len());
    } else {
        let list: Vec<String> = degenerate.iter().map(|s| s.to_string()).collect();
        println!("Slices without cells: {}", list.join(", "));
    }
    if summary.cancelled {
        println!("Run was cancelled, {} of {} slices processed", summary.slices.len(), nslices);
    }

    return Ok(());
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Err(err) = run(args) {
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CellDensityError;

    #[test]
    fn test_summary_target() {
        let args = Args::parse_from(["celldensity", "data/Stack 1.tif"]);
        let dir = output_directory(&args);
        assert_eq!(dir, Path::new("data").join("stack 1"));
        let (path, fmt) = summary_target(&args, &dir).unwrap();
        assert_eq!(PathBuf::from(path), dir.join(SUMMARY_FILENAME));
        assert_eq!(fmt, OutputFormat::Csv);

        let args = Args::parse_from(["celldensity", "a.tif", "--summary", "s.txt", "--summary-fmt", "csv-gz"]);
        assert_eq!(summary_target(&args, Path::new(".")).unwrap().1, OutputFormat::CsvGz);
    }

    #[test]
    fn test_unknown_summary_format_fails_before_reading_input() {
        let args = Args::parse_from(["celldensity", "no-such-stack.tif", "--summary", "summary.txt"]);
        assert!(matches!(run(args), Err(CellDensityError::InvalidInput(_))));
    }

    #[test]
    fn test_reach_options() {
        let args = Args::parse_from(["celldensity", "a.tif"]);
        let config = run_config(&args, Calibration::default());
        assert_eq!(
            config.params.reach,
            Reach::Auto {
                factor: DEFAULT_REACH_FACTOR
            }
        );

        let args = Args::parse_from(["celldensity", "a.tif", "--max-reach", "32"]);
        assert_eq!(run_config(&args, Calibration::default()).params.reach, Reach::Fixed(32.0));

        let args = Args::parse_from(["celldensity", "a.tif", "--max-reach", "0"]);
        assert_eq!(run_config(&args, Calibration::default()).params.reach, Reach::Unbounded);
    }
}
