// Table layouts shared by output.rs and the command line.

use clap::ValueEnum;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum OutputFormat {
    Infer,
    Csv,
    CsvGz,
}

pub const SUMMARY_COLUMNS: [&str; 9] = [
    "slice",
    "status",
    "nuclei",
    "cells",
    "cell_area_px",
    "mean_density",
    "density_unit",
    "bin_size",
    "mean_neighbors",
];

pub const LABELS_FILENAME: &str = "labels.tif";
pub const DENSITY_FILENAME: &str = "cell_density.tif";
pub const NEIGHBORS_FILENAME: &str = "neighbors.tif";
pub const CELLS_FILENAME: &str = "cells.tif";
pub const SUMMARY_FILENAME: &str = "summary.csv";
