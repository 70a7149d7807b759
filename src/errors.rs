use thiserror::Error;

// Slice numbers carried by errors are 1-based, matching what is printed to
// the operator.
#[derive(Error, Debug)]
pub enum CellDensityError {
    #[error("slice {slice}: no cells survived filtering, density is undefined")]
    DegenerateSlice { slice: usize },

    #[error("slice {slice}: segmentation returned no nuclei")]
    SegmentationEmpty { slice: usize },

    #[error("threshold selection was cancelled")]
    ThresholdCancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl CellDensityError {
    // Per-slice conditions are recovered by the slice loop, everything else
    // aborts the run.
    pub fn is_slice_local(&self) -> bool {
        matches!(
            self,
            CellDensityError::DegenerateSlice { .. } | CellDensityError::SegmentationEmpty { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CellDensityError>;
