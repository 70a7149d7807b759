use super::assign::CellRegion;
use super::raster::in_border_band;

pub const DEFAULT_BORDER_WIDTH: usize = 2;

// Cells reaching into a band along the image edge are truncated by the field
// of view. They are flagged and left out of density and neighbour statistics.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BorderPolicy {
    pub width: usize,
}

impl Default for BorderPolicy {
    fn default() -> Self {
        BorderPolicy {
            width: DEFAULT_BORDER_WIDTH,
        }
    }
}

impl BorderPolicy {
    pub fn new(width: usize) -> BorderPolicy {
        BorderPolicy { width }
    }

    pub fn touches_border(&self, pixels: &[(usize, usize)], dim: (usize, usize)) -> bool {
        pixels.iter().any(|&p| in_border_band(dim, p, self.width))
    }

    // Sets `touches_border` on every cell and returns the number flagged.
    pub fn apply(&self, cells: &mut [CellRegion], dim: (usize, usize)) -> usize {
        let mut flagged = 0;
        for cell in cells.iter_mut() {
            cell.touches_border = self.touches_border(&cell.pixels, dim);
            if cell.touches_border {
                flagged += 1;
            }
        }
        return flagged;
    }
}
