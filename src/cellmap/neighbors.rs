use super::voronoi::Tessellation;

use ndarray::{Array2, Zip};
use std::collections::{HashMap, HashSet};

pub type NeighborMap = Array2<u16>;

// Number of touching regions per tessellation label.
pub fn neighbor_counts(tess: &Tessellation) -> HashMap<u32, usize> {
    tess.seeds
        .iter()
        .map(|seed| (seed.id, tess.neighbour_count(seed.id)))
        .collect()
}

// Paints each region with its neighbour count. Boundary pixels, pixels
// outside every region, and regions listed in `excluded` are 0.
pub fn neighbor_map(tess: &Tessellation, excluded: &HashSet<u32>) -> NeighborMap {
    let counts = neighbor_counts(tess);
    let mut raster = NeighborMap::zeros(tess.label_map.dim());
    Zip::from(&mut raster)
        .and(&tess.label_map)
        .par_for_each(|v, &label| {
            if label != 0 && !excluded.contains(&label) {
                let count = counts.get(&label).copied().unwrap_or(0);
                *v = count.min(u16::MAX as usize) as u16;
            }
        });
    return raster;
}

pub fn mean_neighbor_count(tess: &Tessellation, excluded: &HashSet<u32>) -> Option<f64> {
    let counts: Vec<usize> = tess
        .seeds
        .iter()
        .filter(|seed| !excluded.contains(&seed.id))
        .map(|seed| tess.neighbour_count(seed.id))
        .collect();
    if counts.is_empty() {
        return None;
    }
    return Some(counts.iter().sum::<usize>() as f64 / counts.len() as f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cellmap::voronoi::Tessellator;

    #[test]
    fn test_isolated_cell_has_no_neighbours() {
        let tess = Tessellator::new(2, Some(12.0)).tessellate_points(&[(30.5, 30.5), (5.5, 5.5)], (60, 60));
        let map = neighbor_map(&tess, &HashSet::new());

        let label = tess.label_map[[30, 30]];
        assert_ne!(label, 0);
        for (p, &l) in tess.label_map.indexed_iter() {
            if l == label {
                assert_eq!(map[p], 0);
            }
        }
        assert_eq!(mean_neighbor_count(&tess, &HashSet::new()), Some(0.0));
    }

    #[test]
    fn test_counts_painted_on_interiors() {
        let centroids = [(10.5, 10.5), (30.5, 10.5), (50.5, 10.5)];
        let tess = Tessellator::new(2, None).tessellate_points(&centroids, (21, 61));
        let counts = neighbor_counts(&tess);
        let map = neighbor_map(&tess, &HashSet::new());

        let middle = tess.label_map[[10, 30]];
        assert_eq!(counts[&middle], 2);
        assert_eq!(map[[10, 30]], 2);
        assert_eq!(map[[10, 10]], 1);

        for (p, &l) in tess.label_map.indexed_iter() {
            if l == 0 {
                assert_eq!(map[p], 0);
            }
        }

        let excluded: HashSet<u32> = [middle].into_iter().collect();
        let map = neighbor_map(&tess, &excluded);
        assert_eq!(map[[10, 30]], 0);
        assert_eq!(map[[10, 50]], 1);
        assert_eq!(mean_neighbor_count(&tess, &excluded), Some(1.0));
    }
}
