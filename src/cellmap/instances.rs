// Nucleus instances of one slice, as handed over by the segmentation step.

use super::raster::LabelImage;
use crate::errors::{CellDensityError, Result};

use itertools::{Itertools, MinMaxResult};
use kiddo::float::kdtree::KdTree;
use kiddo::SquaredEuclidean;
use std::collections::{BTreeMap, HashMap};

#[derive(Clone, Debug)]
pub struct Instance {
    pub id: u32,

    // (row, col) pixels covered by the nucleus
    pub pixels: Vec<(usize, usize)>,

    // in pixels²
    pub area: f64,

    // (x, y), pixel centres at +0.5
    pub centroid: (f64, f64),
}

impl Instance {
    pub fn new(id: u32, pixels: Vec<(usize, usize)>) -> Instance {
        let area = pixels.len() as f64;
        let (mut sx, mut sy) = (0.0, 0.0);
        for &(i, j) in &pixels {
            sx += j as f64;
            sy += i as f64;
        }
        let centroid = if pixels.is_empty() {
            (f64::NAN, f64::NAN)
        } else {
            (sx / area + 0.5, sy / area + 0.5)
        };

        return Instance {
            id,
            pixels,
            area,
            centroid,
        };
    }
}

#[derive(Clone, Debug, Default)]
pub struct InstanceSet {
    instances: Vec<Instance>,

    // id -> position in `instances`
    index: HashMap<u32, usize>,
}

fn index_ids(instances: &[Instance]) -> HashMap<u32, usize> {
    instances
        .iter()
        .enumerate()
        .map(|(k, instance)| (instance.id, k))
        .collect()
}

impl InstanceSet {
    pub fn new(instances: Vec<Instance>) -> Result<InstanceSet> {
        let mut index = HashMap::with_capacity(instances.len());
        for (k, instance) in instances.iter().enumerate() {
            if index.insert(instance.id, k).is_some() {
                return Err(CellDensityError::InvalidInput(format!(
                    "duplicate instance id {}",
                    instance.id
                )));
            }
        }
        return Ok(InstanceSet { instances, index });
    }

    // One instance per non-zero label, ordered by label. Labels are mutually
    // exclusive by construction of a label image.
    pub fn from_label_image(labels: &LabelImage) -> InstanceSet {
        let mut pixels: BTreeMap<u32, Vec<(usize, usize)>> = BTreeMap::new();
        for ((i, j), &label) in labels.indexed_iter() {
            if label != 0 {
                pixels.entry(label).or_default().push((i, j));
            }
        }

        let instances: Vec<Instance> = pixels
            .into_iter()
            .map(|(id, pixels)| Instance::new(id, pixels))
            .collect();
        let index = index_ids(&instances);

        return InstanceSet { instances, index };
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Instance> {
        self.instances.iter()
    }

    pub fn get(&self, id: u32) -> Option<&Instance> {
        self.index.get(&id).map(|&k| &self.instances[k])
    }

    // Keep only instances satisfying the predicate, preserving order.
    pub fn retain<F>(&self, mut keep: F) -> InstanceSet
    where
        F: FnMut(&Instance) -> bool,
    {
        let instances: Vec<Instance> = self.instances.iter().filter(|i| keep(i)).cloned().collect();
        let index = index_ids(&instances);
        return InstanceSet { instances, index };
    }

    pub fn area_range(&self) -> Option<(f64, f64)> {
        match self.instances.iter().map(|i| i.area).minmax_by(|a, b| a.total_cmp(b)) {
            MinMaxResult::NoElements => None,
            MinMaxResult::OneElement(a) => Some((a, a)),
            MinMaxResult::MinMax(a, b) => Some((a, b)),
        }
    }

    // Label image holding only the instances of this set.
    pub fn paint(&self, dim: (usize, usize)) -> LabelImage {
        let mut labels = LabelImage::zeros(dim);
        for instance in &self.instances {
            for &(i, j) in &instance.pixels {
                if i < dim.0 && j < dim.1 {
                    labels[[i, j]] = instance.id;
                }
            }
        }
        return labels;
    }

    // Positions of instances with a finite centroid, keyed by their index.
    fn centroid_tree(&self) -> KdTree<f32, u32, 2, 32, u32> {
        let mut kdtree: KdTree<f32, u32, 2, 32, u32> = KdTree::with_capacity(self.len().max(1));
        for (k, instance) in self.instances.iter().enumerate() {
            let (x, y) = instance.centroid;
            if x.is_finite() && y.is_finite() {
                kdtree.add(&[x as f32, y as f32], k as u32);
            }
        }
        return kdtree;
    }

    // Pairs of instance ids whose centroids are closer than `min_distance`.
    // Markers of such pairs overlap and end up in the same basin.
    pub fn crowded_pairs(&self, min_distance: f64) -> Vec<(u32, u32)> {
        let kdtree = self.centroid_tree();
        let r2 = (min_distance * min_distance) as f32;
        let mut pairs = Vec::new();
        for (k, instance) in self.instances.iter().enumerate() {
            let (x, y) = instance.centroid;
            if !x.is_finite() || !y.is_finite() {
                continue;
            }
            for neighbour in kdtree.within_unsorted::<SquaredEuclidean>(&[x as f32, y as f32], r2) {
                let l = neighbour.item as usize;
                if l > k && neighbour.distance < r2 {
                    pairs.push((instance.id, self.instances[l].id));
                }
            }
        }
        pairs.sort_unstable();

        return pairs;
    }

    // Median over instances of the distance to the nearest other centroid.
    // None with fewer than two centroids.
    pub fn median_nearest_distance(&self) -> Option<f64> {
        let kdtree = self.centroid_tree();
        let mut distances: Vec<f64> = Vec::with_capacity(self.len());
        for (k, instance) in self.instances.iter().enumerate() {
            let (x, y) = instance.centroid;
            if !x.is_finite() || !y.is_finite() {
                continue;
            }
            let nearest = kdtree
                .nearest_n::<SquaredEuclidean>(&[x as f32, y as f32], 2)
                .into_iter()
                .find(|neighbour| neighbour.item as usize != k);
            if let Some(neighbour) = nearest {
                distances.push((neighbour.distance as f64).sqrt());
            }
        }
        if distances.is_empty() {
            return None;
        }

        distances.sort_unstable_by(|a, b| a.total_cmp(b));
        let mid = distances.len() / 2;
        let median = if distances.len() % 2 == 0 {
            0.5 * (distances[mid - 1] + distances[mid])
        } else {
            distances[mid]
        };
        return Some(median);
    }
}

impl<'a> IntoIterator for &'a InstanceSet {
    type Item = &'a Instance;
    type IntoIter = std::slice::Iter<'a, Instance>;

    fn into_iter(self) -> Self::IntoIter {
        self.instances.iter()
    }
}
