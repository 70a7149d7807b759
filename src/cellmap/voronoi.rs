// Discrete Voronoi tessellation of the plane from cell centroids, and the
// touch graph between the resulting regions.
//
// Centroids are painted as small disks, binarized and labelled to get seed
// blobs. Seeds then grow in lock-step, alternating 4- and 8-connected steps
// (an octagonal distance). Pixels claimed by two seeds in the same step, or
// that would put two different labels side by side, become boundary. The
// interiors are relabelled as connected components, dilated by one pixel and
// any two labels that meet after dilation are neighbours.

use super::instances::InstanceSet;
use super::raster::{
    connected_components, disk_pixels, maximum_box, neighbours, Connectivity, LabelImage, Mask,
};
use super::threshold::{otsu, Histogram, HISTOGRAM_BINS};

use log::trace;
use ndarray::Array2;
use petgraph::graphmap::UnGraphMap;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

pub type AdjacencyGraph = UnGraphMap<u32, ()>;

const BOUNDARY: u32 = u32::MAX;
const MARKER_VALUE: f32 = 255.0;

pub struct Tessellation {
    // 0 on boundaries and beyond reach, otherwise a seed label
    pub label_map: LabelImage,

    // one per label, id = label
    pub seeds: InstanceSet,

    // every seed label is a node, isolated or not
    pub adjacency: AdjacencyGraph,
}

impl Tessellation {
    pub fn label_count(&self) -> usize {
        self.seeds.len()
    }

    pub fn neighbour_count(&self, label: u32) -> usize {
        self.adjacency.neighbors(label).count()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Tessellator {
    pub marker_radius: usize,

    // regions stop growing this far (in pixels) from their seed centroid
    pub max_reach: Option<f64>,
}

impl Tessellator {
    pub fn new(marker_radius: usize, max_reach: Option<f64>) -> Tessellator {
        Tessellator {
            marker_radius,
            max_reach,
        }
    }

    pub fn marker_raster(&self, centroids: &[(f64, f64)], dim: (usize, usize)) -> Array2<f32> {
        let mut raster = Array2::zeros(dim);
        for &centroid in centroids {
            for p in disk_pixels(dim, centroid, self.marker_radius) {
                raster[p] = MARKER_VALUE;
            }
        }
        return raster;
    }

    pub fn tessellate_points(&self, centroids: &[(f64, f64)], dim: (usize, usize)) -> Tessellation {
        self.tessellate(&self.marker_raster(centroids, dim))
    }

    pub fn tessellate(&self, raster: &Array2<f32>) -> Tessellation {
        let t0 = Instant::now();

        let (seed_labels, seeds) = seed_blobs(raster);
        let centres: HashMap<u32, (f64, f64)> =
            seeds.iter().map(|seed| (seed.id, seed.centroid)).collect();
        trace!("voronoi seeds: {} in {:?}", seeds.len(), t0.elapsed());

        let t0 = Instant::now();
        let grown = propagate(&seed_labels, &centres, self.max_reach);
        trace!("voronoi propagation: {:?}", t0.elapsed());

        let interiors: Mask = grown.mapv(|l| l != 0 && l != BOUNDARY);
        let (components, ncomponents) = connected_components(&interiors, Connectivity::Eight);

        let mut relabel = vec![0u32; ncomponents as usize + 1];
        for (p, &c) in components.indexed_iter() {
            if c != 0 && relabel[c as usize] == 0 {
                relabel[c as usize] = grown[p];
            }
        }
        let label_map = components.mapv(|c| relabel[c as usize]);

        let mut adjacency = touch_graph(&maximum_box(&label_map));
        for seed in &seeds {
            adjacency.add_node(seed.id);
        }

        return Tessellation {
            label_map,
            seeds,
            adjacency,
        };
    }
}

// Otsu binarization followed by 8-connected labelling.
fn seed_blobs(raster: &Array2<f32>) -> (LabelImage, InstanceSet) {
    let threshold = Histogram::new(raster.iter().copied(), HISTOGRAM_BINS)
        .map(|hist| otsu(&hist))
        .unwrap_or(f32::INFINITY);
    let binary = raster.mapv(|v| v >= threshold);
    let (labels, _) = connected_components(&binary, Connectivity::Eight);
    let seeds = InstanceSet::from_label_image(&labels);
    return (labels, seeds);
}

fn propagate(
    seeds: &LabelImage,
    centres: &HashMap<u32, (f64, f64)>,
    max_reach: Option<f64>,
) -> LabelImage {
    let dim = seeds.dim();
    let mut labels = seeds.clone();
    let reach2 = max_reach.map(|r| r * r);

    let in_reach = |q: (usize, usize), label: u32| -> bool {
        let Some(reach2) = reach2 else {
            return true;
        };
        let Some(&(cx, cy)) = centres.get(&label) else {
            return false;
        };
        let (dx, dy) = (q.1 as f64 + 0.5 - cx, q.0 as f64 + 0.5 - cy);
        return dx * dx + dy * dy <= reach2;
    };

    let mut frontier: Vec<(usize, usize)> = labels
        .indexed_iter()
        .filter(|&(_, &l)| l != 0)
        .map(|(p, _)| p)
        .collect();

    let mut step = 0;
    while !frontier.is_empty() {
        let conn = if step % 2 == 0 {
            Connectivity::Four
        } else {
            Connectivity::Eight
        };
        step += 1;

        // raster order keeps the tie breaking deterministic
        let mut claims: BTreeMap<(usize, usize), u32> = BTreeMap::new();
        for &p in &frontier {
            let label = labels[p];
            for q in neighbours(dim, p, conn) {
                if labels[q] != 0 || !in_reach(q, label) {
                    continue;
                }
                claims
                    .entry(q)
                    .and_modify(|c| {
                        if *c != label {
                            *c = BOUNDARY
                        }
                    })
                    .or_insert(label);
            }
        }

        let mut next = Vec::new();
        for (q, label) in claims {
            if label != BOUNDARY {
                let conflict = neighbours(dim, q, Connectivity::Eight).any(|r| {
                    let other = labels[r];
                    other != 0 && other != BOUNDARY && other != label
                });
                if !conflict {
                    labels[q] = label;
                    next.push(q);
                    continue;
                }
            }
            labels[q] = BOUNDARY;
        }
        frontier = next;
    }

    return labels;
}

// Two labels touch if they are 8-adjacent anywhere in the dilated map.
fn touch_graph(dilated: &LabelImage) -> AdjacencyGraph {
    let (m, n) = dilated.dim();
    let mut graph = AdjacencyGraph::new();

    let mut connect = |a: u32, b: u32| {
        if a != 0 && b != 0 && a != b {
            graph.add_edge(a, b, ());
        }
    };

    for i in 0..m {
        for j in 0..n {
            let a = dilated[[i, j]];
            if j + 1 < n {
                connect(a, dilated[[i, j + 1]]);
            }
            if i + 1 < m {
                connect(a, dilated[[i + 1, j]]);
                if j + 1 < n {
                    connect(a, dilated[[i + 1, j + 1]]);
                }
                if j > 0 {
                    connect(a, dilated[[i + 1, j - 1]]);
                }
            }
        }
    }

    return graph;
}
