//! TDA pipeline over captured activation matrices.
//!
//! Per-layer token activations are pooled into one bounded point cloud,
//! projected to three dimensions, and summarized by Vietoris–Rips
//! persistence: Betti counts, persistence entropy, the strongest feature's
//! lifetime, and a coarse cluster graph for the dashboards.

pub mod graph;
pub mod homology;

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::config::TdaKnobs;
use crate::constants;

pub use graph::{TopologyEdge, TopologyGraph, TopologyNode};
pub use homology::{persistence_entropy, rips_persistence, PersistenceDiagram};

/// Layer index -> (tokens x hidden) activation matrix.
pub type LayerActivations = BTreeMap<usize, DMatrix<f32>>;

/// Summary of one TDA pass, attached to exactly one pipeline stage.
#[derive(Debug, Clone, Serialize)]
pub struct TdaResult {
    pub betti_0: usize,
    pub betti_1: usize,
    pub persistence_entropy: f32,
    pub max_persistence: f32,
    /// Projected cloud downsampled for visualization.
    pub point_cloud: Vec<[f32; 3]>,
    pub topology_graph: TopologyGraph,
}

/// Pool every tapped layer's token vectors into one matrix, subsampling
/// uniformly (seeded) down to `max_points` rows when the pool is larger.
pub fn build_point_cloud(
    activations: &LayerActivations,
    max_points: usize,
    seed: u64,
) -> Result<DMatrix<f32>> {
    let mut rows: Vec<Vec<f32>> = Vec::new();
    let mut width: Option<usize> = None;

    for matrix in activations.values() {
        if matrix.nrows() == 0 {
            continue;
        }
        match width {
            None => width = Some(matrix.ncols()),
            Some(w) if w != matrix.ncols() => {
                bail!(
                    "tapped layers disagree on hidden width ({} vs {})",
                    w,
                    matrix.ncols()
                );
            }
            _ => {}
        }
        for row in matrix.row_iter() {
            rows.push(row.iter().copied().collect());
        }
    }

    let Some(width) = width else {
        return Ok(DMatrix::zeros(0, 0));
    };

    if rows.len() > max_points {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut keep: Vec<usize> =
            rand::seq::index::sample(&mut rng, rows.len(), max_points).into_vec();
        keep.sort_unstable();
        let mut sampled = Vec::with_capacity(max_points);
        for i in keep {
            sampled.push(std::mem::take(&mut rows[i]));
        }
        rows = sampled;
    }

    Ok(DMatrix::from_row_iterator(
        rows.len(),
        width,
        rows.into_iter().flatten(),
    ))
}

/// Deterministic (seeded) linear projection down to `dims` components.
/// Narrow clouds are padded instead of projected; an empty cloud passes
/// through untouched.
pub fn reduce_dimensions(cloud: &DMatrix<f32>, dims: usize, seed: u64) -> Vec<[f32; 3]> {
    debug_assert_eq!(dims, constants::tda::PROJECTION_DIMS);
    if cloud.nrows() == 0 {
        return Vec::new();
    }

    if cloud.ncols() <= dims {
        return cloud
            .row_iter()
            .map(|row| {
                let mut p = [0.0f32; 3];
                for (axis, value) in row.iter().take(dims).enumerate() {
                    p[axis] = *value;
                }
                p
            })
            .collect();
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let scale = 1.0 / (dims as f32).sqrt();
    let projection = DMatrix::from_fn(cloud.ncols(), dims, |_, _| {
        rng.gen_range(-1.0f32..1.0) * scale
    });
    let projected = cloud * projection;
    projected
        .row_iter()
        .map(|row| [row[0], row[1], row[2]])
        .collect()
}

/// Full pipeline: pool, project, persist, cluster. `Ok(None)` when there is
/// nothing to analyze; `Err` on degenerate input the caller should degrade
/// on rather than abort.
pub fn compute_tda(activations: &LayerActivations, knobs: &TdaKnobs) -> Result<Option<TdaResult>> {
    let cloud = build_point_cloud(activations, knobs.max_points, knobs.seed)?;
    if cloud.nrows() == 0 {
        return Ok(None);
    }

    let points = reduce_dimensions(&cloud, constants::tda::PROJECTION_DIMS, knobs.seed);
    let diagram = rips_persistence(&points, constants::tda::MAX_HOMOLOGY_DIM)?;
    let (entropy, max_persistence) = persistence_entropy(&diagram);
    let topology_graph = graph::build_topology_graph(&points, knobs.graph_clusters, knobs.seed);

    let point_cloud = downsample_points(points, constants::tda::VIS_POINT_CAP, knobs.seed);

    Ok(Some(TdaResult {
        betti_0: diagram.feature_count(0),
        betti_1: diagram.feature_count(1),
        persistence_entropy: entropy,
        max_persistence,
        point_cloud,
        topology_graph,
    }))
}

/// Seeded uniform subsample without replacement, order-preserving; identity
/// when the cloud already fits the cap.
fn downsample_points(points: Vec<[f32; 3]>, cap: usize, seed: u64) -> Vec<[f32; 3]> {
    if points.len() <= cap {
        return points;
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut keep: Vec<usize> = rand::seq::index::sample(&mut rng, points.len(), cap).into_vec();
    keep.sort_unstable();
    keep.into_iter().map(|i| points[i]).collect()
}
