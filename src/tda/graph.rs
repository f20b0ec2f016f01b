//! Coarse topology graph over the projected cloud.
//!
//! K-means condenses the cloud into at most eight cluster centers; an edge
//! joins two centers only when their separation is below the 75th
//! percentile of all centers' distances to the centroid of centers, which
//! keeps the graph a sparse backbone rather than a complete mesh.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::constants;
use crate::utils::numeric::{distance, distance_sq, percentile};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyNode {
    pub id: usize,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    /// Number of cloud points assigned to this cluster.
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyEdge {
    pub source: usize,
    pub target: usize,
    pub weight: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopologyGraph {
    pub nodes: Vec<TopologyNode>,
    pub edges: Vec<TopologyEdge>,
}

pub fn build_topology_graph(
    points: &[[f32; 3]],
    n_clusters: usize,
    seed: u64,
) -> TopologyGraph {
    let k = n_clusters.min(points.len());
    if k < 2 {
        return TopologyGraph::default();
    }

    let (centers, labels) = kmeans(points, k, seed);

    let nodes = centers
        .iter()
        .enumerate()
        .map(|(i, center)| TopologyNode {
            id: i,
            x: center[0],
            y: center[1],
            z: center[2],
            size: labels.iter().filter(|&&l| l == i).count(),
        })
        .collect();

    let mut centroid = [0.0f32; 3];
    for center in &centers {
        for (axis, value) in center.iter().enumerate() {
            centroid[axis] += value / centers.len() as f32;
        }
    }
    let spreads: Vec<f32> = centers.iter().map(|c| distance(c, &centroid)).collect();
    let threshold = percentile(&spreads, constants::tda::EDGE_PERCENTILE);

    let mut edges = Vec::new();
    for i in 0..centers.len() {
        for j in (i + 1)..centers.len() {
            let d = distance(&centers[i], &centers[j]);
            if d < threshold {
                edges.push(TopologyEdge {
                    source: i,
                    target: j,
                    weight: d,
                });
            }
        }
    }

    TopologyGraph { nodes, edges }
}

/// Seeded k-means with k-means++ initialization. Empty clusters keep their
/// previous center.
fn kmeans(points: &[[f32; 3]], k: usize, seed: u64) -> (Vec<[f32; 3]>, Vec<usize>) {
    let mut rng = StdRng::seed_from_u64(seed);

    let mut centers: Vec<[f32; 3]> = Vec::with_capacity(k);
    centers.push(points[rng.gen_range(0..points.len())]);
    while centers.len() < k {
        let weights: Vec<f32> = points
            .iter()
            .map(|p| {
                centers
                    .iter()
                    .map(|c| distance_sq(p, c))
                    .fold(f32::INFINITY, f32::min)
            })
            .collect();
        let total: f32 = weights.iter().sum();
        if total <= 0.0 {
            // Everything already coincides with a center.
            centers.push(points[rng.gen_range(0..points.len())]);
            continue;
        }
        let mut target = rng.gen::<f32>() * total;
        let mut chosen = points.len() - 1;
        for (i, &w) in weights.iter().enumerate() {
            if target <= w {
                chosen = i;
                break;
            }
            target -= w;
        }
        centers.push(points[chosen]);
    }

    let mut labels = vec![0usize; points.len()];
    for _ in 0..constants::tda::KMEANS_MAX_ITER {
        let mut changed = false;
        for (i, point) in points.iter().enumerate() {
            let mut best = 0;
            let mut best_d = f32::INFINITY;
            for (c, center) in centers.iter().enumerate() {
                let d = distance_sq(point, center);
                if d < best_d {
                    best_d = d;
                    best = c;
                }
            }
            if labels[i] != best {
                labels[i] = best;
                changed = true;
            }
        }

        let mut sums = vec![[0.0f64; 3]; k];
        let mut counts = vec![0usize; k];
        for (point, &label) in points.iter().zip(labels.iter()) {
            counts[label] += 1;
            for axis in 0..3 {
                sums[label][axis] += point[axis] as f64;
            }
        }
        for c in 0..k {
            if counts[c] > 0 {
                for axis in 0..3 {
                    centers[c][axis] = (sums[c][axis] / counts[c] as f64) as f32;
                }
            }
        }

        if !changed {
            break;
        }
    }

    (centers, labels)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_blobs() -> Vec<[f32; 3]> {
        let mut points = Vec::new();
        for i in 0..10 {
            let jitter = i as f32 * 0.01;
            points.push([jitter, jitter, 0.0]);
            points.push([10.0 + jitter, 10.0 - jitter, 0.0]);
        }
        points
    }

    #[test]
    fn test_too_few_points_yields_empty_graph() {
        assert_eq!(build_topology_graph(&[], 8, 42), TopologyGraph::default());
        assert_eq!(
            build_topology_graph(&[[1.0, 2.0, 3.0]], 8, 42),
            TopologyGraph::default()
        );
    }

    #[test]
    fn test_node_sizes_cover_cloud() {
        let points = two_blobs();
        let graph = build_topology_graph(&points, 4, 42);
        assert_eq!(graph.nodes.len(), 4);
        let total: usize = graph.nodes.iter().map(|n| n.size).sum();
        assert_eq!(total, points.len());
    }

    #[test]
    fn test_graph_is_sparse() {
        let points = two_blobs();
        let graph = build_topology_graph(&points, 8, 42);
        let k = graph.nodes.len();
        // The percentile rule keeps strictly fewer edges than the full mesh.
        assert!(graph.edges.len() < k * (k - 1) / 2);
        for edge in &graph.edges {
            assert!(edge.source < edge.target);
            assert!(edge.weight >= 0.0);
        }
    }

    #[test]
    fn test_clustering_is_deterministic() {
        let points = two_blobs();
        let a = build_topology_graph(&points, 4, 7);
        let b = build_topology_graph(&points, 4, 7);
        assert_eq!(a, b);
    }

    #[test]
    fn test_cluster_count_capped_by_points() {
        let points = vec![[0.0, 0.0, 0.0], [5.0, 0.0, 0.0], [0.0, 5.0, 0.0]];
        let graph = build_topology_graph(&points, 8, 42);
        assert_eq!(graph.nodes.len(), 3);
    }
}
