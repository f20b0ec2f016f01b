//! Vietoris–Rips persistence over small 3-D point clouds.
//!
//! The filtration carries vertices, edges, and flag triangles; homology is
//! reported up to dimension 1. Edges beyond the enclosing radius (the
//! smallest radius at which some vertex sees every other) are dropped: past
//! that scale the flag complex is a cone and no feature survives it, so the
//! truncation leaves every reported pair intact.

use anyhow::{bail, Result};
use rayon::prelude::*;
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::utils::numeric::robust_sum;

pub type PersistenceInterval = (f32, f32);

/// Features grouped by homological dimension; a death of `f32::INFINITY`
/// marks an essential class. Dimension 0 keeps one infinite-death feature
/// per connected component, matching the usual diagram convention.
#[derive(Debug, Clone)]
pub struct PersistenceDiagram {
    features_by_dim: Vec<Vec<PersistenceInterval>>,
}

impl PersistenceDiagram {
    fn new(max_dim: usize) -> Self {
        Self {
            features_by_dim: vec![Vec::new(); max_dim + 1],
        }
    }

    fn add(&mut self, dim: usize, birth: f32, death: f32) {
        if dim < self.features_by_dim.len() {
            self.features_by_dim[dim].push((birth, death));
        }
    }

    pub fn features(&self, dim: usize) -> &[PersistenceInterval] {
        self.features_by_dim
            .get(dim)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn feature_count(&self, dim: usize) -> usize {
        self.features(dim).len()
    }

    /// Finite positive lifetimes across every dimension.
    pub fn finite_lifetimes(&self) -> Vec<f32> {
        self.features_by_dim
            .iter()
            .flatten()
            .filter(|(_, death)| death.is_finite())
            .map(|(birth, death)| (death - birth).max(0.0))
            .filter(|life| *life > 0.0)
            .collect()
    }
}

/// Shannon entropy (natural log) of the normalized finite lifetimes, plus
/// the maximum raw lifetime. `(0, 0)` when no finite feature exists.
pub fn persistence_entropy(diagram: &PersistenceDiagram) -> (f32, f32) {
    let lifetimes = diagram.finite_lifetimes();
    if lifetimes.is_empty() {
        return (0.0, 0.0);
    }

    let total = robust_sum(lifetimes.iter().copied()) as f64;
    let mut entropy = 0.0f64;
    for &life in &lifetimes {
        let p = life as f64 / total;
        entropy -= p * (p + 1e-12).ln();
    }
    let max_persistence = lifetimes.iter().copied().fold(0.0f32, f32::max);
    (entropy as f32, max_persistence)
}

/// Compute the Rips persistence diagram up to `max_dim` homology.
pub fn rips_persistence(points: &[[f32; 3]], max_dim: usize) -> Result<PersistenceDiagram> {
    if points
        .iter()
        .any(|p| p.iter().any(|c| !c.is_finite()))
    {
        bail!("non-finite coordinate in point cloud");
    }

    let n = points.len();
    let mut diagram = PersistenceDiagram::new(max_dim);
    if n == 0 {
        return Ok(diagram);
    }
    if n == 1 {
        diagram.add(0, 0.0, f32::INFINITY);
        return Ok(diagram);
    }

    // Pairwise distances, row-parallel.
    let dist: Vec<Vec<f32>> = (0..n)
        .into_par_iter()
        .map(|i| {
            (0..n)
                .map(|j| {
                    let d: f32 = points[i]
                        .iter()
                        .zip(points[j].iter())
                        .map(|(a, b)| (a - b).powi(2))
                        .sum();
                    d.sqrt()
                })
                .collect()
        })
        .collect();

    let enclosing_radius = (0..n)
        .map(|i| {
            (0..n)
                .filter(|&j| j != i)
                .map(|j| dist[i][j])
                .fold(0.0f32, f32::max)
        })
        .fold(f32::INFINITY, f32::min)
        + 1e-6;

    // Filtration: (filtration value, dimension, sorted vertices).
    let mut simplices: Vec<(f32, usize, Vec<usize>)> = Vec::new();
    for i in 0..n {
        simplices.push((0.0, 0, vec![i]));
    }

    let mut adjacent = vec![vec![false; n]; n];
    for i in 0..n {
        for j in (i + 1)..n {
            if dist[i][j] <= enclosing_radius {
                adjacent[i][j] = true;
                adjacent[j][i] = true;
                simplices.push((dist[i][j], 1, vec![i, j]));
            }
        }
    }

    // Flag triangles; their diameter is the longest of the three edges.
    for i in 0..n {
        for j in (i + 1)..n {
            if !adjacent[i][j] {
                continue;
            }
            for k in (j + 1)..n {
                if adjacent[i][k] && adjacent[j][k] {
                    let d = dist[i][j].max(dist[i][k]).max(dist[j][k]);
                    simplices.push((d, 2, vec![i, j, k]));
                }
            }
        }
    }

    simplices.sort_by(|a, b| {
        if (a.0 - b.0).abs() > 1e-6 {
            a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal)
        } else {
            a.1.cmp(&b.1)
        }
    });

    // Sparse boundary matrix over Z/2, columns indexed by filtration order.
    let mut simplex_to_idx: HashMap<Vec<usize>, usize> = HashMap::new();
    let mut columns: Vec<Vec<usize>> = Vec::with_capacity(simplices.len());
    for (idx, (_, dim, vertices)) in simplices.iter().enumerate() {
        simplex_to_idx.insert(vertices.clone(), idx);

        let mut boundary = Vec::new();
        if *dim > 0 {
            for omit in 0..vertices.len() {
                let mut face = vertices.clone();
                face.remove(omit);
                if let Some(&face_idx) = simplex_to_idx.get(&face) {
                    boundary.push(face_idx);
                }
            }
        }
        columns.push(boundary);
    }

    let mut reduction = Reduction::new(columns);
    reduction.reduce();

    // Killed rows pair a birth simplex with the column that destroys it.
    let mut killed_rows = HashSet::new();
    for col_idx in 0..simplices.len() {
        if let Some(row_idx) = reduction.pivot(col_idx) {
            killed_rows.insert(row_idx);
            let (birth, dim, _) = &simplices[row_idx];
            let death = simplices[col_idx].0;
            if death - birth > 1e-6 {
                diagram.add(*dim, *birth, death);
            }
        }
    }

    // Unpaired creators are essential classes.
    for (idx, (birth, dim, _)) in simplices.iter().enumerate() {
        if !killed_rows.contains(&idx) && reduction.pivot(idx).is_none() {
            diagram.add(*dim, *birth, f32::INFINITY);
        }
    }

    Ok(diagram)
}

/// Standard column reduction over Z/2: each column is repeatedly folded
/// into by the earlier column owning its pivot until the pivot is unique
/// or the column clears.
struct Reduction {
    columns: Vec<BTreeSet<usize>>,
    pivot_owner: Vec<Option<usize>>,
}

impl Reduction {
    fn new(boundary: Vec<Vec<usize>>) -> Self {
        let rows = boundary.len();
        let columns = boundary
            .into_iter()
            .map(|col| col.into_iter().collect())
            .collect();
        Self {
            columns,
            pivot_owner: vec![None; rows],
        }
    }

    fn pivot(&self, col: usize) -> Option<usize> {
        self.columns[col].iter().next_back().copied()
    }

    fn add_column(&mut self, target: usize, source: usize) {
        let source_col = self.columns[source].clone();
        let target_col = &mut self.columns[target];
        for row in source_col {
            // Z/2 addition is a symmetric difference.
            if !target_col.remove(&row) {
                target_col.insert(row);
            }
        }
    }

    fn reduce(&mut self) {
        for j in 0..self.columns.len() {
            while let Some(pivot_row) = self.pivot(j) {
                match self.pivot_owner[pivot_row] {
                    Some(owner) => self.add_column(j, owner),
                    None => {
                        self.pivot_owner[pivot_row] = Some(j);
                        break;
                    }
                }
            }
        }
    }
}
