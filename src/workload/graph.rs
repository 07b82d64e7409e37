use std::ops::Range;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Directed graph in compressed sparse row form.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    offsets: Vec<usize>,
    targets: Vec<u32>,
}

impl Graph {
    pub fn from_edges(vertices: usize, mut edges: Vec<(u32, u32)>) -> Self {
        edges.sort_unstable();
        let mut offsets = vec![0; vertices + 1];
        for &(src, _) in &edges {
            offsets[src as usize + 1] += 1;
        }
        for v in 0..vertices {
            offsets[v + 1] += offsets[v];
        }
        Self {
            offsets,
            targets: edges.into_iter().map(|(_, dst)| dst).collect(),
        }
    }

    /// Random graph where each vertex draws its out-degree from `0..=2*avg_degree`.
    pub fn random(vertices: u64, avg_degree: u64, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut edges = Vec::new();
        for src in 0..vertices {
            let degree = rng.gen_range(0..=2 * avg_degree);
            for _ in 0..degree {
                edges.push((src as u32, rng.gen_range(0..vertices) as u32));
            }
        }
        Self::from_edges(vertices as usize, edges)
    }

    pub fn num_vertices(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    pub fn num_edges(&self) -> usize {
        self.targets.len()
    }

    /// Global edge indices of `v`'s out-edges.
    pub fn edge_range(&self, v: usize) -> Range<usize> {
        self.offsets[v]..self.offsets[v + 1]
    }

    pub fn out_edges(&self, v: usize) -> &[u32] {
        &self.targets[self.edge_range(v)]
    }
}
