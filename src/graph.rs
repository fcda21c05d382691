//! Frame graph construction.
//!
//! A frame graph scopes the optimization constraints of one batch: losses are
//! only evaluated over its edges and the network only relates connected
//! frames. Training batches draw between a heuristic co-visibility graph and
//! a fixed temporal window by an unbiased coin flip; validation always uses
//! the window.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::Rng;

use crate::data::FrameBatch;
use crate::error::{TrainError, TrainResult};

/// Temporal radius of the window graph, `|i - j| <= 2`.
pub const WINDOW_RADIUS: usize = 2;

/// Adjacency over the frames of one batch.
///
/// Maps each frame index to its ordered neighbor list. No self-loops; the
/// structure may be asymmetric. Every index lies in `[0, n)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameGraph {
    n: usize,
    adjacency: BTreeMap<usize, Vec<usize>>,
}

impl FrameGraph {
    /// Build a graph from an edge list. Rejects self-loops and out-of-range
    /// indices; deduplicates and sorts neighbor lists.
    pub fn from_edges(n: usize, edges: impl IntoIterator<Item = (usize, usize)>) -> TrainResult<Self> {
        let mut adjacency: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (i, j) in edges {
            if i == j {
                return Err(TrainError::graph(format!("self-loop at frame {i}")));
            }
            if i >= n || j >= n {
                return Err(TrainError::graph(format!(
                    "edge ({i}, {j}) out of range for {n} frames"
                )));
            }
            let neighbors = adjacency.entry(i).or_default();
            if !neighbors.contains(&j) {
                neighbors.push(j);
            }
        }
        for neighbors in adjacency.values_mut() {
            neighbors.sort_unstable();
        }
        Ok(Self { n, adjacency })
    }

    /// The fixed temporal-window rule: `i ~ j` iff `i != j && |i - j| <= radius`.
    pub fn window(n: usize, radius: usize) -> Self {
        let mut adjacency = BTreeMap::new();
        for i in 0..n {
            let lo = i.saturating_sub(radius);
            let hi = (i + radius).min(n.saturating_sub(1));
            let neighbors: Vec<usize> = (lo..=hi).filter(|&j| j != i).collect();
            adjacency.insert(i, neighbors);
        }
        Self { n, adjacency }
    }

    /// Number of frames this graph spans.
    pub fn frames(&self) -> usize {
        self.n
    }

    /// Neighbors of frame `i` (empty if the frame has none).
    pub fn neighbors(&self, i: usize) -> &[usize] {
        self.adjacency.get(&i).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All directed edges `(i, j)` in deterministic order.
    pub fn edges(&self) -> Vec<(usize, usize)> {
        self.adjacency
            .iter()
            .flat_map(|(&i, neighbors)| neighbors.iter().map(move |&j| (i, j)))
            .collect()
    }

    /// Total directed edge count.
    pub fn edge_count(&self) -> usize {
        self.adjacency.values().map(Vec::len).sum()
    }
}

/// External co-visibility scoring collaborator.
///
/// Scores an ordered frame pair of a batch; higher means more shared view.
/// The heuristic graph keeps the highest-scoring pairs within the edge
/// budget.
pub trait CovisibilityScorer: Send {
    fn score(&self, batch: &FrameBatch, i: usize, j: usize) -> TrainResult<f64>;
}

/// Default scorer: inverse camera-baseline heuristic clamped to the
/// configured frame-sampling bounds. Pairs whose baseline falls outside
/// `[fmin, fmax]` score zero; inside the band, closer pairs score higher.
#[derive(Debug, Clone)]
pub struct BaselineScorer {
    pub fmin: f64,
    pub fmax: f64,
}

impl CovisibilityScorer for BaselineScorer {
    fn score(&self, batch: &FrameBatch, i: usize, j: usize) -> TrainResult<f64> {
        let baseline = batch.baseline(i, j)?;
        if baseline < self.fmin || baseline > self.fmax {
            return Ok(0.0);
        }
        Ok(1.0 / (1.0 + baseline))
    }
}

/// Graph construction mode for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphMode {
    /// Keep the `edges` highest-scoring ordered pairs.
    Heuristic { edges: usize },
    /// Fixed temporal window.
    Window { radius: usize },
}

/// Per-batch graph builder.
///
/// Training mode is drawn by an unbiased coin flip from an injectable seeded
/// RNG. The flip never triggers a collective, so ranks may diverge here
/// without risking deadlock.
pub struct GraphBuilder {
    edges: usize,
    scorer: Box<dyn CovisibilityScorer>,
    rng: StdRng,
}

impl GraphBuilder {
    pub fn new(edges: usize, scorer: Box<dyn CovisibilityScorer>, rng: StdRng) -> Self {
        Self { edges, scorer, rng }
    }

    /// Draw the mode for the next training batch.
    pub fn draw_mode(&mut self) -> GraphMode {
        if self.rng.gen::<f64>() < 0.5 {
            GraphMode::Heuristic { edges: self.edges }
        } else {
            GraphMode::Window {
                radius: WINDOW_RADIUS,
            }
        }
    }

    /// Build the graph for a batch under the given mode.
    pub fn build(&self, mode: GraphMode, batch: &FrameBatch) -> TrainResult<FrameGraph> {
        let n = batch.frames();
        match mode {
            GraphMode::Window { radius } => Ok(FrameGraph::window(n, radius)),
            GraphMode::Heuristic { edges } => {
                let mut scored: Vec<((usize, usize), f64)> = Vec::with_capacity(n * (n - 1));
                for i in 0..n {
                    for j in 0..n {
                        if i == j {
                            continue;
                        }
                        scored.push(((i, j), self.scorer.score(batch, i, j)?));
                    }
                }
                // Highest score first; index order breaks ties deterministically.
                scored.sort_by(|a, b| {
                    b.1.partial_cmp(&a.1)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.0.cmp(&b.0))
                });
                let kept = scored.into_iter().take(edges).map(|(pair, _)| pair);
                FrameGraph::from_edges(n, kept)
            }
        }
    }

    /// The graph used for every validation batch.
    pub fn validation(&self, n: usize) -> FrameGraph {
        FrameGraph::window(n, WINDOW_RADIUS)
    }
}
