use kpt_core::Point2f;
use log::debug;
use nalgebra::Vector2;

pub mod clustering;

pub use clustering::{dbscan, largest_cluster};

/// Result of one centroid vote
#[derive(Debug, Clone, PartialEq)]
pub struct VoteOutcome {
    /// Mean of the consensus cluster
    pub centroid: Point2f,
    /// Per candidate: member of the consensus cluster
    pub inliers: Vec<bool>,
    pub cluster_size: usize,
}

/// Spatial consensus over centroid candidates cast by active points
#[derive(Debug, Clone, Copy)]
pub struct CentroidVoter {
    eps: f32,
    min_points: usize,
}

impl CentroidVoter {
    pub fn new(eps: f32, min_points: usize) -> Self {
        Self { eps, min_points }
    }

    /// Cluster the candidates and return the mean of the largest cluster.
    ///
    /// `None` when no candidate gathers `min_points` neighbours.
    pub fn vote(&self, candidates: &[Point2f]) -> Option<VoteOutcome> {
        if candidates.is_empty() {
            return None;
        }

        let labels = dbscan(candidates, self.eps, self.min_points);
        let (winner, cluster_size) = largest_cluster(&labels)?;

        let inliers: Vec<bool> = labels.iter().map(|&l| l == Some(winner)).collect();
        let sum = candidates
            .iter()
            .zip(&inliers)
            .filter(|(_, inlier)| **inlier)
            .fold(Vector2::<f32>::zeros(), |acc, (p, _)| acc + p.coords);
        let centroid = Point2f::from(sum / cluster_size as f32);

        debug!(
            "centroid vote: {}/{} candidates in consensus at ({:.1}, {:.1})",
            cluster_size,
            candidates.len(),
            centroid.x,
            centroid.y
        );

        Some(VoteOutcome {
            centroid,
            inliers,
            cluster_size,
        })
    }
}

/// Centroid candidate of every observation: `origin + vote`
pub fn cast_votes(origins: &[Point2f], votes: &[Vector2<f32>]) -> Vec<Point2f> {
    origins.iter().zip(votes).map(|(o, v)| o + v).collect()
}

/// Per-model-point image-space vote vectors.
///
/// With `refresh` enabled every [`record`](Self::record) overwrites the stored
/// vote; otherwise a point keeps the first vote recorded for it.
#[derive(Debug, Clone)]
pub struct VoteTable {
    votes: Vec<Option<Vector2<f32>>>,
    refresh: bool,
}

impl VoteTable {
    pub fn new(model_len: usize, refresh: bool) -> Self {
        Self {
            votes: vec![None; model_len],
            refresh,
        }
    }

    pub fn record(&mut self, model_index: usize, vote: Vector2<f32>) {
        if let Some(slot) = self.votes.get_mut(model_index) {
            if self.refresh || slot.is_none() {
                *slot = Some(vote);
            }
        }
    }

    pub fn get(&self, model_index: usize) -> Option<Vector2<f32>> {
        self.votes.get(model_index).copied().flatten()
    }

    pub fn refresh(&self) -> bool {
        self.refresh
    }

    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    pub fn clear(&mut self) {
        self.votes.fill(None);
    }
}

/// Axis-aligned rectangle around `points`: top-left, top-right, bottom-right, bottom-left
pub fn enclosing_box(points: &[Point2f]) -> Option<[Point2f; 4]> {
    let first = points.first()?;
    let (mut min, mut max) = (first.coords, first.coords);
    for p in &points[1..] {
        min = min.inf(&p.coords);
        max = max.sup(&p.coords);
    }
    Some([
        Point2f::new(min.x, min.y),
        Point2f::new(max.x, min.y),
        Point2f::new(max.x, max.y),
        Point2f::new(min.x, max.y),
    ])
}
