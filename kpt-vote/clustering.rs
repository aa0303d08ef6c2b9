use kpt_core::Point2f;
use rayon::prelude::*;

/// Candidate sets at least this large compute their neighbourhoods in parallel
const PARALLEL_THRESHOLD: usize = 256;

/// Density-based clustering (DBSCAN) of image points.
///
/// A point with at least `min_points` neighbours within `eps` (itself included)
/// is a core point; clusters grow from core points through their neighbourhoods.
/// Returns one label per input, `None` for noise.
pub fn dbscan(points: &[Point2f], eps: f32, min_points: usize) -> Vec<Option<usize>> {
    let n = points.len();
    let neighbours = neighbourhoods(points, eps);

    let mut labels: Vec<Option<usize>> = vec![None; n];
    let mut visited = vec![false; n];
    let mut queue = Vec::new();
    let mut cluster = 0;

    for i in 0..n {
        if visited[i] {
            continue;
        }
        visited[i] = true;
        if neighbours[i].len() < min_points {
            continue;
        }

        labels[i] = Some(cluster);
        queue.clear();
        queue.extend_from_slice(&neighbours[i]);

        while let Some(j) = queue.pop() {
            if labels[j].is_none() {
                labels[j] = Some(cluster);
            }
            if visited[j] {
                continue;
            }
            visited[j] = true;
            if neighbours[j].len() >= min_points {
                queue.extend_from_slice(&neighbours[j]);
            }
        }
        cluster += 1;
    }

    labels
}

fn neighbourhoods(points: &[Point2f], eps: f32) -> Vec<Vec<usize>> {
    let eps_sq = eps * eps;
    let within = |p: &Point2f| -> Vec<usize> {
        points
            .iter()
            .enumerate()
            .filter(|(_, q)| (p - *q).norm_squared() <= eps_sq)
            .map(|(j, _)| j)
            .collect()
    };

    if points.len() >= PARALLEL_THRESHOLD {
        points.par_iter().map(within).collect()
    } else {
        points.iter().map(within).collect()
    }
}

/// Label and size of the most populated cluster
pub fn largest_cluster(labels: &[Option<usize>]) -> Option<(usize, usize)> {
    let clusters = labels.iter().flatten().max().map(|&c| c + 1)?;
    let mut sizes = vec![0usize; clusters];
    for &label in labels.iter().flatten() {
        sizes[label] += 1;
    }
    sizes
        .iter()
        .enumerate()
        // Ties go to the lowest label
        .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(&a.0)))
        .map(|(label, &size)| (label, size))
}
