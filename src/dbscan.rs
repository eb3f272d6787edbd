//! # Density-Based Clustering
//!
//! DBSCAN over (latitude, longitude) pairs with a planar Euclidean metric in
//! degrees. Radii come from [`crate::geo_utils::epsilon_degrees`].
//!
//! ## Conventions
//! - A neighborhood is inclusive (`distance <= eps`) and counts the point itself.
//! - Points are scanned in input order; clusters are numbered in order of
//!   discovery, so identical input yields identical labels.
//! - A border point belongs to the first cluster that reaches it.
//! - Invalid coordinates are always [`Label::Noise`].

use std::collections::VecDeque;

use rstar::primitives::GeomWithData;
use rstar::RTree;

use crate::GpsPoint;

/// Cluster assignment of one input point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Label {
    Cluster(usize),
    Noise,
}

impl Label {
    pub fn is_noise(&self) -> bool {
        matches!(self, Label::Noise)
    }
}

type IndexedPoint = GeomWithData<[f64; 2], usize>;

/// Run DBSCAN and return one label per input point.
///
/// `min_samples` of 0 behaves like 1 (every point is a core point).
///
/// # Example
/// ```
/// use building_matcher::{GpsPoint, Label, dbscan};
///
/// let points = vec![
///     GpsPoint::new(42.3500, -71.0600),
///     GpsPoint::new(42.3501, -71.0600),
///     GpsPoint::new(42.4000, -71.0600),
/// ];
/// let labels = dbscan(&points, 0.001, 2);
/// assert_eq!(labels, vec![Label::Cluster(0), Label::Cluster(0), Label::Noise]);
/// ```
pub fn dbscan(points: &[GpsPoint], eps: f64, min_samples: usize) -> Vec<Label> {
    let min_samples = min_samples.max(1);
    let eps_2 = eps * eps;

    let indexed: Vec<IndexedPoint> = points
        .iter()
        .enumerate()
        .filter(|(_, p)| p.is_valid())
        .map(|(i, p)| GeomWithData::new(p.as_array(), i))
        .collect();
    let tree = RTree::bulk_load(indexed);

    let region = |i: usize| -> Vec<usize> {
        let mut found: Vec<usize> = tree
            .locate_within_distance(points[i].as_array(), eps_2)
            .map(|p| p.data)
            .collect();
        found.sort_unstable();
        found
    };

    let mut labels: Vec<Option<Label>> = vec![None; points.len()];
    let mut next_cluster = 0;

    for i in 0..points.len() {
        if labels[i].is_some() {
            continue;
        }
        if !points[i].is_valid() {
            labels[i] = Some(Label::Noise);
            continue;
        }

        let neighbors = region(i);
        if neighbors.len() < min_samples {
            // May still become a border point of a later cluster
            labels[i] = Some(Label::Noise);
            continue;
        }

        let cluster = Label::Cluster(next_cluster);
        next_cluster += 1;
        labels[i] = Some(cluster);

        let mut queued = vec![false; points.len()];
        queued[i] = true;
        let mut queue: VecDeque<usize> = VecDeque::new();
        for n in neighbors {
            if !queued[n] {
                queued[n] = true;
                queue.push_back(n);
            }
        }

        while let Some(j) = queue.pop_front() {
            match labels[j] {
                Some(Label::Cluster(_)) => continue,
                Some(Label::Noise) => {
                    // Border point: visited before and known not to be core
                    labels[j] = Some(cluster);
                    continue;
                }
                None => labels[j] = Some(cluster),
            }

            let expansion = region(j);
            if expansion.len() >= min_samples {
                for n in expansion {
                    if !queued[n] {
                        queued[n] = true;
                        queue.push_back(n);
                    }
                }
            }
        }
    }

    labels.into_iter().map(|l| l.unwrap_or(Label::Noise)).collect()
}

/// Number of distinct labels, counting noise as one label when present.
pub fn distinct_labels(labels: &[Label]) -> usize {
    let mut seen: Vec<Label> = labels.to_vec();
    seen.sort_unstable();
    seen.dedup();
    seen.len()
}
