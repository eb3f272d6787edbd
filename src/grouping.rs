//! # Phase 1: Host×License Grouping
//!
//! Splits every host×license group into suspected physical sub-groups.
//!
//! ## Algorithm
//! 1. Order hosts by listing count (descending, ties by host id)
//! 2. Within a host, visit licenses in first-appearance order and give each
//!    host×license group a sequence number starting at 1
//! 3. Groups with a single listing become one cluster
//! 4. Larger groups run DBSCAN; if it finds more than one label the labels are
//!    kept (outliers stay together as the noise cluster), otherwise the whole
//!    group is one cluster ("pre-clustered")

use std::collections::HashMap;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::config::ClusterConfig;
use crate::dbscan::{dbscan, distinct_labels, Label};
use crate::geo_utils::{compute_center, epsilon_degrees};
use crate::model::{ClusterGroup, ClusterId, Listing, LocalClass, SubGroupId};
use crate::GpsPoint;

/// Audit counts for phase 1.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseOneStats {
    /// Host×license groups seen.
    pub groups: usize,
    /// Groups with a single listing.
    pub single_listing: usize,
    /// Multi-listing groups that came out as one cluster.
    pub pre_clustered: usize,
    /// Multi-listing groups split into several clusters.
    pub exploded: usize,
    /// Clusters created by splitting.
    pub created: usize,
    /// Phase-1 clusters in total.
    pub clusters: usize,
}

/// Output of phase 1.
#[derive(Debug, Clone)]
pub struct PhaseOneResult {
    pub groups: Vec<ClusterGroup>,
    /// Sub-group of every listing, indexed like the input slice.
    pub assignments: Vec<SubGroupId>,
    /// Host ids in processing order.
    pub host_order: Vec<String>,
    pub stats: PhaseOneStats,
}

/// How one host×license group was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupKind {
    Single,
    PreClustered,
    Exploded(usize),
}

/// Members and local classes of one host×license group.
#[derive(Debug, Clone)]
struct LicenseGroup {
    members: Vec<usize>,
    classes: Vec<LocalClass>,
    kind: GroupKind,
}

/// Hosts ordered by listing count (descending, ties by id), with the indices
/// of their listings in input order.
pub(crate) fn hosts_by_size(listings: &[Listing]) -> Vec<(String, Vec<usize>)> {
    let mut by_host: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, listing) in listings.iter().enumerate() {
        by_host.entry(listing.host_id.as_str()).or_default().push(i);
    }

    let mut hosts: Vec<(String, Vec<usize>)> = by_host
        .into_iter()
        .map(|(host, members)| (host.to_string(), members))
        .collect();
    hosts.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(&b.0)));
    hosts
}

/// Split a host's listings by license, keeping first-appearance order.
fn license_buckets(listings: &[Listing], members: &[usize]) -> Vec<Vec<usize>> {
    let mut order: Vec<&str> = Vec::new();
    let mut buckets: HashMap<&str, Vec<usize>> = HashMap::new();
    for &i in members {
        let license = listings[i].license.as_str();
        let bucket = buckets.entry(license).or_insert_with(|| {
            order.push(license);
            Vec::new()
        });
        bucket.push(i);
    }
    order
        .into_iter()
        .filter_map(|license| buckets.remove(license))
        .collect()
}

fn classify_group(
    listings: &[Listing],
    members: Vec<usize>,
    eps: f64,
    min_samples: usize,
) -> LicenseGroup {
    if members.len() < 2 {
        let classes = vec![LocalClass::Class(0); members.len()];
        return LicenseGroup { members, classes, kind: GroupKind::Single };
    }

    let points: Vec<GpsPoint> = members.iter().map(|&i| listings[i].point()).collect();
    let labels = dbscan(&points, eps, min_samples);
    let n_labels = distinct_labels(&labels);

    if n_labels > 1 {
        let classes = labels
            .iter()
            .map(|label| match label {
                Label::Cluster(c) => LocalClass::Class(*c as u32),
                Label::Noise => LocalClass::Noise,
            })
            .collect();
        LicenseGroup { members, classes, kind: GroupKind::Exploded(n_labels) }
    } else {
        let classes = vec![LocalClass::Class(0); members.len()];
        LicenseGroup { members, classes, kind: GroupKind::PreClustered }
    }
}

fn cluster_host(
    listings: &[Listing],
    members: &[usize],
    eps: f64,
    min_samples: usize,
) -> Vec<LicenseGroup> {
    license_buckets(listings, members)
        .into_iter()
        .map(|bucket| classify_group(listings, bucket, eps, min_samples))
        .collect()
}

/// Run phase 1 over all listings.
///
/// Every listing receives exactly one [`SubGroupId`]; nothing is dropped.
pub fn group_listings(listings: &[Listing], config: &ClusterConfig) -> PhaseOneResult {
    let eps = epsilon_degrees(config.phase1.epsilon_ft);
    let min_samples = config.phase1.min_samples;
    let hosts = hosts_by_size(listings);

    info!(
        "[Phase1] Running DBSCAN on {} listings ({} hosts), eps={} ({} ft), min_samples={}",
        listings.len(),
        hosts.len(),
        eps,
        config.phase1.epsilon_ft,
        min_samples
    );

    #[cfg(feature = "parallel")]
    let per_host: Vec<Vec<LicenseGroup>> = {
        use rayon::prelude::*;
        hosts
            .par_iter()
            .map(|(_, members)| cluster_host(listings, members, eps, min_samples))
            .collect()
    };

    #[cfg(not(feature = "parallel"))]
    let per_host: Vec<Vec<LicenseGroup>> = hosts
        .iter()
        .map(|(_, members)| cluster_host(listings, members, eps, min_samples))
        .collect();

    // Numbering is sequential regardless of how the groups were computed
    let mut stats = PhaseOneStats::default();
    let mut groups: Vec<ClusterGroup> = Vec::new();
    let mut assignments: Vec<Option<SubGroupId>> = vec![None; listings.len()];
    let mut group_seq: u32 = 1;

    for ((host_id, _), license_groups) in hosts.iter().zip(per_host) {
        for license_group in license_groups {
            stats.groups += 1;
            match license_group.kind {
                GroupKind::Single => stats.single_listing += 1,
                GroupKind::PreClustered => stats.pre_clustered += 1,
                GroupKind::Exploded(n) => {
                    stats.exploded += 1;
                    stats.created += n;
                }
            }

            let mut class_order: Vec<LocalClass> = Vec::new();
            let mut class_members: HashMap<LocalClass, Vec<usize>> = HashMap::new();
            for (&i, &class) in license_group.members.iter().zip(&license_group.classes) {
                class_members
                    .entry(class)
                    .or_insert_with(|| {
                        class_order.push(class);
                        Vec::new()
                    })
                    .push(i);
                assignments[i] = Some(SubGroupId::new(group_seq, class));
            }

            for class in class_order {
                let members = class_members.remove(&class).unwrap_or_default();
                let points: Vec<GpsPoint> = members.iter().map(|&i| listings[i].point()).collect();
                groups.push(ClusterGroup {
                    id: ClusterId::SubGroup(SubGroupId::new(group_seq, class)),
                    host_id: host_id.clone(),
                    center: compute_center(&points),
                    members,
                });
            }

            group_seq += 1;
        }
        debug!("[Phase1] host {} -> {} groups so far", host_id, groups.len());
    }

    stats.clusters = groups.len();

    let shared = listings.iter().filter(|l| !l.other_hosts.is_empty()).count();
    if shared > 0 {
        info!("[Phase1] {} listings use a license shared with other hosts", shared);
    }
    info!(
        "[Phase1] {} host-license groups: {} single-listing, {} pre-clustered, {} split into {} clusters",
        stats.groups, stats.single_listing, stats.pre_clustered, stats.exploded, stats.created
    );
    info!("[Phase1] {} clusters identified", stats.clusters);

    PhaseOneResult {
        groups,
        // Every index belongs to exactly one host bucket and one license bucket
        assignments: assignments.into_iter().flatten().collect(),
        host_order: hosts.into_iter().map(|(host, _)| host).collect(),
        stats,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(id: &str, host: &str, license: &str, lat: f64, lng: f64) -> Listing {
        Listing::new(id, host, license, lat, lng)
    }

    #[test]
    fn test_single_listing_group() {
        let listings = vec![listing("1", "h", "A", 42.35, -71.06)];
        let result = group_listings(&listings, &ClusterConfig::default());

        assert_eq!(result.groups.len(), 1);
        assert_eq!(result.assignments, vec![SubGroupId::new(1, LocalClass::Class(0))]);
        assert_eq!(result.stats.single_listing, 1);
        assert_eq!(result.assignments[0].to_string(), "1.1");
    }

    #[test]
    fn test_licenses_are_clustered_separately() {
        // Same spot, two licenses: never combined in phase 1
        let listings = vec![
            listing("1", "h", "A", 42.35, -71.06),
            listing("2", "h", "A", 42.35, -71.06),
            listing("3", "h", "B", 42.35, -71.06),
            listing("4", "h", "B", 42.35, -71.06),
        ];
        let result = group_listings(&listings, &ClusterConfig::default());

        assert_eq!(result.groups.len(), 2);
        assert_eq!(result.stats.pre_clustered, 2);
        assert_eq!(result.assignments[0], result.assignments[1]);
        assert_ne!(result.assignments[1], result.assignments[2]);
    }

    #[test]
    fn test_group_split_keeps_noise_cluster() {
        // Two tight pairs ~4,000 ft apart plus a lone outlier further out
        let listings = vec![
            listing("1", "h", "A", 42.3500, -71.0600),
            listing("2", "h", "A", 42.3500, -71.0601),
            listing("3", "h", "A", 42.3610, -71.0600),
            listing("4", "h", "A", 42.3610, -71.0601),
            listing("5", "h", "A", 42.3800, -71.0600),
        ];
        let result = group_listings(&listings, &ClusterConfig::default());

        assert_eq!(result.stats.exploded, 1);
        assert_eq!(result.stats.created, 3);
        assert_eq!(result.groups.len(), 3);
        assert_eq!(result.assignments[4].class, LocalClass::Noise);
        assert_eq!(result.assignments[4].to_string(), "1.0");
        assert_eq!(result.assignments[0].to_string(), "1.1");
        assert_eq!(result.assignments[2].to_string(), "1.2");
    }

    #[test]
    fn test_all_noise_group_is_one_cluster() {
        let listings = vec![
            listing("1", "h", "A", 42.35, -71.06),
            listing("2", "h", "A", 42.40, -71.06),
        ];
        let result = group_listings(&listings, &ClusterConfig::default());
        assert_eq!(result.groups.len(), 1);
        assert_eq!(result.stats.pre_clustered, 1);
    }

    #[test]
    fn test_group_sequence_is_global_and_hosts_ordered_by_size() {
        let listings = vec![
            listing("1", "small", "A", 42.35, -71.06),
            listing("2", "big", "A", 42.36, -71.06),
            listing("3", "big", "B", 42.36, -71.06),
        ];
        let result = group_listings(&listings, &ClusterConfig::default());

        assert_eq!(result.host_order, vec!["big".to_string(), "small".to_string()]);
        assert_eq!(result.assignments[1].group, 1);
        assert_eq!(result.assignments[2].group, 2);
        assert_eq!(result.assignments[0].group, 3);
    }

    #[test]
    fn test_every_listing_assigned_once() {
        let listings: Vec<Listing> = (0..20)
            .map(|i| {
                let host = format!("h{}", i % 3);
                let license = format!("L{}", i % 2);
                listing(&i.to_string(), &host, &license, 42.35 + i as f64 * 0.001, -71.06)
            })
            .collect();
        let result = group_listings(&listings, &ClusterConfig::default());

        assert_eq!(result.assignments.len(), listings.len());
        let total: usize = result.groups.iter().map(|g| g.listing_count()).sum();
        assert_eq!(total, listings.len());
    }
}
