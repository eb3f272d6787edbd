//! # Merge Phases
//!
//! Re-clusters the previous phase's clusters per host. Each prior cluster is
//! reduced to its mean position and DBSCAN runs over those centers, so
//! sub-groups under different licenses that sit in the same building come
//! back together.
//!
//! A merge-class whose combined listing count reaches
//! `super_cluster_min_listings` is *not* merged: each of its constituents is
//! kept as its own super-cluster (`"h-ns"`). Large clusters are usually
//! separate buildings that happen to be close.

use std::collections::{BTreeSet, HashMap};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::config::MergePhaseParams;
use crate::dbscan::{dbscan, Label};
use crate::error::{ClusterError, Result};
use crate::geo_utils::{compute_center, epsilon_degrees};
use crate::model::{ClusterGroup, ClusterId, Listing, MergedClusterId, SubIndex};
use crate::GpsPoint;

/// Audit counts for one merge phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeStats {
    /// 1-based phase number.
    pub phase: usize,
    /// Clusters coming into the phase.
    pub prior_clusters: usize,
    /// DBSCAN clusters plus singleton noise classes.
    pub merge_classes: usize,
    /// Hosts where at least two clusters were combined.
    pub hosts_combined: usize,
    /// Constituents kept separate as super-clusters.
    pub super_kept: usize,
    /// Constituents folded into a multi-cluster merge.
    pub merged_constituents: usize,
    /// Clusters coming out of the phase.
    pub clusters: usize,
}

/// Output of one merge phase.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub groups: Vec<ClusterGroup>,
    /// New id of every prior cluster.
    pub parent_of: HashMap<ClusterId, MergedClusterId>,
    pub stats: MergeStats,
}

/// Run one merge phase.
///
/// `host_order` fixes the order hosts are numbered in; `host_indices` holds the
/// static index of every host that owns a prior cluster.
pub fn merge_phase(
    phase: usize,
    prior: &[ClusterGroup],
    listings: &[Listing],
    host_order: &[String],
    host_indices: &HashMap<String, u32>,
    params: &MergePhaseParams,
    super_min: usize,
) -> Result<MergeOutcome> {
    let eps = epsilon_degrees(params.epsilon_ft);
    let phase_name = format!("merge phase {phase}");

    let mut by_host: HashMap<&str, Vec<&ClusterGroup>> = HashMap::new();
    for group in prior {
        by_host.entry(group.host_id.as_str()).or_default().push(group);
    }

    info!(
        "[Merge] Phase {}: {} clusters over {} hosts, eps={} ({} ft), super at {} listings",
        phase,
        prior.len(),
        by_host.len(),
        eps,
        params.epsilon_ft,
        super_min
    );

    let mut stats = MergeStats {
        phase,
        prior_clusters: prior.len(),
        ..Default::default()
    };
    let mut groups: Vec<ClusterGroup> = Vec::new();
    let mut parent_of: HashMap<ClusterId, MergedClusterId> = HashMap::new();

    for host_id in host_order {
        let Some(constituents) = by_host.remove(host_id.as_str()) else {
            continue;
        };
        let host_index = *host_indices.get(host_id).ok_or_else(|| {
            ClusterError::consistency(&phase_name, format!("host '{host_id}' has no static index"))
        })?;

        let centers: Vec<GpsPoint> = constituents.iter().map(|g| g.center).collect();
        let labels = dbscan(&centers, eps, params.min_samples);

        // Merge-classes in order of their first constituent; noise stands alone
        let mut class_of_label: HashMap<usize, usize> = HashMap::new();
        let mut classes: Vec<Vec<usize>> = Vec::new();
        for (i, label) in labels.iter().enumerate() {
            match label {
                Label::Cluster(c) => {
                    let class = *class_of_label.entry(*c).or_insert_with(|| {
                        classes.push(Vec::new());
                        classes.len() - 1
                    });
                    classes[class].push(i);
                }
                Label::Noise => classes.push(vec![i]),
            }
        }
        stats.merge_classes += classes.len();

        let mut next_merged = 1;
        let mut next_super = 1;
        let mut combined_here = false;

        for class in &classes {
            let total: usize = class.iter().map(|&i| constituents[i].listing_count()).sum();

            if total >= super_min {
                for &i in class {
                    let source = constituents[i];
                    let id = MergedClusterId::new(host_index, SubIndex::Super(next_super));
                    next_super += 1;
                    stats.super_kept += 1;
                    parent_of.insert(source.id, id);
                    groups.push(ClusterGroup {
                        id: id.into(),
                        host_id: host_id.clone(),
                        members: source.members.clone(),
                        center: source.center,
                    });
                }
                continue;
            }

            let id = MergedClusterId::new(host_index, SubIndex::Merged(next_merged));
            next_merged += 1;
            if class.len() > 1 {
                combined_here = true;
                stats.merged_constituents += class.len();
            }

            let mut members: Vec<usize> = Vec::with_capacity(total);
            for &i in class {
                parent_of.insert(constituents[i].id, id);
                members.extend_from_slice(&constituents[i].members);
            }
            members.sort_unstable();
            let points: Vec<GpsPoint> = members.iter().map(|&m| listings[m].point()).collect();

            groups.push(ClusterGroup {
                id: id.into(),
                host_id: host_id.clone(),
                center: compute_center(&points),
                members,
            });
        }

        if combined_here {
            stats.hosts_combined += 1;
        }
        debug!(
            "[Merge] host {} (index {}): {} clusters -> {} classes",
            host_id,
            host_index,
            constituents.len(),
            classes.len()
        );
    }

    if let Some(host) = by_host.keys().next() {
        return Err(ClusterError::consistency(
            &phase_name,
            format!("host '{host}' owns clusters but was not in the host order"),
        ));
    }

    stats.clusters = groups.len();
    info!(
        "[Merge] Phase {}: {} clusters -> {} ({} merged across {} hosts, {} kept as super-clusters)",
        phase,
        stats.prior_clusters,
        stats.clusters,
        stats.merged_constituents,
        stats.hosts_combined,
        stats.super_kept
    );

    Ok(MergeOutcome { groups, parent_of, stats })
}

/// Check that listings and clusters agree after a phase.
///
/// `ids[i]` is the id listing `i` carries. Fails when a listing has no id, when
/// a cluster lists a member carrying another id, or when the two id sets
/// differ.
pub fn validate_phase(
    phase: &str,
    listings: &[Listing],
    ids: &[Option<ClusterId>],
    groups: &[ClusterGroup],
) -> Result<()> {
    if ids.len() != listings.len() {
        return Err(ClusterError::consistency(
            phase,
            format!("{} ids for {} listings", ids.len(), listings.len()),
        ));
    }

    let mut listing_side: BTreeSet<ClusterId> = BTreeSet::new();
    for (listing, id) in listings.iter().zip(ids) {
        match id {
            Some(id) => {
                listing_side.insert(*id);
            }
            None => {
                return Err(ClusterError::consistency(
                    phase,
                    format!("listing {} has no cluster id", listing.id),
                ))
            }
        }
    }

    let mut cluster_side: BTreeSet<ClusterId> = BTreeSet::new();
    let mut member_total = 0;
    for group in groups {
        cluster_side.insert(group.id);
        member_total += group.members.len();
        for &m in &group.members {
            if ids.get(m).copied().flatten() != Some(group.id) {
                return Err(ClusterError::consistency(
                    phase,
                    format!("cluster {} lists a listing that carries another id", group.id),
                ));
            }
        }
    }

    if member_total != listings.len() {
        return Err(ClusterError::consistency(
            phase,
            format!("clusters hold {} listings, expected {}", member_total, listings.len()),
        ));
    }
    if listing_side != cluster_side {
        let missing = listing_side.symmetric_difference(&cluster_side).count();
        return Err(ClusterError::consistency(
            phase,
            format!("{missing} cluster ids differ between listings and clusters"),
        ));
    }

    Ok(())
}
