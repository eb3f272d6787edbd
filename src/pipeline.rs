//! # Clustering Pipeline
//!
//! Runs every phase in order over one listing snapshot:
//!
//! 1. Validate the configuration
//! 2. Phase 1 (host×license DBSCAN), then validate
//! 3. Aggregate phase-1 clusters
//! 4. Static host indices from the identity cache
//! 5. Each merge phase, then validate; after the last one, canonical ids from
//!    the identity cache, then validate again
//! 6. Aggregate final clusters and their radial spread
//! 7. Persist the identity and aggregate caches
//!
//! Any consistency failure aborts the run before caches are written.

use std::collections::HashMap;

use log::info;
use serde::{Deserialize, Serialize};

use crate::centroid::{aggregate_clusters, AggregateCache, Centroid, FingerprintKind};
use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use crate::grouping::{group_listings, PhaseOneStats};
use crate::identity::{FoundCluster, IdentityCache, Recognition, RecognitionStats};
use crate::merge::{merge_phase, validate_phase, MergeStats};
use crate::model::{ClusterGroup, ClusterId, Listing, ListingAssignment, MergedClusterId};
use crate::radial::radial_stats;
use crate::store::KvStore;

/// Store key of the phase-1 centroid memo.
pub const PHASE1_AGGREGATE_KEY: &str = "aggregate_phase1";
/// Store key of the final centroid memo.
pub const FINAL_AGGREGATE_KEY: &str = "aggregate_final";

/// Everything one run produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterRun {
    /// One record per listing, sorted by listing id.
    pub assignments: Vec<ListingAssignment>,
    /// Final clusters, largest first.
    pub centroids: Vec<Centroid>,
    /// Phase-1 clusters, largest first.
    pub phase_one_centroids: Vec<Centroid>,
    pub phase_one: PhaseOneStats,
    pub merges: Vec<MergeStats>,
    pub recognition: RecognitionStats,
}

impl ClusterRun {
    /// Assignment of a listing by id.
    pub fn assignment(&self, listing_id: &str) -> Option<&ListingAssignment> {
        self.assignments
            .binary_search_by(|a| a.listing_id.as_str().cmp(listing_id))
            .ok()
            .map(|i| &self.assignments[i])
    }

    /// Final cluster id of a listing.
    pub fn final_id(&self, listing_id: &str) -> Option<MergedClusterId> {
        self.assignment(listing_id).and_then(|a| a.final_id)
    }
}

fn merged_id(group: &ClusterGroup) -> Result<MergedClusterId> {
    match group.id {
        ClusterId::Merged(id) => Ok(id),
        ClusterId::SubGroup(id) => Err(ClusterError::consistency(
            "recognition",
            format!("cluster {id} was never merged"),
        )),
    }
}

/// Run the full pipeline.
///
/// `store` holds the identity cache and the centroid memos; pass a fresh
/// [`crate::MemoryStore`] for a run without history.
pub fn run_pipeline<S: KvStore + ?Sized>(
    listings: &[Listing],
    config: &ClusterConfig,
    store: &mut S,
) -> Result<ClusterRun> {
    config.validate()?;
    info!(
        "[Pipeline] Clustering {} listings with {} merge phases",
        listings.len(),
        config.phase_count()
    );

    // Phase 1
    let phase_one = group_listings(listings, config);
    let mut ids: Vec<Option<ClusterId>> = phase_one
        .assignments
        .iter()
        .map(|sub| Some(ClusterId::from(*sub)))
        .collect();
    validate_phase("phase 1", listings, &ids, &phase_one.groups)?;

    let mut assignments: Vec<ListingAssignment> = listings
        .iter()
        .zip(&phase_one.assignments)
        .map(|(listing, sub)| {
            let mut assignment = ListingAssignment::new(listing);
            assignment.phase1 = Some(*sub);
            assignment
        })
        .collect();

    let mut phase1_cache = AggregateCache::load(&*store, PHASE1_AGGREGATE_KEY)?;
    let phase_one_centroids = aggregate_clusters(
        &phase_one.groups,
        listings,
        FingerprintKind::HostCount,
        &mut phase1_cache,
    );

    // Static host indices
    let mut identity = IdentityCache::load(&*store)?;
    let host_indices: HashMap<String, u32> = phase_one
        .host_order
        .iter()
        .map(|host| (host.clone(), identity.static_index_for(host)))
        .collect();

    // Merge phases
    let mut groups = phase_one.groups;
    let mut merges = Vec::with_capacity(config.phase_count());
    for (i, params) in config.merge_phases.iter().enumerate() {
        let phase = i + 1;
        let outcome = merge_phase(
            phase,
            &groups,
            listings,
            &phase_one.host_order,
            &host_indices,
            params,
            config.super_cluster_min_listings,
        )?;

        for (id, assignment) in ids.iter_mut().zip(assignments.iter_mut()) {
            let next = (*id).and_then(|prior| outcome.parent_of.get(&prior).copied());
            if let Some(next) = next {
                assignment.layers.push(next);
            }
            *id = next.map(ClusterId::from);
        }
        validate_phase(&format!("merge phase {phase}"), listings, &ids, &outcome.groups)?;

        merges.push(outcome.stats);
        groups = outcome.groups;
    }

    // Canonical ids
    let mut recognition = RecognitionStats::default();
    let mut canonical: HashMap<MergedClusterId, Recognition> = HashMap::new();
    for host in &phase_one.host_order {
        let host_index = host_indices[host];
        let found: Vec<FoundCluster> = groups
            .iter()
            .filter(|g| &g.host_id == host)
            .map(|g| -> Result<FoundCluster> {
                Ok(FoundCluster {
                    provisional: merged_id(g)?,
                    center: g.center,
                    n_listings: g.listing_count(),
                })
            })
            .collect::<Result<_>>()?;
        if found.is_empty() {
            continue;
        }

        let recognitions = identity.recognize(host_index, &found, config)?;
        recognition.record(&recognitions);
        canonical.extend(recognitions.into_iter().map(|r| (r.provisional, r)));
    }

    for group in &mut groups {
        let provisional = merged_id(group)?;
        let r = canonical.get(&provisional).ok_or_else(|| {
            ClusterError::consistency("recognition", format!("cluster {provisional} has no canonical id"))
        })?;
        group.id = r.canonical.into();
    }

    for (id, assignment) in ids.iter_mut().zip(assignments.iter_mut()) {
        let r = match *id {
            Some(ClusterId::Merged(provisional)) => canonical.get(&provisional),
            _ => None,
        };
        *id = r.map(|r| ClusterId::from(r.canonical));
        if let Some(r) = r {
            assignment.final_id = Some(r.canonical);
            assignment.recognized = r.recognized;
            assignment.change_n_listings = r.change_n_listings;
            assignment.change_pct_listings = r.change_pct_listings;
        }
    }
    validate_phase("recognition", listings, &ids, &groups)?;
    info!(
        "[Identity] {} of {} clusters recognized, {} new ids",
        recognition.recognized, recognition.clusters, recognition.new_ids
    );

    // Final aggregation and radial spread
    let mut final_cache = AggregateCache::load(&*store, FINAL_AGGREGATE_KEY)?;
    let mut centroids = aggregate_clusters(
        &groups,
        listings,
        FingerprintKind::LicenseCounts,
        &mut final_cache,
    );

    let mut spread = HashMap::with_capacity(groups.len());
    for group in &groups {
        let (distances, stats) = radial_stats(group, listings);
        for (&m, distance) in group.members.iter().zip(distances) {
            assignments[m].distance_ft = distance.is_finite().then_some(distance);
        }
        spread.insert(group.id, stats);
    }
    for centroid in &mut centroids {
        centroid.radial = spread.get(&centroid.cluster_id).copied();
    }

    identity.save(store)?;
    phase1_cache.save(store, PHASE1_AGGREGATE_KEY)?;
    final_cache.save(store, FINAL_AGGREGATE_KEY)?;

    assignments.sort_by(|a, b| a.listing_id.cmp(&b.listing_id));
    info!(
        "[Pipeline] {} listings in {} final clusters",
        assignments.len(),
        centroids.len()
    );

    Ok(ClusterRun {
        assignments,
        centroids,
        phase_one_centroids,
        phase_one: phase_one.stats,
        merges,
        recognition,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MergePhaseParams;
    use crate::store::{JsonDirStore, MemoryStore, TypedStore};

    /// `n` listings of one host within ~30 ft, first half under license A.
    fn building(host: &str, n: usize, lat: f64) -> Vec<Listing> {
        (0..n)
            .map(|i| {
                let license = if i < n / 2 { "A" } else { "B" };
                Listing::new(
                    format!("{host}-{i:02}"),
                    host,
                    license,
                    lat + (i % 3) as f64 * 0.00002,
                    -71.0600 + (i % 4) as f64 * 0.00002,
                )
            })
            .collect()
    }

    fn scenario_a() -> Vec<Listing> {
        let mut listings: Vec<Listing> = (0..4)
            .map(|i| Listing::new(format!("a{i}"), "h", "A", 42.3500 + i as f64 * 0.00002, -71.0600))
            .collect();
        // ~2,000 ft north
        listings.push(Listing::new("b0", "h", "B", 42.3555, -71.0600));
        listings
    }

    fn final_ids(run: &ClusterRun) -> Vec<String> {
        run.assignments
            .iter()
            .map(|a| a.final_id.map(|id| id.to_string()).unwrap_or_default())
            .collect()
    }

    #[test]
    fn test_separate_buildings_stay_separate() {
        let listings = scenario_a();
        let run = run_pipeline(&listings, &ClusterConfig::default(), &mut MemoryStore::new()).unwrap();

        assert_eq!(run.centroids.len(), 2);
        assert_eq!(run.centroids[0].count_listings, 4);
        assert_eq!(run.final_id("a0").map(|id| id.to_string()).as_deref(), Some("1-1"));
        assert_eq!(run.final_id("b0").map(|id| id.to_string()).as_deref(), Some("1-2"));
        assert_eq!(run.phase_one.groups, 2);
        assert_eq!(run.merges.len(), 1);
    }

    #[test]
    fn test_every_listing_has_one_final_cluster() {
        let mut listings = building("big", 14, 42.35);
        listings.extend(building("mid", 6, 42.36));
        listings.extend(scenario_a());

        let run = run_pipeline(&listings, &ClusterConfig::default(), &mut MemoryStore::new()).unwrap();

        assert_eq!(run.assignments.len(), listings.len());
        assert!(run.assignments.iter().all(|a| a.final_id.is_some()));
        assert!(run.assignments.iter().all(|a| a.distance_ft.is_some()));
        let total: usize = run.centroids.iter().map(|c| c.count_listings).sum();
        assert_eq!(total, listings.len());

        for host in ["big", "mid", "h"] {
            let host_total: usize = run
                .centroids
                .iter()
                .filter(|c| c.host_id == host)
                .map(|c| c.count_listings)
                .sum();
            let expected = listings.iter().filter(|l| l.host_id == host).count();
            assert_eq!(host_total, expected);
        }
    }

    #[test]
    fn test_super_cluster_threshold() {
        let listings = building("h", 12, 42.35);

        let config = ClusterConfig {
            super_cluster_min_listings: 13,
            ..ClusterConfig::default()
        };
        let run = run_pipeline(&listings, &config, &mut MemoryStore::new()).unwrap();
        assert_eq!(run.centroids.len(), 1);
        assert_eq!(run.centroids[0].cluster_id.to_string(), "1-1");

        let config = ClusterConfig {
            super_cluster_min_listings: 10,
            ..ClusterConfig::default()
        };
        let run = run_pipeline(&listings, &config, &mut MemoryStore::new()).unwrap();
        let mut ids: Vec<String> = run.centroids.iter().map(|c| c.cluster_id.to_string()).collect();
        ids.sort();
        assert_eq!(ids, vec!["1-1s", "1-2s"]);
    }

    #[test]
    fn test_super_cluster_threshold_nine_and_eleven() {
        let config = ClusterConfig::default();

        let run = run_pipeline(&building("h", 9, 42.35), &config, &mut MemoryStore::new()).unwrap();
        assert_eq!(run.centroids.len(), 1);
        assert!(!run.centroids[0].cluster_id.to_string().ends_with('s'));

        let run = run_pipeline(&building("h", 11, 42.35), &config, &mut MemoryStore::new()).unwrap();
        assert_eq!(run.centroids.len(), 2);
        assert!(run.centroids.iter().all(|c| c.cluster_id.to_string().ends_with('s')));
    }

    #[test]
    fn test_deterministic() {
        let mut listings = building("big", 14, 42.35);
        listings.extend(scenario_a());
        let config = ClusterConfig::default();

        let first = run_pipeline(&listings, &config, &mut MemoryStore::new()).unwrap();
        let second = run_pipeline(&listings, &config, &mut MemoryStore::new()).unwrap();
        assert_eq!(final_ids(&first), final_ids(&second));

        // Rerun against its own cache: everything is recognized
        let mut store = MemoryStore::new();
        let first = run_pipeline(&listings, &config, &mut store).unwrap();
        let second = run_pipeline(&listings, &config, &mut store).unwrap();
        assert_eq!(final_ids(&first), final_ids(&second));
        assert!(second.assignments.iter().all(|a| a.recognized));
        assert_eq!(second.recognition.new_ids, 0);
    }

    #[test]
    fn test_ids_survive_added_listing() {
        let config = ClusterConfig::default();
        let mut store = MemoryStore::new();
        let listings = scenario_a();
        let first = run_pipeline(&listings, &config, &mut store).unwrap();
        assert!(first.assignments.iter().all(|a| !a.recognized));

        let mut grown = listings.clone();
        grown.push(Listing::new("a9", "h", "A", 42.35001, -71.06001));
        let second = run_pipeline(&grown, &config, &mut store).unwrap();

        assert_eq!(second.final_id("a0"), first.final_id("a0"));
        assert_eq!(second.final_id("b0"), first.final_id("b0"));
        assert_eq!(second.final_id("a9"), first.final_id("a0"));

        let a0 = second.assignment("a0").unwrap();
        assert!(a0.recognized);
        assert_eq!(a0.change_n_listings, Some(-1));
    }

    #[test]
    fn test_invalid_listing_does_not_reset_other_hosts() {
        let config = ClusterConfig::default();
        let mut store = MemoryStore::new();
        let mut listings = scenario_a();
        listings.truncate(4);
        listings.push(Listing::new("x0", "other", "X", f64::NAN, -71.0600));

        let first = run_pipeline(&listings, &config, &mut store).unwrap();
        assert!(first.assignment("x0").unwrap().final_id.is_some());
        assert_eq!(first.assignment("x0").unwrap().distance_ft, None);

        let records: Option<serde_json::Value> = store.get("cluster_records").unwrap();
        assert!(records.is_some_and(|r| !r.to_string().contains("null")));

        let second = run_pipeline(&listings, &config, &mut store).unwrap();
        assert!(second.assignment("a0").unwrap().recognized);
        assert_eq!(second.final_id("a0"), first.final_id("a0"));
        assert_eq!(second.final_id("x0"), first.final_id("x0"));
        assert!(second.recognition.recognized >= 1);
    }

    #[test]
    fn test_host_index_is_stable_across_runs() {
        let config = ClusterConfig::default();
        let mut store = MemoryStore::new();
        run_pipeline(&building("first", 4, 42.35), &config, &mut store).unwrap();

        // A larger host arriving later gets the next index
        let mut listings = building("second", 8, 42.40);
        listings.extend(building("first", 4, 42.35));
        let run = run_pipeline(&listings, &config, &mut store).unwrap();

        assert_eq!(run.final_id("first-00").map(|id| id.host_index), Some(1));
        assert_eq!(run.final_id("second-00").map(|id| id.host_index), Some(2));
    }

    #[test]
    fn test_multiple_merge_phases() {
        let config = ClusterConfig {
            merge_phases: vec![
                MergePhaseParams { epsilon_ft: 300.0, min_samples: 1 },
                MergePhaseParams { epsilon_ft: 600.0, min_samples: 1 },
            ],
            ..ClusterConfig::default()
        };
        let run = run_pipeline(&scenario_a(), &config, &mut MemoryStore::new()).unwrap();

        assert_eq!(run.merges.len(), 2);
        assert!(run.assignments.iter().all(|a| a.layers.len() == 2));
        assert_eq!(run.centroids.len(), 2);
    }

    #[test]
    fn test_invalid_config_fails_before_clustering() {
        let config = ClusterConfig {
            merge_phases: Vec::new(),
            ..ClusterConfig::default()
        };
        let mut store = MemoryStore::new();
        let err = run_pipeline(&scenario_a(), &config, &mut store);

        assert!(matches!(err, Err(ClusterError::Config { .. })));
        assert!(store.is_empty());
    }

    #[test]
    fn test_radial_confidence_attached() {
        let run = run_pipeline(&scenario_a(), &ClusterConfig::default(), &mut MemoryStore::new()).unwrap();
        let labels: Vec<String> = run
            .centroids
            .iter()
            .map(|c| c.radial.map(|r| r.confidence.to_string()).unwrap_or_default())
            .collect();
        assert_eq!(labels, vec!["unknown (too close)", "unknown (too few)"]);
    }

    #[test]
    fn test_caches_persist_in_directory_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClusterConfig::default();
        let first = {
            let mut store = JsonDirStore::open(dir.path()).unwrap();
            run_pipeline(&scenario_a(), &config, &mut store).unwrap()
        };

        assert!(dir.path().join("host_index.json").is_file());
        assert!(dir.path().join("cluster_records.json").is_file());
        assert!(dir.path().join(format!("{FINAL_AGGREGATE_KEY}.json")).is_file());

        let mut store = JsonDirStore::open(dir.path()).unwrap();
        let second = run_pipeline(&scenario_a(), &config, &mut store).unwrap();
        assert_eq!(final_ids(&first), final_ids(&second));
        assert_eq!(second.recognition.recognized, 2);
    }
}
