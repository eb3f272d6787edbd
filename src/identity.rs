//! # Cluster Identity Across Runs
//!
//! Keeps building ids stable between runs. Two records persist through the
//! key-value store:
//!
//! - `host_index`: host id → static host index (append-only, first index 1)
//! - `cluster_records`: static host index → sub index → `{center, n_listings}`
//!
//! After the last merge phase every freshly found cluster is compared with the
//! cached clusters of its host. A cached cluster of the same kind whose center
//! is within `recognition_distance_ft` and whose size changed by at most
//! `recognition_size_tolerance` hands its id over; anything else gets the
//! lowest free number.
//!
//! The size check is `|r| <= tolerance` with
//! `r = (cached_n - current_n) / current_n`. An unchanged cluster has `r = 0`,
//! so rerunning on the same listings hands every id back to itself.
//!
//! A cluster whose center is not a valid coordinate (all of its members lack
//! one) is never compared and never cached. It gets a fresh number each run.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use crate::geo_utils::geodesic_distance_ft;
use crate::model::{MergedClusterId, SubIndex};
use crate::store::{KvStore, TypedStore};
use crate::GpsPoint;

const HOST_INDEX_KEY: &str = "host_index";
const CLUSTER_RECORDS_KEY: &str = "cluster_records";

/// Cached position and size of one cluster.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub center: GpsPoint,
    pub n_listings: usize,
}

/// A cluster found in this run, before its id is made canonical.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FoundCluster {
    pub provisional: MergedClusterId,
    pub center: GpsPoint,
    pub n_listings: usize,
}

/// Canonical id of one found cluster.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Recognition {
    pub provisional: MergedClusterId,
    pub canonical: MergedClusterId,
    pub recognized: bool,
    /// Cached minus current listing count.
    pub change_n_listings: Option<i64>,
    /// `change_n_listings` relative to the current count.
    pub change_pct_listings: Option<f64>,
    /// Center drift in feet.
    pub distance_ft: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecognitionStats {
    pub hosts: usize,
    pub clusters: usize,
    pub recognized: usize,
    pub new_ids: usize,
}

impl RecognitionStats {
    pub fn record(&mut self, recognitions: &[Recognition]) {
        self.hosts += 1;
        self.clusters += recognitions.len();
        let recognized = recognitions.iter().filter(|r| r.recognized).count();
        self.recognized += recognized;
        self.new_ids += recognitions.len() - recognized;
    }
}

/// Host indices and per-host cluster records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdentityCache {
    host_index: BTreeMap<String, u32>,
    clusters: BTreeMap<u32, BTreeMap<SubIndex, ClusterRecord>>,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load both records. Missing or unreadable records start empty.
    pub fn load<S: KvStore + ?Sized>(store: &S) -> Result<Self> {
        let host_index: BTreeMap<String, u32> = match store.get(HOST_INDEX_KEY)? {
            Some(map) => map,
            None => {
                if store.exists(HOST_INDEX_KEY) {
                    warn!("[Identity] Host index unreadable, every cluster will get a new id");
                } else {
                    info!("[Identity] No host index cached, starting fresh");
                }
                BTreeMap::new()
            }
        };

        let mut clusters: BTreeMap<u32, BTreeMap<SubIndex, ClusterRecord>> =
            store.get(CLUSTER_RECORDS_KEY)?.unwrap_or_default();

        let known: BTreeSet<u32> = host_index.values().copied().collect();
        let before = clusters.len();
        clusters.retain(|index, _| known.contains(index));
        if clusters.len() != before {
            warn!(
                "[Identity] Dropped records of {} unknown host indices",
                before - clusters.len()
            );
        }

        info!(
            "[Identity] Loaded {} hosts, {} cluster records",
            host_index.len(),
            clusters.values().map(|r| r.len()).sum::<usize>()
        );
        Ok(Self { host_index, clusters })
    }

    pub fn save<S: KvStore + ?Sized>(&self, store: &mut S) -> Result<()> {
        store.put(HOST_INDEX_KEY, &self.host_index)?;
        store.put(CLUSTER_RECORDS_KEY, &self.clusters)?;
        Ok(())
    }

    /// Static index of a host, assigning `max + 1` on first sight.
    pub fn static_index_for(&mut self, host_id: &str) -> u32 {
        if let Some(&index) = self.host_index.get(host_id) {
            return index;
        }
        let index = self.host_index.values().max().map_or(1, |max| max + 1);
        self.host_index.insert(host_id.to_string(), index);
        debug!("[Identity] New host {} -> index {}", host_id, index);
        index
    }

    pub fn host_index(&self, host_id: &str) -> Option<u32> {
        self.host_index.get(host_id).copied()
    }

    pub fn records(&self, host_index: u32) -> Option<&BTreeMap<SubIndex, ClusterRecord>> {
        self.clusters.get(&host_index)
    }

    /// Assign canonical ids to one host's clusters and replace its records.
    ///
    /// Clusters are matched largest first. A cached record is claimed at most
    /// once; among several candidates the nearest wins, ties going to the
    /// lower sub index. Results come back in the order of `found`.
    pub fn recognize(
        &mut self,
        host_index: u32,
        found: &[FoundCluster],
        config: &ClusterConfig,
    ) -> Result<Vec<Recognition>> {
        let cached = self.clusters.remove(&host_index).unwrap_or_default();

        let mut order: Vec<usize> = (0..found.len()).collect();
        order.sort_by(|&a, &b| {
            found[b]
                .n_listings
                .cmp(&found[a].n_listings)
                .then_with(|| found[a].provisional.cmp(&found[b].provisional))
        });

        let mut claimed: BTreeSet<SubIndex> = BTreeSet::new();
        let mut assigned: BTreeSet<SubIndex> = BTreeSet::new();
        let mut results: Vec<Option<Recognition>> = vec![None; found.len()];

        for i in order {
            let current = &found[i];
            let kind = current.provisional.sub;

            let best = cached
                .iter()
                .filter(|_| current.center.is_valid())
                .filter(|(sub, _)| sub.is_super() == kind.is_super() && !claimed.contains(*sub))
                .filter_map(|(sub, record)| {
                    if current.n_listings == 0 {
                        return None;
                    }
                    let distance = geodesic_distance_ft(&current.center, &record.center);
                    let change = record.n_listings as i64 - current.n_listings as i64;
                    let pct = change as f64 / current.n_listings as f64;
                    let within = distance < config.recognition_distance_ft
                        && pct.abs() <= config.recognition_size_tolerance;
                    within.then_some((*sub, distance, change, pct))
                })
                // BTreeMap order makes the lower sub index win exact ties
                .min_by(|a, b| a.1.total_cmp(&b.1));

            let recognition = match best {
                Some((sub, distance, change, pct)) => {
                    claimed.insert(sub);
                    assigned.insert(sub);
                    Recognition {
                        provisional: current.provisional,
                        canonical: MergedClusterId::new(host_index, sub),
                        recognized: true,
                        change_n_listings: Some(change),
                        change_pct_listings: Some(pct),
                        distance_ft: Some(distance),
                    }
                }
                None => {
                    let sub = (1..=config.max_clusters_per_host)
                        .map(|n| kind.with_number(n))
                        .find(|sub| !cached.contains_key(sub) && !assigned.contains(sub))
                        .ok_or(ClusterError::IdentityRangeExhausted {
                            host_index,
                            cap: config.max_clusters_per_host,
                        })?;
                    assigned.insert(sub);
                    Recognition {
                        provisional: current.provisional,
                        canonical: MergedClusterId::new(host_index, sub),
                        recognized: false,
                        change_n_listings: None,
                        change_pct_listings: None,
                        distance_ft: None,
                    }
                }
            };
            results[i] = Some(recognition);
        }

        let results: Vec<Recognition> = results.into_iter().flatten().collect();

        let records: BTreeMap<SubIndex, ClusterRecord> = results
            .iter()
            .zip(found)
            .filter(|(_, f)| f.center.is_valid())
            .map(|(r, f)| {
                (
                    r.canonical.sub,
                    ClusterRecord {
                        center: f.center,
                        n_listings: f.n_listings,
                    },
                )
            })
            .collect();
        if !records.is_empty() {
            self.clusters.insert(host_index, records);
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn found(sub: SubIndex, lat: f64, n: usize) -> FoundCluster {
        FoundCluster {
            provisional: MergedClusterId::new(1, sub),
            center: GpsPoint::new(lat, -71.06),
            n_listings: n,
        }
    }

    /// ~1 ft of latitude near Boston.
    const FOOT: f64 = 2.747e-6;

    #[test]
    fn test_static_index_is_append_only() {
        let mut cache = IdentityCache::new();
        assert_eq!(cache.static_index_for("a"), 1);
        assert_eq!(cache.static_index_for("b"), 2);
        assert_eq!(cache.static_index_for("a"), 1);
        assert_eq!(cache.host_index("b"), Some(2));
    }

    #[test]
    fn test_first_run_assigns_lowest_numbers() {
        let mut cache = IdentityCache::new();
        let config = ClusterConfig::default();
        let run = vec![
            found(SubIndex::Merged(1), 42.35, 3),
            found(SubIndex::Merged(2), 42.36, 5),
            found(SubIndex::Super(1), 42.37, 12),
        ];
        let result = cache.recognize(1, &run, &config).unwrap();

        assert!(result.iter().all(|r| !r.recognized));
        // Largest plain cluster is numbered first
        assert_eq!(result[1].canonical.to_string(), "1-1");
        assert_eq!(result[0].canonical.to_string(), "1-2");
        assert_eq!(result[2].canonical.to_string(), "1-1s");
        assert_eq!(cache.records(1).map(|r| r.len()), Some(3));
    }

    #[test]
    fn test_recognizes_moved_cluster() {
        let mut cache = IdentityCache::new();
        let config = ClusterConfig::default();
        cache
            .recognize(1, &[found(SubIndex::Merged(1), 42.35, 4), found(SubIndex::Merged(2), 42.36, 4)], &config)
            .unwrap();

        // Provisional numbers swapped, first cluster drifted 50 ft and grew by one
        let next = vec![
            found(SubIndex::Merged(1), 42.36, 4),
            found(SubIndex::Merged(2), 42.35 + 50.0 * FOOT, 5),
        ];
        let result = cache.recognize(1, &next, &config).unwrap();

        assert!(result.iter().all(|r| r.recognized));
        assert_eq!(result[0].canonical.sub, SubIndex::Merged(2));
        assert_eq!(result[1].canonical.sub, SubIndex::Merged(1));
        assert_eq!(result[1].change_n_listings, Some(-1));
        assert!((result[1].change_pct_listings.unwrap() + 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_far_or_resized_cluster_gets_new_id() {
        let mut cache = IdentityCache::new();
        let config = ClusterConfig::default();
        cache.recognize(1, &[found(SubIndex::Merged(1), 42.35, 4)], &config).unwrap();

        // 200 ft away: new id that skips the cached number
        let result = cache
            .recognize(1, &[found(SubIndex::Merged(1), 42.35 + 200.0 * FOOT, 4)], &config)
            .unwrap();
        assert!(!result[0].recognized);
        assert_eq!(result[0].canonical.sub, SubIndex::Merged(2));

        // Same spot, size tripled
        let mut cache = IdentityCache::new();
        cache.recognize(1, &[found(SubIndex::Merged(1), 42.35, 2)], &config).unwrap();
        let result = cache.recognize(1, &[found(SubIndex::Merged(1), 42.35, 6)], &config).unwrap();
        assert!(!result[0].recognized);
    }

    #[test]
    fn test_kinds_do_not_match_each_other() {
        let mut cache = IdentityCache::new();
        let config = ClusterConfig::default();
        cache.recognize(1, &[found(SubIndex::Merged(1), 42.35, 12)], &config).unwrap();

        let result = cache.recognize(1, &[found(SubIndex::Super(1), 42.35, 12)], &config).unwrap();
        assert!(!result[0].recognized);
        assert_eq!(result[0].canonical.to_string(), "1-1s");
    }

    #[test]
    fn test_record_claimed_once() {
        let mut cache = IdentityCache::new();
        let config = ClusterConfig::default();
        cache.recognize(1, &[found(SubIndex::Merged(1), 42.35, 4)], &config).unwrap();

        let next = vec![
            found(SubIndex::Merged(1), 42.35, 4),
            found(SubIndex::Merged(2), 42.35 + 10.0 * FOOT, 4),
        ];
        let result = cache.recognize(1, &next, &config).unwrap();
        assert_eq!(result.iter().filter(|r| r.recognized).count(), 1);
        assert_ne!(result[0].canonical, result[1].canonical);
    }

    #[test]
    fn test_range_exhaustion() {
        let mut cache = IdentityCache::new();
        let config = ClusterConfig {
            max_clusters_per_host: 2,
            ..ClusterConfig::default()
        };
        let run: Vec<FoundCluster> = (0..3)
            .map(|i| found(SubIndex::Merged(i + 1), 42.35 + i as f64 * 0.01, 2))
            .collect();
        let err = cache.recognize(7, &run, &config);
        assert!(matches!(
            err,
            Err(ClusterError::IdentityRangeExhausted { host_index: 7, cap: 2 })
        ));
    }

    #[test]
    fn test_save_and_load() {
        let mut store = MemoryStore::new();
        let mut cache = IdentityCache::new();
        let config = ClusterConfig::default();
        let index = cache.static_index_for("host");
        cache.recognize(index, &[found(SubIndex::Super(1), 42.35, 11)], &config).unwrap();
        cache.save(&mut store).unwrap();

        let loaded = IdentityCache::load(&store).unwrap();
        assert_eq!(loaded.host_index("host"), Some(index));
        let records = loaded.records(index).unwrap();
        let record = records.get(&SubIndex::Super(1)).unwrap();
        assert_eq!(record.n_listings, 11);
        assert!((record.center.latitude - 42.35).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_center_is_not_cached() {
        let mut store = MemoryStore::new();
        let mut cache = IdentityCache::new();
        let config = ClusterConfig::default();
        let h = cache.static_index_for("h");
        let other = cache.static_index_for("other");
        let valid = found(SubIndex::Merged(1), 42.35, 4);
        let mut invalid = found(SubIndex::Merged(1), f64::NAN, 1);
        invalid.provisional = MergedClusterId::new(other, SubIndex::Merged(1));

        cache.recognize(h, &[valid], &config).unwrap();
        let first = cache.recognize(other, &[invalid], &config).unwrap();
        assert!(!first[0].recognized);
        assert_eq!(first[0].canonical.to_string(), "2-1");
        assert!(cache.records(other).is_none());
        cache.save(&mut store).unwrap();

        let mut reloaded = IdentityCache::load(&store).unwrap();
        assert_eq!(reloaded.records(h).map(|r| r.len()), Some(1));
        let again = reloaded.recognize(h, &[valid], &config).unwrap();
        assert!(again[0].recognized);
        let again = reloaded.recognize(other, &[invalid], &config).unwrap();
        assert!(!again[0].recognized);
        assert_eq!(again[0].canonical.to_string(), "2-1");
    }

    #[test]
    fn test_corrupt_cache_starts_empty() {
        let mut store = MemoryStore::new();
        store.put_raw(HOST_INDEX_KEY, b"garbage").unwrap();
        store.put_raw(CLUSTER_RECORDS_KEY, b"[1,2").unwrap();

        let cache = IdentityCache::load(&store).unwrap();
        assert_eq!(cache, IdentityCache::new());
    }
}
