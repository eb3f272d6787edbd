//! # Centroid Aggregation
//!
//! One summary row per cluster: counts, mean price, categorical frequency maps
//! and the geometry of its members.
//!
//! Aggregation is memoized through an [`AggregateCache`] keyed by cluster id.
//! A cached row is reused while the cluster's [`Fingerprint`] is unchanged, so
//! a cluster whose members moved without changing the fingerprint keeps its
//! previous row.

use std::collections::BTreeMap;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::geo_utils::{compute_bounds, compute_center, round_to};
use crate::model::{ClusterGroup, ClusterId, Listing};
use crate::radial::RadialStats;
use crate::store::{KvStore, TypedStore};
use crate::GpsPoint;

/// Mean, sample deviation and range of member coordinates.
///
/// Only members with valid coordinates count; a cluster without any is all
/// zeros.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoStats {
    pub mean_lat: f64,
    pub mean_lng: f64,
    pub std_lat: f64,
    pub std_lng: f64,
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl GeoStats {
    pub fn from_listings<'a>(members: impl IntoIterator<Item = &'a Listing>) -> Self {
        let points: Vec<GpsPoint> = members
            .into_iter()
            .map(|l| l.point())
            .filter(|p| p.is_valid())
            .collect();
        let Some(bounds) = compute_bounds(&points) else {
            return Self::default();
        };

        let center = compute_center(&points);
        let lats: Vec<f64> = points.iter().map(|p| p.latitude).collect();
        let lngs: Vec<f64> = points.iter().map(|p| p.longitude).collect();
        Self {
            mean_lat: center.latitude,
            mean_lng: center.longitude,
            std_lat: sample_std(&lats, center.latitude),
            std_lng: sample_std(&lngs, center.longitude),
            min_lat: bounds.min_lat,
            max_lat: bounds.max_lat,
            min_lng: bounds.min_lng,
            max_lng: bounds.max_lng,
        }
    }
}

/// Sample standard deviation; 0 below two values.
fn sample_std(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

/// Summary of one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Centroid {
    pub cluster_id: ClusterId,
    pub host_id: String,
    pub host_name: String,
    pub count_listings: usize,
    pub count_licenses: usize,
    /// Mean nightly price, 2 decimals.
    pub avg_price: f64,
    pub license_counts: BTreeMap<String, usize>,
    pub status_counts: BTreeMap<String, usize>,
    pub alias_counts: BTreeMap<String, usize>,
    pub address_counts: BTreeMap<String, usize>,
    /// Most frequent license-limit violation among members.
    pub limit_exceeded: Option<String>,
    /// Some member's license is also used by another host.
    pub shared_license: bool,
    pub minimum_nights: Option<u32>,
    pub geo: GeoStats,
    #[serde(default)]
    pub radial: Option<RadialStats>,
    /// Reverse-geocoded address components.
    #[serde(default)]
    pub address: Option<BTreeMap<String, String>>,
}

fn count<'a>(values: impl Iterator<Item = &'a str>) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for value in values {
        *counts.entry(value.to_string()).or_insert(0) += 1;
    }
    counts
}

impl Centroid {
    /// Aggregate a cluster from scratch.
    pub fn from_group(group: &ClusterGroup, listings: &[Listing]) -> Self {
        let members: Vec<&Listing> = group.members.iter().map(|&m| &listings[m]).collect();
        let n = members.len();

        let license_counts = count(members.iter().map(|l| l.license.as_str()));
        let status_counts = count(members.iter().filter_map(|l| l.status.as_deref()));
        let alias_counts = count(members.iter().filter_map(|l| l.alias_id.as_deref()));
        let address_counts = count(members.iter().filter_map(|l| l.registry_address.as_deref()));
        let limit_counts = count(members.iter().filter_map(|l| l.limit_exceeded.as_deref()));

        // First maximum in key order
        let limit_exceeded = limit_counts
            .iter()
            .fold(None::<(&String, usize)>, |best, (kind, &c)| match best {
                Some((_, best_c)) if best_c >= c => best,
                _ => Some((kind, c)),
            })
            .map(|(kind, _)| kind.clone());

        let avg_price = if n == 0 {
            0.0
        } else {
            round_to(members.iter().map(|l| l.price).sum::<f64>() / n as f64, 2)
        };

        Self {
            cluster_id: group.id,
            host_id: group.host_id.clone(),
            host_name: members.first().map(|l| l.host_name.clone()).unwrap_or_default(),
            count_listings: n,
            count_licenses: license_counts.len(),
            avg_price,
            license_counts,
            status_counts,
            alias_counts,
            address_counts,
            limit_exceeded,
            shared_license: members.iter().any(|l| !l.other_hosts.is_empty()),
            minimum_nights: members.iter().filter_map(|l| l.minimum_nights).min(),
            geo: GeoStats::from_listings(members.iter().copied()),
            radial: None,
            address: None,
        }
    }
}

// ============================================================================
// Memoization
// ============================================================================

/// Which fingerprint a cache compares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintKind {
    /// Host and listing count; used for phase-1 groups.
    HostCount,
    /// License frequency map; used for final clusters.
    LicenseCounts,
}

/// Cheap summary deciding whether a cached centroid is still current.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Fingerprint {
    HostCount { host: String, count: usize },
    LicenseCounts(BTreeMap<String, usize>),
}

impl Fingerprint {
    pub fn of(kind: FingerprintKind, group: &ClusterGroup, listings: &[Listing]) -> Self {
        match kind {
            FingerprintKind::HostCount => Fingerprint::HostCount {
                host: group.host_id.clone(),
                count: group.listing_count(),
            },
            FingerprintKind::LicenseCounts => Fingerprint::LicenseCounts(count(
                group.members.iter().map(|&m| listings[m].license.as_str()),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CachedCentroid {
    fingerprint: Fingerprint,
    centroid: Centroid,
}

/// Fingerprint-keyed centroid memo.
#[derive(Debug, Clone, Default)]
pub struct AggregateCache {
    entries: BTreeMap<ClusterId, CachedCentroid>,
    hits: usize,
    misses: usize,
}

impl AggregateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load<S: KvStore + ?Sized>(store: &S, key: &str) -> Result<Self> {
        Ok(Self {
            entries: store.get(key)?.unwrap_or_default(),
            ..Default::default()
        })
    }

    pub fn save<S: KvStore + ?Sized>(&self, store: &mut S, key: &str) -> Result<()> {
        store.put(key, &self.entries)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lookups served from the cache since load.
    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn misses(&self) -> usize {
        self.misses
    }

    fn centroid_for(&mut self, fingerprint: Fingerprint, group: &ClusterGroup, listings: &[Listing]) -> Centroid {
        if let Some(cached) = self.entries.get(&group.id) {
            if cached.fingerprint == fingerprint {
                self.hits += 1;
                return cached.centroid.clone();
            }
        }
        self.misses += 1;
        let centroid = Centroid::from_group(group, listings);
        self.entries.insert(
            group.id,
            CachedCentroid {
                fingerprint,
                centroid: centroid.clone(),
            },
        );
        centroid
    }
}

/// Aggregate every cluster, largest first (ties by cluster id).
pub fn aggregate_clusters(
    groups: &[ClusterGroup],
    listings: &[Listing],
    kind: FingerprintKind,
    cache: &mut AggregateCache,
) -> Vec<Centroid> {
    let mut centroids: Vec<Centroid> = groups
        .iter()
        .map(|group| {
            let fingerprint = Fingerprint::of(kind, group, listings);
            cache.centroid_for(fingerprint, group, listings)
        })
        .collect();
    centroids.sort_by(|a, b| {
        b.count_listings
            .cmp(&a.count_listings)
            .then_with(|| a.cluster_id.cmp(&b.cluster_id))
    });

    info!(
        "[Centroids] {} clusters aggregated ({} from cache)",
        centroids.len(),
        cache.hits
    );
    centroids
}
