//! # Building Matcher
//!
//! Reconstructs building-level groupings of short-term rental listings whose
//! published coordinates were deliberately jittered, and keeps the identity of
//! each discovered building stable across runs.
//!
//! This library provides:
//! - Per host×license density clustering (phase 1)
//! - Iterated per-host merging of nearby clusters with a super-cluster override
//! - A persisted identity cache that recognizes the same building run after run
//! - Centroid statistics and a radial confidence label per building
//! - Cache-first reverse geocoding of centroids (feature `http`)
//!
//! ## Features
//!
//! - **`parallel`** - Run per-host phase-1 clustering with rayon
//! - **`http`** - Enable the rate-limited reverse-geocoding client
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use building_matcher::{ClusterConfig, Listing, MemoryStore, run_pipeline};
//!
//! let listings = vec![
//!     Listing::new("1", "host-a", "STR-100", 42.3500, -71.0600),
//!     Listing::new("2", "host-a", "STR-100", 42.35001, -71.06001),
//!     Listing::new("3", "host-a", "STR-100", 42.35002, -71.06002),
//! ];
//!
//! let mut store = MemoryStore::new();
//! let run = run_pipeline(&listings, &ClusterConfig::default(), &mut store).unwrap();
//!
//! assert_eq!(run.centroids.len(), 1);
//! assert_eq!(run.centroids[0].count_listings, 3);
//! ```

use serde::{Deserialize, Serialize};

pub mod centroid;
pub mod config;
pub mod dbscan;
pub mod error;
pub mod geo_utils;
pub mod grouping;
pub mod identity;
pub mod merge;
pub mod model;
pub mod pipeline;
pub mod radial;
pub mod store;

// Reverse geocoding of centroids
#[cfg(feature = "http")]
pub mod geocode;

pub use centroid::{AggregateCache, Centroid, Fingerprint, FingerprintKind, GeoStats, aggregate_clusters};
pub use config::{ClusterConfig, MergePhaseParams, PhaseParams};
pub use dbscan::{Label, dbscan};
pub use error::{ClusterError, Result, StoreError};
pub use grouping::{PhaseOneResult, PhaseOneStats, group_listings};
pub use identity::{FoundCluster, IdentityCache, Recognition, RecognitionStats};
pub use merge::{MergeOutcome, MergeStats, merge_phase, validate_phase};
pub use model::{
    ClusterGroup, ClusterId, Listing, ListingAssignment, LocalClass, MergedClusterId,
    SubGroupId, SubIndex,
};
pub use pipeline::{ClusterRun, run_pipeline};
pub use radial::{Confidence, RadialStats, radial_stats};
pub use store::{JsonDirStore, KvStore, MemoryStore, TypedStore};

#[cfg(feature = "http")]
pub use geocode::{
    Address, AddressLookup, GeocodeCache, GeocodeError, GeocodeOutcome, Geocoder,
    NominatimClient, geocode_centroids,
};

// ============================================================================
// Core Types
// ============================================================================

/// A coordinate with latitude and longitude in decimal degrees.
///
/// # Example
/// ```
/// use building_matcher::GpsPoint;
/// let point = GpsPoint::new(42.3601, -71.0589); // Boston
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }

    /// Coordinates as the `[lat, lng]` pair used for spatial indexing.
    pub fn as_array(&self) -> [f64; 2] {
        [self.latitude, self.longitude]
    }
}

/// Bounding box of a point set, in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

// ============================================================================
// Tests
// ============================================================================
