//! Listings, cluster identities and per-listing results.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::GpsPoint;

// ============================================================================
// Listing
// ============================================================================

/// A single rental unit as published in the listings feed.
///
/// License status, registry address and shared-license detection are resolved
/// upstream; this crate only reads them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: String,
    pub host_id: String,
    #[serde(default)]
    pub host_name: String,
    pub license: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub accommodates: u32,
    #[serde(default)]
    pub minimum_nights: Option<u32>,
    /// Resolved license status, e.g. "Active" or "No license claimed".
    #[serde(default)]
    pub status: Option<String>,
    /// Original host account when the host was folded into a corporate group.
    #[serde(default)]
    pub alias_id: Option<String>,
    /// Address registered for the license, when found in the registry.
    #[serde(default)]
    pub registry_address: Option<String>,
    /// "listing" or "guest" when the license category limit is exceeded.
    #[serde(default)]
    pub limit_exceeded: Option<String>,
    /// Other hosts advertising the same license number.
    #[serde(default)]
    pub other_hosts: Vec<String>,
}

impl Listing {
    pub fn new(
        id: impl Into<String>,
        host_id: impl Into<String>,
        license: impl Into<String>,
        latitude: f64,
        longitude: f64,
    ) -> Self {
        Self {
            id: id.into(),
            host_id: host_id.into(),
            host_name: String::new(),
            license: license.into(),
            latitude,
            longitude,
            price: 0.0,
            accommodates: 0,
            minimum_nights: None,
            status: None,
            alias_id: None,
            registry_address: None,
            limit_exceeded: None,
            other_hosts: Vec::new(),
        }
    }

    pub fn with_price(mut self, price: f64) -> Self {
        self.price = price;
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn point(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }
}

// ============================================================================
// Cluster identities
// ============================================================================

/// Local DBSCAN label inside one host×license group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LocalClass {
    /// Outliers of the group, kept together as their own cluster.
    Noise,
    Class(u32),
}

/// Phase-1 cluster key: group sequence number plus local label.
///
/// Rendered as `"{group}.{class + 1}"`, with `0` for the noise cluster, so
/// labels that restart at 0 in every group stay globally unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubGroupId {
    pub group: u32,
    pub class: LocalClass,
}

impl SubGroupId {
    pub fn new(group: u32, class: LocalClass) -> Self {
        Self { group, class }
    }
}

impl fmt::Display for SubGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.class {
            LocalClass::Noise => write!(f, "{}.0", self.group),
            LocalClass::Class(n) => write!(f, "{}.{}", self.group, n + 1),
        }
    }
}

impl FromStr for SubGroupId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (group, class) = s
            .split_once('.')
            .ok_or_else(|| format!("not a sub-group id: '{s}'"))?;
        let group: u32 = group.parse().map_err(|_| format!("bad group in '{s}'"))?;
        let class: u32 = class.parse().map_err(|_| format!("bad class in '{s}'"))?;
        let class = match class {
            0 => LocalClass::Noise,
            n => LocalClass::Class(n - 1),
        };
        Ok(Self { group, class })
    }
}

/// Per-host sequence number of a merged cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum SubIndex {
    /// Accepted merge.
    Merged(u32),
    /// Large cluster kept separate instead of merged.
    Super(u32),
}

impl SubIndex {
    pub fn number(&self) -> u32 {
        match self {
            SubIndex::Merged(n) | SubIndex::Super(n) => *n,
        }
    }

    pub fn is_super(&self) -> bool {
        matches!(self, SubIndex::Super(_))
    }

    /// Same kind, different number.
    pub fn with_number(&self, n: u32) -> SubIndex {
        match self {
            SubIndex::Merged(_) => SubIndex::Merged(n),
            SubIndex::Super(_) => SubIndex::Super(n),
        }
    }
}

impl fmt::Display for SubIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubIndex::Merged(n) => write!(f, "{n}"),
            SubIndex::Super(n) => write!(f, "{n}s"),
        }
    }
}

impl FromStr for SubIndex {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = match s.strip_suffix('s') {
            Some(n) => n.parse().map(SubIndex::Super),
            None => s.parse().map(SubIndex::Merged),
        };
        parsed.map_err(|_| format!("not a sub index: '{s}'"))
    }
}

impl From<SubIndex> for String {
    fn from(value: SubIndex) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for SubIndex {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Merged cluster key, namespaced by the host's static index.
///
/// Rendered as `"{host}-{sub}"`, e.g. `"4-2"` or `"4-1s"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MergedClusterId {
    pub host_index: u32,
    pub sub: SubIndex,
}

impl MergedClusterId {
    pub fn new(host_index: u32, sub: SubIndex) -> Self {
        Self { host_index, sub }
    }
}

impl fmt::Display for MergedClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.host_index, self.sub)
    }
}

impl FromStr for MergedClusterId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, sub) = s
            .split_once('-')
            .ok_or_else(|| format!("not a merged cluster id: '{s}'"))?;
        let host_index = host.parse().map_err(|_| format!("bad host index in '{s}'"))?;
        Ok(Self {
            host_index,
            sub: sub.parse()?,
        })
    }
}

/// Any cluster key, phase 1 or later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ClusterId {
    SubGroup(SubGroupId),
    Merged(MergedClusterId),
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterId::SubGroup(id) => id.fmt(f),
            ClusterId::Merged(id) => id.fmt(f),
        }
    }
}

impl FromStr for ClusterId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains('.') {
            s.parse().map(ClusterId::SubGroup)
        } else {
            s.parse().map(ClusterId::Merged)
        }
    }
}

impl From<ClusterId> for String {
    fn from(value: ClusterId) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for ClusterId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SubGroupId> for ClusterId {
    fn from(value: SubGroupId) -> Self {
        ClusterId::SubGroup(value)
    }
}

impl From<MergedClusterId> for ClusterId {
    fn from(value: MergedClusterId) -> Self {
        ClusterId::Merged(value)
    }
}

// ============================================================================
// Clusters and per-listing results
// ============================================================================

/// One cluster produced by a phase.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterGroup {
    pub id: ClusterId,
    pub host_id: String,
    /// Indices into the listing slice the pipeline was given.
    pub members: Vec<usize>,
    /// Mean position of the members.
    pub center: GpsPoint,
}

impl ClusterGroup {
    pub fn listing_count(&self) -> usize {
        self.members.len()
    }
}

/// Cluster identities of one listing across every phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingAssignment {
    pub listing_id: String,
    pub host_id: String,
    pub phase1: Option<SubGroupId>,
    /// One id per merge phase, in phase order.
    pub layers: Vec<MergedClusterId>,
    /// Canonical building id after recognition.
    pub final_id: Option<MergedClusterId>,
    /// The final cluster matched a cached cluster from an earlier run.
    pub recognized: bool,
    pub change_n_listings: Option<i64>,
    pub change_pct_listings: Option<f64>,
    /// Distance to the final cluster's center, in feet.
    pub distance_ft: Option<f64>,
}

impl ListingAssignment {
    pub fn new(listing: &Listing) -> Self {
        Self {
            listing_id: listing.id.clone(),
            host_id: listing.host_id.clone(),
            phase1: None,
            layers: Vec::new(),
            final_id: None,
            recognized: false,
            change_n_listings: None,
            change_pct_listings: None,
            distance_ft: None,
        }
    }

    /// Id from the most recent phase that assigned one.
    pub fn current_id(&self) -> Option<ClusterId> {
        if let Some(id) = self.final_id {
            return Some(id.into());
        }
        match self.layers.last() {
            Some(id) => Some((*id).into()),
            None => self.phase1.map(ClusterId::from),
        }
    }
}

// Serde for SubGroupId / MergedClusterId goes through their string form so they
// can be used as JSON map keys.
macro_rules! string_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

string_serde!(SubGroupId);
string_serde!(MergedClusterId);
