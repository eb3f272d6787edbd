//! Radial spread of a cluster around its center.
//!
//! Every member's geodesic distance to the cluster's mean position, summarized
//! into a rough confidence label for downstream display. Advisory only: the
//! label never feeds back into clustering.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::geo_utils::{geodesic_distance_ft, round_to};
use crate::model::{ClusterGroup, Listing};

/// Radius buckets are multiples of this many feet.
const BUCKET_FT: f64 = 50.0;

/// Confidence label of one cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Confidence {
    /// Fewer than three members.
    TooFew,
    /// All members within one bucket of the center.
    TooClose,
    /// Members spread up to roughly this many feet.
    Within(u32),
}

impl Confidence {
    pub fn from_spread(member_count: usize, max_distance_ft: f64) -> Self {
        if member_count < 3 {
            Confidence::TooFew
        } else if max_distance_ft < BUCKET_FT {
            Confidence::TooClose
        } else {
            let buckets = (max_distance_ft / BUCKET_FT).round_ties_even();
            Confidence::Within((buckets * BUCKET_FT) as u32)
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Confidence::TooFew => write!(f, "unknown (too few)"),
            Confidence::TooClose => write!(f, "unknown (too close)"),
            Confidence::Within(ft) => write!(f, "within {ft} ft."),
        }
    }
}

impl FromStr for Confidence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown (too few)" => Ok(Confidence::TooFew),
            "unknown (too close)" => Ok(Confidence::TooClose),
            _ => s
                .strip_prefix("within ")
                .and_then(|rest| rest.strip_suffix(" ft."))
                .and_then(|ft| ft.parse().ok())
                .map(Confidence::Within)
                .ok_or_else(|| format!("not a confidence label: '{s}'")),
        }
    }
}

impl From<Confidence> for String {
    fn from(value: Confidence) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for Confidence {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Spread statistics of one cluster.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RadialStats {
    pub max_distance_ft: f64,
    pub avg_distance_ft: f64,
    /// Sample standard deviation; absent below two members.
    pub std_distance_ft: Option<f64>,
    pub confidence: Confidence,
}

/// Distance of each member to the cluster center (aligned with
/// `group.members`) and the cluster's summary.
///
/// Members without a valid coordinate get a NaN distance and are left out of
/// the summary.
///
/// # Example
/// ```
/// use building_matcher::{ClusterGroup, ClusterId, GpsPoint, Listing, SubGroupId, LocalClass, radial_stats};
///
/// let listings = vec![Listing::new("1", "h", "A", 42.35, -71.06)];
/// let group = ClusterGroup {
///     id: ClusterId::from(SubGroupId::new(1, LocalClass::Class(0))),
///     host_id: "h".into(),
///     members: vec![0],
///     center: GpsPoint::new(42.35, -71.06),
/// };
/// let (distances, stats) = radial_stats(&group, &listings);
/// assert_eq!(distances, vec![0.0]);
/// assert_eq!(stats.confidence.to_string(), "unknown (too few)");
/// ```
pub fn radial_stats(group: &ClusterGroup, listings: &[Listing]) -> (Vec<f64>, RadialStats) {
    let distances: Vec<f64> = group
        .members
        .iter()
        .map(|&m| {
            let point = listings[m].point();
            if point.is_valid() && group.center.is_valid() {
                geodesic_distance_ft(&group.center, &point)
            } else {
                f64::NAN
            }
        })
        .collect();

    let finite: Vec<f64> = distances.iter().copied().filter(|d| d.is_finite()).collect();
    let n = finite.len();
    let max = finite.iter().copied().fold(0.0_f64, f64::max);
    let mean = if n == 0 { 0.0 } else { finite.iter().sum::<f64>() / n as f64 };
    let std = (n >= 2).then(|| {
        let var = finite.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
        round_to(var.sqrt(), 4)
    });

    let stats = RadialStats {
        max_distance_ft: round_to(max, 5),
        avg_distance_ft: round_to(mean, 4),
        std_distance_ft: std,
        confidence: Confidence::from_spread(n, max),
    };
    (distances, stats)
}
