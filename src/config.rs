//! Immutable clustering configuration.
//!
//! A [`ClusterConfig`] is built once (in code, from [`Default`], or from a TOML
//! document) and passed by reference to every phase. [`ClusterConfig::validate`]
//! runs before any clustering starts.
//!
//! ```toml
//! super_cluster_min_listings = 10
//! recognition_distance_ft = 120.0
//! recognition_size_tolerance = 0.5
//! overlap_distance_ft = 125.0
//!
//! [phase1]
//! epsilon_ft = 300.0
//! min_samples = 2
//!
//! [[merge_phases]]
//! epsilon_ft = 300.0
//! min_samples = 1
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, Result};

/// DBSCAN parameters for phase 1 (listings → host×license sub-groups).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseParams {
    /// Neighborhood radius in feet, converted with [`crate::geo_utils::epsilon_degrees`].
    pub epsilon_ft: f64,
    /// Minimum neighborhood size (including the point itself) for a core point.
    pub min_samples: usize,
}

/// DBSCAN parameters for one merge phase (cluster centers → merged clusters).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergePhaseParams {
    pub epsilon_ft: f64,
    pub min_samples: usize,
}

/// Configuration for the whole pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Phase-1 clustering within each host×license group.
    pub phase1: PhaseParams,

    /// One entry per merge phase; at least one is required.
    pub merge_phases: Vec<MergePhaseParams>,

    /// Merge-classes whose combined listing count reaches this value are not
    /// merged; each constituent becomes its own super-cluster.
    /// Default: 10
    pub super_cluster_min_listings: usize,

    /// Maximum center drift (feet) for a cluster to be recognized across runs.
    /// Must stay below `overlap_distance_ft` and every merge epsilon, so a
    /// recognized center could never have been merged into a neighbor.
    /// Default: 120.0
    pub recognition_distance_ft: f64,

    /// Maximum relative change in listing count for recognition.
    /// Default: 0.5
    pub recognition_size_tolerance: f64,

    /// Distance (feet) under which two cluster centers are treated as one
    /// building. Only used as the upper bound for `recognition_distance_ft`.
    /// Default: 125.0
    pub overlap_distance_ft: f64,

    /// Highest local cluster number handed out per host and kind.
    /// Default: 99
    #[serde(default = "default_max_clusters_per_host")]
    pub max_clusters_per_host: u32,
}

fn default_max_clusters_per_host() -> u32 {
    99
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            phase1: PhaseParams {
                epsilon_ft: 300.0,
                min_samples: 2,
            },
            merge_phases: vec![MergePhaseParams {
                epsilon_ft: 300.0,
                min_samples: 1,
            }],
            super_cluster_min_listings: 10,
            recognition_distance_ft: 120.0,
            recognition_size_tolerance: 0.5,
            overlap_distance_ft: 125.0,
            max_clusters_per_host: default_max_clusters_per_host(),
        }
    }
}

impl ClusterConfig {
    /// Parse a configuration from TOML and validate it.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: ClusterConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file and validate it.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Check every parameter. Any failure is fatal for the run.
    pub fn validate(&self) -> Result<()> {
        check_epsilon("phase1.epsilon_ft", self.phase1.epsilon_ft)?;
        check_min_samples("phase1.min_samples", self.phase1.min_samples)?;

        if self.merge_phases.is_empty() {
            return Err(ClusterError::config("at least one merge phase is required"));
        }
        for (i, phase) in self.merge_phases.iter().enumerate() {
            check_epsilon(&format!("merge_phases[{i}].epsilon_ft"), phase.epsilon_ft)?;
            check_min_samples(&format!("merge_phases[{i}].min_samples"), phase.min_samples)?;
        }

        if self.super_cluster_min_listings == 0 {
            return Err(ClusterError::config("super_cluster_min_listings must be at least 1"));
        }
        check_epsilon("overlap_distance_ft", self.overlap_distance_ft)?;
        check_epsilon("recognition_distance_ft", self.recognition_distance_ft)?;
        if self.recognition_distance_ft >= self.overlap_distance_ft {
            return Err(ClusterError::config(format!(
                "recognition_distance_ft ({}) must be smaller than overlap_distance_ft ({})",
                self.recognition_distance_ft, self.overlap_distance_ft
            )));
        }
        for (i, phase) in self.merge_phases.iter().enumerate() {
            if self.recognition_distance_ft >= phase.epsilon_ft {
                return Err(ClusterError::config(format!(
                    "recognition_distance_ft ({}) must be smaller than merge_phases[{i}].epsilon_ft ({})",
                    self.recognition_distance_ft, phase.epsilon_ft
                )));
            }
        }
        if !self.recognition_size_tolerance.is_finite() || self.recognition_size_tolerance < 0.0 {
            return Err(ClusterError::config(format!(
                "recognition_size_tolerance must be a non-negative number, got {}",
                self.recognition_size_tolerance
            )));
        }
        if self.max_clusters_per_host == 0 {
            return Err(ClusterError::config("max_clusters_per_host must be at least 1"));
        }

        Ok(())
    }

    /// Number of merge phases.
    pub fn phase_count(&self) -> usize {
        self.merge_phases.len()
    }
}

fn check_epsilon(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ClusterError::config(format!(
            "{name} must be a positive distance in feet, got {value}"
        )));
    }
    Ok(())
}

fn check_min_samples(name: &str, value: usize) -> Result<()> {
    if value == 0 {
        return Err(ClusterError::config(format!("{name} must be at least 1")));
    }
    Ok(())
}
