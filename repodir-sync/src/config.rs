//! Configuration for the sync engine.

use std::{path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::sources::SourceUri;

/// Engine configuration
///
/// The config is usually loaded from a TOML file with [`Self::load`]. Every field has a default,
/// so a file only needs to name what it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Sources to subscribe to at startup.
    pub sources: Vec<SourceUri>,
    /// Sources to subscribe to at startup that count towards the priority settle threshold.
    pub priority_sources: Vec<SourceUri>,
    /// How many discovery steps away from a configured source a discovered source may be.
    pub max_discovery_hops: usize,
    /// Upper bound on the number of sources, configured ones included.
    pub max_sources: usize,
    /// Result count requested from auto-discovered sources.
    pub discovery_limit: usize,
    /// After this long without completing, a source is treated as quiescent.
    #[serde(with = "humantime_serde")]
    pub source_timeout: Duration,
    /// When the settled indicator turns on.
    pub settle: SettleConfig,
    /// Bounds on tombstones that arrived before their record.
    pub pending_tombstones: PendingTombstoneConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            priority_sources: Vec::new(),
            max_discovery_hops: 3,
            max_sources: 32,
            discovery_limit: 100,
            source_timeout: Duration::from_secs(5),
            settle: SettleConfig::default(),
            pending_tombstones: PendingTombstoneConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Load the config from a file.
    pub async fn load(path: impl AsRef<Path>) -> Result<SyncConfig> {
        let s = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("failed to read {}", path.as_ref().to_string_lossy()))?;
        let config: SyncConfig = toml::from_str(&s)?;
        Ok(config)
    }
}

/// Thresholds for the settled indicator. Any one of them is enough.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettleConfig {
    /// Quiescent priority sources needed. Zero disables this threshold.
    pub min_priority_sources: usize,
    /// Quiescent sources needed, together with at least one stored record.
    pub min_sources: usize,
    /// Settle after this long regardless.
    #[serde(with = "humantime_serde")]
    pub max_wait: Duration,
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self {
            min_priority_sources: 1,
            min_sources: 1,
            max_wait: Duration::from_secs(10),
        }
    }
}

/// Bounds on pending tombstones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PendingTombstoneConfig {
    /// Maximum number kept; the ones closest to expiry are evicted first.
    pub capacity: usize,
    /// How long one is kept.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for PendingTombstoneConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            ttl: Duration::from_secs(60 * 60),
        }
    }
}
