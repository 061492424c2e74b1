// Copyright 2024 Oxide Computer Company
//! Engine configuration
//!
//! Configuration is read from a TOML file; every field has a default so an
//! empty file (or no file at all) is a valid configuration.  The subset of
//! settings which must survive a re-attach is carried in the metadata
//! snapshot as a [`PersistedConfig`].
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::health::MAX_HEALTH_SCORE;
use crate::{spare_bail, SpareError};

/// Spare-device sectors at which the redundant metadata copies start
pub const DEFAULT_COPY_SECTORS: [u64; 5] = [0, 1024, 2048, 4096, 8192];

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub health: HealthConfig,
    pub scanner: ScannerConfig,
    pub metadata: MetadataConfig,
    pub repair: RepairConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthConfig {
    /// Scores at or above this are `Safe`
    pub warning_threshold: u32,
    /// Scores at or above this (and below `warning_threshold`) are `Caution`
    pub danger_threshold: u32,
    /// A sector whose last scan is older than this loses 50 points
    pub staleness_secs: u64,
    /// Starting bucket count of the health map (rounded to a power of 2)
    pub initial_buckets: usize,
    /// Compaction target for the health map
    pub max_records: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            warning_threshold: 700,
            danger_threshold: 400,
            staleness_secs: 7 * 24 * 60 * 60,
            initial_buckets: 64,
            max_records: 1 << 20,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScannerConfig {
    /// Smallest chunk scanned per cycle, used under heavy load
    pub min_chunk: u64,
    /// Largest chunk scanned per cycle, used when idle
    pub max_chunk: u64,
    /// Number of sectors probed between voluntary yields
    pub yield_interval: u64,
    /// Pause between cycles
    pub interval_ms: u64,
    /// Foreground IOPS treated as 100% load
    pub high_load_iops: u64,
    /// Extra probe attempts before a read error counts as hard
    pub probe_retries: u32,
    /// Initial probe backoff; doubled on every retry
    pub probe_backoff_ms: u64,
    /// Failure probability below which no preventive remap is considered
    pub proactive_threshold: u32,
    /// Chance of a preventive remap for `Medium` and `High` predictions
    pub medium_remap_probability: f64,
    /// Upper bound on how long `stop` waits for the worker
    pub stop_timeout_ms: u64,
    /// Seed for the preventive-remap gate; random if unset
    pub rng_seed: Option<u64>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        ScannerConfig {
            min_chunk: 16,
            max_chunk: 1024,
            yield_interval: 32,
            interval_ms: 1000,
            high_load_iops: 2000,
            probe_retries: 2,
            probe_backoff_ms: 5,
            proactive_threshold: 20,
            medium_remap_probability: 0.5,
            stop_timeout_ms: 5000,
            rng_seed: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetadataConfig {
    /// First spare sector of each metadata copy
    pub copy_sectors: Vec<u64>,
    /// Size of each copy, in sectors
    pub sectors_per_copy: u64,
    /// Capacity of the remap table
    pub max_remaps: usize,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        MetadataConfig {
            copy_sectors: DEFAULT_COPY_SECTORS.to_vec(),
            sectors_per_copy: 64,
            max_remaps: 512,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RepairConfig {
    /// Interval between scrubs of all metadata copies
    pub scrub_interval_secs: u64,
    /// Attempts per copy rewrite before the repair is declared failed
    pub max_attempts: u32,
    /// Initial backoff between rewrite attempts; doubled on every retry
    pub backoff_base_ms: u64,
}

impl Default for RepairConfig {
    fn default() -> Self {
        RepairConfig {
            scrub_interval_secs: 60 * 60,
            max_attempts: 3,
            backoff_base_ms: 10,
        }
    }
}

/// Settings stored alongside the remap table
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedConfig {
    pub warning_threshold: u32,
    pub danger_threshold: u32,
    pub staleness_secs: u64,
    pub scan_interval_ms: u64,
    pub scrub_interval_secs: u64,
    pub proactive_threshold: u32,
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: EngineConfig =
            toml::from_str(s).context("parsing engine configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("reading {:?}", path))?;
        Self::from_toml_str(&s).with_context(|| format!("in {:?}", path))
    }

    pub fn validate(&self) -> Result<(), SpareError> {
        let h = &self.health;
        if h.warning_threshold > MAX_HEALTH_SCORE {
            spare_bail!(
                InvalidConfig,
                "warning_threshold {} exceeds {}",
                h.warning_threshold,
                MAX_HEALTH_SCORE
            );
        }
        if h.danger_threshold >= h.warning_threshold {
            spare_bail!(
                InvalidConfig,
                "danger_threshold {} must be below warning_threshold {}",
                h.danger_threshold,
                h.warning_threshold
            );
        }
        if h.initial_buckets == 0 {
            spare_bail!(InvalidConfig, "initial_buckets must be non-zero");
        }

        let s = &self.scanner;
        if s.min_chunk == 0 || s.min_chunk > s.max_chunk {
            spare_bail!(
                InvalidConfig,
                "need 0 < min_chunk ({}) <= max_chunk ({})",
                s.min_chunk,
                s.max_chunk
            );
        }
        if s.yield_interval == 0 {
            spare_bail!(InvalidConfig, "yield_interval must be non-zero");
        }
        if !(0.0..=1.0).contains(&s.medium_remap_probability) {
            spare_bail!(
                InvalidConfig,
                "medium_remap_probability {} is not in [0, 1]",
                s.medium_remap_probability
            );
        }
        if s.proactive_threshold > 100 {
            spare_bail!(
                InvalidConfig,
                "proactive_threshold {} is not a percentage",
                s.proactive_threshold
            );
        }

        let m = &self.metadata;
        if m.copy_sectors.is_empty() {
            spare_bail!(InvalidConfig, "at least one metadata copy is needed");
        }
        if m.sectors_per_copy == 0 {
            spare_bail!(InvalidConfig, "sectors_per_copy must be non-zero");
        }
        let mut starts = m.copy_sectors.clone();
        starts.sort_unstable();
        for w in starts.windows(2) {
            if w[0] + m.sectors_per_copy > w[1] {
                spare_bail!(
                    InvalidConfig,
                    "metadata copies at {} and {} overlap",
                    w[0],
                    w[1]
                );
            }
        }
        if m.max_remaps == 0 {
            spare_bail!(InvalidConfig, "max_remaps must be non-zero");
        }

        if self.repair.max_attempts == 0 {
            spare_bail!(InvalidConfig, "repair max_attempts must be non-zero");
        }
        if self.repair.scrub_interval_secs == 0 {
            spare_bail!(InvalidConfig, "scrub_interval_secs must be non-zero");
        }
        Ok(())
    }

    pub fn persisted(&self) -> PersistedConfig {
        PersistedConfig {
            warning_threshold: self.health.warning_threshold,
            danger_threshold: self.health.danger_threshold,
            staleness_secs: self.health.staleness_secs,
            scan_interval_ms: self.scanner.interval_ms,
            scrub_interval_secs: self.repair.scrub_interval_secs,
            proactive_threshold: self.scanner.proactive_threshold,
        }
    }

    /// Overlays settings restored from disk
    pub fn apply_persisted(&mut self, p: &PersistedConfig) {
        self.health.warning_threshold = p.warning_threshold;
        self.health.danger_threshold = p.danger_threshold;
        self.health.staleness_secs = p.staleness_secs;
        self.scanner.interval_ms = p.scan_interval_ms;
        self.repair.scrub_interval_secs = p.scrub_interval_secs;
        self.scanner.proactive_threshold = p.proactive_threshold;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn empty_toml_is_default() {
        let cfg = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn partial_toml_overrides() {
        let cfg = EngineConfig::from_toml_str(
            r#"
            [health]
            warning_threshold = 800

            [metadata]
            copy_sectors = [0, 100, 200]
            sectors_per_copy = 8

            [scanner]
            rng_seed = 7
            "#,
        )
        .unwrap();
        assert_eq!(cfg.health.warning_threshold, 800);
        assert_eq!(cfg.health.danger_threshold, 400);
        assert_eq!(cfg.metadata.copy_sectors, vec![0, 100, 200]);
        assert_eq!(cfg.metadata.sectors_per_copy, 8);
        assert_eq!(cfg.scanner.rng_seed, Some(7));
        assert_eq!(cfg.repair, RepairConfig::default());
    }

    #[test]
    fn zero_scrub_interval_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.repair.scrub_interval_secs = 0;
        assert!(matches!(cfg.validate(), Err(SpareError::InvalidConfig(_))));

        let e = EngineConfig::from_toml_str(
            r#"
            [repair]
            scrub_interval_secs = 0
            "#,
        );
        assert!(e.is_err());
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(EngineConfig::from_toml_str("[health]\nbogus = 1\n").is_err());
    }

    #[test]
    fn threshold_order_enforced() {
        let mut cfg = EngineConfig::default();
        cfg.health.danger_threshold = cfg.health.warning_threshold;
        assert!(matches!(
            cfg.validate(),
            Err(SpareError::InvalidConfig(_))
        ));
    }

    #[test]
    fn overlapping_copies_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.metadata.copy_sectors = vec![0, 32];
        cfg.metadata.sectors_per_copy = 64;
        assert!(matches!(
            cfg.validate(),
            Err(SpareError::InvalidConfig(_))
        ));
    }

    #[test]
    fn chunk_bounds_enforced() {
        let mut cfg = EngineConfig::default();
        cfg.scanner.min_chunk = 2048;
        assert!(cfg.validate().is_err());
        cfg.scanner.min_chunk = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn persisted_round_trip() {
        let mut src = EngineConfig::default();
        src.health.warning_threshold = 900;
        src.health.danger_threshold = 100;
        src.repair.scrub_interval_secs = 5;
        let p = src.persisted();

        let mut dst = EngineConfig::default();
        dst.apply_persisted(&p);
        assert_eq!(dst.persisted(), p);
        assert_eq!(dst.health.warning_threshold, 900);
        assert_eq!(dst.repair.scrub_interval_secs, 5);
    }
}
