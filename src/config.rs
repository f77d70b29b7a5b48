//! cellwatch configuration.
//!
//! Loaded from `~/.cellwatch/config.toml` (or `--config`). A missing file
//! means defaults. Durations are strings in jiff's friendly or ISO 8601
//! format, e.g. `"5m"`, `"30s"`, `"PT6H"`.
//!
//! ```toml
//! [sampling]
//! nominal-interval = "5m"
//! fix-timeout = "4m"
//!
//! [watchdog]
//! resurrection-timeout = "30s"
//! freshness = "2m"
//! backoff-multiplier = 2.0
//! backoff-floor = "30m"
//! backoff-ceiling = "6h"
//!
//! [dedup]
//! debounce = "5s"
//!
//! [sources]
//! fix-command = ["cellwatch-gnss", "--once"]
//! attachment-command = ["cellwatch-modem", "--follow"]
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! ```

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use jiff::SignedDuration;
use serde::Deserialize;

use crate::logging::LogConfig;
use crate::watchdog::{BackoffPolicy, WatchdogPolicy};

/// Longest duration any setting may take.
const MAX_DURATION: SignedDuration = SignedDuration::from_hours(24 * 366);

/// cellwatch configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    pub sampling: SamplingConfig,
    pub watchdog: WatchdogConfig,
    pub dedup: DedupConfig,
    pub sources: SourcesConfig,
    pub logging: LogConfig,
}

/// Periodic fix cadence.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SamplingConfig {
    /// Time between periodic fixes, and the healthy watchdog interval.
    pub nominal_interval: SignedDuration,

    /// Upper bound on one periodic fix. Must leave room before the next cycle.
    pub fix_timeout: SignedDuration,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            nominal_interval: SignedDuration::from_mins(5),
            fix_timeout: SignedDuration::from_mins(4),
        }
    }
}

/// Resurrection and backoff policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct WatchdogConfig {
    /// Upper bound on the one-shot resurrection fix.
    pub resurrection_timeout: SignedDuration,

    /// Oldest fix a resurrection will accept.
    pub freshness: SignedDuration,

    /// Backoff base. Defaults to the nominal interval.
    pub backoff_base: Option<SignedDuration>,
    pub backoff_multiplier: f64,
    pub backoff_floor: SignedDuration,
    pub backoff_ceiling: SignedDuration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            resurrection_timeout: SignedDuration::from_secs(30),
            freshness: SignedDuration::from_mins(2),
            backoff_base: None,
            backoff_multiplier: 2.0,
            backoff_floor: SignedDuration::from_mins(30),
            backoff_ceiling: SignedDuration::from_hours(6),
        }
    }
}

/// Attachment event debouncing.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DedupConfig {
    pub debounce: SignedDuration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            debounce: SignedDuration::from_secs(5),
        }
    }
}

/// External programs backing the sources. Empty means unavailable.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SourcesConfig {
    pub fix_command: Vec<String>,
    pub attachment_command: Vec<String>,
}

impl Config {
    /// Loads config from `path`, or from `~/.cellwatch/config.toml`.
    ///
    /// A missing file yields defaults; an unreadable or invalid one is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, String> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::path().ok_or("could not determine home directory")?,
        };

        let contents = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(format!("failed to read {}: {e}", path.display())),
        };

        let config = Self::parse(&contents)
            .map_err(|e| format!("invalid config at {}: {e}", path.display()))?;
        Ok(config)
    }

    /// Parses and validates a config document.
    pub fn parse(contents: &str) -> Result<Self, String> {
        let config: Self = toml::from_str(contents).map_err(|e| e.to_string())?;
        config.validate()?;
        Ok(config)
    }

    /// The config file path: `~/.cellwatch/config.toml`.
    pub fn path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".cellwatch").join("config.toml"))
    }

    fn validate(&self) -> Result<(), String> {
        let positive = [
            ("sampling.nominal-interval", self.sampling.nominal_interval),
            ("sampling.fix-timeout", self.sampling.fix_timeout),
            ("watchdog.resurrection-timeout", self.watchdog.resurrection_timeout),
            ("watchdog.freshness", self.watchdog.freshness),
            ("watchdog.backoff-floor", self.watchdog.backoff_floor),
            ("watchdog.backoff-ceiling", self.watchdog.backoff_ceiling),
            ("watchdog.backoff-base", self.backoff_base()),
        ];
        for (name, value) in positive {
            if !value.is_positive() {
                return Err(format!("{name} must be positive, got {value:#}"));
            }
            if value > MAX_DURATION {
                return Err(format!("{name} must be at most {MAX_DURATION:#}, got {value:#}"));
            }
        }
        if self.dedup.debounce.is_negative() || self.dedup.debounce > MAX_DURATION {
            return Err(format!(
                "dedup.debounce must be between 0 and {MAX_DURATION:#}, got {:#}",
                self.dedup.debounce
            ));
        }
        if self.sampling.fix_timeout >= self.sampling.nominal_interval {
            return Err(format!(
                "sampling.fix-timeout ({:#}) must be shorter than sampling.nominal-interval ({:#}) \
                 so a slow fix never overlaps the next cycle",
                self.sampling.fix_timeout, self.sampling.nominal_interval
            ));
        }
        if self.watchdog.resurrection_timeout >= self.sampling.nominal_interval / 2 {
            return Err(format!(
                "watchdog.resurrection-timeout ({:#}) must be shorter than half of \
                 sampling.nominal-interval ({:#}) so resurrections never overlap",
                self.watchdog.resurrection_timeout, self.sampling.nominal_interval
            ));
        }
        if self.watchdog.backoff_floor > self.watchdog.backoff_ceiling {
            return Err(
                "watchdog.backoff-floor must not exceed watchdog.backoff-ceiling".to_string(),
            );
        }
        let multiplier = self.watchdog.backoff_multiplier;
        if !(multiplier >= 1.0 && multiplier.is_finite()) {
            return Err(format!(
                "watchdog.backoff-multiplier must be a finite number >= 1, got {}",
                self.watchdog.backoff_multiplier
            ));
        }
        Ok(())
    }

    fn backoff_base(&self) -> SignedDuration {
        self.watchdog
            .backoff_base
            .unwrap_or(self.sampling.nominal_interval)
    }

    /// The watchdog policy derived from this config.
    pub fn watchdog_policy(&self) -> WatchdogPolicy {
        WatchdogPolicy {
            nominal_interval: self.sampling.nominal_interval,
            backoff: BackoffPolicy {
                base: self.backoff_base(),
                multiplier: self.watchdog.backoff_multiplier,
                floor: self.watchdog.backoff_floor,
                ceiling: self.watchdog.backoff_ceiling,
            },
        }
    }
}
