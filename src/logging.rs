//! Diagnostic logging via `tracing`.
//!
//! This is the operator-facing log on stderr (and optionally a file). It is
//! separate from the observation log, which is the agent's product.
//!
//! `RUST_LOG` overrides the configured level, e.g. `RUST_LOG=cellwatch=debug`.

use std::{fmt, fs, io, path::PathBuf, sync::Mutex};

use serde::Deserialize;
use tracing_subscriber::{EnvFilter, fmt as tfmt, prelude::*};

/// Output format for diagnostic logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output for interactive use.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Logging configuration, the `[logging]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LogConfig {
    /// Level filter (trace, debug, info, warn, error).
    pub level: String,

    pub format: LogFormat,

    /// Also write logs to this file.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("failed to open log file: {0}")]
    File(#[from] io::Error),

    #[error("failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Installs the global subscriber. Call once at startup.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let file = match &config.file {
        Some(path) => {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                fs::create_dir_all(parent)?;
            }
            Some(Mutex::new(
                fs::OpenOptions::new().create(true).append(true).open(path)?,
            ))
        }
        None => None,
    };

    match config.format {
        LogFormat::Pretty => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(tfmt::layer().with_writer(io::stderr).with_target(false))
                .with(file.map(|f| tfmt::layer().with_writer(f).with_ansi(false)));
            tracing::subscriber::set_global_default(subscriber)?;
        }
        LogFormat::Json => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(tfmt::layer().json().with_writer(io::stderr).flatten_event(true))
                .with(file.map(|f| tfmt::layer().json().with_writer(f).flatten_event(true)));
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }

    tracing::debug!(
        log_level = %config.level,
        log_format = %config.format,
        log_file = ?config.file,
        "Logging initialized"
    );
    Ok(())
}
