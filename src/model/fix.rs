//! Fixes: discrete positioning results and the ways a request can fail.

use std::fmt;

use jiff::{SignedDuration, Timestamp};
use serde::{Deserialize, Serialize};

/// A positioning result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fix {
    pub latitude: f64,
    pub longitude: f64,

    /// Horizontal accuracy radius in meters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,

    /// When the fix was taken, which may be earlier than when it was delivered.
    pub time: Timestamp,
}

impl Fix {
    /// How old the fix is at `now`. Never negative.
    pub fn age(&self, now: Timestamp) -> SignedDuration {
        now.duration_since(self.time).max(SignedDuration::ZERO)
    }
}

/// Why a fix was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FixOrigin {
    /// The regular sampling cadence.
    Periodic,

    /// A one-shot request issued by the watchdog after a missed heartbeat.
    Resurrection,
}

/// Terminal failure of a fix request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum FixFailure {
    /// The bounded wait ran out and the request was cancelled.
    Timeout,

    /// Permission or hardware denial; the request never ran.
    SourceUnavailable { message: String },

    /// The source answered without a position.
    NoFix,

    /// The source reported an error.
    Error { message: String },

    /// A fix arrived but was older than the freshness threshold.
    Stale { age_ms: i64 },

    /// The agent shut down while the request was in flight.
    Cancelled,
}

impl fmt::Display for FixFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "Timeout"),
            Self::SourceUnavailable { message } => write!(f, "Unavailable: {message}"),
            Self::NoFix => write!(f, "No Fix"),
            Self::Error { message } => write!(f, "API Error: {message}"),
            Self::Stale { age_ms } => write!(f, "Stale ({}s old)", age_ms / 1000),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}
