//! Observation: one fact written to the event log.

use std::fmt;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{CellCandidate, Fix, FixFailure, FixOrigin};

/// A single logged fact: what happened and when.
///
/// Serialized as one JSON line, with the kind's tag and fields
/// flattened next to the timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    /// When the fact was observed.
    pub observed_at: Timestamp,

    #[serde(flatten)]
    pub kind: ObservationKind,
}

impl Observation {
    pub fn new(observed_at: Timestamp, kind: ObservationKind) -> Self {
        Self { observed_at, kind }
    }

    /// The stream this observation belongs to, for per-source ordering.
    pub fn source(&self) -> ObservationSource {
        match self.kind {
            ObservationKind::AttachmentChanged { .. } => ObservationSource::Attachment,
            ObservationKind::FixSucceeded { .. } | ObservationKind::FixFailed { .. } => {
                ObservationSource::Fix
            }
            ObservationKind::Lifecycle { .. } => ObservationSource::Lifecycle,
        }
    }
}

/// What was observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ObservationKind {
    /// The serving cell changed; one entry per cell in the batch.
    AttachmentChanged { cell: CellCandidate },

    /// A fix request completed with a usable position.
    FixSucceeded {
        origin: FixOrigin,
        fix: Fix,

        /// Completion time minus request time.
        latency_ms: i64,

        /// The serving cell last seen before the fix completed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cell: Option<CellCandidate>,
    },

    /// A fix request ended without a usable position.
    FixFailed { origin: FixOrigin, reason: FixFailure },

    /// A scheduling or watchdog transition.
    Lifecycle {
        event: LifecycleEvent,

        /// The process instance that made the transition.
        instance: Uuid,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

/// Independent observation streams. Ordering is guaranteed within a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObservationSource {
    Attachment,
    Fix,
    Lifecycle,
}

/// Watchdog and agent transitions, recorded for post-hoc debugging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleEvent {
    /// A wake timer was armed.
    Scheduled,
    /// A wake timer was cancelled.
    Cancelled,
    /// The wake timer fired without a recent heartbeat.
    SuspectEntered,
    ResurrectionSuccess,
    ResurrectionFailed,
    /// A wake timer was armed at a backoff delay.
    BackoffArmed,
    /// The wake timer fired too soon after a heartbeat and was absorbed.
    StaleWakeIgnored,
    /// The wake timer could not be armed. Nothing will resurrect sampling.
    WatchdogArmFailed,
    AgentStarted,
    AgentStopped,
    ListenerRegistered,
    ListenerUnavailable,
}

impl LifecycleEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Cancelled => "cancelled",
            Self::SuspectEntered => "suspect-entered",
            Self::ResurrectionSuccess => "resurrection-success",
            Self::ResurrectionFailed => "resurrection-failed",
            Self::BackoffArmed => "backoff-armed",
            Self::StaleWakeIgnored => "stale-wake-ignored",
            Self::WatchdogArmFailed => "watchdog-arm-failed",
            Self::AgentStarted => "agent-started",
            Self::AgentStopped => "agent-stopped",
            Self::ListenerRegistered => "listener-registered",
            Self::ListenerUnavailable => "listener-unavailable",
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_serializes_flat_with_kebab_event() {
        let obs = Observation::new(
            Timestamp::from_second(1_700_000_000).unwrap(),
            ObservationKind::Lifecycle {
                event: LifecycleEvent::SuspectEntered,
                instance: Uuid::nil(),
                detail: None,
            },
        );
        let json = serde_json::to_string(&obs).unwrap();
        assert!(json.contains(r#""kind":"lifecycle""#));
        assert!(json.contains(r#""event":"suspect-entered""#));
        assert!(!json.contains("detail"));

        let parsed: Observation = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, obs);
    }

    #[test]
    fn fix_failure_keeps_reason_tag() {
        let obs = Observation::new(
            Timestamp::from_second(1_700_000_000).unwrap(),
            ObservationKind::FixFailed {
                origin: FixOrigin::Resurrection,
                reason: FixFailure::Stale { age_ms: 180_000 },
            },
        );
        let json = serde_json::to_string(&obs).unwrap();
        assert!(json.contains(r#""reason":{"type":"stale","ageMs":180000}"#));
        assert_eq!(obs.source(), ObservationSource::Fix);
    }

    #[test]
    fn lifecycle_event_display_matches_serde_name() {
        for event in [
            LifecycleEvent::BackoffArmed,
            LifecycleEvent::WatchdogArmFailed,
            LifecycleEvent::AgentStarted,
        ] {
            let json = serde_json::to_string(&event).unwrap();
            assert_eq!(json, format!("\"{event}\""));
        }
    }
}
