//! Heartbeat state: the only state that survives a process restart.

use jiff::Timestamp;
use serde::Serialize;

/// Persisted liveness and watchdog bookkeeping.
///
/// Every field is stored under its own key, so any subset may be missing
/// after a partial write. Missing fields read as their defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatState {
    /// When the last accepted sample proved the agent was alive.
    pub last_heartbeat_at: Option<Timestamp>,

    /// When the armed wake timer fires, if one is armed.
    pub watchdog_scheduled_at: Option<Timestamp>,

    /// Consecutive failed resurrections.
    pub backoff_count: u32,
}

impl HeartbeatState {
    /// Whether a wake timer is armed to fire strictly after `now`.
    pub fn is_armed_after(&self, now: Timestamp) -> bool {
        self.watchdog_scheduled_at.is_some_and(|at| at > now)
    }
}
