//! Heartbeat and watchdog.
//!
//! The manager owns the persisted [`HeartbeatState`] and the wake timer.
//! Every accepted sample pushes the timer out by one nominal interval. If
//! the timer fires first, the agent is suspected dead and gets one bounded
//! resurrection attempt; each consecutive failure pushes the next attempt
//! out along the backoff curve.
//!
//! ```text
//!             heartbeat
//!   Healthy ◄───────────── Suspect ◄──── wake ──── Backoff(n)
//!      │     resurrection ▲   │                        ▲
//!      │         ok       │   └── resurrection fail ───┘
//!      └────── wake ──────┘
//! ```
//!
//! All methods take `&mut self`. The agent calls them from a single loop,
//! which makes each check-then-arm sequence atomic.

mod backoff;

use std::sync::Arc;

use jiff::{SignedDuration, Timestamp};
use tracing::{debug, error, info, warn};

pub use backoff::BackoffPolicy;

use crate::journal::Journal;
use crate::model::{HeartbeatState, LifecycleEvent};
use crate::status::whole_secs;
use crate::storage::{StateStore, clear_heartbeat, load_heartbeat, save_heartbeat};
use crate::timer::{TimerError, WakeTimer};

/// Scheduling policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatchdogPolicy {
    /// Expected time between heartbeats.
    pub nominal_interval: SignedDuration,
    pub backoff: BackoffPolicy,
}

/// Where the watchdog stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Healthy,
    /// A resurrection attempt is in flight.
    Suspect,
    /// `n` consecutive resurrections have failed.
    Backoff(u32),
}

/// What to do about a wake timer firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeDecision {
    /// Start a resurrection attempt.
    Resurrect,
    /// Early, duplicate or superseded firing. Nothing to do.
    Stale,
    /// A resurrection is already in flight.
    Busy,
}

/// How the manager picked up after a process start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// The persisted wake passed while the process was dead.
    WakeDue,
    /// The persisted wake is still ahead and the timer was re-installed.
    Reinstalled(Timestamp),
    /// Nothing was scheduled; armed a fresh nominal interval.
    Armed,
}

pub struct HeartbeatManager {
    policy: WatchdogPolicy,
    store: Box<dyn StateStore>,
    timer: Arc<dyn WakeTimer>,
    journal: Arc<Journal>,
    state: HeartbeatState,
    phase: Phase,
}

impl HeartbeatManager {
    /// Creates a manager from whatever state was persisted.
    pub fn new(
        policy: WatchdogPolicy,
        store: Box<dyn StateStore>,
        timer: Arc<dyn WakeTimer>,
        journal: Arc<Journal>,
    ) -> Self {
        let state = load_heartbeat(store.as_ref());
        let phase = match state.backoff_count {
            0 => Phase::Healthy,
            n => Phase::Backoff(n),
        };
        Self {
            policy,
            store,
            timer,
            journal,
            state,
            phase,
        }
    }

    pub fn state(&self) -> HeartbeatState {
        self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The store the state lives in, for reading other keys.
    pub fn store(&self) -> &dyn StateStore {
        self.store.as_ref()
    }

    /// Picks up the schedule left by the previous process.
    pub fn resume(&mut self, now: Timestamp) -> Resume {
        let detail = match self.state.last_heartbeat_at {
            Some(last) => format!(
                "down {:#} since last heartbeat, backoff {}",
                whole_secs(now.duration_since(last)),
                self.state.backoff_count
            ),
            None => "no prior heartbeat".to_string(),
        };
        self.journal
            .lifecycle(now, LifecycleEvent::AgentStarted, Some(detail));

        let resume = match self.state.watchdog_scheduled_at {
            Some(at) if at <= now => {
                info!(scheduled_at = %at, "Wake was missed while the agent was down");
                Resume::WakeDue
            }
            Some(at) => {
                match self.timer.arm(at) {
                    Ok(()) => self.journal.lifecycle(
                        now,
                        LifecycleEvent::Scheduled,
                        Some(format!("reinstalled for {at}")),
                    ),
                    Err(e) => self.arm_failed(now, &e),
                }
                Resume::Reinstalled(at)
            }
            None => {
                self.arm(
                    later(now, self.policy.nominal_interval),
                    now,
                    LifecycleEvent::Scheduled,
                );
                Resume::Armed
            }
        };
        self.persist();
        resume
    }

    /// An accepted sample proved the agent alive.
    ///
    /// While already healthy the wake is pushed out without a log line, so
    /// a stream of samples doesn't grow the log.
    pub fn record_heartbeat(&mut self, now: Timestamp) {
        if self.phase == Phase::Suspect {
            debug!("Heartbeat arrived while a resurrection was in flight");
        }
        let quiet = self.phase == Phase::Healthy && self.state.watchdog_scheduled_at.is_some();
        self.state.last_heartbeat_at = Some(now);
        self.state.backoff_count = 0;
        self.phase = Phase::Healthy;

        let at = later(now, self.policy.nominal_interval);
        if quiet {
            self.timer.cancel();
            self.state.watchdog_scheduled_at = None;
            if self.install(at, now) {
                debug!(wake_at = %at, "Heartbeat pushed the wake out");
            }
        } else {
            self.disarm(now);
            self.arm(at, now, LifecycleEvent::Scheduled);
        }
        self.persist();
    }

    /// The wake timer fired.
    pub fn on_wake(&mut self, now: Timestamp) -> WakeDecision {
        if self.phase == Phase::Suspect {
            debug!("Wake while a resurrection is in flight; dropping");
            return WakeDecision::Busy;
        }

        if let Some(at) = self.state.watchdog_scheduled_at
            && at > now
        {
            self.journal.lifecycle(
                now,
                LifecycleEvent::StaleWakeIgnored,
                Some(format!("next wake pending at {at}")),
            );
            return WakeDecision::Stale;
        }

        if let Some(last) = self.state.last_heartbeat_at {
            let silent = now.duration_since(last);
            if silent < self.policy.nominal_interval / 2 {
                self.journal.lifecycle(
                    now,
                    LifecycleEvent::StaleWakeIgnored,
                    Some(format!("heartbeat {:#} ago", whole_secs(silent))),
                );
                self.state.watchdog_scheduled_at = None;
                self.phase = Phase::Healthy;
                self.arm(
                    later(last, self.policy.nominal_interval),
                    now,
                    LifecycleEvent::Scheduled,
                );
                self.persist();
                return WakeDecision::Stale;
            }
        }

        let silent = self
            .state
            .last_heartbeat_at
            .map_or_else(|| "never".to_string(), |last| {
                format!("{:#}", whole_secs(now.duration_since(last)))
            });
        self.state.watchdog_scheduled_at = None;
        self.phase = Phase::Suspect;
        self.journal.lifecycle(
            now,
            LifecycleEvent::SuspectEntered,
            Some(format!(
                "no heartbeat for {silent}, attempt {}",
                self.state.backoff_count.saturating_add(1)
            )),
        );
        self.persist();
        WakeDecision::Resurrect
    }

    /// The resurrection attempt finished.
    ///
    /// Ignored unless a resurrection is actually in flight: a heartbeat
    /// that arrived meanwhile has already settled things.
    pub fn on_resurrection(&mut self, now: Timestamp, succeeded: bool) {
        if self.phase != Phase::Suspect {
            debug!(succeeded, "Resurrection result superseded by a heartbeat");
            return;
        }

        if succeeded {
            self.journal
                .lifecycle(now, LifecycleEvent::ResurrectionSuccess, None);
            self.state.last_heartbeat_at = Some(now);
            self.state.backoff_count = 0;
            self.phase = Phase::Healthy;
            self.arm(
                later(now, self.policy.nominal_interval),
                now,
                LifecycleEvent::Scheduled,
            );
        } else {
            let attempt = self.state.backoff_count.saturating_add(1);
            let delay = self.policy.backoff.delay(attempt);
            self.journal.lifecycle(
                now,
                LifecycleEvent::ResurrectionFailed,
                Some(format!("attempt {attempt}")),
            );
            self.state.backoff_count = attempt;
            self.phase = Phase::Backoff(attempt);
            self.arm(later(now, delay), now, LifecycleEvent::BackoffArmed);
        }
        self.persist();
    }

    /// Whether the scheduled wake has passed without being handled.
    ///
    /// The in-process timer sleeps on the monotonic clock, which can lag
    /// wall time after a host suspend.
    pub fn wake_overdue(&self, now: Timestamp) -> bool {
        self.phase != Phase::Suspect
            && self
                .state
                .watchdog_scheduled_at
                .is_some_and(|at| at <= now)
    }

    /// Explicit user stop: disarm and forget everything.
    pub fn stop(&mut self, now: Timestamp) {
        self.disarm(now);
        if let Err(e) = clear_heartbeat(self.store.as_ref()) {
            warn!(error = %e, "Failed to clear heartbeat state");
        }
        self.state = HeartbeatState::default();
        self.phase = Phase::Healthy;
    }

    /// Arms the timer at `at` unless one is already pending.
    fn arm(&mut self, at: Timestamp, now: Timestamp, event: LifecycleEvent) {
        if self.state.is_armed_after(now) {
            debug!(
                scheduled_at = ?self.state.watchdog_scheduled_at,
                requested = %at,
                "Wake timer already armed"
            );
            return;
        }
        if self.install(at, now) {
            self.journal.lifecycle(
                now,
                event,
                Some(format!(
                    "wake at {at}, in {:#}",
                    whole_secs(at.duration_since(now))
                )),
            );
        }
    }

    /// Arms the timer and records the schedule. Returns whether it took.
    fn install(&mut self, at: Timestamp, now: Timestamp) -> bool {
        match self.timer.arm(at) {
            Ok(()) => {
                self.state.watchdog_scheduled_at = Some(at);
                true
            }
            Err(e) => {
                self.arm_failed(now, &e);
                false
            }
        }
    }

    fn disarm(&mut self, now: Timestamp) {
        self.timer.cancel();
        if let Some(at) = self.state.watchdog_scheduled_at.take() {
            self.journal.lifecycle(
                now,
                LifecycleEvent::Cancelled,
                Some(format!("was due at {at}")),
            );
        }
    }

    fn arm_failed(&mut self, now: Timestamp, e: &TimerError) {
        error!(error = %e, "Failed to arm wake timer; the agent will not be resurrected");
        self.state.watchdog_scheduled_at = None;
        self.journal.lifecycle(
            now,
            LifecycleEvent::WatchdogArmFailed,
            Some(e.to_string()),
        );
        self.journal.show("Watchdog unavailable");
    }

    fn persist(&self) {
        if let Err(e) = save_heartbeat(self.store.as_ref(), &self.state) {
            warn!(error = %e, "Failed to persist heartbeat state");
        }
    }
}

/// `at + d`, saturating at the end of representable time.
fn later(at: Timestamp, d: SignedDuration) -> Timestamp {
    at.checked_add(d).unwrap_or(Timestamp::MAX)
}
