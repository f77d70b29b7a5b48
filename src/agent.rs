//! The agent: one loop that owns the sampler and the watchdog.
//!
//! Everything that changes state arrives as a message on this loop: cadence
//! ticks, attachment batches, wake firings and fix completions. Fix requests
//! are the only work that runs elsewhere, in spawned tasks bounded by a
//! timeout, and they report back through the same channel.
//!
//! Each listener registration gets its own batch channel. When the source
//! drops its sender the listener is gone, and the next cadence tick
//! registers a new one.

use std::{future::Future, sync::Arc, time::Duration};

use jiff::{SignedDuration, Timestamp};
use tokio::{sync::mpsc, task::JoinSet, time::MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::journal::Journal;
use crate::model::{CellCandidate, Fix, FixFailure, FixOrigin, LifecycleEvent};
use crate::sampler::{FixRequest, Sampler};
use crate::source::{SourceError, Sources};
use crate::status::StatusFile;
use crate::storage::{StateStore, Storage, StorageError, is_stop_requested};
use crate::timer::TaskWakeTimer;
use crate::watchdog::{HeartbeatManager, Resume, WakeDecision, WatchdogPolicy};

const CHANNEL_CAPACITY: usize = 64;

/// Messages delivered to the agent loop from outside it.
#[derive(Debug)]
pub enum AgentEvent {
    /// The wake timer went off.
    WakeFired,

    /// A fix request reached its terminal outcome.
    FixCompleted {
        request: FixRequest,
        outcome: Result<Fix, FixFailure>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Why the loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// The process is going away. The schedule is kept for the next start.
    Shutdown,
    /// The user withdrew the run request. The schedule was cleared.
    StopRequested,
}

/// Timing knobs, taken from [`Config`].
#[derive(Debug, Clone, Copy)]
pub struct AgentSettings {
    pub policy: WatchdogPolicy,
    pub fix_timeout: SignedDuration,
    pub resurrection_timeout: SignedDuration,
    pub freshness: SignedDuration,
    pub debounce: SignedDuration,
}

impl From<&Config> for AgentSettings {
    fn from(config: &Config) -> Self {
        Self {
            policy: config.watchdog_policy(),
            fix_timeout: config.sampling.fix_timeout,
            resurrection_timeout: config.watchdog.resurrection_timeout,
            freshness: config.watchdog.freshness,
            debounce: config.dedup.debounce,
        }
    }
}

pub struct Agent {
    settings: AgentSettings,
    sources: Sources,
    journal: Arc<Journal>,
    sampler: Sampler,
    manager: HeartbeatManager,
    fixes: JoinSet<()>,
    events_tx: mpsc::Sender<AgentEvent>,
    events_rx: mpsc::Receiver<AgentEvent>,

    /// Batches from the current listener, if one is registered.
    batches: Option<mpsc::Receiver<Vec<CellCandidate>>>,

    /// The listener ended on its own and should be registered again.
    relisten: bool,
}

impl Agent {
    /// Builds an agent over the files in `storage`.
    pub fn open(config: &Config, storage: &Storage, sources: Sources) -> Result<Self, AgentError> {
        let state = storage.open_state()?;
        let journal = Arc::new(Journal::new(
            Arc::new(storage.event_log()),
            Arc::new(StatusFile::new(storage.status_path())),
        ));
        Ok(Self::new(config.into(), sources, Box::new(state), journal))
    }

    pub fn new(
        settings: AgentSettings,
        sources: Sources,
        state: Box<dyn StateStore>,
        journal: Arc<Journal>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let timer = Arc::new(TaskWakeTimer::new(events_tx.clone()));
        let manager = HeartbeatManager::new(settings.policy, state, timer, Arc::clone(&journal));
        let sampler = Sampler::new(Arc::clone(&journal), settings.debounce, settings.freshness);
        Self {
            settings,
            sources,
            journal,
            sampler,
            manager,
            fixes: JoinSet::new(),
            events_tx,
            events_rx,
            batches: None,
            relisten: false,
        }
    }

    /// Runs until `shutdown` resolves or the run request is withdrawn.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Exit {
        let now = Timestamp::now();
        info!(instance = %self.journal.instance(), "Agent starting");
        self.sampler.show_status();
        let resume = self.manager.resume(now);
        self.register_listener(now);
        match resume {
            Resume::WakeDue => self.handle_wake(now),
            Resume::Reinstalled(at) => debug!(%at, "Resuming the previous schedule"),
            Resume::Armed => {}
        }

        let mut ticker = tokio::time::interval(to_std(self.settings.policy.nominal_interval));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        let exit = loop {
            tokio::select! {
                () = &mut shutdown => break Exit::Shutdown,
                _ = ticker.tick() => {
                    if is_stop_requested(self.manager.store()) {
                        break Exit::StopRequested;
                    }
                    self.on_tick(Timestamp::now());
                }
                batch = next_batch(&mut self.batches), if self.batches.is_some() => {
                    let now = Timestamp::now();
                    match batch {
                        Some(batch) => {
                            if self.sampler.on_attachment_event(&batch, now).is_some() {
                                self.manager.record_heartbeat(now);
                            }
                        }
                        None => self.listener_lost(now),
                    }
                }
                Some(event) = self.events_rx.recv() => self.handle_event(event, Timestamp::now()),
                Some(joined) = self.fixes.join_next(), if !self.fixes.is_empty() => {
                    if let Err(e) = joined
                        && e.is_panic()
                    {
                        error!(error = %e, "Fix task panicked");
                    }
                }
            }
        };

        self.finish(exit, Timestamp::now());
        exit
    }

    fn on_tick(&mut self, now: Timestamp) {
        debug!(phase = ?self.manager.phase(), "Cadence tick");
        // The wake timer sleeps on the monotonic clock, which stands still
        // while the host is suspended.
        if self.manager.wake_overdue(now) {
            self.handle_wake(now);
        }
        if self.relisten {
            self.register_listener(now);
        }
        if let Some(request) = self.sampler.begin_periodic_fix(now) {
            self.spawn_fix(request, self.settings.fix_timeout);
        }
    }

    fn handle_event(&mut self, event: AgentEvent, now: Timestamp) {
        match event {
            AgentEvent::WakeFired => self.handle_wake(now),
            AgentEvent::FixCompleted { request, outcome } => {
                let Some(succeeded) = self.sampler.complete_fix(request, outcome, now) else {
                    return;
                };
                match request.origin {
                    FixOrigin::Periodic if succeeded => self.manager.record_heartbeat(now),
                    FixOrigin::Periodic => {}
                    FixOrigin::Resurrection => self.manager.on_resurrection(now, succeeded),
                }
            }
        }
    }

    fn handle_wake(&mut self, now: Timestamp) {
        // Its result must not settle a newer attempt.
        if self.sampler.resurrection_in_flight() {
            debug!("Previous resurrection fix still running; deferring wake");
            return;
        }
        if self.manager.on_wake(now) != WakeDecision::Resurrect {
            return;
        }
        // The host may have dropped the listener along with the process.
        self.register_listener(now);
        let request = self.sampler.begin_resurrection_fix(now);
        self.spawn_fix(request, self.settings.resurrection_timeout);
    }

    fn register_listener(&mut self, now: Timestamp) {
        self.relisten = false;
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        match self.sources.attachment.register(tx) {
            Ok(()) => {
                self.batches = Some(rx);
                self.journal
                    .lifecycle(now, LifecycleEvent::ListenerRegistered, None);
            }
            Err(e) => {
                warn!(error = %e, "Attachment listener unavailable");
                self.journal.lifecycle(
                    now,
                    LifecycleEvent::ListenerUnavailable,
                    Some(e.to_string()),
                );
            }
        }
    }

    fn listener_lost(&mut self, now: Timestamp) {
        warn!("Attachment listener ended; registering again at the next tick");
        self.batches = None;
        self.relisten = true;
        self.journal.lifecycle(
            now,
            LifecycleEvent::ListenerUnavailable,
            Some("listener ended".to_string()),
        );
    }

    fn spawn_fix(&mut self, request: FixRequest, limit: SignedDuration) {
        let source = Arc::clone(&self.sources.fix);
        let events = self.events_tx.clone();
        let limit = to_std(limit);

        self.fixes.spawn(async move {
            // Dropping the request future on timeout cancels it.
            let outcome = match tokio::time::timeout(limit, source.request_fix()).await {
                Ok(Ok(fix)) => Ok(fix),
                Ok(Err(e)) => Err(failure_from(e)),
                Err(_) => Err(FixFailure::Timeout),
            };
            // The agent may have exited; the outcome is then logged as cancelled.
            let _ = events
                .send(AgentEvent::FixCompleted { request, outcome })
                .await;
        });
    }

    fn finish(&mut self, exit: Exit, now: Timestamp) {
        self.sources.attachment.unregister();
        self.fixes.abort_all();
        self.sampler.abandon_in_flight(now);

        let detail = match exit {
            Exit::Shutdown => "shutdown; schedule kept for next start",
            Exit::StopRequested => {
                self.manager.stop(now);
                "stop requested; schedule cleared"
            }
        };
        self.journal
            .lifecycle(now, LifecycleEvent::AgentStopped, Some(detail.to_string()));
        self.journal.show("Stopped");
        info!(?exit, state = ?self.manager.state(), "Agent stopped");
    }
}

async fn next_batch(
    batches: &mut Option<mpsc::Receiver<Vec<CellCandidate>>>,
) -> Option<Vec<CellCandidate>> {
    match batches {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn failure_from(e: SourceError) -> FixFailure {
    match e {
        SourceError::Unavailable(message) => FixFailure::SourceUnavailable { message },
        SourceError::NoFix => FixFailure::NoFix,
        SourceError::Failed(message) => FixFailure::Error { message },
    }
}

/// Converts a policy duration for tokio. Non-positive becomes one millisecond.
fn to_std(d: SignedDuration) -> Duration {
    Duration::try_from(d)
        .unwrap_or(Duration::ZERO)
        .max(Duration::from_millis(1))
}
