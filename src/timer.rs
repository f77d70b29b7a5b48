//! Wake timer: a single-slot alarm that pokes the agent at an instant.

use std::{
    sync::{Mutex, PoisonError},
    time::Duration,
};

use jiff::Timestamp;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::debug;

use crate::agent::AgentEvent;

#[derive(Debug, thiserror::Error)]
pub enum TimerError {
    #[error("no async runtime available to host the wake timer")]
    NoRuntime,
}

/// An external alarm with one slot.
///
/// Each successful `arm` yields at most one wake callback. Delivery may be
/// late or duplicated; the watchdog absorbs both.
pub trait WakeTimer: Send + Sync {
    /// Arms the alarm at `at`, replacing any previous one.
    fn arm(&self, at: Timestamp) -> Result<(), TimerError>;

    /// Cancels the alarm if one is pending. Best effort.
    fn cancel(&self);
}

/// Wake timer backed by a tokio task that sends [`AgentEvent::WakeFired`].
pub struct TaskWakeTimer {
    events: mpsc::Sender<AgentEvent>,
    slot: Mutex<Option<JoinHandle<()>>>,
}

impl TaskWakeTimer {
    pub fn new(events: mpsc::Sender<AgentEvent>) -> Self {
        Self {
            events,
            slot: Mutex::new(None),
        }
    }
}

impl WakeTimer for TaskWakeTimer {
    fn arm(&self, at: Timestamp) -> Result<(), TimerError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| TimerError::NoRuntime)?;
        let delay =
            Duration::try_from(at.duration_since(Timestamp::now())).unwrap_or(Duration::ZERO);
        let events = self.events.clone();

        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            debug!(%at, "Wake timer fired");
            // The agent may already be gone; nothing left to wake.
            let _ = events.send(AgentEvent::WakeFired).await;
        });

        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    fn cancel(&self) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = slot.take() {
            task.abort();
        }
    }
}

impl Drop for TaskWakeTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
