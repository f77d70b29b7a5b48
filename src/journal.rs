//! The journal: every observation and status update goes through here.
//!
//! Sink and display failures stop at this boundary. Losing a log line is
//! acceptable; losing the heartbeat update that follows it is not.

use std::sync::Arc;

use jiff::Timestamp;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::model::{LifecycleEvent, Observation, ObservationKind};
use crate::status::StatusDisplay;
use crate::storage::EventSink;

pub struct Journal {
    sink: Arc<dyn EventSink>,
    status: Arc<dyn StatusDisplay>,
    instance: Uuid,
}

impl Journal {
    /// Creates a journal for a fresh process instance.
    pub fn new(sink: Arc<dyn EventSink>, status: Arc<dyn StatusDisplay>) -> Self {
        Self {
            sink,
            status,
            instance: Uuid::new_v4(),
        }
    }

    /// Identifies this process in lifecycle observations.
    pub fn instance(&self) -> Uuid {
        self.instance
    }

    /// Appends an observation, logging and dropping any sink failure.
    pub fn record(&self, observation: &Observation) {
        if let Err(e) = self.sink.append(observation) {
            warn!(error = %e, kind = ?observation.kind, "Failed to append observation");
        }
    }

    /// Records a lifecycle transition.
    pub fn lifecycle(&self, at: Timestamp, event: LifecycleEvent, detail: Option<String>) {
        info!(event = %event, detail = detail.as_deref().unwrap_or(""), "Lifecycle");
        self.record(&Observation::new(
            at,
            ObservationKind::Lifecycle {
                event,
                instance: self.instance,
                detail,
            },
        ));
    }

    /// Shows a status line. Best effort.
    pub fn show(&self, text: &str) {
        debug!(status = text, "Status");
        if let Err(e) = self.status.show(text) {
            warn!(error = %e, "Failed to update status display");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testing::{FailingSink, MemorySink, MemoryStatus};

    #[test]
    fn lifecycle_carries_instance_id() {
        let sink = Arc::new(MemorySink::default());
        let journal = Journal::new(sink.clone(), Arc::new(MemoryStatus::default()));

        journal.lifecycle(
            Timestamp::from_second(10).unwrap(),
            LifecycleEvent::AgentStarted,
            Some("first start".into()),
        );

        let logged = sink.observations();
        assert_eq!(logged.len(), 1);
        assert!(matches!(
            &logged[0].kind,
            ObservationKind::Lifecycle { instance, event: LifecycleEvent::AgentStarted, .. }
                if *instance == journal.instance()
        ));
    }

    #[test]
    fn sink_failure_is_swallowed() {
        let journal = Journal::new(Arc::new(FailingSink), Arc::new(MemoryStatus::default()));
        // Must not panic or propagate.
        journal.lifecycle(
            Timestamp::from_second(10).unwrap(),
            LifecycleEvent::Scheduled,
            None,
        );
    }

    #[test]
    fn show_reaches_display() {
        let status = Arc::new(MemoryStatus::default());
        let journal = Journal::new(Arc::new(MemorySink::default()), status.clone());

        journal.show("Tower: 1 | Last Fix: 10 ms");

        assert_eq!(status.lines(), vec!["Tower: 1 | Last Fix: 10 ms".to_string()]);
    }
}
