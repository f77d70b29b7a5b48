//! In-memory fakes for the collaborator traits.

use std::{
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use jiff::Timestamp;

use crate::journal::Journal;
use crate::model::{CellCandidate, Fix, LifecycleEvent, Observation, ObservationKind};
use crate::source::{AttachmentSource, BatchSender, FixSource, SourceError};
use crate::status::StatusDisplay;
use crate::storage::{EventSink, SinkError};
use crate::timer::{TimerError, WakeTimer};

/// Seconds past a fixed, arbitrary epoch.
pub fn ts(seconds: i64) -> Timestamp {
    Timestamp::from_second(1_700_000_000 + seconds).unwrap()
}

/// A journal over in-memory sink and status display.
pub fn journal() -> (Arc<MemorySink>, Arc<MemoryStatus>, Arc<Journal>) {
    let sink = Arc::new(MemorySink::default());
    let status = Arc::new(MemoryStatus::default());
    let journal = Arc::new(Journal::new(sink.clone(), status.clone()));
    (sink, status, journal)
}

#[derive(Default)]
pub struct MemorySink {
    observations: Mutex<Vec<Observation>>,
}

impl MemorySink {
    pub fn observations(&self) -> Vec<Observation> {
        self.observations.lock().unwrap().clone()
    }

    pub fn lifecycle_events(&self) -> Vec<LifecycleEvent> {
        self.observations()
            .into_iter()
            .filter_map(|o| match o.kind {
                ObservationKind::Lifecycle { event, .. } => Some(event),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for MemorySink {
    fn append(&self, observation: &Observation) -> Result<(), SinkError> {
        self.observations.lock().unwrap().push(observation.clone());
        Ok(())
    }
}

/// A sink whose disk is always full.
pub struct FailingSink;

impl EventSink for FailingSink {
    fn append(&self, _observation: &Observation) -> Result<(), SinkError> {
        Err(SinkError::Io(io::Error::other("no space left on device")))
    }
}

#[derive(Default)]
pub struct MemoryStatus {
    lines: Mutex<Vec<String>>,
}

impl MemoryStatus {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl StatusDisplay for MemoryStatus {
    fn show(&self, text: &str) -> io::Result<()> {
        self.lines.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

/// Records arms and cancels instead of waking anything.
#[derive(Default)]
pub struct FakeTimer {
    pending: Mutex<Option<Timestamp>>,
    arms: Mutex<Vec<Timestamp>>,
    overlapping: AtomicUsize,
    fail: AtomicBool,
}

impl FakeTimer {
    pub fn pending(&self) -> Option<Timestamp> {
        *self.pending.lock().unwrap()
    }

    pub fn arms(&self) -> Vec<Timestamp> {
        self.arms.lock().unwrap().clone()
    }

    /// Arms made while another alarm was still pending.
    pub fn overlapping_arms(&self) -> usize {
        self.overlapping.load(Ordering::SeqCst)
    }

    /// The pending alarm went off.
    pub fn fired(&self) {
        self.pending.lock().unwrap().take();
    }

    pub fn fail_arms(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

impl WakeTimer for FakeTimer {
    fn arm(&self, at: Timestamp) -> Result<(), TimerError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TimerError::NoRuntime);
        }
        let mut pending = self.pending.lock().unwrap();
        if pending.is_some() {
            self.overlapping.fetch_add(1, Ordering::SeqCst);
        }
        *pending = Some(at);
        self.arms.lock().unwrap().push(at);
        Ok(())
    }

    fn cancel(&self) {
        self.pending.lock().unwrap().take();
    }
}

/// How a [`FakeFixSource`] answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixBehavior {
    /// A fix taken right now.
    Fresh,
    Fail,
    /// Never answers.
    Hang,
}

pub struct FakeFixSource {
    behavior: FixBehavior,
    calls: AtomicUsize,
}

impl FakeFixSource {
    pub fn new(behavior: FixBehavior) -> Self {
        Self {
            behavior,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FixSource for FakeFixSource {
    async fn request_fix(&self) -> Result<Fix, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            FixBehavior::Fresh => Ok(Fix {
                latitude: 59.33,
                longitude: 18.06,
                accuracy: Some(5.0),
                time: Timestamp::now(),
            }),
            FixBehavior::Fail => Err(SourceError::Failed("receiver busy".into())),
            FixBehavior::Hang => std::future::pending().await,
        }
    }
}

/// Hands the registered sender to the test so it can push batches.
#[derive(Default)]
pub struct FakeAttachmentSource {
    sender: Mutex<Option<BatchSender>>,
    registrations: AtomicUsize,
}

impl FakeAttachmentSource {
    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    /// Delivers a batch to the current listener, if any.
    pub async fn deliver(&self, batch: Vec<CellCandidate>) -> bool {
        let sender = self.sender.lock().unwrap().clone();
        match sender {
            Some(tx) => tx.send(batch).await.is_ok(),
            None => false,
        }
    }
}

impl AttachmentSource for FakeAttachmentSource {
    fn register(&self, batches: BatchSender) -> Result<(), SourceError> {
        self.registrations.fetch_add(1, Ordering::SeqCst);
        *self.sender.lock().unwrap() = Some(batches);
        Ok(())
    }

    fn unregister(&self) {
        self.sender.lock().unwrap().take();
    }
}
