//! Debounce and dedup for attachment events.
//!
//! Advisory only: the filter decides whether an event is worth a log line.
//! Heartbeats never depend on its verdict.

use jiff::{SignedDuration, Timestamp};

/// Outcome of running an identifier through the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// New identifier; log it.
    Accept,
    /// Same identifier as the last accepted one.
    Duplicate,
    /// Arrived within the debounce window of the last accepted event.
    Debounced,
}

/// Decides whether `candidate` is novel.
pub fn evaluate(
    candidate: &str,
    last: Option<&str>,
    last_accepted_at: Option<Timestamp>,
    now: Timestamp,
    debounce: SignedDuration,
) -> Verdict {
    if last == Some(candidate) {
        return Verdict::Duplicate;
    }
    if let Some(at) = last_accepted_at
        && now.duration_since(at) < debounce
    {
        return Verdict::Debounced;
    }
    Verdict::Accept
}

/// Per-class filter state: the last accepted identifier and when.
///
/// Held in memory only; every process starts empty.
#[derive(Debug, Clone)]
pub struct DedupFilter {
    debounce: SignedDuration,
    last: Option<String>,
    last_accepted_at: Option<Timestamp>,
}

impl DedupFilter {
    pub fn new(debounce: SignedDuration) -> Self {
        Self {
            debounce,
            last: None,
            last_accepted_at: None,
        }
    }

    /// Runs `candidate` through the filter, recording it if accepted.
    pub fn check(&mut self, candidate: &str, now: Timestamp) -> Verdict {
        let verdict = evaluate(
            candidate,
            self.last.as_deref(),
            self.last_accepted_at,
            now,
            self.debounce,
        );
        if verdict == Verdict::Accept {
            self.last = Some(candidate.to_string());
            self.last_accepted_at = Some(now);
        }
        verdict
    }

    pub fn last(&self) -> Option<&str> {
        self.last.as_deref()
    }
}
