//! Sampler: turns attachment batches and fix results into observations.
//!
//! The sampler does no I/O of its own. The agent feeds it events and runs
//! the fix requests it hands out; the sampler decides what gets logged and
//! keeps the status line current.

use std::sync::Arc;

use jiff::{SignedDuration, Timestamp};
use tracing::{debug, info};

use crate::dedup::{DedupFilter, Verdict};
use crate::journal::Journal;
use crate::model::{
    CellCandidate, Fix, FixFailure, FixOrigin, Observation, ObservationKind, primary,
};
use crate::status::status_line;

/// A fix request handed out by the sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixRequest {
    pub origin: FixOrigin,
    pub requested_at: Timestamp,
}

pub struct Sampler {
    journal: Arc<Journal>,
    dedup: DedupFilter,

    /// Oldest fix a resurrection accepts.
    freshness: SignedDuration,

    /// Latest primary cell, attached to fix observations.
    last_primary: Option<CellCandidate>,

    /// Right-hand side of the status line.
    last_fix: String,

    /// Requests that have not reached a terminal observation yet.
    in_flight: Vec<FixRequest>,
}

impl Sampler {
    pub fn new(journal: Arc<Journal>, debounce: SignedDuration, freshness: SignedDuration) -> Self {
        Self {
            journal,
            dedup: DedupFilter::new(debounce),
            freshness,
            last_primary: None,
            last_fix: "Starting...".to_string(),
            in_flight: Vec::new(),
        }
    }

    /// Handles one attachment batch.
    ///
    /// Returns `None` if the batch has no primary cell. Otherwise the batch
    /// counts as a heartbeat whatever the verdict.
    pub fn on_attachment_event(
        &mut self,
        batch: &[CellCandidate],
        now: Timestamp,
    ) -> Option<Verdict> {
        let Some(serving) = primary(batch) else {
            debug!(cells = batch.len(), "Attachment batch without a primary cell");
            return None;
        };

        let previous = self.dedup.last().map(str::to_owned);
        let verdict = self.dedup.check(&serving.identifier, now);
        self.last_primary = Some(serving.clone());

        match verdict {
            Verdict::Accept => {
                info!(
                    cell = %serving.identifier,
                    previous = previous.as_deref().unwrap_or("none"),
                    neighbours = batch.len() - 1,
                    "Serving cell changed"
                );
                for cell in batch {
                    self.journal.record(&Observation::new(
                        now,
                        ObservationKind::AttachmentChanged { cell: cell.clone() },
                    ));
                }
                self.show_status();
            }
            Verdict::Duplicate | Verdict::Debounced => {
                debug!(cell = %serving.identifier, ?verdict, "Attachment event discarded");
            }
        }
        Some(verdict)
    }

    /// Starts a periodic fix unless one is already running.
    pub fn begin_periodic_fix(&mut self, now: Timestamp) -> Option<FixRequest> {
        if self
            .in_flight
            .iter()
            .any(|r| r.origin == FixOrigin::Periodic)
        {
            debug!("Periodic fix still running; skipping this cycle");
            return None;
        }
        Some(self.begin(FixOrigin::Periodic, now))
    }

    /// Whether a resurrection fix has not finished yet.
    pub fn resurrection_in_flight(&self) -> bool {
        self.in_flight
            .iter()
            .any(|r| r.origin == FixOrigin::Resurrection)
    }

    /// Starts the one-shot fix of a resurrection attempt.
    pub fn begin_resurrection_fix(&mut self, now: Timestamp) -> FixRequest {
        self.begin(FixOrigin::Resurrection, now)
    }

    fn begin(&mut self, origin: FixOrigin, now: Timestamp) -> FixRequest {
        let request = FixRequest {
            origin,
            requested_at: now,
        };
        self.in_flight.push(request);
        request
    }

    /// Records the terminal outcome of `request`.
    ///
    /// Returns whether a usable fix was logged, or `None` if the request
    /// had already finished. Every request logs exactly once.
    pub fn complete_fix(
        &mut self,
        request: FixRequest,
        outcome: Result<Fix, FixFailure>,
        now: Timestamp,
    ) -> Option<bool> {
        let Some(index) = self.in_flight.iter().position(|r| *r == request) else {
            debug!(?request, "Completion for a request that already finished");
            return None;
        };
        self.in_flight.swap_remove(index);

        let outcome = outcome.and_then(|fix| self.check_freshness(request.origin, fix, now));
        let succeeded = match outcome {
            Ok(fix) => {
                let latency_ms = millis(now.duration_since(request.requested_at));
                info!(origin = ?request.origin, latency_ms, "Fix succeeded");
                self.journal.record(&Observation::new(
                    now,
                    ObservationKind::FixSucceeded {
                        origin: request.origin,
                        fix,
                        latency_ms,
                        cell: self.last_primary.clone(),
                    },
                ));
                self.last_fix = format!("{latency_ms} ms");
                true
            }
            Err(reason) => {
                info!(origin = ?request.origin, %reason, "Fix failed");
                self.last_fix = reason.to_string();
                self.journal.record(&Observation::new(
                    now,
                    ObservationKind::FixFailed {
                        origin: request.origin,
                        reason,
                    },
                ));
                false
            }
        };
        self.show_status();
        Some(succeeded)
    }

    /// Logs a cancellation for every request still in flight.
    pub fn abandon_in_flight(&mut self, now: Timestamp) {
        for request in std::mem::take(&mut self.in_flight) {
            self.journal.record(&Observation::new(
                now,
                ObservationKind::FixFailed {
                    origin: request.origin,
                    reason: FixFailure::Cancelled,
                },
            ));
        }
    }

    /// Resurrection fixes must be recent; a cached position proves nothing.
    fn check_freshness(
        &self,
        origin: FixOrigin,
        fix: Fix,
        now: Timestamp,
    ) -> Result<Fix, FixFailure> {
        if origin == FixOrigin::Resurrection {
            let age = fix.age(now);
            if age > self.freshness {
                return Err(FixFailure::Stale {
                    age_ms: millis(age),
                });
            }
        }
        Ok(fix)
    }

    pub fn status_line(&self) -> String {
        status_line(
            self.last_primary.as_ref().map(|c| c.identifier.as_str()),
            &self.last_fix,
        )
    }

    pub fn show_status(&self) {
        self.journal.show(&self.status_line());
    }
}

fn millis(d: SignedDuration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testing::{MemorySink, MemoryStatus, journal, ts};

    fn sampler() -> (Sampler, Arc<MemorySink>, Arc<MemoryStatus>) {
        let (sink, status, journal) = journal();
        let sampler = Sampler::new(
            journal,
            SignedDuration::from_secs(5),
            SignedDuration::from_mins(2),
        );
        (sampler, sink, status)
    }

    fn cell(id: &str, quality: i32, is_primary: bool) -> CellCandidate {
        CellCandidate {
            identifier: id.into(),
            area: Some("310".into()),
            quality: Some(quality),
            is_primary,
        }
    }

    fn fix_at(time: Timestamp) -> Fix {
        Fix {
            latitude: 47.6,
            longitude: -122.3,
            accuracy: Some(12.0),
            time,
        }
    }

    #[test]
    fn accepted_batch_logs_every_candidate() {
        let (mut s, sink, status) = sampler();

        let verdict = s.on_attachment_event(
            &[cell("n1", -101, false), cell("p", -85, true), cell("n2", -110, false)],
            ts(10),
        );

        assert_eq!(verdict, Some(Verdict::Accept));
        let logged = sink.observations();
        assert_eq!(logged.len(), 3);
        assert!(logged.iter().all(|o| o.observed_at == ts(10)));
        assert_eq!(status.lines().last().unwrap(), "Tower: p | Last Fix: Starting...");
    }

    #[test]
    fn repeated_primary_logs_once() {
        let (mut s, sink, _status) = sampler();
        let batch = [cell("p", -85, true)];

        assert_eq!(s.on_attachment_event(&batch, ts(0)), Some(Verdict::Accept));
        assert_eq!(s.on_attachment_event(&batch, ts(1)), Some(Verdict::Duplicate));
        assert_eq!(s.on_attachment_event(&batch, ts(60)), Some(Verdict::Duplicate));

        assert_eq!(sink.observations().len(), 1);
    }

    #[test]
    fn batch_without_primary_is_ignored() {
        let (mut s, sink, _status) = sampler();

        assert_eq!(s.on_attachment_event(&[cell("n", -100, false)], ts(0)), None);
        assert_eq!(s.on_attachment_event(&[], ts(0)), None);

        assert!(sink.observations().is_empty());
    }

    #[test]
    fn periodic_fix_reports_latency_and_cell() {
        let (mut s, sink, status) = sampler();
        s.on_attachment_event(&[cell("p", -85, true)], ts(0));
        let start = ts(100);
        let request = s.begin_periodic_fix(start).unwrap();

        let done = start + SignedDuration::from_millis(800);
        assert_eq!(s.complete_fix(request, Ok(fix_at(done)), done), Some(true));

        let logged = sink.observations();
        match &logged.last().unwrap().kind {
            ObservationKind::FixSucceeded {
                origin,
                latency_ms,
                cell,
                ..
            } => {
                assert_eq!(*origin, FixOrigin::Periodic);
                assert_eq!(*latency_ms, 800);
                assert_eq!(cell.as_ref().unwrap().identifier, "p");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(status.lines().last().unwrap(), "Tower: p | Last Fix: 800 ms");
    }

    #[test]
    fn only_one_periodic_fix_in_flight() {
        let (mut s, _sink, _status) = sampler();

        let first = s.begin_periodic_fix(ts(0)).unwrap();
        assert!(s.begin_periodic_fix(ts(300)).is_none());

        s.complete_fix(first, Err(FixFailure::Timeout), ts(240));
        assert!(s.begin_periodic_fix(ts(300)).is_some());
    }

    #[test]
    fn every_request_terminates_exactly_once() {
        let (mut s, sink, _status) = sampler();
        let request = s.begin_periodic_fix(ts(0)).unwrap();

        assert_eq!(s.complete_fix(request, Err(FixFailure::Timeout), ts(240)), Some(false));
        // A late answer after the timeout must not log a second outcome.
        assert_eq!(s.complete_fix(request, Ok(fix_at(ts(241))), ts(241)), None);

        let fixes = sink
            .observations()
            .into_iter()
            .filter(|o| o.source() == crate::model::ObservationSource::Fix)
            .count();
        assert_eq!(fixes, 1);
    }

    #[test]
    fn stale_resurrection_fix_is_rejected() {
        let (mut s, sink, status) = sampler();
        let request = s.begin_resurrection_fix(ts(1_000));

        let fix = fix_at(ts(1_000) - SignedDuration::from_mins(3));
        assert_eq!(s.complete_fix(request, Ok(fix), ts(1_002)), Some(false));

        match &sink.observations()[0].kind {
            ObservationKind::FixFailed { origin, reason } => {
                assert_eq!(*origin, FixOrigin::Resurrection);
                assert_eq!(*reason, FixFailure::Stale { age_ms: 182_000 });
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(status.lines().last().unwrap(), "Tower: N/A | Last Fix: Stale (182s old)");
    }

    #[test]
    fn fresh_resurrection_fix_is_accepted() {
        let (mut s, _sink, _status) = sampler();
        let request = s.begin_resurrection_fix(ts(1_000));

        assert_eq!(s.complete_fix(request, Ok(fix_at(ts(990))), ts(1_005)), Some(true));
    }

    #[test]
    fn resurrection_in_flight_until_completed() {
        let (mut s, _sink, _status) = sampler();
        assert!(!s.resurrection_in_flight());

        s.begin_periodic_fix(ts(0)).unwrap();
        assert!(!s.resurrection_in_flight());

        let request = s.begin_resurrection_fix(ts(0));
        assert!(s.resurrection_in_flight());

        s.complete_fix(request, Err(FixFailure::Timeout), ts(30));
        assert!(!s.resurrection_in_flight());
    }

    #[test]
    fn periodic_fix_skips_freshness_check() {
        let (mut s, _sink, _status) = sampler();
        let request = s.begin_periodic_fix(ts(1_000)).unwrap();

        assert_eq!(s.complete_fix(request, Ok(fix_at(ts(0))), ts(1_001)), Some(true));
    }

    #[test]
    fn abandoned_requests_log_cancellation() {
        let (mut s, sink, _status) = sampler();
        let request = s.begin_periodic_fix(ts(0)).unwrap();

        s.abandon_in_flight(ts(5));

        assert!(matches!(
            &sink.observations()[0].kind,
            ObservationKind::FixFailed { reason: FixFailure::Cancelled, .. }
        ));
        assert_eq!(s.complete_fix(request, Ok(fix_at(ts(6))), ts(6)), None);
    }
}
