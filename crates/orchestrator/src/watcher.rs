//! The request watcher (C7, spec §4.5): the same fold as the processor
//! (C5/C6) but with no C4 wrapping, no remote calls, and no retries. It
//! only ever reads the log and emits observational records; it never
//! appends.

use std::collections::HashMap;
use std::sync::Arc;

use broker_core::{BrokerError, Envelope, Event, EventId};
use event_log::EventLog;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{error, instrument, warn};

use crate::request_state::{OverallState, RequestProjection};

/// One observational record, emitted per event that names a known root
/// (spec §4.5: "root id, derived overall state, attempt").
#[derive(Debug, Clone, PartialEq)]
pub struct WatchRecord {
    /// The id of the `request` envelope this record describes.
    pub root: EventId,
    /// The projection's overall state at the moment this event was folded in.
    pub state: OverallState,
    /// The attempt index the triggering event names, if any (`None` for
    /// the initial `request` record).
    pub attempt: Option<u32>,
}

/// Observes the tail of the log and projects per-root state for reporting
/// only (spec §4.5). Does not call the remote API and does not initiate
/// retries; timeouts are only ever observed as inserted by a `Processor`
/// running elsewhere against the same log.
pub struct Watcher {
    log: Arc<dyn EventLog>,
    retries: i64,
    roots: HashMap<EventId, RequestProjection>,
}

impl Watcher {
    #[must_use]
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        Self { log, retries: 0, roots: HashMap::new() }
    }

    /// Run from `start_after` until the log closes or a sticky error is
    /// observed, emitting a [`WatchRecord`] on `sink` for every event that
    /// names a known root. Returns the sticky error, if any.
    #[instrument(skip(self, sink))]
    pub async fn run(
        mut self,
        start_after: EventId,
        sink: mpsc::UnboundedSender<WatchRecord>,
    ) -> Result<(), BrokerError> {
        let mut events = self.log.follow_events(start_after);
        while let Some(item) = events.next().await {
            match item {
                Ok(envelope) => self.handle_envelope(&envelope, &sink),
                Err(err) => {
                    error!(%err, "event log follower failed, stopping watcher");
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn handle_envelope(&mut self, envelope: &Envelope, sink: &mpsc::UnboundedSender<WatchRecord>) {
        match &envelope.event {
            Event::Configuration { retries, .. } => {
                if *retries >= 0 {
                    self.retries = *retries;
                }
            }
            Event::Request { .. } => {
                let projection = RequestProjection::new(envelope.id, self.retries, String::new());
                let state = projection.overall_state();
                self.roots.insert(envelope.id, projection);
                emit(sink, envelope.id, state, None);
            }
            Event::ApiRequest { attempt } => {
                let attempt = *attempt;
                self.fold(envelope, attempt, sink, |p| p.on_api_request(attempt));
            }
            Event::ApiResponse { attempt, .. } => {
                let attempt = *attempt;
                self.fold(envelope, attempt, sink, |p| p.on_api_response(attempt));
            }
            Event::ApiFailure { attempt, .. } => {
                let attempt = *attempt;
                self.fold(envelope, attempt, sink, |p| {
                    let _ = p.on_api_failure(attempt);
                });
            }
            Event::ApiTimeout { attempt } => {
                let attempt = *attempt;
                self.fold(envelope, attempt, sink, |p| {
                    let _ = p.on_api_timeout(attempt);
                });
            }
        }
    }

    fn fold(
        &mut self,
        envelope: &Envelope,
        attempt: u32,
        sink: &mpsc::UnboundedSender<WatchRecord>,
        apply: impl FnOnce(&mut RequestProjection),
    ) {
        if envelope.causation_id.is_root() {
            error!(id = %envelope.id, "non-root event carries zero causation, discarding");
            return;
        }
        let root = envelope.causation_id;
        let Some(projection) = self.roots.get_mut(&root) else {
            warn!(root = %root, attempt, "event for unknown root, discarding");
            return;
        };
        apply(projection);
        emit(sink, root, projection.overall_state(), Some(attempt));
    }
}

fn emit(sink: &mpsc::UnboundedSender<WatchRecord>, root: EventId, state: OverallState, attempt: Option<u32>) {
    let _ = sink.send(WatchRecord { root, state, attempt });
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_log::InMemoryEventLog;

    fn configure(retries: i64) -> Event {
        Event::Configuration { retries, timeout_seconds: -1.0 }
    }

    #[tokio::test]
    async fn emits_success_record_on_response() {
        let log: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::default());
        log.insert(None, configure(1), EventId::ROOT).await.unwrap();
        let root = log.insert(None, Event::Request { payload: "x".into() }, EventId::ROOT).await.unwrap();
        log.insert(None, Event::ApiRequest { attempt: 0 }, root.id).await.unwrap();
        log.insert(None, Event::ApiResponse { attempt: 0, body: "ok".into() }, root.id).await.unwrap();
        log.close().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher = Watcher::new(log);
        watcher.run(EventId::ROOT, tx).await.unwrap_err();
        // unwrap_err above because close() latches a sticky error the watcher
        // surfaces the same way the processor does; drain what was emitted first.
        let mut last = None;
        while let Ok(rec) = rx.try_recv() {
            last = Some(rec);
        }
        assert_eq!(last.unwrap().state, OverallState::Success);
    }

    #[tokio::test]
    async fn discards_events_for_unknown_root() {
        let log: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::default());
        log.insert(None, Event::ApiResponse { attempt: 0, body: "x".into() }, EventId(999)).await.unwrap();
        log.close().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher = Watcher::new(log);
        let _ = watcher.run(EventId::ROOT, tx).await;
        assert!(rx.try_recv().is_err(), "no record should be emitted for an unknown root");
    }
}
