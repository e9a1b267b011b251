//! The request processor (C6, spec §4.4): consumes the tail of the log
//! through the timeout interceptor, folds observed events into per-root
//! projections, and runs the retry-decision procedure — the heart of the
//! design — to decide whether to issue another attempt.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use broker_core::{BrokerError, Envelope, Event, EventId};
use event_log::EventLog;
use futures::{FutureExt, StreamExt};
use tracing::{debug, error, instrument, warn};

use crate::adapter::{AdapterOutcome, RemoteApiAdapter};
use crate::request_state::RequestProjection;

/// Local mutable policy, pushed into the wrapped log's timeout interceptor
/// by virtue of observing the same `configuration` events on the wire
/// (Open Question Q2). Negative fields mean "leave unchanged"; a zero
/// timeout disables it.
#[derive(Debug, Clone, Copy)]
struct Policy {
    retries: i64,
    timeout_seconds: f64,
}

impl Default for Policy {
    fn default() -> Self {
        Self { retries: 0, timeout_seconds: 5.0 }
    }
}

/// Drives requests observed on the log through the remote API, appending
/// every intermediate fact back onto the log. Construct with a log handle
/// already wrapped by [`timeout_log::TimeoutEventLog`]; the processor
/// itself only ever appends events, it never schedules timeouts directly.
pub struct Processor {
    log: Arc<dyn EventLog>,
    adapter: Arc<dyn RemoteApiAdapter>,
    policy: Policy,
    roots_in_flight: HashMap<EventId, RequestProjection>,
    /// Roots already warned about landing in timeout-disabled forever-pending
    /// territory (Open Question Q3), so the warning fires at most once per
    /// request rather than once per silent attempt.
    neither_warned: Arc<Mutex<HashSet<EventId>>>,
}

impl Processor {
    #[must_use]
    pub fn new(log: Arc<dyn EventLog>, adapter: Arc<dyn RemoteApiAdapter>) -> Self {
        Self {
            log,
            adapter,
            policy: Policy::default(),
            roots_in_flight: HashMap::new(),
            neither_warned: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Run the main loop from `start_after` until the log closes or a
    /// sticky error is observed; that error, if any, is returned to the
    /// caller (spec §4.4, "Failure model").
    #[instrument(skip(self))]
    pub async fn run(mut self, start_after: EventId) -> Result<(), BrokerError> {
        let mut events = self.log.follow_events(start_after);
        while let Some(item) = events.next().await {
            match item {
                Ok(envelope) => self.handle_envelope(&envelope).await,
                Err(err) => {
                    error!(%err, "event log follower failed, stopping processor");
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    #[instrument(skip(self, envelope), fields(id = %envelope.id))]
    async fn handle_envelope(&mut self, envelope: &Envelope) {
        match &envelope.event {
            Event::Configuration { retries, timeout_seconds } => {
                if *retries >= 0 {
                    self.policy.retries = *retries;
                }
                if *timeout_seconds >= 0.0 {
                    self.policy.timeout_seconds = *timeout_seconds;
                }
                // The actual scheduling decision lives in `timeout_log::TimeoutEventLog`,
                // which observes this same stream independently (Open Question Q2); this
                // copy is kept only so the processor's own logs reflect the policy in effect.
                debug!(retries = self.policy.retries, timeout_seconds = self.policy.timeout_seconds, "policy updated");
            }
            Event::Request { payload } => {
                let projection = RequestProjection::new(envelope.id, self.policy.retries, payload.clone());
                self.roots_in_flight.insert(envelope.id, projection);
                self.initiate_attempt(envelope.id, 0, payload.clone()).await;
            }
            Event::ApiRequest { attempt } => {
                let attempt = *attempt;
                if let Some(root) = self.root_of(envelope) {
                    if let Some(projection) = self.roots_in_flight.get_mut(&root) {
                        projection.on_api_request(attempt);
                    } else {
                        warn!(root = %root, attempt, "api-request for unknown root, discarding");
                    }
                }
            }
            Event::ApiResponse { attempt, .. } => {
                let attempt = *attempt;
                if let Some(root) = self.root_of(envelope) {
                    if let Some(projection) = self.roots_in_flight.get_mut(&root) {
                        projection.on_api_response(attempt);
                    } else {
                        warn!(root = %root, attempt, "api-response for unknown root, discarding");
                    }
                }
            }
            Event::ApiFailure { attempt, message } => {
                let attempt = *attempt;
                if let Some(root) = self.root_of(envelope) {
                    let transitioned = self
                        .roots_in_flight
                        .get_mut(&root)
                        .map(|projection| projection.on_api_failure(attempt));
                    match transitioned {
                        Some(true) => {
                            debug!(root = %root, attempt, message, "api-failure observed");
                            self.evaluate_retry(root, attempt).await;
                        }
                        Some(false) => debug!(root = %root, attempt, "late api-failure, outcome already decided"),
                        None => warn!(root = %root, attempt, "api-failure for unknown root, discarding"),
                    }
                }
            }
            Event::ApiTimeout { attempt } => {
                let attempt = *attempt;
                if let Some(root) = self.root_of(envelope) {
                    let transitioned = self
                        .roots_in_flight
                        .get_mut(&root)
                        .map(|projection| projection.on_api_timeout(attempt));
                    match transitioned {
                        Some(true) => self.evaluate_retry(root, attempt).await,
                        Some(false) => debug!(root = %root, attempt, "late api-timeout, outcome already decided"),
                        None => warn!(root = %root, attempt, "api-timeout for unknown root, discarding"),
                    }
                }
            }
        }
    }

    /// Resolve the causing root for a non-root envelope. A zero causation
    /// on one of these variants is a malformed event (spec §7
    /// "programmer" kind): logged and discarded, never sticky.
    fn root_of(&self, envelope: &Envelope) -> Option<EventId> {
        if envelope.causation_id.is_root() {
            error!(id = %envelope.id, "non-root event carries zero causation, discarding");
            return None;
        }
        Some(envelope.causation_id)
    }

    /// *Retry-decision* (spec §4.4): independently triggerable by
    /// `api-failure` or `api-timeout` at the same attempt without ever
    /// double-firing, because initiating attempt `a+1` is exactly the act
    /// that advances `next_attempt()` past it, closing the race window.
    async fn evaluate_retry(&mut self, root: EventId, attempt: u32) {
        let Some(projection) = self.roots_in_flight.get(&root) else { return };
        let retries = match u32::try_from(projection.retries()) {
            Ok(r) => r,
            Err(_) => return,
        };
        if attempt == retries {
            debug!(root = %root, attempt, "retries exhausted, giving up");
            return;
        }
        let next_attempt = match u32::try_from(projection.next_attempt()) {
            Ok(n) => n,
            Err(_) => return,
        };
        if attempt + 1 != next_attempt {
            debug!(root = %root, attempt, "a retry is already in flight for this attempt, no-op");
            return;
        }
        if projection.succeeded() {
            debug!(root = %root, attempt, "a prior attempt already succeeded, no-op");
            return;
        }
        let payload = projection.payload().to_string();
        self.initiate_attempt(root, attempt + 1, payload).await;
    }

    /// *Initiate-attempt* (spec §4.4): append `api-request{attempt}`, then
    /// spawn a task that calls the remote API and appends exactly one
    /// outcome event, or none if the adapter observed neither a response
    /// nor a local error.
    #[instrument(skip(self, payload), fields(root = %root, attempt))]
    async fn initiate_attempt(&mut self, root: EventId, attempt: u32, payload: String) {
        if let Err(err) = self.log.insert(None, Event::ApiRequest { attempt }, root).await {
            error!(%err, root = %root, attempt, "failed to append api-request");
            return;
        }
        let log = self.log.clone();
        let adapter = self.adapter.clone();
        let timeout_enabled = self.policy.timeout_seconds > 0.0;
        let neither_warned = self.neither_warned.clone();
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(adapter.process_request(&payload)).catch_unwind().await;
            let event = match outcome {
                Ok(AdapterOutcome::Response(body)) => Some(Event::ApiResponse { attempt, body }),
                Ok(AdapterOutcome::Failure(message)) => Some(Event::ApiFailure { attempt, message }),
                Ok(AdapterOutcome::Neither) => {
                    if !timeout_enabled {
                        let mut warned = neither_warned.lock().expect("warned-set poisoned");
                        if warned.insert(root) {
                            warn!(
                                root = %root,
                                attempt,
                                "adapter returned neither response nor error with timeouts disabled; \
                                 request will remain pending until an event arrives by some other means"
                            );
                        }
                    }
                    None
                }
                Err(panic) => {
                    let message = panic_message(&panic);
                    error!(root = %root, attempt, message = %message, "adapter task panicked");
                    Some(Event::ApiFailure { attempt, message })
                }
            };
            if let Some(event) = event {
                if let Err(err) = log.insert(None, event, root).await {
                    warn!(%err, root = %root, attempt, "failed to append attempt outcome");
                }
            }
        });
    }
}

/// Best-effort extraction of a message from a caught panic payload.
fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "adapter panicked with a non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ScriptedAdapter;
    use event_log::InMemoryEventLog;
    use std::time::Duration;
    use timeout_log::TimeoutEventLog;

    fn configure(retries: i64, timeout_seconds: f64) -> Event {
        Event::Configuration { retries, timeout_seconds }
    }

    #[tokio::test]
    async fn s1_single_success_no_retry() {
        let base: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::default());
        let log: Arc<dyn EventLog> = Arc::new(TimeoutEventLog::new(base.clone()));
        log.insert(None, configure(0, -1.0), EventId::ROOT).await.unwrap();

        let adapter: Arc<dyn RemoteApiAdapter> =
            Arc::new(ScriptedAdapter::new(vec![AdapterOutcome::Response("ok".into())]));
        let processor = Processor::new(log.clone(), adapter);
        let handle = tokio::spawn(processor.run(EventId::ROOT));

        log.insert(None, Event::Request { payload: "hello".into() }, EventId::ROOT).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        log.close().await;
        let _ = handle.await;

        let all = base.load(EventId::ROOT).await.unwrap();
        let classes: Vec<_> = all.iter().map(|e| e.event.class()).collect();
        assert_eq!(classes, vec!["configuration", "request", "api-request", "api-response"]);
    }

    #[tokio::test]
    async fn s3_exhausts_retries_on_repeated_failure() {
        let base: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::default());
        let log: Arc<dyn EventLog> = Arc::new(TimeoutEventLog::new(base.clone()));
        log.insert(None, configure(2, -1.0), EventId::ROOT).await.unwrap();

        let adapter: Arc<dyn RemoteApiAdapter> = Arc::new(ScriptedAdapter::new(vec![
            AdapterOutcome::Failure("boom".into()),
            AdapterOutcome::Failure("boom".into()),
            AdapterOutcome::Failure("boom".into()),
        ]));
        let processor = Processor::new(log.clone(), adapter);
        let handle = tokio::spawn(processor.run(EventId::ROOT));

        log.insert(None, Event::Request { payload: "x".into() }, EventId::ROOT).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        log.close().await;
        let _ = handle.await;

        let all = base.load(EventId::ROOT).await.unwrap();
        let api_requests = all.iter().filter(|e| e.event.class() == "api-request").count();
        let api_failures = all.iter().filter(|e| e.event.class() == "api-failure").count();
        assert_eq!(api_requests, 3);
        assert_eq!(api_failures, 3);
        assert!(all.iter().all(|e| e.event.attempt().map_or(true, |a| a <= 2)));
    }

    #[tokio::test]
    async fn s4_late_timeout_after_retry_does_not_double_fire() {
        let base: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::default());
        let log: Arc<dyn EventLog> = Arc::new(TimeoutEventLog::new(base.clone()));
        log.insert(None, configure(1, -1.0), EventId::ROOT).await.unwrap();

        let adapter: Arc<dyn RemoteApiAdapter> = Arc::new(ScriptedAdapter::new(vec![
            AdapterOutcome::Failure("boom".into()),
            AdapterOutcome::Response("y".into()),
        ]));
        let processor = Processor::new(log.clone(), adapter);
        let handle = tokio::spawn(processor.run(EventId::ROOT));

        let root = log
            .insert(None, Event::Request { payload: "x".into() }, EventId::ROOT)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Simulate a timeout for attempt 0 arriving late, after the retry
        // for attempt 1 has already been initiated by the failure path.
        base.insert(None, Event::ApiTimeout { attempt: 0 }, root.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        log.close().await;
        let _ = handle.await;

        let all = base.load(EventId::ROOT).await.unwrap();
        let api_requests = all.iter().filter(|e| e.event.class() == "api-request").count();
        assert_eq!(api_requests, 2, "the late timeout must not trigger a third attempt");
    }

    /// I2 explicitly allows `api-timeout{a}` and `api-failure{a}` to coexist
    /// for one attempt. When the timeout is drained first and retries, a
    /// `api-failure{a}` that arrives later for the same attempt must not
    /// re-trigger a second retry just because the transition was a no-op.
    #[tokio::test]
    async fn adversarial_timeout_then_late_failure_does_not_double_fire() {
        let base: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::default());
        let log: Arc<dyn EventLog> = Arc::new(TimeoutEventLog::new(base.clone()));
        log.insert(None, configure(1, -1.0), EventId::ROOT).await.unwrap();

        let adapter: Arc<dyn RemoteApiAdapter> =
            Arc::new(ScriptedAdapter::new(vec![AdapterOutcome::Neither, AdapterOutcome::Neither]));
        let processor = Processor::new(log.clone(), adapter);
        let handle = tokio::spawn(processor.run(EventId::ROOT));

        let root = log
            .insert(None, Event::Request { payload: "x".into() }, EventId::ROOT)
            .await
            .unwrap();
        // Let the processor observe the request and append api-request{0}.
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Timeout for attempt 0 is drained first and retries; the failure
        // for the same attempt arrives after, already superseded.
        base.insert(None, Event::ApiTimeout { attempt: 0 }, root.id).await.unwrap();
        base.insert(None, Event::ApiFailure { attempt: 0, message: "late".into() }, root.id)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        log.close().await;
        let _ = handle.await;

        let all = base.load(EventId::ROOT).await.unwrap();
        let api_requests = all.iter().filter(|e| e.event.class() == "api-request").count();
        assert_eq!(
            api_requests, 2,
            "a late api-failure after a timeout already retried must not double-fire (P3/I2)"
        );
    }

    #[tokio::test]
    async fn malformed_root_causation_is_discarded_not_fatal() {
        let base: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::default());
        let log: Arc<dyn EventLog> = Arc::new(TimeoutEventLog::new(base.clone()));
        let adapter: Arc<dyn RemoteApiAdapter> = Arc::new(ScriptedAdapter::new(vec![]));
        let processor = Processor::new(log.clone(), adapter);
        let handle = tokio::spawn(processor.run(EventId::ROOT));

        // api-response with zero causation: malformed, must not crash the loop.
        base.insert(None, Event::ApiResponse { attempt: 0, body: "x".into() }, EventId::ROOT)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        log.close().await;
        let result = handle.await.unwrap();
        assert!(result.is_err(), "run() ends via the close-triggered sticky error, not a panic");
    }
}
