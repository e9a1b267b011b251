//! The timeout interceptor: a decorator around any [`EventLog`] that
//! observes `configuration` events on its own `follow_events` wiretap and,
//! on every `api-request` it forwards through `insert`, schedules a
//! deferred `api-timeout` insert bearing the same attempt and causation.
//!
//! The scheduled insert is unconditional: it fires whether or not a
//! response or failure arrives first. The reducer in `orchestrator`
//! absorbs the late-arrival case with idempotent state transitions; this
//! crate only ever appends, never decides.

#![deny(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use broker_core::{BrokerError, Envelope, Event, EventId};
use event_log::{BoxStream, EventLog};
use futures::StreamExt;
use tokio::sync::Notify;
use tracing::{debug, instrument};
use uuid::Uuid;

/// A scheduled deferred insert must not outlive the log handle it was
/// scheduled against: this latches once on `close()` and wakes
/// every task currently sleeping on a pending `api-timeout`, using the
/// `enable()`-before-check idiom so a `close()` racing a task that hasn't
/// registered its waiter yet still cancels it rather than being missed.
struct Shutdown {
    closed: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    fn new() -> Self {
        Self { closed: AtomicBool::new(false), notify: Notify::new() }
    }

    fn trigger(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    async fn cancelled(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        notified.await;
    }
}

/// Decorates an [`EventLog`] with timeout scheduling.
///
/// Holds one piece of mutable process-local state: the current timeout,
/// either a positive duration or disabled. Initially disabled. The
/// authoritative source for this state is whichever `follow_events` call
/// observes `configuration` events first; in this workspace that is
/// always the orchestrator's own processor loop (see DESIGN.md), so there
/// is never more than one follower racing to set it.
#[derive(Clone)]
pub struct TimeoutEventLog {
    inner: Arc<dyn EventLog>,
    current_timeout: Arc<RwLock<Option<Duration>>>,
    shutdown: Arc<Shutdown>,
}

impl TimeoutEventLog {
    /// Wrap `inner`. Timeout scheduling starts disabled until a
    /// `configuration` event with a positive `timeout` is observed.
    #[must_use]
    pub fn new(inner: Arc<dyn EventLog>) -> Self {
        Self {
            inner,
            current_timeout: Arc::new(RwLock::new(None)),
            shutdown: Arc::new(Shutdown::new()),
        }
    }

    /// The timeout duration currently in effect, if enabled.
    #[must_use]
    pub fn current_timeout(&self) -> Option<Duration> {
        *self.current_timeout.read().expect("timeout state poisoned")
    }
}

#[async_trait]
impl EventLog for TimeoutEventLog {
    fn parse_id(&self, s: &str) -> Result<EventId, BrokerError> {
        self.inner.parse_id(s)
    }

    #[instrument(skip(self, event))]
    async fn insert(
        &self,
        external_uuid: Option<Uuid>,
        event: Event,
        causation_id: EventId,
    ) -> Result<Envelope, BrokerError> {
        let schedule_attempt = match &event {
            Event::ApiRequest { attempt } => Some(*attempt),
            _ => None,
        };
        let envelope = self.inner.insert(external_uuid, event, causation_id).await?;
        if let Some(attempt) = schedule_attempt {
            if let Some(duration) = self.current_timeout() {
                let inner = self.inner.clone();
                let shutdown = self.shutdown.clone();
                let root = envelope.causation_id;
                debug!(attempt, root = %root, ?duration, "scheduling api-timeout");
                tokio::spawn(async move {
                    tokio::select! {
                        () = tokio::time::sleep(duration) => {
                            let _ = inner.insert(None, Event::ApiTimeout { attempt }, root).await;
                        }
                        () = shutdown.cancelled() => {
                            debug!(attempt, root = %root, "log closed before timeout elapsed, dropping scheduled insert");
                        }
                    }
                });
            }
        }
        Ok(envelope)
    }

    async fn resolve_uuid(&self, external_uuid: Uuid) -> Result<EventId, BrokerError> {
        self.inner.resolve_uuid(external_uuid).await
    }

    async fn retrieve_one(&self, id: EventId) -> Result<Envelope, BrokerError> {
        self.inner.retrieve_one(id).await
    }

    async fn load(&self, start_after: EventId) -> Result<Vec<Envelope>, BrokerError> {
        self.inner.load(start_after).await
    }

    fn follow_events(&self, start_after: EventId) -> BoxStream<Result<Envelope, BrokerError>> {
        let current_timeout = self.current_timeout.clone();
        let inner_stream = self.inner.follow_events(start_after);
        let mapped = inner_stream.map(move |item| {
            if let Ok(envelope) = &item {
                if let Event::Configuration { timeout_seconds, .. } = &envelope.event {
                    let mut guard = current_timeout.write().expect("timeout state poisoned");
                    *guard = if *timeout_seconds > 0.0 {
                        Some(Duration::from_secs_f64(*timeout_seconds))
                    } else {
                        None
                    };
                }
            }
            item
        });
        Box::pin(mapped)
    }

    fn follow_notifications(&self) -> BoxStream<Result<EventId, BrokerError>> {
        self.inner.follow_notifications()
    }

    fn error(&self) -> Option<String> {
        self.inner.error()
    }

    async fn close(&self) {
        self.inner.close().await;
        self.shutdown.trigger();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_log::InMemoryEventLog;
    use futures::StreamExt;

    fn configure(retries: i64, timeout_seconds: f64) -> Event {
        Event::Configuration { retries, timeout_seconds }
    }

    #[tokio::test]
    async fn disabled_by_default_schedules_nothing() {
        let base: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::default());
        let decorated = TimeoutEventLog::new(base.clone());
        let root = decorated.insert(None, Event::Request { payload: "x".into() }, EventId::ROOT).await.unwrap();
        decorated.insert(None, Event::ApiRequest { attempt: 0 }, root.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let all = base.load(EventId::ROOT).await.unwrap();
        assert_eq!(all.len(), 2, "no api-timeout should be scheduled while disabled");
    }

    #[tokio::test(start_paused = true)]
    async fn enabled_timeout_schedules_matching_attempt_and_causation() {
        let base: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::default());
        let decorated = TimeoutEventLog::new(base.clone());

        // Drive a configuration event through the wiretap to enable timeouts.
        let mut cfg_stream = decorated.follow_events(EventId::ROOT);
        decorated.insert(None, configure(2, 1.0), EventId::ROOT).await.unwrap();
        let _ = cfg_stream.next().await.unwrap().unwrap();
        assert_eq!(decorated.current_timeout(), Some(Duration::from_secs(1)));

        let root = decorated.insert(None, Event::Request { payload: "x".into() }, EventId::ROOT).await.unwrap();
        decorated.insert(None, Event::ApiRequest { attempt: 3 }, root.id).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        // Give the spawned task a chance to run after the virtual clock advances.
        tokio::task::yield_now().await;

        let all = base.load(EventId::ROOT).await.unwrap();
        let timeout_event = all
            .iter()
            .find(|e| matches!(e.event, Event::ApiTimeout { attempt } if attempt == 3))
            .expect("api-timeout must be scheduled for the matching attempt");
        assert_eq!(timeout_event.causation_id, root.id);
    }
}
