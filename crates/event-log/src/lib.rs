//! The event log contract and two reference backends.
//!
//! A production deployment would back this trait with a document store
//! behind a capped notification queue, or a relational store with
//! LISTEN/NOTIFY; those are external collaborators out of scope here.
//! This crate provides [`InMemoryEventLog`] (used by the orchestrator's
//! test suite)
//! and [`FileEventLog`] (a JSONL-backed backend the admin CLI points at,
//! so separate CLI invocations observe each other's inserts). Both the
//! timeout interceptor (`timeout-log`) and either backend implement the
//! same [`EventLog`] trait, so they compose as decorators around one
//! shared handle.

#![deny(unsafe_code)]

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use broker_core::{clock::now_ms, BrokerError, Envelope, Event, EventId};
use futures::Stream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

/// A boxed, owned stream of items, as returned by the unbounded read operations.
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

mod file_log;
pub use file_log::FileEventLog;

/// The append-only event log contract.
///
/// Implementations must make `insert` safe for concurrent invocation: the
/// timeout interceptor and the processor's attempt tasks all hold the
/// same handle and insert from independent tasks.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Parse the wire textual form of an id. Whitespace-free decimal integer.
    fn parse_id(&self, s: &str) -> Result<EventId, BrokerError>;

    /// Assign an id and timestamp and persist atomically. Rejects a duplicate
    /// `external_uuid` without mutating the store.
    async fn insert(
        &self,
        external_uuid: Option<Uuid>,
        event: Event,
        causation_id: EventId,
    ) -> Result<Envelope, BrokerError>;

    /// Resolve a client-supplied uuid to the id it was assigned.
    async fn resolve_uuid(&self, external_uuid: Uuid) -> Result<EventId, BrokerError>;

    /// Fetch a single envelope by id.
    async fn retrieve_one(&self, id: EventId) -> Result<Envelope, BrokerError>;

    /// A finite, already-materialized sequence of envelopes with id > `start_after`,
    /// in strict id order, as of the moment of the call.
    async fn load(&self, start_after: EventId) -> Result<Vec<Envelope>, BrokerError>;

    /// An unbounded stream that behaves as `load` until exhausted, then blocks
    /// until new envelopes are notified and resumes. Respects cancellation:
    /// dropping the stream stops the underlying producer promptly.
    fn follow_events(&self, start_after: EventId) -> BoxStream<Result<Envelope, BrokerError>>;

    /// An unbounded stream of id-only notifications, in the same order as
    /// `follow_events` would deliver the corresponding envelopes.
    fn follow_notifications(&self) -> BoxStream<Result<EventId, BrokerError>>;

    /// The last sticky error, if the store has latched one.
    fn error(&self) -> Option<String>;

    /// Idempotent. Sets the sticky error so no further operation succeeds,
    /// and wakes any blocked follower so it observes the error promptly.
    async fn close(&self);
}

struct State {
    envelopes: Vec<Envelope>,
    uuid_index: HashMap<Uuid, EventId>,
    next_id: u64,
    sticky: Option<String>,
}

impl State {
    fn validate_start_after(&self, start_after: EventId) -> Result<(), BrokerError> {
        if start_after.is_root() {
            return Ok(());
        }
        if self.envelopes.binary_search_by_key(&start_after, |e| e.id).is_err() {
            return Err(BrokerError::Programmer(format!(
                "start_after {start_after} does not name an envelope in this log"
            )));
        }
        Ok(())
    }
}

/// An in-memory, in-process reference implementation of [`EventLog`].
///
/// Durable only for the life of the handle; intended for tests and as the
/// default backend when no production store is configured. `follow_events`
/// is a producer task writing to a bounded channel, woken by a capped
/// `broadcast` notification channel. A lagged follower resynchronizes by
/// reloading from its last delivered id rather than terminating (see
/// DESIGN.md).
#[derive(Clone)]
pub struct InMemoryEventLog {
    state: Arc<Mutex<State>>,
    notify_tx: broadcast::Sender<EventId>,
    follow_buffer: usize,
    followers: Arc<AtomicUsize>,
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InMemoryEventLog {
    /// Construct an empty log. `notification_capacity` bounds the
    /// broadcast channel every follower subscribes to (spec §6's
    /// "notifications need not be durable, only observable in order by
    /// current followers" — a lag resynchronizes rather than errors, see
    /// Open Question Q1 in DESIGN.md).
    #[must_use]
    pub fn new(notification_capacity: usize) -> Self {
        let (notify_tx, _rx) = broadcast::channel(notification_capacity.max(1));
        Self {
            state: Arc::new(Mutex::new(State {
                envelopes: Vec::new(),
                uuid_index: HashMap::new(),
                next_id: 1,
                sticky: None,
            })),
            notify_tx,
            follow_buffer: 256,
            followers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of followers currently subscribed; exposed for diagnostics/tests.
    #[must_use]
    pub fn follower_count(&self) -> usize {
        self.followers.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    fn parse_id(&self, s: &str) -> Result<EventId, BrokerError> {
        s.parse()
    }

    async fn insert(
        &self,
        external_uuid: Option<Uuid>,
        event: Event,
        causation_id: EventId,
    ) -> Result<Envelope, BrokerError> {
        let envelope = {
            let mut st = self.state.lock().expect("event log state poisoned");
            if let Some(msg) = &st.sticky {
                return Err(BrokerError::Closed(msg.clone()));
            }
            if let Some(uuid) = external_uuid {
                if st.uuid_index.contains_key(&uuid) {
                    return Err(BrokerError::DuplicateUuid);
                }
            }
            let id = EventId(st.next_id);
            st.next_id += 1;
            let envelope =
                Envelope { id, created_ms: now_ms(), external_uuid, causation_id, event };
            st.envelopes.push(envelope.clone());
            if let Some(uuid) = external_uuid {
                st.uuid_index.insert(uuid, id);
            }
            envelope
        };
        // Best-effort: no active follower is not an error.
        let _ = self.notify_tx.send(envelope.id);
        Ok(envelope)
    }

    async fn resolve_uuid(&self, external_uuid: Uuid) -> Result<EventId, BrokerError> {
        let st = self.state.lock().expect("event log state poisoned");
        st.uuid_index.get(&external_uuid).copied().ok_or(BrokerError::NotFound)
    }

    async fn retrieve_one(&self, id: EventId) -> Result<Envelope, BrokerError> {
        let st = self.state.lock().expect("event log state poisoned");
        st.envelopes
            .binary_search_by_key(&id, |e| e.id)
            .ok()
            .map(|idx| st.envelopes[idx].clone())
            .ok_or(BrokerError::NotFound)
    }

    async fn load(&self, start_after: EventId) -> Result<Vec<Envelope>, BrokerError> {
        let st = self.state.lock().expect("event log state poisoned");
        st.validate_start_after(start_after)?;
        Ok(st.envelopes.iter().filter(|e| e.id > start_after).cloned().collect())
    }

    fn follow_events(&self, start_after: EventId) -> BoxStream<Result<Envelope, BrokerError>> {
        let state = self.state.clone();
        let mut notify_rx = self.notify_tx.subscribe();
        let followers = self.followers.clone();
        let (tx, rx) = tokio::sync::mpsc::channel(self.follow_buffer);
        followers.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            let _guard = DecrementOnDrop(followers);
            let mut cursor = start_after;
            loop {
                let batch = {
                    let st = state.lock().expect("event log state poisoned");
                    if let Some(msg) = &st.sticky {
                        let _ = tx.send(Err(BrokerError::Closed(msg.clone()))).await;
                        return;
                    }
                    if let Err(e) = st.validate_start_after(cursor) {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                    st.envelopes.iter().filter(|e| e.id > cursor).cloned().collect::<Vec<_>>()
                };
                if batch.is_empty() {
                    match notify_rx.recv().await {
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
                for envelope in batch {
                    cursor = envelope.id;
                    if tx.send(Ok(envelope)).await.is_err() {
                        return;
                    }
                }
            }
        });
        Box::pin(ReceiverStream::new(rx))
    }

    fn follow_notifications(&self) -> BoxStream<Result<EventId, BrokerError>> {
        let mut notify_rx = self.notify_tx.subscribe();
        let (tx, rx) = tokio::sync::mpsc::channel(self.follow_buffer);
        tokio::spawn(async move {
            loop {
                match notify_rx.recv().await {
                    Ok(id) => {
                        if tx.send(Ok(id)).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        Box::pin(ReceiverStream::new(rx))
    }

    fn error(&self) -> Option<String> {
        self.state.lock().expect("event log state poisoned").sticky.clone()
    }

    async fn close(&self) {
        {
            let mut st = self.state.lock().expect("event log state poisoned");
            if st.sticky.is_none() {
                st.sticky = Some("log closed".to_string());
            }
        }
        // EventId::ROOT is never a real envelope id; used purely as a wakeup.
        let _ = self.notify_tx.send(EventId::ROOT);
    }
}

struct DecrementOnDrop(Arc<AtomicUsize>);
impl Drop for DecrementOnDrop {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_core::Event;
    use futures::StreamExt;

    fn req(payload: &str) -> Event {
        Event::Request { payload: payload.to_string() }
    }

    #[tokio::test]
    async fn monotone_ids_across_inserts() {
        let log = InMemoryEventLog::default();
        let a = log.insert(None, req("a"), EventId::ROOT).await.unwrap();
        let b = log.insert(None, req("b"), EventId::ROOT).await.unwrap();
        assert!(b.id > a.id, "P1: ids must strictly increase across successful inserts");
    }

    #[tokio::test]
    async fn duplicate_uuid_is_pure() {
        let log = InMemoryEventLog::default();
        let u = Uuid::new_v4();
        let first = log.insert(Some(u), req("a"), EventId::ROOT).await.unwrap();
        let before = log.load(EventId::ROOT).await.unwrap();
        let dup = log.insert(Some(u), req("b"), EventId::ROOT).await;
        assert!(matches!(dup, Err(BrokerError::DuplicateUuid)));
        let after = log.load(EventId::ROOT).await.unwrap();
        assert_eq!(before, after, "P5: a failed duplicate-uuid insert must not change load() output");
        assert_eq!(log.resolve_uuid(u).await.unwrap(), first.id);
    }

    #[tokio::test]
    async fn tail_follow_completeness() {
        let log = InMemoryEventLog::default();
        let a = log.insert(None, req("a"), EventId::ROOT).await.unwrap();
        let mut stream = log.follow_events(EventId::ROOT);
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.id, a.id);

        let b = log.insert(None, req("b"), EventId::ROOT).await.unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.id, b.id, "P6: every envelope after start-after is delivered exactly once, in id order");
    }

    #[tokio::test]
    async fn follow_resumes_from_arbitrary_start_after() {
        let log = InMemoryEventLog::default();
        let a = log.insert(None, req("a"), EventId::ROOT).await.unwrap();
        let _b = log.insert(None, req("b"), EventId::ROOT).await.unwrap();
        let mut stream = log.follow_events(a.id);
        let only = stream.next().await.unwrap().unwrap();
        assert_eq!(only.event, req("b"));
    }

    #[tokio::test]
    async fn invalid_start_after_surfaces_as_error() {
        let log = InMemoryEventLog::default();
        let err = log.load(EventId(999)).await.unwrap_err();
        assert!(matches!(err, BrokerError::Programmer(_)));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_wakes_followers() {
        let log = InMemoryEventLog::default();
        let mut stream = log.follow_events(EventId::ROOT);
        log.close().await;
        log.close().await;
        let next = stream.next().await;
        assert!(matches!(next, Some(Err(BrokerError::Closed(_)))));
        let again = log.insert(None, req("a"), EventId::ROOT).await;
        assert!(matches!(again, Err(BrokerError::Closed(_))));
    }
}
