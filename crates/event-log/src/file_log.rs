//! A JSONL-backed persistent [`EventLog`]: one JSON object per line,
//! opened-or-created at a path, read back on startup. This backend
//! implements the full [`EventLog`] contract so the admin CLI's one-shot
//! commands (`configure`, `insert`, `list`, `resolve-external-uuid`) and
//! its long-running commands (`process`, `watch-requests`) can all point
//! at the same file.
//!
//! This is still a single-writer-process-at-a-time demo backend, not a
//! concurrent production store. A running `follow_events` additionally
//! polls the file on an interval so it observes envelopes appended by
//! another process invocation of the CLI, not just inserts made through
//! its own handle.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use broker_core::{clock::now_ms, BrokerError, Envelope, Event, EventId};
use tokio::sync::broadcast;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;
use uuid::Uuid;

use crate::{BoxStream, EventLog};

struct FileState {
    envelopes: Vec<Envelope>,
    uuid_index: HashMap<Uuid, EventId>,
    next_id: u64,
    lines_read: usize,
    sticky: Option<String>,
}

impl FileState {
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

    /// Re-read the file from `lines_read` onward and fold any new,
    /// well-formed lines into memory. Returns the ids of newly observed
    /// envelopes, in order, so the caller can notify followers.
    fn reload(&mut self, path: &Path) -> Result<Vec<EventId>, BrokerError> {
        let file = std::fs::File::open(path)?;
        let reader = BufReader::new(file);
        let mut added = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            if idx < self.lines_read {
                continue;
            }
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let envelope: Envelope = match serde_json::from_str(&line) {
                Ok(e) => e,
                Err(e) => {
                    warn!(line = idx, %e, "skipping malformed line in event log file");
                    continue;
                }
            };
            self.lines_read = idx + 1;
            if envelope.id.0 >= self.next_id {
                self.next_id = envelope.id.0 + 1;
            }
            if let Some(uuid) = envelope.external_uuid {
                self.uuid_index.insert(uuid, envelope.id);
            }
            added.push(envelope.id);
            self.envelopes.push(envelope);
        }
        Ok(added)
    }
}

/// A persistent, file-backed [`EventLog`]. See module docs.
#[derive(Clone)]
pub struct FileEventLog {
    path: PathBuf,
    state: Arc<Mutex<FileState>>,
    notify_tx: broadcast::Sender<EventId>,
    follow_buffer: usize,
    poll_interval: Duration,
}

impl FileEventLog {
    /// Open (creating if absent) the log file at `path` and replay its
    /// existing contents into memory.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, BrokerError> {
        Self::open_with_poll(path, Duration::from_millis(250))
    }

    /// As [`Self::open`], with an explicit polling interval for observing
    /// envelopes appended by another process.
    pub fn open_with_poll<P: AsRef<Path>>(
        path: P,
        poll_interval: Duration,
    ) -> Result<Self, BrokerError> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            OpenOptions::new().create(true).write(true).truncate(false).open(&path)?;
        }
        let mut state = FileState {
            envelopes: Vec::new(),
            uuid_index: HashMap::new(),
            next_id: 1,
            lines_read: 0,
            sticky: None,
        };
        state.reload(&path)?;
        let (notify_tx, _rx) = broadcast::channel(1024);
        Ok(Self {
            path,
            state: Arc::new(Mutex::new(state)),
            notify_tx,
            follow_buffer: 256,
            poll_interval,
        })
    }
}

#[async_trait]
impl EventLog for FileEventLog {
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
            let line = serde_json::to_string(&envelope)?;
            let mut file = OpenOptions::new().append(true).open(&self.path)?;
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
            file.flush()?;
            st.envelopes.push(envelope.clone());
            st.lines_read += 1;
            if let Some(uuid) = external_uuid {
                st.uuid_index.insert(uuid, id);
            }
            envelope
        };
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
        let mut st = self.state.lock().expect("event log state poisoned");
        let _ = st.reload(&self.path);
        st.validate_start_after(start_after)?;
        Ok(st.envelopes.iter().filter(|e| e.id > start_after).cloned().collect())
    }

    fn follow_events(&self, start_after: EventId) -> BoxStream<Result<Envelope, BrokerError>> {
        let state = self.state.clone();
        let path = self.path.clone();
        let mut notify_rx = self.notify_tx.subscribe();
        let notify_tx = self.notify_tx.clone();
        let poll_interval = self.poll_interval;
        let (tx, rx) = tokio::sync::mpsc::channel(self.follow_buffer);
        tokio::spawn(async move {
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
                    tokio::select! {
                        res = notify_rx.recv() => match res {
                            Ok(_) => continue,
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => return,
                        },
                        () = tokio::time::sleep(poll_interval) => {
                            let mut st = state.lock().expect("event log state poisoned");
                            match st.reload(&path) {
                                Ok(added) => {
                                    drop(st);
                                    for id in added {
                                        let _ = notify_tx.send(id);
                                    }
                                }
                                Err(e) => {
                                    st.sticky = Some(e.to_string());
                                    drop(st);
                                    let _ = tx.send(Err(e)).await;
                                    return;
                                }
                            }
                        }
                    }
                    continue;
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
        let _ = self.notify_tx.send(EventId::ROOT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn req(payload: &str) -> Event {
        Event::Request { payload: payload.to_string() }
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        {
            let log = FileEventLog::open(&path).unwrap();
            log.insert(None, req("a"), EventId::ROOT).await.unwrap();
            log.insert(None, req("b"), EventId::ROOT).await.unwrap();
        }
        let reopened = FileEventLog::open(&path).unwrap();
        let all = reopened.load(EventId::ROOT).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].event, req("a"));
        assert_eq!(all[1].event, req("b"));
    }

    #[tokio::test]
    async fn duplicate_uuid_rejected_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let u = Uuid::new_v4();
        {
            let log = FileEventLog::open(&path).unwrap();
            log.insert(Some(u), req("a"), EventId::ROOT).await.unwrap();
        }
        let reopened = FileEventLog::open(&path).unwrap();
        let dup = reopened.insert(Some(u), req("b"), EventId::ROOT).await;
        assert!(matches!(dup, Err(BrokerError::DuplicateUuid)));
    }

    #[tokio::test]
    async fn follow_events_observes_externally_appended_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let writer = FileEventLog::open_with_poll(&path, Duration::from_millis(20)).unwrap();
        let reader = FileEventLog::open_with_poll(&path, Duration::from_millis(20)).unwrap();

        let mut stream = reader.follow_events(EventId::ROOT);
        let inserted = writer.insert(None, req("external"), EventId::ROOT).await.unwrap();

        let observed = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("observed within timeout")
            .unwrap()
            .unwrap();
        assert_eq!(observed.id, inserted.id);
    }
}
