//! The remote-API adapter (spec §6): the single external collaborator the
//! processor calls out to. Kept as a plain async trait object rather than
//! a network client, since the wire protocol and REST facade are
//! explicitly out of core scope (spec §1).

use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

/// What the remote API produced for one attempt (spec §6: "body |
/// local-error | neither").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterOutcome {
    /// A response body was received. No distinction between
    /// application-level success and application-level error content.
    Response(String),
    /// The call could not be performed locally (transport error).
    Failure(String),
    /// The adapter observed no response and produced no error; the
    /// orchestrator relies exclusively on the timeout path for this
    /// attempt.
    Neither,
}

/// `process_request(payload) -> body | local-error | neither` (spec §6).
#[async_trait]
pub trait RemoteApiAdapter: Send + Sync {
    async fn process_request(&self, payload: &str) -> AdapterOutcome;
}

/// A demonstration remote API: a random latency/failure stub, analogous in
/// spirit to a real backend but entirely in-process (spec §2 expansion).
/// Configuration is passed in at construction, never read from global
/// state (spec §9, "process-wide adapter configuration").
pub struct DemoAdapter {
    pub success_body: String,
    pub latency: Range<Duration>,
    pub failure_rate: f64,
    pub silent_rate: f64,
}

impl Default for DemoAdapter {
    fn default() -> Self {
        Self {
            success_body: "ok".to_string(),
            latency: Duration::from_millis(5)..Duration::from_millis(50),
            failure_rate: 0.2,
            silent_rate: 0.1,
        }
    }
}

#[async_trait]
impl RemoteApiAdapter for DemoAdapter {
    async fn process_request(&self, payload: &str) -> AdapterOutcome {
        let wait = {
            let mut rng = rand::thread_rng();
            if self.latency.start >= self.latency.end {
                self.latency.start
            } else {
                rng.gen_range(self.latency.start..self.latency.end)
            }
        };
        tokio::time::sleep(wait).await;

        let roll: f64 = rand::thread_rng().gen();
        if roll < self.failure_rate {
            AdapterOutcome::Failure(format!("transport error for payload {payload:?}"))
        } else if roll < self.failure_rate + self.silent_rate {
            AdapterOutcome::Neither
        } else {
            AdapterOutcome::Response(self.success_body.clone())
        }
    }
}

/// A deterministic adapter driven by a fixed, attempt-indexed script of
/// outcomes. Used to reproduce the concrete scenarios of spec §8 exactly,
/// where `DemoAdapter`'s randomness would make a test racy.
pub struct ScriptedAdapter {
    outcomes: Vec<AdapterOutcome>,
    calls: AtomicUsize,
}

impl ScriptedAdapter {
    #[must_use]
    pub fn new(outcomes: Vec<AdapterOutcome>) -> Self {
        Self { outcomes, calls: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl RemoteApiAdapter for ScriptedAdapter {
    async fn process_request(&self, _payload: &str) -> AdapterOutcome {
        let i = self.calls.fetch_add(1, Ordering::SeqCst);
        self.outcomes.get(i).cloned().unwrap_or(AdapterOutcome::Neither)
    }
}
