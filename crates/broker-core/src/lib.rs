//! Event model, envelope, and shared error vocabulary for the API broker.
//!
//! This crate has no I/O and no async runtime dependency: it is the closed
//! set of types every other crate in the workspace agrees on. The event
//! log, the timeout interceptor, and the orchestrator all speak in terms
//! of [`Envelope`] and [`Event`] only.

#![deny(unsafe_code)]

pub mod clock {
    //! Wall-clock helpers shared by the log and the orchestrator.

    use std::time::{SystemTime, UNIX_EPOCH};

    /// Milliseconds since the UNIX epoch.
    #[must_use]
    pub fn now_ms() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
    }
}

pub mod id {
    //! The monotone event identifier.

    use std::fmt;
    use std::str::FromStr;

    use crate::error::BrokerError;

    /// A strictly positive, store-assigned, total-order identifier.
    ///
    /// `EventId(0)` is reserved to mean "no causation" (a root envelope);
    /// it is never assigned to a persisted envelope.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
    #[derive(serde::Serialize, serde::Deserialize)]
    #[serde(transparent)]
    pub struct EventId(pub u64);

    impl EventId {
        /// The sentinel used as `causation_id` on root envelopes.
        pub const ROOT: EventId = EventId(0);

        /// True for the root sentinel.
        #[must_use]
        pub fn is_root(self) -> bool {
            self == Self::ROOT
        }
    }

    impl fmt::Display for EventId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl FromStr for EventId {
        type Err = BrokerError;

        /// Whitespace-free textual form: a bare decimal integer.
        fn from_str(s: &str) -> Result<Self, Self::Err> {
            if s.is_empty() || s.chars().any(char::is_whitespace) {
                return Err(BrokerError::Parse(format!("invalid event id: {s:?}")));
            }
            s.parse::<u64>()
                .map(EventId)
                .map_err(|e| BrokerError::Parse(format!("invalid event id {s:?}: {e}")))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn parses_decimal() {
            assert_eq!("42".parse::<EventId>().unwrap(), EventId(42));
        }

        #[test]
        fn rejects_whitespace_and_garbage() {
            assert!(" 1".parse::<EventId>().is_err());
            assert!("1 ".parse::<EventId>().is_err());
            assert!("abc".parse::<EventId>().is_err());
            assert!("".parse::<EventId>().is_err());
        }

        #[test]
        fn root_is_zero() {
            assert!(EventId::ROOT.is_root());
            assert!(!EventId(1).is_root());
        }
    }
}

pub mod event {
    //! The closed set of event variants.

    use serde::{Deserialize, Serialize};

    /// One event in the log. Each variant carries a stable lowercase
    /// `class` tag (via `#[serde(tag = "class")]`) used by storage-agnostic
    /// codecs to dispatch without knowing the concrete Rust type.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "class", rename_all = "kebab-case")]
    pub enum Event {
        /// Updates orchestrator policy. Negative fields mean "leave unchanged".
        Configuration {
            /// Maximum retry count (attempts beyond 0), or negative to leave unchanged.
            retries: i64,
            /// Timeout in seconds; non-positive disables it, negative leaves unchanged.
            #[serde(rename = "timeout")]
            timeout_seconds: f64,
        },
        /// A new client request. Always a root event (causation_id == 0).
        Request {
            /// Opaque request body handed to the remote API verbatim.
            payload: String,
        },
        /// A remote call is about to be made for attempt `attempt` of some request.
        ApiRequest {
            /// Zero-based attempt index.
            attempt: u32,
        },
        /// The remote API returned some reply for that attempt.
        ApiResponse {
            /// Zero-based attempt index.
            attempt: u32,
            /// Raw response body; no distinction between app-success and app-error.
            body: String,
        },
        /// The call could not be performed locally (transport error).
        ApiFailure {
            /// Zero-based attempt index.
            attempt: u32,
            /// Local error description.
            message: String,
        },
        /// The configured timeout elapsed for that attempt.
        ApiTimeout {
            /// Zero-based attempt index.
            attempt: u32,
        },
    }

    impl Event {
        /// The stable textual class tag for this variant.
        #[must_use]
        pub fn class(&self) -> &'static str {
            match self {
                Event::Configuration { .. } => "configuration",
                Event::Request { .. } => "request",
                Event::ApiRequest { .. } => "api-request",
                Event::ApiResponse { .. } => "api-response",
                Event::ApiFailure { .. } => "api-failure",
                Event::ApiTimeout { .. } => "api-timeout",
            }
        }

        /// The attempt index carried by attempt-scoped variants, if any.
        #[must_use]
        pub fn attempt(&self) -> Option<u32> {
            match self {
                Event::ApiRequest { attempt }
                | Event::ApiResponse { attempt, .. }
                | Event::ApiFailure { attempt, .. }
                | Event::ApiTimeout { attempt } => Some(*attempt),
                Event::Configuration { .. } | Event::Request { .. } => None,
            }
        }

        /// True for [`Event::Request`], the only event that may be a root.
        #[must_use]
        pub fn is_request(&self) -> bool {
            matches!(self, Event::Request { .. })
        }
    }

}

pub mod envelope {
    //! The persisted, immutable record wrapping one event.

    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    use crate::event::Event;
    use crate::id::EventId;

    /// An immutable, persisted record: identity, causal metadata, and payload.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Envelope {
        /// Total-order monotone identifier assigned by the store at insert time.
        pub id: EventId,
        /// Wall-clock timestamp at insert, in milliseconds since the epoch.
        pub created_ms: u64,
        /// Optional client-supplied identifier, globally unique within the log.
        pub external_uuid: Option<Uuid>,
        /// Id of the envelope that logically caused this one, or `EventId::ROOT` if root.
        pub causation_id: EventId,
        /// The event payload.
        pub event: Event,
    }

    impl Envelope {
        /// True if this envelope has no causation (a `request` root).
        #[must_use]
        pub fn is_root(&self) -> bool {
            self.causation_id.is_root()
        }
    }
}

pub mod error {
    //! The error vocabulary shared across the workspace.

    use thiserror::Error;

    /// Error kinds shared by the event log, the timeout interceptor, and the
    /// orchestrator. Variant names mirror how callers classify a failure,
    /// not Rust naming convention for the sake of it.
    #[derive(Debug, Error)]
    pub enum BrokerError {
        /// Store I/O failure. Sticky: terminates loops, surfaced to the CLI.
        #[error("io: {0}")]
        Io(#[from] std::io::Error),
        /// Event codec failure. Sticky for the same reasons as `Io`.
        #[error("serialize: {0}")]
        Serde(#[from] serde_json::Error),
        /// `retrieve_one`/`resolve_uuid` found nothing. Non-sticky.
        #[error("not found")]
        NotFound,
        /// `insert` with an `external_uuid` already present. Non-sticky.
        #[error("duplicate external uuid")]
        DuplicateUuid,
        /// A string failed to parse as an id. Non-sticky.
        #[error("parse error: {0}")]
        Parse(String),
        /// A malformed event was observed in the stream (unknown class, missing
        /// required causation). Logged and skipped by the processor; never sticky.
        #[error("programmer error: {0}")]
        Programmer(String),
        /// The store's sticky error has already latched; further operations refused.
        #[error("log closed: {0}")]
        Closed(String),
    }

    impl BrokerError {
        /// Whether this error, once observed by a long-lived handle, should
        /// latch as the handle's sticky error and terminate its consumer loop.
        #[must_use]
        pub fn is_sticky(&self) -> bool {
            matches!(self, BrokerError::Io(_) | BrokerError::Serde(_) | BrokerError::Closed(_))
        }
    }
}

pub use envelope::Envelope;
pub use error::BrokerError;
pub use event::Event;
pub use id::EventId;
