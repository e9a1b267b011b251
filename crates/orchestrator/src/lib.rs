//! Request state (C5), request processor (C6), and request watcher (C7)
//! over the event log (spec §4.3-§4.5).
//!
//! The processor is constructed over a log handle already wrapped by
//! `timeout_log::TimeoutEventLog`; the watcher is constructed over a plain
//! `event_log::EventLog` handle with no such wrapping, since it must not
//! synthesize timeouts of its own (spec §4.5).

#![deny(unsafe_code)]

pub mod adapter;
pub mod processor;
pub mod request_state;
pub mod watcher;

pub use adapter::{AdapterOutcome, DemoAdapter, RemoteApiAdapter, ScriptedAdapter};
pub use processor::Processor;
pub use request_state::{AttemptState, OverallState, RequestProjection};
pub use watcher::{WatchRecord, Watcher};
