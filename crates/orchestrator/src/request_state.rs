//! Request state (C5, spec §4.3): the per-root projection folded from the
//! causal subtree of one `request` envelope into a fixed-length vector of
//! per-attempt states.

use broker_core::EventId;

/// The state of one attempt slot. `Initial` is the default; every other
/// variant is reached only by an observed event, and every transition is
/// idempotent (re-applying the same event leaves the slot unchanged).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Initial,
    Pending,
    Success,
    Failure,
    Timeout,
}

/// The derived, single-value summary of a whole projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverallState {
    Pending,
    Success,
    Failure,
    Timeout,
}

/// Per-request in-memory projection (spec §4.3). Sized `retries + 1` at
/// construction time, using whatever `retries` policy was in effect when
/// the root was observed; the slot count never changes afterward.
#[derive(Debug, Clone)]
pub struct RequestProjection {
    root: EventId,
    payload: String,
    slots: Vec<AttemptState>,
}

impl RequestProjection {
    /// Build a fresh projection for `root`, with `retries` clamped to zero
    /// if the in-effect policy was somehow negative.
    #[must_use]
    pub fn new(root: EventId, retries: i64, payload: String) -> Self {
        let len = usize::try_from(retries.max(0)).unwrap_or(0) + 1;
        Self { root, payload, slots: vec![AttemptState::Initial; len] }
    }

    #[must_use]
    pub fn root(&self) -> EventId {
        self.root
    }

    /// The original request payload, reused verbatim for every retry.
    #[must_use]
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// `retries()` = length - 1 (spec §4.3).
    #[must_use]
    pub fn retries(&self) -> usize {
        self.slots.len() - 1
    }

    /// Index of the first `Initial` slot; `retries() + 1` when all slots
    /// have been used.
    #[must_use]
    pub fn next_attempt(&self) -> usize {
        self.slots.iter().take_while(|slot| **slot != AttemptState::Initial).count()
    }

    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.slots.iter().any(|slot| *slot == AttemptState::Success)
    }

    /// Scan left-to-right: an `Initial` slot means the whole projection is
    /// still pending regardless of later slots; a `Success` short-circuits;
    /// otherwise the last non-initial slot's provisional value wins.
    #[must_use]
    pub fn overall_state(&self) -> OverallState {
        let mut provisional = OverallState::Pending;
        for slot in &self.slots {
            match slot {
                AttemptState::Initial => return OverallState::Pending,
                AttemptState::Success => return OverallState::Success,
                AttemptState::Pending => provisional = OverallState::Pending,
                AttemptState::Failure => provisional = OverallState::Failure,
                AttemptState::Timeout => provisional = OverallState::Timeout,
            }
        }
        provisional
    }

    fn slot_mut(&mut self, attempt: u32) -> Option<&mut AttemptState> {
        usize::try_from(attempt).ok().and_then(|i| self.slots.get_mut(i))
    }

    /// `api-request`: initial -> pending.
    pub fn on_api_request(&mut self, attempt: u32) {
        if let Some(slot) = self.slot_mut(attempt) {
            if *slot == AttemptState::Initial {
                *slot = AttemptState::Pending;
            }
        }
    }

    /// `api-response`: promoted from any non-success state, since a late
    /// response after a timeout or reported failure is still the most
    /// informative outcome.
    pub fn on_api_response(&mut self, attempt: u32) {
        if let Some(slot) = self.slot_mut(attempt) {
            *slot = AttemptState::Success;
        }
    }

    /// `api-failure`: only promoted from pending, to avoid overriding a
    /// later success or an earlier timeout. Returns whether the slot
    /// actually transitioned.
    pub fn on_api_failure(&mut self, attempt: u32) -> bool {
        if let Some(slot) = self.slot_mut(attempt) {
            if *slot == AttemptState::Pending {
                *slot = AttemptState::Failure;
                return true;
            }
        }
        false
    }

    /// `api-timeout`: only from pending, otherwise a no-op. Returns
    /// whether the slot actually transitioned.
    pub fn on_api_timeout(&mut self, attempt: u32) -> bool {
        if let Some(slot) = self.slot_mut(attempt) {
            if *slot == AttemptState::Pending {
                *slot = AttemptState::Timeout;
                return true;
            }
        }
        false
    }
}
