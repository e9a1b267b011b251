//! P2 (spec §8): for any projection and any sequence of events, applying
//! the same event twice leaves the projection unchanged.

use broker_core::EventId;
use orchestrator::RequestProjection;
use proptest::prelude::*;

#[derive(Debug, Clone, Copy)]
enum Step {
    ApiRequest,
    ApiResponse,
    ApiFailure,
    ApiTimeout,
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        Just(Step::ApiRequest),
        Just(Step::ApiResponse),
        Just(Step::ApiFailure),
        Just(Step::ApiTimeout),
    ]
}

fn apply(projection: &mut RequestProjection, step: Step, attempt: u32) {
    match step {
        Step::ApiRequest => projection.on_api_request(attempt),
        Step::ApiResponse => projection.on_api_response(attempt),
        Step::ApiFailure => {
            let _ = projection.on_api_failure(attempt);
        }
        Step::ApiTimeout => {
            let _ = projection.on_api_timeout(attempt);
        }
    }
}

fn snapshot(projection: &RequestProjection) -> (usize, bool, orchestrator::OverallState) {
    (projection.next_attempt(), projection.succeeded(), projection.overall_state())
}

proptest! {
    #[test]
    fn repeated_event_is_a_no_op(
        retries in 0u32..4,
        steps in prop::collection::vec((step_strategy(), 0u32..4), 0..12),
    ) {
        let mut projection = RequestProjection::new(EventId(1), i64::from(retries), "x".into());
        for (step, raw_attempt) in steps {
            let attempt = raw_attempt % (retries + 1);
            apply(&mut projection, step, attempt);

            let before = snapshot(&projection);
            apply(&mut projection, step, attempt);
            let after = snapshot(&projection);
            prop_assert_eq!(before, after, "re-applying {:?}@{} changed the projection", step, attempt);
        }
    }
}
