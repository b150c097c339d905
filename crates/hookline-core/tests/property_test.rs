//! Property tests for subscription eligibility and response truncation.

use hookline_core::{
    storage::{memory::InMemoryEndpoints, EndpointRepository},
    truncate_response, Endpoint, EventKind, TRUNCATION_MARKER,
};
use proptest::{prelude::*, sample::subsequence};

fn arb_endpoint() -> impl Strategy<Value = Endpoint> {
    (any::<bool>(), any::<bool>(), subsequence(EventKind::ALL.to_vec(), 0..=EventKind::ALL.len()))
        .prop_map(|(enabled, all, events)| {
            let mut endpoint = Endpoint::new("prop", "https://receiver.example.com/hook")
                .with_events(events);
            endpoint.enabled = enabled;
            endpoint.subscribe_all = all;
            endpoint
        })
}

fn arb_event() -> impl Strategy<Value = EventKind> {
    prop::sample::select(EventKind::ALL.to_vec())
}

proptest! {
    #[test]
    fn eligibility_matches_invariant(endpoint in arb_endpoint(), kind in arb_event()) {
        let expected =
            endpoint.enabled && (endpoint.subscribe_all || endpoint.events.contains(&kind));
        prop_assert_eq!(endpoint.is_subscribed(kind), expected);
    }

    #[test]
    fn registry_returns_exactly_the_eligible_set(
        endpoints in prop::collection::vec(arb_endpoint(), 0..12),
        kind in arb_event(),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async {
            let repo = InMemoryEndpoints::new();
            for endpoint in &endpoints {
                repo.create(endpoint).await.unwrap();
            }

            let mut matched: Vec<_> =
                repo.find_subscribed(kind).await.unwrap().into_iter().map(|e| e.id).collect();
            let mut expected: Vec<_> =
                endpoints.iter().filter(|e| e.is_subscribed(kind)).map(|e| e.id).collect();
            matched.sort();
            expected.sort();
            assert_eq!(matched, expected);
        });
    }

    #[test]
    fn truncation_keeps_short_bodies_verbatim(body in ".{0,64}", extra in 0usize..64) {
        let limit = body.chars().count() + extra;
        prop_assert_eq!(truncate_response(&body, limit), body);
    }

    #[test]
    fn truncation_caps_long_bodies(body in ".{10,200}", limit in 0usize..10) {
        let truncated = truncate_response(&body, limit);
        prop_assert!(truncated.ends_with(TRUNCATION_MARKER));
        let kept = truncated.strip_suffix(TRUNCATION_MARKER).unwrap();
        prop_assert_eq!(kept.chars().count(), limit);
        prop_assert!(body.starts_with(kept));
    }
}
