//! Retry controller behaviour with a virtual clock.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use hookline_core::{
    storage::memory::InMemoryDeliveryLog, Endpoint, Envelope, EventData, EventKind, TestClock,
};
use hookline_delivery::{
    DeliveryError, RetryClassifier, RetryPolicy, RetryingSender, SenderConfig, WebhookSender,
};
use tokio_util::sync::CancellationToken;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

struct Harness {
    server: MockServer,
    log: Arc<InMemoryDeliveryLog>,
    clock: TestClock,
    sender: Arc<WebhookSender>,
}

impl Harness {
    async fn new() -> Self {
        let server = MockServer::start().await;
        let log = Arc::new(InMemoryDeliveryLog::new());
        let clock = TestClock::new();
        let sender = Arc::new(
            WebhookSender::with_clock(SenderConfig::default(), log.clone(), Arc::new(clock.clone()))
                .unwrap(),
        );
        Self { server, log, clock, sender }
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint::new("retry", format!("{}/hook", self.server.uri())).subscribed_to_all()
    }

    fn retrying(&self, policy: RetryPolicy) -> RetryingSender {
        RetryingSender::new(self.sender.clone(), policy)
    }
}

fn envelope() -> Envelope {
    Envelope::build(EventKind::TicketUpdated, EventData::new().with("ticket_id", 9), Utc::now())
}

#[tokio::test]
async fn permanent_failure_makes_max_retries_plus_one_attempts() {
    let h = Harness::new().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .expect(6)
        .mount(&h.server)
        .await;

    let err = h.retrying(RetryPolicy::default()).send_with_retry(&h.endpoint(), &envelope()).await;

    match err {
        Err(DeliveryError::RetriesExhausted { attempts, last }) => {
            assert_eq!(attempts, 6);
            assert_eq!(last.status_code(), Some(503));
        },
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }

    let records = h.log.all().await;
    assert_eq!(records.len(), 6);
    assert_eq!(records.iter().map(|r| r.attempt).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5, 6]);
    assert!(records.iter().all(|r| !r.success));

    let secs: Vec<u64> = h.clock.sleeps().iter().map(Duration::as_secs).collect();
    assert_eq!(secs, vec![1, 2, 4, 8, 16]);
}

#[tokio::test]
async fn success_stops_retrying() {
    let h = Harness::new().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&h.server)
        .await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&h.server)
        .await;

    let outcome =
        h.retrying(RetryPolicy::default()).send_with_retry(&h.endpoint(), &envelope()).await.unwrap();
    assert!(outcome.is_success());

    let records = h.log.all().await;
    assert_eq!(records.len(), 3);
    assert!(records[2].success);
    assert!(records[..2].iter().all(|r| !r.success));
    assert_eq!(h.clock.sleeps(), vec![Duration::from_secs(1), Duration::from_secs(2)]);
}

#[tokio::test]
async fn client_errors_are_retried_by_default() {
    let h = Harness::new().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&h.server)
        .await;

    let policy = RetryPolicy { max_retries: 2, ..Default::default() };
    let result = h.retrying(policy).send_with_retry(&h.endpoint(), &envelope()).await;

    assert!(matches!(result, Err(DeliveryError::RetriesExhausted { attempts: 3, .. })));
    assert_eq!(h.log.len().await, 3);
}

#[tokio::test]
async fn transient_only_policy_gives_up_on_client_errors() {
    let h = Harness::new().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&h.server)
        .await;

    let policy = RetryPolicy { classifier: RetryClassifier::TransientOnly, ..Default::default() };
    let result = h.retrying(policy).send_with_retry(&h.endpoint(), &envelope()).await;

    assert!(matches!(result, Err(DeliveryError::Http { status_code: 404, .. })));
    assert_eq!(h.log.len().await, 1);
    assert!(h.clock.sleeps().is_empty());
}

#[tokio::test]
async fn backoff_is_capped() {
    let h = Harness::new().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&h.server)
        .await;

    let policy = RetryPolicy {
        max_retries: 7,
        initial_backoff: Duration::from_secs(1),
        max_backoff: Duration::from_secs(10),
        ..Default::default()
    };
    let _ = h.retrying(policy).send_with_retry(&h.endpoint(), &envelope()).await;

    let secs: Vec<u64> = h.clock.sleeps().iter().map(Duration::as_secs).collect();
    assert_eq!(secs, vec![1, 2, 4, 8, 10, 10, 10]);
    assert_eq!(h.log.len().await, 8);
}

#[tokio::test]
async fn cancelled_token_prevents_attempts() {
    let h = Harness::new().await;
    let token = CancellationToken::new();
    token.cancel();

    let result = h
        .retrying(RetryPolicy::default())
        .with_cancellation(token)
        .send_with_retry(&h.endpoint(), &envelope())
        .await;

    assert!(matches!(result, Err(DeliveryError::Cancelled)));
    assert!(h.log.is_empty().await);
}

#[tokio::test]
async fn cancellation_interrupts_backoff() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let log = Arc::new(InMemoryDeliveryLog::new());
    let sender = Arc::new(WebhookSender::new(SenderConfig::default(), log.clone()).unwrap());
    let policy = RetryPolicy { initial_backoff: Duration::from_secs(30), ..Default::default() };
    let token = CancellationToken::new();
    let retrying = RetryingSender::new(sender, policy).with_cancellation(token.clone());

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        token.cancel();
    });

    let endpoint = Endpoint::new("slow", format!("{}/hook", server.uri())).subscribed_to_all();
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        retrying.send_with_retry(&endpoint, &envelope()),
    )
    .await
    .expect("cancellation should interrupt the backoff sleep");

    canceller.await.unwrap();
    assert!(matches!(result, Err(DeliveryError::Cancelled)));
    assert_eq!(log.len().await, 1);
}

#[tokio::test]
async fn disabled_endpoint_is_skipped_under_retry() {
    let h = Harness::new().await;
    let outcome = h
        .retrying(RetryPolicy::default())
        .send_with_retry(&h.endpoint().disabled(), &envelope())
        .await
        .unwrap();

    assert!(outcome.report().is_none());
    assert!(h.log.is_empty().await);
}
