//! Fan-out, isolation and lifecycle of the broadcaster.

use std::{collections::HashSet, sync::Arc, time::Duration};

use hookline_core::{
    storage::{memory::InMemoryDeliveryLog, memory::InMemoryEndpoints, EndpointRepository},
    Endpoint, EventData, EventKind,
};
use hookline_delivery::{
    BroadcastConfig, Broadcaster, DeliveryError, EventPublisher, RetryPolicy, SenderConfig,
    WebhookSender,
};
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

struct Setup {
    endpoints: Arc<InMemoryEndpoints>,
    log: Arc<InMemoryDeliveryLog>,
    broadcaster: Broadcaster,
}

fn setup_with(policy: RetryPolicy, config: BroadcastConfig) -> Setup {
    let endpoints = Arc::new(InMemoryEndpoints::new());
    let log = Arc::new(InMemoryDeliveryLog::new());
    let sender = Arc::new(WebhookSender::new(SenderConfig::default(), log.clone()).unwrap());
    let broadcaster = Broadcaster::new(endpoints.clone(), sender, policy, config);
    Setup { endpoints, log, broadcaster }
}

fn setup() -> Setup {
    setup_with(RetryPolicy::default(), BroadcastConfig::default())
}

async fn receiver(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(status))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn fans_out_to_every_subscribed_endpoint() {
    let s = setup();
    let server = receiver(200).await;

    let mut ids = HashSet::new();
    for i in 0..5 {
        let endpoint =
            Endpoint::new(format!("ep-{i}"), format!("{}/hook/{i}", server.uri())).subscribed_to_all();
        ids.insert(endpoint.id);
        s.endpoints.create(&endpoint).await.unwrap();
    }

    let results =
        s.broadcaster.broadcast(EventKind::ClientCreated, EventData::new().with("client_id", 1)).wait().await;
    assert_eq!(results.len(), 5);
    assert!(results.iter().all(|r| matches!(&r.result, Ok(o) if o.is_success())));

    let records = s.log.all().await;
    assert_eq!(records.len(), 5);
    let recorded: HashSet<_> = records.iter().map(|r| r.endpoint_id).collect();
    assert_eq!(recorded, ids);
}

#[tokio::test]
async fn only_eligible_endpoints_receive_the_event() {
    let s = setup();
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/tickets"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let tickets = Endpoint::new("tickets", format!("{}/tickets", server.uri()))
        .with_events([EventKind::TicketCreated]);
    s.endpoints.create(&tickets).await.unwrap();
    let disabled = Endpoint::new("off", format!("{}/off", server.uri())).subscribed_to_all().disabled();
    s.endpoints.create(&disabled).await.unwrap();

    let data = EventData::new().with("ticket_id", 123).with("status", "new");
    let results = s.broadcaster.broadcast(EventKind::TicketStatusChanged, data.clone()).wait().await;
    assert!(results.is_empty());
    assert!(s.log.is_empty().await);
    assert!(server.received_requests().await.unwrap().is_empty());

    let results = s.broadcaster.broadcast(EventKind::TicketCreated, data).wait().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].endpoint_id, tickets.id);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["data"]["ticket_id"], 123);
    assert_eq!(s.log.len().await, 1);
}

#[tokio::test]
async fn failing_endpoint_does_not_affect_siblings() {
    let s = setup();
    let ok = receiver(200).await;
    let broken = receiver(500).await;

    let good = Endpoint::new("good", format!("{}/hook", ok.uri())).subscribed_to_all();
    let bad = Endpoint::new("bad", format!("{}/hook", broken.uri())).subscribed_to_all();
    let dead = Endpoint::new("dead", "http://127.0.0.1:9/hook").subscribed_to_all();
    for e in [&good, &bad, &dead] {
        s.endpoints.create(e).await.unwrap();
    }

    let results = s.broadcaster.broadcast(EventKind::UserUpdated, EventData::new()).wait().await;
    assert_eq!(results.len(), 3);

    let records = s.log.all().await;
    let by_endpoint = |id| records.iter().find(|r| r.endpoint_id == id).unwrap();
    assert!(by_endpoint(good.id).success);
    assert_eq!(by_endpoint(bad.id).status_code, 500);
    assert_eq!(by_endpoint(dead.id).status_code, 0);
}

#[tokio::test]
async fn retry_variant_surfaces_aggregate_error() {
    let policy = RetryPolicy {
        max_retries: 2,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(20),
        ..Default::default()
    };
    let s = setup_with(policy, BroadcastConfig::default());
    let broken = receiver(500).await;
    let endpoint = Endpoint::new("bad", format!("{}/hook", broken.uri())).subscribed_to_all();
    s.endpoints.create(&endpoint).await.unwrap();

    let results =
        s.broadcaster.broadcast_with_retry(EventKind::MessageCreated, EventData::new()).wait().await;

    assert!(matches!(
        results[0].result,
        Err(DeliveryError::RetriesExhausted { attempts: 3, .. })
    ));
    assert_eq!(s.log.len().await, 3);
}

#[tokio::test]
async fn broadcast_returns_before_delivery_completes() {
    let s = setup();
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;
    let endpoint = Endpoint::new("slow", format!("{}/hook", server.uri())).subscribed_to_all();
    s.endpoints.create(&endpoint).await.unwrap();

    s.broadcaster.publish(EventKind::TicketClosed, EventData::new());
    assert!(s.log.is_empty().await);

    s.broadcaster.wait_idle().await;
    assert_eq!(s.log.len().await, 1);
    assert_eq!(s.broadcaster.in_flight(), 0);
}

#[tokio::test]
async fn per_endpoint_cap_serializes_deliveries() {
    let config = BroadcastConfig { max_in_flight: None, max_per_endpoint: Some(1) };
    let s = setup_with(RetryPolicy::default(), config);
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
        .mount(&server)
        .await;
    let endpoint = Endpoint::new("capped", format!("{}/hook", server.uri())).subscribed_to_all();
    s.endpoints.create(&endpoint).await.unwrap();

    let started = std::time::Instant::now();
    let first = s.broadcaster.broadcast(EventKind::TicketCreated, EventData::new());
    let second = s.broadcaster.broadcast(EventKind::TicketUpdated, EventData::new());
    first.wait().await;
    second.wait().await;

    assert!(started.elapsed() >= Duration::from_millis(400));
    assert_eq!(s.log.len().await, 2);
}

#[tokio::test]
async fn global_cap_limits_deliveries_across_endpoints() {
    let config = BroadcastConfig { max_in_flight: Some(1), max_per_endpoint: None };
    let s = setup_with(RetryPolicy::default(), config);
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)))
        .mount(&server)
        .await;
    for i in 0..2 {
        let endpoint = Endpoint::new(format!("ep-{i}"), format!("{}/hook/{i}", server.uri()))
            .subscribed_to_all();
        s.endpoints.create(&endpoint).await.unwrap();
    }

    let started = std::time::Instant::now();
    let results = s.broadcaster.broadcast(EventKind::TicketCreated, EventData::new()).wait().await;

    assert_eq!(results.len(), 2);
    assert!(started.elapsed() >= Duration::from_millis(600));

    let records = s.log.all().await;
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.duration_ms >= 300));
}

#[tokio::test]
async fn queued_endpoint_does_not_hold_global_slots() {
    let config = BroadcastConfig { max_in_flight: Some(2), max_per_endpoint: Some(1) };
    let s = setup_with(RetryPolicy::default(), config);

    let slow_server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&slow_server)
        .await;
    let fast_server = receiver(200).await;

    let slow = Endpoint::new("slow", format!("{}/hook", slow_server.uri()))
        .with_events([EventKind::TicketCreated]);
    s.endpoints.create(&slow).await.unwrap();
    let fast = Endpoint::new("fast", format!("{}/hook", fast_server.uri()))
        .with_events([EventKind::UserCreated]);
    s.endpoints.create(&fast).await.unwrap();

    let _first = s.broadcaster.broadcast(EventKind::TicketCreated, EventData::new());
    let _second = s.broadcaster.broadcast(EventKind::TicketCreated, EventData::new());
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = std::time::Instant::now();
    let results = s.broadcaster.broadcast(EventKind::UserCreated, EventData::new()).wait().await;

    assert_eq!(results.len(), 1);
    assert!(matches!(&results[0].result, Ok(o) if o.is_success()));
    assert!(started.elapsed() < Duration::from_secs(1), "fast endpoint waited on the slow one");
}

#[tokio::test]
async fn wait_idle_alongside_shutdown_still_drains() {
    let s = setup();
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
        .mount(&server)
        .await;
    let endpoint = Endpoint::new("ep", format!("{}/hook", server.uri())).subscribed_to_all();
    s.endpoints.create(&endpoint).await.unwrap();

    s.broadcaster.publish(EventKind::UserCreated, EventData::new());

    let waiter = s.broadcaster.clone();
    let idle = tokio::spawn(async move { waiter.wait_idle().await });
    tokio::task::yield_now().await;

    s.broadcaster.shutdown(Duration::from_secs(5)).await.unwrap();
    idle.await.unwrap();
    assert_eq!(s.log.len().await, 1);

    let results = s.broadcaster.broadcast(EventKind::UserCreated, EventData::new()).wait().await;
    assert!(results.is_empty());
    s.broadcaster.wait_idle().await;
}

#[tokio::test]
async fn shutdown_drains_and_rejects_new_events() {
    let s = setup();
    let server = receiver(200).await;
    let endpoint = Endpoint::new("ep", format!("{}/hook", server.uri())).subscribed_to_all();
    s.endpoints.create(&endpoint).await.unwrap();

    s.broadcaster.publish(EventKind::UserCreated, EventData::new());
    s.broadcaster.shutdown(Duration::from_secs(5)).await.unwrap();
    assert_eq!(s.log.len().await, 1);

    let results = s.broadcaster.broadcast(EventKind::UserCreated, EventData::new()).wait().await;
    assert!(results.is_empty());
    assert_eq!(s.log.len().await, 1);
}

#[tokio::test]
async fn shutdown_times_out_and_cancels_pending_retries() {
    let policy = RetryPolicy { initial_backoff: Duration::from_secs(60), ..Default::default() };
    let s = setup_with(policy, BroadcastConfig::default());
    let broken = receiver(500).await;
    let endpoint = Endpoint::new("bad", format!("{}/hook", broken.uri())).subscribed_to_all();
    s.endpoints.create(&endpoint).await.unwrap();

    let handle = s.broadcaster.broadcast_with_retry(EventKind::TicketAssigned, EventData::new());
    tokio::time::sleep(Duration::from_millis(300)).await;

    let err = s.broadcaster.shutdown(Duration::from_millis(100)).await.unwrap_err();
    assert!(matches!(err, DeliveryError::ShutdownTimeout { .. }));

    let results = handle.wait().await;
    assert!(matches!(results[0].result, Err(DeliveryError::Cancelled)));
    assert_eq!(s.log.len().await, 1);
}

#[tokio::test]
async fn test_delivery_bypasses_subscription_and_enabled_flag() {
    let s = setup();
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::header("x-webhook-event", "webhook.test"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    let endpoint = Endpoint::new("off", format!("{}/hook", server.uri())).disabled();
    s.endpoints.create(&endpoint).await.unwrap();

    let report = s.broadcaster.send_test(endpoint.id).await.unwrap();
    assert!(report.success());
    assert_eq!(report.record.event, EventKind::WebhookTest);

    let stored = s.endpoints.find_by_id(endpoint.id).await.unwrap().unwrap();
    assert!(!stored.enabled);
}

#[tokio::test]
async fn test_delivery_to_unknown_endpoint_fails() {
    let s = setup();
    let err = s.broadcaster.send_test(hookline_core::EndpointId::new()).await.unwrap_err();
    assert!(matches!(err, DeliveryError::EndpointNotFound { .. }));
}
