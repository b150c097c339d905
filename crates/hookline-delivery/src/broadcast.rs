//! Fan-out of domain events to every eligible endpoint.
//!
//! `broadcast` returns immediately. Each matched endpoint gets its own
//! tracked task; tasks share only the read-only envelope. A failing
//! endpoint never affects its siblings or the caller.
//!
//! All tasks run on a [`TaskTracker`] so shutdown can drain in-flight
//! deliveries and cancel whatever is left after the deadline. Concurrency
//! caps are opt-in; without them every matched endpoint is dispatched at
//! once.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use hookline_core::{storage::EndpointRepository, Endpoint, EndpointId, Envelope, EventData, EventKind};
use tokio::{
    sync::{Notify, OwnedSemaphorePermit, RwLock, Semaphore},
    task::JoinHandle,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::{
    error::{DeliveryError, Result},
    retry::{RetryPolicy, RetryingSender},
    sender::{AttemptReport, DeliveryOutcome, WebhookSender},
};

/// Capability handed to domain modules that emit events.
///
/// Publishing is best-effort: it never fails and never blocks on delivery.
pub trait EventPublisher: Send + Sync {
    /// Fire-and-forget single-attempt delivery.
    fn publish(&self, event: EventKind, data: EventData);

    /// Fire-and-forget delivery with retry.
    fn publish_with_retry(&self, event: EventKind, data: EventData);
}

/// Publisher that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPublisher;

impl EventPublisher for NoopPublisher {
    fn publish(&self, event: EventKind, _data: EventData) {
        debug!(%event, "webhook delivery disabled, dropping event");
    }

    fn publish_with_retry(&self, event: EventKind, data: EventData) {
        self.publish(event, data);
    }
}

/// Concurrency limits for the broadcaster. `None` means unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastConfig {
    /// Deliveries allowed in flight across all endpoints.
    pub max_in_flight: Option<usize>,
    /// Deliveries allowed in flight per endpoint.
    pub max_per_endpoint: Option<usize>,
}

/// Result of one endpoint's delivery within a broadcast.
#[derive(Debug)]
pub struct EndpointDelivery {
    /// Target endpoint.
    pub endpoint_id: EndpointId,
    /// Final outcome.
    pub result: Result<DeliveryOutcome>,
}

/// Handle to a running broadcast.
///
/// Dropping it detaches nothing: the tasks stay tracked by the broadcaster.
#[derive(Debug)]
pub struct BroadcastHandle {
    inner: JoinHandle<Vec<EndpointDelivery>>,
}

impl BroadcastHandle {
    /// Waits for every delivery of this broadcast and returns the results.
    pub async fn wait(self) -> Vec<EndpointDelivery> {
        match self.inner.await {
            Ok(results) => results,
            Err(join_error) => {
                error!(error = %join_error, "broadcast task failed");
                Vec::new()
            },
        }
    }
}

/// Counts a delivery as in flight until dropped.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl<'a> InFlightGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Counts a tracked task until dropped and wakes idle waiters at zero.
///
/// Created before the task is spawned so the count never dips to zero
/// between a fan-out and the deliveries it starts.
struct PendingGuard(Arc<Inner>);

impl PendingGuard {
    fn new(inner: Arc<Inner>) -> Self {
        inner.pending.fetch_add(1, Ordering::AcqRel);
        Self(inner)
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.0.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Single,
    Retry,
}

struct Inner {
    endpoints: Arc<dyn EndpointRepository>,
    sender: Arc<WebhookSender>,
    retrying: RetryingSender,
    tracker: TaskTracker,
    cancel: CancellationToken,
    accepting: AtomicBool,
    in_flight: AtomicUsize,
    pending: AtomicUsize,
    idle: Notify,
    global_limit: Option<Arc<Semaphore>>,
    per_endpoint_limit: Option<usize>,
    endpoint_limits: RwLock<HashMap<EndpointId, Arc<Semaphore>>>,
}

/// Dispatches events to subscribed endpoints.
#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("in_flight", &self.in_flight())
            .field("accepting", &self.inner.accepting.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl Broadcaster {
    /// Creates a broadcaster.
    pub fn new(
        endpoints: Arc<dyn EndpointRepository>,
        sender: Arc<WebhookSender>,
        policy: RetryPolicy,
        config: BroadcastConfig,
    ) -> Self {
        let cancel = CancellationToken::new();
        let retrying =
            RetryingSender::new(sender.clone(), policy).with_cancellation(cancel.child_token());

        Self {
            inner: Arc::new(Inner {
                endpoints,
                sender,
                retrying,
                tracker: TaskTracker::new(),
                cancel,
                accepting: AtomicBool::new(true),
                in_flight: AtomicUsize::new(0),
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
                global_limit: config.max_in_flight.map(|n| Arc::new(Semaphore::new(n.max(1)))),
                per_endpoint_limit: config.max_per_endpoint.map(|n| n.max(1)),
                endpoint_limits: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Single-attempt fan-out. Returns without waiting for delivery.
    pub fn broadcast(&self, event: EventKind, data: EventData) -> BroadcastHandle {
        self.dispatch(event, data, Mode::Single)
    }

    /// Fan-out through the retry controller. Returns without waiting for
    /// delivery; per-endpoint aggregate errors are available from the handle.
    pub fn broadcast_with_retry(&self, event: EventKind, data: EventData) -> BroadcastHandle {
        self.dispatch(event, data, Mode::Retry)
    }

    /// Sends a synthetic `webhook.test` event to one endpoint, bypassing its
    /// enabled flag and subscriptions for this call only. Waits for the
    /// attempt and returns its report.
    ///
    /// # Errors
    ///
    /// Returns `EndpointNotFound` for an unknown id, `Storage` when the
    /// registry cannot be read, or `Encoding` if the payload fails to
    /// serialize.
    pub async fn send_test(&self, endpoint_id: EndpointId) -> Result<AttemptReport> {
        let endpoint = self
            .inner
            .endpoints
            .find_by_id(endpoint_id)
            .await?
            .ok_or(DeliveryError::EndpointNotFound { endpoint_id })?;

        let now = self.inner.sender.clock().now_utc();
        let data = EventData::new()
            .with("message", "This is a test webhook delivery")
            .with("endpoint_id", endpoint.id.to_string())
            .with("endpoint_name", endpoint.name.clone());
        let envelope = Envelope::build(EventKind::WebhookTest, data, now);

        info!(%endpoint_id, "sending test webhook");
        match self.inner.sender.send(&endpoint.for_test_delivery(), &envelope).await? {
            DeliveryOutcome::Attempted(report) => Ok(report),
            DeliveryOutcome::Skipped(reason) => Err(DeliveryError::configuration(format!(
                "test delivery unexpectedly skipped: {reason:?}"
            ))),
        }
    }

    /// Deliveries currently queued or running.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Waits until every tracked task has finished. Leaves the tracker
    /// untouched, so it is safe to call alongside [`Broadcaster::shutdown`].
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stops accepting events, drains in-flight deliveries, and cancels
    /// whatever remains once `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if deliveries were still running at the
    /// deadline.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.inner.accepting.store(false, Ordering::Release);
        self.inner.tracker.close();

        info!(
            in_flight = self.in_flight(),
            timeout_seconds = timeout.as_secs(),
            "draining webhook deliveries"
        );

        if tokio::time::timeout(timeout, self.inner.tracker.wait()).await.is_ok() {
            info!("webhook broadcaster shutdown completed");
            return Ok(());
        }

        self.inner.cancel.cancel();
        warn!(
            in_flight = self.in_flight(),
            timeout_seconds = timeout.as_secs(),
            "webhook deliveries did not drain in time, cancelling"
        );
        Err(DeliveryError::ShutdownTimeout { timeout })
    }

    fn dispatch(&self, event: EventKind, data: EventData, mode: Mode) -> BroadcastHandle {
        let inner = self.inner.clone();

        let handle = if inner.accepting.load(Ordering::Acquire) {
            let now = inner.sender.clock().now_utc();
            let envelope = Arc::new(Envelope::build(event, data, now));
            let task_inner = inner.clone();
            let pending = PendingGuard::new(inner.clone());
            inner.tracker.spawn(async move {
                let _pending = pending;
                task_inner.fan_out(envelope, mode).await
            })
        } else {
            warn!(%event, "broadcaster is shut down, dropping event");
            tokio::spawn(async { Vec::new() })
        };

        BroadcastHandle { inner: handle }
    }
}

impl Inner {
    async fn fan_out(self: Arc<Self>, envelope: Arc<Envelope>, mode: Mode) -> Vec<EndpointDelivery> {
        let event = envelope.event;
        let endpoints = match self.endpoints.find_subscribed(event).await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                error!(%event, error = %e, "failed to load subscribed endpoints");
                return Vec::new();
            },
        };

        debug!(%event, matched = endpoints.len(), retry = mode == Mode::Retry, "broadcasting event");

        let tasks: Vec<_> = endpoints
            .into_iter()
            .map(|endpoint| {
                let endpoint_id = endpoint.id;
                let envelope = envelope.clone();
                let inner = self.clone();
                let pending = PendingGuard::new(self.clone());
                let handle = self.tracker.spawn(async move {
                    let _pending = pending;
                    let _guard = InFlightGuard::new(&inner.in_flight);
                    inner.deliver(&endpoint, &envelope, mode).await
                });
                (endpoint_id, handle)
            })
            .collect();

        let mut results = Vec::with_capacity(tasks.len());
        for (endpoint_id, handle) in tasks {
            let result = handle.await.unwrap_or_else(|join_error| {
                error!(%endpoint_id, error = %join_error, "delivery task panicked");
                Err(DeliveryError::Cancelled)
            });
            results.push(EndpointDelivery { endpoint_id, result });
        }
        results
    }

    async fn deliver(
        &self,
        endpoint: &Endpoint,
        envelope: &Envelope,
        mode: Mode,
    ) -> Result<DeliveryOutcome> {
        let result = match self.acquire(endpoint.id).await {
            Ok(permits) => {
                let result = self.attempt(endpoint, envelope, mode).await;
                drop(permits);
                result
            },
            Err(e) => Err(e),
        };
        self.prune_endpoint_limits().await;

        if let Err(e) = &result {
            warn!(
                endpoint_id = %endpoint.id,
                event = %envelope.event,
                kind = %e.kind(),
                error = %e,
                "webhook delivery failed"
            );
        }
        result
    }

    async fn attempt(
        &self,
        endpoint: &Endpoint,
        envelope: &Envelope,
        mode: Mode,
    ) -> Result<DeliveryOutcome> {
        match mode {
            Mode::Single => {
                if self.cancel.is_cancelled() {
                    return Err(DeliveryError::Cancelled);
                }
                self.sender.send(endpoint, envelope).await
            },
            Mode::Retry => self.retrying.send_with_retry(endpoint, envelope).await,
        }
    }

    /// Waits for the per-endpoint permit, then the global one, or for
    /// cancellation. A task queued behind its own endpoint holds no global
    /// slot, so a slow endpoint cannot starve the others.
    async fn acquire(&self, endpoint_id: EndpointId) -> Result<Vec<OwnedSemaphorePermit>> {
        let mut semaphores = Vec::with_capacity(2);
        if let Some(limit) = self.per_endpoint_limit {
            semaphores.push(self.endpoint_semaphore(endpoint_id, limit).await);
        }
        if let Some(global) = &self.global_limit {
            semaphores.push(global.clone());
        }

        let mut permits = Vec::with_capacity(semaphores.len());
        for semaphore in semaphores {
            let permit = tokio::select! {
                () = self.cancel.cancelled() => return Err(DeliveryError::Cancelled),
                permit = semaphore.acquire_owned() => permit,
            };
            permits.push(permit.map_err(|_| DeliveryError::Cancelled)?);
        }
        Ok(permits)
    }

    async fn endpoint_semaphore(&self, endpoint_id: EndpointId, limit: usize) -> Arc<Semaphore> {
        if let Some(existing) = self.endpoint_limits.read().await.get(&endpoint_id) {
            return existing.clone();
        }
        self.endpoint_limits
            .write()
            .await
            .entry(endpoint_id)
            .or_insert_with(|| Arc::new(Semaphore::new(limit)))
            .clone()
    }

    /// Drops per-endpoint semaphores nobody holds or waits on. Clones are
    /// only handed out under the map lock, so a count of one means idle.
    async fn prune_endpoint_limits(&self) {
        if self.per_endpoint_limit.is_none() {
            return;
        }
        self.endpoint_limits.write().await.retain(|_, semaphore| Arc::strong_count(semaphore) > 1);
    }
}

impl EventPublisher for Broadcaster {
    fn publish(&self, event: EventKind, data: EventData) {
        drop(self.broadcast(event, data));
    }

    fn publish_with_retry(&self, event: EventKind, data: EventData) {
        drop(self.broadcast_with_retry(event, data));
    }
}
