//! HTTP delivery of one envelope to one endpoint.
//!
//! Each call to [`WebhookSender::send_attempt`] that passes the eligibility
//! re-check makes exactly one POST and appends exactly one
//! [`DeliveryRecord`] to the audit log, whatever the outcome.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use bytes::Bytes;
use hookline_core::{
    storage::DeliveryLog, truncate_response, Clock, DeliveryId, DeliveryRecord, Endpoint,
    Envelope, RealClock,
};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::{
    error::{DeliveryError, Result},
    signing,
};

/// Header carrying the event name.
pub const EVENT_HEADER: &str = "X-Webhook-Event";
/// Header carrying the endpoint id.
pub const ENDPOINT_ID_HEADER: &str = "X-Webhook-ID";
/// Header carrying the hex HMAC-SHA256 of the body.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Configuration for the webhook sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderConfig {
    /// Hard per-attempt deadline covering connect, TLS and body read.
    pub timeout: Duration,
    /// `User-Agent` sent with every request.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
    /// Whether to verify TLS certificates.
    pub verify_tls: bool,
    /// Characters of response body kept in the audit record.
    pub response_body_limit: usize,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            user_agent: crate::DEFAULT_USER_AGENT.to_string(),
            max_redirects: 3,
            verify_tls: true,
            response_body_limit: crate::DEFAULT_RESPONSE_BODY_LIMIT,
        }
    }
}

/// Why a send made no attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Endpoint is disabled.
    Disabled,
    /// Endpoint is not subscribed to the event.
    NotSubscribed,
}

/// Result of one physical attempt, as persisted.
#[derive(Debug, Clone)]
pub struct AttemptReport {
    /// The audit record written for this attempt.
    pub record: DeliveryRecord,
    /// Failure classification; `None` on success.
    pub error: Option<DeliveryError>,
}

impl AttemptReport {
    /// True for a 2xx response.
    pub fn success(&self) -> bool {
        self.error.is_none()
    }

    /// Status code, absent when no response was obtained.
    pub fn status_code(&self) -> Option<u16> {
        Some(self.record.status_code).filter(|code| *code != 0)
    }

    /// Response body or error message.
    pub fn summary(&self) -> &str {
        &self.record.response
    }
}

/// Outcome of [`WebhookSender::send`].
#[derive(Debug, Clone)]
pub enum DeliveryOutcome {
    /// No attempt and no audit record.
    Skipped(SkipReason),
    /// One attempt was made and recorded.
    Attempted(AttemptReport),
}

impl DeliveryOutcome {
    /// True only for a successful attempt.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Attempted(report) if report.success())
    }

    /// The attempt report, if an attempt was made.
    pub fn report(&self) -> Option<&AttemptReport> {
        match self {
            Self::Attempted(report) => Some(report),
            Self::Skipped(_) => None,
        }
    }
}

/// Delivers envelopes over HTTP and records every attempt.
///
/// Cheap to share behind an `Arc`; the inner `reqwest::Client` pools
/// connections across all endpoints.
#[derive(Clone)]
pub struct WebhookSender {
    client: reqwest::Client,
    config: SenderConfig,
    log: Arc<dyn DeliveryLog>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for WebhookSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookSender").field("config", &self.config).finish_non_exhaustive()
    }
}

impl WebhookSender {
    /// Creates a sender using the system clock.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot be
    /// built from the configuration.
    pub fn new(config: SenderConfig, log: Arc<dyn DeliveryLog>) -> Result<Self> {
        Self::with_clock(config, log, Arc::new(RealClock::new()))
    }

    /// Creates a sender with an injected clock.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot be
    /// built from the configuration.
    pub fn with_clock(
        config: SenderConfig,
        log: Arc<dyn DeliveryLog>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if config.timeout.is_zero() {
            return Err(DeliveryError::configuration("timeout must be greater than zero"));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config, log, clock })
    }

    /// Sender configuration.
    pub fn config(&self) -> &SenderConfig {
        &self.config
    }

    /// Clock used for timestamps and backoff.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Sends a first attempt.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Encoding` when the envelope cannot be
    /// serialized. HTTP and transport failures are reported through the
    /// returned outcome, not as errors.
    pub async fn send(&self, endpoint: &Endpoint, envelope: &Envelope) -> Result<DeliveryOutcome> {
        self.send_attempt(endpoint, envelope, 1).await
    }

    /// Sends attempt number `attempt` (1-based).
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Encoding` when the envelope cannot be
    /// serialized.
    pub async fn send_attempt(
        &self,
        endpoint: &Endpoint,
        envelope: &Envelope,
        attempt: u32,
    ) -> Result<DeliveryOutcome> {
        if !endpoint.enabled {
            return Ok(DeliveryOutcome::Skipped(SkipReason::Disabled));
        }
        if !endpoint.is_subscribed(envelope.event) {
            return Ok(DeliveryOutcome::Skipped(SkipReason::NotSubscribed));
        }

        let body = Bytes::from(envelope.to_bytes()?);

        let span = info_span!(
            "webhook_delivery",
            endpoint_id = %endpoint.id,
            event = %envelope.event,
            attempt
        );

        async move {
            let headers = self.request_headers(endpoint, envelope, &body);
            let request_headers = serialize_headers(&headers);

            tracing::debug!(url = %endpoint.url, "starting webhook delivery");

            let start = std::time::Instant::now();
            let result = self.execute(&endpoint.url, headers, body.clone()).await;
            let duration = start.elapsed();
            let duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);

            let (status_code, response, error) = match result {
                Ok((status, text)) if (200..300).contains(&status) => {
                    tracing::info!(status, duration_ms, "webhook delivered");
                    (status, text, None)
                },
                Ok((status, text)) => {
                    tracing::warn!(status, duration_ms, "webhook rejected by receiver");
                    (status, text.clone(), Some(DeliveryError::http(status, text)))
                },
                Err(err) => {
                    tracing::warn!(
                        status = 0,
                        duration_ms,
                        error = %err,
                        kind = %err.kind(),
                        "webhook delivery failed"
                    );
                    (0, err.to_string(), Some(err))
                },
            };

            let record = DeliveryRecord {
                id: DeliveryId::new(),
                endpoint_id: endpoint.id,
                event: envelope.event,
                attempt,
                success: error.is_none(),
                request_url: endpoint.url.clone(),
                request_body: String::from_utf8_lossy(&body).into_owned(),
                request_headers,
                status_code,
                response,
                duration_ms,
                created_at: self.clock.now_utc(),
            };

            if let Err(e) = self.log.record(&record).await {
                tracing::error!(error = %e, delivery_id = %record.id, "failed to persist delivery record");
            }

            Ok(DeliveryOutcome::Attempted(AttemptReport { record, error }))
        }
        .instrument(span)
        .await
    }

    fn request_headers(&self, endpoint: &Endpoint, envelope: &Envelope, body: &[u8]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(agent) = HeaderValue::from_str(&self.config.user_agent) {
            headers.insert(USER_AGENT, agent);
        }
        headers.insert(
            HeaderName::from_static("x-webhook-event"),
            HeaderValue::from_static(envelope.event.as_str()),
        );
        if let Ok(id) = HeaderValue::from_str(&endpoint.id.to_string()) {
            headers.insert(HeaderName::from_static("x-webhook-id"), id);
        }
        if let Some(signature) = signing::signature_for(endpoint, body) {
            if let Ok(value) = HeaderValue::from_str(&signature) {
                headers.insert(HeaderName::from_static("x-webhook-signature"), value);
            }
        }
        headers
    }

    /// Performs the POST and reads the capped response body.
    async fn execute(&self, url: &str, headers: HeaderMap, body: Bytes) -> Result<(u16, String)> {
        let response = self
            .client
            .post(url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| self.classify(&e))?;

        let status = response.status().as_u16();
        let mut response = response;
        let mut body = CappedBody::new(self.config.response_body_limit);
        while let Some(chunk) = response.chunk().await.map_err(|e| self.classify(&e))? {
            if body.push(&chunk) {
                break;
            }
        }

        Ok((status, body.finish()))
    }

    fn classify(&self, err: &reqwest::Error) -> DeliveryError {
        if err.is_timeout() {
            DeliveryError::timeout(self.config.timeout.as_secs())
        } else if err.is_connect() {
            DeliveryError::network(format!("connection failed: {err}"))
        } else {
            DeliveryError::network(err.to_string())
        }
    }
}

/// Response body buffer that stops growing once it holds more than `limit`
/// characters, so an oversized reply is never read in full.
struct CappedBody {
    limit: usize,
    max_bytes: usize,
    buf: Vec<u8>,
}

impl CappedBody {
    fn new(limit: usize) -> Self {
        // A UTF-8 character is at most four bytes.
        let max_bytes = limit.saturating_add(1).saturating_mul(4);
        Self { limit, max_bytes, buf: Vec::new() }
    }

    /// Appends a chunk. Returns true once enough has been read to truncate.
    fn push(&mut self, chunk: &[u8]) -> bool {
        let room = self.max_bytes.saturating_sub(self.buf.len());
        self.buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
        self.buf.len() >= self.max_bytes
    }

    fn finish(self) -> String {
        truncate_response(&String::from_utf8_lossy(&self.buf), self.limit)
    }
}

/// Serializes headers as a JSON object using the canonical wire names.
fn serialize_headers(headers: &HeaderMap) -> String {
    let map: BTreeMap<&str, &str> = headers
        .iter()
        .filter_map(|(name, value)| Some((canonical_name(name), value.to_str().ok()?)))
        .collect();
    serde_json::to_string(&map).unwrap_or_else(|_| "{}".to_string())
}

fn canonical_name(name: &HeaderName) -> &str {
    match name.as_str() {
        "content-type" => "Content-Type",
        "user-agent" => "User-Agent",
        "x-webhook-event" => EVENT_HEADER,
        "x-webhook-id" => ENDPOINT_ID_HEADER,
        "x-webhook-signature" => SIGNATURE_HEADER,
        other => other,
    }
}
