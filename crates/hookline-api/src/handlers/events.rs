//! Inbound interface for domain code to publish events.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    Json,
};
use hookline_core::{EventData, EventKind};
use hookline_delivery::EventPublisher;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use super::error::ApiError;
use crate::AppState;

/// Body of `POST /events`.
#[derive(Debug, Deserialize)]
pub struct PublishEventRequest {
    /// Wire name of the event kind, e.g. `ticket.created`
    pub event: String,
    /// Event payload; must be a JSON object
    #[serde(default = "empty_object")]
    pub data: Value,
    /// Use the retrying delivery path
    #[serde(default)]
    pub retry: bool,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Acknowledgement returned before any delivery happens.
#[derive(Debug, Serialize)]
pub struct PublishEventResponse {
    /// Always true; delivery outcomes land in the audit log
    pub accepted: bool,
    /// Event kind that was published
    pub event: EventKind,
    /// Whether the retrying path was used
    pub retry: bool,
}

/// `POST /events`
///
/// Validates the request and hands the event to the broadcaster. Responds
/// `202 Accepted` without waiting for any endpoint.
#[instrument(name = "publish_event", skip(state, payload))]
pub async fn publish_event(
    State(state): State<AppState>,
    payload: Result<Json<PublishEventRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<PublishEventResponse>), ApiError> {
    let Json(request) = payload?;

    let event: EventKind = request.event.parse()?;
    if event == EventKind::WebhookTest {
        return Err(ApiError::BadRequest(
            "webhook.test is reserved for test deliveries".to_string(),
        ));
    }
    let data = EventData::try_from(request.data)?;

    debug!(%event, retry = request.retry, fields = data.len(), "event accepted");
    if request.retry {
        state.broadcaster.publish_with_retry(event, data);
    } else {
        state.broadcaster.publish(event, data);
    }

    let ack = PublishEventResponse { accepted: true, event, retry: request.retry };
    Ok((StatusCode::ACCEPTED, Json(ack)))
}
