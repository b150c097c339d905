//! Endpoint administration and test deliveries.

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use hookline_core::{Endpoint, EndpointId, EndpointUpdate, EventKind, NewEndpoint};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use super::error::ApiError;
use crate::AppState;

/// Endpoint as returned by the API. The secret itself is never echoed.
#[derive(Debug, Serialize)]
pub struct EndpointView {
    /// Endpoint identifier
    pub id: EndpointId,
    /// Human-readable label
    pub name: String,
    /// Destination URL
    pub url: String,
    /// Whether deliveries are signed
    pub has_secret: bool,
    /// Whether the endpoint receives broadcasts
    pub enabled: bool,
    /// Wildcard subscription
    pub event_all: bool,
    /// Individual subscriptions
    pub events: Vec<EventKind>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
}

impl From<Endpoint> for EndpointView {
    fn from(endpoint: Endpoint) -> Self {
        Self {
            id: endpoint.id,
            has_secret: endpoint.signing_secret().is_some(),
            name: endpoint.name,
            url: endpoint.url,
            enabled: endpoint.enabled,
            event_all: endpoint.subscribe_all,
            events: endpoint.events.into_iter().collect(),
            created_at: endpoint.created_at,
            updated_at: endpoint.updated_at,
        }
    }
}

/// Outcome of a synchronous test delivery.
#[derive(Debug, Serialize)]
pub struct TestDeliveryResponse {
    /// Audit record written for the attempt
    pub delivery_id: hookline_core::DeliveryId,
    /// True for a 2xx response
    pub success: bool,
    /// Receiver status, 0 when no response was obtained
    pub status_code: u16,
    /// Receiver body or transport error
    pub response: String,
    /// Wall time of the attempt
    pub duration_ms: u64,
}

pub(super) fn parse_id(raw: &str) -> Result<EndpointId, ApiError> {
    raw.parse().map_err(ApiError::from)
}

async fn load(state: &AppState, id: EndpointId) -> Result<Endpoint, ApiError> {
    state
        .storage
        .endpoints
        .find_by_id(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("endpoint {id} not found")))
}

/// Filter for `GET /webhooks`.
#[derive(Debug, Default, Deserialize)]
pub struct ListWebhooksQuery {
    /// Restrict to enabled (`true`) or disabled (`false`) endpoints
    pub enabled: Option<bool>,
}

/// `GET /webhooks`
#[instrument(name = "list_webhooks", skip(state))]
pub async fn list_webhooks(
    State(state): State<AppState>,
    query: Result<Query<ListWebhooksQuery>, QueryRejection>,
) -> Result<Json<Vec<EndpointView>>, ApiError> {
    let Query(query) = query?;
    let endpoints = match query.enabled {
        Some(true) => state.storage.endpoints.list_enabled().await?,
        Some(false) => {
            state.storage.endpoints.list().await?.into_iter().filter(|e| !e.enabled).collect()
        },
        None => state.storage.endpoints.list().await?,
    };
    Ok(Json(endpoints.into_iter().map(EndpointView::from).collect()))
}

/// `POST /webhooks`
#[instrument(name = "create_webhook", skip(state, payload))]
pub async fn create_webhook(
    State(state): State<AppState>,
    payload: Result<Json<NewEndpoint>, JsonRejection>,
) -> Result<(StatusCode, Json<EndpointView>), ApiError> {
    let Json(input) = payload?;
    let endpoint = input.into_endpoint(state.clock.now_utc())?;

    state.storage.endpoints.create(&endpoint).await?;
    info!(endpoint_id = %endpoint.id, url = %endpoint.url, "webhook endpoint created");

    Ok((StatusCode::CREATED, Json(endpoint.into())))
}

/// `GET /webhooks/{id}`
#[instrument(name = "get_webhook", skip(state))]
pub async fn get_webhook(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<EndpointView>, ApiError> {
    let endpoint = load(&state, parse_id(&id)?).await?;
    Ok(Json(endpoint.into()))
}

/// `PUT /webhooks/{id}`
///
/// Absent fields are left untouched. An empty `secret` turns signing off.
#[instrument(name = "update_webhook", skip(state, payload))]
pub async fn update_webhook(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<EndpointUpdate>, JsonRejection>,
) -> Result<Json<EndpointView>, ApiError> {
    let id = parse_id(&id)?;
    let Json(update) = payload?;

    let mut endpoint = load(&state, id).await?;
    update.apply(&mut endpoint, state.clock.now_utc())?;
    state.storage.endpoints.update(&endpoint).await?;
    info!(endpoint_id = %id, enabled = endpoint.enabled, "webhook endpoint updated");

    Ok(Json(endpoint.into()))
}

/// `DELETE /webhooks/{id}`
///
/// Past delivery records are kept.
#[instrument(name = "delete_webhook", skip(state))]
pub async fn delete_webhook(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id)?;
    if state.storage.endpoints.delete(id).await? {
        info!(endpoint_id = %id, "webhook endpoint deleted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("endpoint {id} not found")))
    }
}

/// `POST /webhooks/{id}/test`
///
/// Sends a `webhook.test` event right away, regardless of the endpoint's
/// enabled flag or subscriptions, and reports the single attempt. A receiver
/// failure is still a `200` with `success: false`.
#[instrument(name = "test_webhook", skip(state))]
pub async fn test_webhook(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TestDeliveryResponse>, ApiError> {
    let report = state.broadcaster.send_test(parse_id(&id)?).await?;

    Ok(Json(TestDeliveryResponse {
        delivery_id: report.record.id,
        success: report.success(),
        status_code: report.record.status_code,
        response: report.record.response,
        duration_ms: report.record.duration_ms,
    }))
}
