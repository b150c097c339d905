//! Read access to the delivery audit log.

use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    Json,
};
use hookline_core::{DeliveryRecord, EndpointId};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use super::{error::ApiError, webhooks::parse_id};
use crate::AppState;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

/// Paging for audit queries.
#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    /// Records to return, newest first. Defaults to 50, capped at 500.
    pub limit: Option<usize>,
}

impl LimitQuery {
    fn effective(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

/// Audit records for one endpoint.
#[derive(Debug, Serialize)]
pub struct EndpointDeliveries {
    /// Endpoint the records belong to
    pub endpoint_id: EndpointId,
    /// Total records stored for the endpoint
    pub total: u64,
    /// Most recent records, newest first
    pub deliveries: Vec<DeliveryRecord>,
}

/// `GET /webhooks/{id}/deliveries?limit=`
///
/// Records outlive their endpoint, so an unknown id yields an empty list.
#[instrument(name = "list_endpoint_deliveries", skip(state))]
pub async fn list_endpoint_deliveries(
    State(state): State<AppState>,
    Path(id): Path<String>,
    query: Result<Query<LimitQuery>, QueryRejection>,
) -> Result<Json<EndpointDeliveries>, ApiError> {
    let endpoint_id = parse_id(&id)?;
    let Query(query) = query?;

    let deliveries =
        state.storage.deliveries.find_by_endpoint(endpoint_id, query.effective()).await?;
    let total = state.storage.deliveries.count_by_endpoint(endpoint_id).await?;

    Ok(Json(EndpointDeliveries { endpoint_id, total, deliveries }))
}

/// `GET /deliveries?limit=`
#[instrument(name = "list_recent_deliveries", skip(state))]
pub async fn list_recent_deliveries(
    State(state): State<AppState>,
    query: Result<Query<LimitQuery>, QueryRejection>,
) -> Result<Json<Vec<DeliveryRecord>>, ApiError> {
    let Query(query) = query?;
    Ok(Json(state.storage.deliveries.list_recent(query.effective()).await?))
}
