//! PostgreSQL repository for the delivery audit log.
//!
//! Single-row inserts only; concurrent delivery tasks write independently
//! and no row is ever updated in place.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{Executor, PgPool, Postgres};

use super::{sql_limit, DeliveryLog};
use crate::{
    error::Result,
    models::{DeliveryRecord, EndpointId},
};

const SELECT_COLUMNS: &str = "SELECT id, endpoint_id, event, attempt, success, request_url, \
     request_body, request_headers, status_code, response, duration_ms, created_at \
     FROM webhook_deliveries";

/// Repository for the `webhook_deliveries` table.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    async fn record_impl<'e, E>(executor: E, record: &DeliveryRecord) -> Result<()>
    where
        E: Executor<'e, Database = Postgres>,
    {
        sqlx::query(
            r"
            INSERT INTO webhook_deliveries (
                id, endpoint_id, event, attempt, success, request_url, request_body,
                request_headers, status_code, response, duration_ms, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ",
        )
        .bind(record.id)
        .bind(record.endpoint_id)
        .bind(record.event)
        .bind(i32::try_from(record.attempt).unwrap_or(i32::MAX))
        .bind(record.success)
        .bind(&record.request_url)
        .bind(&record.request_body)
        .bind(&record.request_headers)
        .bind(i32::from(record.status_code))
        .bind(&record.response)
        .bind(i64::try_from(record.duration_ms).unwrap_or(i64::MAX))
        .bind(record.created_at)
        .execute(executor)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl DeliveryLog for Repository {
    async fn record(&self, record: &DeliveryRecord) -> Result<()> {
        Self::record_impl(&*self.pool, record).await
    }

    async fn find_by_endpoint(
        &self,
        endpoint_id: EndpointId,
        limit: usize,
    ) -> Result<Vec<DeliveryRecord>> {
        let records = sqlx::query_as::<_, DeliveryRecord>(&format!(
            "{SELECT_COLUMNS} WHERE endpoint_id = $1 ORDER BY created_at DESC, attempt DESC LIMIT $2"
        ))
        .bind(endpoint_id)
        .bind(sql_limit(limit))
        .fetch_all(&*self.pool)
        .await?;
        Ok(records)
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<DeliveryRecord>> {
        let records = sqlx::query_as::<_, DeliveryRecord>(&format!(
            "{SELECT_COLUMNS} ORDER BY created_at DESC LIMIT $1"
        ))
        .bind(sql_limit(limit))
        .fetch_all(&*self.pool)
        .await?;
        Ok(records)
    }

    async fn count_by_endpoint(&self, endpoint_id: EndpointId) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM webhook_deliveries WHERE endpoint_id = $1")
                .bind(endpoint_id)
                .fetch_one(&*self.pool)
                .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}
