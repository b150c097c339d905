//! PostgreSQL repository for webhook endpoint configuration.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{Executor, PgPool, Postgres};

use super::EndpointRepository;
use crate::{
    error::{CoreError, Result},
    models::{Endpoint, EndpointId, EventKind},
};

const SELECT_COLUMNS: &str =
    "SELECT id, name, url, secret, enabled, event_all, events, created_at, updated_at \
     FROM webhook_endpoints";

/// Repository for the `webhook_endpoints` table.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    async fn create_impl<'e, E>(executor: E, endpoint: &Endpoint) -> Result<EndpointId>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let id = sqlx::query_scalar(
            r"
            INSERT INTO webhook_endpoints (
                id, name, url, secret, enabled, event_all, events, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            ",
        )
        .bind(endpoint.id)
        .bind(&endpoint.name)
        .bind(&endpoint.url)
        .bind(&endpoint.secret)
        .bind(endpoint.enabled)
        .bind(endpoint.subscribe_all)
        .bind(event_names(endpoint))
        .bind(endpoint.created_at)
        .bind(endpoint.updated_at)
        .fetch_one(executor)
        .await?;

        Ok(id)
    }
}

fn event_names(endpoint: &Endpoint) -> Vec<String> {
    endpoint.events.iter().map(|kind| kind.as_str().to_string()).collect()
}

#[async_trait]
impl EndpointRepository for Repository {
    async fn create(&self, endpoint: &Endpoint) -> Result<EndpointId> {
        Self::create_impl(&*self.pool, endpoint).await
    }

    async fn update(&self, endpoint: &Endpoint) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE webhook_endpoints
            SET name = $2, url = $3, secret = $4, enabled = $5,
                event_all = $6, events = $7, updated_at = $8
            WHERE id = $1
            ",
        )
        .bind(endpoint.id)
        .bind(&endpoint.name)
        .bind(&endpoint.url)
        .bind(&endpoint.secret)
        .bind(endpoint.enabled)
        .bind(endpoint.subscribe_all)
        .bind(event_names(endpoint))
        .bind(endpoint.updated_at)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("endpoint {}", endpoint.id)));
        }
        Ok(())
    }

    async fn delete(&self, id: EndpointId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM webhook_endpoints WHERE id = $1")
            .bind(id)
            .execute(&*self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_by_id(&self, id: EndpointId) -> Result<Option<Endpoint>> {
        let endpoint = sqlx::query_as::<_, Endpoint>(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?;
        Ok(endpoint)
    }

    async fn list(&self) -> Result<Vec<Endpoint>> {
        let endpoints =
            sqlx::query_as::<_, Endpoint>(&format!("{SELECT_COLUMNS} ORDER BY created_at ASC"))
                .fetch_all(&*self.pool)
                .await?;
        Ok(endpoints)
    }

    async fn list_enabled(&self) -> Result<Vec<Endpoint>> {
        let endpoints = sqlx::query_as::<_, Endpoint>(&format!(
            "{SELECT_COLUMNS} WHERE enabled = TRUE ORDER BY created_at ASC"
        ))
        .fetch_all(&*self.pool)
        .await?;
        Ok(endpoints)
    }

    async fn find_subscribed(&self, kind: EventKind) -> Result<Vec<Endpoint>> {
        let endpoints = sqlx::query_as::<_, Endpoint>(&format!(
            "{SELECT_COLUMNS} WHERE enabled = TRUE AND (event_all = TRUE OR $1 = ANY(events))"
        ))
        .bind(kind.as_str())
        .fetch_all(&*self.pool)
        .await?;
        Ok(endpoints)
    }
}
