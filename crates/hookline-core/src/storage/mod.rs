//! Persistence for endpoint configuration and the delivery audit log.
//!
//! The delivery engine only sees the two traits defined here. PostgreSQL
//! repositories back production; the in-memory implementations back tests
//! and the `memory` storage backend. Neither caches: every registry read
//! reflects the latest committed configuration.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;

use crate::{
    error::Result,
    models::{DeliveryRecord, Endpoint, EndpointId, EventKind},
};

pub mod deliveries;
pub mod endpoints;
pub mod memory;

/// Registered endpoint configuration.
#[async_trait]
pub trait EndpointRepository: Send + Sync {
    /// Inserts a new endpoint.
    async fn create(&self, endpoint: &Endpoint) -> Result<EndpointId>;

    /// Replaces an existing endpoint. Fails with `NotFound` if absent.
    async fn update(&self, endpoint: &Endpoint) -> Result<()>;

    /// Deletes an endpoint. Returns false if it did not exist.
    async fn delete(&self, id: EndpointId) -> Result<bool>;

    /// Looks up one endpoint.
    async fn find_by_id(&self, id: EndpointId) -> Result<Option<Endpoint>>;

    /// All endpoints, oldest first.
    async fn list(&self) -> Result<Vec<Endpoint>>;

    /// All enabled endpoints.
    async fn list_enabled(&self) -> Result<Vec<Endpoint>>;

    /// Endpoints eligible for `kind`: enabled and subscribed to it or to all.
    async fn find_subscribed(&self, kind: EventKind) -> Result<Vec<Endpoint>>;
}

/// Append-only audit trail of delivery attempts.
#[async_trait]
pub trait DeliveryLog: Send + Sync {
    /// Appends one record. Records are never updated.
    async fn record(&self, record: &DeliveryRecord) -> Result<()>;

    /// Most recent records for one endpoint, newest first.
    async fn find_by_endpoint(
        &self,
        endpoint_id: EndpointId,
        limit: usize,
    ) -> Result<Vec<DeliveryRecord>>;

    /// Most recent records across all endpoints, newest first.
    async fn list_recent(&self, limit: usize) -> Result<Vec<DeliveryRecord>>;

    /// Number of records for one endpoint.
    async fn count_by_endpoint(&self, endpoint_id: EndpointId) -> Result<u64>;
}

/// Bundle of the repositories used by the service.
#[derive(Clone)]
pub struct Storage {
    /// Endpoint configuration.
    pub endpoints: Arc<dyn EndpointRepository>,

    /// Delivery audit log.
    pub deliveries: Arc<dyn DeliveryLog>,

    pool: Option<Arc<PgPool>>,
}

impl Storage {
    /// PostgreSQL-backed storage sharing one pool.
    pub fn postgres(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            endpoints: Arc::new(endpoints::Repository::new(pool.clone())),
            deliveries: Arc::new(deliveries::Repository::new(pool.clone())),
            pool: Some(pool),
        }
    }

    /// Process-local storage.
    pub fn in_memory() -> Self {
        Self {
            endpoints: Arc::new(memory::InMemoryEndpoints::new()),
            deliveries: Arc::new(memory::InMemoryDeliveryLog::new()),
            pool: None,
        }
    }

    /// Returns the database pool when backed by PostgreSQL.
    pub fn pool(&self) -> Option<&PgPool> {
        self.pool.as_deref()
    }

    /// Verifies the backing store is reachable.
    ///
    /// # Errors
    ///
    /// Returns error if the database query fails.
    pub async fn health_check(&self) -> Result<()> {
        if let Some(pool) = &self.pool {
            sqlx::query("SELECT 1").execute(&**pool).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("backend", &if self.pool.is_some() { "postgres" } else { "memory" })
            .finish()
    }
}

const MIGRATIONS: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS webhook_endpoints (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        url TEXT NOT NULL,
        secret TEXT,
        enabled BOOLEAN NOT NULL DEFAULT TRUE,
        event_all BOOLEAN NOT NULL DEFAULT FALSE,
        events TEXT[] NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS webhook_deliveries (
        id UUID PRIMARY KEY,
        endpoint_id UUID NOT NULL,
        event TEXT NOT NULL,
        attempt INTEGER NOT NULL CHECK (attempt >= 1),
        success BOOLEAN NOT NULL,
        request_url TEXT NOT NULL,
        request_body TEXT NOT NULL,
        request_headers TEXT NOT NULL,
        status_code INTEGER NOT NULL DEFAULT 0,
        response TEXT NOT NULL DEFAULT '',
        duration_ms BIGINT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_webhook_endpoints_enabled ON webhook_endpoints (enabled)",
    r"
    CREATE INDEX IF NOT EXISTS idx_webhook_deliveries_endpoint_created
        ON webhook_deliveries (endpoint_id, created_at DESC)
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_webhook_deliveries_created
        ON webhook_deliveries (created_at DESC)
    ",
];

/// Creates tables and indexes if they do not exist.
///
/// Audit records deliberately carry no foreign key so the trail survives
/// endpoint deletion.
///
/// # Errors
///
/// Returns error if any statement fails.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    for statement in MIGRATIONS {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

/// Clamps a caller-supplied limit into a SQL `LIMIT` value.
pub(crate) fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}
