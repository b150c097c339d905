//! In-memory storage for tests and single-process deployments.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{DeliveryLog, EndpointRepository};
use crate::{
    error::{CoreError, Result},
    models::{DeliveryRecord, Endpoint, EndpointId, EventKind},
};

/// Endpoint registry held in a shared map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEndpoints {
    endpoints: Arc<RwLock<HashMap<EndpointId, Endpoint>>>,
}

impl InMemoryEndpoints {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    async fn sorted(&self, filter: impl Fn(&Endpoint) -> bool) -> Vec<Endpoint> {
        let endpoints = self.endpoints.read().await;
        let mut matching: Vec<Endpoint> = endpoints.values().filter(|&e| filter(e)).cloned().collect();
        matching.sort_by_key(|e| e.created_at);
        matching
    }
}

#[async_trait]
impl EndpointRepository for InMemoryEndpoints {
    async fn create(&self, endpoint: &Endpoint) -> Result<EndpointId> {
        let mut endpoints = self.endpoints.write().await;
        if endpoints.contains_key(&endpoint.id) {
            return Err(CoreError::ConstraintViolation(format!(
                "endpoint {} already exists",
                endpoint.id
            )));
        }
        endpoints.insert(endpoint.id, endpoint.clone());
        Ok(endpoint.id)
    }

    async fn update(&self, endpoint: &Endpoint) -> Result<()> {
        let mut endpoints = self.endpoints.write().await;
        match endpoints.get_mut(&endpoint.id) {
            Some(existing) => {
                *existing = endpoint.clone();
                Ok(())
            },
            None => Err(CoreError::NotFound(format!("endpoint {}", endpoint.id))),
        }
    }

    async fn delete(&self, id: EndpointId) -> Result<bool> {
        Ok(self.endpoints.write().await.remove(&id).is_some())
    }

    async fn find_by_id(&self, id: EndpointId) -> Result<Option<Endpoint>> {
        Ok(self.endpoints.read().await.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Endpoint>> {
        Ok(self.sorted(|_| true).await)
    }

    async fn list_enabled(&self) -> Result<Vec<Endpoint>> {
        Ok(self.sorted(|e| e.enabled).await)
    }

    async fn find_subscribed(&self, kind: EventKind) -> Result<Vec<Endpoint>> {
        Ok(self.sorted(|e| e.is_subscribed(kind)).await)
    }
}

/// Append-only audit log held in a shared vector.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDeliveryLog {
    records: Arc<RwLock<Vec<DeliveryRecord>>>,
}

impl InMemoryDeliveryLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record in insertion order.
    pub async fn all(&self) -> Vec<DeliveryRecord> {
        self.records.read().await.clone()
    }

    /// Total number of records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// True when nothing has been recorded.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl DeliveryLog for InMemoryDeliveryLog {
    async fn record(&self, record: &DeliveryRecord) -> Result<()> {
        self.records.write().await.push(record.clone());
        Ok(())
    }

    async fn find_by_endpoint(
        &self,
        endpoint_id: EndpointId,
        limit: usize,
    ) -> Result<Vec<DeliveryRecord>> {
        let records = self.records.read().await;
        Ok(records.iter().rev().filter(|r| r.endpoint_id == endpoint_id).take(limit).cloned().collect())
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<DeliveryRecord>> {
        let records = self.records.read().await;
        Ok(records.iter().rev().take(limit).cloned().collect())
    }

    async fn count_by_endpoint(&self, endpoint_id: EndpointId) -> Result<u64> {
        let records = self.records.read().await;
        Ok(records.iter().filter(|r| r.endpoint_id == endpoint_id).count() as u64)
    }
}
