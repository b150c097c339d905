//! HTTP request handlers for the hookline API.
//!
//! Handlers are grouped by functionality:
//! - `health` - Health check
//! - `webhooks` - Endpoint CRUD and test deliveries
//! - `deliveries` - Audit log queries
//! - `events` - Event publication
//!
//! Every failure is rendered by [`ApiError`] as
//! `{"error": {"code": ..., "message": ...}}`.

pub mod deliveries;
pub mod error;
pub mod events;
pub mod health;
pub mod webhooks;

pub use deliveries::{list_endpoint_deliveries, list_recent_deliveries};
pub use error::ApiError;
pub use events::publish_event;
pub use health::health_check;
pub use webhooks::{
    create_webhook, delete_webhook, get_webhook, list_webhooks, test_webhook, update_webhook,
};
