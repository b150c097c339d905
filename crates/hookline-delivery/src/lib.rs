//! Outbound webhook delivery.
//!
//! A domain event flows through the crate as follows:
//!
//! 1. **Broadcast** - [`Broadcaster`] asks the registry for eligible
//!    endpoints and spawns one tracked task per endpoint
//! 2. **Build** - one shared [`hookline_core::Envelope`] per broadcast
//! 3. **Sign** - HMAC-SHA256 over the exact body when a secret is set
//! 4. **Send** - [`WebhookSender`] POSTs with a hard timeout and records the
//!    attempt in the audit log
//! 5. **Retry** - optionally, [`RetryingSender`] repeats failed attempts with
//!    exponential backoff
//!
//! Delivery is best-effort relative to the producer: failures end up in the
//! audit log and in the logs, never in the caller of `broadcast`.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hookline_core::{EventData, EventKind, Storage};
//! use hookline_delivery::{BroadcastConfig, Broadcaster, RetryPolicy, SenderConfig, WebhookSender};
//!
//! # async fn example() -> hookline_delivery::Result<()> {
//! let storage = Storage::in_memory();
//! let sender = Arc::new(WebhookSender::new(SenderConfig::default(), storage.deliveries.clone())?);
//! let broadcaster = Broadcaster::new(
//!     storage.endpoints.clone(),
//!     sender,
//!     RetryPolicy::default(),
//!     BroadcastConfig::default(),
//! );
//!
//! broadcaster.broadcast(EventKind::TicketCreated, EventData::new().with("ticket_id", 123));
//! broadcaster.shutdown(std::time::Duration::from_secs(30)).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod broadcast;
pub mod error;
pub mod retry;
pub mod sender;
pub mod signing;

pub use broadcast::{
    BroadcastConfig, BroadcastHandle, Broadcaster, EndpointDelivery, EventPublisher,
    NoopPublisher,
};
pub use error::{DeliveryError, ErrorKind, Result};
pub use retry::{RetryClassifier, RetryPolicy, RetryingSender};
pub use sender::{
    AttemptReport, DeliveryOutcome, SenderConfig, SkipReason, WebhookSender, ENDPOINT_ID_HEADER,
    EVENT_HEADER, SIGNATURE_HEADER,
};

/// Default per-attempt HTTP timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

/// Default `User-Agent` header.
pub const DEFAULT_USER_AGENT: &str = "Hookline-Webhook/1.0";

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default number of response characters kept in audit records.
pub const DEFAULT_RESPONSE_BODY_LIMIT: usize = 2000;
