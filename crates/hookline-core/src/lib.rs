//! Core domain models, storage and time abstractions.
//!
//! Provides the strongly-typed primitives shared by the delivery engine and
//! the HTTP surface: registered endpoints and their event subscriptions, the
//! wire envelope broadcast to receivers, and the append-only delivery audit
//! record. Storage traits keep the delivery engine independent of the
//! backing store.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod envelope;
pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use envelope::{Envelope, EventData};
pub use error::{CoreError, Result};
pub use models::{
    truncate_response, DeliveryId, DeliveryRecord, Endpoint, EndpointId, EndpointUpdate,
    EventKind, NewEndpoint, TRUNCATION_MARKER,
};
pub use storage::{DeliveryLog, EndpointRepository, Storage};
pub use time::{Clock, RealClock, TestClock};
