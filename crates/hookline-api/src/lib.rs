//! Hookline HTTP API.
//!
//! Administrative CRUD over webhook endpoints, the delivery audit log, and
//! the inbound interface through which domain code publishes events.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use hookline_core::{Clock, RealClock, Storage};
use hookline_delivery::Broadcaster;

pub mod config;
pub mod handlers;
pub mod server;

pub use config::{Config, StorageBackend};
pub use server::{create_router, start_server};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Endpoint registry and delivery audit log.
    pub storage: Storage,
    /// Event fan-out.
    pub broadcaster: Broadcaster,
    /// Time source for timestamps.
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Creates state backed by the system clock.
    pub fn new(storage: Storage, broadcaster: Broadcaster) -> Self {
        Self { storage, broadcaster, clock: Arc::new(RealClock::new()) }
    }

    /// Replaces the clock, mainly for deterministic tests.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}
