//! Domain models and strongly-typed identifiers.
//!
//! Defines registered webhook endpoints with their event subscriptions, the
//! closed set of event kinds broadcast by the helpdesk, and the immutable
//! per-attempt delivery record. Includes the database mappings used by the
//! PostgreSQL repositories.

use std::{collections::BTreeSet, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use url::Url;
use uuid::Uuid;

use crate::error::{CoreError, Result};

type PgDb = sqlx::Postgres;
type PgRow = sqlx::postgres::PgRow;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    std::result::Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Marker appended to response bodies cut at the storage cap.
pub const TRUNCATION_MARKER: &str = "... (truncated)";

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| CoreError::InvalidInput(format!("invalid id '{s}': {e}")))
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <Uuid as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
                let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
                Ok(Self(uuid))
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

uuid_id! {
    /// Strongly-typed webhook endpoint identifier.
    ///
    /// Sent to receivers verbatim in the `X-Webhook-ID` header.
    EndpointId
}

uuid_id! {
    /// Identifier of a single delivery audit record.
    DeliveryId
}

/// Helpdesk domain events that can be broadcast to endpoints.
///
/// Wire names are fixed; receivers match on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "ticket.created")]
    #[allow(missing_docs)]
    TicketCreated,
    #[serde(rename = "ticket.updated")]
    #[allow(missing_docs)]
    TicketUpdated,
    #[serde(rename = "ticket.status_changed")]
    #[allow(missing_docs)]
    TicketStatusChanged,
    #[serde(rename = "ticket.closed")]
    #[allow(missing_docs)]
    TicketClosed,
    #[serde(rename = "ticket.assigned")]
    #[allow(missing_docs)]
    TicketAssigned,
    #[serde(rename = "message.created")]
    #[allow(missing_docs)]
    MessageCreated,
    #[serde(rename = "client.created")]
    #[allow(missing_docs)]
    ClientCreated,
    #[serde(rename = "client.updated")]
    #[allow(missing_docs)]
    ClientUpdated,
    #[serde(rename = "user.created")]
    #[allow(missing_docs)]
    UserCreated,
    #[serde(rename = "user.updated")]
    #[allow(missing_docs)]
    UserUpdated,
    /// Synthetic connectivity check sent by the administrative test trigger.
    #[serde(rename = "webhook.test")]
    WebhookTest,
}

impl EventKind {
    /// Domain events an endpoint can subscribe to individually.
    pub const ALL: [EventKind; 10] = [
        Self::TicketCreated,
        Self::TicketUpdated,
        Self::TicketStatusChanged,
        Self::TicketClosed,
        Self::TicketAssigned,
        Self::MessageCreated,
        Self::ClientCreated,
        Self::ClientUpdated,
        Self::UserCreated,
        Self::UserUpdated,
    ];

    /// Wire name of the event.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TicketCreated => "ticket.created",
            Self::TicketUpdated => "ticket.updated",
            Self::TicketStatusChanged => "ticket.status_changed",
            Self::TicketClosed => "ticket.closed",
            Self::TicketAssigned => "ticket.assigned",
            Self::MessageCreated => "message.created",
            Self::ClientCreated => "client.created",
            Self::ClientUpdated => "client.updated",
            Self::UserCreated => "user.created",
            Self::UserUpdated => "user.updated",
            Self::WebhookTest => "webhook.test",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .chain(std::iter::once(Self::WebhookTest))
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| CoreError::InvalidInput(format!("unknown event kind: {s}")))
    }
}

impl sqlx::Type<PgDb> for EventKind {
    fn type_info() -> PgTypeInfo {
        <String as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EventKind {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(s.parse()?)
    }
}

impl sqlx::Encode<'_, PgDb> for EventKind {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// A registered webhook subscription.
///
/// Read-only from the delivery engine's point of view; only the
/// administrative surface creates or mutates endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Unique identifier.
    pub id: EndpointId,
    /// Human-readable label.
    pub name: String,
    /// Destination URL. Treated as an untrusted external address.
    pub url: String,
    /// Shared secret for HMAC signing. `None` or empty disables signing.
    pub secret: Option<String>,
    /// Disabled endpoints are never dispatched to.
    pub enabled: bool,
    /// Wildcard subscription matching every event.
    #[serde(rename = "event_all")]
    pub subscribe_all: bool,
    /// Individually subscribed event kinds.
    pub events: BTreeSet<EventKind>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl Endpoint {
    /// Creates an enabled endpoint with no subscriptions and no secret.
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: EndpointId::new(),
            name: name.into(),
            url: url.into(),
            secret: None,
            enabled: true,
            subscribe_all: false,
            events: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the signing secret.
    #[must_use]
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Adds individual event subscriptions.
    #[must_use]
    pub fn with_events(mut self, events: impl IntoIterator<Item = EventKind>) -> Self {
        self.events.extend(events);
        self
    }

    /// Subscribes to every event.
    #[must_use]
    pub fn subscribed_to_all(mut self) -> Self {
        self.subscribe_all = true;
        self
    }

    /// Marks the endpoint as disabled.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Eligibility: `enabled && (subscribe_all || events contains kind)`.
    pub fn is_subscribed(&self, kind: EventKind) -> bool {
        self.enabled && (self.subscribe_all || self.events.contains(&kind))
    }

    /// Secret to sign with, or `None` when signing must be skipped.
    pub fn signing_secret(&self) -> Option<&str> {
        self.secret.as_deref().filter(|s| !s.is_empty())
    }

    /// Copy used by the manual test trigger: force-enabled and subscribed to
    /// everything. The stored endpoint is not affected.
    pub fn for_test_delivery(&self) -> Self {
        Self { enabled: true, subscribe_all: true, ..self.clone() }
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Endpoint {
    fn from_row(row: &'r PgRow) -> std::result::Result<Self, sqlx::Error> {
        let names: Vec<String> = row.try_get("events")?;
        let events = names
            .iter()
            .map(|name| name.parse::<EventKind>())
            .collect::<Result<BTreeSet<_>>>()
            .map_err(|e| sqlx::Error::ColumnDecode {
                index: "events".to_string(),
                source: Box::new(e),
            })?;

        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            url: row.try_get("url")?,
            secret: row.try_get("secret")?,
            enabled: row.try_get("enabled")?,
            subscribe_all: row.try_get("event_all")?,
            events,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

fn validate_url(url: &str) -> Result<()> {
    let parsed = Url::parse(url)
        .map_err(|e| CoreError::InvalidInput(format!("invalid url '{url}': {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {},
        scheme => {
            return Err(CoreError::InvalidInput(format!("unsupported url scheme: {scheme}")));
        },
    }

    match parsed.host_str() {
        Some(host) if !host.is_empty() => Ok(()),
        _ => Err(CoreError::InvalidInput(format!("url must have a host: {url}"))),
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(CoreError::InvalidInput("name must not be empty".to_string()));
    }
    Ok(())
}

fn default_enabled() -> bool {
    true
}

/// Input for registering a new endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEndpoint {
    /// Human-readable label.
    pub name: String,
    /// Destination URL.
    pub url: String,
    /// Optional signing secret.
    #[serde(default)]
    pub secret: Option<String>,
    /// Whether the endpoint starts enabled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Wildcard subscription.
    #[serde(default)]
    pub event_all: bool,
    /// Individual subscriptions.
    #[serde(default)]
    pub events: Vec<EventKind>,
}

impl NewEndpoint {
    /// Rejects empty names and non-http(s) URLs.
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        validate_url(&self.url)
    }

    /// Validates and materializes the endpoint with a fresh id.
    pub fn into_endpoint(self, now: DateTime<Utc>) -> Result<Endpoint> {
        self.validate()?;
        Ok(Endpoint {
            id: EndpointId::new(),
            name: self.name,
            url: self.url,
            secret: self.secret.filter(|s| !s.is_empty()),
            enabled: self.enabled,
            subscribe_all: self.event_all,
            events: self.events.into_iter().collect(),
            created_at: now,
            updated_at: now,
        })
    }
}

/// Partial update of an endpoint. `None` leaves a field untouched.
///
/// An empty `secret` clears the stored secret and disables signing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointUpdate {
    #[serde(default)]
    #[allow(missing_docs)]
    pub name: Option<String>,
    #[serde(default)]
    #[allow(missing_docs)]
    pub url: Option<String>,
    #[serde(default)]
    #[allow(missing_docs)]
    pub secret: Option<String>,
    #[serde(default)]
    #[allow(missing_docs)]
    pub enabled: Option<bool>,
    #[serde(default)]
    #[allow(missing_docs)]
    pub event_all: Option<bool>,
    #[serde(default)]
    #[allow(missing_docs)]
    pub events: Option<Vec<EventKind>>,
}

impl EndpointUpdate {
    /// Validates the fields that are present.
    pub fn validate(&self) -> Result<()> {
        if let Some(name) = &self.name {
            validate_name(name)?;
        }
        if let Some(url) = &self.url {
            validate_url(url)?;
        }
        Ok(())
    }

    /// Applies the update in place.
    pub fn apply(self, endpoint: &mut Endpoint, now: DateTime<Utc>) -> Result<()> {
        self.validate()?;
        if let Some(name) = self.name {
            endpoint.name = name;
        }
        if let Some(url) = self.url {
            endpoint.url = url;
        }
        if let Some(secret) = self.secret {
            endpoint.secret = Some(secret).filter(|s| !s.is_empty());
        }
        if let Some(enabled) = self.enabled {
            endpoint.enabled = enabled;
        }
        if let Some(all) = self.event_all {
            endpoint.subscribe_all = all;
        }
        if let Some(events) = self.events {
            endpoint.events = events.into_iter().collect();
        }
        endpoint.updated_at = now;
        Ok(())
    }
}

/// Immutable audit entry for one physical HTTP attempt.
///
/// A retried delivery produces one record per attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    /// Record identifier.
    pub id: DeliveryId,
    /// Endpoint the attempt targeted.
    pub endpoint_id: EndpointId,
    /// Event kind delivered.
    pub event: EventKind,
    /// 1-based attempt number within a delivery.
    pub attempt: u32,
    /// True when the receiver answered with a 2xx status.
    pub success: bool,
    /// URL the request was sent to.
    pub request_url: String,
    /// Exact request body sent.
    pub request_body: String,
    /// Request headers serialized as a JSON object.
    pub request_headers: String,
    /// Response status, 0 when no response was obtained.
    pub status_code: u16,
    /// Truncated response body, or the error message without a response.
    pub response: String,
    /// Wall-clock duration of the attempt.
    pub duration_ms: u64,
    /// When the attempt was recorded.
    pub created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for DeliveryRecord {
    fn from_row(row: &'r PgRow) -> std::result::Result<Self, sqlx::Error> {
        let attempt: i32 = row.try_get("attempt")?;
        let status_code: i32 = row.try_get("status_code")?;
        let duration_ms: i64 = row.try_get("duration_ms")?;

        Ok(Self {
            id: row.try_get("id")?,
            endpoint_id: row.try_get("endpoint_id")?,
            event: row.try_get("event")?,
            attempt: u32::try_from(attempt).unwrap_or(0),
            success: row.try_get("success")?,
            request_url: row.try_get("request_url")?,
            request_body: row.try_get("request_body")?,
            request_headers: row.try_get("request_headers")?,
            status_code: u16::try_from(status_code).unwrap_or(0),
            response: row.try_get("response")?,
            duration_ms: u64::try_from(duration_ms).unwrap_or(0),
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Caps `body` at `limit` characters, appending [`TRUNCATION_MARKER`] when
/// anything was cut. Bodies at or under the cap are returned verbatim.
pub fn truncate_response(body: &str, limit: usize) -> String {
    match body.char_indices().nth(limit) {
        Some((cut, _)) => {
            let mut truncated = String::with_capacity(cut + TRUNCATION_MARKER.len());
            truncated.push_str(&body[..cut]);
            truncated.push_str(TRUNCATION_MARKER);
            truncated
        },
        None => body.to_string(),
    }
}
