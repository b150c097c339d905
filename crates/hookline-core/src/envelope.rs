//! Canonical wire envelope `{event, timestamp, data}`.
//!
//! One envelope is built per broadcast and shared read-only by every
//! per-endpoint delivery task. Its serialized bytes are produced once per
//! attempt and are exactly what gets signed and transmitted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::{
    error::{CoreError, Result},
    models::EventKind,
};

/// Event-specific fields carried in the envelope `data` object.
///
/// Always a JSON object. Unknown or extra fields pass through unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventData(Map<String, Value>);

impl EventData {
    /// Empty data object.
    pub fn new() -> Self {
        Self::default()
    }

    /// Converts any serializable value into event data.
    ///
    /// Fails with [`CoreError::Encoding`] when the value cannot be
    /// represented as JSON (for example a map with non-string keys) or does
    /// not serialize to a JSON object.
    pub fn from_serializable<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Self::try_from(serde_json::to_value(value)?)
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Inserts a field, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    /// Inserts a float, rejecting NaN and infinities.
    pub fn insert_f64(&mut self, key: impl Into<String>, value: f64) -> Result<()> {
        let key = key.into();
        let number = Number::from_f64(value).ok_or_else(|| {
            CoreError::Encoding(format!("field '{key}' is not a finite number: {value}"))
        })?;
        self.0.insert(key, Value::Number(number));
        Ok(())
    }

    /// Looks up a field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Number of top-level fields.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when there are no fields.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrows the underlying map.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Consumes into the underlying map.
    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for EventData {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for EventData {
    type Error = CoreError;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(CoreError::Encoding(format!(
                "event data must be a JSON object, got {}",
                json_type_name(&other)
            ))),
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// The body POSTed to every receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event kind.
    pub event: EventKind,
    /// Build time, RFC 3339 UTC.
    #[serde(with = "rfc3339_seconds")]
    pub timestamp: DateTime<Utc>,
    /// Event-specific fields.
    pub data: EventData,
}

impl Envelope {
    /// Assembles an envelope. Pure apart from the supplied `now`.
    pub fn build(event: EventKind, data: EventData, now: DateTime<Utc>) -> Self {
        Self { event, timestamp: now, data }
    }

    /// Builds an envelope from arbitrary serializable data.
    pub fn from_serializable<T: Serialize + ?Sized>(
        event: EventKind,
        data: &T,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        Ok(Self::build(event, EventData::from_serializable(data)?, now))
    }

    /// Serializes to the canonical JSON body.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(CoreError::from)
    }
}

mod rfc3339_seconds {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
