//! Canonical event model.
//!
//! Events travel on the queues as loosely-typed JSON objects. Every stage
//! normalizes an inbound record into a fully populated [`Event`] at the
//! boundary, so handlers never deal with missing fields.
//!
//! Wire keys are camelCase (`eventId`, `hopCount`, ...); normalization also
//! accepts the snake_case spellings. Top-level keys the model does not know
//! are kept in [`Event::extra`] and written back out unchanged.

use crate::error::{AmpError, AmpResult};
use crate::ids::{CorrelationId, EventId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;
use std::str::FromStr;

/// Upper bound on the number of children a FANOUT event may spawn.
pub const MAX_FANOUT_DEGREE: u32 = 50;

const DEFAULT_PRODUCER: &str = "unknown";
const DEFAULT_SCHEMA_VERSION: &str = "1.0";

/// Drives the processor's amplification behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    #[default]
    Normal,
    Poison,
    Fanout,
    Loop,
    Slow,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Poison => "POISON",
            Self::Fanout => "FANOUT",
            Self::Loop => "LOOP",
            Self::Slow => "SLOW",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = AmpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NORMAL" => Ok(Self::Normal),
            "POISON" => Ok(Self::Poison),
            "FANOUT" => Ok(Self::Fanout),
            "LOOP" => Ok(Self::Loop),
            "SLOW" => Ok(Self::Slow),
            other => Err(AmpError::MalformedEvent(format!(
                "unknown event type: {other}"
            ))),
        }
    }
}

/// A fully normalized unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_id: EventId,
    pub event_type: EventType,
    pub producer_id: String,
    pub schema_version: String,
    pub correlation_id: CorrelationId,
    /// Opaque body. Measured, never interpreted.
    pub payload: Value,
    pub payload_size_bytes: u64,
    pub hop_count: u32,
    pub fanout_degree: u32,
    /// Seconds since UNIX epoch.
    pub timestamp: i64,
    /// Lineage link. Children also carry it as `payload.parentEventId`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_event_id: Option<EventId>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strictness {
    Strict,
    Lenient,
}

/// Current time in seconds since UNIX epoch.
pub fn epoch_seconds() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Length in bytes of the compact JSON serialization of `payload`.
pub fn payload_size_bytes(payload: &Value) -> u64 {
    serde_json::to_vec(payload).map_or(0, |bytes| bytes.len() as u64)
}

impl Event {
    /// Normalize a loosely-typed record, failing on anything that cannot be
    /// repaired by defaulting (non-object records, unknown event types,
    /// non-numeric counters).
    pub fn normalize(record: &Value) -> AmpResult<Self> {
        Self::normalize_at(record, epoch_seconds())
    }

    /// Same as [`Event::normalize`] with an explicit clock.
    pub fn normalize_at(record: &Value, now: i64) -> AmpResult<Self> {
        Self::normalize_with(record, now, Strictness::Strict)
    }

    /// Normalize without ever rejecting input: non-object records are read as
    /// `{}`, unknown event types become NORMAL, unparsable counters take their
    /// defaults.
    pub fn normalize_lenient(record: &Value) -> Self {
        Self::normalize_lenient_at(record, epoch_seconds())
    }

    pub fn normalize_lenient_at(record: &Value, now: i64) -> Self {
        Self::normalize_with(record, now, Strictness::Lenient).unwrap_or_else(|_| Self::empty(now))
    }

    fn empty(now: i64) -> Self {
        let payload = json!({});
        Self {
            event_id: EventId::new_uuid(),
            event_type: EventType::Normal,
            producer_id: DEFAULT_PRODUCER.to_owned(),
            schema_version: DEFAULT_SCHEMA_VERSION.to_owned(),
            correlation_id: CorrelationId::for_run_at(now),
            payload_size_bytes: payload_size_bytes(&payload),
            payload,
            hop_count: 0,
            fanout_degree: 0,
            timestamp: now,
            parent_event_id: None,
            extra: Map::new(),
        }
    }

    fn normalize_with(record: &Value, now: i64, strictness: Strictness) -> AmpResult<Self> {
        let mut fields = match record {
            Value::Object(map) => map.clone(),
            _ if strictness == Strictness::Lenient => Map::new(),
            other => {
                return Err(AmpError::MalformedEvent(format!(
                    "expected a JSON object, got {}",
                    value_kind(other)
                )));
            }
        };

        let event_type = match take(&mut fields, &["eventType", "event_type"]) {
            None => EventType::Normal,
            Some(Value::String(raw)) => match raw.parse() {
                Ok(event_type) => event_type,
                Err(_) if strictness == Strictness::Lenient => EventType::Normal,
                Err(error) => return Err(error),
            },
            Some(_) if strictness == Strictness::Lenient => EventType::Normal,
            Some(other) => {
                return Err(AmpError::MalformedEvent(format!(
                    "eventType must be a string, got {}",
                    value_kind(&other)
                )));
            }
        };

        let event_id = text_field(&mut fields, &["eventId", "event_id"], strictness)?
            .filter(|id| !id.is_empty())
            .map(EventId::from_string)
            .unwrap_or_else(EventId::new_uuid);
        let correlation_id = text_field(&mut fields, &["correlationId", "correlation_id"], strictness)?
            .filter(|id| !id.is_empty())
            .map(CorrelationId::from_string)
            .unwrap_or_else(|| CorrelationId::for_run_at(now));
        let producer_id = text_field(&mut fields, &["producerId", "producer_id"], strictness)?
            .unwrap_or_else(|| DEFAULT_PRODUCER.to_owned());
        let schema_version = text_field(&mut fields, &["schemaVersion", "schema_version"], strictness)?
            .unwrap_or_else(|| DEFAULT_SCHEMA_VERSION.to_owned());
        let parent_event_id = text_field(&mut fields, &["parentEventId", "parent_event_id"], strictness)?
            .filter(|id| !id.is_empty())
            .map(EventId::from_string);

        let payload = take(&mut fields, &["payload"]).unwrap_or_else(|| json!({}));
        let payload_size_bytes =
            match int_field(&mut fields, &["payloadSizeBytes", "payload_size_bytes"], strictness)? {
                Some(size) => saturate_u64(size),
                None => payload_size_bytes(&payload),
            };
        let hop_count = int_field(&mut fields, &["hopCount", "hop_count"], strictness)?
            .map_or(0, saturate_u32);
        let fanout_degree = int_field(&mut fields, &["fanoutDegree", "fanout_degree"], strictness)?
            .map_or(0, saturate_u32);
        let timestamp = int_field(&mut fields, &["timestamp"], strictness)?.unwrap_or(now);

        Ok(Self {
            event_id,
            event_type,
            producer_id,
            schema_version,
            correlation_id,
            payload,
            payload_size_bytes,
            hop_count,
            fanout_degree,
            timestamp,
            parent_event_id,
            extra: fields,
        })
    }

    /// Derive a child one hop further down the lineage.
    ///
    /// The child inherits correlation, producer, schema version and fan-out
    /// degree; its id is `{parent_id}-{suffix}`.
    pub fn child(&self, event_type: EventType, suffix: &str, now: i64) -> Self {
        let payload = json!({
            "parentEventId": self.event_id.as_str(),
            "suffix": suffix,
        });
        Self {
            event_id: EventId::from_string(format!("{}-{suffix}", self.event_id)),
            event_type,
            producer_id: self.producer_id.clone(),
            schema_version: self.schema_version.clone(),
            correlation_id: self.correlation_id.clone(),
            payload_size_bytes: payload_size_bytes(&payload),
            payload,
            hop_count: self.hop_count.saturating_add(1),
            fanout_degree: self.fanout_degree,
            timestamp: now,
            parent_event_id: Some(self.event_id.clone()),
            extra: Map::new(),
        }
    }

    /// Composite state-store key, `ev#{correlation_id}#{event_id}`.
    pub fn state_key(&self) -> String {
        format!("ev#{}#{}", self.correlation_id, self.event_id)
    }

    pub fn to_json(&self) -> AmpResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_value(&self) -> AmpResult<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Remove the first non-null value stored under any of `keys`.
fn take(fields: &mut Map<String, Value>, keys: &[&str]) -> Option<Value> {
    let mut found = None;
    for key in keys {
        if let Some(value) = fields.remove(*key)
            && found.is_none()
            && !value.is_null()
        {
            found = Some(value);
        }
    }
    found
}

fn text_field(
    fields: &mut Map<String, Value>,
    keys: &[&str],
    strictness: Strictness,
) -> AmpResult<Option<String>> {
    match take(fields, keys) {
        None => Ok(None),
        Some(Value::String(text)) => Ok(Some(text)),
        Some(Value::Number(number)) => Ok(Some(number.to_string())),
        Some(Value::Bool(flag)) => Ok(Some(flag.to_string())),
        Some(_) if strictness == Strictness::Lenient => Ok(None),
        Some(other) => Err(AmpError::MalformedEvent(format!(
            "{} must be a string, got {}",
            keys[0],
            value_kind(&other)
        ))),
    }
}

fn int_field(
    fields: &mut Map<String, Value>,
    keys: &[&str],
    strictness: Strictness,
) -> AmpResult<Option<i64>> {
    let Some(value) = take(fields, keys) else {
        return Ok(None);
    };
    let parsed = match &value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_u64().map(|n| i64::try_from(n).unwrap_or(i64::MAX)))
            .or_else(|| number.as_f64().map(|n| n.trunc() as i64)),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    };
    match parsed {
        Some(n) => Ok(Some(n)),
        None if strictness == Strictness::Lenient => Ok(None),
        None => Err(AmpError::MalformedEvent(format!(
            "{} must be an integer, got {}",
            keys[0],
            value_kind(&value)
        ))),
    }
}

fn saturate_u32(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

fn saturate_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
