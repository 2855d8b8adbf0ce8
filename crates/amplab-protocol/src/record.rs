//! Persisted outcome records and queue delivery records.

use crate::event::{Event, EventType};
use crate::ids::{CorrelationId, EventId, MessageId};
use serde::{Deserialize, Serialize};

/// Lifetime of a state record before the store expires it.
pub const STATE_TTL_SECS: i64 = 3600;

/// Result recorded for one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    FailPoison,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::FailPoison => "fail_poison",
        }
    }
}

/// One row per delivery attempt that reached the persistence step.
///
/// Rows are never updated in place: a redelivery writes a second row under
/// the same `pk` with a larger `approx_receive_count`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateRecord {
    pub pk: String,
    /// Expiry, seconds since UNIX epoch.
    pub ttl: i64,
    pub event_type: EventType,
    pub correlation_id: CorrelationId,
    pub event_id: EventId,
    pub payload_size_bytes: u64,
    pub fanout_degree: u32,
    pub hop_count: u32,
    pub approx_receive_count: u32,
    pub outcome: Outcome,
    pub ts: i64,
}

impl StateRecord {
    pub fn new(event: &Event, approx_receive_count: u32, outcome: Outcome, now: i64) -> Self {
        Self {
            pk: event.state_key(),
            ttl: now + STATE_TTL_SECS,
            event_type: event.event_type,
            correlation_id: event.correlation_id.clone(),
            event_id: event.event_id.clone(),
            payload_size_bytes: event.payload_size_bytes,
            fanout_degree: event.fanout_degree,
            hop_count: event.hop_count,
            approx_receive_count: approx_receive_count.max(1),
            outcome,
            ts: now,
        }
    }

    /// True once `now` is past the record's TTL.
    pub fn is_expired(&self, now: i64) -> bool {
        self.ttl < now
    }
}

/// Delivery metadata attached by the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approximate_receive_count: Option<u32>,
}

/// A message as handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueRecord {
    pub message_id: MessageId,
    pub body: String,
    #[serde(default)]
    pub attributes: DeliveryAttributes,
}

impl QueueRecord {
    pub fn new(message_id: MessageId, body: impl Into<String>, receive_count: u32) -> Self {
        Self {
            message_id,
            body: body.into(),
            attributes: DeliveryAttributes {
                approximate_receive_count: Some(receive_count),
            },
        }
    }

    /// Delivery attempt number, 1 when the queue did not report one.
    pub fn receive_count(&self) -> u32 {
        self.attributes.approximate_receive_count.unwrap_or(1).max(1)
    }
}
