//! Collaborator ports.
//!
//! These traits are the only boundary between the pipeline stages and the
//! external services they depend on (queues, the state store, and the
//! function-invocation gateway). The harness ships in-process
//! implementations; anything honoring the same contracts can replace them.
//!
//! Object-safety note: traits use `async-trait` for async dyn-dispatch.

use crate::error::AmpResult;
use crate::ids::MessageId;
use crate::record::{QueueRecord, StateRecord};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Append-only, multi-writer send side of a queue.
#[async_trait]
pub trait MessageSink: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, body: String) -> AmpResult<MessageId>;
}

/// What happened to a message handed back after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Redelivery {
    Requeued,
    DeadLettered,
}

/// At-least-once receive side of a queue.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Take up to `max_messages` messages and mark them in flight.
    async fn receive(&self, max_messages: usize) -> AmpResult<Vec<QueueRecord>>;
    /// Delete a successfully handled message.
    async fn ack(&self, message_id: &MessageId) -> AmpResult<()>;
    /// Return a failed message for redelivery under the queue's redrive policy.
    async fn release(&self, message_id: &MessageId) -> AmpResult<Redelivery>;
}

/// Durable store accepting blind inserts with TTL expiry.
#[async_trait]
pub trait StateStorePort: Send + Sync {
    async fn put(&self, record: StateRecord) -> AmpResult<()>;
    /// Unexpired records written under `pk`, in write order.
    async fn records_for(&self, pk: &str, now: i64) -> AmpResult<Vec<StateRecord>>;
    /// Every unexpired record, in write order.
    async fn scan(&self, now: i64) -> AmpResult<Vec<StateRecord>>;
    /// Drop expired rows and report how many were removed.
    async fn purge_expired(&self, now: i64) -> AmpResult<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    Allow,
    Quarantine,
}

impl GateDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Quarantine => "quarantine",
        }
    }
}

impl fmt::Display for GateDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inline response of one risk gate invocation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateOutcome {
    pub decision: GateDecision,
    pub risk_score: f64,
}

/// Synchronous request/response function invocation.
#[async_trait]
pub trait InvocationGateway: Send + Sync {
    async fn invoke(&self, function_name: &str, payload: Value) -> AmpResult<GateOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn gate_outcome_wire_form() {
        let outcome = GateOutcome {
            decision: GateDecision::Quarantine,
            risk_score: 0.95,
        };
        let value = serde_json::to_value(outcome).unwrap();
        assert_eq!(value, json!({"decision": "quarantine", "riskScore": 0.95}));
    }
}
