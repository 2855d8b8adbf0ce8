//! # amplab-protocol: shared contract for the amplification harness
//!
//! This crate defines the event model, state records, error taxonomy, and the
//! trait interfaces through which the pipeline talks to its collaborators
//! (queues, state store, invocation gateway).
//!
//! It carries no runtime dependency (no tokio) so it can be used as a pure
//! contract crate by every stage.
//!
//! ## Module Overview
//!
//! - [`ids`] - Typed ID wrappers (EventId, CorrelationId, MessageId)
//! - [`event`] - Event, EventType, normalization and child derivation
//! - [`record`] - StateRecord, Outcome, QueueRecord
//! - [`config`] - HarnessConfig, PipelineMode
//! - [`ports`] - Collaborator ports (message sink/source, state store, gateway)
//! - [`error`] - AmpError, AmpResult

pub mod config;
pub mod error;
pub mod event;
pub mod ids;
pub mod ports;
pub mod record;

pub use config::{HarnessConfig, PipelineMode};
pub use error::{AmpError, AmpResult};
pub use event::{Event, EventType, MAX_FANOUT_DEGREE, epoch_seconds, payload_size_bytes};
pub use ids::{CorrelationId, EventId, MessageId};
pub use ports::{
    GateDecision, GateOutcome, InvocationGateway, MessageSink, MessageSource, Redelivery,
    StateStorePort,
};
pub use record::{DeliveryAttributes, Outcome, QueueRecord, STATE_TTL_SECS, StateRecord};
