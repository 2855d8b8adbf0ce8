//! Synthetic event generator.
//!
//! Each invocation seeds one `StdRng` from the configured seed, so the same
//! seed, profile and count always yield the same sequence of event types,
//! fan-out degrees and payload sizes. Event ids are fresh UUIDs: runs may
//! share a run id, events never share an event id.

use std::fmt;
use std::sync::Arc;

use amplab_protocol::{
    AmpResult, CorrelationId, Event, EventId, EventType, GateDecision, HarnessConfig,
    InvocationGateway, MessageSink, PipelineMode, epoch_seconds, payload_size_bytes,
};
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{Map, json};
use tracing::{debug, info, instrument, warn};

pub const PRODUCER_ID: &str = "lab-generator";
pub const SCHEMA_VERSION: &str = "1.0";
pub const FANOUT_DEGREES: [u32; 4] = [5, 10, 20, 30];
pub const FILLER_LENGTHS: [usize; 3] = [50, 200, 1000];

/// Event type distribution of a generated batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Profile {
    Normal,
    Poison,
    Fanout,
    Loop,
    /// NORMAL 75%, POISON 10%, FANOUT 10%, LOOP 5%.
    #[default]
    Mixed,
}

impl Profile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Poison => "poison",
            Self::Fanout => "fanout",
            Self::Loop => "loop",
            Self::Mixed => "mixed",
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognized names fall back to `mixed`. Responses echo the resolved
/// profile, so a request for `"chaos"` reports `mixed`.
impl From<&str> for Profile {
    fn from(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "normal" => Self::Normal,
            "poison" => Self::Poison,
            "fanout" => Self::Fanout,
            "loop" => Self::Loop,
            _ => Self::Mixed,
        }
    }
}

impl From<String> for Profile {
    fn from(name: String) -> Self {
        Self::from(name.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    #[serde(default = "default_count")]
    pub count: usize,
    #[serde(default)]
    pub profile: Profile,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

fn default_count() -> usize {
    100
}

impl Default for GenerateRequest {
    fn default() -> Self {
        Self {
            count: default_count(),
            profile: Profile::default(),
            run_id: None,
        }
    }
}

fn is_zero(value: &usize) -> bool {
    *value == 0
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    pub sent: usize,
    pub mode: PipelineMode,
    /// Profile actually used, after unknown names resolved to `mixed`.
    pub profile: Profile,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub allowed: usize,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub quarantined: usize,
}

/// Deterministic source of synthetic events.
#[derive(Debug, Clone)]
pub struct EventSynthesizer {
    rng: StdRng,
}

impl EventSynthesizer {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn choose_type(&mut self, profile: Profile) -> EventType {
        match profile {
            Profile::Normal => EventType::Normal,
            Profile::Poison => EventType::Poison,
            Profile::Fanout => EventType::Fanout,
            Profile::Loop => EventType::Loop,
            Profile::Mixed => {
                let roll: f64 = self.rng.random();
                if roll < 0.75 {
                    EventType::Normal
                } else if roll < 0.85 {
                    EventType::Poison
                } else if roll < 0.95 {
                    EventType::Fanout
                } else {
                    EventType::Loop
                }
            }
        }
    }

    /// Build the `index`-th event of a run. Draw order: type, fan-out
    /// degree (FANOUT only), filler length.
    pub fn next_event(
        &mut self,
        profile: Profile,
        index: usize,
        run_id: &CorrelationId,
        now: i64,
    ) -> Event {
        let event_type = self.choose_type(profile);
        let fanout_degree = if event_type == EventType::Fanout {
            FANOUT_DEGREES.choose(&mut self.rng).copied().unwrap_or(0)
        } else {
            0
        };
        let filler = FILLER_LENGTHS.choose(&mut self.rng).copied().unwrap_or(0);
        let payload = json!({
            "i": index,
            "kind": event_type.as_str(),
            "data": "x".repeat(filler),
        });

        Event {
            event_id: EventId::new_uuid(),
            event_type,
            producer_id: PRODUCER_ID.to_owned(),
            schema_version: SCHEMA_VERSION.to_owned(),
            correlation_id: run_id.clone(),
            payload_size_bytes: payload_size_bytes(&payload),
            payload,
            hop_count: 0,
            fanout_degree,
            timestamp: now,
            parent_event_id: None,
            extra: Map::new(),
        }
    }
}

/// Synthesize a whole batch without routing it anywhere.
pub fn synthesize(
    seed: u64,
    profile: Profile,
    count: usize,
    run_id: &CorrelationId,
    now: i64,
) -> Vec<Event> {
    let mut synthesizer = EventSynthesizer::new(seed);
    (0..count)
        .map(|index| synthesizer.next_event(profile, index, run_id, now))
        .collect()
}

#[derive(Clone)]
pub struct Generator {
    mode: PipelineMode,
    seed: u64,
    gate_fn: Option<String>,
    main: Arc<dyn MessageSink>,
    gateway: Option<Arc<dyn InvocationGateway>>,
}

impl Generator {
    pub fn new(
        config: &HarnessConfig,
        main: Arc<dyn MessageSink>,
        gateway: Option<Arc<dyn InvocationGateway>>,
    ) -> Self {
        Self {
            mode: config.mode,
            seed: config.seed,
            gate_fn: config.guarded_gate_fn().map(str::to_owned),
            main,
            gateway,
        }
    }

    fn gate_route(&self) -> Option<(&str, &Arc<dyn InvocationGateway>)> {
        match (self.gate_fn.as_deref(), self.gateway.as_ref()) {
            (Some(name), Some(gateway)) => Some((name, gateway)),
            _ => None,
        }
    }

    pub async fn handle(&self, request: GenerateRequest) -> AmpResult<GenerateResponse> {
        self.handle_at(request, epoch_seconds()).await
    }

    #[instrument(
        skip(self, request),
        fields(mode = %self.mode, profile = %request.profile, count = request.count)
    )]
    pub async fn handle_at(&self, request: GenerateRequest, now: i64) -> AmpResult<GenerateResponse> {
        let run_id = request
            .run_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .map(CorrelationId::from_string)
            .unwrap_or_else(|| CorrelationId::for_run_at(now));

        let route = self.gate_route();
        if self.mode == PipelineMode::Guarded && route.is_none() {
            warn!("guarded mode without a risk gate function; sending directly to the main queue");
        }

        let mut synthesizer = EventSynthesizer::new(self.seed);
        let mut response = GenerateResponse {
            sent: 0,
            mode: self.mode,
            profile: request.profile,
            allowed: 0,
            quarantined: 0,
        };

        for index in 0..request.count {
            let event = synthesizer.next_event(request.profile, index, &run_id, now);
            match route {
                Some((function_name, gateway)) => {
                    let outcome = gateway.invoke(function_name, event.to_value()?).await?;
                    match outcome.decision {
                        GateDecision::Allow => response.allowed += 1,
                        GateDecision::Quarantine => response.quarantined += 1,
                    }
                }
                None => {
                    self.main.send(event.to_json()?).await?;
                }
            }
            response.sent += 1;
            debug!(event_id = %event.event_id, event_type = %event.event_type, "event generated");
        }

        info!(
            run_id = %run_id,
            sent = response.sent,
            allowed = response.allowed,
            quarantined = response.quarantined,
            "batch generated"
        );
        Ok(response)
    }
}
