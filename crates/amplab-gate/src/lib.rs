//! Inline risk gate.
//!
//! Scores one event at a time with a fixed additive heuristic and routes it
//! to the main or the quarantine queue. The gate keeps no memory between
//! events and never rejects input: records that cannot be understood are
//! normalized leniently and scored like any other NORMAL event.
//!
//! What goes downstream is the normalized event, not the raw record: keys
//! are rewritten in camelCase, an unknown `eventType` becomes `NORMAL` and
//! unparsable counters take their defaults. Unknown keys pass through
//! untouched.

use std::fmt;
use std::sync::Arc;

use amplab_protocol::{
    AmpResult, Event, EventType, GateDecision, GateOutcome, MessageSink, QueueRecord,
    epoch_seconds,
};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, instrument, warn};

pub const BASE_SCORE: u32 = 5;
pub const AMPLIFYING_TYPE_WEIGHT: u32 = 70;
pub const LARGE_PAYLOAD_WEIGHT: u32 = 20;
pub const WIDE_FANOUT_WEIGHT: u32 = 20;
pub const DEEP_HOPS_WEIGHT: u32 = 10;
pub const MAX_SCORE: u32 = 99;

pub const LARGE_PAYLOAD_BYTES: u64 = 32_000;
pub const WIDE_FANOUT_DEGREE: u32 = 20;
pub const DEEP_HOP_COUNT: u32 = 3;

pub const DEFAULT_THRESHOLD: f64 = 0.80;

/// Risk score held in hundredths so the additive rule stays exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RiskScore(u32);

impl RiskScore {
    pub fn from_hundredths(hundredths: u32) -> Self {
        Self(hundredths.min(MAX_SCORE))
    }

    pub fn hundredths(&self) -> u32 {
        self.0
    }

    pub fn as_f64(&self) -> f64 {
        f64::from(self.0) / 100.0
    }
}

impl fmt::Display for RiskScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.as_f64())
    }
}

/// A condition that contributed to a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFactor {
    /// POISON or LOOP.
    AmplifyingType,
    LargePayload,
    WideFanout,
    DeepHops,
}

impl RiskFactor {
    pub fn weight(&self) -> u32 {
        match self {
            Self::AmplifyingType => AMPLIFYING_TYPE_WEIGHT,
            Self::LargePayload => LARGE_PAYLOAD_WEIGHT,
            Self::WideFanout => WIDE_FANOUT_WEIGHT,
            Self::DeepHops => DEEP_HOPS_WEIGHT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskAssessment {
    pub score: RiskScore,
    pub factors: Vec<RiskFactor>,
}

/// Score an event and report which conditions fired.
pub fn assess(event: &Event) -> RiskAssessment {
    let mut factors = Vec::new();
    if matches!(event.event_type, EventType::Poison | EventType::Loop) {
        factors.push(RiskFactor::AmplifyingType);
    }
    if event.payload_size_bytes > LARGE_PAYLOAD_BYTES {
        factors.push(RiskFactor::LargePayload);
    }
    if event.fanout_degree >= WIDE_FANOUT_DEGREE {
        factors.push(RiskFactor::WideFanout);
    }
    if event.hop_count >= DEEP_HOP_COUNT {
        factors.push(RiskFactor::DeepHops);
    }

    let raw = factors
        .iter()
        .fold(BASE_SCORE, |score, factor| score + factor.weight());
    RiskAssessment {
        score: RiskScore::from_hundredths(raw),
        factors,
    }
}

/// Pure function of `(event_type, payload_size_bytes, fanout_degree, hop_count)`.
pub fn risk_score(event: &Event) -> RiskScore {
    assess(event).score
}

/// The record forwarded downstream: the normalized event plus its score.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutedEvent {
    #[serde(flatten)]
    pub event: Event,
    pub risk_score: f64,
    pub risk_ts: i64,
}

#[derive(Clone)]
pub struct RiskGate {
    threshold: f64,
    main: Arc<dyn MessageSink>,
    quarantine: Arc<dyn MessageSink>,
}

impl RiskGate {
    pub fn new(threshold: f64, main: Arc<dyn MessageSink>, quarantine: Arc<dyn MessageSink>) -> Self {
        Self {
            threshold,
            main,
            quarantine,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn decide(&self, score: RiskScore) -> GateDecision {
        if score.as_f64() >= self.threshold {
            GateDecision::Quarantine
        } else {
            GateDecision::Allow
        }
    }

    pub async fn evaluate(&self, record: Value) -> AmpResult<GateOutcome> {
        self.evaluate_at(record, epoch_seconds()).await
    }

    /// Score one record and forward it to exactly one destination queue.
    #[instrument(skip(self, record), fields(threshold = self.threshold))]
    pub async fn evaluate_at(&self, record: Value, now: i64) -> AmpResult<GateOutcome> {
        let mut event = Event::normalize_lenient_at(&record, now);
        // A previously gated record carries stale scores.
        event.extra.remove("riskScore");
        event.extra.remove("riskTs");

        let assessment = assess(&event);
        let decision = self.decide(assessment.score);
        let risk_score = assessment.score.as_f64();

        let event_id = event.event_id.clone();
        let event_type = event.event_type;
        let routed = RoutedEvent {
            event,
            risk_score,
            risk_ts: now,
        };
        let body = serde_json::to_string(&routed)?;

        let sink = match decision {
            GateDecision::Allow => &self.main,
            GateDecision::Quarantine => &self.quarantine,
        };
        sink.send(body).await?;

        info!(
            event_id = %event_id,
            event_type = %event_type,
            risk_score,
            factors = ?assessment.factors,
            decision = %decision,
            destination = sink.name(),
            "event gated"
        );
        Ok(GateOutcome {
            decision,
            risk_score,
        })
    }

    /// Queue-triggered entry point: gate every delivered record.
    pub async fn evaluate_records(&self, records: &[QueueRecord]) -> AmpResult<Vec<GateOutcome>> {
        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            let body = serde_json::from_str(&record.body).unwrap_or_else(|error| {
                warn!(message_id = %record.message_id, %error, "gating unparsable message body");
                Value::Null
            });
            outcomes.push(self.evaluate(body).await?);
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use amplab_protocol::{Event, GateDecision, MessageSink, MessageSource, QueueRecord, MessageId};
    use amplab_queue::InMemoryQueue;
    use anyhow::Result;
    use serde_json::{Value, json};

    use super::*;

    fn event(record: Value) -> Event {
        Event::normalize_at(&record, 0).expect("valid event")
    }

    fn gate(threshold: f64) -> (RiskGate, Arc<InMemoryQueue>, Arc<InMemoryQueue>) {
        let main = Arc::new(InMemoryQueue::new("main"));
        let quarantine = Arc::new(InMemoryQueue::new("quarantine"));
        let gate = RiskGate::new(threshold, main.clone(), quarantine.clone());
        (gate, main, quarantine)
    }

    #[test]
    fn normal_event_scores_base() {
        let score = risk_score(&event(json!({"eventType": "NORMAL", "payloadSizeBytes": 10})));
        assert_eq!(score.hundredths(), 5);
        assert_eq!(score.to_string(), "0.05");
    }

    #[test]
    fn poison_and_loop_add_amplifying_weight() {
        for kind in ["POISON", "LOOP"] {
            let assessment = assess(&event(json!({"eventType": kind})));
            assert_eq!(assessment.score.hundredths(), 75);
            assert_eq!(assessment.factors, vec![RiskFactor::AmplifyingType]);
        }
        assert_eq!(risk_score(&event(json!({"eventType": "FANOUT"}))).hundredths(), 5);
    }

    #[test]
    fn thresholds_are_inclusive_where_documented() {
        assert_eq!(risk_score(&event(json!({"payloadSizeBytes": 32000}))).hundredths(), 5);
        assert_eq!(risk_score(&event(json!({"payloadSizeBytes": 32001}))).hundredths(), 25);
        assert_eq!(risk_score(&event(json!({"fanoutDegree": 19}))).hundredths(), 5);
        assert_eq!(risk_score(&event(json!({"fanoutDegree": 20}))).hundredths(), 25);
        assert_eq!(risk_score(&event(json!({"hopCount": 2}))).hundredths(), 5);
        assert_eq!(risk_score(&event(json!({"hopCount": 3}))).hundredths(), 15);
    }

    #[test]
    fn score_is_clamped() {
        let assessment = assess(&event(json!({
            "eventType": "LOOP",
            "payloadSizeBytes": 50000,
            "fanoutDegree": 30,
            "hopCount": 4,
        })));
        assert_eq!(assessment.factors.len(), 4);
        assert_eq!(assessment.score.hundredths(), 99);
    }

    #[test]
    fn score_never_decreases_when_a_condition_is_added() {
        let base = json!({"eventType": "NORMAL", "payloadSizeBytes": 0, "fanoutDegree": 0, "hopCount": 0});
        let toggles = [
            ("eventType", json!("POISON")),
            ("payloadSizeBytes", json!(40000)),
            ("fanoutDegree", json!(25)),
            ("hopCount", json!(5)),
        ];
        for mask in 0u32..16 {
            let mut record = base.clone();
            for (bit, (key, value)) in toggles.iter().enumerate() {
                if mask & (1 << bit) != 0 {
                    record[*key] = value.clone();
                }
            }
            let score = risk_score(&event(record.clone()));
            assert!((5..=99).contains(&score.hundredths()));
            for (bit, (key, value)) in toggles.iter().enumerate() {
                if mask & (1 << bit) == 0 {
                    let mut raised = record.clone();
                    raised[*key] = value.clone();
                    assert!(risk_score(&event(raised)) >= score);
                }
            }
        }
    }

    #[tokio::test]
    async fn poison_below_threshold_is_allowed() -> Result<()> {
        let (gate, main, quarantine) = gate(DEFAULT_THRESHOLD);
        let outcome = gate
            .evaluate(json!({
                "eventType": "POISON",
                "payloadSizeBytes": 100,
                "fanoutDegree": 0,
                "hopCount": 0,
            }))
            .await?;

        assert_eq!(outcome.decision, GateDecision::Allow);
        assert!((outcome.risk_score - 0.75).abs() < 1e-9);
        assert_eq!(main.len(), 1);
        assert!(quarantine.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn wide_poison_is_quarantined() -> Result<()> {
        let (gate, main, quarantine) = gate(DEFAULT_THRESHOLD);
        let outcome = gate
            .evaluate(json!({
                "eventType": "POISON",
                "payloadSizeBytes": 100,
                "fanoutDegree": 20,
                "hopCount": 0,
            }))
            .await?;

        assert_eq!(outcome.decision, GateDecision::Quarantine);
        assert!((outcome.risk_score - 0.95).abs() < 1e-9);
        assert!(main.is_empty());
        assert_eq!(quarantine.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn forwarded_record_keeps_original_fields_and_adds_score() -> Result<()> {
        let (gate, main, _quarantine) = gate(DEFAULT_THRESHOLD);
        gate.evaluate_at(
            json!({"eventId": "e-1", "eventType": "NORMAL", "tenant": "lab", "riskScore": 0.9}),
            1_234,
        )
        .await?;

        let batch = main.receive(1).await?;
        let forwarded: Value = serde_json::from_str(&batch[0].body)?;
        assert_eq!(forwarded["eventId"], json!("e-1"));
        assert_eq!(forwarded["tenant"], json!("lab"));
        assert_eq!(forwarded["riskScore"], json!(0.05));
        assert_eq!(forwarded["riskTs"], json!(1_234));
        assert_eq!(forwarded["payloadSizeBytes"], json!(2));
        Ok(())
    }

    #[tokio::test]
    async fn forwarded_record_is_the_normalized_event() -> Result<()> {
        let (gate, main, _quarantine) = gate(DEFAULT_THRESHOLD);
        gate.evaluate_at(
            json!({"event_id": "e-2", "eventType": "EXPLODE", "hop_count": "oops", "fanout_degree": 3}),
            1_234,
        )
        .await?;

        let batch = main.receive(1).await?;
        let forwarded: Value = serde_json::from_str(&batch[0].body)?;
        assert_eq!(forwarded["eventId"], json!("e-2"));
        assert_eq!(forwarded["eventType"], json!("NORMAL"));
        assert_eq!(forwarded["hopCount"], json!(0));
        assert_eq!(forwarded["fanoutDegree"], json!(3));
        assert!(forwarded.get("hop_count").is_none());
        assert!(forwarded.get("event_id").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn malformed_input_is_gated_as_normal() -> Result<()> {
        let (gate, main, quarantine) = gate(DEFAULT_THRESHOLD);
        let outcome = gate.evaluate(json!({"eventType": 17})).await?;
        assert_eq!(outcome.decision, GateDecision::Allow);

        let records = vec![QueueRecord::new(MessageId::from_string("m"), "not json", 1)];
        let outcomes = gate.evaluate_records(&records).await?;
        assert_eq!(outcomes[0].decision, GateDecision::Allow);
        assert_eq!(main.len(), 2);
        assert!(quarantine.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn lower_threshold_quarantines_more() -> Result<()> {
        let (gate, _main, quarantine) = gate(0.5);
        let outcome = gate.evaluate(json!({"eventType": "LOOP"})).await?;
        assert_eq!(outcome.decision, GateDecision::Quarantine);
        assert_eq!(MessageSink::name(&*quarantine), "quarantine");
        assert_eq!(quarantine.len(), 1);
        Ok(())
    }
}
