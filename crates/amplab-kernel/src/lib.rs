use std::collections::HashSet;
use std::ops::AddAssign;
use std::path::PathBuf;
use std::sync::Arc;

use amplab_gate::{RiskAssessment, RiskGate, assess};
use amplab_generator::{GenerateRequest, GenerateResponse, Generator};
use amplab_processor::{Processor, ProcessorConfig};
use amplab_protocol::{
    AmpError, AmpResult, Event, GateDecision, GateOutcome, HarnessConfig, InvocationGateway,
    MessageSource, Redelivery, StateRecord, StateStorePort, epoch_seconds,
};
use amplab_queue::InMemoryQueue;
use amplab_store::{FileStateStore, InMemoryStateStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::future::join_all;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

/// In-process function invocation: function names map to risk gates.
#[derive(Clone, Default)]
pub struct LocalGateway {
    functions: IndexMap<String, Arc<RiskGate>>,
}

impl LocalGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_function(mut self, name: impl Into<String>, gate: Arc<RiskGate>) -> Self {
        self.functions.insert(name.into(), gate);
        self
    }

    pub fn functions(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }
}

#[async_trait]
impl InvocationGateway for LocalGateway {
    async fn invoke(&self, function_name: &str, payload: Value) -> AmpResult<GateOutcome> {
        let gate = self
            .functions
            .get(function_name)
            .ok_or_else(|| AmpError::Gateway(format!("unknown function {function_name}")))?;
        gate.evaluate(payload).await
    }
}

#[derive(Debug, Clone)]
pub struct HarnessBuilder {
    config: HarnessConfig,
    root: Option<PathBuf>,
}

impl HarnessBuilder {
    pub fn new(config: HarnessConfig) -> Self {
        Self { config, root: None }
    }

    /// Persist state records as JSONL under `root` instead of in memory.
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn build(self) -> Result<Harness> {
        let config = self.config;
        config
            .validate()
            .context("invalid harness configuration")?;

        let dead_letter = Arc::new(InMemoryQueue::new(config.dlq_url.as_str()));
        let main = Arc::new(
            InMemoryQueue::new(config.main_queue_url.as_str())
                .with_redrive(config.max_receive_count, dead_letter.clone()),
        );
        let quarantine = Arc::new(InMemoryQueue::new(config.quarantine_queue_url.as_str()));

        let store: Arc<dyn StateStorePort> = match &self.root {
            Some(root) => Arc::new(FileStateStore::new(root, &config.state_table_name)),
            None => Arc::new(InMemoryStateStore::new()),
        };

        let gate = Arc::new(RiskGate::new(
            config.risk_threshold,
            main.clone(),
            quarantine.clone(),
        ));
        let mut gateway = LocalGateway::new();
        if let Some(name) = config.risk_gate_fn.as_deref() {
            gateway = gateway.with_function(name, gate.clone());
        }

        let generator = Generator::new(&config, main.clone(), Some(Arc::new(gateway)));
        let processor = Processor::new(ProcessorConfig::from(&config), main.clone(), store.clone());

        info!(
            app = %config.app_name,
            mode = %config.mode,
            threshold = config.risk_threshold,
            max_hops = config.max_hops,
            workers = config.workers,
            persistent = self.root.is_some(),
            "harness built"
        );

        Ok(Harness {
            config,
            main,
            quarantine,
            dead_letter,
            store,
            gate,
            generator,
            processor,
        })
    }
}

/// Counters from consuming the main queue until it went idle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub batches: usize,
    pub delivered: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

impl AddAssign for DrainReport {
    fn add_assign(&mut self, other: Self) {
        self.batches += other.batches;
        self.delivered += other.delivered;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.dead_lettered += other.dead_lettered;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub generated: GenerateResponse,
    pub drain: DrainReport,
    pub quarantined: usize,
    pub dead_letters: usize,
    pub state_records: usize,
}

#[derive(Clone)]
pub struct Harness {
    config: HarnessConfig,
    main: Arc<InMemoryQueue>,
    quarantine: Arc<InMemoryQueue>,
    dead_letter: Arc<InMemoryQueue>,
    store: Arc<dyn StateStorePort>,
    gate: Arc<RiskGate>,
    generator: Generator,
    processor: Processor,
}

impl Harness {
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn main_queue(&self) -> &Arc<InMemoryQueue> {
        &self.main
    }

    pub fn quarantine_queue(&self) -> &Arc<InMemoryQueue> {
        &self.quarantine
    }

    pub fn dead_letter_queue(&self) -> &Arc<InMemoryQueue> {
        &self.dead_letter
    }

    pub fn store(&self) -> &Arc<dyn StateStorePort> {
        &self.store
    }

    pub fn gate(&self) -> &Arc<RiskGate> {
        &self.gate
    }

    pub fn processor(&self) -> &Processor {
        &self.processor
    }

    #[instrument(skip(self, request), fields(profile = %request.profile, count = request.count))]
    pub async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse> {
        self.generator
            .handle(request)
            .await
            .context("failed generating events")
    }

    /// Score an event without routing it.
    pub fn score(&self, record: &Value) -> (RiskAssessment, GateDecision) {
        let assessment = assess(&Event::normalize_lenient(record));
        let decision = self.gate.decide(assessment.score);
        (assessment, decision)
    }

    /// Consume the main queue with concurrent workers until nothing is
    /// pending or in flight.
    #[instrument(skip(self), fields(workers = self.config.workers, batch_size = self.config.batch_size))]
    pub async fn drain(&self) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        let mut rounds = 0_usize;
        while !self.main.is_idle() {
            rounds += 1;
            let workers = (0..self.config.workers).map(|worker| self.consume(worker));
            for tally in join_all(workers).await {
                report += tally?;
            }
            debug!(rounds, pending = self.main.len(), "drain round finished");
        }
        info!(
            rounds,
            batches = report.batches,
            delivered = report.delivered,
            succeeded = report.succeeded,
            failed = report.failed,
            dead_lettered = report.dead_lettered,
            "main queue drained"
        );
        Ok(report)
    }

    async fn consume(&self, worker: usize) -> Result<DrainReport> {
        let mut tally = DrainReport::default();
        loop {
            let batch = self
                .main
                .receive(self.config.batch_size)
                .await
                .context("failed receiving from main queue")?;
            if batch.is_empty() {
                return Ok(tally);
            }
            tally.batches += 1;
            tally.delivered += batch.len();

            let result = self.processor.handle_batch(&batch).await;
            let failed: HashSet<_> = result.failed_ids().collect();
            for record in &batch {
                if !failed.contains(&record.message_id) {
                    self.main.ack(&record.message_id).await?;
                    tally.succeeded += 1;
                    continue;
                }
                tally.failed += 1;
                let redelivery = self
                    .main
                    .release(&record.message_id)
                    .await
                    .with_context(|| format!("failed releasing message {}", record.message_id))?;
                if redelivery == Redelivery::DeadLettered {
                    warn!(worker, message_id = %record.message_id, "message dead-lettered");
                    tally.dead_lettered += 1;
                }
            }
        }
    }

    /// Generate one batch, then drain it.
    pub async fn run(&self, request: GenerateRequest) -> Result<RunReport> {
        let generated = self.generate(request).await?;
        let drain = self.drain().await?;
        let state_records = self.records().await?.len();
        Ok(RunReport {
            generated,
            drain,
            quarantined: self.quarantine.len(),
            dead_letters: self.dead_letter.len(),
            state_records,
        })
    }

    pub async fn records(&self) -> Result<Vec<StateRecord>> {
        self.store
            .scan(epoch_seconds())
            .await
            .context("failed scanning state records")
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use amplab_generator::{FANOUT_DEGREES, GenerateRequest, Profile};
    use amplab_protocol::{
        EventType, GateDecision, HarnessConfig, InvocationGateway, MessageSink, MessageSource,
        Outcome, PipelineMode,
    };
    use anyhow::Result;
    use serde_json::{Value, json};

    use super::*;

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    fn config() -> HarnessConfig {
        HarnessConfig {
            slow_delay_ms: 0,
            ..HarnessConfig::default()
        }
    }

    fn guarded() -> HarnessConfig {
        HarnessConfig {
            mode: PipelineMode::Guarded,
            risk_gate_fn: Some("risk-gate".to_owned()),
            ..config()
        }
    }

    fn request(profile: Profile, count: usize) -> GenerateRequest {
        GenerateRequest {
            count,
            profile,
            run_id: Some("run-test".to_owned()),
        }
    }

    #[tokio::test]
    async fn fanout_event_produces_degree_children_and_one_success() -> Result<()> {
        let harness = HarnessBuilder::new(config()).build()?;
        harness.generate(request(Profile::Fanout, 1)).await?;

        let parent = harness.main_queue().receive(1).await?;
        let event: Value = serde_json::from_str(&parent[0].body)?;
        let degree = event["fanoutDegree"].as_u64().unwrap_or(0) as u32;
        assert!(FANOUT_DEGREES.contains(&degree));

        let outcome = harness.processor().handle_record(&parent[0]).await?;
        harness.main_queue().ack(&parent[0].message_id).await?;
        assert_eq!(outcome.children_sent, degree);
        assert_eq!(harness.main_queue().len(), degree as usize);

        let records = harness.records().await?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, Outcome::Success);

        let report = harness.drain().await?;
        assert_eq!(report.succeeded, degree as usize);
        assert_eq!(harness.records().await?.len(), degree as usize + 1);
        Ok(())
    }

    #[tokio::test]
    async fn loop_event_stops_one_hop_past_three() -> Result<()> {
        let harness = HarnessBuilder::new(config()).build()?;
        harness
            .main_queue()
            .send(json!({"eventId": "l", "eventType": "LOOP", "hopCount": 3, "correlationId": "run-b"}).to_string())
            .await?;

        let report = harness.drain().await?;
        assert_eq!(report.delivered, 2);
        let mut hops: Vec<u32> = harness.records().await?.iter().map(|r| r.hop_count).collect();
        hops.sort_unstable();
        assert_eq!(hops, vec![3, 4]);
        Ok(())
    }

    #[tokio::test]
    async fn gateway_routes_by_score() -> Result<()> {
        let harness = HarnessBuilder::new(guarded()).build()?;
        let gateway = LocalGateway::new().with_function("risk-gate", harness.gate().clone());

        let allowed = gateway
            .invoke(
                "risk-gate",
                json!({"eventType": "POISON", "payloadSizeBytes": 100, "fanoutDegree": 0, "hopCount": 0}),
            )
            .await?;
        assert_eq!(allowed.decision, GateDecision::Allow);
        assert_eq!(allowed.risk_score, 0.75);

        let quarantined = gateway
            .invoke(
                "risk-gate",
                json!({"eventType": "POISON", "payloadSizeBytes": 100, "fanoutDegree": 20, "hopCount": 0}),
            )
            .await?;
        assert_eq!(quarantined.decision, GateDecision::Quarantine);
        assert_eq!(quarantined.risk_score, 0.95);

        assert_eq!(harness.main_queue().len(), 1);
        assert_eq!(harness.quarantine_queue().len(), 1);

        let unknown = gateway.invoke("missing", json!({})).await.unwrap_err();
        assert!(unknown.to_string().contains("unknown function missing"));
        Ok(())
    }

    #[tokio::test]
    async fn poison_is_dead_lettered_after_max_receive_count() -> Result<()> {
        let harness = HarnessBuilder::new(config()).build()?;
        harness.generate(request(Profile::Poison, 1)).await?;

        let report = harness.drain().await?;
        assert_eq!(report.delivered, 3);
        assert_eq!(report.failed, 3);
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(harness.dead_letter_queue().len(), 1);

        let records = harness.records().await?;
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.outcome == Outcome::FailPoison));
        let mut counts: Vec<u32> = records.iter().map(|r| r.approx_receive_count).collect();
        counts.sort_unstable();
        assert_eq!(counts, vec![1, 2, 3]);
        Ok(())
    }

    #[tokio::test]
    async fn mixed_run_terminates_with_consistent_counts() -> Result<()> {
        let harness = HarnessBuilder::new(config()).build()?;
        let report = harness.run(request(Profile::Mixed, 200)).await?;

        assert_eq!(report.generated.sent, 200);
        assert!(harness.main_queue().is_idle());
        assert_eq!(report.drain.delivered, report.drain.succeeded + report.drain.failed);
        assert_eq!(report.dead_letters, report.drain.dead_lettered);
        assert_eq!(report.state_records, report.drain.delivered);
        assert_eq!(report.quarantined, 0);
        Ok(())
    }

    #[tokio::test]
    async fn guarded_run_quarantines_amplifying_events() -> Result<()> {
        let harness = HarnessBuilder::new(HarnessConfig {
            risk_threshold: 0.70,
            ..guarded()
        })
        .build()?;
        let report = harness.run(request(Profile::Mixed, 200)).await?;

        assert_eq!(
            report.generated.allowed + report.generated.quarantined,
            report.generated.sent
        );
        assert_eq!(report.quarantined, report.generated.quarantined);
        assert!(report.quarantined > 0);
        assert_eq!(report.dead_letters, 0);

        let records = harness.records().await?;
        assert!(records.iter().all(|r| !matches!(r.event_type, EventType::Poison | EventType::Loop)));
        Ok(())
    }

    #[tokio::test]
    async fn file_backed_harness_persists_records() -> Result<()> {
        let root = unique_test_root("amplab-kernel-file");
        let harness = HarnessBuilder::new(config()).root(&root).build()?;
        harness.run(request(Profile::Normal, 5)).await?;

        let path = root.join("state").join("amplab-state.jsonl");
        let raw = tokio::fs::read_to_string(&path).await?;
        assert_eq!(raw.lines().count(), 5);

        let _ = tokio::fs::remove_dir_all(root).await;
        Ok(())
    }

    #[test]
    fn score_reports_decision_without_routing() -> Result<()> {
        let harness = HarnessBuilder::new(config()).build()?;
        let (assessment, decision) = harness.score(&json!({"eventType": "LOOP", "hopCount": 3}));
        assert_eq!(assessment.score.hundredths(), 85);
        assert_eq!(decision, GateDecision::Quarantine);
        assert!(harness.main_queue().is_empty());
        Ok(())
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let built = HarnessBuilder::new(HarnessConfig {
            risk_threshold: 1.5,
            ..config()
        })
        .build();
        assert!(built.is_err());
    }
}
