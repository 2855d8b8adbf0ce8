use std::sync::Arc;
use std::time::Duration;

use amplab_protocol::{
    AmpError, AmpResult, Event, EventId, EventType, HarnessConfig, MAX_FANOUT_DEGREE, MessageId,
    MessageSink, Outcome, QueueRecord, StateRecord, StateStorePort, epoch_seconds,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

/// Upper bound on the SLOW delay regardless of configuration.
pub const MAX_SLOW_DELAY: Duration = Duration::from_millis(500);
const SEND_BACKOFF_STEP: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub max_hops: u32,
    pub slow_delay: Duration,
    pub send_attempts: u32,
}

impl ProcessorConfig {
    pub fn new(max_hops: u32, slow_delay: Duration, send_attempts: u32) -> Self {
        Self {
            max_hops,
            slow_delay: slow_delay.min(MAX_SLOW_DELAY),
            send_attempts: send_attempts.max(1),
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self::from(&HarnessConfig::default())
    }
}

impl From<&HarnessConfig> for ProcessorConfig {
    fn from(config: &HarnessConfig) -> Self {
        Self::new(
            config.max_hops,
            Duration::from_millis(config.slow_delay_ms),
            config.send_attempts,
        )
    }
}

/// What one successfully handled delivery did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordOutcome {
    pub event_id: EventId,
    pub event_type: EventType,
    pub receive_count: u32,
    pub children_sent: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemFailure {
    #[serde(rename = "itemIdentifier")]
    pub message_id: MessageId,
    pub error: String,
    #[serde(default)]
    pub induced: bool,
}

/// Partial-batch response: successes are counted, failures listed per message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub processed: usize,
    #[serde(rename = "batchItemFailures")]
    pub failures: Vec<BatchItemFailure>,
    #[serde(skip)]
    pub outcomes: Vec<RecordOutcome>,
}

impl BatchResult {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed_ids(&self) -> impl Iterator<Item = &MessageId> {
        self.failures.iter().map(|failure| &failure.message_id)
    }
}

#[derive(Clone)]
pub struct Processor {
    config: ProcessorConfig,
    main: Arc<dyn MessageSink>,
    store: Arc<dyn StateStorePort>,
}

impl Processor {
    pub fn new(
        config: ProcessorConfig,
        main: Arc<dyn MessageSink>,
        store: Arc<dyn StateStorePort>,
    ) -> Self {
        Self {
            config,
            main,
            store,
        }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub async fn handle_record(&self, record: &QueueRecord) -> AmpResult<RecordOutcome> {
        self.handle_record_at(record, epoch_seconds()).await
    }

    #[instrument(
        skip(self, record),
        fields(message_id = %record.message_id, receive_count = record.receive_count())
    )]
    pub async fn handle_record_at(&self, record: &QueueRecord, now: i64) -> AmpResult<RecordOutcome> {
        let raw: Value = serde_json::from_str(&record.body).map_err(|error| {
            AmpError::MalformedEvent(format!(
                "message {} body is not JSON: {error}",
                record.message_id
            ))
        })?;
        let event = Event::normalize_at(&raw, now)?;
        let receive_count = record.receive_count();

        let children_sent = match event.event_type {
            EventType::Poison => {
                self.store
                    .put(StateRecord::new(&event, receive_count, Outcome::FailPoison, now))
                    .await?;
                warn!(event_id = %event.event_id, receive_count, "poison event failed");
                return Err(AmpError::InducedPoison {
                    event_id: event.event_id.to_string(),
                });
            }
            EventType::Slow => {
                tokio::time::sleep(self.config.slow_delay).await;
                0
            }
            EventType::Fanout => {
                let degree = event.fanout_degree.min(MAX_FANOUT_DEGREE);
                for index in 0..degree {
                    let child = event.child(EventType::Normal, &format!("fanout{index}"), now);
                    self.send_child(&child).await?;
                }
                degree
            }
            EventType::Loop if event.hop_count < self.config.max_hops => {
                let child = event.child(EventType::Loop, "loop", now);
                self.send_child(&child).await?;
                1
            }
            EventType::Loop => {
                debug!(event_id = %event.event_id, hop_count = event.hop_count, "loop reached max hops");
                0
            }
            EventType::Normal => 0,
        };

        self.store
            .put(StateRecord::new(&event, receive_count, Outcome::Success, now))
            .await?;
        debug!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            children_sent,
            "event processed"
        );

        Ok(RecordOutcome {
            event_id: event.event_id,
            event_type: event.event_type,
            receive_count,
            children_sent,
        })
    }

    /// Handle every record independently and report failures per message.
    #[instrument(skip(self, records), fields(batch_size = records.len()))]
    pub async fn handle_batch(&self, records: &[QueueRecord]) -> BatchResult {
        let mut result = BatchResult::default();
        for record in records {
            match self.handle_record(record).await {
                Ok(outcome) => {
                    result.processed += 1;
                    result.outcomes.push(outcome);
                }
                Err(error) => {
                    if !error.is_induced() {
                        warn!(message_id = %record.message_id, error = %error, "record failed");
                    }
                    result.failures.push(BatchItemFailure {
                        message_id: record.message_id.clone(),
                        error: error.to_string(),
                        induced: error.is_induced(),
                    });
                }
            }
        }
        info!(
            processed = result.processed,
            failed = result.failures.len(),
            "batch handled"
        );
        result
    }

    async fn send_child(&self, child: &Event) -> AmpResult<()> {
        let body = child.to_json()?;
        let mut attempt = 1;
        loop {
            match self.main.send(body.clone()).await {
                Ok(_) => return Ok(()),
                Err(error) if attempt < self.config.send_attempts => {
                    warn!(
                        event_id = %child.event_id,
                        attempt,
                        error = %error,
                        "child send failed, retrying"
                    );
                    tokio::time::sleep(SEND_BACKOFF_STEP * attempt).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
