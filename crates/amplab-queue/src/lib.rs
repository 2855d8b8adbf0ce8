use std::collections::VecDeque;
use std::sync::Arc;

use amplab_protocol::{
    AmpError, AmpResult, MessageId, MessageSink, MessageSource, QueueRecord, Redelivery,
};
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: MessageId,
    body: String,
    receive_count: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<StoredMessage>,
    in_flight: IndexMap<MessageId, StoredMessage>,
    sent_total: u64,
    dead_lettered_total: u64,
}

#[derive(Debug, Clone)]
struct RedrivePolicy {
    max_receive_count: u32,
    dead_letter: Arc<InMemoryQueue>,
}

/// Point-in-time counters for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: usize,
    pub sent_total: u64,
    pub dead_lettered_total: u64,
}

/// In-process queue with at-least-once delivery.
///
/// Received messages stay in flight until acked or released. A released
/// message goes back to the pending list, or to the dead-letter queue once it
/// has been delivered `max_receive_count` times. No ordering is promised to
/// consumers.
#[derive(Debug)]
pub struct InMemoryQueue {
    name: String,
    max_depth: Option<usize>,
    redrive: Option<RedrivePolicy>,
    state: Mutex<QueueState>,
}

impl InMemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_depth: None,
            redrive: None,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Reject sends once `max_depth` messages are pending.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = Some(max_depth);
        self
    }

    pub fn with_redrive(mut self, max_receive_count: u32, dead_letter: Arc<InMemoryQueue>) -> Self {
        self.redrive = Some(RedrivePolicy {
            max_receive_count: max_receive_count.max(1),
            dead_letter,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Nothing pending and nothing awaiting ack.
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.pending.is_empty() && state.in_flight.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            pending: state.pending.len(),
            in_flight: state.in_flight.len(),
            sent_total: state.sent_total,
            dead_lettered_total: state.dead_lettered_total,
        }
    }

    /// Bodies of the pending messages, oldest first, without consuming them.
    pub fn snapshot(&self) -> Vec<String> {
        self.state
            .lock()
            .pending
            .iter()
            .map(|message| message.body.clone())
            .collect()
    }

    /// Remove and return every pending body, oldest first.
    pub fn drain_all(&self) -> Vec<String> {
        self.state
            .lock()
            .pending
            .drain(..)
            .map(|message| message.body)
            .collect()
    }

    fn enqueue(&self, body: String) -> AmpResult<MessageId> {
        let mut state = self.state.lock();
        if let Some(max_depth) = self.max_depth
            && state.pending.len() >= max_depth
        {
            return Err(AmpError::DownstreamSend {
                queue: self.name.clone(),
                reason: format!("queue is full ({max_depth} pending)"),
            });
        }
        let message_id = MessageId::new_uuid();
        state.pending.push_back(StoredMessage {
            message_id: message_id.clone(),
            body,
            receive_count: 0,
        });
        state.sent_total += 1;
        Ok(message_id)
    }
}

#[async_trait]
impl MessageSink for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, body), fields(queue = %self.name, body_len = body.len()))]
    async fn send(&self, body: String) -> AmpResult<MessageId> {
        let message_id = self.enqueue(body)?;
        debug!(message_id = %message_id, "message enqueued");
        Ok(message_id)
    }
}

#[async_trait]
impl MessageSource for InMemoryQueue {
    async fn receive(&self, max_messages: usize) -> AmpResult<Vec<QueueRecord>> {
        let mut state = self.state.lock();
        let take = max_messages.min(state.pending.len());
        let mut records = Vec::with_capacity(take);
        for _ in 0..take {
            let Some(mut message) = state.pending.pop_front() else {
                break;
            };
            message.receive_count += 1;
            records.push(QueueRecord::new(
                message.message_id.clone(),
                message.body.clone(),
                message.receive_count,
            ));
            state.in_flight.insert(message.message_id.clone(), message);
        }
        Ok(records)
    }

    async fn ack(&self, message_id: &MessageId) -> AmpResult<()> {
        if self.state.lock().in_flight.shift_remove(message_id).is_none() {
            warn!(queue = %self.name, message_id = %message_id, "ack for message not in flight");
        }
        Ok(())
    }

    #[instrument(skip(self), fields(queue = %self.name, message_id = %message_id))]
    async fn release(&self, message_id: &MessageId) -> AmpResult<Redelivery> {
        let mut state = self.state.lock();
        let message = state.in_flight.shift_remove(message_id).ok_or_else(|| {
            AmpError::DownstreamSend {
                queue: self.name.clone(),
                reason: format!("message {message_id} is not in flight"),
            }
        })?;

        let policy = match &self.redrive {
            Some(policy) if message.receive_count >= policy.max_receive_count => policy,
            _ => {
                state.pending.push_back(message);
                return Ok(Redelivery::Requeued);
            }
        };

        // On a failed dead-letter send the message stays in flight here.
        if let Err(error) = policy.dead_letter.enqueue(message.body.clone()) {
            state.in_flight.insert(message.message_id.clone(), message);
            return Err(error);
        }
        state.dead_lettered_total += 1;
        drop(state);

        warn!(
            receive_count = message.receive_count,
            dead_letter = %policy.dead_letter.name(),
            "message moved to dead-letter queue"
        );
        Ok(Redelivery::DeadLettered)
    }
}
