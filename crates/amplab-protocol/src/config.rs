//! Harness configuration.
//!
//! Library code never reads the process environment; the binary resolves
//! environment variables and flags into a [`HarnessConfig`] once at startup
//! and passes it down explicitly.

use crate::error::{AmpError, AmpResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Whether generated events pass through the risk gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineMode {
    /// Generator sends straight to the main queue.
    #[default]
    Baseline,
    /// Generator hands each event to the risk gate and waits for its decision.
    Guarded,
}

impl PipelineMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Baseline => "baseline",
            Self::Guarded => "guarded",
        }
    }
}

impl fmt::Display for PipelineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineMode {
    type Err = AmpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "baseline" => Ok(Self::Baseline),
            "guarded" => Ok(Self::Guarded),
            other => Err(AmpError::Config(format!("unknown mode: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    pub app_name: String,
    pub mode: PipelineMode,
    /// Scores at or above this value are quarantined.
    pub risk_threshold: f64,
    /// LOOP events stop re-emitting once `hop_count` reaches this bound.
    pub max_hops: u32,
    pub seed: u64,
    pub state_table_name: String,
    pub main_queue_url: String,
    pub quarantine_queue_url: String,
    pub dlq_url: String,
    /// Function name of the risk gate behind the invocation gateway.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_gate_fn: Option<String>,
    /// Deliveries before a failing message is moved to the dead-letter queue.
    pub max_receive_count: u32,
    pub slow_delay_ms: u64,
    pub send_attempts: u32,
    pub batch_size: usize,
    pub workers: usize,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            app_name: "event-amplification-risk".to_owned(),
            mode: PipelineMode::Baseline,
            risk_threshold: 0.80,
            max_hops: 4,
            seed: 42,
            state_table_name: "amplab-state".to_owned(),
            main_queue_url: "amplab-main".to_owned(),
            quarantine_queue_url: "amplab-quarantine".to_owned(),
            dlq_url: "amplab-dlq".to_owned(),
            risk_gate_fn: None,
            max_receive_count: 3,
            slow_delay_ms: 200,
            send_attempts: 3,
            batch_size: 10,
            workers: 2,
        }
    }
}

impl HarnessConfig {
    pub fn validate(&self) -> AmpResult<()> {
        if !(0.0..=1.0).contains(&self.risk_threshold) {
            return Err(AmpError::Config(format!(
                "risk threshold must be within [0, 1], got {}",
                self.risk_threshold
            )));
        }
        if self.max_receive_count == 0 {
            return Err(AmpError::Config("max receive count must be at least 1".to_owned()));
        }
        if self.send_attempts == 0 {
            return Err(AmpError::Config("send attempts must be at least 1".to_owned()));
        }
        if self.batch_size == 0 || self.workers == 0 {
            return Err(AmpError::Config(
                "batch size and worker count must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }

    /// Gate function to route through, present only in guarded mode with a
    /// non-empty function name.
    pub fn guarded_gate_fn(&self) -> Option<&str> {
        match (self.mode, self.risk_gate_fn.as_deref()) {
            (PipelineMode::Guarded, Some(name)) if !name.trim().is_empty() => Some(name),
            _ => None,
        }
    }
}
