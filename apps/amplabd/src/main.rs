use std::path::PathBuf;

use amplab_generator::{GenerateRequest, Profile};
use amplab_kernel::HarnessBuilder;
use amplab_protocol::{HarnessConfig, PipelineMode, StateStorePort, epoch_seconds};
use amplab_store::FileStateStore;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "amplabd")]
#[command(about = "Event amplification risk harness")]
struct Cli {
    /// Directory holding the JSONL state table.
    #[arg(long, default_value = ".amplab")]
    root: PathBuf,
    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
    #[command(flatten)]
    pipeline: PipelineArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct PipelineArgs {
    #[arg(long, env = "APP_NAME", default_value = "event-amplification-risk")]
    app_name: String,
    #[arg(long, env = "MODE", default_value = "baseline")]
    mode: PipelineMode,
    #[arg(long, env = "RISK_THRESHOLD", default_value_t = 0.80)]
    risk_threshold: f64,
    #[arg(long, env = "MAX_HOPS", default_value_t = 4)]
    max_hops: u32,
    #[arg(long, env = "SEED", default_value_t = 42)]
    seed: u64,
    #[arg(long, env = "STATE_TABLE_NAME", default_value = "amplab-state")]
    state_table_name: String,
    #[arg(long, env = "MAIN_QUEUE_URL", default_value = "amplab-main")]
    main_queue_url: String,
    #[arg(long, env = "QUARANTINE_QUEUE_URL", default_value = "amplab-quarantine")]
    quarantine_queue_url: String,
    #[arg(long, env = "DLQ_URL", default_value = "amplab-dlq")]
    dlq_url: String,
    #[arg(long, env = "RISK_GATE_FN")]
    risk_gate_fn: Option<String>,
    #[arg(long, env = "MAX_RECEIVE_COUNT", default_value_t = 3)]
    max_receive_count: u32,
    #[arg(long, default_value_t = 200)]
    slow_delay_ms: u64,
    #[arg(long, default_value_t = 2)]
    workers: usize,
    #[arg(long, default_value_t = 10)]
    batch_size: usize,
}

impl PipelineArgs {
    fn config(&self) -> HarnessConfig {
        HarnessConfig {
            app_name: self.app_name.clone(),
            mode: self.mode,
            risk_threshold: self.risk_threshold,
            max_hops: self.max_hops,
            seed: self.seed,
            state_table_name: self.state_table_name.clone(),
            main_queue_url: self.main_queue_url.clone(),
            quarantine_queue_url: self.quarantine_queue_url.clone(),
            dlq_url: self.dlq_url.clone(),
            risk_gate_fn: self.risk_gate_fn.clone(),
            max_receive_count: self.max_receive_count,
            slow_delay_ms: self.slow_delay_ms,
            workers: self.workers,
            batch_size: self.batch_size,
            ..HarnessConfig::default()
        }
    }
}

#[derive(Debug, Args)]
struct BatchArgs {
    #[arg(long, default_value_t = 100)]
    count: usize,
    /// normal, poison, fanout, loop or mixed; anything else means mixed.
    #[arg(long, default_value = "mixed")]
    profile: String,
    #[arg(long)]
    run_id: Option<String>,
}

impl BatchArgs {
    fn request(&self) -> GenerateRequest {
        GenerateRequest {
            count: self.count,
            profile: Profile::from(self.profile.as_str()),
            run_id: self.run_id.clone(),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate a batch and report where it was routed.
    Generate(BatchArgs),
    /// Generate a batch and drain the main queue through the processor.
    Run(BatchArgs),
    /// Score one event (JSON) without routing it.
    Score {
        event: String,
    },
    /// List unexpired state records.
    Records {
        #[arg(long)]
        pk: Option<String>,
        /// Compact expired rows before listing.
        #[arg(long)]
        purge: bool,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = cli.pipeline.config();
    match &cli.command {
        Command::Generate(batch) => {
            let harness = HarnessBuilder::new(config).root(&cli.root).build()?;
            let response = harness.generate(batch.request()).await?;
            info!(
                main_depth = harness.main_queue().len(),
                quarantine_depth = harness.quarantine_queue().len(),
                "generation finished"
            );
            print_json(&response)?;
        }
        Command::Run(batch) => {
            let harness = HarnessBuilder::new(config).root(&cli.root).build()?;
            let report = harness.run(batch.request()).await?;
            print_json(&report)?;
        }
        Command::Score { event } => {
            let harness = HarnessBuilder::new(config).build()?;
            let record: Value = serde_json::from_str(event).context("event is not valid JSON")?;
            let (assessment, decision) = harness.score(&record);
            print_json(&json!({
                "riskScore": assessment.score.as_f64(),
                "decision": decision,
                "factors": assessment.factors,
            }))?;
        }
        Command::Records { pk, purge } => {
            let store = FileStateStore::new(&cli.root, &config.state_table_name);
            let now = epoch_seconds();
            if *purge {
                let removed = store.purge_expired(now).await?;
                info!(removed, "expired records purged");
            }
            let records = match pk {
                Some(pk) => store.records_for(pk, now).await?,
                None => store.scan(now).await?,
            };
            print_json(&records)?;
        }
    }

    Ok(())
}
