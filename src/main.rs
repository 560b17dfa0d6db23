//! CLI Entry Point for rust_automation
//!
//! Provides command-line interface for:
//! - Running the configured machines against a simulated plant
//! - Listing the states of each machine kind
//!
//! # Usage
//!
//! Run for 30 seconds with JSON logs:
//! ```bash
//! rust_automation run --config config/automation.toml --duration 30 --format json
//! ```
//!
//! List states:
//! ```bash
//! rust_automation states
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use rand::Rng;
use rust_automation::config::{RuntimeConfig, DEFAULT_CONFIG_PATH};
use rust_automation::logging::{self, LoggingConfig, OutputFormat};
use rust_automation::machine::{MachineKind, StateMachine};
use rust_automation::orchestrator::Orchestrator;
use rust_automation::persistence::InMemoryMachineConfigStore;
use rust_automation::protocol::MockProtocolClient;
use rust_automation::registry::MachineRegistry;
use rust_automation::tags::InMemoryValueStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "rust_automation")]
#[command(about = "Multi-rate state-machine scheduling engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured machines against simulated instruments
    Run {
        /// Path to the TOML configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Stop after this many seconds (runs until Ctrl-C otherwise)
        #[arg(long)]
        duration: Option<f64>,

        /// Log output format (pretty, compact, json)
        #[arg(long, default_value = "pretty")]
        format: String,
    },

    /// Print the states of every machine kind
    States,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            duration,
            format,
        } => run(config, duration, &format).await,
        Commands::States => print_states(),
    }
}

async fn run(config_path: PathBuf, duration: Option<f64>, format: &str) -> Result<()> {
    let config = RuntimeConfig::load_from(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    config.validate()?;

    let format: OutputFormat = format.parse().map_err(|e: String| anyhow!(e))?;
    let logging_config = LoggingConfig::from_runtime_config(&config)
        .map_err(|e| anyhow!(e))?
        .with_format(format);
    logging::init(logging_config).map_err(|e| anyhow!(e))?;

    info!(application = %config.application.name, "Starting");

    let value_store = Arc::new(InMemoryValueStore::new());
    let protocol = {
        let mut protocol = MockProtocolClient::new();
        let mut rng = rand::thread_rng();
        for definition in &config.tags {
            value_store.create_tag(definition.tag.clone())?;
            if let Some(remote) = &definition.tag.remote {
                let base = rng.gen_range(1.0..100.0);
                protocol =
                    protocol.with_noisy_node(&remote.address, &remote.namespace, base, 0.05);
            }
        }
        protocol
    };

    let config_store = Arc::new(InMemoryMachineConfigStore::from_settings(
        config.machines.clone(),
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(MachineRegistry::new()),
        value_store.clone(),
        config_store.clone(),
        Arc::new(protocol),
        config.scheduler.clone(),
    ));

    for definition in &config.tags {
        let machine =
            orchestrator.subscribe_tag(&definition.tag, definition.scan_time_ms, Some("cli"))?;
        info!(tag = %definition.tag.name, machine = %machine.name(), "Acquisition configured");
    }

    let mut machines = Vec::new();
    for settings in &config.machines {
        let machine = StateMachine::builder(settings.name.clone(), value_store.clone())
            .config_store(config_store.clone())
            .build()?;
        for definition in &config.tags {
            machine.subscribe_to(&definition.tag, Some("cli"))?;
        }
        machines.push(machine);
    }
    orchestrator.start(machines)?;

    let deadline = async {
        match duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs_f64(secs.max(0.0))).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    let mut report = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = report.tick() => {
                let snapshots = orchestrator.serialize_machines();
                println!("{}", serde_json::to_string(&snapshots)?);
            }
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    let stopping = orchestrator.clone();
    tokio::task::spawn_blocking(move || stopping.stop()).await?;
    info!("Stopped");
    Ok(())
}

fn print_states() -> Result<()> {
    for kind in [
        MachineKind::Generic,
        MachineKind::Acquisition,
        MachineKind::Extended,
    ] {
        let states: Vec<&str> = kind.states().iter().map(|s| s.as_str()).collect();
        println!("{}: {}", kind, states.join(", "));
    }
    Ok(())
}
