//! berthd — the Berth daemon.
//!
//! Single binary for every role:
//! - `standalone`: state store, reconciler, dead-host reaper and REST API,
//!   optionally with an in-process container host
//! - `agent`: a container host joining a control plane
//! - `plan` / `apply`: turn `berth.toml` into a stack and submit it
//! - `init`: write a minimal `berth.toml`
//!
//! # Usage
//!
//! ```text
//! berthd standalone --port 8443 --data-dir /var/lib/berth --config berth.toml --local-host
//! berthd agent --control-plane 10.0.0.1:8443 --cluster demo --address 10.0.0.2
//! berthd plan --config berth.toml
//! berthd apply --config berth.toml --endpoint 10.0.0.1:8443
//! ```

mod agent_mode;
mod stack;
mod standalone;

use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use berth_cluster::ControlPlaneClient;
use berth_core::BerthConfig;

use crate::agent_mode::AgentArgs;
use crate::standalone::StandaloneArgs;

const DEFAULT_LOG_FILTER: &str = "info,berthd=debug,berth=debug";

#[derive(Parser)]
#[command(name = "berthd", about = "Berth container orchestrator daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane (single node, all subsystems in one process).
    Standalone(StandaloneArgs),

    /// Run a container host that joins an existing control plane.
    Agent(AgentArgs),

    /// Validate a config and print the stack it declares.
    Plan {
        #[arg(long, default_value = "berth.toml")]
        config: PathBuf,
    },

    /// Submit a config's stack to a control plane.
    Apply {
        #[arg(long, default_value = "berth.toml")]
        config: PathBuf,

        /// Control plane address (host:port).
        #[arg(long, default_value = "127.0.0.1:8443")]
        endpoint: String,
    },

    /// Write a minimal config.
    Init {
        #[arg(long)]
        cluster: String,

        #[arg(long)]
        image: String,

        #[arg(long, default_value = "berth.toml")]
        output: PathBuf,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Standalone(args) => standalone::run_standalone(args).await,
        Command::Agent(args) => agent_mode::run_agent(args).await,
        Command::Plan { config } => {
            let declaration = stack::load(&config).with_context(|| format!("invalid config {}", config.display()))?;
            println!("{}", serde_json::to_string_pretty(&declaration)?);
            Ok(())
        }
        Command::Apply { config, endpoint } => {
            let declaration = stack::load(&config).with_context(|| format!("invalid config {}", config.display()))?;
            let client = ControlPlaneClient::new(endpoint);
            let outputs = client
                .apply(&declaration)
                .await
                .with_context(|| format!("apply to {} failed", client.address()))?;
            info!(service = %declaration.service.name, version = outputs.service_version, "stack applied");
            println!("cluster_arn = {}", outputs.cluster_arn);
            println!("task_definition_arn = {}", outputs.task_definition_arn);
            println!("service_arn = {}", outputs.service_arn);
            println!("service_version = {}", outputs.service_version);
            Ok(())
        }
        Command::Init {
            cluster,
            image,
            output,
            force,
        } => {
            if output.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", output.display());
            }
            let config = BerthConfig::scaffold(&cluster, &image);
            config.validate()?;
            std::fs::write(&output, config.to_toml_string()?)?;
            info!(path = %output.display(), "config written");
            Ok(())
        }
    }
}
