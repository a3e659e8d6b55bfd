//! Agent mode: runs on container hosts, joins an existing cluster.
//!
//! In this mode, the daemon:
//! 1. Registers with the control plane (retrying until it answers)
//! 2. Runs the heartbeat loop, starting and stopping containers as told
//! 3. Probes the health checks of the tasks it runs
//! 4. On shutdown, stops probing and exits; containers keep running

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, ValueEnum};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use berth_cluster::{AgentConfig, ControlPlaneClient, DockerCliDriver, HostAgent, SimulatedDriver, TaskDriver};
use berth_health::{HealthCheck, ProbeFn, ProbeResult};
use berth_state::HostCapacity;

const REGISTER_RETRY: Duration = Duration::from_secs(5);

/// How a host runs task containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DriverKind {
    /// The `docker` CLI.
    Docker,
    /// In-memory tasks that always pass their health checks.
    Simulated,
}

#[derive(Debug, Args)]
pub struct AgentArgs {
    /// Control plane address (host:port).
    #[arg(long)]
    pub control_plane: String,

    /// Cluster to join.
    #[arg(long)]
    pub cluster: String,

    /// Address this host is reachable at.
    #[arg(long)]
    pub address: String,

    /// Memory offered to tasks (MiB).
    #[arg(long, default_value = "2048")]
    pub memory: u64,

    /// CPU units offered to tasks.
    #[arg(long, default_value = "1024")]
    pub cpu: u32,

    /// Capacity provider this host belongs to.
    #[arg(long)]
    pub provider: Option<String>,

    /// Host attribute for placement constraints, as `key=value`. Repeatable.
    #[arg(long = "attribute", value_parser = parse_attribute)]
    pub attributes: Vec<(String, String)>,

    #[arg(long, value_enum, default_value = "docker")]
    pub driver: DriverKind,
}

fn parse_attribute(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.trim().to_string())),
        _ => Err(format!("expected key=value, got {raw:?}")),
    }
}

/// Run the host agent until Ctrl-C.
pub async fn run_agent(args: AgentArgs) -> anyhow::Result<()> {
    info!(control_plane = %args.control_plane, cluster = %args.cluster, "Berth daemon starting in agent mode");

    let config = AgentConfig {
        cluster: args.cluster,
        address: args.address,
        capacity: HostCapacity {
            memory_mib: args.memory,
            cpu_units: args.cpu,
        },
        attributes: args.attributes.into_iter().collect::<BTreeMap<_, _>>(),
        capacity_provider: args.provider,
    };
    let client = ControlPlaneClient::new(args.control_plane);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = spawn_agent(config, client, args.driver, shutdown_rx);

    // ── Wait for shutdown ────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = handle.await;
    info!("agent stopped");
    Ok(())
}

/// Spawn a host agent with the chosen driver.
pub fn spawn_agent(
    config: AgentConfig,
    client: ControlPlaneClient,
    driver: DriverKind,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let control_plane = Arc::new(client);
    match driver {
        DriverKind::Docker => {
            let agent = HostAgent::new(config, control_plane, Arc::new(DockerCliDriver::default()));
            tokio::spawn(drive(agent, shutdown))
        }
        DriverKind::Simulated => {
            let agent = HostAgent::new(config, control_plane, Arc::new(SimulatedDriver::new()))
                .with_probe(always_healthy());
            tokio::spawn(drive(agent, shutdown))
        }
    }
}

async fn drive<D: TaskDriver>(
    mut agent: HostAgent<ControlPlaneClient, D>,
    mut shutdown: watch::Receiver<bool>,
) {
    // ── Join cluster ─────────────────────────────────────────────
    loop {
        match agent.register().await {
            Ok(host_id) => {
                info!(%host_id, "joined cluster");
                break;
            }
            Err(e) => {
                warn!(error = %e, retry_in = ?REGISTER_RETRY, "registration failed");
                tokio::select! {
                    _ = tokio::time::sleep(REGISTER_RETRY) => {}
                    _ = shutdown.changed() => return,
                }
            }
        }
    }

    // ── Heartbeat loop ───────────────────────────────────────────
    if let Err(e) = agent.run(shutdown).await {
        error!(error = %e, "heartbeat loop error");
    }
}

/// Simulated tasks have nothing to probe.
fn always_healthy() -> ProbeFn {
    Arc::new(
        |_: HealthCheck, _: Duration| -> Pin<Box<dyn Future<Output = ProbeResult> + Send>> {
            Box::pin(async { ProbeResult::Healthy })
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_are_key_value_pairs() {
        assert_eq!(
            parse_attribute("zone = a").unwrap(),
            ("zone".to_string(), "a".to_string())
        );
        assert_eq!(parse_attribute("tier=").unwrap().1, "");
        assert!(parse_attribute("zone").is_err());
        assert!(parse_attribute("=a").is_err());
    }

    #[tokio::test]
    async fn always_healthy_probe_passes() {
        let probe = always_healthy();
        let check = HealthCheck::parse(&["CMD".to_string(), "false".to_string()])
            .unwrap()
            .unwrap();
        assert_eq!(probe(check, Duration::from_secs(1)).await, ProbeResult::Healthy);
    }
}
