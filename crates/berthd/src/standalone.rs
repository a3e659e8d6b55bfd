//! Standalone mode: the control plane in one process.
//!
//! Opens the state store, optionally applies a `berth.toml` stack, then
//! runs the reconciler loop, the dead-host reaper and the REST API until
//! Ctrl-C. With `--local-host` the same process also acts as a container
//! host, joining its own API like any remote agent would.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use tokio::sync::watch;
use tracing::{error, info, warn};

use berth_cluster::{AgentConfig, ControlPlaneClient, MembershipManager};
use berth_health::HealthMonitor;
use berth_reconciler::Reconciler;
use berth_state::{ClusterInput, HostCapacity, StateStore, epoch_secs};

use crate::agent_mode::{self, DriverKind};
use crate::stack;

#[derive(Debug, Args)]
pub struct StandaloneArgs {
    /// Port to listen on.
    #[arg(long, default_value = "8443")]
    pub port: u16,

    /// Data directory for persistent state.
    #[arg(long, default_value = "/var/lib/berth")]
    pub data_dir: PathBuf,

    /// Stack to apply at startup.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Seconds between reconciliation passes.
    #[arg(long, default_value = "5", value_parser = clap::value_parser!(u64).range(1..))]
    pub reconcile_interval: u64,

    /// Seconds without a heartbeat before a host is considered dead.
    #[arg(long, default_value = "30", value_parser = clap::value_parser!(u64).range(1..))]
    pub host_timeout: u64,

    /// Also run a container host in this process.
    #[arg(long)]
    pub local_host: bool,

    /// Cluster the local host joins when no config is given.
    #[arg(long, default_value = "default")]
    pub cluster: String,

    /// Memory the local host offers (MiB).
    #[arg(long, default_value = "2048")]
    pub memory: u64,

    /// CPU units the local host offers.
    #[arg(long, default_value = "1024")]
    pub cpu: u32,

    /// How the local host runs containers.
    #[arg(long, value_enum, default_value = "docker")]
    pub driver: DriverKind,
}

pub async fn run_standalone(args: StandaloneArgs) -> anyhow::Result<()> {
    info!("Berth daemon starting in standalone mode");

    std::fs::create_dir_all(&args.data_dir)?;
    let db_path = args.data_dir.join("berth.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let state = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let mut local_cluster = args.cluster.clone();
    if let Some(path) = &args.config {
        let declaration = stack::load(path)?;
        local_cluster = declaration.cluster.name.clone();
        let outputs = state.apply_stack(&declaration)?;
        info!(
            config = ?path,
            service_arn = %outputs.service_arn,
            task_definition = %outputs.task_definition_arn,
            version = outputs.service_version,
            "stack applied"
        );
    }

    let health = Arc::new(HealthMonitor::new(state.clone()));
    let membership = Arc::new(
        MembershipManager::new(state.clone(), health.clone())
            .with_dead_timeout(Duration::from_secs(args.host_timeout)),
    );
    let reconciler = Reconciler::new(state.clone()).with_health_monitor(health.clone());
    info!("reconciler initialized");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let reconcile_interval = Duration::from_secs(args.reconcile_interval);
    let reconcile_shutdown = shutdown_rx.clone();
    let reconcile_handle = tokio::spawn(async move {
        reconciler.run(reconcile_interval, reconcile_shutdown).await;
    });

    // Dead-host reaper.
    let reaper_membership = membership.clone();
    let mut reaper_shutdown = shutdown_rx.clone();
    let reaper_interval = reaper_membership.heartbeat_interval();
    let reaper_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(reaper_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match reaper_membership.reap_dead(epoch_secs()) {
                        Ok(dead) if !dead.is_empty() => {
                            warn!(hosts = ?dead, "hosts marked inactive");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "host reaper failed"),
                    }
                }
                _ = reaper_shutdown.changed() => {
                    info!("host reaper shutting down");
                    break;
                }
            }
        }
    });

    // ── Start API server ───────────────────────────────────────

    let router = berth_api::build_router(state.clone(), membership);
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server starting");

    let agent_handle = if args.local_host {
        let cluster = ensure_cluster(&state, &local_cluster)?;
        let config = AgentConfig {
            cluster: cluster.name,
            address: "127.0.0.1".to_string(),
            capacity: HostCapacity {
                memory_mib: args.memory,
                cpu_units: args.cpu,
            },
            attributes: Default::default(),
            capacity_provider: cluster.capacity_providers.first().cloned(),
        };
        let client = ControlPlaneClient::new(format!("127.0.0.1:{}", args.port));
        info!(cluster = %config.cluster, driver = ?args.driver, "local host starting");
        Some(agent_mode::spawn_agent(config, client, args.driver, shutdown_rx.clone()))
    } else {
        None
    };

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Wait for background tasks.
    let _ = reconcile_handle.await;
    let _ = reaper_handle.await;
    if let Some(handle) = agent_handle {
        let _ = handle.await;
    }

    info!("Berth daemon stopped");
    Ok(())
}

/// The local host's cluster, created with the default provider if missing.
fn ensure_cluster(state: &StateStore, name: &str) -> anyhow::Result<berth_state::Cluster> {
    if let Some(cluster) = state.get_cluster(name)? {
        return Ok(cluster);
    }
    Ok(state.create_cluster(&ClusterInput {
        name: name.to_string(),
        capacity_providers: vec![],
    })?)
}
