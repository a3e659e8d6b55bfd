//! Host-side probe scheduler.
//!
//! Runs one background probe loop per started task and forwards each
//! result over an mpsc channel; the host agent batches them into its next
//! heartbeat.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use berth_state::{HealthCheckSpec, TaskId, epoch_secs};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::checker::{HealthCheck, HealthCheckError, ProbeResult, command_probe};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Runs one probe of a health check with a timeout.
pub type ProbeFn = Arc<dyn Fn(HealthCheck, Duration) -> BoxFuture<ProbeResult> + Send + Sync>;

/// One probe outcome, as reported to the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub task_id: TaskId,
    pub result: ProbeResult,
    pub at: u64,
}

struct ProbeSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Manages the probe loops of the tasks running on one host.
pub struct ProbeScheduler {
    probes: Arc<RwLock<HashMap<TaskId, ProbeSlot>>>,
    reports: mpsc::Sender<ProbeReport>,
    probe: ProbeFn,
}

impl ProbeScheduler {
    pub fn new(reports: mpsc::Sender<ProbeReport>, probe: ProbeFn) -> Self {
        Self {
            probes: Arc::new(RwLock::new(HashMap::new())),
            reports,
            probe,
        }
    }

    /// Scheduler that runs health commands on this host.
    pub fn local(reports: mpsc::Sender<ProbeReport>) -> Self {
        let probe: ProbeFn = Arc::new(
            |check: HealthCheck, timeout: Duration| -> BoxFuture<ProbeResult> {
                Box::pin(async move { command_probe(&check, timeout).await })
            },
        );
        Self::new(reports, probe)
    }

    /// Start probing a task. Returns `false` when the check is disabled.
    ///
    /// A loop already running for the task is replaced.
    pub async fn start(&self, task_id: &str, spec: &HealthCheckSpec) -> Result<bool, HealthCheckError> {
        let Some(check) = HealthCheck::parse(&spec.command)? else {
            return Ok(false);
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let interval = Duration::from_secs(spec.interval_secs.max(1));
        let timeout = Duration::from_secs(spec.timeout_secs);

        let handle = tokio::spawn(run_probe_loop(
            task_id.to_string(),
            check,
            interval,
            timeout,
            self.probe.clone(),
            self.reports.clone(),
            shutdown_rx,
        ));

        let mut probes = self.probes.write().await;
        if let Some(old) = probes.insert(
            task_id.to_string(),
            ProbeSlot {
                handle,
                shutdown_tx,
            },
        ) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }
        info!(%task_id, ?interval, "health probe started");
        Ok(true)
    }

    pub async fn stop(&self, task_id: &str) {
        let mut probes = self.probes.write().await;
        if let Some(slot) = probes.remove(task_id) {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            info!(%task_id, "health probe stopped");
        }
    }

    pub async fn stop_all(&self) {
        let mut probes = self.probes.write().await;
        for (task_id, slot) in probes.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(%task_id, "health probe stopped");
        }
    }

    /// Task ids with a running probe loop.
    pub async fn active(&self) -> Vec<TaskId> {
        let probes = self.probes.read().await;
        probes.keys().cloned().collect()
    }

    pub async fn is_probing(&self, task_id: &str) -> bool {
        self.probes.read().await.contains_key(task_id)
    }
}

async fn run_probe_loop(
    task_id: TaskId,
    check: HealthCheck,
    interval: Duration,
    timeout: Duration,
    probe: ProbeFn,
    reports: mpsc::Sender<ProbeReport>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(%task_id, "probe loop starting");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let result = probe(check.clone(), timeout).await;
                let report = ProbeReport {
                    task_id: task_id.clone(),
                    result,
                    at: epoch_secs(),
                };
                if reports.send(report).await.is_err() {
                    debug!(%task_id, "report channel closed");
                    break;
                }
            }
            _ = shutdown.changed() => {
                debug!(%task_id, "probe loop shutting down");
                break;
            }
        }
    }
}
