//! Reconciler: the continuous control loop.
//!
//! Every tick walks the services one at a time: update the deployment
//! records, react to a completed or failed rollout, plan the next batch of
//! actions and execute it. Errors are logged and recorded as service events;
//! the next tick retries.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use berth_health::HealthMonitor;
use berth_rollout::{DeploymentTracker, RolloutOutcome};
use berth_state::*;

use crate::error::{ReconcileError, ReconcileResult};
use crate::executor::{ExecutionResult, append_event_once, execute};
use crate::plan::{ReconcileInput, reconcile};

/// How long `STOPPED` task records are kept for inspection.
const STOPPED_TASK_RETENTION: Duration = Duration::from_secs(3600);

/// How long a host may take to start a task, image pull included.
const PENDING_TIMEOUT: Duration = Duration::from_secs(600);

/// Outcome of reconciling one service.
#[derive(Debug, Clone, Default)]
pub struct ServiceReport {
    pub cluster: String,
    pub service: String,
    pub version: u64,
    pub execution: ExecutionResult,
    pub outcome: Option<RolloutOutcome>,
    /// Version created by a circuit-breaker rollback.
    pub rolled_back_to: Option<u64>,
    /// The deleted service had no tasks left and was removed.
    pub purged: bool,
}

pub struct Reconciler {
    state: StateStore,
    health: Option<Arc<HealthMonitor>>,
    stopped_retention: Duration,
    pending_timeout: Duration,
}

impl Reconciler {
    pub fn new(state: StateStore) -> Self {
        Self {
            state,
            health: None,
            stopped_retention: STOPPED_TASK_RETENTION,
            pending_timeout: PENDING_TIMEOUT,
        }
    }

    /// Drop health trackers of tasks the reconciler stops or forgets.
    pub fn with_health_monitor(mut self, health: Arc<HealthMonitor>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_stopped_task_retention(mut self, retention: Duration) -> Self {
        self.stopped_retention = retention;
        self
    }

    pub fn with_pending_timeout(mut self, timeout: Duration) -> Self {
        self.pending_timeout = timeout;
        self
    }

    pub async fn reconcile_service(&self, cluster: &str, name: &str) -> ReconcileResult<ServiceReport> {
        let now = epoch_secs();
        let spec = self
            .state
            .get_service(cluster, name)?
            .ok_or_else(|| ReconcileError::ServiceNotFound(format!("{cluster}/{name}")))?;
        let definition = self
            .state
            .get_task_definition(&spec.task_definition)?
            .ok_or_else(|| ReconcileError::TaskDefinitionNotFound(spec.task_definition.clone()))?;
        let tasks = self.state.list_tasks_for_service(cluster, name)?;
        let mut report = ServiceReport {
            cluster: cluster.to_string(),
            service: name.to_string(),
            version: spec.version,
            ..Default::default()
        };

        if spec.status == ServiceStatus::Draining && tasks.iter().all(|t| !t.state.is_live()) {
            for task in &tasks {
                self.forget(&task.id).await;
            }
            self.state.purge_service(cluster, name)?;
            info!(%cluster, service = %name, "deleted service removed");
            report.purged = true;
            return Ok(report);
        }

        // ── Deployments ─────────────────────────────────────────────
        let mut tracker = DeploymentTracker::new(self.state.list_deployments(cluster, name)?);
        tracker.ensure_primary(&spec, now);
        report.outcome = tracker.observe(&spec, &tasks, now);
        let steady = tracker.announce_steady(now);
        for deployment in tracker.changed() {
            self.state.put_deployment(deployment)?;
        }

        if let Some(RolloutOutcome::Failed {
            version,
            failed_tasks,
            rollback_to,
        }) = &report.outcome
        {
            append_event_once(
                &self.state,
                cluster,
                name,
                &format!(
                    "service {name} (deployment {version}) deployment failed: \
                     {failed_tasks} tasks failed to start."
                ),
            )?;
            if let Some(target) = rollback_to
                && spec.status == ServiceStatus::Active
            {
                let mut input = spec.to_input();
                input.task_definition = target.task_definition.clone();
                let rolled = self.state.submit_service(&input)?;
                append_event_once(
                    &self.state,
                    cluster,
                    name,
                    &format!(
                        "service {name} rolling back to task definition {} (deployment {}).",
                        target.task_definition, rolled.version
                    ),
                )?;
                warn!(
                    %cluster,
                    service = %name,
                    from = version,
                    to = rolled.version,
                    task_definition = %target.task_definition,
                    "deployment rolled back"
                );
                report.rolled_back_to = Some(rolled.version);
                return Ok(report);
            }
        }
        if steady {
            self.state
                .append_event(cluster, name, format!("service {name} has reached a steady state."))?;
        }

        // ── Plan + execute ──────────────────────────────────────────
        let hosts = self.state.list_hosts(cluster)?;
        let cluster_tasks = self.state.list_tasks_for_cluster(cluster)?;
        let seed = format!("{}#{now}", spec.version_key());
        let plan = reconcile(&ReconcileInput {
            service: &spec,
            definition: &definition,
            tasks: &tasks,
            hosts: &hosts,
            cluster_tasks: &cluster_tasks,
            seed: &seed,
            now,
            pending_timeout_secs: self.pending_timeout.as_secs(),
        });
        report.execution = execute(&plan, &self.state)?;
        for task_id in &report.execution.reaped {
            self.forget(task_id).await;
        }

        self.prune_stopped(&tracker, &tasks, now).await?;
        Ok(report)
    }

    /// Delete old `STOPPED` records, keeping the primary deployment's while
    /// its rollout is in progress.
    async fn prune_stopped(
        &self,
        tracker: &DeploymentTracker,
        tasks: &[TaskInstance],
        now: u64,
    ) -> ReconcileResult<()> {
        let counting = tracker
            .primary()
            .filter(|d| d.rollout_state == RolloutState::InProgress)
            .map(|d| d.version);
        let retention = self.stopped_retention.as_secs();
        for task in tasks.iter().filter(|t| t.state == TaskState::Stopped) {
            if Some(task.service_version) == counting || now < task.updated_at + retention {
                continue;
            }
            self.state.delete_task(task)?;
            self.forget(&task.id).await;
            debug!(task_id = %task.id, service = %task.service, "stopped task pruned");
        }
        Ok(())
    }

    async fn forget(&self, task_id: &str) {
        if let Some(health) = &self.health {
            health.forget(task_id).await;
        }
    }

    /// Reconcile every service of every cluster.
    ///
    /// A failing service is logged and recorded as an event; the others
    /// still run.
    pub async fn reconcile_all(&self) -> ReconcileResult<Vec<ServiceReport>> {
        let mut reports = Vec::new();
        for spec in self.state.list_all_services()? {
            match self.reconcile_service(&spec.cluster, &spec.name).await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    error!(cluster = %spec.cluster, service = %spec.name, error = %e, "reconciliation failed");
                    let message = format!("service {} reconciliation failed: {e}", spec.name);
                    if let Err(e) = append_event_once(&self.state, &spec.cluster, &spec.name, &message) {
                        warn!(error = %e, "could not record reconciliation failure");
                    }
                }
            }
        }
        Ok(reports)
    }

    /// Run the reconciliation loop until `shutdown` fires.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "reconciler started");
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.reconcile_all().await {
                        Ok(reports) => {
                            let busy = reports.iter().filter(|r| !r.execution.is_empty()).count();
                            if busy > 0 {
                                debug!(services = reports.len(), busy, "reconcile tick");
                            }
                        }
                        Err(e) => error!(error = %e, "reconcile tick failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("reconciler shutting down");
                    break;
                }
            }
        }
    }
}
