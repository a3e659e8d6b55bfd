//! Health monitor: applies probe reports to task state.
//!
//! Keeps one `HealthTracker` per task on the control plane. Probe reports
//! arrive with host heartbeats; when a tracker's status changes the task's
//! health and lifecycle state are written back to the store.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use berth_state::*;

use crate::checker::{HealthCheck, HealthTracker};
use crate::scheduler::ProbeReport;

/// Callback invoked when a task's health status changes.
pub type HealthCallback = Arc<dyn Fn(TaskInstance, HealthStatus) -> BoxFuture + Send + Sync>;

type BoxFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

/// Tracks the health of every running task in the cluster.
pub struct HealthMonitor {
    state: StateStore,
    trackers: Arc<RwLock<HashMap<TaskId, HealthTracker>>>,
    on_status_change: Option<HealthCallback>,
}

impl HealthMonitor {
    pub fn new(state: StateStore) -> Self {
        Self {
            state,
            trackers: Arc::new(RwLock::new(HashMap::new())),
            on_status_change: None,
        }
    }

    pub fn with_callback(mut self, callback: HealthCallback) -> Self {
        self.on_status_change = Some(callback);
        self
    }

    /// The enabled health check of the task's definition, if any.
    fn health_check_of(&self, task: &TaskInstance) -> StateResult<Option<HealthCheckSpec>> {
        let Some(definition) = self.state.get_task_definition(&task.task_definition)? else {
            return Ok(None);
        };
        let spec = definition.health_check().cloned();
        Ok(spec.filter(|s| matches!(HealthCheck::parse(&s.command), Ok(Some(_)))))
    }

    /// Apply one probe report to `task`.
    ///
    /// Returns the updated task when its health changed.
    pub async fn record(
        &self,
        task: &TaskInstance,
        report: &ProbeReport,
    ) -> StateResult<Option<TaskInstance>> {
        if !matches!(
            task.state,
            TaskState::Starting | TaskState::Healthy | TaskState::Unhealthy
        ) {
            debug!(task_id = %task.id, state = %task.state, "probe report ignored");
            return Ok(None);
        }

        let status = {
            let mut trackers = self.trackers.write().await;
            let tracker = match trackers.get_mut(&task.id) {
                Some(tracker) => tracker,
                None => {
                    let Some(spec) = self.health_check_of(task)? else {
                        return Ok(None);
                    };
                    let started_at = task.started_at.unwrap_or(report.at);
                    trackers
                        .entry(task.id.clone())
                        .or_insert_with(|| HealthTracker::new(&spec, started_at))
                }
            };
            tracker.record(report.result, report.at)
        };

        self.apply(task, status).await
    }

    /// A host reported the task's containers running.
    ///
    /// Tasks without a health check are healthy as soon as they run.
    pub async fn mark_running(&self, task: &TaskInstance) -> StateResult<Option<TaskInstance>> {
        if self.health_check_of(task)?.is_some() {
            return Ok(None);
        }
        self.apply(task, HealthStatus::Healthy).await
    }

    async fn apply(
        &self,
        task: &TaskInstance,
        status: HealthStatus,
    ) -> StateResult<Option<TaskInstance>> {
        let now = epoch_secs();
        let Some(updated) = self
            .state
            .update_task(&task.table_key(), |t| t.state.is_live() && apply_health(t, status, now))?
        else {
            return Ok(None);
        };
        match status {
            HealthStatus::Unhealthy => {
                warn!(task_id = %updated.id, service = %updated.service, "task unhealthy")
            }
            _ => info!(task_id = %updated.id, service = %updated.service, state = %updated.state, "task health changed"),
        }
        if let Some(cb) = &self.on_status_change {
            cb(updated.clone(), status).await;
        }
        Ok(Some(updated))
    }

    /// Drop the tracker of a task that stopped.
    pub async fn forget(&self, task_id: &str) {
        if self.trackers.write().await.remove(task_id).is_some() {
            debug!(%task_id, "health tracker dropped");
        }
    }

    /// Task ids with a live tracker.
    pub async fn tracked(&self) -> Vec<TaskId> {
        self.trackers.read().await.keys().cloned().collect()
    }

    pub async fn status_of(&self, task_id: &str) -> Option<HealthStatus> {
        self.trackers.read().await.get(task_id).map(HealthTracker::status)
    }
}

/// Move `task` to reflect `status`; returns whether anything changed.
fn apply_health(task: &mut TaskInstance, status: HealthStatus, now: u64) -> bool {
    let next_state = match status {
        HealthStatus::Healthy => TaskState::Healthy,
        HealthStatus::Unhealthy => TaskState::Unhealthy,
        HealthStatus::Unknown => return false,
    };
    let mut changed = task.health != status;
    task.health = status;
    if status == HealthStatus::Healthy && !task.ever_healthy {
        task.ever_healthy = true;
        changed = true;
    }
    if task.state.can_transition_to(next_state) {
        task.state = next_state;
        changed = true;
    }
    if changed {
        task.updated_at = now;
    }
    changed
}
