//! Plan executor: applies a `ReconcilePlan` to the store.
//!
//! New tasks are written `PENDING` and a `start` command is queued for
//! their host; stopped tasks move to `STOPPING` with a `stop` command. The
//! hosts pick the commands up on their next heartbeat.

use tracing::{debug, info, warn};
use uuid::Uuid;

use berth_state::*;

use crate::error::ReconcileResult;
use crate::plan::{Action, ReconcilePlan};

/// What an executed plan changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    pub started: Vec<TaskId>,
    pub stopping: Vec<TaskId>,
    /// Tasks recorded stopped without a host command.
    pub reaped: Vec<TaskId>,
    pub commands: u32,
    pub events: u32,
}

impl ExecutionResult {
    pub fn is_empty(&self) -> bool {
        self.started.is_empty() && self.stopping.is_empty() && self.reaped.is_empty()
    }
}

pub fn execute(plan: &ReconcilePlan, state: &StateStore) -> ReconcileResult<ExecutionResult> {
    let mut result = ExecutionResult::default();
    let now = epoch_secs();

    for action in &plan.actions {
        match action {
            Action::StartTask {
                host_id,
                capacity_provider,
            } => start_task(plan, host_id, capacity_provider, now, state, &mut result)?,
            Action::StopTask { task, reason } => stop_task(task, reason, now, state, &mut result)?,
            Action::ReplaceTask {
                task,
                host_id,
                capacity_provider,
                reason,
            } => {
                stop_task(task, reason, now, state, &mut result)?;
                start_task(plan, host_id, capacity_provider, now, state, &mut result)?;
            }
            Action::MarkStopped { task, reason } => {
                let marked = state.update_task(&task.table_key(), |t| {
                    if !t.state.is_live() {
                        return false;
                    }
                    t.state = TaskState::Stopped;
                    t.desired_status = DesiredStatus::Stopped;
                    t.stopped_reason = Some(reason.clone());
                    t.updated_at = now;
                    true
                })?;
                if marked.is_some() {
                    warn!(task_id = %task.id, service = %task.service, %reason, "task marked stopped");
                    result.reaped.push(task.id.clone());
                }
            }
        }
    }

    for message in &plan.events {
        if append_event_once(state, &plan.cluster, &plan.service, message)? {
            result.events += 1;
        }
    }

    if !result.is_empty() {
        info!(
            service = %plan.service,
            version = plan.service_version,
            started = result.started.len(),
            stopping = result.stopping.len(),
            reaped = result.reaped.len(),
            "plan executed"
        );
    }
    Ok(result)
}

/// Append `message` unless it repeats the service's latest event, so a
/// stuck service does not flood its log every tick.
pub(crate) fn append_event_once(
    state: &StateStore,
    cluster: &str,
    service: &str,
    message: &str,
) -> StateResult<bool> {
    let last = state.list_events(cluster, service, 1)?.pop();
    if last.is_some_and(|e| e.message == message) {
        return Ok(false);
    }
    state.append_event(cluster, service, message)?;
    Ok(true)
}

fn start_task(
    plan: &ReconcilePlan,
    host_id: &str,
    capacity_provider: &Option<String>,
    now: u64,
    state: &StateStore,
    result: &mut ExecutionResult,
) -> ReconcileResult<()> {
    let task = TaskInstance {
        id: Uuid::new_v4().to_string(),
        cluster: plan.cluster.clone(),
        service: plan.service.clone(),
        service_version: plan.service_version,
        task_definition: plan.definition.reference(),
        host_id: Some(host_id.to_string()),
        capacity_provider: capacity_provider.clone(),
        reservation: plan.definition.reservation(),
        state: TaskState::Pending,
        health: HealthStatus::Unknown,
        desired_status: DesiredStatus::Running,
        stopped_reason: None,
        ever_healthy: false,
        started_at: None,
        created_at: now,
        updated_at: now,
    };
    state.put_task(&task)?;
    state.enqueue_command(
        host_id,
        &HostCommand::Start {
            task: task.clone(),
            task_definition: plan.definition.clone(),
        },
    )?;
    result.commands += 1;
    debug!(task_id = %task.id, %host_id, service = %plan.service, "task start queued");
    result.started.push(task.id);
    Ok(())
}

fn stop_task(
    task: &TaskInstance,
    reason: &str,
    now: u64,
    state: &StateStore,
    result: &mut ExecutionResult,
) -> ReconcileResult<()> {
    // The plan works from a snapshot; a heartbeat may have moved the task since.
    let updated = state.update_task(&task.table_key(), |t| {
        if !t.state.is_live() {
            return false;
        }
        t.desired_status = DesiredStatus::Stopped;
        t.stopped_reason = Some(reason.to_string());
        t.updated_at = now;
        if t.host_id.is_none() {
            t.state = TaskState::Stopped;
        } else if t.state.can_transition_to(TaskState::Stopping) {
            t.state = TaskState::Stopping;
        }
        true
    })?;
    let Some(task) = updated else {
        debug!(task_id = %task.id, "task already stopped");
        return Ok(());
    };
    if let Some(host_id) = &task.host_id {
        state.enqueue_command(
            host_id,
            &HostCommand::Stop {
                task_id: task.id.clone(),
                reason: reason.to_string(),
            },
        )?;
        result.commands += 1;
    }
    debug!(task_id = %task.id, %reason, "task stop queued");
    result.stopping.push(task.id);
    Ok(())
}
