//! Placement engine: assigns tasks to hosts one at a time.
//!
//! Every placement reserves memory, CPU and host ports on the in-memory
//! view, so later tasks of the same batch see the earlier ones. Tasks that
//! fit nowhere are reported back with the reason each host refused them.

use std::collections::BTreeMap;

use berth_state::{DesiredStatus, PlacementStrategy, TaskId, TaskInstance, TaskState};
use tracing::{debug, warn};

use crate::scorer::{HostResources, Rejection, TaskRequirements, check_host, hash_rank, rank_key};

/// Result of placing a batch of identical tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlacementPlan {
    /// Host id per placed task, in placement order.
    pub assignments: Vec<String>,
    pub unplaced: u32,
    /// Why the last unplaced task was refused, per host.
    pub rejections: BTreeMap<String, Rejection>,
}

impl PlacementPlan {
    /// One-line explanation of why tasks remained unplaced.
    pub fn unplaced_reason(&self) -> String {
        describe_rejections(&self.rejections)
    }
}

pub fn describe_rejections(rejections: &BTreeMap<String, Rejection>) -> String {
    if rejections.is_empty() {
        return "no hosts are registered in the cluster".to_string();
    }
    let reasons: Vec<String> = rejections
        .iter()
        .map(|(host, why)| format!("{host}: {why}"))
        .collect();
    format!("no host can run the task ({})", reasons.join("; "))
}

/// Stateful placer over a cluster view.
#[derive(Debug, Clone)]
pub struct Placer {
    hosts: Vec<HostResources>,
    strategies: Vec<PlacementStrategy>,
    seed: String,
    placed: u64,
}

impl Placer {
    pub fn new(hosts: Vec<HostResources>, strategies: Vec<PlacementStrategy>, seed: &str) -> Self {
        Self {
            hosts,
            strategies,
            seed: seed.to_string(),
            placed: 0,
        }
    }

    /// Place a single task, reserving its resources on the chosen host.
    pub fn place_one(
        &mut self,
        req: &TaskRequirements,
    ) -> Result<String, BTreeMap<String, Rejection>> {
        let mut rejections = BTreeMap::new();
        let mut eligible = Vec::new();
        for (index, host) in self.hosts.iter().enumerate() {
            match check_host(host, req) {
                Ok(()) => eligible.push(index),
                Err(why) => {
                    rejections.insert(host.host_id.clone(), why);
                }
            }
        }

        let salt = format!("{}#{}", self.seed, self.placed);
        let best = eligible.into_iter().min_by_key(|&index| {
            let host = &self.hosts[index];
            (
                rank_key(host, &self.hosts, &self.strategies, &salt),
                host.host_id.clone(),
            )
        });

        let Some(index) = best else {
            return Err(rejections);
        };
        let host = &mut self.hosts[index];
        host.reserve(req);
        self.placed += 1;
        debug!(host = %host.host_id, memory = req.memory_mib, "task placed");
        Ok(host.host_id.clone())
    }

    pub fn hosts(&self) -> &[HostResources] {
        &self.hosts
    }
}

/// Place `count` tasks of `req` across `hosts`.
pub fn place(
    req: &TaskRequirements,
    hosts: &[HostResources],
    strategies: &[PlacementStrategy],
    count: u32,
    seed: &str,
) -> PlacementPlan {
    let mut placer = Placer::new(hosts.to_vec(), strategies.to_vec(), seed);
    let mut plan = PlacementPlan::default();
    for _ in 0..count {
        match placer.place_one(req) {
            Ok(host) => plan.assignments.push(host),
            Err(rejections) => {
                plan.unplaced += 1;
                plan.rejections = rejections;
            }
        }
    }
    if plan.unplaced > 0 {
        warn!(
            placed = plan.assignments.len(),
            unplaced = plan.unplaced,
            "could not place all tasks"
        );
    }
    plan
}

fn termination_class(task: &TaskInstance) -> u64 {
    if task.host_id.is_none() {
        return 0;
    }
    match task.state {
        TaskState::Pending => 0,
        TaskState::Starting => 1,
        TaskState::Unhealthy => 2,
        _ => 3,
    }
}

/// Choose `count` running tasks to stop on scale-in.
///
/// Unplaced and pending tasks go first, then starting, then unhealthy.
/// Among the rest the placement strategies decide: spread removes from the
/// most populated group, binpack from the host with the most room left.
/// Newest tasks go first on a tie.
pub fn select_for_termination(
    tasks: &[TaskInstance],
    hosts: &[HostResources],
    strategies: &[PlacementStrategy],
    count: u32,
) -> Vec<TaskId> {
    let host_of = |task: &TaskInstance| {
        task.host_id
            .as_deref()
            .and_then(|id| hosts.iter().find(|h| h.host_id == id))
    };

    let mut remaining: Vec<&TaskInstance> = tasks
        .iter()
        .filter(|t| t.state.is_live() && t.state != TaskState::Stopping)
        .filter(|t| t.desired_status == DesiredStatus::Running)
        .collect();
    let mut victims = Vec::new();

    while victims.len() < count as usize && !remaining.is_empty() {
        let key = |task: &TaskInstance| {
            let mut key = vec![termination_class(task)];
            let host = host_of(task);
            for strategy in strategies {
                key.push(match strategy {
                    PlacementStrategy::Spread { field } => {
                        let group = host.and_then(|h| h.group_value(field));
                        let members = remaining
                            .iter()
                            .filter(|&&t| host_of(t).and_then(|h| h.group_value(field)) == group)
                            .count() as u64;
                        u64::MAX - members
                    }
                    PlacementStrategy::Binpack { .. } => {
                        u64::MAX - host.map(|h| h.free_memory()).unwrap_or(0)
                    }
                    PlacementStrategy::Random => hash_rank("scale-in", &task.id),
                });
            }
            key.push(u64::MAX - task.created_at);
            (key, task.id.clone())
        };
        let Some(index) = (0..remaining.len()).min_by_key(|&i| key(remaining[i])) else {
            break;
        };
        victims.push(remaining.remove(index).id.clone());
    }
    victims
}
