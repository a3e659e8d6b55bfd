//! Rollout bounds: how many tasks a rollout step may start and stop.

use berth_state::DeploymentConfiguration;

/// Task counts of one service across all its versions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskCounts {
    /// Tasks that hold a slot: every task not yet `STOPPED`.
    pub occupying: u32,
    /// Tasks currently `HEALTHY` and meant to keep running.
    pub healthy: u32,
}

/// What one reconciliation step may do without leaving the bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolloutBudget {
    /// Upper bound on occupying tasks, `floor(desired × max% / 100)`.
    pub max_total: u32,
    /// Lower bound on healthy tasks, `ceil(desired × min% / 100)`.
    pub min_healthy: u32,
    /// Tasks that may be started now.
    pub can_start: u32,
    /// Healthy tasks that may be stopped now.
    pub can_stop_healthy: u32,
}

impl RolloutBudget {
    pub fn compute(bounds: &DeploymentConfiguration, desired: u32, counts: TaskCounts) -> Self {
        let max_total = max_total(desired, bounds.maximum_percent);
        let min_healthy = min_healthy(desired, bounds.minimum_healthy_percent);
        Self {
            max_total,
            min_healthy,
            can_start: max_total.saturating_sub(counts.occupying),
            can_stop_healthy: counts.healthy.saturating_sub(min_healthy),
        }
    }

    /// Take up to `wanted` start slots.
    pub fn take_start(&mut self, wanted: u32) -> u32 {
        let granted = wanted.min(self.can_start);
        self.can_start -= granted;
        granted
    }

    /// Take one healthy-stop slot, if any is left.
    pub fn take_healthy_stop(&mut self) -> bool {
        if self.can_stop_healthy == 0 {
            return false;
        }
        self.can_stop_healthy -= 1;
        true
    }
}

pub fn max_total(desired: u32, maximum_percent: u32) -> u32 {
    (u64::from(desired) * u64::from(maximum_percent) / 100) as u32
}

pub fn min_healthy(desired: u32, minimum_healthy_percent: u32) -> u32 {
    (u64::from(desired) * u64::from(minimum_healthy_percent)).div_ceil(100) as u32
}
