//! Health check probe logic.
//!
//! Runs container health check commands and tracks consecutive results
//! against the retries / start period thresholds.

use std::process::Stdio;
use std::time::Duration;

use berth_state::{HealthCheckSpec, HealthStatus};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeResult {
    /// The command exited 0.
    Healthy,
    /// The command exited non-zero.
    Unhealthy,
    /// The command could not be run or timed out.
    Failed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HealthCheckError {
    #[error("invalid health check command {0:?}: expected [\"CMD-SHELL\", <script>], [\"CMD\", <args>..] or [\"NONE\"]")]
    InvalidCommand(Vec<String>),
}

/// A parsed health check command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthCheck {
    /// `["CMD-SHELL", script]`, run through `sh -c`.
    Shell(String),
    /// `["CMD", program, args..]`, run directly.
    Exec(Vec<String>),
}

impl HealthCheck {
    /// Parse a command array. `["NONE"]` disables the check.
    pub fn parse(command: &[String]) -> Result<Option<Self>, HealthCheckError> {
        match command {
            [kind] if kind == "NONE" => Ok(None),
            [kind, script] if kind == "CMD-SHELL" && !script.trim().is_empty() => {
                Ok(Some(HealthCheck::Shell(script.clone())))
            }
            [kind, args @ ..] if kind == "CMD" && !args.is_empty() => {
                Ok(Some(HealthCheck::Exec(args.to_vec())))
            }
            _ => Err(HealthCheckError::InvalidCommand(command.to_vec())),
        }
    }

    fn command(&self) -> Command {
        match self {
            HealthCheck::Shell(script) => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(script);
                cmd
            }
            HealthCheck::Exec(args) => {
                let mut cmd = Command::new(&args[0]);
                cmd.args(&args[1..]);
                cmd
            }
        }
    }
}

/// Tracks consecutive probe results for a single task.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    status: HealthStatus,
    consecutive_failures: u32,
    retries: u32,
    interval: Duration,
    timeout: Duration,
    /// Failures before this instant (unix seconds) do not count.
    grace_until: u64,
}

impl HealthTracker {
    /// Create a tracker for a task whose container started at `started_at`.
    pub fn new(spec: &HealthCheckSpec, started_at: u64) -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            retries: spec.retries.max(1),
            interval: Duration::from_secs(spec.interval_secs),
            timeout: Duration::from_secs(spec.timeout_secs),
            grace_until: started_at.saturating_add(spec.start_period_secs),
        }
    }

    /// Record a probe result observed at `at` and return the new status.
    pub fn record(&mut self, result: ProbeResult, at: u64) -> HealthStatus {
        match result {
            ProbeResult::Healthy => {
                if self.status != HealthStatus::Healthy {
                    debug!(failures = self.consecutive_failures, "task became healthy");
                }
                self.consecutive_failures = 0;
                self.status = HealthStatus::Healthy;
            }
            ProbeResult::Unhealthy | ProbeResult::Failed if at < self.grace_until => {
                debug!(?result, "failure ignored during start period");
            }
            ProbeResult::Unhealthy | ProbeResult::Failed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.retries {
                    if self.status != HealthStatus::Unhealthy {
                        warn!(
                            failures = self.consecutive_failures,
                            retries = self.retries,
                            "task marked unhealthy"
                        );
                    }
                    self.status = HealthStatus::Unhealthy;
                }
            }
        }
        self.status
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Delay between probes, exactly as configured.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn needs_replacement(&self) -> bool {
        self.status == HealthStatus::Unhealthy
    }
}

/// Run a health check command once.
///
/// Exit 0 is `Healthy`, any other exit code `Unhealthy`; a spawn error or
/// a timeout is `Failed`. The child is killed when the timeout fires.
pub async fn command_probe(check: &HealthCheck, timeout: Duration) -> ProbeResult {
    let mut cmd = check.command();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    match tokio::time::timeout(timeout, cmd.status()).await {
        Ok(Ok(status)) if status.success() => ProbeResult::Healthy,
        Ok(Ok(status)) => {
            debug!(code = ?status.code(), "health command exited non-zero");
            ProbeResult::Unhealthy
        }
        Ok(Err(e)) => {
            debug!(error = %e, "health command could not be spawned");
            ProbeResult::Failed
        }
        Err(_) => {
            debug!(?timeout, "health command timed out");
            ProbeResult::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(retries: u32, start_period: u64) -> HealthCheckSpec {
        HealthCheckSpec {
            command: vec!["CMD-SHELL".to_string(), "true".to_string()],
            interval_secs: 30,
            timeout_secs: 5,
            retries,
            start_period_secs: start_period,
        }
    }

    fn strings(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_command_forms() {
        assert_eq!(
            HealthCheck::parse(&strings(&["CMD-SHELL", "curl --fail http://localhost || exit 1"])),
            Ok(Some(HealthCheck::Shell(
                "curl --fail http://localhost || exit 1".to_string()
            )))
        );
        assert_eq!(
            HealthCheck::parse(&strings(&["CMD", "curl", "-f", "http://localhost"])),
            Ok(Some(HealthCheck::Exec(strings(&["curl", "-f", "http://localhost"]))))
        );
        assert_eq!(HealthCheck::parse(&strings(&["NONE"])), Ok(None));
    }

    #[test]
    fn parse_rejects_other_forms() {
        assert!(HealthCheck::parse(&[]).is_err());
        assert!(HealthCheck::parse(&strings(&["CMD"])).is_err());
        assert!(HealthCheck::parse(&strings(&["CMD-SHELL"])).is_err());
        assert!(HealthCheck::parse(&strings(&["CMD-SHELL", "a", "b"])).is_err());
        assert!(HealthCheck::parse(&strings(&["curl", "localhost"])).is_err());
    }

    #[test]
    fn tracker_starts_unknown() {
        let tracker = HealthTracker::new(&spec(3, 5), 1000);
        assert_eq!(tracker.status(), HealthStatus::Unknown);
        assert_eq!(tracker.interval(), Duration::from_secs(30));
        assert_eq!(tracker.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn start_period_failures_do_not_count() {
        let mut tracker = HealthTracker::new(&spec(1, 5), 1000);
        assert_eq!(tracker.record(ProbeResult::Failed, 1001), HealthStatus::Unknown);
        assert_eq!(tracker.record(ProbeResult::Unhealthy, 1004), HealthStatus::Unknown);
        assert_eq!(tracker.consecutive_failures(), 0);
        assert_eq!(tracker.record(ProbeResult::Unhealthy, 1005), HealthStatus::Unhealthy);
    }

    #[test]
    fn success_during_start_period_marks_healthy() {
        let mut tracker = HealthTracker::new(&spec(3, 60), 1000);
        assert_eq!(tracker.record(ProbeResult::Healthy, 1001), HealthStatus::Healthy);
    }

    #[test]
    fn retries_consecutive_failures_mark_unhealthy() {
        let mut tracker = HealthTracker::new(&spec(3, 0), 1000);
        tracker.record(ProbeResult::Healthy, 1000);
        assert_eq!(tracker.record(ProbeResult::Unhealthy, 1030), HealthStatus::Healthy);
        assert_eq!(tracker.record(ProbeResult::Failed, 1060), HealthStatus::Healthy);
        assert_eq!(tracker.record(ProbeResult::Unhealthy, 1090), HealthStatus::Unhealthy);
        assert!(tracker.needs_replacement());
    }

    #[test]
    fn success_resets_failures() {
        let mut tracker = HealthTracker::new(&spec(2, 0), 1000);
        tracker.record(ProbeResult::Unhealthy, 1000);
        tracker.record(ProbeResult::Healthy, 1030);
        assert_eq!(tracker.consecutive_failures(), 0);
        assert_eq!(tracker.record(ProbeResult::Unhealthy, 1060), HealthStatus::Healthy);
    }

    #[test]
    fn recovers_from_unhealthy_on_one_success() {
        let mut tracker = HealthTracker::new(&spec(1, 0), 1000);
        assert_eq!(tracker.record(ProbeResult::Failed, 1000), HealthStatus::Unhealthy);
        assert_eq!(tracker.record(ProbeResult::Healthy, 1030), HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn shell_probe_exit_codes() {
        let ok = HealthCheck::Shell("exit 0".to_string());
        let bad = HealthCheck::Shell("exit 3".to_string());
        assert_eq!(command_probe(&ok, Duration::from_secs(5)).await, ProbeResult::Healthy);
        assert_eq!(command_probe(&bad, Duration::from_secs(5)).await, ProbeResult::Unhealthy);
    }

    #[tokio::test]
    async fn probe_timeout_is_failure() {
        let slow = HealthCheck::Shell("sleep 5".to_string());
        let result = command_probe(&slow, Duration::from_millis(100)).await;
        assert_eq!(result, ProbeResult::Failed);
    }

    #[tokio::test]
    async fn missing_binary_is_failure() {
        let missing = HealthCheck::Exec(vec!["/nonexistent/berth-probe".to_string()]);
        let result = command_probe(&missing, Duration::from_secs(1)).await;
        assert_eq!(result, ProbeResult::Failed);
    }
}
