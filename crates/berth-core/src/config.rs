//! berth.toml configuration parser.
//!
//! Every key is optional at the serde level so that `validate()` can name
//! the exact missing key (`cluster.name`, `elastic.image`) instead of
//! surfacing a generic deserialization error.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::image::{ImageError, ImageRef};

pub const DEFAULT_PORT: u16 = 80;
pub const DEFAULT_MEMORY_MIB: u64 = 256;
pub const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_HEALTH_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_HEALTH_RETRIES: u32 = 3;
pub const DEFAULT_HEALTH_START_PERIOD_SECS: u64 = 5;
pub const DEFAULT_DESIRED_COUNT: u32 = 1;
pub const DEFAULT_MINIMUM_HEALTHY_PERCENT: u32 = 0;
pub const DEFAULT_MAXIMUM_PERCENT: u32 = 100;

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,254}$").expect("name pattern compiles")
});

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required configuration key `{0}`")]
    Missing(&'static str),
    #[error("invalid value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("invalid `elastic.image`: {0}")]
    Image(#[from] ImageError),
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.into(),
    }
}

/// Validate a cluster, service, family or container name.
pub fn validate_name(key: &'static str, value: &str) -> Result<(), ConfigError> {
    if NAME_RE.is_match(value) {
        Ok(())
    } else {
        Err(invalid(
            key,
            format!("{value:?} must be 1-255 letters, digits, '-' or '_'"),
        ))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BerthConfig {
    pub cluster: Option<ClusterConfig>,
    pub elastic: Option<ElasticConfig>,
    pub service: Option<ServiceConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    pub name: Option<String>,
    pub capacity_providers: Option<Vec<String>>,
}

/// The container workload: image, ports, environment, reservations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElasticConfig {
    pub image: Option<String>,
    pub host_port: Option<u16>,
    pub container_port: Option<u16>,
    pub protocol: Option<String>,
    pub envs: Option<Vec<EnvPair>>,
    /// Hard memory limit (MiB).
    pub memory: Option<u64>,
    /// Soft memory reservation (MiB).
    pub memory_reservation: Option<u64>,
    pub cpu: Option<u32>,
    pub network_mode: Option<String>,
    pub family: Option<String>,
    pub container_name: Option<String>,
    pub health_check: Option<HealthCheckConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvPair {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    pub command: Option<Vec<String>>,
    pub interval: Option<u64>,
    pub timeout: Option<u64>,
    pub retries: Option<u32>,
    pub start_period: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    pub name: Option<String>,
    pub desired_count: Option<u32>,
    pub minimum_healthy_percent: Option<u32>,
    pub maximum_percent: Option<u32>,
    pub placement: Option<Vec<PlacementConfig>>,
    pub constraints: Option<Vec<ConstraintConfig>>,
    pub capacity_providers: Option<Vec<CapacityProviderConfig>>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub field: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintConfig {
    #[serde(rename = "type")]
    pub kind: String,
    /// `attribute:<name> == <value>` for `memberOf`.
    pub expression: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityProviderConfig {
    pub capacity_provider: String,
    pub base: Option<u32>,
    pub weight: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub enable: bool,
    pub rollback: bool,
}

/// Health check parameters after defaults are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckValues {
    pub command: Vec<String>,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub retries: u32,
    pub start_period_secs: u64,
}

/// Split a `memberOf` expression into `(attribute, value)`.
pub fn parse_member_of(expression: &str) -> Option<(String, String)> {
    let (lhs, rhs) = expression.split_once("==")?;
    let attribute = lhs.trim().strip_prefix("attribute:")?.trim();
    let value = rhs.trim();
    if attribute.is_empty() || value.is_empty() {
        return None;
    }
    Some((attribute.to_string(), value.to_string()))
}

impl BerthConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Scaffold a minimal berth.toml for a cluster running one image.
    pub fn scaffold(cluster: &str, image: &str) -> Self {
        BerthConfig {
            cluster: Some(ClusterConfig {
                name: Some(cluster.to_string()),
                capacity_providers: None,
            }),
            elastic: Some(ElasticConfig {
                image: Some(image.to_string()),
                host_port: Some(DEFAULT_PORT),
                container_port: Some(DEFAULT_PORT),
                ..ElasticConfig::default()
            }),
            service: None,
        }
    }

    /// Check every key, failing on the first missing or invalid one.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_name("cluster.name", &self.cluster_name()?)?;
        for provider in self.cluster_capacity_providers() {
            validate_name("cluster.capacityProviders", &provider)?;
        }

        self.image()?;
        validate_name("elastic.family", &self.family()?)?;
        validate_name("elastic.containerName", &self.container_name()?)?;
        if self.container_port() == 0 {
            return Err(invalid("elastic.containerPort", "must be non-zero"));
        }
        let protocol = self.protocol();
        if protocol != "tcp" && protocol != "udp" {
            return Err(invalid("elastic.protocol", format!("{protocol:?} is not tcp or udp")));
        }
        let mode = self.network_mode();
        if mode != "host" && mode != "bridge" {
            return Err(invalid("elastic.networkMode", format!("{mode:?} is not host or bridge")));
        }
        if mode == "host" && self.host_port() != 0 && self.host_port() != self.container_port() {
            return Err(invalid(
                "elastic.hostPort",
                "must equal containerPort in host network mode",
            ));
        }
        for env in self.envs() {
            if env.key.is_empty() {
                return Err(invalid("elastic.envs", "keys must be non-empty"));
            }
        }
        if self.memory() == 0 {
            return Err(invalid("elastic.memory", "must be non-zero"));
        }
        if self.memory_reservation() > self.memory() {
            return Err(invalid(
                "elastic.memoryReservation",
                "soft reservation cannot exceed the hard limit",
            ));
        }
        if let Some(check) = self.health_check() {
            validate_health_check(&check)?;
        }

        validate_name("service.name", &self.service_name()?)?;
        let min = self.minimum_healthy_percent();
        let max = self.maximum_percent();
        if max < 100 {
            return Err(invalid("service.maximumPercent", "must be at least 100"));
        }
        if min > 100 {
            return Err(invalid("service.minimumHealthyPercent", "must be at most 100"));
        }
        if min >= max {
            return Err(invalid(
                "service.minimumHealthyPercent",
                "must be below maximumPercent",
            ));
        }
        for placement in self.placement() {
            validate_placement(&placement)?;
        }
        for constraint in self.constraints() {
            match constraint.kind.as_str() {
                "distinctInstance" => {}
                "memberOf" => {
                    let expression = constraint
                        .expression
                        .as_deref()
                        .ok_or(ConfigError::Missing("service.constraints.expression"))?;
                    if parse_member_of(expression).is_none() {
                        return Err(invalid(
                            "service.constraints.expression",
                            format!("{expression:?} is not `attribute:<name> == <value>`"),
                        ));
                    }
                }
                other => {
                    return Err(invalid(
                        "service.constraints.type",
                        format!("unknown constraint {other:?}"),
                    ));
                }
            }
        }
        let declared = self.cluster_capacity_providers();
        for item in self.capacity_provider_strategy() {
            if !declared.contains(&item.capacity_provider) {
                return Err(invalid(
                    "service.capacityProviders",
                    format!(
                        "{:?} is not declared in cluster.capacityProviders",
                        item.capacity_provider
                    ),
                ));
            }
        }
        Ok(())
    }

    // ── Accessors (defaults applied) ───────────────────────────────

    pub fn cluster_name(&self) -> Result<String, ConfigError> {
        self.cluster
            .as_ref()
            .and_then(|c| c.name.clone())
            .ok_or(ConfigError::Missing("cluster.name"))
    }

    pub fn cluster_capacity_providers(&self) -> Vec<String> {
        self.cluster
            .as_ref()
            .and_then(|c| c.capacity_providers.clone())
            .unwrap_or_else(|| vec!["default".to_string()])
    }

    fn elastic(&self) -> ElasticConfig {
        self.elastic.clone().unwrap_or_default()
    }

    fn service(&self) -> ServiceConfig {
        self.service.clone().unwrap_or_default()
    }

    pub fn image(&self) -> Result<ImageRef, ConfigError> {
        let image = self
            .elastic()
            .image
            .ok_or(ConfigError::Missing("elastic.image"))?;
        Ok(ImageRef::parse(&image)?)
    }

    /// Task definition family; defaults to `<cluster>-task`.
    pub fn family(&self) -> Result<String, ConfigError> {
        match self.elastic().family {
            Some(family) => Ok(family),
            None => Ok(format!("{}-task", self.cluster_name()?)),
        }
    }

    /// Container name; defaults to the image's last path component.
    pub fn container_name(&self) -> Result<String, ConfigError> {
        if let Some(name) = self.elastic().container_name {
            return Ok(name);
        }
        let image = self.image()?;
        let last = image.repository.rsplit('/').next().unwrap_or("app");
        Ok(last.replace('.', "-"))
    }

    pub fn host_port(&self) -> u16 {
        self.elastic().host_port.unwrap_or(DEFAULT_PORT)
    }

    pub fn container_port(&self) -> u16 {
        self.elastic().container_port.unwrap_or(DEFAULT_PORT)
    }

    pub fn protocol(&self) -> String {
        self.elastic().protocol.unwrap_or_else(|| "tcp".to_string())
    }

    pub fn envs(&self) -> Vec<EnvPair> {
        self.elastic().envs.unwrap_or_default()
    }

    pub fn memory(&self) -> u64 {
        self.elastic().memory.unwrap_or(DEFAULT_MEMORY_MIB)
    }

    pub fn memory_reservation(&self) -> u64 {
        self.elastic()
            .memory_reservation
            .unwrap_or_else(|| self.memory().min(DEFAULT_MEMORY_MIB))
    }

    pub fn cpu(&self) -> u32 {
        self.elastic().cpu.unwrap_or(0)
    }

    pub fn network_mode(&self) -> String {
        self.elastic()
            .network_mode
            .unwrap_or_else(|| "host".to_string())
    }

    /// The health check, or `None` when disabled with `command = ["NONE"]`.
    pub fn health_check(&self) -> Option<HealthCheckValues> {
        let cfg = self.elastic().health_check.unwrap_or_default();
        let command = cfg.command.unwrap_or_else(|| {
            vec![
                "CMD-SHELL".to_string(),
                "curl --fail http://localhost || exit 1".to_string(),
            ]
        });
        if command.first().map(String::as_str) == Some("NONE") {
            return None;
        }
        Some(HealthCheckValues {
            command,
            interval_secs: cfg.interval.unwrap_or(DEFAULT_HEALTH_INTERVAL_SECS),
            timeout_secs: cfg.timeout.unwrap_or(DEFAULT_HEALTH_TIMEOUT_SECS),
            retries: cfg.retries.unwrap_or(DEFAULT_HEALTH_RETRIES),
            start_period_secs: cfg.start_period.unwrap_or(DEFAULT_HEALTH_START_PERIOD_SECS),
        })
    }

    /// Service name; defaults to `<cluster>-svc`.
    pub fn service_name(&self) -> Result<String, ConfigError> {
        match self.service().name {
            Some(name) => Ok(name),
            None => Ok(format!("{}-svc", self.cluster_name()?)),
        }
    }

    pub fn desired_count(&self) -> u32 {
        self.service().desired_count.unwrap_or(DEFAULT_DESIRED_COUNT)
    }

    pub fn minimum_healthy_percent(&self) -> u32 {
        self.service()
            .minimum_healthy_percent
            .unwrap_or(DEFAULT_MINIMUM_HEALTHY_PERCENT)
    }

    pub fn maximum_percent(&self) -> u32 {
        self.service().maximum_percent.unwrap_or(DEFAULT_MAXIMUM_PERCENT)
    }

    /// Ordered placement strategies; defaults to spread by `instanceId`.
    pub fn placement(&self) -> Vec<PlacementConfig> {
        self.service().placement.unwrap_or_else(|| {
            vec![PlacementConfig {
                kind: "spread".to_string(),
                field: Some("instanceId".to_string()),
            }]
        })
    }

    pub fn constraints(&self) -> Vec<ConstraintConfig> {
        self.service().constraints.unwrap_or_default()
    }

    /// Capacity provider strategy; defaults to base 1 / weight 1 on the
    /// first declared provider.
    pub fn capacity_provider_strategy(&self) -> Vec<CapacityProviderConfig> {
        self.service().capacity_providers.unwrap_or_else(|| {
            self.cluster_capacity_providers()
                .into_iter()
                .take(1)
                .map(|name| CapacityProviderConfig {
                    capacity_provider: name,
                    base: Some(1),
                    weight: Some(1),
                })
                .collect()
        })
    }

    pub fn circuit_breaker(&self) -> Option<CircuitBreakerConfig> {
        self.service().circuit_breaker.filter(|cb| cb.enable)
    }
}

fn validate_health_check(check: &HealthCheckValues) -> Result<(), ConfigError> {
    match check.command.first().map(String::as_str) {
        Some("CMD-SHELL") if check.command.len() == 2 => {}
        Some("CMD") if check.command.len() >= 2 => {}
        _ => {
            return Err(invalid(
                "elastic.healthCheck.command",
                "expected [\"CMD-SHELL\", <script>], [\"CMD\", <args>..] or [\"NONE\"]",
            ));
        }
    }
    if !(5..=300).contains(&check.interval_secs) {
        return Err(invalid("elastic.healthCheck.interval", "must be 5-300 seconds"));
    }
    if !(2..=60).contains(&check.timeout_secs) {
        return Err(invalid("elastic.healthCheck.timeout", "must be 2-60 seconds"));
    }
    if check.timeout_secs >= check.interval_secs {
        return Err(invalid(
            "elastic.healthCheck.timeout",
            "must be shorter than the interval",
        ));
    }
    if !(1..=10).contains(&check.retries) {
        return Err(invalid("elastic.healthCheck.retries", "must be 1-10"));
    }
    if check.start_period_secs > 300 {
        return Err(invalid("elastic.healthCheck.startPeriod", "must be 0-300 seconds"));
    }
    Ok(())
}

fn validate_placement(placement: &PlacementConfig) -> Result<(), ConfigError> {
    match (placement.kind.as_str(), placement.field.as_deref()) {
        ("random", _) => Ok(()),
        ("spread", Some("instanceId" | "host")) => Ok(()),
        ("spread", Some(field)) if field.starts_with("attribute:") && field.len() > 10 => Ok(()),
        ("spread", _) => Err(invalid(
            "service.placement.field",
            "spread needs instanceId or attribute:<name>",
        )),
        ("binpack", Some("memory" | "cpu")) => Ok(()),
        ("binpack", _) => Err(invalid("service.placement.field", "binpack needs memory or cpu")),
        (other, _) => Err(invalid(
            "service.placement.type",
            format!("unknown strategy {other:?}"),
        )),
    }
}
