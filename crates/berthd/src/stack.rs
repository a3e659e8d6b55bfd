//! `berth.toml` → stack declaration.
//!
//! The declaration is what `plan` prints, what `apply` submits and what
//! `standalone --config` applies at startup.

use std::path::Path;

use berth_core::BerthConfig;
use berth_core::config::{ConfigError, PlacementConfig, parse_member_of};
use berth_state::{
    BinpackResource, CapacityProviderStrategyItem, CircuitBreaker, ClusterInput, ContainerDefinition,
    DeploymentConfiguration, EnvVar, HealthCheckSpec, NetworkMode, PlacementConstraint, PlacementStrategy,
    PortMapping, Protocol, ServiceDeclaration, StackDeclaration, TaskDefinitionInput,
};

/// Read, validate and convert a config file.
pub fn load(path: &Path) -> Result<StackDeclaration, ConfigError> {
    declaration(&BerthConfig::from_file(path)?)
}

/// Validate `config` and build the stack it describes.
pub fn declaration(config: &BerthConfig) -> Result<StackDeclaration, ConfigError> {
    config.validate()?;

    let network_mode = match config.network_mode().as_str() {
        "bridge" => NetworkMode::Bridge,
        _ => NetworkMode::Host,
    };
    let protocol = match config.protocol().as_str() {
        "udp" => Protocol::Udp,
        _ => Protocol::Tcp,
    };
    let host_port = match config.host_port() {
        0 => None,
        port => Some(port),
    };

    let container = ContainerDefinition {
        name: config.container_name()?,
        image: config.image()?.to_string(),
        port_mappings: vec![PortMapping {
            container_port: config.container_port(),
            host_port,
            protocol,
        }],
        memory: Some(config.memory()),
        memory_reservation: Some(config.memory_reservation()),
        cpu: config.cpu(),
        environment: config
            .envs()
            .into_iter()
            .map(|env| EnvVar {
                key: env.key,
                value: env.value,
            })
            .collect(),
        essential: true,
        health_check: config.health_check().map(|check| HealthCheckSpec {
            command: check.command,
            interval_secs: check.interval_secs,
            timeout_secs: check.timeout_secs,
            retries: check.retries,
            start_period_secs: check.start_period_secs,
        }),
    };

    let placement_strategy = config
        .placement()
        .iter()
        .map(placement_strategy)
        .collect::<Result<Vec<_>, _>>()?;

    let mut placement_constraints = Vec::new();
    for constraint in config.constraints() {
        match constraint.kind.as_str() {
            "distinctInstance" => placement_constraints.push(PlacementConstraint::DistinctInstance),
            _ => {
                let expression = constraint
                    .expression
                    .as_deref()
                    .ok_or(ConfigError::Missing("service.constraints.expression"))?;
                let (attribute, value) = parse_member_of(expression).ok_or_else(|| ConfigError::Invalid {
                    key: "service.constraints.expression",
                    reason: format!("{expression:?} is not `attribute:<name> == <value>`"),
                })?;
                placement_constraints.push(PlacementConstraint::MemberOf { attribute, value });
            }
        }
    }

    let capacity_provider_strategy = config
        .capacity_provider_strategy()
        .into_iter()
        .map(|item| CapacityProviderStrategyItem {
            capacity_provider: item.capacity_provider,
            base: item.base.unwrap_or(0),
            weight: item.weight.unwrap_or(1),
        })
        .collect();

    Ok(StackDeclaration {
        cluster: ClusterInput {
            name: config.cluster_name()?,
            capacity_providers: config.cluster_capacity_providers(),
        },
        task_definition: TaskDefinitionInput {
            family: config.family()?,
            network_mode,
            containers: vec![container],
        },
        service: ServiceDeclaration {
            name: config.service_name()?,
            desired_count: config.desired_count(),
            placement_strategy,
            placement_constraints,
            capacity_provider_strategy,
            deployment_configuration: DeploymentConfiguration {
                minimum_healthy_percent: config.minimum_healthy_percent(),
                maximum_percent: config.maximum_percent(),
                circuit_breaker: config.circuit_breaker().map(|cb| CircuitBreaker {
                    enable: cb.enable,
                    rollback: cb.rollback,
                }),
            },
        },
    })
}

fn placement_strategy(placement: &PlacementConfig) -> Result<PlacementStrategy, ConfigError> {
    match (placement.kind.as_str(), placement.field.as_deref()) {
        ("random", _) => Ok(PlacementStrategy::Random),
        ("spread", Some("host")) => Ok(PlacementStrategy::Spread {
            field: "instanceId".to_string(),
        }),
        ("spread", Some(field)) => Ok(PlacementStrategy::Spread {
            field: field.to_string(),
        }),
        ("binpack", Some("memory")) => Ok(PlacementStrategy::Binpack {
            field: BinpackResource::Memory,
        }),
        ("binpack", Some("cpu")) => Ok(PlacementStrategy::Binpack {
            field: BinpackResource::Cpu,
        }),
        (kind, _) => Err(ConfigError::Invalid {
            key: "service.placement",
            reason: format!("cannot place with {kind:?}"),
        }),
    }
}
