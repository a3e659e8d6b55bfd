//! Resource identifiers handed back to callers after provisioning.
//!
//! Format: `arn:berth:<kind>/<path>`, e.g. `arn:berth:service/demo/nginx-svc`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const PREFIX: &str = "arn:berth:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Cluster,
    TaskDefinition,
    Service,
    Task,
    Host,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Cluster => "cluster",
            ResourceKind::TaskDefinition => "task-definition",
            ResourceKind::Service => "service",
            ResourceKind::Task => "task",
            ResourceKind::Host => "host",
        }
    }
}

impl FromStr for ResourceKind {
    type Err = ArnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cluster" => Ok(ResourceKind::Cluster),
            "task-definition" => Ok(ResourceKind::TaskDefinition),
            "service" => Ok(ResourceKind::Service),
            "task" => Ok(ResourceKind::Task),
            "host" => Ok(ResourceKind::Host),
            other => Err(ArnError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArnError {
    #[error("missing `arn:berth:` prefix: {0}")]
    MissingPrefix(String),
    #[error("unknown resource kind: {0}")]
    UnknownKind(String),
    #[error("malformed resource path: {0}")]
    MalformedPath(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Arn {
    kind: ResourceKind,
    path: String,
}

impl Arn {
    pub fn cluster(name: &str) -> Self {
        Self::new(ResourceKind::Cluster, name.to_string())
    }

    pub fn task_definition(family: &str, revision: u32) -> Self {
        Self::new(ResourceKind::TaskDefinition, format!("{family}:{revision}"))
    }

    pub fn service(cluster: &str, name: &str) -> Self {
        Self::new(ResourceKind::Service, format!("{cluster}/{name}"))
    }

    pub fn task(cluster: &str, task_id: &str) -> Self {
        Self::new(ResourceKind::Task, format!("{cluster}/{task_id}"))
    }

    pub fn host(cluster: &str, host_id: &str) -> Self {
        Self::new(ResourceKind::Host, format!("{cluster}/{host_id}"))
    }

    fn new(kind: ResourceKind, path: String) -> Self {
        Self { kind, path }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Everything after `<kind>/`.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn parse(s: &str) -> Result<Self, ArnError> {
        let rest = s
            .strip_prefix(PREFIX)
            .ok_or_else(|| ArnError::MissingPrefix(s.to_string()))?;
        let (kind, path) = rest
            .split_once('/')
            .ok_or_else(|| ArnError::MalformedPath(s.to_string()))?;
        if path.is_empty() || path.split('/').any(str::is_empty) {
            return Err(ArnError::MalformedPath(s.to_string()));
        }
        Ok(Self::new(kind.parse()?, path.to_string()))
    }
}

impl fmt::Display for Arn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PREFIX}{}/{}", self.kind.as_str(), self.path)
    }
}

impl FromStr for Arn {
    type Err = ArnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Arn::parse(s)
    }
}

impl From<Arn> for String {
    fn from(arn: Arn) -> Self {
        arn.to_string()
    }
}

impl TryFrom<String> for Arn {
    type Error = ArnError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Arn::parse(&value)
    }
}
