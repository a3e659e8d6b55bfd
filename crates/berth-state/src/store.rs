//! StateStore: redb-backed desired-state persistence for Berth.
//!
//! Typed operations over clusters, task definitions, versioned services,
//! tasks, hosts, deployments, service events and host command queues.
//! Multi-record operations (service versioning, event sequencing, command
//! draining) run inside a single write transaction.

use std::path::Path;
use std::sync::Arc;

use berth_core::{Arn, ImageRef, validate_name};
use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

/// All values whose key starts with `prefix`, in key order.
fn scan<T, R>(table: &R, prefix: &str) -> StateResult<Vec<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.range(prefix..).map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if !key.value().starts_with(prefix) {
            break;
        }
        results.push(decode(value.value())?);
    }
    Ok(results)
}

fn scan_keys<R>(table: &R, prefix: &str) -> StateResult<Vec<String>>
where
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut keys = Vec::new();
    for entry in table.range(prefix..).map_err(map_err!(Read))? {
        let (key, _) = entry.map_err(map_err!(Read))?;
        if !key.value().starts_with(prefix) {
            break;
        }
        keys.push(key.value().to_string());
    }
    Ok(keys)
}

fn lookup<T, R>(table: &R, key: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

/// Next sequence number under `{prefix}{sequence:020}` keys.
fn next_sequence<R>(table: &R, prefix: &str) -> StateResult<u64>
where
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let last = scan_keys(table, prefix)?
        .last()
        .and_then(|key| key[prefix.len()..].parse::<u64>().ok())
        .unwrap_or(0);
    Ok(last + 1)
}

fn invalid(reason: impl std::fmt::Display) -> StateError {
    StateError::Invalid(reason.to_string())
}

/// Thread-safe desired-state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for table in [
            CLUSTERS,
            TASK_DEFINITIONS,
            SERVICES,
            SERVICE_VERSIONS,
            TASKS,
            HOSTS,
            DEPLOYMENTS,
            SERVICE_EVENTS,
            HOST_COMMANDS,
        ] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic access ─────────────────────────────────────────────

    fn put<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = encode(value)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        lookup(&t, key)
    }

    fn list<T: DeserializeOwned>(&self, table: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        scan(&t, prefix)
    }

    fn remove(&self, table: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Clusters ───────────────────────────────────────────────────

    pub fn put_cluster(&self, cluster: &Cluster) -> StateResult<()> {
        self.put(CLUSTERS, &cluster.name, cluster)?;
        debug!(cluster = %cluster.name, "cluster stored");
        Ok(())
    }

    /// Create a cluster, or update the capacity providers of an existing one.
    pub fn create_cluster(&self, input: &ClusterInput) -> StateResult<Cluster> {
        validate_name("cluster.name", &input.name).map_err(invalid)?;
        let mut providers = input.capacity_providers.clone();
        if providers.is_empty() {
            providers.push("default".to_string());
        }
        for provider in &providers {
            validate_name("capacity_provider", provider).map_err(invalid)?;
        }

        if let Some(mut existing) = self.get_cluster(&input.name)? {
            if existing.capacity_providers != providers {
                existing.capacity_providers = providers;
                self.put_cluster(&existing)?;
            }
            return Ok(existing);
        }

        let cluster = Cluster {
            name: input.name.clone(),
            arn: Arn::cluster(&input.name).to_string(),
            capacity_providers: providers,
            created_at: epoch_secs(),
        };
        self.put_cluster(&cluster)?;
        info!(cluster = %cluster.name, "cluster created");
        Ok(cluster)
    }

    pub fn get_cluster(&self, name: &str) -> StateResult<Option<Cluster>> {
        self.get(CLUSTERS, name)
    }

    pub fn list_clusters(&self) -> StateResult<Vec<Cluster>> {
        self.list(CLUSTERS, "")
    }

    /// Delete a cluster. Fails while it still has services or hosts.
    pub fn delete_cluster(&self, name: &str) -> StateResult<bool> {
        if !self.list_services(name)?.is_empty() {
            return Err(invalid(format!("cluster {name} still has services")));
        }
        if !self.list_hosts(name)?.is_empty() {
            return Err(invalid(format!("cluster {name} still has registered hosts")));
        }
        let existed = self.remove(CLUSTERS, name)?;
        debug!(cluster = %name, existed, "cluster deleted");
        Ok(existed)
    }

    // ── Task definitions ───────────────────────────────────────────

    /// Register a task definition revision.
    ///
    /// Content identical to the latest revision of the family returns that
    /// revision unchanged.
    pub fn register_task_definition(
        &self,
        input: &TaskDefinitionInput,
    ) -> StateResult<TaskDefinition> {
        validate_task_definition(input)?;
        let fingerprint = hex::encode(Sha256::digest(encode(input)?));
        let prefix = format!("{}:", input.family);

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let definition = {
            let mut table = txn.open_table(TASK_DEFINITIONS).map_err(map_err!(Table))?;
            let latest = scan::<TaskDefinition, _>(&table, &prefix)?.pop();
            if let Some(latest) = latest.as_ref().filter(|d| d.fingerprint == fingerprint) {
                debug!(reference = %latest.reference(), "task definition unchanged");
                return Ok(latest.clone());
            }
            let revision = latest.map(|d| d.revision + 1).unwrap_or(1);
            let definition = TaskDefinition {
                family: input.family.clone(),
                revision,
                arn: Arn::task_definition(&input.family, revision).to_string(),
                network_mode: input.network_mode,
                containers: input.containers.clone(),
                fingerprint,
                registered_at: epoch_secs(),
            };
            let bytes = encode(&definition)?;
            table
                .insert(definition.table_key().as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
            definition
        };
        txn.commit().map_err(map_err!(Transaction))?;
        info!(reference = %definition.reference(), "task definition registered");
        Ok(definition)
    }

    /// Look up a `family:revision` reference.
    pub fn get_task_definition(&self, reference: &str) -> StateResult<Option<TaskDefinition>> {
        let Some((family, revision)) = parse_task_definition_ref(reference) else {
            return Err(invalid(format!(
                "task definition reference {reference:?} is not family:revision"
            )));
        };
        self.get(TASK_DEFINITIONS, &task_definition_key(family, revision))
    }

    pub fn latest_task_definition(&self, family: &str) -> StateResult<Option<TaskDefinition>> {
        Ok(self.list_task_definition_revisions(family)?.pop())
    }

    /// All revisions of a family, oldest first.
    pub fn list_task_definition_revisions(
        &self,
        family: &str,
    ) -> StateResult<Vec<TaskDefinition>> {
        self.list(TASK_DEFINITIONS, &format!("{family}:"))
    }

    // ── Services ───────────────────────────────────────────────────

    /// Submit a service declaration.
    ///
    /// Content that differs from the current version is stored as the next
    /// version; identical content returns the current version.
    pub fn submit_service(&self, input: &ServiceInput) -> StateResult<ServiceSpec> {
        self.write_service_version(input, ServiceStatus::Active)
    }

    fn write_service_version(
        &self,
        input: &ServiceInput,
        status: ServiceStatus,
    ) -> StateResult<ServiceSpec> {
        validate_name("service.name", &input.name).map_err(invalid)?;
        input.deployment_configuration.validate().map_err(invalid)?;
        let key = service_key(&input.cluster, &input.name);

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let spec = {
            let clusters = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
            let cluster: Cluster = lookup(&clusters, &input.cluster)?
                .ok_or_else(|| StateError::NotFound(format!("cluster {}", input.cluster)))?;

            let definitions = txn.open_table(TASK_DEFINITIONS).map_err(map_err!(Table))?;
            let (family, revision) = parse_task_definition_ref(&input.task_definition)
                .ok_or_else(|| {
                    invalid(format!(
                        "task definition reference {:?} is not family:revision",
                        input.task_definition
                    ))
                })?;
            if lookup::<TaskDefinition, _>(&definitions, &task_definition_key(family, revision))?
                .is_none()
            {
                return Err(StateError::NotFound(format!(
                    "task definition {}",
                    input.task_definition
                )));
            }

            for item in &input.capacity_provider_strategy {
                if !cluster.capacity_providers.contains(&item.capacity_provider) {
                    return Err(invalid(format!(
                        "capacity provider {} is not associated with cluster {}",
                        item.capacity_provider, cluster.name
                    )));
                }
            }

            let mut services = txn.open_table(SERVICES).map_err(map_err!(Table))?;
            let current: Option<ServiceSpec> = lookup(&services, &key)?;
            if let Some(current) = &current {
                let unchanged = match status {
                    ServiceStatus::Active => current.matches(input),
                    ServiceStatus::Draining => current.status == ServiceStatus::Draining,
                };
                if unchanged {
                    return Ok(current.clone());
                }
            }

            let now = epoch_secs();
            let spec = ServiceSpec {
                cluster: input.cluster.clone(),
                name: input.name.clone(),
                arn: Arn::service(&input.cluster, &input.name).to_string(),
                version: current.as_ref().map(|c| c.version + 1).unwrap_or(1),
                task_definition: input.task_definition.clone(),
                desired_count: input.desired_count,
                placement_strategy: input.placement_strategy.clone(),
                placement_constraints: input.placement_constraints.clone(),
                capacity_provider_strategy: input.capacity_provider_strategy.clone(),
                deployment_configuration: input.deployment_configuration,
                status,
                created_at: current.as_ref().map(|c| c.created_at).unwrap_or(now),
                updated_at: now,
            };
            let bytes = encode(&spec)?;
            services
                .insert(key.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
            let mut versions = txn.open_table(SERVICE_VERSIONS).map_err(map_err!(Table))?;
            versions
                .insert(spec.version_key().as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
            spec
        };
        txn.commit().map_err(map_err!(Transaction))?;
        info!(
            service = %key,
            version = spec.version,
            task_definition = %spec.task_definition,
            desired = spec.desired_count,
            "service version stored"
        );
        Ok(spec)
    }

    pub fn get_service(&self, cluster: &str, name: &str) -> StateResult<Option<ServiceSpec>> {
        self.get(SERVICES, &service_key(cluster, name))
    }

    pub fn get_service_version(
        &self,
        cluster: &str,
        name: &str,
        version: u64,
    ) -> StateResult<Option<ServiceSpec>> {
        self.get(SERVICE_VERSIONS, &versioned_key(cluster, name, version))
    }

    /// Every stored version of a service, oldest first.
    pub fn list_service_versions(&self, cluster: &str, name: &str) -> StateResult<Vec<ServiceSpec>> {
        self.list(SERVICE_VERSIONS, &format!("{}@", service_key(cluster, name)))
    }

    pub fn list_services(&self, cluster: &str) -> StateResult<Vec<ServiceSpec>> {
        self.list(SERVICES, &format!("{cluster}/"))
    }

    pub fn list_all_services(&self) -> StateResult<Vec<ServiceSpec>> {
        self.list(SERVICES, "")
    }

    /// Change the desired count; stored as a new version.
    pub fn set_desired_count(
        &self,
        cluster: &str,
        name: &str,
        desired_count: u32,
    ) -> StateResult<ServiceSpec> {
        let current = self
            .get_service(cluster, name)?
            .ok_or_else(|| StateError::NotFound(format!("service {cluster}/{name}")))?;
        if current.status == ServiceStatus::Draining {
            return Err(invalid(format!("service {cluster}/{name} is being deleted")));
        }
        let mut input = current.to_input();
        input.desired_count = desired_count;
        self.submit_service(&input)
    }

    /// Mark a service for deletion: desired count 0, status draining.
    pub fn delete_service(&self, cluster: &str, name: &str) -> StateResult<ServiceSpec> {
        let current = self
            .get_service(cluster, name)?
            .ok_or_else(|| StateError::NotFound(format!("service {cluster}/{name}")))?;
        let mut input = current.to_input();
        input.desired_count = 0;
        self.write_service_version(&input, ServiceStatus::Draining)
    }

    /// Remove every record of a service.
    pub fn purge_service(&self, cluster: &str, name: &str) -> StateResult<()> {
        let key = service_key(cluster, name);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut services = txn.open_table(SERVICES).map_err(map_err!(Table))?;
            services.remove(key.as_str()).map_err(map_err!(Write))?;
            for (table, prefix) in [
                (SERVICE_VERSIONS, format!("{key}@")),
                (DEPLOYMENTS, format!("{key}@")),
                (TASKS, format!("{key}:")),
                (SERVICE_EVENTS, format!("{key}#")),
            ] {
                let mut t = txn.open_table(table).map_err(map_err!(Table))?;
                for k in scan_keys(&t, &prefix)? {
                    t.remove(k.as_str()).map_err(map_err!(Write))?;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        info!(service = %key, "service purged");
        Ok(())
    }

    // ── Tasks ──────────────────────────────────────────────────────

    pub fn put_task(&self, task: &TaskInstance) -> StateResult<()> {
        self.put(TASKS, &task.table_key(), task)
    }

    /// Read, modify and write one task in a single write transaction.
    ///
    /// `f` sees the stored record and returns whether it changed it.
    /// Returns the written task; `None` when the task is missing or `f`
    /// left it unchanged.
    pub fn update_task<F>(&self, key: &str, f: F) -> StateResult<Option<TaskInstance>>
    where
        F: FnOnce(&mut TaskInstance) -> bool,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated = {
            let mut table = txn.open_table(TASKS).map_err(map_err!(Table))?;
            let current: Option<TaskInstance> = lookup(&table, key)?;
            match current {
                Some(mut task) => {
                    if f(&mut task) {
                        let bytes = encode(&task)?;
                        table.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
                        Some(task)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        if updated.is_some() {
            txn.commit().map_err(map_err!(Transaction))?;
        } else {
            txn.abort().map_err(map_err!(Transaction))?;
        }
        Ok(updated)
    }

    pub fn get_task(
        &self,
        cluster: &str,
        service: &str,
        task_id: &str,
    ) -> StateResult<Option<TaskInstance>> {
        self.get(TASKS, &task_key(cluster, service, task_id))
    }

    pub fn list_tasks_for_service(
        &self,
        cluster: &str,
        service: &str,
    ) -> StateResult<Vec<TaskInstance>> {
        self.list(TASKS, &format!("{}:", service_key(cluster, service)))
    }

    pub fn list_tasks_for_cluster(&self, cluster: &str) -> StateResult<Vec<TaskInstance>> {
        self.list(TASKS, &format!("{cluster}/"))
    }

    pub fn list_tasks_on_host(&self, host_id: &str) -> StateResult<Vec<TaskInstance>> {
        let tasks: Vec<TaskInstance> = self.list(TASKS, "")?;
        Ok(tasks
            .into_iter()
            .filter(|t| t.host_id.as_deref() == Some(host_id))
            .collect())
    }

    pub fn delete_task(&self, task: &TaskInstance) -> StateResult<bool> {
        self.remove(TASKS, &task.table_key())
    }

    // ── Hosts ──────────────────────────────────────────────────────

    pub fn put_host(&self, host: &HostNode) -> StateResult<()> {
        self.put(HOSTS, &host.id, host)
    }

    pub fn get_host(&self, host_id: &str) -> StateResult<Option<HostNode>> {
        self.get(HOSTS, host_id)
    }

    pub fn list_hosts(&self, cluster: &str) -> StateResult<Vec<HostNode>> {
        Ok(self
            .list_all_hosts()?
            .into_iter()
            .filter(|h| h.cluster == cluster)
            .collect())
    }

    pub fn list_all_hosts(&self) -> StateResult<Vec<HostNode>> {
        self.list(HOSTS, "")
    }

    pub fn delete_host(&self, host_id: &str) -> StateResult<bool> {
        self.remove(HOSTS, host_id)
    }

    // ── Deployments ────────────────────────────────────────────────

    pub fn put_deployment(&self, deployment: &Deployment) -> StateResult<()> {
        self.put(DEPLOYMENTS, &deployment.table_key(), deployment)
    }

    pub fn get_deployment(
        &self,
        cluster: &str,
        service: &str,
        version: u64,
    ) -> StateResult<Option<Deployment>> {
        self.get(DEPLOYMENTS, &versioned_key(cluster, service, version))
    }

    /// Deployments of a service, oldest version first.
    pub fn list_deployments(&self, cluster: &str, service: &str) -> StateResult<Vec<Deployment>> {
        self.list(DEPLOYMENTS, &format!("{}@", service_key(cluster, service)))
    }

    // ── Events ─────────────────────────────────────────────────────

    pub fn append_event(
        &self,
        cluster: &str,
        service: &str,
        message: impl Into<String>,
    ) -> StateResult<ServiceEvent> {
        let prefix = format!("{}#", service_key(cluster, service));
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let event = {
            let mut table = txn.open_table(SERVICE_EVENTS).map_err(map_err!(Table))?;
            let event = ServiceEvent {
                cluster: cluster.to_string(),
                service: service.to_string(),
                sequence: next_sequence(&table, &prefix)?,
                message: message.into(),
                created_at: epoch_secs(),
            };
            let key = format!("{prefix}{:020}", event.sequence);
            let bytes = encode(&event)?;
            table
                .insert(key.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
            event
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%cluster, %service, message = %event.message, "service event");
        Ok(event)
    }

    /// The most recent events of a service, newest first.
    pub fn list_events(
        &self,
        cluster: &str,
        service: &str,
        limit: usize,
    ) -> StateResult<Vec<ServiceEvent>> {
        let mut events: Vec<ServiceEvent> =
            self.list(SERVICE_EVENTS, &format!("{}#", service_key(cluster, service)))?;
        events.reverse();
        events.truncate(limit);
        Ok(events)
    }

    // ── Host commands ──────────────────────────────────────────────

    pub fn enqueue_command(&self, host_id: &str, command: &HostCommand) -> StateResult<()> {
        let prefix = format!("{host_id}#");
        let bytes = encode(command)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(HOST_COMMANDS).map_err(map_err!(Table))?;
            let key = format!("{prefix}{:020}", next_sequence(&table, &prefix)?);
            table
                .insert(key.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Take every queued command for a host, oldest first.
    pub fn drain_commands(&self, host_id: &str) -> StateResult<Vec<HostCommand>> {
        let prefix = format!("{host_id}#");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let commands = {
            let mut table = txn.open_table(HOST_COMMANDS).map_err(map_err!(Table))?;
            let commands: Vec<HostCommand> = scan(&table, &prefix)?;
            for key in scan_keys(&table, &prefix)? {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            commands
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(commands)
    }

    // ── Stack ──────────────────────────────────────────────────────

    /// Provision a cluster, task definition and service in one call.
    pub fn apply_stack(&self, stack: &StackDeclaration) -> StateResult<StackOutputs> {
        let cluster = self.create_cluster(&stack.cluster)?;
        let definition = self.register_task_definition(&stack.task_definition)?;
        let service = self.submit_service(
            &stack
                .service
                .clone()
                .into_input(&cluster.name, &definition.reference()),
        )?;
        Ok(StackOutputs {
            cluster_arn: cluster.arn,
            task_definition_arn: definition.arn,
            service_arn: service.arn,
            service_version: service.version,
        })
    }
}

fn validate_task_definition(input: &TaskDefinitionInput) -> StateResult<()> {
    validate_name("family", &input.family).map_err(invalid)?;
    if input.containers.is_empty() {
        return Err(invalid("a task definition needs at least one container"));
    }
    if !input.containers.iter().any(|c| c.essential) {
        return Err(invalid("a task definition needs an essential container"));
    }
    let mut names = std::collections::BTreeSet::new();
    let mut ports = std::collections::BTreeSet::new();
    for container in &input.containers {
        validate_name("container.name", &container.name).map_err(invalid)?;
        if !names.insert(container.name.as_str()) {
            return Err(invalid(format!("duplicate container name {}", container.name)));
        }
        ImageRef::parse(&container.image)
            .map_err(|e| invalid(format!("container {}: {e}", container.name)))?;
        if let Some(check) = &container.health_check {
            check
                .validate()
                .map_err(|e| invalid(format!("container {}: {e}", container.name)))?;
        }
        if let (Some(reservation), Some(limit)) = (container.memory_reservation, container.memory)
            && reservation > limit
        {
            return Err(invalid(format!(
                "container {}: memory reservation exceeds the hard limit",
                container.name
            )));
        }
        for mapping in &container.port_mappings {
            if input.network_mode == NetworkMode::Host
                && mapping.host_port.is_some_and(|p| p != mapping.container_port)
            {
                return Err(invalid(format!(
                    "container {}: host network mode requires hostPort == containerPort",
                    container.name
                )));
            }
            if let Some(port) = mapping.reserved_host_port(input.network_mode)
                && !ports.insert(port)
            {
                return Err(invalid(format!("host port {} declared twice", port.port)));
            }
        }
    }
    Ok(())
}
