//! The container server: lifecycle engine and startup rehydration.
//!
//! [`ContainerServer`] ties the pieces together (identifier indices,
//! the in-memory state store, per-entity on-disk state, the OCI runtime
//! mediator, and the exit-file watcher) and exposes the
//! version-agnostic CRI verbs the transport layer calls into.
//!
//! Durable state is the tree of per-entity directories: at startup the
//! server scans them, loads sandboxes before containers, skips anything
//! another manager owns, and rebuilds exactly one in-memory object per
//! managed directory.

mod checkpoint;
mod container;
mod sandbox;

pub use checkpoint::{
    CheckpointMetadata, CheckpointOptions, Compression, RestoreRequest, RestoreResult,
};
pub use container::{ContainerConfig, ContainerStatusInfo, DeviceMount};
pub use sandbox::{SandboxConfig, SandboxStatusInfo};

use crate::annotations::{self, CONTAINER_TYPE_CONTAINER, CONTAINER_TYPE_SANDBOX};
use crate::config::Config;
use crate::constants::CONFIG_FILE;
use crate::container::{Container, ContainerParams, ContainerStatus};
use crate::error::{Error, Result};
use crate::index::{NameRegistrar, TruncIndex};
use crate::oci::exits::{drain_exit_dir, ExitMonitor};
use crate::oci::OciRuntime;
use crate::sandbox::namespaces::NamespaceKind;
use crate::sandbox::{Sandbox, SandboxParams, SandboxState};
use crate::state::StateStore;
use crate::storage::{atomic_write_json, read_json, ContainerStorage};
use rand::RngCore;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// The daemon core serving sandbox and container lifecycle requests.
pub struct ContainerServer {
    config: Arc<Config>,
    storage: ContainerStorage,
    runtime: OciRuntime,
    state: Arc<StateStore>,
    pod_name_index: NameRegistrar,
    pod_id_index: TruncIndex,
    ctr_name_index: NameRegistrar,
    ctr_id_index: TruncIndex,
    exit_monitor: Mutex<Option<ExitMonitor>>,
}

impl ContainerServer {
    /// Builds the server and starts the exit-file watcher.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let storage = ContainerStorage::new(&config)?;
        std::fs::create_dir_all(&config.namespaces_dir)?;
        std::fs::create_dir_all(&config.exits_dir)?;

        let state = Arc::new(StateStore::new());
        let exit_monitor = ExitMonitor::spawn(config.exits_dir.clone(), state.clone())?;

        Ok(Self {
            runtime: OciRuntime::new(config.clone()),
            storage,
            state,
            pod_name_index: NameRegistrar::new(),
            pod_id_index: TruncIndex::new(config.min_id_prefix_len),
            ctr_name_index: NameRegistrar::new(),
            ctr_id_index: TruncIndex::new(config.min_id_prefix_len),
            exit_monitor: Mutex::new(Some(exit_monitor)),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn state_store(&self) -> &StateStore {
        &self.state
    }

    pub(crate) fn storage(&self) -> &ContainerStorage {
        &self.storage
    }

    pub(crate) fn runtime(&self) -> &OciRuntime {
        &self.runtime
    }

    /// Generates a fresh 64-hex entity id.
    pub(crate) fn generate_id() -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    // =========================================================================
    // Name and ID Resolution
    // =========================================================================

    pub(crate) fn reserve_pod_name(&self, id: &str, name: &str) -> Result<()> {
        self.pod_name_index.reserve(name, id).map_err(|e| {
            warn!("error reserving pod name {name} for id {id}: {e}");
            e
        })
    }

    pub(crate) fn release_pod_name(&self, name: &str) {
        self.pod_name_index.release(name);
    }

    pub(crate) fn reserve_container_name(&self, id: &str, name: &str) -> Result<()> {
        self.ctr_name_index.reserve(name, id).map_err(|e| {
            warn!("error reserving ctr name {name} for id {id}: {e}");
            e
        })
    }

    pub(crate) fn release_container_name(&self, name: &str) {
        self.ctr_name_index.release(name);
    }

    pub(crate) fn pod_id_index(&self) -> &TruncIndex {
        &self.pod_id_index
    }

    pub(crate) fn ctr_id_index(&self) -> &TruncIndex {
        &self.ctr_id_index
    }

    /// Resolves a full or truncated sandbox id to a live sandbox.
    pub fn resolve_sandbox(&self, id: &str) -> Result<Arc<Sandbox>> {
        let full = self.pod_id_index.get(id)?;
        self.state
            .get_sandbox(&full)
            .ok_or_else(|| Error::not_found("sandbox", id))
    }

    /// Resolves a full or truncated container id to a live container.
    pub fn resolve_container(&self, id: &str) -> Result<Arc<Container>> {
        let full = self.ctr_id_index.get(id)?;
        self.state
            .get_any_container(&full)
            .ok_or_else(|| Error::not_found("container", id))
    }

    // =========================================================================
    // State Persistence
    // =========================================================================

    /// Refreshes a container's state from the runtime and writes it to
    /// disk. A refresh failure is logged, not fatal: the recorded state
    /// still gets persisted.
    pub(crate) async fn container_state_to_disk(&self, ctr: &Container) -> Result<()> {
        if let Err(e) = self.runtime.refresh_status(ctr).await {
            warn!("error updating the container status {}: {e}", ctr.id());
        }
        atomic_write_json(&ctr.state_path(), &ctr.state())
    }

    /// Rebuilds a container's state from disk and the runtime.
    pub(crate) async fn container_state_from_disk(&self, ctr: &Container) -> Result<()> {
        if let Ok(state) = read_json(&ctr.state_path()) {
            ctr.restore_state(state);
        }
        self.runtime.refresh_status(ctr).await?;
        Ok(())
    }

    /// Stops a container and waits until it is observed STOPPED.
    pub async fn stop_container_and_wait(&self, ctr: &Container, timeout: i64) -> Result<()> {
        self.runtime.stop(ctr, timeout).await.map_err(|e| {
            Error::Internal(format!("failed to stop container {}: {e}", ctr.name()))
        })?;
        self.runtime.wait_stopped(ctr).await.map_err(|e| {
            Error::Internal(format!(
                "failed to get container 'stopped' status {}: {e}",
                ctr.name()
            ))
        })
    }

    // =========================================================================
    // Startup Rehydration
    // =========================================================================

    /// Rebuilds in-memory state from the on-disk entity directories.
    ///
    /// Sandboxes load before containers so sandbox lookups during
    /// container load succeed. Per-entity failures are logged and the
    /// entity skipped; the daemon comes up with what it could recover.
    pub async fn load_state(&self) -> Result<()> {
        let ids = self.storage.list_entity_ids()?;
        let mut specs = Vec::new();
        for id in ids {
            let path = self.storage.config_path(&id);
            match read_json::<crate::spec::Spec>(&path) {
                Ok(spec) => specs.push((id, spec)),
                Err(e) => warn!("skipping {id}: unreadable {CONFIG_FILE}: {e}"),
            }
        }

        for (id, spec) in &specs {
            if !annotations::is_managed(spec) {
                debug!("skipping non-managed directory {id}");
                continue;
            }
            if annotations::entity_type(spec) != Some(CONTAINER_TYPE_SANDBOX) {
                continue;
            }
            if let Err(e) = self.load_sandbox(id, spec).await {
                warn!("could not load sandbox {id}: {e}");
            }
        }

        for (id, spec) in &specs {
            if !annotations::is_managed(spec) {
                continue;
            }
            if annotations::entity_type(spec) != Some(CONTAINER_TYPE_CONTAINER) {
                continue;
            }
            if let Err(e) = self.load_container(id, spec).await {
                warn!("could not load container {id}: {e}");
            }
        }

        // Exits that happened while the daemon was down.
        drain_exit_dir(&self.config.exits_dir, &self.state);

        info!(
            "loaded {} sandboxes, {} containers",
            self.state.list_sandboxes().len(),
            self.state.list_containers().len()
        );
        Ok(())
    }

    /// Loads one sandbox (and its infra container) from disk.
    async fn load_sandbox(&self, id: &str, spec: &crate::spec::Spec) -> Result<()> {
        let decoded = annotations::decode_sandbox(spec)?;
        self.reserve_pod_name(id, &decoded.name)?;

        let result = self.load_sandbox_inner(id, spec, &decoded).await;
        if result.is_err() {
            self.release_pod_name(&decoded.name);
        }
        result
    }

    async fn load_sandbox_inner(
        &self,
        id: &str,
        spec: &crate::spec::Spec,
        decoded: &annotations::DecodedSandbox,
    ) -> Result<()> {
        let sb = Arc::new(Sandbox::new(SandboxParams {
            id: id.to_string(),
            name: decoded.name.clone(),
            namespace: decoded.namespace.clone(),
            kube_name: decoded.kube_name.clone(),
            log_dir: decoded.log_dir.clone(),
            labels: decoded.labels.clone(),
            annotations: decoded.kube_annotations.clone(),
            process_label: decoded.process_label.clone(),
            mount_label: decoded.mount_label.clone(),
            metadata: decoded.metadata.clone(),
            shm_path: decoded.shm_path.clone(),
            cgroup_parent: decoded.cgroup_parent.clone(),
            privileged: decoded.privileged,
            runtime_handler: decoded.runtime_handler.clone(),
            resolv_path: decoded.resolv_path.clone(),
            hostname: decoded.hostname.clone(),
            hostname_path: decoded.hostname_path.clone(),
            port_mappings: decoded.port_mappings.clone(),
            host_network: decoded.host_network,
            namespace_options: decoded.namespace_options,
            seccomp_profile_path: decoded.seccomp_profile_path.clone(),
            created: decoded.created,
        }));

        // Rejoin pinned namespaces recorded in the spec. Paths under our
        // own namespaces dir are pins from before the restart and stay
        // managed; anything else was supplied externally. Without managed
        // lifecycles the sandbox lives in host namespaces and there is
        // nothing to rejoin.
        if self.config.manage_ns_lifecycle {
            for kind in [
                NamespaceKind::Net,
                NamespaceKind::Ipc,
                NamespaceKind::Uts,
                NamespaceKind::User,
            ] {
                if let Some(path) = spec.ns_path(kind.spec_type()) {
                    let path = Path::new(path);
                    if path.starts_with(&self.config.namespaces_dir) {
                        sb.ns_rejoin_pinned(kind, path)?;
                    } else {
                        sb.ns_join(kind, path)?;
                    }
                }
            }
        }

        self.reserve_container_name(id, &decoded.infra_name)?;
        let result = self
            .load_sandbox_infra(id, spec, decoded, &sb)
            .await;
        if result.is_err() {
            self.release_container_name(&decoded.infra_name);
        }
        result
    }

    async fn load_sandbox_infra(
        &self,
        id: &str,
        spec: &crate::spec::Spec,
        decoded: &annotations::DecodedSandbox,
        sb: &Arc<Sandbox>,
    ) -> Result<()> {
        let infra = Arc::new(Container::new(ContainerParams {
            id: id.to_string(),
            name: decoded.infra_name.clone(),
            sandbox_id: id.to_string(),
            image: String::new(),
            image_name: String::new(),
            image_ref: String::new(),
            metadata: crate::container::ContainerMetadata {
                name: decoded.infra_name.clone(),
                attempt: decoded.metadata.attempt,
            },
            run_dir: self.storage.run_dir(id),
            persistent_dir: self.storage.container_dir(id),
            log_path: String::new(),
            labels: decoded.labels.clone(),
            annotations: spec.annotations.clone(),
            kube_annotations: decoded.kube_annotations.clone(),
            mount_point: String::new(),
            volumes: Vec::new(),
            spec: spec.clone(),
            tty: false,
            stdin: false,
            stdin_once: false,
            runtime_handler: decoded.runtime_handler.clone(),
            created: decoded.created,
            stop_signal: String::new(),
            seccomp_profile_path: decoded.seccomp_profile_path.clone(),
        }));

        self.container_state_from_disk(&infra).await?;
        // Write back: an exit may have happened while the daemon was down
        // and only the refreshed state knows about it.
        self.container_state_to_disk(&infra).await?;

        if infra.status() == ContainerStatus::Stopped {
            sb.set_state(SandboxState::Stopped);
        }

        sb.set_infra_container(infra.clone())?;
        if self.config.selinux_enabled {
            self.state
                .reserve_mcs_level(&crate::state::mcs_level_of(&decoded.process_label))?;
        }
        self.state.add_sandbox(sb.clone())?;
        self.state.add_infra_container(infra)?;
        self.pod_id_index.add(id)?;
        self.ctr_id_index.add(id)?;
        debug!("loaded sandbox {id} ({})", decoded.name);
        Ok(())
    }

    /// Loads one workload container from disk.
    async fn load_container(&self, id: &str, spec: &crate::spec::Spec) -> Result<()> {
        let decoded = annotations::decode_container(spec)?;
        let Some(_sb) = self.state.get_sandbox(&decoded.sandbox_id) else {
            return Err(Error::Internal(format!(
                "could not get sandbox with id {}, skipping",
                decoded.sandbox_id
            )));
        };

        self.reserve_container_name(id, &decoded.name)?;
        let result = self.load_container_inner(id, spec, &decoded).await;
        if result.is_err() {
            self.release_container_name(&decoded.name);
        }
        result
    }

    async fn load_container_inner(
        &self,
        id: &str,
        spec: &crate::spec::Spec,
        decoded: &annotations::DecodedContainer,
    ) -> Result<()> {
        let ctr = Arc::new(Container::new(ContainerParams {
            id: id.to_string(),
            name: decoded.name.clone(),
            sandbox_id: decoded.sandbox_id.clone(),
            image: decoded.image.clone(),
            image_name: decoded.image_name.clone(),
            image_ref: decoded.image_ref.clone(),
            metadata: decoded.metadata.clone(),
            run_dir: self.storage.run_dir(id),
            persistent_dir: self.storage.container_dir(id),
            log_path: decoded.log_path.clone(),
            labels: decoded.labels.clone(),
            annotations: spec.annotations.clone(),
            kube_annotations: decoded.kube_annotations.clone(),
            mount_point: decoded.mount_point.clone(),
            volumes: decoded.volumes.clone(),
            spec: spec.clone(),
            tty: decoded.tty,
            stdin: decoded.stdin,
            stdin_once: decoded.stdin_once,
            runtime_handler: decoded.runtime_handler.clone(),
            created: decoded.created,
            stop_signal: decoded.stop_signal.clone(),
            seccomp_profile_path: decoded.seccomp_profile_path.clone(),
        }));

        self.container_state_from_disk(&ctr).await?;
        self.container_state_to_disk(&ctr).await?;

        self.state.add_container(ctr)?;
        self.ctr_id_index.add(id)?;
        debug!("loaded container {id} ({})", decoded.name);
        Ok(())
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Persists in-memory container states and stops the exit watcher.
    ///
    /// Teardown runs behind a recover barrier: a panic from a poisoned
    /// store is logged, never propagated into the caller's exit path.
    pub fn shutdown(&self) {
        if let Some(monitor) = self.exit_monitor.lock().ok().and_then(|mut m| m.take()) {
            monitor.shutdown();
        }

        let result = catch_unwind(AssertUnwindSafe(|| {
            let mut all = self.state.list_containers();
            all.extend(self.state.list_infra_containers());
            for ctr in all {
                if let Err(e) = atomic_write_json(&ctr.state_path(), &ctr.state()) {
                    warn!("failed to persist state of {} on shutdown: {e}", ctr.id());
                }
            }
        }));
        if let Err(panic) = result {
            tracing::error!("panic during shutdown: {panic:?}");
        }
    }
}
