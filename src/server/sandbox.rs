//! Sandbox lifecycle: RunPodSandbox, StopPodSandbox, RemovePodSandbox,
//! PodSandboxStatus, ListPodSandbox.
//!
//! RunPodSandbox acquires resources in a fixed order, each step paired
//! with a compensating action; on failure the compensations run in
//! reverse so no half-materialized sandbox survives. Observers only ever
//! see the pre-state or the post-state: registration in the state store
//! is the last step, deregistration the first.

use super::ContainerServer;
use crate::annotations;
use crate::constants::{INFRA_COMMAND, SANDBOX_STOP_TIMEOUT};
use crate::container::{Container, ContainerMetadata, ContainerParams, ContainerStatus};
use crate::error::{Error, Result};
use crate::process::defunct_pids;
use crate::sandbox::namespaces::{pin_namespaces, NamespaceKind};
use crate::sandbox::{
    NamespaceOptions, PodSandboxMetadata, PortMapping, Sandbox, SandboxParams, SandboxState,
};
use crate::spec::{LinuxNamespace, Mount, Process, Root, Spec};
use crate::state::mcs_level_of;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Request / Response Types
// =============================================================================

/// Version-agnostic RunPodSandbox request.
#[derive(Debug, Clone, Default)]
pub struct SandboxConfig {
    pub metadata: PodSandboxMetadata,
    pub hostname: String,
    pub log_directory: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub port_mappings: Vec<PortMapping>,
    pub namespace_options: NamespaceOptions,
    pub privileged: bool,
    pub cgroup_parent: String,
    pub process_label: String,
    pub mount_label: String,
    pub seccomp_profile_path: String,
    pub runtime_handler: String,
    pub resolv_path: String,
    pub shm_path: String,
}

/// Point-in-time view of a sandbox.
#[derive(Debug, Clone)]
pub struct SandboxStatusInfo {
    pub id: String,
    pub name: String,
    pub metadata: PodSandboxMetadata,
    pub state: SandboxState,
    pub created_at: DateTime<Utc>,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub runtime_handler: String,
    /// Path of the pinned network namespace, when one is managed.
    pub network_namespace_path: Option<String>,
    pub container_ids: Vec<String>,
}

// =============================================================================
// Compensation Stack
// =============================================================================

/// One step's compensating action during sandbox/container creation.
pub(crate) enum Undo {
    ReleasePodName(String),
    ReleaseCtrName(String),
    DeleteDirs(String),
    RemoveNamespaces(Arc<Sandbox>),
    ReleaseMcsLevel(String),
    RuntimeDelete(Arc<Container>),
    Deregister { sandbox_id: String },
    DeregisterContainer { container_id: String },
}

impl ContainerServer {
    /// Runs compensations in reverse acquisition order.
    ///
    /// Compensation failures are logged and aggregated in the log only;
    /// they never mask the original error.
    pub(crate) async fn rollback(&self, undos: Vec<Undo>) {
        for undo in undos.into_iter().rev() {
            match undo {
                Undo::ReleasePodName(name) => self.release_pod_name(&name),
                Undo::ReleaseCtrName(name) => self.release_container_name(&name),
                Undo::DeleteDirs(id) => {
                    if let Err(e) = self.storage().delete_entity_dirs(&id) {
                        warn!("rollback: failed to delete dirs of {id}: {e}");
                    }
                }
                Undo::RemoveNamespaces(sb) => {
                    if let Err(e) = sb.remove_namespaces() {
                        warn!("rollback: failed to remove namespaces of {}: {e}", sb.id());
                    }
                }
                Undo::ReleaseMcsLevel(level) => self.state_store().release_mcs_level(&level),
                Undo::RuntimeDelete(ctr) => {
                    if let Err(e) = self.runtime().delete(&ctr).await {
                        warn!("rollback: failed to delete container {}: {e}", ctr.id());
                    }
                }
                Undo::Deregister { sandbox_id } => {
                    // Namespace and MCS compensations have their own
                    // entries on the stack; only the registration itself
                    // is undone here.
                    self.state_store().remove_infra_container(&sandbox_id);
                    self.state_store().forget_sandbox(&sandbox_id);
                    self.pod_id_index().delete(&sandbox_id);
                    self.ctr_id_index().delete(&sandbox_id);
                }
                Undo::DeregisterContainer { container_id } => {
                    self.state_store().remove_container(&container_id);
                    self.ctr_id_index().delete(&container_id);
                }
            }
        }
    }

    // =========================================================================
    // RunPodSandbox
    // =========================================================================

    /// Creates and starts a pod sandbox, returning its id.
    pub async fn run_pod_sandbox(&self, config: SandboxConfig) -> Result<String> {
        if config.metadata.name.is_empty() {
            return Err(Error::InvalidArgument(
                "sandbox metadata name is empty".to_string(),
            ));
        }

        let id = Self::generate_id();
        let mut undo = Vec::new();
        match self.run_pod_sandbox_steps(&id, config, &mut undo).await {
            Ok(()) => {
                info!("ran pod sandbox {id}");
                Ok(id)
            }
            Err(e) => {
                self.rollback(undo).await;
                Err(e)
            }
        }
    }

    async fn run_pod_sandbox_steps(
        &self,
        id: &str,
        config: SandboxConfig,
        undo: &mut Vec<Undo>,
    ) -> Result<()> {
        let meta = &config.metadata;
        let pod_name = format!(
            "k8s_{}_{}_{}_{}",
            meta.name, meta.namespace, meta.uid, meta.attempt
        );
        let infra_name = format!(
            "k8s_POD_{}_{}_{}_{}",
            meta.name, meta.namespace, meta.uid, meta.attempt
        );

        // 1. Pod name.
        self.reserve_pod_name(id, &pod_name)?;
        undo.push(Undo::ReleasePodName(pod_name.clone()));

        // 2. Directories.
        let (persistent_dir, run_dir) = self.storage().create_entity_dirs(id)?;
        undo.push(Undo::DeleteDirs(id.to_string()));

        // 3. Infra container name.
        self.reserve_container_name(id, &infra_name)?;
        undo.push(Undo::ReleaseCtrName(infra_name.clone()));

        let host_network = config.namespace_options.host_network;
        let sb = Arc::new(Sandbox::new(SandboxParams {
            id: id.to_string(),
            name: pod_name.clone(),
            namespace: meta.namespace.clone(),
            kube_name: meta.name.clone(),
            log_dir: config.log_directory.clone(),
            labels: config.labels.clone(),
            annotations: config.annotations.clone(),
            process_label: config.process_label.clone(),
            mount_label: config.mount_label.clone(),
            metadata: config.metadata.clone(),
            shm_path: config.shm_path.clone(),
            cgroup_parent: config.cgroup_parent.clone(),
            privileged: config.privileged,
            runtime_handler: config.runtime_handler.clone(),
            resolv_path: config.resolv_path.clone(),
            hostname: config.hostname.clone(),
            hostname_path: String::new(),
            port_mappings: config.port_mappings.clone(),
            host_network,
            namespace_options: config.namespace_options,
            seccomp_profile_path: config.seccomp_profile_path.clone(),
            created: Utc::now(),
        }));

        // 4. Pinned namespaces, as selected by the namespace options.
        if self.config().manage_ns_lifecycle {
            let mut kinds = Vec::new();
            if !host_network {
                kinds.push(NamespaceKind::Net);
            }
            if !config.namespace_options.host_ipc {
                kinds.push(NamespaceKind::Ipc);
            }
            kinds.push(NamespaceKind::Uts);
            if !config.namespace_options.host_user {
                kinds.push(NamespaceKind::User);
            }
            let pinned = pin_namespaces(&kinds, self.config()).await?;
            // The pin is recorded before anything can fail so the undo
            // entry covers the helper's mounts.
            sb.set_pinned_namespaces(pinned)?;
            undo.push(Undo::RemoveNamespaces(sb.clone()));
        }

        // 5. MCS level.
        let level = mcs_level_of(&config.process_label);
        if self.config().selinux_enabled && !level.is_empty() {
            self.state_store().reserve_mcs_level(&level)?;
            undo.push(Undo::ReleaseMcsLevel(level));
        }

        // 6. Infra container spec and entity.
        let mut spec = self.build_infra_spec(&sb)?;
        spec.annotations = annotations::sandbox_annotations(&sb, &infra_name)?;

        let infra = Arc::new(Container::new(ContainerParams {
            id: id.to_string(),
            name: infra_name.clone(),
            sandbox_id: id.to_string(),
            image: String::new(),
            image_name: String::new(),
            image_ref: String::new(),
            metadata: ContainerMetadata {
                name: infra_name.clone(),
                attempt: meta.attempt,
            },
            run_dir,
            persistent_dir,
            log_path: String::new(),
            labels: config.labels,
            annotations: spec.annotations.clone(),
            kube_annotations: config.annotations,
            mount_point: String::new(),
            volumes: Vec::new(),
            spec,
            tty: false,
            stdin: false,
            stdin_once: false,
            runtime_handler: config.runtime_handler,
            created: sb.created(),
            stop_signal: String::new(),
            seccomp_profile_path: config.seccomp_profile_path,
        }));

        // 7. Runtime create + start for the infra container.
        self.runtime().create(&infra).await?;
        undo.push(Undo::RuntimeDelete(infra.clone()));
        self.runtime().start(&infra).await?;

        // 8. Register. On-disk state is complete before anyone can
        // observe the sandbox through the store.
        sb.set_infra_container(infra.clone())?;
        self.state_store().add_sandbox(sb)?;
        self.state_store().add_infra_container(infra.clone())?;
        undo.push(Undo::Deregister {
            sandbox_id: id.to_string(),
        });
        self.pod_id_index().add(id)?;
        self.ctr_id_index().add(id)?;

        self.container_state_to_disk(&infra).await?;
        Ok(())
    }

    /// Builds the OCI spec of the infra (pause) container.
    fn build_infra_spec(&self, sb: &Sandbox) -> Result<Spec> {
        let mut spec = Spec::base();
        spec.process = Some(Process {
            terminal: false,
            args: vec![INFRA_COMMAND.to_string()],
            env: Vec::new(),
            cwd: "/".to_string(),
            selinux_label: if self.config().selinux_enabled && !sb.process_label().is_empty() {
                Some(sb.process_label().to_string())
            } else {
                None
            },
            extra: HashMap::new(),
        });
        spec.root = Some(Root {
            path: "rootfs".to_string(),
            readonly: true,
        });
        if !sb.hostname().is_empty() {
            spec.hostname = Some(sb.hostname().to_string());
        }
        if !sb.shm_path().is_empty() {
            spec.mounts.push(Mount {
                destination: "/dev/shm".to_string(),
                mount_type: Some("bind".to_string()),
                source: Some(sb.shm_path().to_string()),
                options: vec!["rw".to_string(), "bind".to_string()],
            });
        }
        if !sb.resolv_path().is_empty() {
            spec.mounts.push(Mount {
                destination: "/etc/resolv.conf".to_string(),
                mount_type: Some("bind".to_string()),
                source: Some(sb.resolv_path().to_string()),
                options: vec!["ro".to_string(), "bind".to_string()],
            });
        }

        let mut linux = crate::spec::Linux {
            mount_label: if sb.mount_label().is_empty() {
                None
            } else {
                Some(sb.mount_label().to_string())
            },
            cgroups_path: if sb.cgroup_parent().is_empty() {
                None
            } else {
                Some(format!("{}/{}", sb.cgroup_parent(), sb.id()))
            },
            ..Default::default()
        };
        linux.namespaces.push(LinuxNamespace {
            ns_type: "mount".to_string(),
            path: None,
        });
        if !sb.namespace_options().host_pid {
            linux.namespaces.push(LinuxNamespace {
                ns_type: "pid".to_string(),
                path: None,
            });
        }
        for kind in [
            NamespaceKind::Net,
            NamespaceKind::Ipc,
            NamespaceKind::Uts,
            NamespaceKind::User,
        ] {
            if let Some(path) = sb.ns_path(kind) {
                linux.namespaces.push(LinuxNamespace {
                    ns_type: kind.spec_type().to_string(),
                    path: Some(path.display().to_string()),
                });
            }
        }
        spec.linux = Some(linux);
        Ok(spec)
    }

    // =========================================================================
    // StopPodSandbox
    // =========================================================================

    /// Stops every container of the sandbox, then its infra container.
    ///
    /// Idempotent: stopping a STOPPED sandbox succeeds immediately.
    pub async fn stop_pod_sandbox(&self, id: &str) -> Result<()> {
        let sb = self.resolve_sandbox(id)?;
        if sb.state() == SandboxState::Stopped {
            return Ok(());
        }

        for cid in sb.container_ids() {
            if let Some(ctr) = self.state_store().get_container(&cid) {
                if ctr.status() != ContainerStatus::Stopped {
                    self.stop_container_and_wait(&ctr, SANDBOX_STOP_TIMEOUT)
                        .await?;
                }
                self.container_state_to_disk(&ctr).await?;
            }
        }

        if let Some(infra) = sb.infra_container() {
            if infra.status() != ContainerStatus::Stopped {
                self.stop_container_and_wait(&infra, SANDBOX_STOP_TIMEOUT)
                    .await?;
            }
            self.container_state_to_disk(&infra).await?;
        }

        match defunct_pids() {
            Ok(pids) if !pids.is_empty() => {
                warn!(
                    "{} zombie process(es) on the node after stopping sandbox {}: {pids:?}",
                    pids.len(),
                    sb.id()
                );
            }
            _ => {}
        }

        sb.set_state(SandboxState::Stopped);
        info!("stopped pod sandbox {}", sb.id());
        Ok(())
    }

    // =========================================================================
    // RemovePodSandbox
    // =========================================================================

    /// Removes a sandbox, its containers, namespaces, and directories.
    pub async fn remove_pod_sandbox(&self, id: &str) -> Result<()> {
        let sb = self.resolve_sandbox(id)?;
        if sb.state() == SandboxState::Ready {
            self.stop_pod_sandbox(sb.id()).await?;
        }

        // Containers go first; a removed sandbox leaves no members behind.
        for cid in sb.container_ids() {
            if let Some(ctr) = self.state_store().get_container(&cid) {
                self.remove_container_resources(&ctr).await?;
            }
        }

        let infra_name = sb.infra_container().map(|c| c.name().to_string());
        if let Some(infra) = sb.infra_container() {
            self.runtime().delete(&infra).await?;
        }

        // Platform cleanup + map removal under the store lock.
        self.state_store().remove_infra_container(sb.id());
        self.state_store().remove_sandbox(sb.id())?;

        self.storage().delete_entity_dirs(sb.id())?;

        if let Some(name) = infra_name {
            self.release_container_name(&name);
        }
        self.release_pod_name(sb.name());
        self.pod_id_index().delete(sb.id());
        self.ctr_id_index().delete(sb.id());
        info!("removed pod sandbox {}", sb.id());
        Ok(())
    }

    // =========================================================================
    // Status and Listing
    // =========================================================================

    fn sandbox_status_of(&self, sb: &Sandbox) -> SandboxStatusInfo {
        SandboxStatusInfo {
            id: sb.id().to_string(),
            name: sb.name().to_string(),
            metadata: sb.metadata().clone(),
            state: sb.state(),
            created_at: sb.created(),
            labels: sb.labels().clone(),
            annotations: sb.annotations().clone(),
            runtime_handler: sb.runtime_handler().to_string(),
            network_namespace_path: sb
                .ns_path(NamespaceKind::Net)
                .map(|p| p.display().to_string()),
            container_ids: sb.container_ids(),
        }
    }

    /// PodSandboxStatus.
    pub fn pod_sandbox_status(&self, id: &str) -> Result<SandboxStatusInfo> {
        let sb = self.resolve_sandbox(id)?;
        Ok(self.sandbox_status_of(&sb))
    }

    /// ListPodSandbox, newest first.
    pub fn list_pod_sandbox(&self) -> Vec<SandboxStatusInfo> {
        let mut out: Vec<SandboxStatusInfo> = self
            .state_store()
            .list_sandboxes()
            .iter()
            .map(|sb| self.sandbox_status_of(sb))
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        debug!("listing {} sandboxes", out.len());
        out
    }
}
