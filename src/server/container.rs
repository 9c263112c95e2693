//! Container lifecycle: CreateContainer, StartContainer, StopContainer,
//! RemoveContainer, ContainerStatus, ListContainers, ExecSync,
//! UpdateContainerResources, and pause/resume.

use super::sandbox::Undo;
use super::ContainerServer;
use crate::annotations;
use crate::container::{
    Container, ContainerMetadata, ContainerParams, ContainerState, ContainerStatus,
    ContainerVolume,
};
use crate::error::{Error, Result};
use crate::oci::ExecResult;
use crate::sandbox::namespaces::NamespaceKind;
use crate::sandbox::Sandbox;
use crate::spec::{LinuxNamespace, Mount, Process, Root, Spec};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

// =============================================================================
// Request / Response Types
// =============================================================================

/// A host path mounted into the container.
#[derive(Debug, Clone)]
pub struct DeviceMount {
    pub container_path: String,
    pub host_path: String,
    pub readonly: bool,
}

/// Version-agnostic CreateContainer request.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    pub metadata: ContainerMetadata,
    pub image: String,
    pub image_name: String,
    pub image_ref: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub working_dir: String,
    pub env: Vec<(String, String)>,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub log_path: String,
    pub mounts: Vec<DeviceMount>,
    pub tty: bool,
    pub stdin: bool,
    pub stdin_once: bool,
    /// Stop-signal annotation from the image config, e.g. "SIGQUIT".
    pub stop_signal: String,
    pub seccomp_profile_path: String,
}

/// Point-in-time view of a container.
#[derive(Debug, Clone)]
pub struct ContainerStatusInfo {
    pub id: String,
    pub name: String,
    pub sandbox_id: String,
    pub metadata: ContainerMetadata,
    pub image: String,
    pub image_ref: String,
    pub state: ContainerState,
    pub created_at: DateTime<Utc>,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub log_path: String,
}

impl ContainerServer {
    // =========================================================================
    // CreateContainer
    // =========================================================================

    /// Creates a container inside a READY sandbox, returning its id.
    pub async fn create_container(
        &self,
        sandbox_id: &str,
        config: ContainerConfig,
    ) -> Result<String> {
        if config.metadata.name.is_empty() {
            return Err(Error::InvalidArgument(
                "container metadata name is empty".to_string(),
            ));
        }
        let sb = self.resolve_sandbox(sandbox_id)?;
        if !sb.is_ready() {
            return Err(Error::FailedPrecondition {
                kind: "sandbox",
                id: sb.id().to_string(),
                state: sb.state().to_string(),
                op: "create container",
            });
        }

        let id = Self::generate_id();
        let mut undo = Vec::new();
        match self
            .create_container_steps(&id, &sb, config, &mut undo)
            .await
        {
            Ok(()) => {
                info!("created container {id} in sandbox {}", sb.id());
                Ok(id)
            }
            Err(e) => {
                self.rollback(undo).await;
                Err(e)
            }
        }
    }

    async fn create_container_steps(
        &self,
        id: &str,
        sb: &Arc<Sandbox>,
        config: ContainerConfig,
        undo: &mut Vec<Undo>,
    ) -> Result<()> {
        let meta = &config.metadata;
        let name = format!(
            "k8s_{}_{}_{}_{}_{}",
            meta.name,
            sb.kube_name(),
            sb.namespace(),
            sb.metadata().uid,
            meta.attempt
        );

        self.reserve_container_name(id, &name)?;
        undo.push(Undo::ReleaseCtrName(name.clone()));

        let (persistent_dir, run_dir) = self.storage().create_entity_dirs(id)?;
        undo.push(Undo::DeleteDirs(id.to_string()));

        let volumes: Vec<ContainerVolume> = config
            .mounts
            .iter()
            .map(|m| ContainerVolume {
                container_path: m.container_path.clone(),
                host_path: m.host_path.clone(),
                readonly: m.readonly,
            })
            .collect();

        let spec = self.build_container_spec(sb, &config)?;

        let log_path = if config.log_path.is_empty() {
            String::new()
        } else if config.log_path.starts_with('/') {
            config.log_path.clone()
        } else {
            format!("{}/{}", sb.log_dir().trim_end_matches('/'), config.log_path)
        };

        let mut params = ContainerParams {
            id: id.to_string(),
            name,
            sandbox_id: sb.id().to_string(),
            image: config.image.clone(),
            image_name: config.image_name.clone(),
            image_ref: config.image_ref.clone(),
            metadata: config.metadata.clone(),
            run_dir,
            persistent_dir,
            log_path,
            labels: config.labels.clone(),
            annotations: HashMap::new(),
            kube_annotations: config.annotations.clone(),
            mount_point: String::new(),
            volumes,
            spec,
            tty: config.tty,
            stdin: config.stdin,
            stdin_once: config.stdin_once,
            runtime_handler: sb.runtime_handler().to_string(),
            created: Utc::now(),
            stop_signal: config.stop_signal.clone(),
            seccomp_profile_path: config.seccomp_profile_path.clone(),
        };
        let daemon_annotations = annotations::container_annotations(&params)?;
        params.annotations = daemon_annotations.clone();
        params.spec.annotations = daemon_annotations;
        let ctr = Arc::new(Container::new(params));

        self.runtime().create(&ctr).await?;
        undo.push(Undo::RuntimeDelete(ctr.clone()));

        self.state_store().add_container(ctr.clone())?;
        undo.push(Undo::DeregisterContainer {
            container_id: id.to_string(),
        });
        self.ctr_id_index().add(id)?;

        self.container_state_to_disk(&ctr).await?;
        Ok(())
    }

    /// Builds a workload container spec joining the sandbox namespaces.
    fn build_container_spec(&self, sb: &Sandbox, config: &ContainerConfig) -> Result<Spec> {
        let mut args = config.command.clone();
        args.extend(config.args.iter().cloned());
        if args.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "container '{}' has no command",
                config.metadata.name
            )));
        }

        let mut spec = Spec::base();
        spec.process = Some(Process {
            terminal: config.tty,
            args,
            env: config
                .env
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect(),
            cwd: if config.working_dir.is_empty() {
                "/".to_string()
            } else {
                config.working_dir.clone()
            },
            selinux_label: if self.config().selinux_enabled && !sb.process_label().is_empty() {
                Some(sb.process_label().to_string())
            } else {
                None
            },
            extra: HashMap::new(),
        });
        spec.root = Some(Root {
            path: "rootfs".to_string(),
            readonly: false,
        });
        if !sb.hostname().is_empty() {
            spec.hostname = Some(sb.hostname().to_string());
        }
        for m in &config.mounts {
            spec.mounts.push(Mount {
                destination: m.container_path.clone(),
                mount_type: Some("bind".to_string()),
                source: Some(m.host_path.clone()),
                options: if m.readonly {
                    vec!["ro".to_string(), "bind".to_string()]
                } else {
                    vec!["rw".to_string(), "bind".to_string()]
                },
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
                Some(format!("{}/{}", sb.cgroup_parent(), config.metadata.name))
            },
            ..Default::default()
        };
        linux.namespaces.push(LinuxNamespace {
            ns_type: "mount".to_string(),
            path: None,
        });
        // Containers join the namespaces their sandbox holds open.
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
        if !sb.namespace_options().host_pid {
            linux.namespaces.push(LinuxNamespace {
                ns_type: "pid".to_string(),
                path: sb.pid_ns_path(),
            });
        }
        spec.linux = Some(linux);
        Ok(spec)
    }

    // =========================================================================
    // Start / Stop / Remove
    // =========================================================================

    /// StartContainer: CREATED → RUNNING.
    ///
    /// Starting into a stopped sandbox is rejected: the namespaces the
    /// container was created against may already be gone.
    pub async fn start_container(&self, id: &str) -> Result<()> {
        let ctr = self.resolve_container(id)?;
        let sb = self
            .state_store()
            .get_sandbox(ctr.sandbox_id())
            .ok_or_else(|| Error::not_found("sandbox", ctr.sandbox_id()))?;
        if !sb.is_ready() {
            return Err(Error::FailedPrecondition {
                kind: "sandbox",
                id: sb.id().to_string(),
                state: sb.state().to_string(),
                op: "start container",
            });
        }

        self.runtime().start(&ctr).await?;
        self.container_state_to_disk(&ctr).await?;
        Ok(())
    }

    /// StopContainer with the given grace period in seconds.
    pub async fn stop_container(&self, id: &str, timeout: i64) -> Result<()> {
        let ctr = self.resolve_container(id)?;
        if ctr.status() == ContainerStatus::Stopped {
            return Ok(());
        }
        let timeout = if timeout > 0 {
            timeout
        } else {
            self.config().ctr_stop_timeout
        };
        self.stop_container_and_wait(&ctr, timeout).await?;
        self.container_state_to_disk(&ctr).await?;
        info!("stopped container {}", ctr.id());
        Ok(())
    }

    /// RemoveContainer: stops if needed, then deletes runtime state,
    /// directories, names, and indices.
    pub async fn remove_container(&self, id: &str) -> Result<()> {
        let ctr = self.resolve_container(id)?;
        self.remove_container_resources(&ctr).await?;
        info!("removed container {}", ctr.id());
        Ok(())
    }

    /// Shared removal path for RemoveContainer and RemovePodSandbox.
    pub(crate) async fn remove_container_resources(&self, ctr: &Arc<Container>) -> Result<()> {
        if matches!(
            ctr.status(),
            ContainerStatus::Running | ContainerStatus::Paused
        ) {
            self.stop_container_and_wait(ctr, self.config().ctr_stop_timeout)
                .await?;
        }
        self.runtime().delete(ctr).await?;

        // Deregister before dismantling resources so observers never see
        // a stored container whose directories are vanishing.
        self.state_store().remove_container(ctr.id());
        self.ctr_id_index().delete(ctr.id());

        self.storage().delete_entity_dirs(ctr.id())?;
        let exit_file = self.config().exits_dir.join(ctr.id());
        match std::fs::remove_file(&exit_file) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.release_container_name(ctr.name());
        Ok(())
    }

    // =========================================================================
    // Status, Listing, Exec
    // =========================================================================

    fn container_status_of(&self, ctr: &Container) -> ContainerStatusInfo {
        ContainerStatusInfo {
            id: ctr.id().to_string(),
            name: ctr.name().to_string(),
            sandbox_id: ctr.sandbox_id().to_string(),
            metadata: ctr.metadata().clone(),
            image: ctr.image().to_string(),
            image_ref: ctr.image_ref().to_string(),
            state: ctr.state(),
            created_at: ctr.created(),
            labels: ctr.labels().clone(),
            annotations: ctr.kube_annotations().clone(),
            log_path: ctr.log_path().to_string(),
        }
    }

    /// ContainerStatus, refreshed from the runtime and exit file first.
    pub async fn container_status(&self, id: &str) -> Result<ContainerStatusInfo> {
        let ctr = self.resolve_container(id)?;
        self.runtime().refresh_status(&ctr).await?;
        Ok(self.container_status_of(&ctr))
    }

    /// ListContainers, optionally filtered by owning sandbox.
    pub fn list_containers(&self, sandbox_id: Option<&str>) -> Result<Vec<ContainerStatusInfo>> {
        let filter = match sandbox_id {
            Some(prefix) => Some(self.resolve_sandbox(prefix)?.id().to_string()),
            None => None,
        };
        let mut out: Vec<ContainerStatusInfo> = self
            .state_store()
            .list_containers()
            .iter()
            .filter(|c| filter.as_deref().map_or(true, |sb| c.sandbox_id() == sb))
            .map(|c| self.container_status_of(c))
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        debug!("listing {} containers", out.len());
        Ok(out)
    }

    /// ExecSync: run a command inside a running container and capture
    /// its output, subject to its own timeout.
    pub async fn exec_sync(
        &self,
        id: &str,
        argv: &[String],
        timeout: Option<Duration>,
    ) -> Result<ExecResult> {
        let ctr = self.resolve_container(id)?;
        self.runtime().exec_sync(&ctr, argv, timeout).await
    }

    /// UpdateContainerResources with a runtime-native resources document.
    pub async fn update_container_resources(
        &self,
        id: &str,
        resources: &serde_json::Value,
    ) -> Result<()> {
        let ctr = self.resolve_container(id)?;
        if ctr.status() == ContainerStatus::Stopped {
            return Err(Error::FailedPrecondition {
                kind: "container",
                id: ctr.id().to_string(),
                state: ctr.status().to_string(),
                op: "update resources",
            });
        }
        self.runtime().update_resources(&ctr, resources).await
    }

    /// Freezes a running container.
    pub async fn pause_container(&self, id: &str) -> Result<()> {
        let ctr = self.resolve_container(id)?;
        self.runtime().pause(&ctr).await?;
        self.container_state_to_disk(&ctr).await
    }

    /// Thaws a paused container.
    pub async fn resume_container(&self, id: &str) -> Result<()> {
        let ctr = self.resolve_container(id)?;
        self.runtime().resume(&ctr).await?;
        self.container_state_to_disk(&ctr).await
    }
}
