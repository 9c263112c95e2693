//! Pod sandbox entity.
//!
//! A sandbox is the lifecycle boundary a set of containers shares:
//! pinned namespaces, an SELinux context, a cgroup parent, and an infra
//! container whose process keeps the namespaces alive. The sandbox holds
//! container *ids* only; the owning map for containers is the state
//! store.

pub mod namespaces;

use crate::container::Container;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use namespaces::{get_namespace, Namespace, NamespaceKind};

// =============================================================================
// Supporting Types
// =============================================================================

/// Lifecycle state of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SandboxState {
    Ready,
    Stopped,
    Removed,
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready => write!(f, "READY"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::Removed => write!(f, "REMOVED"),
        }
    }
}

/// Identity of a pod as the kubelet sees it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodSandboxMetadata {
    pub name: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub attempt: u32,
}

/// A host-to-container port forward.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub container_port: i32,
    pub host_port: i32,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub host_ip: String,
}

/// Which namespaces the pod shares with the host.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceOptions {
    #[serde(default)]
    pub host_network: bool,
    #[serde(default)]
    pub host_pid: bool,
    #[serde(default)]
    pub host_ipc: bool,
    #[serde(default)]
    pub host_user: bool,
}

#[derive(Default)]
struct NamespaceSet {
    net: Option<Arc<Namespace>>,
    ipc: Option<Arc<Namespace>>,
    uts: Option<Arc<Namespace>>,
    user: Option<Arc<Namespace>>,
}

impl NamespaceSet {
    fn slot(&mut self, kind: NamespaceKind) -> &mut Option<Arc<Namespace>> {
        match kind {
            NamespaceKind::Net => &mut self.net,
            NamespaceKind::Ipc => &mut self.ipc,
            NamespaceKind::Uts => &mut self.uts,
            NamespaceKind::User => &mut self.user,
        }
    }

    fn get(&self, kind: NamespaceKind) -> Option<&Arc<Namespace>> {
        match kind {
            NamespaceKind::Net => self.net.as_ref(),
            NamespaceKind::Ipc => self.ipc.as_ref(),
            NamespaceKind::Uts => self.uts.as_ref(),
            NamespaceKind::User => self.user.as_ref(),
        }
    }

    fn drain(&mut self) -> Vec<Arc<Namespace>> {
        [
            self.net.take(),
            self.ipc.take(),
            self.uts.take(),
            self.user.take(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

// =============================================================================
// Sandbox
// =============================================================================

/// Immutable construction-time fields of a [`Sandbox`].
pub struct SandboxParams {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub kube_name: String,
    pub log_dir: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub process_label: String,
    pub mount_label: String,
    pub metadata: PodSandboxMetadata,
    pub shm_path: String,
    pub cgroup_parent: String,
    pub privileged: bool,
    pub runtime_handler: String,
    pub resolv_path: String,
    pub hostname: String,
    pub hostname_path: String,
    pub port_mappings: Vec<PortMapping>,
    pub host_network: bool,
    pub namespace_options: NamespaceOptions,
    pub seccomp_profile_path: String,
    pub created: DateTime<Utc>,
}

/// A pod sandbox managed by the daemon.
pub struct Sandbox {
    params: SandboxParams,
    state: Mutex<SandboxState>,
    /// Container ids in insertion order; the containers themselves are
    /// owned by the state store.
    container_ids: Mutex<Vec<String>>,
    infra: Mutex<Option<Arc<Container>>>,
    /// Namespace records. Mutations snapshot their plan before any
    /// external helper runs, so this lock is never held across one.
    namespaces: Mutex<NamespaceSet>,
}

impl Sandbox {
    pub fn new(params: SandboxParams) -> Self {
        Self {
            params,
            state: Mutex::new(SandboxState::Ready),
            container_ids: Mutex::new(Vec::new()),
            infra: Mutex::new(None),
            namespaces: Mutex::new(NamespaceSet::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.params.id
    }

    pub fn name(&self) -> &str {
        &self.params.name
    }

    pub fn namespace(&self) -> &str {
        &self.params.namespace
    }

    pub fn kube_name(&self) -> &str {
        &self.params.kube_name
    }

    pub fn log_dir(&self) -> &str {
        &self.params.log_dir
    }

    pub fn labels(&self) -> &HashMap<String, String> {
        &self.params.labels
    }

    pub fn annotations(&self) -> &HashMap<String, String> {
        &self.params.annotations
    }

    pub fn process_label(&self) -> &str {
        &self.params.process_label
    }

    pub fn mount_label(&self) -> &str {
        &self.params.mount_label
    }

    pub fn metadata(&self) -> &PodSandboxMetadata {
        &self.params.metadata
    }

    pub fn shm_path(&self) -> &str {
        &self.params.shm_path
    }

    pub fn cgroup_parent(&self) -> &str {
        &self.params.cgroup_parent
    }

    pub fn privileged(&self) -> bool {
        self.params.privileged
    }

    pub fn runtime_handler(&self) -> &str {
        &self.params.runtime_handler
    }

    pub fn resolv_path(&self) -> &str {
        &self.params.resolv_path
    }

    pub fn hostname(&self) -> &str {
        &self.params.hostname
    }

    pub fn hostname_path(&self) -> &str {
        &self.params.hostname_path
    }

    pub fn port_mappings(&self) -> &[PortMapping] {
        &self.params.port_mappings
    }

    pub fn host_network(&self) -> bool {
        self.params.host_network
    }

    pub fn namespace_options(&self) -> NamespaceOptions {
        self.params.namespace_options
    }

    pub fn seccomp_profile_path(&self) -> &str {
        &self.params.seccomp_profile_path
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.params.created
    }

    // =========================================================================
    // State
    // =========================================================================

    pub fn state(&self) -> SandboxState {
        *self.state.lock().expect("sandbox state lock")
    }

    pub fn set_state(&self, state: SandboxState) {
        *self.state.lock().expect("sandbox state lock") = state;
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SandboxState::Ready
    }

    // =========================================================================
    // Container Membership
    // =========================================================================

    /// Appends a container id; keeps insertion order, ignores duplicates.
    pub fn add_container_id(&self, id: &str) {
        let mut ids = self.container_ids.lock().expect("sandbox containers lock");
        if !ids.iter().any(|existing| existing == id) {
            ids.push(id.to_string());
        }
    }

    pub fn remove_container_id(&self, id: &str) {
        let mut ids = self.container_ids.lock().expect("sandbox containers lock");
        ids.retain(|existing| existing != id);
    }

    /// Snapshot of the member container ids, in insertion order.
    pub fn container_ids(&self) -> Vec<String> {
        self.container_ids
            .lock()
            .expect("sandbox containers lock")
            .clone()
    }

    /// Installs the infra container. Fails if one is already set.
    pub fn set_infra_container(&self, ctr: Arc<Container>) -> Result<()> {
        let mut infra = self.infra.lock().expect("sandbox infra lock");
        if infra.is_some() {
            return Err(Error::Internal(format!(
                "sandbox {} already has an infra container",
                self.params.id
            )));
        }
        *infra = Some(ctr);
        Ok(())
    }

    pub fn infra_container(&self) -> Option<Arc<Container>> {
        self.infra.lock().expect("sandbox infra lock").clone()
    }

    /// PID of the infra process, if the container is tracked and started.
    pub fn infra_pid(&self) -> Option<i32> {
        self.infra_container().and_then(|c| c.state().init_pid)
    }

    // =========================================================================
    // Namespaces
    // =========================================================================

    /// Records namespaces freshly pinned for this sandbox.
    ///
    /// Fails when a handle of one of the kinds is already present; the
    /// caller is responsible for removing the pinned set on failure.
    pub fn set_pinned_namespaces(&self, pinned: Vec<Arc<Namespace>>) -> Result<()> {
        let mut set = self.namespaces.lock().expect("sandbox namespaces lock");
        for ns in &pinned {
            if set.get(ns.kind()).is_some() {
                return Err(Error::Internal(format!(
                    "sandbox {} already has a {} namespace",
                    self.params.id,
                    ns.kind()
                )));
            }
        }
        for ns in pinned {
            let kind = ns.kind();
            *set.slot(kind) = Some(ns);
        }
        Ok(())
    }

    /// Joins an existing external namespace by path. The record is
    /// non-owning: removal never deletes externally supplied paths.
    /// Fails if a handle of the kind is already present.
    pub fn ns_join(&self, kind: NamespaceKind, path: &std::path::Path) -> Result<()> {
        self.ns_record(kind, get_namespace(kind, path)?)
    }

    /// Re-adopts a pin this daemon created before a restart; the record
    /// is managed and cleaned up on removal like a fresh pin.
    pub fn ns_rejoin_pinned(&self, kind: NamespaceKind, path: &std::path::Path) -> Result<()> {
        self.ns_record(kind, namespaces::adopt_pinned_namespace(kind, path)?)
    }

    fn ns_record(&self, kind: NamespaceKind, ns: Arc<Namespace>) -> Result<()> {
        let mut set = self.namespaces.lock().expect("sandbox namespaces lock");
        if set.get(kind).is_some() {
            return Err(Error::FailedPrecondition {
                kind: "sandbox",
                id: self.params.id.clone(),
                state: format!("{kind} namespace already set"),
                op: "join namespace",
            });
        }
        *set.slot(kind) = Some(ns);
        Ok(())
    }

    /// Path of the given namespace, if a handle is held.
    pub fn ns_path(&self, kind: NamespaceKind) -> Option<PathBuf> {
        self.namespaces
            .lock()
            .expect("sandbox namespaces lock")
            .get(kind)
            .map(|ns| ns.path().to_path_buf())
    }

    /// PID namespace path derived from the live infra process.
    ///
    /// The PID namespace is never pinned; it exists exactly as long as
    /// its init process does, so the path is only returned while that
    /// process is alive.
    pub fn pid_ns_path(&self) -> Option<String> {
        let pid = self.infra_pid()?;
        let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok();
        if alive {
            Some(format!("/proc/{pid}/ns/pid"))
        } else {
            None
        }
    }

    /// Removes every held namespace record.
    ///
    /// The records are drained under the lock, then removed outside it;
    /// the first error is returned after all removals were attempted.
    pub fn remove_namespaces(&self) -> Result<()> {
        let drained = {
            let mut set = self.namespaces.lock().expect("sandbox namespaces lock");
            set.drain()
        };
        let mut first_err = None;
        for ns in drained {
            if let Err(e) = ns.remove() {
                tracing::warn!(
                    sandbox = %self.params.id,
                    namespace = %ns.kind(),
                    "failed to remove namespace: {e}"
                );
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.params.id)
            .field("name", &self.params.name)
            .field("state", &self.state())
            .finish()
    }
}
