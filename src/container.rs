//! Container entity and its runtime state.

use crate::constants::STATE_FILE;
use crate::spec::Spec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

// =============================================================================
// Status
// =============================================================================

/// Lifecycle status of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Created but not started.
    Created,
    /// The init process is running.
    Running,
    /// Frozen by the runtime.
    Paused,
    /// The init process has exited.
    Stopped,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

// =============================================================================
// Runtime State
// =============================================================================

/// Mutable runtime state of a container, persisted as `state.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    pub status: ContainerStatus,

    /// PID reported by the runtime while the container runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,

    /// Init PID captured at create time; survives the process itself so
    /// stop paths can reference it after exit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_pid: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl Default for ContainerState {
    fn default() -> Self {
        Self {
            status: ContainerStatus::Created,
            pid: None,
            init_pid: None,
            started_at: None,
            finished_at: None,
            exit_code: None,
        }
    }
}

// =============================================================================
// Supporting Types
// =============================================================================

/// Name and attempt counter identifying a container within its pod.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerMetadata {
    pub name: String,
    #[serde(default)]
    pub attempt: u32,
}

/// A bind-mounted volume of a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerVolume {
    pub container_path: String,
    pub host_path: String,
    #[serde(default)]
    pub readonly: bool,
}

// =============================================================================
// Container
// =============================================================================

/// Immutable construction-time fields of a [`Container`].
///
/// Grouped so the lifecycle engine and the rehydration path build
/// containers through one door.
pub struct ContainerParams {
    pub id: String,
    pub name: String,
    pub sandbox_id: String,
    pub image: String,
    pub image_name: String,
    pub image_ref: String,
    pub metadata: ContainerMetadata,
    pub run_dir: PathBuf,
    pub persistent_dir: PathBuf,
    pub log_path: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub kube_annotations: HashMap<String, String>,
    pub mount_point: String,
    pub volumes: Vec<ContainerVolume>,
    pub spec: Spec,
    pub tty: bool,
    pub stdin: bool,
    pub stdin_once: bool,
    pub runtime_handler: String,
    pub created: DateTime<Utc>,
    pub stop_signal: String,
    pub seccomp_profile_path: String,
}

/// A container managed by the daemon.
///
/// Metadata is immutable after construction; the runtime state lives
/// behind its own lock. State-changing runtime operations serialize on
/// `op_lock`, while readers take snapshots of `state`.
pub struct Container {
    params: ContainerParams,
    state: Mutex<ContainerState>,
    /// Serializes state-changing runtime operations per container.
    op_lock: tokio::sync::Mutex<()>,
    /// Signalled by the exit-file watcher when the container stops.
    exited: tokio::sync::Notify,
}

impl Container {
    pub fn new(params: ContainerParams) -> Self {
        Self {
            params,
            state: Mutex::new(ContainerState::default()),
            op_lock: tokio::sync::Mutex::new(()),
            exited: tokio::sync::Notify::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.params.id
    }

    pub fn name(&self) -> &str {
        &self.params.name
    }

    pub fn sandbox_id(&self) -> &str {
        &self.params.sandbox_id
    }

    pub fn image(&self) -> &str {
        &self.params.image
    }

    pub fn image_name(&self) -> &str {
        &self.params.image_name
    }

    pub fn image_ref(&self) -> &str {
        &self.params.image_ref
    }

    pub fn metadata(&self) -> &ContainerMetadata {
        &self.params.metadata
    }

    pub fn run_dir(&self) -> &Path {
        &self.params.run_dir
    }

    pub fn persistent_dir(&self) -> &Path {
        &self.params.persistent_dir
    }

    pub fn log_path(&self) -> &str {
        &self.params.log_path
    }

    pub fn labels(&self) -> &HashMap<String, String> {
        &self.params.labels
    }

    pub fn annotations(&self) -> &HashMap<String, String> {
        &self.params.annotations
    }

    pub fn kube_annotations(&self) -> &HashMap<String, String> {
        &self.params.kube_annotations
    }

    pub fn mount_point(&self) -> &str {
        &self.params.mount_point
    }

    pub fn volumes(&self) -> &[ContainerVolume] {
        &self.params.volumes
    }

    pub fn spec(&self) -> &Spec {
        &self.params.spec
    }

    pub fn tty(&self) -> bool {
        self.params.tty
    }

    pub fn stdin(&self) -> bool {
        self.params.stdin
    }

    pub fn stdin_once(&self) -> bool {
        self.params.stdin_once
    }

    pub fn runtime_handler(&self) -> &str {
        &self.params.runtime_handler
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.params.created
    }

    /// Stop-signal annotation from the image, e.g. "SIGTERM". May be empty.
    pub fn stop_signal(&self) -> &str {
        &self.params.stop_signal
    }

    pub fn seccomp_profile_path(&self) -> &str {
        &self.params.seccomp_profile_path
    }

    /// Path of the persisted runtime state file.
    pub fn state_path(&self) -> PathBuf {
        self.params.persistent_dir.join(STATE_FILE)
    }

    // =========================================================================
    // State Access
    // =========================================================================

    /// Returns a snapshot of the runtime state.
    pub fn state(&self) -> ContainerState {
        self.state.lock().expect("container state lock").clone()
    }

    /// Returns the current status.
    pub fn status(&self) -> ContainerStatus {
        self.state.lock().expect("container state lock").status
    }

    /// Replaces the runtime state wholesale (rehydration path).
    pub fn restore_state(&self, state: ContainerState) {
        *self.state.lock().expect("container state lock") = state;
    }

    /// Records a successful runtime create.
    pub fn set_created(&self, pid: Option<i32>) {
        let mut state = self.state.lock().expect("container state lock");
        state.status = ContainerStatus::Created;
        state.pid = pid;
        state.init_pid = pid;
    }

    /// Records a successful runtime start.
    pub fn set_running(&self) {
        let mut state = self.state.lock().expect("container state lock");
        state.status = ContainerStatus::Running;
        if state.started_at.is_none() {
            state.started_at = Some(Utc::now());
        }
    }

    pub fn set_paused(&self) {
        self.state.lock().expect("container state lock").status = ContainerStatus::Paused;
    }

    pub fn set_resumed(&self) {
        self.state.lock().expect("container state lock").status = ContainerStatus::Running;
    }

    /// Applies a non-terminal status reported by the runtime.
    ///
    /// Timestamps are preserved: `started_at` is only stamped on the
    /// first transition to running. Terminal transitions go through
    /// [`Container::set_stopped`] so exit data and waiters are handled.
    pub fn apply_status(&self, status: ContainerStatus, pid: Option<i32>) {
        debug_assert!(status != ContainerStatus::Stopped);
        let mut state = self.state.lock().expect("container state lock");
        state.status = status;
        if pid.is_some() {
            state.pid = pid;
            if state.init_pid.is_none() {
                state.init_pid = pid;
            }
        }
        if status == ContainerStatus::Running && state.started_at.is_none() {
            state.started_at = Some(Utc::now());
        }
    }

    /// Records the container as stopped and wakes exit waiters.
    ///
    /// A previously recorded exit code is kept when the caller has none;
    /// the first finished timestamp wins.
    pub fn set_stopped(&self, finished_at: Option<DateTime<Utc>>, exit_code: Option<i32>) {
        {
            let mut state = self.state.lock().expect("container state lock");
            state.status = ContainerStatus::Stopped;
            state.pid = None;
            if state.finished_at.is_none() {
                state.finished_at = finished_at.or_else(|| Some(Utc::now()));
            }
            if exit_code.is_some() {
                state.exit_code = exit_code;
            }
        }
        self.exited.notify_waiters();
    }

    /// Serializes one state-changing runtime operation at a time.
    pub async fn lock_op(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.op_lock.lock().await
    }

    /// Completes when [`Container::set_stopped`] has run.
    ///
    /// Callers re-check the status after waking; the notification itself
    /// carries no payload and wakeups may be spurious.
    pub async fn exited(&self) {
        let notified = self.exited.notified();
        if self.status() == ContainerStatus::Stopped {
            return;
        }
        notified.await;
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.params.id)
            .field("name", &self.params.name)
            .field("sandbox_id", &self.params.sandbox_id)
            .field("status", &self.status())
            .finish()
    }
}
