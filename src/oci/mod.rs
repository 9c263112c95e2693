//! OCI runtime mediation.
//!
//! The daemon never runs container processes in-process: every lifecycle
//! transition is delegated to an external runc-shaped binary selected by
//! the entity's runtime handler. This module owns that boundary:
//! spawning the binary, parsing its `state` JSON, merging exit files
//! written by the runtime supervisor, and enforcing stop and exec
//! deadlines.
//!
//! State-changing operations serialize per container on the container's
//! own lock; status refreshes are reads and may run concurrently with
//! them thanks to the atomic-write discipline of `state.json`.

pub mod exits;

use crate::config::Config;
use crate::constants::{CONFIG_FILE, KILL_GRACE_PERIOD, STOP_POLL_INTERVAL};
use crate::container::{Container, ContainerState, ContainerStatus};
use crate::error::{Error, Result};
use crate::storage::atomic_write_json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

// =============================================================================
// Runtime State Schema
// =============================================================================

/// JSON printed by the runtime's `state` subcommand.
///
/// Ref: https://github.com/opencontainers/runtime-spec/blob/main/runtime.md#state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciState {
    #[serde(default)]
    pub oci_version: String,
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub pid: Option<i32>,
    #[serde(default)]
    pub bundle: String,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

/// Result of a synchronous exec inside a container.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

// =============================================================================
// Signals
// =============================================================================

/// Parses a signal name ("SIGTERM", "TERM") or number ("15").
///
/// Returns `None` for unknown names so callers can apply their default.
pub fn parse_signal(s: &str) -> Option<i32> {
    if let Ok(n) = s.parse::<i32>() {
        return (n > 0).then_some(n);
    }
    let upper = s.to_uppercase();
    let name = upper.strip_prefix("SIG").unwrap_or(&upper);
    match name {
        "HUP" => Some(libc::SIGHUP),
        "INT" => Some(libc::SIGINT),
        "QUIT" => Some(libc::SIGQUIT),
        "KILL" => Some(libc::SIGKILL),
        "USR1" => Some(libc::SIGUSR1),
        "USR2" => Some(libc::SIGUSR2),
        "TERM" => Some(libc::SIGTERM),
        "STOP" => Some(libc::SIGSTOP),
        "CONT" => Some(libc::SIGCONT),
        "WINCH" => Some(libc::SIGWINCH),
        _ => None,
    }
}

// =============================================================================
// Mediator
// =============================================================================

/// Mediates all interaction with the external OCI runtime binaries.
pub struct OciRuntime {
    config: Arc<Config>,
}

impl OciRuntime {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    fn binary_for(&self, ctr: &Container) -> Result<PathBuf> {
        Ok(self.config.runtime_for(ctr.runtime_handler())?.path.clone())
    }

    /// Runs a runtime subcommand, mapping non-zero exits to
    /// [`Error::RuntimeFailed`] with the captured stderr.
    async fn run(
        &self,
        binary: &Path,
        args: &[String],
        op: &'static str,
        id: &str,
    ) -> Result<Vec<u8>> {
        debug!("invoking {} {:?}", binary.display(), args);
        let output = Command::new(binary).args(args).output().await?;
        if !output.status.success() {
            return Err(Error::RuntimeFailed {
                binary: binary.display().to_string(),
                op,
                id: id.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    fn write_bundle(&self, ctr: &Container) -> Result<()> {
        // The bundle copy feeds the runtime; the persistent copy is the
        // durable record rehydration reads.
        atomic_write_json(&ctr.run_dir().join(CONFIG_FILE), ctr.spec())?;
        atomic_write_json(&ctr.persistent_dir().join(CONFIG_FILE), ctr.spec())?;
        atomic_write_json(&ctr.state_path(), &ctr.state())?;
        Ok(())
    }

    fn pid_file(ctr: &Container) -> PathBuf {
        ctr.run_dir().join("pidfile")
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Writes the spec and state files, then asks the runtime to create
    /// the container, capturing the assigned PID into the state.
    pub async fn create(&self, ctr: &Container) -> Result<()> {
        let _op = ctr.lock_op().await;

        let has_process = ctr
            .spec()
            .process
            .as_ref()
            .map(|p| !p.args.is_empty())
            .unwrap_or(false);
        if !has_process {
            return Err(Error::FailedPrecondition {
                kind: "container",
                id: ctr.id().to_string(),
                state: "spec has no process arguments".to_string(),
                op: "create",
            });
        }

        self.write_bundle(ctr)?;

        let binary = self.binary_for(ctr)?;
        let pid_file = Self::pid_file(ctr);
        let args = vec![
            "create".to_string(),
            "--bundle".to_string(),
            ctr.run_dir().display().to_string(),
            "--pid-file".to_string(),
            pid_file.display().to_string(),
            ctr.id().to_string(),
        ];
        self.run(&binary, &args, "create", ctr.id()).await?;

        let pid = read_pid_file(&pid_file);
        ctr.set_created(pid);
        atomic_write_json(&ctr.state_path(), &ctr.state())?;
        info!("created container {}", ctr.id());
        Ok(())
    }

    /// Starts a created container.
    pub async fn start(&self, ctr: &Container) -> Result<()> {
        let _op = ctr.lock_op().await;
        if ctr.status() != ContainerStatus::Created {
            return Err(Error::FailedPrecondition {
                kind: "container",
                id: ctr.id().to_string(),
                state: ctr.status().to_string(),
                op: "start",
            });
        }
        let binary = self.binary_for(ctr)?;
        self.run(&binary, &["start".to_string(), ctr.id().to_string()], "start", ctr.id())
            .await?;
        ctr.set_running();
        info!("started container {}", ctr.id());
        Ok(())
    }

    async fn kill(&self, ctr: &Container, signal: i32) -> Result<()> {
        let binary = self.binary_for(ctr)?;
        self.run(
            &binary,
            &[
                "kill".to_string(),
                ctr.id().to_string(),
                signal.to_string(),
            ],
            "kill",
            ctr.id(),
        )
        .await
        .map(|_| ())
    }

    /// Stops a container: the configured stop signal first, SIGKILL after
    /// `timeout` seconds, returning once the process is reaped.
    pub async fn stop(&self, ctr: &Container, timeout: i64) -> Result<()> {
        let _op = ctr.lock_op().await;

        match self.refresh_status(ctr).await?.status {
            ContainerStatus::Stopped => return Ok(()),
            ContainerStatus::Created => {
                // Never started: nothing to signal, nothing to reap.
                let _ = self
                    .delete_inner(ctr)
                    .await
                    .map_err(|e| debug!("delete of created container: {e}"));
                ctr.set_stopped(None, None);
                return Ok(());
            }
            _ => {}
        }

        let stop_signal =
            parse_signal(ctr.stop_signal()).unwrap_or(libc::SIGTERM);
        debug!(
            "stopping container {} with signal {} (timeout {}s)",
            ctr.id(),
            stop_signal,
            timeout
        );
        if let Err(e) = self.kill(ctr, stop_signal).await {
            // The process may have exited between the status check and
            // the signal; verify before propagating.
            if self.refresh_status(ctr).await?.status != ContainerStatus::Stopped {
                return Err(e);
            }
            return Ok(());
        }

        let timeout = timeout.max(0) as u64;
        if self
            .await_stopped(ctr, Some(Duration::from_secs(timeout)))
            .await?
        {
            return Ok(());
        }

        warn!(
            "container {} did not stop in {}s, sending SIGKILL",
            ctr.id(),
            timeout
        );
        if let Err(e) = self.kill(ctr, libc::SIGKILL).await {
            if self.refresh_status(ctr).await?.status != ContainerStatus::Stopped {
                return Err(e);
            }
            return Ok(());
        }
        if self.await_stopped(ctr, Some(KILL_GRACE_PERIOD)).await? {
            return Ok(());
        }
        Err(Error::RuntimeFailed {
            binary: self.binary_for(ctr)?.display().to_string(),
            op: "stop",
            id: ctr.id().to_string(),
            stderr: "container did not stop after SIGKILL".to_string(),
        })
    }

    /// Blocks until the container is observed STOPPED.
    ///
    /// Wakes on exit-file notifications and falls back to polling the
    /// runtime, so a dead watcher only degrades latency.
    pub async fn wait_stopped(&self, ctr: &Container) -> Result<()> {
        self.await_stopped(ctr, None).await.map(|_| ())
    }

    async fn await_stopped(&self, ctr: &Container, deadline: Option<Duration>) -> Result<bool> {
        let started = tokio::time::Instant::now();
        loop {
            if self.refresh_status(ctr).await?.status == ContainerStatus::Stopped {
                return Ok(true);
            }
            if let Some(limit) = deadline {
                if started.elapsed() >= limit {
                    return Ok(false);
                }
            }
            tokio::select! {
                _ = ctr.exited() => {}
                _ = tokio::time::sleep(STOP_POLL_INTERVAL) => {}
            }
        }
    }

    /// Refreshes a container's state from the runtime and the exit file.
    ///
    /// Idempotent; a container the runtime no longer knows is reported
    /// STOPPED with whatever exit data was recorded, never as an error.
    pub async fn refresh_status(&self, ctr: &Container) -> Result<ContainerState> {
        let binary = self.binary_for(ctr)?;
        let out = self
            .run(&binary, &["state".to_string(), ctr.id().to_string()], "state", ctr.id())
            .await;

        match out {
            Ok(stdout) => {
                let st: OciState = serde_json::from_slice(&stdout).map_err(|e| {
                    Error::InvalidArgument(format!(
                        "bad state JSON from runtime for {}: {e}",
                        ctr.id()
                    ))
                })?;
                match st.status.as_str() {
                    "creating" | "created" => {
                        ctr.apply_status(ContainerStatus::Created, st.pid)
                    }
                    "running" => ctr.apply_status(ContainerStatus::Running, st.pid),
                    "paused" => ctr.apply_status(ContainerStatus::Paused, st.pid),
                    "stopped" => self.mark_stopped_from_disk(ctr),
                    other => {
                        return Err(Error::InvalidArgument(format!(
                            "unknown runtime status '{other}' for {}",
                            ctr.id()
                        )))
                    }
                }
            }
            Err(Error::RuntimeFailed { .. }) => {
                // The runtime forgot the container (deleted, or the daemon
                // restarted past its lifetime).
                self.mark_stopped_from_disk(ctr);
            }
            Err(e) => return Err(e),
        }
        Ok(ctr.state())
    }

    /// Marks a container stopped, merging exit data from its exit file.
    fn mark_stopped_from_disk(&self, ctr: &Container) {
        let recorded = ctr.state().exit_code;
        match read_exit_file(&self.config.exits_dir, ctr.id()) {
            Some((code, finished_at)) => ctr.set_stopped(Some(finished_at), Some(code)),
            None => ctr.set_stopped(None, recorded),
        }
    }

    /// Runs a transient process inside the container, capturing output.
    ///
    /// The capture is bounded by the configured limit. On deadline expiry
    /// the exec process is killed and a distinct timeout error returned;
    /// the container itself is unaffected.
    pub async fn exec_sync(
        &self,
        ctr: &Container,
        argv: &[String],
        timeout: Option<Duration>,
    ) -> Result<ExecResult> {
        if argv.is_empty() {
            return Err(Error::InvalidArgument("empty exec command".to_string()));
        }
        if ctr.status() != ContainerStatus::Running {
            return Err(Error::FailedPrecondition {
                kind: "container",
                id: ctr.id().to_string(),
                state: ctr.status().to_string(),
                op: "exec",
            });
        }

        let binary = self.binary_for(ctr)?;
        let mut cmd = Command::new(&binary);
        cmd.arg("exec").arg(ctr.id()).args(argv);
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        // Dropping the future on timeout must take the exec down with it.
        cmd.kill_on_drop(true);

        let child = cmd.spawn()?;
        let output = match timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(output) => output?,
                Err(_) => {
                    return Err(Error::ExecTimeout {
                        id: ctr.id().to_string(),
                        timeout: limit,
                    })
                }
            },
            None => child.wait_with_output().await?,
        };

        let limit = self.config.exec_capture_limit;
        let mut stdout = output.stdout;
        let mut stderr = output.stderr;
        stdout.truncate(limit);
        stderr.truncate(limit);
        Ok(ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    /// Tells the runtime to forget the container. Safe after stop.
    pub async fn delete(&self, ctr: &Container) -> Result<()> {
        let _op = ctr.lock_op().await;
        self.delete_inner(ctr).await
    }

    async fn delete_inner(&self, ctr: &Container) -> Result<()> {
        let binary = self.binary_for(ctr)?;
        match self
            .run(
                &binary,
                &[
                    "delete".to_string(),
                    "--force".to_string(),
                    ctr.id().to_string(),
                ],
                "delete",
                ctr.id(),
            )
            .await
        {
            Ok(_) => Ok(()),
            // Already gone is the goal state.
            Err(Error::RuntimeFailed { stderr, .. })
                if stderr.contains("does not exist") || stderr.contains("not found") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn pause(&self, ctr: &Container) -> Result<()> {
        let _op = ctr.lock_op().await;
        if ctr.status() != ContainerStatus::Running {
            return Err(Error::FailedPrecondition {
                kind: "container",
                id: ctr.id().to_string(),
                state: ctr.status().to_string(),
                op: "pause",
            });
        }
        let binary = self.binary_for(ctr)?;
        self.run(&binary, &["pause".to_string(), ctr.id().to_string()], "pause", ctr.id())
            .await?;
        ctr.set_paused();
        Ok(())
    }

    pub async fn resume(&self, ctr: &Container) -> Result<()> {
        let _op = ctr.lock_op().await;
        if ctr.status() != ContainerStatus::Paused {
            return Err(Error::FailedPrecondition {
                kind: "container",
                id: ctr.id().to_string(),
                state: ctr.status().to_string(),
                op: "resume",
            });
        }
        let binary = self.binary_for(ctr)?;
        self.run(
            &binary,
            &["resume".to_string(), ctr.id().to_string()],
            "resume",
            ctr.id(),
        )
        .await?;
        ctr.set_resumed();
        Ok(())
    }

    /// Applies a new resource configuration to a running container.
    pub async fn update_resources(
        &self,
        ctr: &Container,
        resources: &serde_json::Value,
    ) -> Result<()> {
        let _op = ctr.lock_op().await;
        let path = ctr.run_dir().join("resources.json");
        atomic_write_json(&path, resources)?;
        let binary = self.binary_for(ctr)?;
        self.run(
            &binary,
            &[
                "update".to_string(),
                "--resources".to_string(),
                path.display().to_string(),
                ctr.id().to_string(),
            ],
            "update",
            ctr.id(),
        )
        .await
        .map(|_| ())
    }

    // =========================================================================
    // Checkpoint / Restore
    // =========================================================================

    /// Snapshots the container's memory and process state into `image_dir`.
    ///
    /// The runtime is always asked to leave the container running; the
    /// lifecycle engine performs the post-checkpoint stop itself so the
    /// configured stop signal applies.
    pub async fn checkpoint(
        &self,
        ctr: &Container,
        image_dir: &Path,
        tcp_established: bool,
    ) -> Result<()> {
        let _op = ctr.lock_op().await;
        let binary = self.binary_for(ctr)?;
        let mut args = vec![
            "checkpoint".to_string(),
            "--image-path".to_string(),
            image_dir.display().to_string(),
            "--leave-running".to_string(),
        ];
        if tcp_established {
            args.push("--tcp-established".to_string());
        }
        args.push(ctr.id().to_string());
        self.run(&binary, &args, "checkpoint", ctr.id()).await?;
        info!("checkpointed container {} to {}", ctr.id(), image_dir.display());
        Ok(())
    }

    /// Materializes a container from a checkpoint image directory.
    pub async fn restore(&self, ctr: &Container, image_dir: &Path) -> Result<()> {
        let _op = ctr.lock_op().await;
        self.write_bundle(ctr)?;
        let binary = self.binary_for(ctr)?;
        let pid_file = Self::pid_file(ctr);
        let args = vec![
            "restore".to_string(),
            "--detach".to_string(),
            "--bundle".to_string(),
            ctr.run_dir().display().to_string(),
            "--image-path".to_string(),
            image_dir.display().to_string(),
            "--pid-file".to_string(),
            pid_file.display().to_string(),
            ctr.id().to_string(),
        ];
        self.run(&binary, &args, "restore", ctr.id()).await?;

        ctr.set_created(read_pid_file(&pid_file));
        ctr.set_running();
        atomic_write_json(&ctr.state_path(), &ctr.state())?;
        info!("restored container {}", ctr.id());
        Ok(())
    }
}

/// True when a CRIU binary usable for checkpointing is on the PATH.
pub fn criu_available() -> bool {
    std::process::Command::new("criu")
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

// =============================================================================
// Exit and PID Files
// =============================================================================

fn read_pid_file(path: &Path) -> Option<i32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

/// Reads `<exits_dir>/<id>`: contents are the exit code, the file mtime
/// is the finish time.
pub(crate) fn read_exit_file(exits_dir: &Path, id: &str) -> Option<(i32, DateTime<Utc>)> {
    let path = exits_dir.join(id);
    let contents = std::fs::read_to_string(&path).ok()?;
    let code = contents.trim().parse::<i32>().ok()?;
    let finished_at = std::fs::metadata(&path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    Some((code, finished_at))
}
