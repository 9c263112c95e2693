//! Exit-file watcher.
//!
//! The runtime supervisor writes `<exits_dir>/<container-id>` when a
//! container process dies, with the exit code as the file contents. One
//! watcher per daemon turns those files into state transitions: the
//! container is marked STOPPED, its `state.json` is rewritten, and exit
//! waiters are woken. Files already present at startup are drained during
//! rehydration so exits that happened while the daemon was down are not
//! lost.

use crate::container::ContainerStatus;
use crate::oci::read_exit_file;
use crate::state::StateStore;
use crate::storage::atomic_write_json;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Watches the exits directory for the lifetime of the daemon.
pub struct ExitMonitor {
    handle: JoinHandle<()>,
}

impl ExitMonitor {
    /// Starts watching `exits_dir`, creating it if needed.
    pub fn spawn(exits_dir: PathBuf, state: Arc<StateStore>) -> crate::error::Result<Self> {
        std::fs::create_dir_all(&exits_dir)?;

        let (tx, rx) = mpsc::channel::<notify::Result<Event>>(64);
        let mut watcher: RecommendedWatcher = notify::recommended_watcher(
            move |event: notify::Result<Event>| {
                // The watcher runs on its own thread; a full channel only
                // delays delivery, it never drops the file on disk.
                let _ = tx.blocking_send(event);
            },
        )
        .map_err(|e| crate::error::Error::Internal(format!("exit watcher: {e}")))?;
        watcher
            .watch(&exits_dir, RecursiveMode::NonRecursive)
            .map_err(|e| crate::error::Error::Internal(format!("exit watcher: {e}")))?;

        let handle = tokio::spawn(Self::run(watcher, rx, exits_dir, state));
        Ok(Self { handle })
    }

    async fn run(
        watcher: RecommendedWatcher,
        mut rx: mpsc::Receiver<notify::Result<Event>>,
        exits_dir: PathBuf,
        state: Arc<StateStore>,
    ) {
        // Keep the watcher alive as long as the task runs.
        let _watcher = watcher;
        while let Some(event) = rx.recv().await {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    warn!("exit watcher event error: {e}");
                    continue;
                }
            };
            if !(event.kind.is_create() || event.kind.is_modify()) {
                continue;
            }
            for path in &event.paths {
                // The handler touches shared state; a panic must not take
                // the monitor down with it.
                let result = catch_unwind(AssertUnwindSafe(|| {
                    handle_exit_file(&exits_dir, path, &state);
                }));
                if let Err(panic) = result {
                    error!("exit handler panicked for {}: {panic:?}", path.display());
                }
            }
        }
        debug!("exit monitor finished");
    }

    /// Stops the watcher task. Called from daemon shutdown.
    pub fn shutdown(self) {
        self.handle.abort();
    }
}

/// Applies one exit file to the matching container, if any.
///
/// Unknown ids are ignored: the supervisor may report exits for
/// containers another manager owns.
fn handle_exit_file(exits_dir: &Path, path: &Path, state: &StateStore) {
    let Some(id) = path.file_name().and_then(|n| n.to_str()) else {
        return;
    };
    let Some(ctr) = state.get_any_container(id) else {
        debug!("exit file for unknown container {id}, ignoring");
        return;
    };
    apply_exit(exits_dir, &ctr);
}

/// Drains exit files already on disk, applying them to known containers.
///
/// Called once after rehydration so exits from a daemon outage are
/// reflected before the first status request arrives.
pub fn drain_exit_dir(exits_dir: &Path, state: &StateStore) {
    let entries = match std::fs::read_dir(exits_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("cannot scan exits dir {}: {e}", exits_dir.display());
            return;
        }
    };
    for entry in entries.flatten() {
        handle_exit_file(exits_dir, &entry.path(), state);
    }
}

fn apply_exit(exits_dir: &Path, ctr: &crate::container::Container) {
    if ctr.status() == ContainerStatus::Stopped && ctr.state().exit_code.is_some() {
        return;
    }
    let Some((exit_code, finished_at)) = read_exit_file(exits_dir, ctr.id()) else {
        return;
    };
    debug!("container {} exited with code {exit_code}", ctr.id());
    ctr.set_stopped(Some(finished_at), Some(exit_code));
    if let Err(e) = atomic_write_json(&ctr.state_path(), &ctr.state()) {
        warn!("failed to persist state of {} after exit: {e}", ctr.id());
    }
}
