//! Pinned namespace management.
//!
//! A sandbox's namespaces must outlive any container process, so the
//! daemon pins them: a helper binary unshares the requested namespaces
//! and bind-mounts their files under the namespaces directory. Later
//! containers join by path. Joined (externally supplied) paths are
//! tracked with the same record type but are never unmounted or deleted
//! by the daemon.

use crate::config::Config;
use crate::error::{Error, Result};
use nix::mount::{umount2, MntFlags};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tracing::{debug, warn};

// =============================================================================
// Namespace Kind
// =============================================================================

/// Namespace kinds the manager pins.
///
/// The PID namespace is deliberately absent: it cannot outlive its init
/// process, so its path is always derived from the live infra PID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NamespaceKind {
    Net,
    Ipc,
    Uts,
    User,
}

impl NamespaceKind {
    /// Flag understood by the pinning helper.
    pub fn helper_flag(&self) -> &'static str {
        match self {
            Self::Net => "-n",
            Self::Ipc => "-i",
            Self::Uts => "-u",
            Self::User => "-U",
        }
    }

    /// Subdirectory of the namespaces dir holding pins of this kind.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Net => "netns",
            Self::Ipc => "ipcns",
            Self::Uts => "utsns",
            Self::User => "userns",
        }
    }

    /// Namespace type name as spelled in the OCI runtime spec.
    pub fn spec_type(&self) -> &'static str {
        match self {
            Self::Net => "network",
            Self::Ipc => "ipc",
            Self::Uts => "uts",
            Self::User => "user",
        }
    }
}

impl std::fmt::Display for NamespaceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Net => write!(f, "net"),
            Self::Ipc => write!(f, "ipc"),
            Self::Uts => write!(f, "uts"),
            Self::User => write!(f, "user"),
        }
    }
}

// =============================================================================
// Namespace Record
// =============================================================================

struct HandleState {
    /// Open handle keeping the namespace referenced; dropped on remove.
    file: Option<File>,
    closed: bool,
}

/// A namespace handle held by a sandbox.
///
/// `managed` records whether the daemon pinned this namespace itself.
/// Removal unmounts and deletes only managed paths; joined paths are
/// merely closed.
pub struct Namespace {
    kind: NamespaceKind,
    path: PathBuf,
    managed: bool,
    handle: Mutex<HandleState>,
}

impl Namespace {
    pub fn kind(&self) -> NamespaceKind {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_managed(&self) -> bool {
        self.managed
    }

    /// Closes the handle and, for managed namespaces, lazily unmounts and
    /// deletes the pinned path.
    ///
    /// Idempotent: subsequent calls after the first are no-ops.
    pub fn remove(&self) -> Result<()> {
        let mut handle = self
            .handle
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))?;
        if handle.closed {
            return Ok(());
        }
        handle.file.take();
        handle.closed = true;

        if !self.managed {
            return Ok(());
        }

        lazy_unmount(&self.path)?;
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(Error::Namespace {
                    path: self.path.clone(),
                    reason: format!("remove: {e}"),
                });
            }
        }
        debug!("removed pinned {} namespace at {}", self.kind, self.path.display());
        Ok(())
    }
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("kind", &self.kind)
            .field("path", &self.path)
            .field("managed", &self.managed)
            .finish()
    }
}

// =============================================================================
// Pinning and Joining
// =============================================================================

/// Opens a path and verifies it refers to a namespace via the NSFS magic.
fn open_namespace(path: &Path) -> Result<File> {
    let file = File::open(path).map_err(|e| Error::Namespace {
        path: path.to_path_buf(),
        reason: format!("open: {e}"),
    })?;
    let fs = nix::sys::statfs::fstatfs(&file).map_err(|e| Error::Namespace {
        path: path.to_path_buf(),
        reason: format!("statfs: {e}"),
    })?;
    if fs.filesystem_type() != nix::sys::statfs::NSFS_MAGIC {
        return Err(Error::Namespace {
            path: path.to_path_buf(),
            reason: "not a namespace file".to_string(),
        });
    }
    Ok(file)
}

/// Detaches a mount without waiting for it to become unused.
///
/// "Not mounted" and "already gone" both count as success so cleanup
/// paths stay idempotent.
fn lazy_unmount(path: &Path) -> Result<()> {
    match umount2(path, MntFlags::MNT_DETACH) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOENT) => Ok(()),
        Err(e) => Err(Error::Namespace {
            path: path.to_path_buf(),
            reason: format!("unmount: {e}"),
        }),
    }
}

/// Creates persistent namespaces of the requested kinds.
///
/// The helper is invoked once with one flag per kind plus the target
/// directory and a random file name; on success it has bind-mounted one
/// file per kind at `<dir>/<kind>ns/<name>`. On helper failure every
/// would-be path is lazily unmounted before the error is returned.
///
/// The user namespace is silently dropped from the request when no ID
/// mappings are configured.
pub async fn pin_namespaces(
    kinds: &[NamespaceKind],
    config: &Config,
) -> Result<Vec<Arc<Namespace>>> {
    let kinds: Vec<NamespaceKind> = kinds
        .iter()
        .copied()
        .filter(|kind| *kind != NamespaceKind::User || config.id_mappings_configured)
        .collect();
    if kinds.is_empty() {
        return Ok(Vec::new());
    }

    let pin_name = uuid::Uuid::new_v4().to_string();
    let mut args: Vec<String> = vec![
        "-d".to_string(),
        config.namespaces_dir.display().to_string(),
        "-f".to_string(),
        pin_name.clone(),
    ];
    let mut pinned: Vec<(NamespaceKind, PathBuf)> = Vec::with_capacity(kinds.len());
    for kind in &kinds {
        args.push(kind.helper_flag().to_string());
        pinned.push((
            *kind,
            config.namespaces_dir.join(kind.dir_name()).join(&pin_name),
        ));
    }

    debug!("calling {} with {:?}", config.pinns_path.display(), args);
    let output = Command::new(&config.pinns_path)
        .args(&args)
        .output()
        .await
        .map_err(|e| Error::RuntimeFailed {
            binary: config.pinns_path.display().to_string(),
            op: "pin",
            id: pin_name.clone(),
            stderr: e.to_string(),
        })?;

    if !output.status.success() {
        // The helper may have mounted a subset before failing.
        let mut first_cleanup_err = None;
        for (_, path) in &pinned {
            if let Err(e) = lazy_unmount(path) {
                warn!("cleanup after pin failure: {e}");
                first_cleanup_err.get_or_insert(e);
            }
        }
        if let Some(e) = first_cleanup_err {
            return Err(e);
        }
        return Err(Error::RuntimeFailed {
            binary: config.pinns_path.display().to_string(),
            op: "pin",
            id: pin_name,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let mut namespaces = Vec::with_capacity(pinned.len());
    for (kind, path) in pinned {
        let file = open_namespace(&path)?;
        namespaces.push(Arc::new(Namespace {
            kind,
            path,
            managed: true,
            handle: Mutex::new(HandleState {
                file: Some(file),
                closed: false,
            }),
        }));
    }
    Ok(namespaces)
}

/// Wraps an externally supplied namespace path in a joined record.
///
/// The path is verified to be a namespace file; removal of a joined
/// record never touches the filesystem.
pub fn get_namespace(kind: NamespaceKind, path: &Path) -> Result<Arc<Namespace>> {
    join_namespace(kind, path, false)
}

/// Re-adopts a namespace this daemon pinned in a previous life.
///
/// Rehydration uses this for paths under the daemon's own namespaces
/// directory: the record is managed again, so sandbox removal unmounts
/// and deletes the pin exactly as if the daemon had never restarted.
pub fn adopt_pinned_namespace(kind: NamespaceKind, path: &Path) -> Result<Arc<Namespace>> {
    join_namespace(kind, path, true)
}

fn join_namespace(kind: NamespaceKind, path: &Path, managed: bool) -> Result<Arc<Namespace>> {
    let file = open_namespace(path)?;
    Ok(Arc::new(Namespace {
        kind,
        path: path.to_path_buf(),
        managed,
        handle: Mutex::new(HandleState {
            file: Some(file),
            closed: false,
        }),
    }))
}
