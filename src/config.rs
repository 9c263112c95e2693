//! Daemon configuration.
//!
//! The daemon is configured once at startup; the [`Config`] value is shared
//! read-only across all request handlers. Transport, image storage, and CNI
//! configuration live with their own collaborators and are not modelled here.

use crate::constants::{
    DEFAULT_EXEC_CAPTURE_LIMIT, DEFAULT_EXITS_DIR, DEFAULT_MIN_ID_PREFIX_LEN,
    DEFAULT_NAMESPACES_DIR, DEFAULT_PINNS_PATH, DEFAULT_ROOT, DEFAULT_RUNTIME_HANDLER,
    DEFAULT_RUNTIME_PATH, DEFAULT_RUN_ROOT,
};
use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// A named OCI runtime variant selectable per sandbox.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeHandler {
    /// Path of the runtime binary (runc-shaped CLI).
    pub path: PathBuf,
}

/// Daemon configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Persistent state root; per-entity dirs live under
    /// `<root>/containers/<id>/`.
    pub root: PathBuf,

    /// Runtime state root; per-entity run dirs live under
    /// `<run_root>/containers/<id>/`.
    pub run_root: PathBuf,

    /// Directory holding pinned namespace bind mounts
    /// (`<namespaces_dir>/netns/<rand>` and friends).
    pub namespaces_dir: PathBuf,

    /// Path of the namespace-pinning helper binary.
    pub pinns_path: PathBuf,

    /// Directory the runtime supervisor writes exit files into.
    pub exits_dir: PathBuf,

    /// Runtime handlers by name. A sandbox's `runtime_handler` selects one;
    /// the empty string resolves to `default_runtime`.
    pub runtimes: HashMap<String, RuntimeHandler>,

    /// Name of the handler used when a sandbox does not select one.
    pub default_runtime: String,

    /// Whether sandboxes get daemon-managed pinned namespaces. When false,
    /// containers live in the namespaces of their infra process and
    /// rehydration does not join recorded paths.
    pub manage_ns_lifecycle: bool,

    /// Whether user-namespace ID mappings are configured. When false the
    /// user namespace is silently dropped from pin requests.
    pub id_mappings_configured: bool,

    /// Gates SELinux MCS level bookkeeping.
    pub selinux_enabled: bool,

    /// Minimum unambiguous id prefix length enforced by the id indices.
    pub min_id_prefix_len: usize,

    /// Maximum captured bytes per exec stream.
    pub exec_capture_limit: usize,

    /// Extra grace seconds granted after the stop signal before SIGKILL
    /// when the caller supplies no timeout.
    pub ctr_stop_timeout: i64,

    /// Probe for a usable CRIU binary before checkpoint/restore.
    /// Disable when the selected runtime carries its own checkpoint
    /// engine.
    pub check_criu: bool,
}

impl Default for Config {
    fn default() -> Self {
        let mut runtimes = HashMap::new();
        runtimes.insert(
            DEFAULT_RUNTIME_HANDLER.to_string(),
            RuntimeHandler {
                path: PathBuf::from(DEFAULT_RUNTIME_PATH),
            },
        );
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            run_root: PathBuf::from(DEFAULT_RUN_ROOT),
            namespaces_dir: PathBuf::from(DEFAULT_NAMESPACES_DIR),
            pinns_path: PathBuf::from(DEFAULT_PINNS_PATH),
            exits_dir: PathBuf::from(DEFAULT_EXITS_DIR),
            runtimes,
            default_runtime: DEFAULT_RUNTIME_HANDLER.to_string(),
            manage_ns_lifecycle: true,
            id_mappings_configured: false,
            selinux_enabled: true,
            min_id_prefix_len: DEFAULT_MIN_ID_PREFIX_LEN,
            exec_capture_limit: DEFAULT_EXEC_CAPTURE_LIMIT,
            ctr_stop_timeout: 10,
            check_criu: true,
        }
    }
}

impl Config {
    /// Creates a configuration rooted at custom state directories.
    ///
    /// Used by tests and by deployments that do not own `/var/lib` and
    /// `/run`; everything else keeps its default.
    pub fn with_roots(root: PathBuf, run_root: PathBuf) -> Self {
        let namespaces_dir = run_root.join("ns");
        let exits_dir = run_root.join("exits");
        Self {
            root,
            run_root,
            namespaces_dir,
            exits_dir,
            ..Self::default()
        }
    }

    /// Resolves a runtime handler name to its configuration.
    ///
    /// The empty string selects the default handler.
    pub fn runtime_for(&self, handler: &str) -> Result<&RuntimeHandler> {
        let name = if handler.is_empty() {
            self.default_runtime.as_str()
        } else {
            handler
        };
        self.runtimes
            .get(name)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown runtime handler '{name}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_handler_resolution() {
        let config = Config::default();
        assert!(config.runtime_for("").is_ok());
        assert!(config.runtime_for(DEFAULT_RUNTIME_HANDLER).is_ok());
        assert!(config.runtime_for("kata").is_err());
    }

    #[test]
    fn test_with_roots_derives_subdirs() {
        let config = Config::with_roots(PathBuf::from("/tmp/a"), PathBuf::from("/tmp/b"));
        assert_eq!(config.namespaces_dir, PathBuf::from("/tmp/b/ns"));
        assert_eq!(config.exits_dir, PathBuf::from("/tmp/b/exits"));
    }
}
