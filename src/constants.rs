//! Constants for the daemon core.
//!
//! All limits, timeouts, paths, and file names are defined here to ensure
//! consistency and prevent magic numbers throughout the codebase.

use std::time::Duration;

// =============================================================================
// Identifiers
// =============================================================================

/// Length of an entity id in lowercase hex characters.
pub const ID_LEN: usize = 64;

/// Default minimum unambiguous id prefix length.
///
/// Additions to the truncated-id index are refused when a new id shares
/// this many leading characters with a stored id, so prefix lookups of
/// this length stay unambiguous.
pub const DEFAULT_MIN_ID_PREFIX_LEN: usize = 12;

// =============================================================================
// On-Disk Layout
// =============================================================================

/// File carrying the OCI runtime spec plus daemon annotations.
pub const CONFIG_FILE: &str = "config.json";

/// File carrying the container runtime state (atomic-write).
pub const STATE_FILE: &str = "state.json";

/// File carrying checkpoint metadata inside a persistent dir or archive.
pub const METADATA_FILE: &str = "metadata.json";

/// Bare OCI spec entry inside a checkpoint archive.
pub const SPEC_DUMP_FILE: &str = "spec.json";

/// Mount layer delta entry inside a checkpoint archive.
pub const ROOTFS_DIFF_FILE: &str = "rootfs-diff.tar";

/// Staging directory for checkpoint images inside a persistent dir.
pub const CHECKPOINT_DIR: &str = "checkpoint";

/// Subdirectory of the state roots holding per-entity directories.
pub const CONTAINERS_DIR: &str = "containers";

/// Default persistent state root.
pub const DEFAULT_ROOT: &str = "/var/lib/podbay";

/// Default runtime state root.
pub const DEFAULT_RUN_ROOT: &str = "/run/podbay";

/// Default directory for pinned namespaces.
pub const DEFAULT_NAMESPACES_DIR: &str = "/run/podbay/ns";

/// Default directory the runtime supervisor drops exit files into.
pub const DEFAULT_EXITS_DIR: &str = "/run/podbay/exits";

/// Default path of the namespace-pinning helper binary.
pub const DEFAULT_PINNS_PATH: &str = "/usr/libexec/podbay/pinns";

/// Default OCI runtime binary.
pub const DEFAULT_RUNTIME_PATH: &str = "/usr/bin/runc";

/// Name of the default runtime handler.
pub const DEFAULT_RUNTIME_HANDLER: &str = "runc";

/// Command run as the infra (pause) process of a sandbox.
pub const INFRA_COMMAND: &str = "/pause";

// =============================================================================
// Timeouts
// =============================================================================

/// Extra grace period after SIGKILL before giving up on a stop.
pub const KILL_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Poll interval while waiting for a container to reach STOPPED.
pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Grace period used when stopping a whole sandbox.
pub const SANDBOX_STOP_TIMEOUT: i64 = 10;

// =============================================================================
// Exec
// =============================================================================

/// Maximum captured bytes per exec stream (stdout and stderr each).
pub const DEFAULT_EXEC_CAPTURE_LIMIT: usize = 16 * 1024 * 1024;

// =============================================================================
// OCI Spec Versions
// =============================================================================

/// OCI Runtime Spec version written into generated specs.
pub const OCI_RUNTIME_SPEC_VERSION: &str = "1.0.2";

/// Stop-signal image annotation carried over from the container image.
pub const STOP_SIGNAL_ANNOTATION: &str = "org.opencontainers.image.stopSignal";

// =============================================================================
// Checkpoint Archives
// =============================================================================

/// Version tag written into checkpoint metadata.
pub const CHECKPOINT_VERSION: u32 = 1;
