//! # podbay
//!
//! **Node-Level Container Runtime Daemon Core**
//!
//! This crate implements the core of a CRI (Container Runtime Interface)
//! daemon: the lifecycle engine behind `RunPodSandbox`, `CreateContainer`
//! and friends, delegating actual container execution to an external OCI
//! runtime binary. The gRPC transport, image pulling, and CNI plumbing
//! are collaborators outside this crate.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        ContainerServer                           │
//! │  RunPodSandbox · CreateContainer · StartContainer · StopContainer│
//! │  ExecSync · CheckpointContainer · RestoreContainer · ...         │
//! ├───────────────┬──────────────┬───────────────┬───────────────────┤
//! │ Name/ID       │ State store  │ Namespace     │ On-disk state     │
//! │ indices       │ containers + │ manager       │ config.json +     │
//! │ (registrar +  │ sandboxes +  │ pin / join /  │ state.json,       │
//! │  hex trie)    │ MCS levels   │ remove        │ atomic writes     │
//! ├───────────────┴──────────────┴───────────────┴───────────────────┤
//! │                      OCI runtime mediator                        │
//! │   create · start · kill · state · delete · exec · checkpoint     │
//! │   exit-file watcher │ stop/wait with deadlines │ runc-shaped CLI │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! Sandboxes progress `READY → STOPPED → REMOVED`; containers progress
//! `CREATED → RUNNING ⇄ PAUSED → STOPPED → removed`. Transitions are
//! driven only by the lifecycle engine; readers observe snapshots.
//!
//! ```text
//!   RunPodSandbox            CreateContainer       StartContainer
//!        │                         │                     │
//!        ▼                         ▼                     ▼
//!   ┌─────────┐   per pod    ┌──────────┐          ┌──────────┐
//!   │  READY  │ ───────────► │ CREATED  │ ───────► │ RUNNING  │
//!   └────┬────┘              └──────────┘          └────┬─────┘
//!        │ StopPodSandbox                StopContainer  │  exit file
//!        ▼                                              ▼
//!   ┌─────────┐                                    ┌──────────┐
//!   │ STOPPED │                                    │ STOPPED  │
//!   └─────────┘                                    └──────────┘
//! ```
//!
//! # Durability
//!
//! There is no database. Every entity persists as a directory holding
//! the OCI spec (`config.json`, carrying the daemon's own fields as
//! reserved annotations) and the runtime state (`state.json`, written
//! atomically). At startup the daemon rescans those directories,
//! loading sandboxes before containers and skipping anything another
//! manager owns, then drains exit files written while it was down.
//!
//! # Example
//!
//! ```rust,ignore
//! use podbay::{Config, ContainerServer, SandboxConfig, ContainerConfig};
//!
//! #[tokio::main]
//! async fn main() -> podbay::Result<()> {
//!     let server = ContainerServer::new(Config::default())?;
//!     server.load_state().await?;
//!
//!     let pod = server.run_pod_sandbox(SandboxConfig {
//!         metadata: podbay::sandbox::PodSandboxMetadata {
//!             name: "pod-a".into(),
//!             namespace: "default".into(),
//!             ..Default::default()
//!         },
//!         ..Default::default()
//!     }).await?;
//!
//!     let ctr = server.create_container(&pod, ContainerConfig {
//!         metadata: podbay::container::ContainerMetadata {
//!             name: "redis".into(),
//!             attempt: 0,
//!         },
//!         image: "docker.io/library/redis:latest".into(),
//!         command: vec!["redis-server".into()],
//!         ..Default::default()
//!     }).await?;
//!     server.start_container(&ctr).await?;
//!     Ok(())
//! }
//! ```

// =============================================================================
// Modules
// =============================================================================

pub mod annotations;
pub mod config;
pub mod constants;
pub mod container;
pub mod error;
pub mod index;
pub mod oci;
pub mod process;
pub mod sandbox;
pub mod server;
pub mod spec;
pub mod state;
pub mod storage;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{Config, RuntimeHandler};
pub use container::{Container, ContainerState, ContainerStatus};
pub use error::{Error, Result};
pub use sandbox::{Sandbox, SandboxState};
pub use server::{
    CheckpointOptions, Compression, ContainerConfig, ContainerServer, RestoreRequest,
    RestoreResult, SandboxConfig,
};
