//! Checkpoint and restore.
//!
//! A checkpoint snapshots a running container's memory and process
//! state into a staging directory inside its persistent dir and,
//! optionally, packs staging + metadata + specs + mount-layer delta
//! into a single archive with a stable entry layout:
//!
//! ```text
//! metadata.json      who and what was checkpointed (compression as a
//!                    named string, never a bare integer)
//! config.json        the daemon-annotated OCI spec
//! spec.json          the bare OCI spec
//! checkpoint/...     the runtime's image directory
//! rootfs-diff.tar    mount layer delta (when one exists)
//! ```
//!
//! A restore materializes a *new* container from an archive or from an
//! existing staging directory, into the original sandbox when it still
//! exists or an explicitly supplied one, with the spec's namespace
//! paths rewritten to the target sandbox's.

use super::sandbox::Undo;
use super::ContainerServer;
use crate::annotations;
use crate::constants::{
    CHECKPOINT_DIR, CHECKPOINT_VERSION, CONFIG_FILE, METADATA_FILE, ROOTFS_DIFF_FILE,
    SPEC_DUMP_FILE,
};
use crate::container::{Container, ContainerParams, ContainerStatus};
use crate::error::{Error, Result};
use crate::oci::criu_available;
use crate::sandbox::namespaces::NamespaceKind;
use crate::sandbox::Sandbox;
use crate::spec::Spec;
use crate::storage::{atomic_write_json, read_json};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Options and Metadata
// =============================================================================

/// Compression applied to an exported checkpoint archive.
///
/// Persisted inside `metadata.json` as a named string so archives stay
/// readable across daemon versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    Gzip,
    #[default]
    Zstd,
}

impl std::str::FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "gzip" => Ok(Self::Gzip),
            "zstd" => Ok(Self::Zstd),
            other => Err(Error::InvalidArgument(format!(
                "unsupported compression algorithm '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Gzip => write!(f, "gzip"),
            Self::Zstd => write!(f, "zstd"),
        }
    }
}

/// CheckpointContainer options.
#[derive(Debug, Clone, Default)]
pub struct CheckpointOptions {
    /// Keep the container running after the snapshot.
    pub leave_running: bool,
    /// Keep the staging directory even after a successful export.
    pub keep: bool,
    /// Snapshot established TCP connections.
    pub tcp_established: bool,
    /// Allow re-exporting a stopped container's existing checkpoint.
    pub allow_stopped: bool,
    /// Export the checkpoint into this archive.
    pub archive: Option<PathBuf>,
    pub compression: Compression,
}

/// Archive/staging metadata describing what was checkpointed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointMetadata {
    pub version: u32,
    pub container_id: String,
    pub container_name: String,
    pub sandbox_id: String,
    pub sandbox_name: String,
    pub image: String,
    pub image_name: String,
    pub image_ref: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    pub compression: Compression,
    pub tcp_established: bool,
    pub checkpointed_at: DateTime<Utc>,
}

/// RestoreContainer request.
#[derive(Debug, Clone, Default)]
pub struct RestoreRequest {
    /// Existing checkpointed container to restore from (no-archive mode).
    pub container_id: Option<String>,
    /// Archive to unpack and restore from.
    pub archive: Option<PathBuf>,
    /// Target sandbox; defaults to the one recorded in the metadata.
    pub pod: Option<String>,
    /// Name for the restored container; defaults to the recorded name.
    pub name: Option<String>,
    /// Keep the unpacked staging directory after a successful restore.
    pub keep: bool,
    pub tcp_established: bool,
}

/// Outcome of a successful restore.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreResult {
    /// Id of the restored container.
    pub id: String,
    /// Id of the sandbox it was restored into.
    pub pod: String,
}

impl ContainerServer {
    fn ensure_criu(&self) -> Result<()> {
        if self.config().check_criu && !criu_available() {
            return Err(Error::FailedPrecondition {
                kind: "node",
                id: "criu".to_string(),
                state: "unavailable".to_string(),
                op: "checkpoint/restore",
            });
        }
        Ok(())
    }

    // =========================================================================
    // Checkpoint
    // =========================================================================

    /// Checkpoints a container, optionally exporting an archive.
    ///
    /// Returns the resolved container id.
    pub async fn checkpoint_container(
        &self,
        id: &str,
        opts: CheckpointOptions,
    ) -> Result<String> {
        self.ensure_criu()?;
        let ctr = self.resolve_container(id)?;
        let status = self.runtime().refresh_status(&ctr).await?.status;

        let staging = ctr.persistent_dir().join(CHECKPOINT_DIR);
        match status {
            ContainerStatus::Running => {
                self.runtime()
                    .checkpoint(&ctr, &staging, opts.tcp_established)
                    .await?;
            }
            ContainerStatus::Stopped if opts.allow_stopped => {
                if !staging.is_dir() {
                    return Err(Error::FailedPrecondition {
                        kind: "container",
                        id: ctr.id().to_string(),
                        state: "stopped without an existing checkpoint".to_string(),
                        op: "checkpoint",
                    });
                }
            }
            other => {
                return Err(Error::FailedPrecondition {
                    kind: "container",
                    id: ctr.id().to_string(),
                    state: other.to_string(),
                    op: "checkpoint",
                });
            }
        }

        let sandbox_name = self
            .state_store()
            .get_sandbox(ctr.sandbox_id())
            .map(|sb| sb.name().to_string())
            .unwrap_or_default();
        let metadata = CheckpointMetadata {
            version: CHECKPOINT_VERSION,
            container_id: ctr.id().to_string(),
            container_name: ctr.name().to_string(),
            sandbox_id: ctr.sandbox_id().to_string(),
            sandbox_name,
            image: ctr.image().to_string(),
            image_name: ctr.image_name().to_string(),
            image_ref: ctr.image_ref().to_string(),
            labels: ctr.labels().clone(),
            annotations: ctr.kube_annotations().clone(),
            compression: opts.compression,
            tcp_established: opts.tcp_established,
            checkpointed_at: Utc::now(),
        };
        atomic_write_json(&ctr.persistent_dir().join(METADATA_FILE), &metadata)?;

        if let Some(archive_path) = &opts.archive {
            export_archive(&ctr, &metadata, &staging, archive_path, opts.compression)?;
            info!(
                "exported checkpoint of {} to {} ({})",
                ctr.id(),
                archive_path.display(),
                opts.compression
            );
        }

        if !opts.leave_running && ctr.status() != ContainerStatus::Stopped {
            self.stop_container_and_wait(&ctr, self.config().ctr_stop_timeout)
                .await?;
            self.container_state_to_disk(&ctr).await?;
        }

        if opts.archive.is_some() && !opts.keep {
            if let Err(e) = std::fs::remove_dir_all(&staging) {
                warn!("failed to remove staging dir of {}: {e}", ctr.id());
            }
        }

        info!("checkpointed container {}", ctr.id());
        Ok(ctr.id().to_string())
    }

    // =========================================================================
    // Restore
    // =========================================================================

    /// Restores a new container from an archive or a staging directory.
    pub async fn restore_container(&self, req: RestoreRequest) -> Result<RestoreResult> {
        self.ensure_criu()?;

        let new_id = Self::generate_id();
        let mut undo = Vec::new();
        match self.restore_container_steps(&new_id, &req, &mut undo).await {
            Ok(result) => {
                info!("restored container {} into sandbox {}", result.id, result.pod);
                Ok(result)
            }
            Err(e) => {
                self.rollback(undo).await;
                Err(e)
            }
        }
    }

    async fn restore_container_steps(
        &self,
        new_id: &str,
        req: &RestoreRequest,
        undo: &mut Vec<Undo>,
    ) -> Result<RestoreResult> {
        let (persistent_dir, run_dir) = self.storage().create_entity_dirs(new_id)?;
        undo.push(Undo::DeleteDirs(new_id.to_string()));

        // Materialize metadata + spec + staging into the new persistent
        // dir, either from the archive or from the source container.
        let (metadata, mut spec) = match (&req.archive, &req.container_id) {
            (Some(archive), _) => {
                unpack_archive(archive, &persistent_dir)?;
                let metadata: CheckpointMetadata =
                    read_json(&persistent_dir.join(METADATA_FILE))?;
                let spec: Spec = read_json(&persistent_dir.join(CONFIG_FILE))?;
                (metadata, spec)
            }
            (None, Some(source_id)) => {
                let source = self.resolve_container(source_id)?;
                let source_staging = source.persistent_dir().join(CHECKPOINT_DIR);
                if !source_staging.is_dir() {
                    return Err(Error::FailedPrecondition {
                        kind: "container",
                        id: source.id().to_string(),
                        state: "no checkpoint staging directory".to_string(),
                        op: "restore",
                    });
                }
                let metadata: CheckpointMetadata =
                    read_json(&source.persistent_dir().join(METADATA_FILE))?;
                copy_dir(&source_staging, &persistent_dir.join(CHECKPOINT_DIR))?;
                (metadata, source.spec().clone())
            }
            (None, None) => {
                return Err(Error::InvalidArgument(
                    "restore needs an archive or a container id".to_string(),
                ));
            }
        };

        // Target sandbox: explicit --pod wins, then the recorded one.
        let target = match &req.pod {
            Some(pod) => self.resolve_sandbox(pod)?,
            None => self
                .state_store()
                .get_sandbox(&metadata.sandbox_id)
                .ok_or_else(|| Error::not_found("sandbox", metadata.sandbox_id.clone()))?,
        };
        if !target.is_ready() {
            return Err(Error::FailedPrecondition {
                kind: "sandbox",
                id: target.id().to_string(),
                state: target.state().to_string(),
                op: "restore container",
            });
        }

        let name = req
            .name
            .clone()
            .unwrap_or_else(|| metadata.container_name.clone());
        self.reserve_container_name(new_id, &name)?;
        undo.push(Undo::ReleaseCtrName(name.clone()));

        rewrite_namespace_paths(&mut spec, &target);

        let decoded = annotations::decode_container(&spec)?;
        let mut params = ContainerParams {
            id: new_id.to_string(),
            name,
            sandbox_id: target.id().to_string(),
            image: metadata.image.clone(),
            image_name: metadata.image_name.clone(),
            image_ref: metadata.image_ref.clone(),
            metadata: decoded.metadata.clone(),
            run_dir,
            persistent_dir: persistent_dir.clone(),
            log_path: decoded.log_path.clone(),
            labels: metadata.labels.clone(),
            annotations: HashMap::new(),
            kube_annotations: metadata.annotations.clone(),
            mount_point: String::new(),
            volumes: decoded.volumes.clone(),
            spec,
            tty: decoded.tty,
            stdin: decoded.stdin,
            stdin_once: decoded.stdin_once,
            runtime_handler: target.runtime_handler().to_string(),
            created: Utc::now(),
            stop_signal: decoded.stop_signal.clone(),
            seccomp_profile_path: decoded.seccomp_profile_path.clone(),
        };
        let daemon_annotations = annotations::container_annotations(&params)?;
        params.annotations = daemon_annotations.clone();
        params.spec.annotations = daemon_annotations;
        let ctr = Arc::new(Container::new(params));

        let staging = persistent_dir.join(CHECKPOINT_DIR);
        self.runtime().restore(&ctr, &staging).await?;
        undo.push(Undo::RuntimeDelete(ctr.clone()));

        self.state_store().add_container(ctr.clone())?;
        undo.push(Undo::DeregisterContainer {
            container_id: new_id.to_string(),
        });
        self.ctr_id_index().add(new_id)?;

        self.container_state_to_disk(&ctr).await?;

        if !req.keep {
            if let Err(e) = std::fs::remove_dir_all(&staging) {
                debug!("failed to remove restore staging dir: {e}");
            }
        }

        Ok(RestoreResult {
            id: new_id.to_string(),
            pod: target.id().to_string(),
        })
    }
}

/// Points the spec's namespace entries at the target sandbox.
fn rewrite_namespace_paths(spec: &mut Spec, target: &Sandbox) {
    for kind in [
        NamespaceKind::Net,
        NamespaceKind::Ipc,
        NamespaceKind::Uts,
        NamespaceKind::User,
    ] {
        if let Some(path) = target.ns_path(kind) {
            spec.set_ns_path(kind.spec_type(), path.display().to_string());
        }
    }
    if let Some(pid_path) = target.pid_ns_path() {
        spec.set_ns_path("pid", pid_path);
    }
}

// =============================================================================
// Archive Writer
// =============================================================================

enum ArchiveWriter {
    Plain(File),
    Gzip(GzEncoder<File>),
    Zstd(zstd::stream::write::Encoder<'static, File>),
}

impl Write for ArchiveWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(w) => w.write(buf),
            Self::Gzip(w) => w.write(buf),
            Self::Zstd(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Plain(w) => w.flush(),
            Self::Gzip(w) => w.flush(),
            Self::Zstd(w) => w.flush(),
        }
    }
}

impl ArchiveWriter {
    fn create(path: &Path, compression: Compression) -> Result<Self> {
        let file = File::create(path)?;
        Ok(match compression {
            Compression::None => Self::Plain(file),
            Compression::Gzip => Self::Gzip(GzEncoder::new(file, flate2::Compression::default())),
            Compression::Zstd => Self::Zstd(
                zstd::stream::write::Encoder::new(file, 3)
                    .map_err(|e| Error::Internal(format!("zstd encoder: {e}")))?,
            ),
        })
    }

    fn finish(self) -> Result<()> {
        match self {
            Self::Plain(mut w) => w.flush()?,
            Self::Gzip(w) => {
                w.finish()?;
            }
            Self::Zstd(w) => {
                w.finish()
                    .map_err(|e| Error::Internal(format!("zstd finish: {e}")))?;
            }
        }
        Ok(())
    }
}

fn append_bytes<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    data: &[u8],
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o600);
    header.set_cksum();
    builder.append_data(&mut header, name, data)?;
    Ok(())
}

/// Packs staging + metadata + specs + mount delta into one archive.
fn export_archive(
    ctr: &Container,
    metadata: &CheckpointMetadata,
    staging: &Path,
    archive_path: &Path,
    compression: Compression,
) -> Result<()> {
    let writer = ArchiveWriter::create(archive_path, compression)?;
    let mut builder = tar::Builder::new(writer);

    append_bytes(&mut builder, METADATA_FILE, &serde_json::to_vec(metadata)?)?;
    append_bytes(&mut builder, SPEC_DUMP_FILE, &serde_json::to_vec(ctr.spec())?)?;
    let config = std::fs::read(ctr.persistent_dir().join(CONFIG_FILE))?;
    append_bytes(&mut builder, CONFIG_FILE, &config)?;

    if staging.is_dir() {
        builder.append_dir_all(CHECKPOINT_DIR, staging)?;
    }

    // Mount layer delta, when the storage collaborator produced one.
    let diff_dir = ctr.persistent_dir().join("diff");
    if diff_dir.is_dir() {
        let mut inner = Vec::new();
        {
            let mut diff_builder = tar::Builder::new(&mut inner);
            diff_builder.append_dir_all(".", &diff_dir)?;
            diff_builder.finish()?;
        }
        append_bytes(&mut builder, ROOTFS_DIFF_FILE, &inner)?;
    }

    let writer = builder.into_inner()?;
    writer.finish()
}

// =============================================================================
// Archive Reader
// =============================================================================

/// Sniffs the archive's compression from its magic bytes.
fn sniff_compression(file: &mut File) -> Result<Compression> {
    let mut magic = [0u8; 4];
    let n = file.read(&mut magic)?;
    file.seek(SeekFrom::Start(0))?;
    if n >= 2 && magic[0] == 0x1f && magic[1] == 0x8b {
        return Ok(Compression::Gzip);
    }
    if n >= 4 && magic == [0x28, 0xb5, 0x2f, 0xfd] {
        return Ok(Compression::Zstd);
    }
    Ok(Compression::None)
}

/// Unpacks a checkpoint archive into a fresh persistent directory.
///
/// Entry paths are validated before extraction: absolute paths and
/// parent traversals are rejected outright.
fn unpack_archive(archive_path: &Path, dst: &Path) -> Result<()> {
    let mut file = File::open(archive_path)?;
    let compression = sniff_compression(&mut file)?;
    let reader: Box<dyn Read> = match compression {
        Compression::None => Box::new(file),
        Compression::Gzip => Box::new(GzDecoder::new(file)),
        Compression::Zstd => Box::new(
            zstd::stream::read::Decoder::new(file)
                .map_err(|e| Error::Internal(format!("zstd decoder: {e}")))?,
        ),
    };

    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let raw = path.to_string_lossy();
        if raw.starts_with('/') || raw.split('/').any(|c| c == "..") {
            return Err(Error::InvalidArgument(format!(
                "archive entry escapes extraction root: {raw}"
            )));
        }
        entry.unpack_in(dst)?;
    }

    for required in [METADATA_FILE, CONFIG_FILE] {
        if !dst.join(required).is_file() {
            return Err(Error::InvalidArgument(format!(
                "archive is missing {required}"
            )));
        }
    }
    debug!(
        "unpacked checkpoint archive {} ({compression}) into {}",
        archive_path.display(),
        dst.display()
    );
    Ok(())
}

/// Recursively copies a directory tree.
fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
