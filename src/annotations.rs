//! Daemon annotations embedded in the OCI runtime spec.
//!
//! Everything the daemon must know to rebuild an entity after a restart
//! is recorded in the spec's `annotations` map under the reserved
//! `io.podbay.` namespace, plus the cross-runtime
//! `io.container.manager` marker that tells managers apart. Structured
//! values (labels, metadata, port mappings, ...) are JSON-encoded
//! strings.

use crate::constants::STOP_SIGNAL_ANNOTATION;
use crate::container::{ContainerMetadata, ContainerParams, ContainerVolume};
use crate::error::{Error, Result};
use crate::sandbox::{NamespaceOptions, PodSandboxMetadata, PortMapping, Sandbox};
use crate::spec::Spec;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;

// =============================================================================
// Keys
// =============================================================================

/// Marker key identifying which daemon manages an on-disk entity.
pub const CONTAINER_MANAGER: &str = "io.container.manager";

/// Value of [`CONTAINER_MANAGER`] for entities this daemon owns.
pub const MANAGER_NAME: &str = "podbay";

pub const CONTAINER_TYPE: &str = "io.podbay.ContainerType";
pub const CONTAINER_TYPE_SANDBOX: &str = "sandbox";
pub const CONTAINER_TYPE_CONTAINER: &str = "container";

pub const NAME: &str = "io.podbay.Name";
pub const KUBE_NAME: &str = "io.podbay.KubeName";
pub const NAMESPACE: &str = "io.podbay.Namespace";
pub const CONTAINER_ID: &str = "io.podbay.ContainerID";
pub const CONTAINER_NAME: &str = "io.podbay.ContainerName";
pub const SANDBOX_ID: &str = "io.podbay.SandboxID";
pub const SANDBOX_NAME: &str = "io.podbay.SandboxName";
pub const IMAGE: &str = "io.podbay.Image";
pub const IMAGE_NAME: &str = "io.podbay.ImageName";
pub const IMAGE_REF: &str = "io.podbay.ImageRef";
pub const LABELS: &str = "io.podbay.Labels";
pub const ANNOTATIONS: &str = "io.podbay.Annotations";
pub const METADATA: &str = "io.podbay.Metadata";
pub const LOG_DIR: &str = "io.podbay.LogDir";
pub const LOG_PATH: &str = "io.podbay.LogPath";
pub const MOUNT_POINT: &str = "io.podbay.MountPoint";
pub const VOLUMES: &str = "io.podbay.Volumes";
pub const PRIVILEGED: &str = "io.podbay.PrivilegedRuntime";
pub const HOST_NETWORK: &str = "io.podbay.HostNetwork";
pub const NAMESPACE_OPTIONS: &str = "io.podbay.NamespaceOptions";
pub const RUNTIME_HANDLER: &str = "io.podbay.RuntimeHandler";
pub const RESOLV_PATH: &str = "io.podbay.ResolvPath";
pub const HOSTNAME: &str = "io.podbay.HostName";
pub const HOSTNAME_PATH: &str = "io.podbay.HostnamePath";
pub const PORT_MAPPINGS: &str = "io.podbay.PortMappings";
pub const SECCOMP_PROFILE_PATH: &str = "io.podbay.SeccompProfilePath";
pub const CREATED: &str = "io.podbay.Created";
pub const TTY: &str = "io.podbay.TTY";
pub const STDIN: &str = "io.podbay.Stdin";
pub const STDIN_ONCE: &str = "io.podbay.StdinOnce";
pub const CGROUP_PARENT: &str = "io.podbay.CgroupParent";
pub const SHM_PATH: &str = "io.podbay.ShmPath";

// =============================================================================
// Helpers
// =============================================================================

fn bool_str(v: bool) -> String {
    if v { "true" } else { "false" }.to_string()
}

fn is_true(v: Option<&String>) -> bool {
    v.map(|s| s == "true").unwrap_or(false)
}

fn json_field<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn parse_json_field<T: DeserializeOwned + Default>(
    annotations: &HashMap<String, String>,
    key: &str,
) -> Result<T> {
    match annotations.get(key) {
        None => Ok(T::default()),
        Some(raw) if raw.is_empty() => Ok(T::default()),
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| Error::InvalidArgument(format!("bad {key} annotation: {e}"))),
    }
}

fn required<'a>(annotations: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    annotations
        .get(key)
        .map(|s| s.as_str())
        .ok_or_else(|| Error::InvalidArgument(format!("missing {key} annotation")))
}

fn optional(annotations: &HashMap<String, String>, key: &str) -> String {
    annotations.get(key).cloned().unwrap_or_default()
}

fn rfc3339_nanos(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_created(annotations: &HashMap<String, String>) -> Result<DateTime<Utc>> {
    let raw = required(annotations, CREATED)?;
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| Error::InvalidArgument(format!("bad {CREATED} annotation: {e}")))
}

/// True when the spec's manager marker names this daemon.
pub fn is_managed(spec: &Spec) -> bool {
    spec.annotations
        .get(CONTAINER_MANAGER)
        .map(|m| m == MANAGER_NAME)
        .unwrap_or(false)
}

/// Whether the spec describes a sandbox (infra) or a workload container.
pub fn entity_type(spec: &Spec) -> Option<&str> {
    spec.annotations.get(CONTAINER_TYPE).map(|s| s.as_str())
}

// =============================================================================
// Encoding
// =============================================================================

/// Annotations written into a sandbox's (infra container's) spec.
pub fn sandbox_annotations(sb: &Sandbox, infra_name: &str) -> Result<HashMap<String, String>> {
    let mut a = HashMap::new();
    a.insert(CONTAINER_MANAGER.to_string(), MANAGER_NAME.to_string());
    a.insert(CONTAINER_TYPE.to_string(), CONTAINER_TYPE_SANDBOX.to_string());
    a.insert(NAME.to_string(), sb.name().to_string());
    a.insert(KUBE_NAME.to_string(), sb.kube_name().to_string());
    a.insert(NAMESPACE.to_string(), sb.namespace().to_string());
    a.insert(SANDBOX_ID.to_string(), sb.id().to_string());
    a.insert(CONTAINER_ID.to_string(), sb.id().to_string());
    a.insert(CONTAINER_NAME.to_string(), infra_name.to_string());
    a.insert(LABELS.to_string(), json_field(sb.labels())?);
    a.insert(ANNOTATIONS.to_string(), json_field(sb.annotations())?);
    a.insert(METADATA.to_string(), json_field(sb.metadata())?);
    a.insert(LOG_DIR.to_string(), sb.log_dir().to_string());
    a.insert(SHM_PATH.to_string(), sb.shm_path().to_string());
    a.insert(CGROUP_PARENT.to_string(), sb.cgroup_parent().to_string());
    a.insert(PRIVILEGED.to_string(), bool_str(sb.privileged()));
    a.insert(RUNTIME_HANDLER.to_string(), sb.runtime_handler().to_string());
    a.insert(RESOLV_PATH.to_string(), sb.resolv_path().to_string());
    a.insert(HOSTNAME.to_string(), sb.hostname().to_string());
    a.insert(HOSTNAME_PATH.to_string(), sb.hostname_path().to_string());
    a.insert(PORT_MAPPINGS.to_string(), json_field(&sb.port_mappings())?);
    a.insert(HOST_NETWORK.to_string(), bool_str(sb.host_network()));
    a.insert(
        NAMESPACE_OPTIONS.to_string(),
        json_field(&sb.namespace_options())?,
    );
    a.insert(
        SECCOMP_PROFILE_PATH.to_string(),
        sb.seccomp_profile_path().to_string(),
    );
    a.insert(CREATED.to_string(), rfc3339_nanos(sb.created()));
    Ok(a)
}

/// Annotations written into a workload container's spec.
///
/// Takes the construction params rather than the finished entity so the
/// annotations can be spliced into the spec before the container object
/// is built.
pub fn container_annotations(params: &ContainerParams) -> Result<HashMap<String, String>> {
    let mut a = HashMap::new();
    a.insert(CONTAINER_MANAGER.to_string(), MANAGER_NAME.to_string());
    a.insert(
        CONTAINER_TYPE.to_string(),
        CONTAINER_TYPE_CONTAINER.to_string(),
    );
    a.insert(NAME.to_string(), params.name.clone());
    a.insert(CONTAINER_ID.to_string(), params.id.clone());
    a.insert(SANDBOX_ID.to_string(), params.sandbox_id.clone());
    a.insert(IMAGE.to_string(), params.image.clone());
    a.insert(IMAGE_NAME.to_string(), params.image_name.clone());
    a.insert(IMAGE_REF.to_string(), params.image_ref.clone());
    a.insert(LABELS.to_string(), json_field(&params.labels)?);
    a.insert(ANNOTATIONS.to_string(), json_field(&params.kube_annotations)?);
    a.insert(METADATA.to_string(), json_field(&params.metadata)?);
    a.insert(LOG_PATH.to_string(), params.log_path.clone());
    a.insert(MOUNT_POINT.to_string(), params.mount_point.clone());
    a.insert(VOLUMES.to_string(), json_field(&params.volumes)?);
    a.insert(RUNTIME_HANDLER.to_string(), params.runtime_handler.clone());
    a.insert(
        SECCOMP_PROFILE_PATH.to_string(),
        params.seccomp_profile_path.clone(),
    );
    a.insert(CREATED.to_string(), rfc3339_nanos(params.created));
    a.insert(TTY.to_string(), bool_str(params.tty));
    a.insert(STDIN.to_string(), bool_str(params.stdin));
    a.insert(STDIN_ONCE.to_string(), bool_str(params.stdin_once));
    if !params.stop_signal.is_empty() {
        a.insert(
            STOP_SIGNAL_ANNOTATION.to_string(),
            params.stop_signal.clone(),
        );
    }
    Ok(a)
}

// =============================================================================
// Decoding
// =============================================================================

/// Sandbox fields recovered from an on-disk spec.
#[derive(Debug)]
pub struct DecodedSandbox {
    pub id: String,
    pub name: String,
    pub kube_name: String,
    pub namespace: String,
    pub infra_name: String,
    pub log_dir: String,
    pub labels: HashMap<String, String>,
    pub kube_annotations: HashMap<String, String>,
    pub metadata: PodSandboxMetadata,
    pub process_label: String,
    pub mount_label: String,
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

/// Decodes a sandbox from its infra container's spec.
///
/// Returns the [`Error::NonManagedEntity`] sentinel for specs owned by a
/// different manager and [`Error::InvalidArgument`] for corrupt
/// annotations.
pub fn decode_sandbox(spec: &Spec) -> Result<DecodedSandbox> {
    if !is_managed(spec) {
        return Err(Error::NonManagedEntity);
    }
    let a = &spec.annotations;
    Ok(DecodedSandbox {
        id: required(a, SANDBOX_ID)?.to_string(),
        name: required(a, NAME)?.to_string(),
        kube_name: optional(a, KUBE_NAME),
        namespace: optional(a, NAMESPACE),
        infra_name: required(a, CONTAINER_NAME)?.to_string(),
        log_dir: optional(a, LOG_DIR),
        labels: parse_json_field(a, LABELS)?,
        kube_annotations: parse_json_field(a, ANNOTATIONS)?,
        metadata: parse_json_field(a, METADATA)?,
        process_label: spec
            .process
            .as_ref()
            .and_then(|p| p.selinux_label.clone())
            .unwrap_or_default(),
        mount_label: spec
            .linux
            .as_ref()
            .and_then(|l| l.mount_label.clone())
            .unwrap_or_default(),
        shm_path: optional(a, SHM_PATH),
        cgroup_parent: optional(a, CGROUP_PARENT),
        privileged: is_true(a.get(PRIVILEGED)),
        runtime_handler: optional(a, RUNTIME_HANDLER),
        resolv_path: optional(a, RESOLV_PATH),
        hostname: optional(a, HOSTNAME),
        hostname_path: optional(a, HOSTNAME_PATH),
        port_mappings: parse_json_field(a, PORT_MAPPINGS)?,
        host_network: is_true(a.get(HOST_NETWORK)),
        namespace_options: parse_json_field(a, NAMESPACE_OPTIONS)?,
        seccomp_profile_path: optional(a, SECCOMP_PROFILE_PATH),
        created: parse_created(a)?,
    })
}

/// Container fields recovered from an on-disk spec.
#[derive(Debug)]
pub struct DecodedContainer {
    pub id: String,
    pub name: String,
    pub sandbox_id: String,
    pub image: String,
    pub image_name: String,
    pub image_ref: String,
    pub metadata: ContainerMetadata,
    pub labels: HashMap<String, String>,
    pub kube_annotations: HashMap<String, String>,
    pub log_path: String,
    pub mount_point: String,
    pub volumes: Vec<ContainerVolume>,
    pub runtime_handler: String,
    pub tty: bool,
    pub stdin: bool,
    pub stdin_once: bool,
    pub stop_signal: String,
    pub seccomp_profile_path: String,
    pub created: DateTime<Utc>,
}

/// Decodes a workload container from its on-disk spec.
pub fn decode_container(spec: &Spec) -> Result<DecodedContainer> {
    if !is_managed(spec) {
        return Err(Error::NonManagedEntity);
    }
    let a = &spec.annotations;
    Ok(DecodedContainer {
        id: required(a, CONTAINER_ID)?.to_string(),
        name: required(a, NAME)?.to_string(),
        sandbox_id: required(a, SANDBOX_ID)?.to_string(),
        image: optional(a, IMAGE),
        image_name: optional(a, IMAGE_NAME),
        image_ref: optional(a, IMAGE_REF),
        metadata: parse_json_field(a, METADATA)?,
        labels: parse_json_field(a, LABELS)?,
        kube_annotations: parse_json_field(a, ANNOTATIONS)?,
        log_path: optional(a, LOG_PATH),
        mount_point: optional(a, MOUNT_POINT),
        volumes: parse_json_field(a, VOLUMES)?,
        runtime_handler: optional(a, RUNTIME_HANDLER),
        tty: is_true(a.get(TTY)),
        stdin: is_true(a.get(STDIN)),
        stdin_once: is_true(a.get(STDIN_ONCE)),
        stop_signal: optional(a, STOP_SIGNAL_ANNOTATION),
        seccomp_profile_path: optional(a, SECCOMP_PROFILE_PATH),
        created: parse_created(a)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::Spec;

    #[test]
    fn test_manager_marker() {
        let mut spec = Spec::base();
        assert!(!is_managed(&spec));
        assert!(matches!(
            decode_container(&spec),
            Err(Error::NonManagedEntity)
        ));

        spec.annotations
            .insert(CONTAINER_MANAGER.to_string(), "someone-else".to_string());
        assert!(!is_managed(&spec));

        spec.annotations
            .insert(CONTAINER_MANAGER.to_string(), MANAGER_NAME.to_string());
        assert!(is_managed(&spec));
    }

    #[test]
    fn test_decode_rejects_corrupt_json_fields() {
        let mut spec = Spec::base();
        spec.annotations
            .insert(CONTAINER_MANAGER.to_string(), MANAGER_NAME.to_string());
        spec.annotations
            .insert(CONTAINER_ID.to_string(), "c".repeat(64));
        spec.annotations.insert(NAME.to_string(), "c1".to_string());
        spec.annotations
            .insert(SANDBOX_ID.to_string(), "s".repeat(64));
        spec.annotations.insert(
            CREATED.to_string(),
            rfc3339_nanos(Utc::now()),
        );
        spec.annotations
            .insert(LABELS.to_string(), "{not json".to_string());

        let err = decode_container(&spec).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_created_roundtrip_keeps_nanos() {
        let ts = Utc::now();
        let encoded = rfc3339_nanos(ts);
        let mut a = HashMap::new();
        a.insert(CREATED.to_string(), encoded);
        let back = parse_created(&a).unwrap();
        assert_eq!(back, ts);
    }
}
