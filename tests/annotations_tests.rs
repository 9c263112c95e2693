//! Black-box tests for the daemon annotation codec.
//!
//! Encodes live sandbox/container entities into a spec's annotations
//! map and decodes them back the way startup rehydration does, checking
//! the fields the engine actually depends on rather than a mechanical
//! field grid.

use chrono::Utc;
use podbay::annotations;
use podbay::container::{ContainerMetadata, ContainerParams, ContainerVolume};
use podbay::sandbox::{
    NamespaceOptions, PodSandboxMetadata, PortMapping, Sandbox, SandboxParams,
};
use podbay::spec::{Process, Spec};
use podbay::Error;
use std::collections::HashMap;
use std::path::PathBuf;

fn sample_sandbox() -> Sandbox {
    let mut labels = HashMap::new();
    labels.insert("app".to_string(), "web".to_string());
    let mut kube_annotations = HashMap::new();
    kube_annotations.insert("team".to_string(), "storage".to_string());

    Sandbox::new(SandboxParams {
        id: "f0".repeat(32),
        name: "k8s_pod-a_default_uid-1_2".to_string(),
        namespace: "default".to_string(),
        kube_name: "pod-a".to_string(),
        log_dir: "/var/log/pods/pod-a".to_string(),
        labels,
        annotations: kube_annotations,
        process_label: String::new(),
        mount_label: String::new(),
        metadata: PodSandboxMetadata {
            name: "pod-a".to_string(),
            uid: "uid-1".to_string(),
            namespace: "default".to_string(),
            attempt: 2,
        },
        shm_path: "/dev/shm".to_string(),
        cgroup_parent: "/kubepods".to_string(),
        privileged: true,
        runtime_handler: "runc".to_string(),
        resolv_path: "/run/resolv.conf".to_string(),
        hostname: "pod-a".to_string(),
        hostname_path: "/run/hostname".to_string(),
        port_mappings: vec![PortMapping {
            container_port: 6379,
            host_port: 16379,
            protocol: "tcp".to_string(),
            host_ip: "127.0.0.1".to_string(),
        }],
        host_network: false,
        namespace_options: NamespaceOptions {
            host_ipc: true,
            ..Default::default()
        },
        seccomp_profile_path: "runtime/default".to_string(),
        created: Utc::now(),
    })
}

#[test]
fn test_sandbox_roundtrip_preserves_engine_fields() {
    let sb = sample_sandbox();
    let infra_name = "k8s_POD_pod-a_default_uid-1_2";

    let mut spec = Spec::base();
    spec.annotations = annotations::sandbox_annotations(&sb, infra_name).unwrap();
    spec.process = Some(Process {
        selinux_label: Some("system_u:system_r:container_t:s0:c5".to_string()),
        ..Default::default()
    });

    assert!(annotations::is_managed(&spec));
    assert_eq!(
        annotations::entity_type(&spec),
        Some(annotations::CONTAINER_TYPE_SANDBOX)
    );

    let decoded = annotations::decode_sandbox(&spec).unwrap();
    assert_eq!(decoded.id, sb.id());
    assert_eq!(decoded.name, sb.name());
    assert_eq!(decoded.infra_name, infra_name);
    assert_eq!(decoded.kube_name, "pod-a");
    assert_eq!(decoded.metadata.attempt, 2);
    assert_eq!(decoded.labels.get("app").map(String::as_str), Some("web"));
    assert_eq!(decoded.port_mappings.len(), 1);
    assert_eq!(decoded.port_mappings[0].host_port, 16379);
    assert!(decoded.namespace_options.host_ipc);
    assert!(!decoded.host_network);
    assert!(decoded.privileged);
    assert_eq!(decoded.process_label, "system_u:system_r:container_t:s0:c5");
    // Created survives with nanosecond precision.
    assert_eq!(decoded.created, sb.created());
}

#[test]
fn test_container_roundtrip_preserves_engine_fields() {
    let params = ContainerParams {
        id: "0d".repeat(32),
        name: "k8s_redis_pod-a_default_uid-1_0".to_string(),
        sandbox_id: "f0".repeat(32),
        image: "docker.io/library/redis:latest".to_string(),
        image_name: "redis".to_string(),
        image_ref: "sha256:4f4fb700ef54".to_string(),
        metadata: ContainerMetadata {
            name: "redis".to_string(),
            attempt: 0,
        },
        run_dir: PathBuf::from("/run/podbay/containers/x"),
        persistent_dir: PathBuf::from("/var/lib/podbay/containers/x"),
        log_path: "/var/log/pods/pod-a/redis.log".to_string(),
        labels: HashMap::new(),
        annotations: HashMap::new(),
        kube_annotations: HashMap::new(),
        mount_point: "/var/lib/podbay/overlay/x".to_string(),
        volumes: vec![ContainerVolume {
            container_path: "/data".to_string(),
            host_path: "/srv/redis".to_string(),
            readonly: false,
        }],
        spec: Spec::base(),
        tty: true,
        stdin: true,
        stdin_once: false,
        runtime_handler: "runc".to_string(),
        created: Utc::now(),
        stop_signal: "SIGQUIT".to_string(),
        seccomp_profile_path: String::new(),
    };

    let mut spec = Spec::base();
    spec.annotations = annotations::container_annotations(&params).unwrap();

    assert_eq!(
        annotations::entity_type(&spec),
        Some(annotations::CONTAINER_TYPE_CONTAINER)
    );

    let decoded = annotations::decode_container(&spec).unwrap();
    assert_eq!(decoded.id, params.id);
    assert_eq!(decoded.name, params.name);
    assert_eq!(decoded.sandbox_id, params.sandbox_id);
    assert_eq!(decoded.image, params.image);
    assert_eq!(decoded.log_path, params.log_path);
    assert_eq!(decoded.mount_point, params.mount_point);
    assert_eq!(decoded.volumes.len(), 1);
    assert_eq!(decoded.volumes[0].host_path, "/srv/redis");
    assert!(decoded.tty);
    assert!(decoded.stdin);
    assert!(!decoded.stdin_once);
    assert_eq!(decoded.stop_signal, "SIGQUIT");
    assert_eq!(decoded.created, params.created);
}

#[test]
fn test_foreign_specs_are_sentinel_not_error() {
    let sb = sample_sandbox();
    let mut spec = Spec::base();
    spec.annotations = annotations::sandbox_annotations(&sb, "infra").unwrap();
    spec.annotations.insert(
        annotations::CONTAINER_MANAGER.to_string(),
        "some-other-engine".to_string(),
    );

    assert!(!annotations::is_managed(&spec));
    let err = annotations::decode_sandbox(&spec).unwrap_err();
    assert!(err.is_non_managed());
    assert!(matches!(err, Error::NonManagedEntity));
}

#[test]
fn test_missing_required_annotation_is_invalid_argument() {
    let sb = sample_sandbox();
    let mut spec = Spec::base();
    spec.annotations = annotations::sandbox_annotations(&sb, "infra").unwrap();
    spec.annotations.remove(annotations::CREATED);

    assert!(matches!(
        annotations::decode_sandbox(&spec),
        Err(Error::InvalidArgument(_))
    ));
}
