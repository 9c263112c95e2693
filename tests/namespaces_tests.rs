//! Black-box tests for the sandbox namespace manager.
//!
//! Every process can open its own `/proc/self/ns/*` files without
//! privileges, which is enough to exercise joining, per-kind
//! exclusivity, removal idempotency, and the liveness-gated PID
//! namespace path through the public API. Pinning itself needs the
//! helper binary and is covered by the unit tests with a scripted
//! helper.

use chrono::Utc;
use podbay::container::{Container, ContainerMetadata, ContainerParams};
use podbay::sandbox::namespaces::{get_namespace, NamespaceKind};
use podbay::sandbox::{NamespaceOptions, PodSandboxMetadata, Sandbox, SandboxParams};
use podbay::Error;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn sandbox(id: &str) -> Sandbox {
    Sandbox::new(SandboxParams {
        id: id.to_string(),
        name: format!("k8s_{id}_default_uid_0"),
        namespace: "default".to_string(),
        kube_name: id.to_string(),
        log_dir: String::new(),
        labels: HashMap::new(),
        annotations: HashMap::new(),
        process_label: String::new(),
        mount_label: String::new(),
        metadata: PodSandboxMetadata::default(),
        shm_path: String::new(),
        cgroup_parent: String::new(),
        privileged: false,
        runtime_handler: String::new(),
        resolv_path: String::new(),
        hostname: String::new(),
        hostname_path: String::new(),
        port_mappings: Vec::new(),
        host_network: false,
        namespace_options: NamespaceOptions::default(),
        seccomp_profile_path: String::new(),
        created: Utc::now(),
    })
}

fn infra(id: &str, pid: i32) -> Arc<Container> {
    let ctr = Arc::new(Container::new(ContainerParams {
        id: id.to_string(),
        name: format!("k8s_POD_{id}"),
        sandbox_id: id.to_string(),
        image: String::new(),
        image_name: String::new(),
        image_ref: String::new(),
        metadata: ContainerMetadata::default(),
        run_dir: PathBuf::new(),
        persistent_dir: PathBuf::new(),
        log_path: String::new(),
        labels: HashMap::new(),
        annotations: HashMap::new(),
        kube_annotations: HashMap::new(),
        mount_point: String::new(),
        volumes: Vec::new(),
        spec: podbay::spec::Spec::base(),
        tty: false,
        stdin: false,
        stdin_once: false,
        runtime_handler: String::new(),
        created: Utc::now(),
        stop_signal: String::new(),
        seccomp_profile_path: String::new(),
    }));
    ctr.set_created(Some(pid));
    ctr
}

#[test]
fn test_joining_own_proc_namespaces() {
    let sb = sandbox("sb1");
    for (kind, path) in [
        (NamespaceKind::Net, "/proc/self/ns/net"),
        (NamespaceKind::Ipc, "/proc/self/ns/ipc"),
        (NamespaceKind::Uts, "/proc/self/ns/uts"),
    ] {
        sb.ns_join(kind, Path::new(path)).unwrap();
        assert_eq!(sb.ns_path(kind), Some(PathBuf::from(path)));
    }
    assert_eq!(sb.ns_path(NamespaceKind::User), None);
}

#[test]
fn test_one_handle_per_kind() {
    let sb = sandbox("sb2");
    sb.ns_join(NamespaceKind::Ipc, Path::new("/proc/self/ns/ipc"))
        .unwrap();
    let err = sb
        .ns_join(NamespaceKind::Ipc, Path::new("/proc/self/ns/ipc"))
        .unwrap_err();
    assert!(matches!(err, Error::FailedPrecondition { .. }));
    // Other kinds stay joinable.
    sb.ns_join(NamespaceKind::Uts, Path::new("/proc/self/ns/uts"))
        .unwrap();
}

#[test]
fn test_join_verifies_nsfs_membership() {
    let temp = tempfile::tempdir().unwrap();
    let fake = temp.path().join("net");
    std::fs::write(&fake, b"not a namespace").unwrap();

    assert!(matches!(
        get_namespace(NamespaceKind::Net, &fake),
        Err(Error::Namespace { .. })
    ));
    assert!(matches!(
        get_namespace(NamespaceKind::Net, &temp.path().join("absent")),
        Err(Error::Namespace { .. })
    ));
}

#[test]
fn test_joined_records_survive_removal_untouched() {
    let sb = sandbox("sb3");
    sb.ns_join(NamespaceKind::Net, Path::new("/proc/self/ns/net"))
        .unwrap();

    sb.remove_namespaces().unwrap();
    assert_eq!(sb.ns_path(NamespaceKind::Net), None);
    // Removal never deletes externally supplied paths.
    assert!(Path::new("/proc/self/ns/net").exists());
    // And running it again is a no-op.
    sb.remove_namespaces().unwrap();
}

#[test]
fn test_pid_namespace_path_tracks_infra_liveness() {
    let own_pid = std::process::id() as i32;
    let sb = sandbox("sb4");
    assert_eq!(sb.pid_ns_path(), None);

    sb.set_infra_container(infra("sb4", own_pid)).unwrap();
    assert_eq!(sb.pid_ns_path(), Some(format!("/proc/{own_pid}/ns/pid")));

    // A dead infra process yields no PID namespace path.
    let sb_dead = sandbox("sb5");
    sb_dead
        .set_infra_container(infra("sb5", 999_999_999))
        .unwrap();
    assert_eq!(sb_dead.pid_ns_path(), None);
}
