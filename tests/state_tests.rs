//! Black-box tests for the in-memory state store.
//!
//! Builds real sandbox and container entities through the public API
//! and drives the store the way the lifecycle engine does: registration,
//! membership tracking, MCS level accounting, snapshot listing, and the
//! two flavors of sandbox removal.

use chrono::Utc;
use podbay::container::{Container, ContainerMetadata, ContainerParams};
use podbay::sandbox::{NamespaceOptions, PodSandboxMetadata, Sandbox, SandboxParams};
use podbay::state::{mcs_level_of, StateStore};
use podbay::{Error, SandboxState};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

fn sandbox(id: &str, process_label: &str) -> Arc<Sandbox> {
    Arc::new(Sandbox::new(SandboxParams {
        id: id.to_string(),
        name: format!("k8s_{id}_default_uid_0"),
        namespace: "default".to_string(),
        kube_name: id.to_string(),
        log_dir: String::new(),
        labels: HashMap::new(),
        annotations: HashMap::new(),
        process_label: process_label.to_string(),
        mount_label: String::new(),
        metadata: PodSandboxMetadata {
            name: id.to_string(),
            uid: "uid".to_string(),
            namespace: "default".to_string(),
            attempt: 0,
        },
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
    }))
}

fn container(id: &str, sandbox_id: &str) -> Arc<Container> {
    Arc::new(Container::new(ContainerParams {
        id: id.to_string(),
        name: format!("k8s_{id}_{sandbox_id}_default_uid_0"),
        sandbox_id: sandbox_id.to_string(),
        image: "docker.io/library/redis:latest".to_string(),
        image_name: "redis".to_string(),
        image_ref: String::new(),
        metadata: ContainerMetadata {
            name: id.to_string(),
            attempt: 0,
        },
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
    }))
}

#[test]
fn test_membership_flows_through_the_owning_sandbox() {
    let store = StateStore::new();
    let sb = sandbox("sb1", "");
    store.add_sandbox(sb.clone()).unwrap();

    store.add_container(container("c1", "sb1")).unwrap();
    store.add_container(container("c2", "sb1")).unwrap();
    assert_eq!(sb.container_ids(), vec!["c1".to_string(), "c2".to_string()]);
    assert!(store.has_container("c1"));

    // A container cannot exist without its sandbox.
    assert!(matches!(
        store.add_container(container("c3", "nope")),
        Err(Error::NotFound { .. })
    ));

    store.remove_container("c1");
    assert_eq!(sb.container_ids(), vec!["c2".to_string()]);
    assert!(!store.has_container("c1"));
}

#[test]
fn test_list_returns_detached_snapshots() {
    let store = StateStore::new();
    store.add_sandbox(sandbox("sb1", "")).unwrap();
    store.add_container(container("c1", "sb1")).unwrap();

    let sandboxes = store.list_sandboxes();
    let containers = store.list_containers();

    // Mutations after the snapshot do not disturb iteration.
    store.remove_container("c1");
    store.remove_sandbox("sb1").unwrap();
    assert_eq!(sandboxes.len(), 1);
    assert_eq!(containers.len(), 1);
    assert_eq!(containers[0].id(), "c1");
    assert_eq!(store.sandbox_count(), 0);
}

#[test]
fn test_infra_containers_live_in_their_own_map() {
    let store = StateStore::new();
    store.add_sandbox(sandbox("sb1", "")).unwrap();
    store.add_infra_container(container("sb1", "sb1")).unwrap();

    assert!(store.get_container("sb1").is_none());
    assert!(store.get_infra_container("sb1").is_some());
    // The combined lookup serves both maps.
    assert!(store.get_any_container("sb1").is_some());

    store.remove_infra_container("sb1");
    assert!(store.get_any_container("sb1").is_none());
}

#[test]
fn test_mcs_levels_release_at_zero() {
    let store = StateStore::new();
    let label = "system_u:system_r:container_t:s0:c12,c34";
    let level = mcs_level_of(label);
    assert_eq!(level, "s0:c12,c34");

    store.reserve_mcs_level(&level).unwrap();
    store.add_sandbox(sandbox("sb1", label)).unwrap();
    store.reserve_mcs_level(&level).unwrap();
    store.add_sandbox(sandbox("sb2", label)).unwrap();
    assert_eq!(store.mcs_level_refcount(&level), 2);

    store.remove_sandbox("sb1").unwrap();
    assert_eq!(store.mcs_level_refcount(&level), 1);
    store.remove_sandbox("sb2").unwrap();
    assert_eq!(store.mcs_level_refcount(&level), 0);

    // Empty levels are never tracked.
    store.reserve_mcs_level("").unwrap();
    assert_eq!(store.mcs_level_refcount(""), 0);
}

#[test]
fn test_forget_sandbox_skips_platform_cleanup() {
    let store = StateStore::new();
    let label = "system_u:system_r:container_t:s0:c7";
    let level = mcs_level_of(label);
    store.reserve_mcs_level(&level).unwrap();
    let sb = sandbox("sb1", label);
    store.add_sandbox(sb.clone()).unwrap();

    // Rollback-style removal: the map entry goes, the level stays with
    // its own compensation entry.
    store.forget_sandbox("sb1");
    assert!(store.get_sandbox("sb1").is_none());
    assert_eq!(sb.state(), SandboxState::Removed);
    assert_eq!(store.mcs_level_refcount(&level), 1);

    store.release_mcs_level(&level);
    assert_eq!(store.mcs_level_refcount(&level), 0);
}

#[test]
fn test_remove_sandbox_is_idempotent_and_marks_removed() {
    let store = StateStore::new();
    let sb = sandbox("sb1", "");
    store.add_sandbox(sb.clone()).unwrap();

    store.remove_sandbox("sb1").unwrap();
    assert_eq!(sb.state(), SandboxState::Removed);
    store.remove_sandbox("sb1").unwrap();
    store.remove_sandbox("never-existed").unwrap();
}
