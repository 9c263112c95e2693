//! Minimal typed model of the OCI runtime spec (`config.json`).
//!
//! Only the subset the daemon reads and writes is modelled: process,
//! root, mounts, annotations, and the Linux namespace list. Everything
//! else round-trips through `extra` fields untouched so specs produced
//! by other tooling survive a load/store cycle.
//!
//! Ref: https://github.com/opencontainers/runtime-spec/blob/main/config.md

use crate::constants::OCI_RUNTIME_SPEC_VERSION;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// OCI runtime spec, as stored in `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spec {
    pub oci_version: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<Process>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<Root>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub linux: Option<Linux>,

    /// Fields the daemon does not interpret (hooks, capabilities, ...).
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// The container process section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    #[serde(default)]
    pub terminal: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    #[serde(default)]
    pub cwd: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub selinux_label: Option<String>,

    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// The root filesystem section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Root {
    pub path: String,

    #[serde(default)]
    pub readonly: bool,
}

/// A single mount entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    pub destination: String,

    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub mount_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// The Linux platform section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Linux {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<LinuxNamespace>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mount_label: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cgroups_path: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<serde_json::Value>,

    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// A Linux namespace entry.
///
/// An entry without a path asks the runtime to unshare a fresh namespace;
/// an entry with a path joins the namespace pinned at that path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinuxNamespace {
    #[serde(rename = "type")]
    pub ns_type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl Spec {
    /// Creates an empty spec carrying only the version header.
    pub fn base() -> Self {
        Self {
            oci_version: OCI_RUNTIME_SPEC_VERSION.to_string(),
            process: None,
            root: None,
            hostname: None,
            mounts: Vec::new(),
            annotations: HashMap::new(),
            linux: None,
            extra: HashMap::new(),
        }
    }

    /// Returns the recorded path of the given namespace type, if any.
    ///
    /// An entry with an empty path counts as absent: it means the runtime
    /// unshared a fresh namespace rather than joining a pinned one.
    pub fn ns_path(&self, ns_type: &str) -> Option<&str> {
        let linux = self.linux.as_ref()?;
        linux
            .namespaces
            .iter()
            .find(|ns| ns.ns_type == ns_type)
            .and_then(|ns| ns.path.as_deref())
            .filter(|p| !p.is_empty())
    }

    /// Sets or replaces the path of the given namespace type.
    ///
    /// Used by restore to point a recreated container at the namespaces of
    /// its target sandbox.
    pub fn set_ns_path(&mut self, ns_type: &str, path: String) {
        let linux = self.linux.get_or_insert_with(Linux::default);
        if let Some(ns) = linux.namespaces.iter_mut().find(|ns| ns.ns_type == ns_type) {
            ns.path = Some(path);
        } else {
            linux.namespaces.push(LinuxNamespace {
                ns_type: ns_type.to_string(),
                path: Some(path),
            });
        }
    }
}
