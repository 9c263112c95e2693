//! In-memory state store.
//!
//! The authoritative view of every sandbox and container on the node.
//! Three keyed maps (containers, infra containers, sandboxes) plus the
//! process-wide SELinux MCS level refcounts live behind one mutex; all
//! `list` operations return snapshots that are safe to iterate after the
//! lock is released.

use crate::container::Container;
use crate::error::{Error, Result};
use crate::sandbox::{Sandbox, SandboxState};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Default)]
struct StoreInner {
    containers: HashMap<String, Arc<Container>>,
    infra_containers: HashMap<String, Arc<Container>>,
    sandboxes: HashMap<String, Arc<Sandbox>>,
    /// Number of sandboxes per SELinux MCS level. A level is released
    /// when its count reaches zero.
    process_levels: HashMap<String, u32>,
}

/// Serialized store of all entities the daemon manages.
pub struct StateStore {
    inner: Mutex<StoreInner>,
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, StoreInner>> {
        self.inner
            .lock()
            .map_err(|e| Error::Internal(format!("state store lock poisoned: {e}")))
    }

    // =========================================================================
    // Sandboxes
    // =========================================================================

    /// Inserts a sandbox into the map.
    ///
    /// The MCS level must have been reserved beforehand via
    /// [`StateStore::reserve_mcs_level`]; removal releases it.
    pub fn add_sandbox(&self, sb: Arc<Sandbox>) -> Result<()> {
        let mut inner = self.lock()?;
        inner.sandboxes.insert(sb.id().to_string(), sb);
        Ok(())
    }

    /// Increments the refcount of an MCS level. Empty levels are ignored.
    pub fn reserve_mcs_level(&self, level: &str) -> Result<()> {
        if level.is_empty() {
            return Ok(());
        }
        let mut inner = self.lock()?;
        *inner.process_levels.entry(level.to_string()).or_insert(0) += 1;
        Ok(())
    }

    /// Decrements the refcount of an MCS level, releasing it at zero.
    pub fn release_mcs_level(&self, level: &str) {
        if level.is_empty() {
            return;
        }
        let Ok(mut inner) = self.lock() else { return };
        if let Some(count) = inner.process_levels.get_mut(level) {
            *count -= 1;
            if *count == 0 {
                inner.process_levels.remove(level);
                debug!("released MCS level {level}");
            }
        }
    }

    pub fn get_sandbox(&self, id: &str) -> Option<Arc<Sandbox>> {
        self.lock().ok()?.sandboxes.get(id).cloned()
    }

    pub fn has_sandbox(&self, id: &str) -> bool {
        self.get_sandbox(id).is_some()
    }

    /// Removes a sandbox: platform cleanup first, map deletion second,
    /// both under the store lock so observers see either a sandbox with
    /// namespaces or no sandbox at all.
    pub fn remove_sandbox(&self, id: &str) -> Result<()> {
        let mut inner = self.lock()?;
        let Some(sb) = inner.sandboxes.get(id).cloned() else {
            return Ok(());
        };

        sb.remove_namespaces()?;

        let level = mcs_level_of(sb.process_label());
        if !level.is_empty() {
            if let Some(count) = inner.process_levels.get_mut(&level) {
                *count -= 1;
                if *count == 0 {
                    inner.process_levels.remove(&level);
                    debug!("released MCS level {level}");
                }
            }
        }

        sb.set_state(SandboxState::Removed);
        inner.sandboxes.remove(id);
        Ok(())
    }

    /// Undoes a bare [`StateStore::add_sandbox`]: map removal without
    /// platform cleanup. Rollback paths use this because their undo
    /// stacks already carry dedicated namespace and MCS compensations.
    pub fn forget_sandbox(&self, id: &str) {
        if let Ok(mut inner) = self.lock() {
            if let Some(sb) = inner.sandboxes.remove(id) {
                sb.set_state(SandboxState::Removed);
            }
        }
    }

    /// Snapshot check used by tests and the status path.
    pub fn sandbox_count(&self) -> usize {
        self.lock().map(|inner| inner.sandboxes.len()).unwrap_or(0)
    }

    /// Snapshot of all sandboxes.
    pub fn list_sandboxes(&self) -> Vec<Arc<Sandbox>> {
        match self.lock() {
            Ok(inner) => inner.sandboxes.values().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    // =========================================================================
    // Containers
    // =========================================================================

    /// Inserts a container and appends it to its owning sandbox.
    ///
    /// Fails when the sandbox is unknown: every container's sandbox_id
    /// must refer to a stored sandbox.
    pub fn add_container(&self, ctr: Arc<Container>) -> Result<()> {
        let mut inner = self.lock()?;
        let sb = inner
            .sandboxes
            .get(ctr.sandbox_id())
            .ok_or_else(|| Error::not_found("sandbox", ctr.sandbox_id()))?;
        sb.add_container_id(ctr.id());
        inner.containers.insert(ctr.id().to_string(), ctr);
        Ok(())
    }

    pub fn get_container(&self, id: &str) -> Option<Arc<Container>> {
        self.lock().ok()?.containers.get(id).cloned()
    }

    pub fn has_container(&self, id: &str) -> bool {
        self.get_container(id).is_some()
    }

    /// Removes a container from the store and from its sandbox's list.
    pub fn remove_container(&self, id: &str) {
        let Ok(mut inner) = self.lock() else { return };
        if let Some(ctr) = inner.containers.remove(id) {
            if let Some(sb) = inner.sandboxes.get(ctr.sandbox_id()) {
                sb.remove_container_id(id);
            }
        }
    }

    /// Snapshot of all containers.
    pub fn list_containers(&self) -> Vec<Arc<Container>> {
        match self.lock() {
            Ok(inner) => inner.containers.values().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    // =========================================================================
    // Infra Containers
    // =========================================================================

    pub fn add_infra_container(&self, ctr: Arc<Container>) -> Result<()> {
        let mut inner = self.lock()?;
        inner.infra_containers.insert(ctr.id().to_string(), ctr);
        Ok(())
    }

    pub fn get_infra_container(&self, id: &str) -> Option<Arc<Container>> {
        self.lock().ok()?.infra_containers.get(id).cloned()
    }

    pub fn remove_infra_container(&self, id: &str) {
        if let Ok(mut inner) = self.lock() {
            inner.infra_containers.remove(id);
        }
    }

    pub fn list_infra_containers(&self) -> Vec<Arc<Container>> {
        match self.lock() {
            Ok(inner) => inner.infra_containers.values().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Looks up a container in the regular map first, then the infra map.
    pub fn get_any_container(&self, id: &str) -> Option<Arc<Container>> {
        let inner = self.lock().ok()?;
        inner
            .containers
            .get(id)
            .or_else(|| inner.infra_containers.get(id))
            .cloned()
    }

    // =========================================================================
    // MCS Levels
    // =========================================================================

    /// Current refcount of an MCS level; zero means released.
    pub fn mcs_level_refcount(&self, level: &str) -> u32 {
        match self.lock() {
            Ok(inner) => inner.process_levels.get(level).copied().unwrap_or(0),
            Err(_) => 0,
        }
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Extracts the MCS level ("s0:c1,c2") from a full SELinux process label
/// ("system_u:system_r:container_t:s0:c1,c2"). Empty when the label has
/// no level component.
pub fn mcs_level_of(process_label: &str) -> String {
    let fields: Vec<&str> = process_label.split(':').collect();
    if fields.len() < 4 {
        return String::new();
    }
    fields[3..].join(":")
}
