//! Identifier indices: name reservation and truncated-id resolution.
//!
//! Two indices exist per entity kind (pod, container):
//!
//! - [`NameRegistrar`] hands out exclusive name reservations so two
//!   concurrent creates cannot claim the same name.
//! - [`TruncIndex`] resolves user-supplied id prefixes to full 64-hex
//!   ids, the way `podbay-cr c3f2` finds container `c3f2ab...`.
//!
//! Both are shared by concurrent request handlers and guard their own
//! state.

use crate::constants::ID_LEN;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Mutex;

// =============================================================================
// Name Registrar
// =============================================================================

/// Exclusive name → id reservations.
///
/// Reserving the same `(name, id)` pair twice is idempotent; reserving a
/// name held by a different id fails. Releasing an unreserved name is a
/// no-op. A reservation is either promoted to a live entity or released
/// by the caller's rollback path.
pub struct NameRegistrar {
    inner: Mutex<HashMap<String, String>>,
}

impl NameRegistrar {
    /// Creates an empty registrar.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Reserves `name` for `id`.
    pub fn reserve(&self, name: &str, id: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("empty name".to_string()));
        }
        let mut names = self
            .inner
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))?;
        match names.get(name) {
            Some(existing) if existing == id => Ok(()),
            Some(existing) => Err(Error::AlreadyReserved {
                name: name.to_string(),
                id: existing.clone(),
            }),
            None => {
                names.insert(name.to_string(), id.to_string());
                Ok(())
            }
        }
    }

    /// Releases `name` so it can be reserved again. No-op when absent.
    pub fn release(&self, name: &str) {
        if let Ok(mut names) = self.inner.lock() {
            names.remove(name);
        }
    }

    /// Returns the id a name is reserved for, if any.
    pub fn get(&self, name: &str) -> Option<String> {
        self.inner.lock().ok()?.get(name).cloned()
    }

    /// Returns all names reserved for `id`, in unspecified order.
    pub fn names_for_id(&self, id: &str) -> Vec<String> {
        match self.inner.lock() {
            Ok(names) => names
                .iter()
                .filter(|(_, v)| v.as_str() == id)
                .map(|(k, _)| k.clone())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

impl Default for NameRegistrar {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Truncated-ID Index
// =============================================================================

/// One node of the 16-way hex trie backing [`TruncIndex`].
#[derive(Default)]
struct TrieNode {
    children: [Option<Box<TrieNode>>; 16],
    /// Number of stored ids below (and at) this node.
    count: usize,
    /// True when a full id terminates here.
    terminal: bool,
}

/// Prefix-searchable index of full 64-hex ids.
///
/// Lookup walks one trie level per prefix character, so resolution is
/// O(len(prefix)) regardless of how many ids are stored. Additions are
/// refused when the new id shares its first `min_prefix_len` characters
/// with a stored id, keeping minimum-length lookups unambiguous.
pub struct TruncIndex {
    root: Mutex<TrieNode>,
    min_prefix_len: usize,
}

fn nibble(c: char) -> Option<usize> {
    c.to_digit(16).map(|d| d as usize)
}

impl TruncIndex {
    /// Creates an empty index with the given minimum prefix length.
    pub fn new(min_prefix_len: usize) -> Self {
        Self {
            root: Mutex::new(TrieNode::default()),
            min_prefix_len,
        }
    }

    fn validate(id: &str) -> Result<()> {
        if id.len() != ID_LEN || !id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()) {
            return Err(Error::InvalidArgument(format!(
                "id '{id}' is not a {ID_LEN}-character lowercase hex string"
            )));
        }
        Ok(())
    }

    /// Adds a full id to the index.
    pub fn add(&self, id: &str) -> Result<()> {
        Self::validate(id)?;
        let mut root = self
            .root
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))?;

        // Walk the first min_prefix_len characters without inserting: if a
        // stored id already lives under that whole prefix, a lookup of
        // minimum length could never distinguish the two.
        {
            let mut node = &*root;
            let mut collided = true;
            for c in id.chars().take(self.min_prefix_len) {
                let idx = nibble(c).expect("validated hex id");
                match &node.children[idx] {
                    Some(child) => node = child,
                    None => {
                        collided = false;
                        break;
                    }
                }
            }
            if collided && node.count > 0 {
                return Err(Error::IdCollision(id.to_string()));
            }
        }

        let mut node = &mut *root;
        node.count += 1;
        for c in id.chars() {
            let idx = nibble(c).expect("validated hex id");
            let child = node.children[idx].get_or_insert_with(Box::default).as_mut();
            child.count += 1;
            node = child;
        }
        node.terminal = true;
        Ok(())
    }

    /// Removes a full id from the index. Unknown ids are a no-op.
    pub fn delete(&self, id: &str) {
        let Ok(mut root) = self.root.lock() else {
            return;
        };
        // Confirm presence before mutating counts.
        {
            let mut node = &*root;
            for c in id.chars() {
                let Some(idx) = nibble(c) else { return };
                match &node.children[idx] {
                    Some(child) => node = child,
                    None => return,
                }
            }
            if !node.terminal {
                return;
            }
        }

        let mut node = &mut *root;
        node.count -= 1;
        for c in id.chars() {
            let idx = nibble(c).expect("presence checked");
            if node.children[idx].as_ref().map(|c| c.count) == Some(1) {
                node.children[idx] = None;
                return;
            }
            let child = node.children[idx].as_mut().expect("presence checked").as_mut();
            child.count -= 1;
            node = child;
        }
        node.terminal = false;
    }

    /// Resolves a prefix to the unique full id sharing it.
    ///
    /// Returns [`Error::AmbiguousPrefix`] when more than one id matches
    /// and [`Error::NotFound`] when none does.
    pub fn get(&self, prefix: &str) -> Result<String> {
        if prefix.is_empty() {
            return Err(Error::InvalidArgument("empty id prefix".to_string()));
        }
        let root = self
            .root
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))?;

        let mut node = &*root;
        for c in prefix.chars() {
            let idx = nibble(c).ok_or_else(|| Error::not_found("id", prefix))?;
            match &node.children[idx] {
                Some(child) => node = child,
                None => return Err(Error::not_found("id", prefix)),
            }
        }
        if node.count > 1 {
            return Err(Error::AmbiguousPrefix(prefix.to_string()));
        }

        // Exactly one id below: follow the single-child chain to its end.
        let mut full = String::with_capacity(ID_LEN);
        full.push_str(prefix);
        while !node.terminal {
            let (idx, child) = node
                .children
                .iter()
                .enumerate()
                .find_map(|(i, c)| c.as_ref().map(|c| (i, c)))
                .ok_or_else(|| Error::Internal("trie node without terminal or child".into()))?;
            full.push(char::from_digit(idx as u32, 16).expect("nibble in range"));
            node = child;
        }
        Ok(full)
    }
}
