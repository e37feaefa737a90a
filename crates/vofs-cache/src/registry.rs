//! Path-keyed table of open file handles.
//!
//! The table itself is not synchronized: the cache keeps it behind its
//! registry mutex, which is the outermost lock in the crate. Holding that
//! mutex is what makes "look up or create" and "rekey on rename" atomic with
//! respect to opens and closes.
//!
//! # Example
//!
//! ```
//! use vofs_cache::registry::HandleRegistry;
//!
//! let mut table: HandleRegistry<u32> = HandleRegistry::new();
//! table.insert("/a/one".to_string(), 1);
//! table.insert("/a/two".to_string(), 2);
//!
//! assert_eq!(table.rekey("/a/one", "/b/one"), None);
//! assert_eq!(table.get("/b/one"), Some(&1));
//! assert_eq!(table.paths_under("/a"), vec!["/a/two".to_string()]);
//! ```

use std::collections::HashMap;

/// Map from remote path to handle.
#[derive(Debug)]
pub struct HandleRegistry<V> {
    handles: HashMap<String, V>,
}

impl<V> HandleRegistry<V> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            handles: HashMap::new(),
        }
    }

    /// Handle registered for `path`.
    pub fn get(&self, path: &str) -> Option<&V> {
        self.handles.get(path)
    }

    /// Register `value` for `path`, returning the handle it replaces.
    pub fn insert(&mut self, path: String, value: V) -> Option<V> {
        self.handles.insert(path, value)
    }

    /// Unregister `path`.
    pub fn remove(&mut self, path: &str) -> Option<V> {
        self.handles.remove(path)
    }

    /// Unregister `path` only if its handle satisfies `pred`.
    pub fn remove_if(&mut self, path: &str, pred: impl FnOnce(&V) -> bool) -> Option<V> {
        if self.handles.get(path).is_some_and(pred) {
            self.handles.remove(path)
        } else {
            None
        }
    }

    /// Move the handle registered at `old` to `new`.
    ///
    /// Whatever was registered at `new` is unregistered and returned, even if
    /// nothing was registered at `old`.
    pub fn rekey(&mut self, old: &str, new: &str) -> Option<V> {
        if old == new {
            return None;
        }
        let displaced = self.handles.remove(new);
        if let Some(value) = self.handles.remove(old) {
            self.handles.insert(new.to_owned(), value);
        }
        displaced
    }

    /// Whether a handle is registered for `path`.
    pub fn contains(&self, path: &str) -> bool {
        self.handles.contains_key(path)
    }

    /// Registered paths strictly inside directory `dir`, sorted.
    pub fn paths_under(&self, dir: &str) -> Vec<String> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        let mut paths: Vec<String> = self
            .handles
            .keys()
            .filter(|p| p.starts_with(&prefix))
            .cloned()
            .collect();
        paths.sort();
        paths
    }

    /// Number of registered handles.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether no handle is registered.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Iterate over all registered handles.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.handles.values()
    }
}

impl<V> Default for HandleRegistry<V> {
    fn default() -> Self {
        Self::new()
    }
}
