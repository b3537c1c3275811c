//! Tab-scoped key/value storage that survives page reloads.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// Per-tab string storage.
///
/// Cleared only when the tab closes; a reload keeps it.
#[derive(Debug, Default)]
pub struct SessionStorage {
    entries: Mutex<FxHashMap<String, String>>,
}

impl SessionStorage {
    /// Creates empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    /// Stores `value` under `key`.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.lock().insert(key.into(), value.into());
    }

    /// Removes `key`.
    pub fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    /// Removes everything.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Returns the number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_remove() {
        let storage = SessionStorage::new();
        storage.set("lcap.ready", "1");
        assert_eq!(storage.get("lcap.ready").as_deref(), Some("1"));

        storage.remove("lcap.ready");
        assert!(storage.get("lcap.ready").is_none());
        assert!(storage.is_empty());
    }

    #[test]
    fn test_set_overwrites() {
        let storage = SessionStorage::new();
        storage.set("k", "a");
        storage.set("k", "b");
        assert_eq!(storage.get("k").as_deref(), Some("b"));
        assert_eq!(storage.len(), 1);
    }
}
