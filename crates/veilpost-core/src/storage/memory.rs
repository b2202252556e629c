use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use serde_json::Value;

use super::{Store, StorageError, merge_patch};

type Tables = HashMap<String, BTreeMap<String, Value>>;

/// In-memory store for tests and ephemeral sessions.
///
/// Tables live in an `Arc<Mutex<_>>` so clones share state. Every operation
/// holds the lock for its whole duration, which makes `update` atomic.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in a table.
    pub fn len(&self, table: &str) -> usize {
        self.lock().get(table).map_or(0, BTreeMap::len)
    }

    /// True when a table holds no records.
    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Store for MemoryStore {
    fn get(&self, table: &str, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.lock().get(table).and_then(|records| records.get(key)).cloned())
    }

    fn put(&self, table: &str, key: &str, record: &Value) -> Result<(), StorageError> {
        self.lock().entry(table.to_owned()).or_default().insert(key.to_owned(), record.clone());
        Ok(())
    }

    fn update(&self, table: &str, key: &str, patch: &Value) -> Result<Value, StorageError> {
        let mut tables = self.lock();
        let record = tables
            .get_mut(table)
            .and_then(|records| records.get_mut(key))
            .ok_or_else(|| StorageError::NotFound { table: table.to_owned(), key: key.to_owned() })?;

        merge_patch(table, key, record, patch)?;
        Ok(record.clone())
    }

    fn delete(&self, table: &str, key: &str) -> Result<(), StorageError> {
        if let Some(records) = self.lock().get_mut(table) {
            records.remove(key);
        }
        Ok(())
    }

    fn get_all(&self, table: &str) -> Result<Vec<(String, Value)>, StorageError> {
        Ok(self
            .lock()
            .get(table)
            .map(|records| records.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn put_get_delete() {
        let store = MemoryStore::new();
        store.put("messages", "m1", &json!({"content": "hi"})).unwrap();

        assert_eq!(store.get("messages", "m1").unwrap(), Some(json!({"content": "hi"})));
        assert_eq!(store.get("messages", "m2").unwrap(), None);
        assert_eq!(store.get("other", "m1").unwrap(), None);

        store.delete("messages", "m1").unwrap();
        store.delete("messages", "m1").unwrap();
        assert!(store.is_empty("messages"));
    }

    #[test]
    fn update_merges_and_requires_existing_record() {
        let store = MemoryStore::new();
        let err = store.update("t", "k", &json!({"a": 1})).unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));

        store.put("t", "k", &json!({"a": 1, "b": 1})).unwrap();
        let merged = store.update("t", "k", &json!({"b": 2})).unwrap();

        assert_eq!(merged, json!({"a": 1, "b": 2}));
        assert_eq!(store.get("t", "k").unwrap(), Some(merged));
    }

    #[test]
    fn get_all_is_ordered_by_key() {
        let store = MemoryStore::new();
        store.put("t", "b", &json!(2)).unwrap();
        store.put("t", "a", &json!(1)).unwrap();

        assert_eq!(store.get_all("t").unwrap(), vec![("a".into(), json!(1)), ("b".into(), json!(2))]);
        assert!(store.get_all("missing").unwrap().is_empty());
    }

    #[test]
    fn clones_share_tables() {
        let store = MemoryStore::new();
        let clone = store.clone();
        clone.put("t", "k", &json!(true)).unwrap();

        assert_eq!(store.len("t"), 1);
    }
}
