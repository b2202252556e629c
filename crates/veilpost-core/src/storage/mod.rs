//! Persistence collaborator
//!
//! Opaque key-value tables of JSON records. Used for sealed identity
//! records, delegated-signer connections, ephemeral message state and the
//! messages those states refer to. The trait is synchronous; callers on an
//! async runtime keep calls short and never hold a lock across them.

mod chaotic;
mod error;
mod memory;
mod redb;

pub use chaotic::{ChaoticStore, StoreOp};
pub use error::StorageError;
pub use memory::MemoryStore;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

pub use self::redb::RedbStore;

/// Key-value persistence with named tables.
///
/// Must be Clone (shared between services), Send + Sync, and synchronous.
/// Clones access the same underlying tables.
pub trait Store: Clone + Send + Sync + 'static {
    /// Read a record. `None` when the table or key does not exist.
    fn get(&self, table: &str, key: &str) -> Result<Option<Value>, StorageError>;

    /// Insert or replace a record.
    fn put(&self, table: &str, key: &str, record: &Value) -> Result<(), StorageError>;

    /// Shallow-merge `patch` into an existing record and return the result.
    ///
    /// Top-level fields of `patch` replace those of the record. Atomic with
    /// respect to other calls on the same store.
    ///
    /// # Errors
    ///
    /// - `NotFound`: no record under `key`
    /// - `InvalidPatch`: record or patch is not a JSON object
    fn update(&self, table: &str, key: &str, patch: &Value) -> Result<Value, StorageError>;

    /// Remove a record. Removing a missing record is not an error.
    fn delete(&self, table: &str, key: &str) -> Result<(), StorageError>;

    /// All `(key, record)` pairs of a table, ordered by key.
    fn get_all(&self, table: &str) -> Result<Vec<(String, Value)>, StorageError>;

    /// Read and decode a typed record.
    fn load<T: DeserializeOwned>(&self, table: &str, key: &str) -> Result<Option<T>, StorageError> {
        self.get(table, key)?
            .map(|value| {
                serde_json::from_value(value).map_err(|e| StorageError::Serialization(e.to_string()))
            })
            .transpose()
    }

    /// Encode and write a typed record.
    fn save<T: Serialize>(&self, table: &str, key: &str, record: &T) -> Result<(), StorageError> {
        let value =
            serde_json::to_value(record).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.put(table, key, &value)
    }
}

/// Shallow merge used by every `update` implementation.
pub(crate) fn merge_patch(
    table: &str,
    key: &str,
    record: &mut Value,
    patch: &Value,
) -> Result<(), StorageError> {
    let (Value::Object(target), Value::Object(fields)) = (record, patch) else {
        return Err(StorageError::InvalidPatch { table: table.to_owned(), key: key.to_owned() });
    };

    for (name, value) in fields {
        target.insert(name.clone(), value.clone());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn merge_replaces_top_level_fields_only() {
        let mut record = json!({"a": 1, "nested": {"x": 1, "y": 2}});
        merge_patch("t", "k", &mut record, &json!({"b": 2, "nested": {"x": 9}})).unwrap();

        assert_eq!(record, json!({"a": 1, "b": 2, "nested": {"x": 9}}));
    }

    #[test]
    fn merge_rejects_non_objects() {
        let mut record = json!([1, 2]);
        let err = merge_patch("t", "k", &mut record, &json!({"a": 1})).unwrap_err();
        assert_eq!(err, StorageError::InvalidPatch { table: "t".into(), key: "k".into() });

        let mut record = json!({"a": 1});
        assert!(merge_patch("t", "k", &mut record, &json!("x")).is_err());
    }
}
