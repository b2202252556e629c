//! Redb-backed durable store.
//!
//! One redb table per logical table name, keyed by the record key, values
//! JSON-encoded. Every write is its own ACID transaction, so state survives
//! restarts and `update` is atomic.

use std::{path::Path, sync::Arc};

use redb::{Database, ReadableTable, TableDefinition, TableError};
use serde_json::Value;

use super::{Store, StorageError, merge_patch};

/// Durable store backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open or create a Redb database at the given path.
    ///
    /// Tables are created lazily on first write.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(Self { db: Arc::new(db) })
    }
}

fn definition(table: &str) -> TableDefinition<'_, &'static str, &'static [u8]> {
    TableDefinition::new(table)
}

fn decode(bytes: &[u8]) -> Result<Value, StorageError> {
    serde_json::from_slice(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn encode(record: &Value) -> Result<Vec<u8>, StorageError> {
    serde_json::to_vec(record).map_err(|e| StorageError::Serialization(e.to_string()))
}

impl Store for RedbStore {
    fn get(&self, table: &str, key: &str) -> Result<Option<Value>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = match txn.open_table(definition(table)) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(StorageError::Io(e.to_string())),
        };

        let Some(guard) = table.get(key).map_err(|e| StorageError::Io(e.to_string()))? else {
            return Ok(None);
        };
        decode(guard.value()).map(Some)
    }

    fn put(&self, table: &str, key: &str, record: &Value) -> Result<(), StorageError> {
        let bytes = encode(record)?;
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        {
            let mut table =
                txn.open_table(definition(table)).map_err(|e| StorageError::Io(e.to_string()))?;
            table.insert(key, bytes.as_slice()).map_err(|e| StorageError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }

    fn update(&self, table_name: &str, key: &str, patch: &Value) -> Result<Value, StorageError> {
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        let merged = {
            let mut table = txn
                .open_table(definition(table_name))
                .map_err(|e| StorageError::Io(e.to_string()))?;

            let existing = table
                .get(key)
                .map_err(|e| StorageError::Io(e.to_string()))?
                .map(|guard| decode(guard.value()))
                .transpose()?;
            let Some(mut record) = existing else {
                return Err(StorageError::NotFound {
                    table: table_name.to_owned(),
                    key: key.to_owned(),
                });
            };

            merge_patch(table_name, key, &mut record, patch)?;
            let bytes = encode(&record)?;
            table.insert(key, bytes.as_slice()).map_err(|e| StorageError::Io(e.to_string()))?;
            record
        };
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(merged)
    }

    fn delete(&self, table: &str, key: &str) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        {
            let mut table =
                txn.open_table(definition(table)).map_err(|e| StorageError::Io(e.to_string()))?;
            table.remove(key).map_err(|e| StorageError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }

    fn get_all(&self, table: &str) -> Result<Vec<(String, Value)>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = match txn.open_table(definition(table)) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::Io(e.to_string())),
        };

        let mut records = Vec::new();
        for entry in table.iter().map_err(|e| StorageError::Io(e.to_string()))? {
            let (key, value) = entry.map_err(|e| StorageError::Io(e.to_string()))?;
            records.push((key.value().to_owned(), decode(value.value())?));
        }

        Ok(records)
    }
}
