use thiserror::Error;

/// Errors from the persistence collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Backend I/O or transaction failure
    #[error("storage I/O error: {0}")]
    Io(String),

    /// Record could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// `update` targeted a record that does not exist
    #[error("record not found: {table}/{key}")]
    NotFound {
        /// Table name
        table: String,
        /// Record key
        key: String,
    },

    /// `update` patch or target record is not a JSON object
    #[error("cannot merge into {table}/{key}: records and patches must be JSON objects")]
    InvalidPatch {
        /// Table name
        table: String,
        /// Record key
        key: String,
    },
}

impl StorageError {
    /// Returns true if the operation may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
