//! Error types for the catalog.

use thiserror::Error;

use crate::types::StorageNodeId;

/// Result type alias for catalog operations.
pub type CatalogResult<T> = Result<T, CatalogError>;

/// Errors returned by [`Catalog`](crate::store::Catalog) implementations.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The backend could not take the required lock; the operation may be
    /// retried. Callers classify this as transient.
    #[error("catalog busy: {msg}")]
    Busy {
        /// Description of the contended resource.
        msg: String,
    },

    /// A storage node id resolved through a job or replica row does not
    /// exist in the inventory.
    #[error("unknown storage node: {sid}")]
    UnknownStorageNode {
        /// The missing node id.
        sid: StorageNodeId,
    },

    /// A file identifier could not be parsed from its hex form.
    #[error("malformed file id: {msg}")]
    MalformedFileId {
        /// What was wrong with the input.
        msg: String,
    },

    /// Backend I/O failure.
    #[error("catalog I/O error")]
    Io(#[from] std::io::Error),
}
