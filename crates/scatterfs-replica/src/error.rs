//! Error types for the replica engine and the transient/permanent
//! classifier used by the reconciliation tick.

use thiserror::Error;

use scatterfs_catalog::{CatalogError, FileId};

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, ReplicaError>;

/// Failure categories reported by a storage node client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeErrorKind {
    /// The operation did not finish within its deadline.
    Timeout,
    /// The connection was reset by the peer.
    ConnectionReset,
    /// The connection was aborted.
    ConnectionAborted,
    /// The node refused the connection.
    ConnectionRefused,
    /// The host could not be reached.
    HostUnreachable,
    /// The network is down.
    NetworkDown,
    /// No route to the network.
    NetworkUnreachable,
    /// The operation was interrupted and may be retried.
    Interrupted,
    /// The node (or its job facility) is busy.
    Busy,
    /// The remote path does not exist.
    NotFound,
    /// The remote path already exists.
    AlreadyExists,
    /// The node no longer knows the referenced remote job.
    JobLost,
    /// The node denied access.
    PermissionDenied,
    /// Anything else.
    Other,
}

impl NodeErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            NodeErrorKind::Timeout => "timeout",
            NodeErrorKind::ConnectionReset => "connection reset",
            NodeErrorKind::ConnectionAborted => "connection aborted",
            NodeErrorKind::ConnectionRefused => "connection refused",
            NodeErrorKind::HostUnreachable => "host unreachable",
            NodeErrorKind::NetworkDown => "network down",
            NodeErrorKind::NetworkUnreachable => "network unreachable",
            NodeErrorKind::Interrupted => "interrupted",
            NodeErrorKind::Busy => "busy",
            NodeErrorKind::NotFound => "not found",
            NodeErrorKind::AlreadyExists => "already exists",
            NodeErrorKind::JobLost => "remote job lost",
            NodeErrorKind::PermissionDenied => "permission denied",
            NodeErrorKind::Other => "error",
        }
    }
}

impl std::fmt::Display for NodeErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error from a storage node operation.
#[derive(Debug, Clone, Error)]
#[error("storage node {hostport}: {kind}: {msg}")]
pub struct NodeError {
    /// Failure category.
    pub kind: NodeErrorKind,
    /// Node the operation was issued against.
    pub hostport: String,
    /// Operation-specific detail.
    pub msg: String,
}

impl NodeError {
    /// Builds an error for an operation against `hostport`.
    pub fn new(kind: NodeErrorKind, hostport: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            kind,
            hostport: hostport.into(),
            msg: msg.into(),
        }
    }
}

/// Errors surfaced by the client-facing replica API.
#[derive(Debug, Error)]
pub enum ReplicaError {
    /// No replica of the file exists.
    #[error("no replica of {fid} exists")]
    NotFound {
        /// The file that has no replicas.
        fid: FileId,
    },

    /// The handle's stream is closed or was never opened.
    #[error("handle is not open for I/O")]
    InvalidState,

    /// The caller passed an argument the operation rejects.
    #[error("invalid argument: {msg}")]
    InvalidArgument {
        /// What was rejected.
        msg: String,
    },

    /// Every candidate node or source replica was tried and refused.
    #[error("I/O failure: {msg}")]
    Io {
        /// What was exhausted.
        msg: String,
    },

    /// Catalog failure.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Storage node failure.
    #[error(transparent)]
    Node(#[from] NodeError),
}

/// Disposition of a failure inside a reconciliation phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Leave the job in place; the next tick retries naturally. Nothing
    /// is recorded in the catalog.
    Transient,
    /// Record the job as `Errored` with a diagnostic; external
    /// remediation is required.
    Permanent,
}

impl ErrorClass {
    /// Classifies a failure per the engine's error taxonomy: transport
    /// interruptions and catalog contention are transient; everything
    /// else is permanent.
    pub fn of(err: &ReplicaError) -> ErrorClass {
        match err {
            ReplicaError::Node(node) => match node.kind {
                NodeErrorKind::Timeout
                | NodeErrorKind::ConnectionReset
                | NodeErrorKind::ConnectionAborted
                | NodeErrorKind::ConnectionRefused
                | NodeErrorKind::HostUnreachable
                | NodeErrorKind::NetworkDown
                | NodeErrorKind::NetworkUnreachable
                | NodeErrorKind::Interrupted
                | NodeErrorKind::Busy => ErrorClass::Transient,
                _ => ErrorClass::Permanent,
            },
            ReplicaError::Catalog(CatalogError::Busy { .. }) => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_err(kind: NodeErrorKind) -> ReplicaError {
        NodeError::new(kind, "sn0.example.org:9094", "boom").into()
    }

    #[test]
    fn transport_interruptions_are_transient() {
        for kind in [
            NodeErrorKind::Timeout,
            NodeErrorKind::ConnectionReset,
            NodeErrorKind::ConnectionAborted,
            NodeErrorKind::ConnectionRefused,
            NodeErrorKind::HostUnreachable,
            NodeErrorKind::NetworkDown,
            NodeErrorKind::NetworkUnreachable,
            NodeErrorKind::Interrupted,
            NodeErrorKind::Busy,
        ] {
            assert_eq!(ErrorClass::of(&node_err(kind)), ErrorClass::Transient, "{kind}");
        }
    }

    #[test]
    fn lost_jobs_and_misuse_are_permanent() {
        for kind in [
            NodeErrorKind::JobLost,
            NodeErrorKind::NotFound,
            NodeErrorKind::AlreadyExists,
            NodeErrorKind::PermissionDenied,
            NodeErrorKind::Other,
        ] {
            assert_eq!(ErrorClass::of(&node_err(kind)), ErrorClass::Permanent, "{kind}");
        }
        assert_eq!(
            ErrorClass::of(&ReplicaError::Io { msg: "exhausted".into() }),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn catalog_contention_is_transient() {
        let err = ReplicaError::Catalog(CatalogError::Busy { msg: "locked".into() });
        assert_eq!(ErrorClass::of(&err), ErrorClass::Transient);
    }
}
