//! Identifier newtypes and row structs for the catalog schema.

use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::CatalogError;
use crate::state::JobState;

/// Content-addressed file identifier: the 160-bit digest of the file's
/// bytes, used as the File table's sole primary key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId([u8; 20]);

impl FileId {
    /// Digest length in bytes.
    pub const LEN: usize = 20;

    /// Wraps a raw digest.
    pub fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self(bytes)
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.0))
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", self)
    }
}

impl FromStr for FileId {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s).map_err(|e| CatalogError::MalformedFileId { msg: e.to_string() })?;
        let bytes: [u8; Self::LEN] =
            raw.try_into().map_err(|_| CatalogError::MalformedFileId {
                msg: format!("expected {} hex bytes", Self::LEN),
            })?;
        Ok(Self(bytes))
    }
}

/// Storage node identifier, assigned by the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StorageNodeId(pub i64);

impl fmt::Display for StorageNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transfer job identifier, assigned by the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransferJobId(pub i64);

impl fmt::Display for TransferJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Remote job identifier assigned by a storage node's job facility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RemoteJobId(pub i64);

impl fmt::Display for RemoteJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A File row. Content is immutable once created; only `minimum_replicas`
/// may change afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    /// Content digest, the primary key.
    pub id: FileId,
    /// File size in bytes.
    pub size: u64,
    /// Desired replication factor.
    pub minimum_replicas: u32,
    /// Creation time.
    pub time_create: SystemTime,
}

/// A StorageNode row. The inventory is externally owned; the engine only
/// reads and aggregates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageNodeRecord {
    /// Node id.
    pub id: StorageNodeId,
    /// host:port address of the node.
    pub hostport: String,
    /// Remote path prefix under which the node stores replicas.
    pub root: String,
    /// Free bytes reported by the node.
    pub avail: u64,
    /// Whether the node is currently in service.
    pub active: bool,
}

/// One replica of a file joined with the active node hosting it, as
/// returned by snapshot queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaLocation {
    /// Hosting node id.
    pub sid: StorageNodeId,
    /// Node address.
    pub hostport: String,
    /// Node root path.
    pub root: String,
    /// Size of the file, from its File row.
    pub size: u64,
}

/// Per-node placement aggregates consumed by the scorer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementStats {
    /// Node id.
    pub sid: StorageNodeId,
    /// Node address.
    pub hostport: String,
    /// Node root path.
    pub root: String,
    /// Number of replicas the node holds.
    pub replica_count: u64,
    /// Free bytes on the node.
    pub avail: u64,
    /// Total bytes of all replicas on the node.
    pub replica_bytes: u64,
}

/// A file whose current-plus-in-flight replica count is below its
/// configured minimum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DegradedFile {
    /// The degraded file.
    pub fid: FileId,
    /// File size in bytes.
    pub size: u64,
    /// Current replica count, including in-flight transfers.
    pub replica_count: u64,
    /// The configured minimum.
    pub minimum_replicas: u32,
}

/// Exit metadata reported by a storage node for a finished remote job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobExit {
    /// Error text reported by the remote job facility, if any.
    pub error: Option<String>,
    /// Process exit code.
    pub exit_code: Option<i64>,
    /// Terminating signal name, if the job was killed.
    pub exit_signal: Option<String>,
    /// Exit kind, `EXITED` for a normal exit.
    pub exit_status: Option<String>,
    /// Remote job status, `FINISHED` when the job ran to an end state.
    pub status: Option<String>,
}

impl JobExit {
    /// Whether the remote job finished with a clean zero exit.
    pub fn is_clean(&self) -> bool {
        self.status.as_deref() == Some("FINISHED")
            && self.exit_status.as_deref() == Some("EXITED")
            && self.exit_code == Some(0)
    }
}

/// A TransferJob row: one asynchronous replication attempt, retained
/// after completion or failure as an audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferJobRecord {
    /// Job id.
    pub id: TransferJobId,
    /// Current state.
    pub state: JobState,
    /// File being replicated.
    pub fid: FileId,
    /// Source node.
    pub fsid: StorageNodeId,
    /// Target node.
    pub tsid: StorageNodeId,
    /// Remote job id assigned by the source node's job facility.
    pub cid: Option<RemoteJobId>,
    /// Temporary destination path on the target node.
    pub open: Option<String>,
    /// Free-form label.
    pub tag: String,
    /// Bytes observed at the destination so far.
    pub progress: u64,
    /// Diagnostic recorded when the job errored.
    pub error: Option<String>,
    /// Remote exit metadata, recorded by the wait phase.
    pub exit: JobExit,
    /// When the job was scheduled.
    pub time_new: SystemTime,
    /// When the remote job was created.
    pub time_create: Option<SystemTime>,
    /// When the remote job was committed.
    pub time_commit: Option<SystemTime>,
    /// When the replica was confirmed and the job completed.
    pub time_complete: Option<SystemTime>,
    /// When the job was marked errored.
    pub time_error: Option<SystemTime>,
}
