//! The storage node client seam.
//!
//! The wire-level client is an external collaborator; the engine talks to
//! it through [`NodeClient`] and [`NodeFile`]. Every operation takes an
//! explicit deadline. [`SimCluster`](crate::sim::SimCluster) is the
//! in-process implementation used by tests.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use scatterfs_catalog::{FileId, JobExit, RemoteJobId, StorageNodeRecord};

use crate::error::NodeError;

/// Address of a storage node: host:port plus the remote path prefix under
/// which it keeps replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageHost {
    /// host:port of the node.
    pub hostport: String,
    /// Remote path prefix.
    pub root: String,
}

impl StorageHost {
    /// Builds a host address.
    pub fn new(hostport: impl Into<String>, root: impl Into<String>) -> Self {
        Self {
            hostport: hostport.into(),
            root: root.into(),
        }
    }

    /// Canonical path of a file's replica on this node.
    pub fn replica_path(&self, fid: FileId) -> String {
        format!("{}/file/{}", self.root, fid)
    }

    /// A fresh temporary path under the node's open area.
    pub fn scratch_path(&self) -> String {
        let mut raw = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut raw);
        format!("{}/open/{}", self.root, hex::encode_upper(raw))
    }

    /// Path of the access credential the node's job facility hands to
    /// transfer jobs.
    pub fn credential_path(&self) -> String {
        format!("{}/ticket", self.root)
    }

    /// Per-job debug log path; the job facility substitutes the job id
    /// for `%j`.
    pub fn debug_path(&self) -> String {
        format!("{}/debug.%j", self.root)
    }
}

impl From<&StorageNodeRecord> for StorageHost {
    fn from(node: &StorageNodeRecord) -> Self {
        Self::new(node.hostport.clone(), node.root.clone())
    }
}

/// Size probe result.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FileInfo {
    /// File size in bytes.
    pub size: u64,
}

/// Completion report for one remote job, as returned by a node's wait
/// operation.
#[derive(Debug, Clone)]
pub struct RemoteJobStatus {
    /// Remote job id.
    pub cid: RemoteJobId,
    /// Exit metadata.
    pub exit: JobExit,
}

/// Whether a bound file is consumed or produced by a remote job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobFileKind {
    /// Consumed by the job.
    Input,
    /// Produced by the job.
    Output,
}

/// How a bound file is materialized in the job's working directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobFileBinding {
    /// Hard-linked rather than copied.
    Link,
}

/// One file bound into a remote job's working directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFile {
    /// Path inside the job's working directory.
    pub task_path: String,
    /// Path on the serving node.
    pub serv_path: String,
    /// Input or output.
    #[serde(rename = "type")]
    pub kind: JobFileKind,
    /// Materialization mode.
    pub binding: JobFileBinding,
}

/// Description of a remote batch job, submitted to a source node as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Executable to run.
    pub executable: String,
    /// Free-form label carried through from the transfer job.
    pub tag: String,
    /// argv, including the executable.
    pub arguments: Vec<String>,
    /// Environment variables for the job.
    pub environment: BTreeMap<String, String>,
    /// Files bound into the job's working directory.
    pub files: Vec<JobFile>,
}

impl JobSpec {
    const CREDENTIAL_TASK_PATH: &'static str = "./scatterfs.ticket";

    /// The job description for a third-party put: the source node runs
    /// `@put` to push its local replica into an open temporary path on
    /// the target node, with the replica and an access credential as
    /// linked inputs and a debug log as a linked output.
    pub fn third_party_put(
        source: &StorageHost,
        target: &StorageHost,
        fid: FileId,
        target_open: &str,
        tag: &str,
    ) -> Self {
        Self {
            executable: "@put".to_string(),
            tag: tag.to_string(),
            arguments: vec![
                "@put".to_string(),
                target.hostport.clone(),
                "file".to_string(),
                target_open.to_string(),
            ],
            environment: BTreeMap::from([(
                "SCATTERFS_CLIENT_TICKETS".to_string(),
                Self::CREDENTIAL_TASK_PATH.to_string(),
            )]),
            files: vec![
                JobFile {
                    task_path: "file".to_string(),
                    serv_path: source.replica_path(fid),
                    kind: JobFileKind::Input,
                    binding: JobFileBinding::Link,
                },
                JobFile {
                    task_path: Self::CREDENTIAL_TASK_PATH.to_string(),
                    serv_path: source.credential_path(),
                    kind: JobFileKind::Input,
                    binding: JobFileBinding::Link,
                },
                JobFile {
                    task_path: ".scatterfs.debug".to_string(),
                    serv_path: target.debug_path(),
                    kind: JobFileKind::Output,
                    binding: JobFileBinding::Link,
                },
            ],
        }
    }
}

/// An open byte stream on a storage node.
#[async_trait]
pub trait NodeFile: Send + Sync {
    /// Reads up to `size` bytes at `offset`.
    async fn pread(&mut self, size: usize, offset: u64, deadline: Duration)
        -> Result<Vec<u8>, NodeError>;

    /// Writes `data` at `offset`, returning the bytes accepted.
    async fn pwrite(&mut self, data: &[u8], offset: u64, deadline: Duration)
        -> Result<usize, NodeError>;

    /// Sets the file length.
    async fn ftruncate(&mut self, length: u64, deadline: Duration) -> Result<(), NodeError>;

    /// Closes the stream.
    async fn close(&mut self, deadline: Duration) -> Result<(), NodeError>;
}

/// Remote operations against storage nodes.
///
/// Byte-stream I/O, atomic rename, probes, node-to-node third-party copy,
/// and the remote batch-job facility used by the reconciliation tick.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Opens an existing remote path for reading.
    async fn open_read(
        &self,
        host: &StorageHost,
        path: &str,
        deadline: Duration,
    ) -> Result<Box<dyn NodeFile>, NodeError>;

    /// Creates a new remote path exclusively and opens it for writing.
    async fn create_exclusive(
        &self,
        host: &StorageHost,
        path: &str,
        deadline: Duration,
    ) -> Result<Box<dyn NodeFile>, NodeError>;

    /// Atomically moves `from` to `to` on one node. May report
    /// [`NotFound`](crate::error::NodeErrorKind::NotFound) when a
    /// previous rename of the same path already won.
    async fn rename(
        &self,
        host: &StorageHost,
        from: &str,
        to: &str,
        deadline: Duration,
    ) -> Result<(), NodeError>;

    /// Existence probe.
    async fn access(&self, host: &StorageHost, path: &str, deadline: Duration)
        -> Result<(), NodeError>;

    /// Size probe.
    async fn stat(
        &self,
        host: &StorageHost,
        path: &str,
        deadline: Duration,
    ) -> Result<FileInfo, NodeError>;

    /// Copies a file directly from one node to another without routing
    /// the bytes through this process. Returns the bytes copied.
    async fn third_party_put(
        &self,
        from: &StorageHost,
        from_path: &str,
        to: &StorageHost,
        to_path: &str,
        deadline: Duration,
    ) -> Result<u64, NodeError>;

    /// Submits a job description to a node's job facility.
    async fn job_submit(
        &self,
        host: &StorageHost,
        spec: &JobSpec,
        deadline: Duration,
    ) -> Result<RemoteJobId, NodeError>;

    /// Commits previously submitted jobs for execution.
    async fn job_commit(
        &self,
        host: &StorageHost,
        cids: &[RemoteJobId],
        deadline: Duration,
    ) -> Result<(), NodeError>;

    /// Polls for finished jobs without blocking past the deadline.
    async fn job_wait(
        &self,
        host: &StorageHost,
        deadline: Duration,
    ) -> Result<Vec<RemoteJobStatus>, NodeError>;

    /// Releases the node-side resources of finished jobs.
    async fn job_reap(
        &self,
        host: &StorageHost,
        cids: &[RemoteJobId],
        deadline: Duration,
    ) -> Result<(), NodeError>;
}
