//! The `Catalog` repository trait.
//!
//! Every mutation is a single method so implementations can make each one
//! atomic; the engine never holds an interactive transaction open across
//! remote I/O. State advancement goes through [`Catalog::advance_job`], a
//! compare-and-swap guarded by the expected prior state: a phase must
//! check the returned flag before performing any side effect that assumes
//! exclusive ownership of the row.

use std::collections::HashSet;
use std::time::SystemTime;

use async_trait::async_trait;

use crate::error::CatalogResult;
use crate::state::JobState;
use crate::types::{
    DegradedFile, FileId, FileRecord, JobExit, PlacementStats, RemoteJobId, ReplicaLocation,
    StorageNodeId, StorageNodeRecord, TransferJobId, TransferJobRecord,
};

/// A guarded state advancement for one transfer job.
///
/// Fields left `None` are not touched. The catalog stamps the phase
/// timestamp matching the target state.
#[derive(Debug, Clone)]
pub struct JobAdvance {
    /// Target state.
    pub to: JobState,
    /// Remote job id, recorded by the create phase.
    pub cid: Option<RemoteJobId>,
    /// Temporary destination path, recorded by the create phase.
    pub open: Option<String>,
    /// Remote exit metadata, recorded by the wait phase.
    pub exit: Option<JobExit>,
    /// Diagnostic text, recorded when routing to `Errored`.
    pub error: Option<String>,
}

impl JobAdvance {
    /// An advancement to `state` with no extra columns.
    pub fn to(state: JobState) -> Self {
        Self {
            to: state,
            cid: None,
            open: None,
            exit: None,
            error: None,
        }
    }

    /// Attach the remote job id.
    pub fn with_cid(mut self, cid: RemoteJobId) -> Self {
        self.cid = Some(cid);
        self
    }

    /// Attach the temporary destination path.
    pub fn with_open(mut self, open: impl Into<String>) -> Self {
        self.open = Some(open.into());
        self
    }

    /// Attach remote exit metadata.
    pub fn with_exit(mut self, exit: JobExit) -> Self {
        self.exit = Some(exit);
        self
    }

    /// Attach a diagnostic.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Source half of a synchronous replication audit record.
#[derive(Debug, Clone, Copy)]
pub struct ReplicationSource {
    /// Node the bytes were copied from.
    pub fsid: StorageNodeId,
    /// Size of the copied file.
    pub size: u64,
}

/// The transactional catalog behind the replica engine.
///
/// Implementations must give each method atomic read-modify-write
/// semantics; concurrent callers are arbitrated here and nowhere else.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Records that `fid` exists with `size` bytes at the node addressed
    /// by `hostport`: inserts the File row if absent and the Replica row
    /// if absent, in one transaction. Idempotent.
    async fn register(&self, fid: FileId, size: u64, hostport: &str) -> CatalogResult<()>;

    /// Inserts or refreshes a storage node in the inventory and returns
    /// its id. The inventory is externally owned; this is the ingestion
    /// hook for it.
    async fn upsert_storage_node(
        &self,
        hostport: &str,
        root: &str,
        avail: u64,
        active: bool,
    ) -> CatalogResult<StorageNodeId>;

    /// Resolves a node id to its inventory row.
    async fn storage_node(&self, sid: StorageNodeId) -> CatalogResult<StorageNodeRecord>;

    /// Looks up a File row.
    async fn file(&self, fid: FileId) -> CatalogResult<Option<FileRecord>>;

    /// Updates a file's desired replication factor. Returns whether a
    /// File row matched.
    async fn set_minimum_replicas(&self, fid: FileId, minimum: u32) -> CatalogResult<bool>;

    /// Whether a Replica row exists for `(fid, sid)`.
    async fn replica_exists(&self, fid: FileId, sid: StorageNodeId) -> CatalogResult<bool>;

    /// Snapshot of the replicas of `fid` on active nodes, joined with
    /// each node's address. Order is arbitrary.
    async fn file_replicas(&self, fid: FileId) -> CatalogResult<Vec<ReplicaLocation>>;

    /// Per-node `(replica_count, avail, replica_bytes)` aggregates over
    /// active nodes, for the placement scorer.
    async fn placement_stats(&self) -> CatalogResult<Vec<PlacementStats>>;

    /// Files created before `older_than` whose current-plus-in-flight
    /// replica count is below their minimum, ordered by replica count
    /// ascending.
    async fn degraded_files(&self, older_than: SystemTime) -> CatalogResult<Vec<DegradedFile>>;

    /// Nodes currently acting as the source of a live transfer job.
    async fn busy_transfer_sources(&self) -> CatalogResult<HashSet<StorageNodeId>>;

    /// Target nodes of live transfer jobs for `fid`.
    async fn inflight_targets(&self, fid: FileId) -> CatalogResult<Vec<StorageNodeId>>;

    /// Inserts a transfer job in state `New` and returns its id.
    async fn insert_transfer_job(
        &self,
        fid: FileId,
        fsid: StorageNodeId,
        tsid: StorageNodeId,
        tag: &str,
    ) -> CatalogResult<TransferJobId>;

    /// All jobs currently in `state`.
    async fn jobs_in_state(&self, state: JobState) -> CatalogResult<Vec<TransferJobRecord>>;

    /// Applies `adv` to the job only if its current state equals
    /// `expected` and the transition is legal. Returns whether the caller
    /// won the row; `false` means another actor already moved it and the
    /// caller must skip any dependent side effects.
    async fn advance_job(
        &self,
        id: TransferJobId,
        expected: JobState,
        adv: JobAdvance,
    ) -> CatalogResult<bool>;

    /// Completes a reaped job in one transaction: inserts the Replica row
    /// for `(fid, tsid)` if absent, sets the job `Completed` with
    /// `progress` equal to the file size, and stamps `time_complete`.
    /// Guarded by `state = Reaped`; returns whether a row matched.
    async fn complete_job(&self, id: TransferJobId) -> CatalogResult<bool>;

    /// Routes a non-terminal job to `Errored` with a diagnostic and
    /// `time_error`. Returns whether a row matched.
    async fn fail_job(&self, id: TransferJobId, error: &str) -> CatalogResult<bool>;

    /// Resolves a remote job reported by a source node back to the
    /// transfer job it belongs to.
    async fn find_job_by_remote(
        &self,
        fsid: StorageNodeId,
        cid: RemoteJobId,
    ) -> CatalogResult<Option<TransferJobId>>;

    /// Updates the observed byte counter of a job.
    async fn record_progress(&self, id: TransferJobId, bytes: u64) -> CatalogResult<()>;

    /// Records a finished synchronous replication in one transaction:
    /// inserts the Replica row for `(fid, tsid)` if absent and, when the
    /// bytes were actually copied (`source` is set), a synthetic
    /// `Completed` transfer job for audit.
    async fn record_replication(
        &self,
        fid: FileId,
        source: Option<ReplicationSource>,
        tsid: StorageNodeId,
        started: SystemTime,
        tag: &str,
    ) -> CatalogResult<()>;

    /// Count of jobs per state, for the periodic statistics report.
    async fn job_state_counts(&self) -> CatalogResult<Vec<(JobState, u64)>>;
}
