//! In-process catalog backend.
//!
//! `MemoryCatalog` keeps all four tables behind one mutex; every trait
//! method is a single critical section, which gives each operation the
//! atomic read-modify-write semantics the engine assumes of the external
//! catalog. Used by tests and by single-process deployments.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{CatalogError, CatalogResult};
use crate::state::JobState;
use crate::store::{Catalog, JobAdvance, ReplicationSource};
use crate::types::{
    DegradedFile, FileId, FileRecord, JobExit, PlacementStats, RemoteJobId, ReplicaLocation,
    StorageNodeId, StorageNodeRecord, TransferJobId, TransferJobRecord,
};

#[derive(Default)]
struct Tables {
    files: HashMap<FileId, FileRecord>,
    nodes: BTreeMap<StorageNodeId, StorageNodeRecord>,
    replicas: BTreeSet<(FileId, StorageNodeId)>,
    jobs: BTreeMap<TransferJobId, TransferJobRecord>,
    next_sid: i64,
    next_job: i64,
}

impl Tables {
    fn node_by_hostport(&self, hostport: &str) -> Option<&StorageNodeRecord> {
        self.nodes.values().find(|n| n.hostport == hostport)
    }

    fn live_jobs(&self) -> impl Iterator<Item = &TransferJobRecord> {
        self.jobs.values().filter(|j| !j.state.is_terminal())
    }

    fn replica_count_with_inflight(&self, fid: FileId) -> u64 {
        let held = self.replicas.range((fid, StorageNodeId(i64::MIN))..=(fid, StorageNodeId(i64::MAX))).count();
        let inflight = self.live_jobs().filter(|j| j.fid == fid).count();
        (held + inflight) as u64
    }
}

/// In-memory [`Catalog`] implementation.
pub struct MemoryCatalog {
    inner: Mutex<Tables>,
    default_minimum_replicas: u32,
}

impl MemoryCatalog {
    /// Creates an empty catalog; new files start with one required replica.
    pub fn new() -> Self {
        Self::with_default_replication(1)
    }

    /// Creates an empty catalog with the given default `minimum_replicas`
    /// for newly registered files.
    pub fn with_default_replication(minimum_replicas: u32) -> Self {
        Self {
            inner: Mutex::new(Tables::default()),
            default_minimum_replicas: minimum_replicas,
        }
    }

    /// Fetches one job row, mainly for tests and diagnostics.
    pub fn job(&self, id: TransferJobId) -> Option<TransferJobRecord> {
        self.inner.lock().jobs.get(&id).cloned()
    }

    /// Number of File rows.
    pub fn file_count(&self) -> usize {
        self.inner.lock().files.len()
    }

    /// Number of Replica rows.
    pub fn replica_count(&self) -> usize {
        self.inner.lock().replicas.len()
    }
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn register(&self, fid: FileId, size: u64, hostport: &str) -> CatalogResult<()> {
        let mut t = self.inner.lock();
        t.files.entry(fid).or_insert_with(|| FileRecord {
            id: fid,
            size,
            minimum_replicas: self.default_minimum_replicas,
            time_create: SystemTime::now(),
        });
        if let Some(sid) = t.node_by_hostport(hostport).map(|n| n.id) {
            t.replicas.insert((fid, sid));
        } else {
            debug!(%fid, hostport, "register: hostport not in storage node inventory");
        }
        Ok(())
    }

    async fn upsert_storage_node(
        &self,
        hostport: &str,
        root: &str,
        avail: u64,
        active: bool,
    ) -> CatalogResult<StorageNodeId> {
        let mut t = self.inner.lock();
        if let Some(id) = t.node_by_hostport(hostport).map(|n| n.id) {
            let node = t.nodes.get_mut(&id).expect("node indexed by hostport");
            node.root = root.to_string();
            node.avail = avail;
            node.active = active;
            return Ok(id);
        }
        t.next_sid += 1;
        let id = StorageNodeId(t.next_sid);
        t.nodes.insert(
            id,
            StorageNodeRecord {
                id,
                hostport: hostport.to_string(),
                root: root.to_string(),
                avail,
                active,
            },
        );
        Ok(id)
    }

    async fn storage_node(&self, sid: StorageNodeId) -> CatalogResult<StorageNodeRecord> {
        self.inner
            .lock()
            .nodes
            .get(&sid)
            .cloned()
            .ok_or(CatalogError::UnknownStorageNode { sid })
    }

    async fn file(&self, fid: FileId) -> CatalogResult<Option<FileRecord>> {
        Ok(self.inner.lock().files.get(&fid).cloned())
    }

    async fn set_minimum_replicas(&self, fid: FileId, minimum: u32) -> CatalogResult<bool> {
        let mut t = self.inner.lock();
        match t.files.get_mut(&fid) {
            Some(file) => {
                file.minimum_replicas = minimum;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn replica_exists(&self, fid: FileId, sid: StorageNodeId) -> CatalogResult<bool> {
        Ok(self.inner.lock().replicas.contains(&(fid, sid)))
    }

    async fn file_replicas(&self, fid: FileId) -> CatalogResult<Vec<ReplicaLocation>> {
        let t = self.inner.lock();
        let size = t.files.get(&fid).map(|f| f.size).unwrap_or(0);
        let mut out = Vec::new();
        for &(f, sid) in t.replicas.range((fid, StorageNodeId(i64::MIN))..=(fid, StorageNodeId(i64::MAX))) {
            debug_assert_eq!(f, fid);
            if let Some(node) = t.nodes.get(&sid) {
                if node.active {
                    out.push(ReplicaLocation {
                        sid,
                        hostport: node.hostport.clone(),
                        root: node.root.clone(),
                        size,
                    });
                }
            }
        }
        Ok(out)
    }

    async fn placement_stats(&self) -> CatalogResult<Vec<PlacementStats>> {
        let t = self.inner.lock();
        let mut out = Vec::new();
        for node in t.nodes.values().filter(|n| n.active) {
            let mut count = 0u64;
            let mut bytes = 0u64;
            for &(fid, sid) in t.replicas.iter() {
                if sid == node.id {
                    count += 1;
                    bytes += t.files.get(&fid).map(|f| f.size).unwrap_or(0);
                }
            }
            out.push(PlacementStats {
                sid: node.id,
                hostport: node.hostport.clone(),
                root: node.root.clone(),
                replica_count: count,
                avail: node.avail,
                replica_bytes: bytes,
            });
        }
        Ok(out)
    }

    async fn degraded_files(&self, older_than: SystemTime) -> CatalogResult<Vec<DegradedFile>> {
        let t = self.inner.lock();
        let mut out: Vec<DegradedFile> = t
            .files
            .values()
            .filter(|f| f.time_create < older_than)
            .filter_map(|f| {
                let count = t.replica_count_with_inflight(f.id);
                (count < u64::from(f.minimum_replicas)).then(|| DegradedFile {
                    fid: f.id,
                    size: f.size,
                    replica_count: count,
                    minimum_replicas: f.minimum_replicas,
                })
            })
            .collect();
        out.sort_by_key(|d| (d.replica_count, d.fid));
        Ok(out)
    }

    async fn busy_transfer_sources(&self) -> CatalogResult<HashSet<StorageNodeId>> {
        Ok(self.inner.lock().live_jobs().map(|j| j.fsid).collect())
    }

    async fn inflight_targets(&self, fid: FileId) -> CatalogResult<Vec<StorageNodeId>> {
        Ok(self
            .inner
            .lock()
            .live_jobs()
            .filter(|j| j.fid == fid)
            .map(|j| j.tsid)
            .collect())
    }

    async fn insert_transfer_job(
        &self,
        fid: FileId,
        fsid: StorageNodeId,
        tsid: StorageNodeId,
        tag: &str,
    ) -> CatalogResult<TransferJobId> {
        let mut t = self.inner.lock();
        t.next_job += 1;
        let id = TransferJobId(t.next_job);
        t.jobs.insert(
            id,
            TransferJobRecord {
                id,
                state: JobState::New,
                fid,
                fsid,
                tsid,
                cid: None,
                open: None,
                tag: tag.to_string(),
                progress: 0,
                error: None,
                exit: JobExit::default(),
                time_new: SystemTime::now(),
                time_create: None,
                time_commit: None,
                time_complete: None,
                time_error: None,
            },
        );
        Ok(id)
    }

    async fn jobs_in_state(&self, state: JobState) -> CatalogResult<Vec<TransferJobRecord>> {
        Ok(self
            .inner
            .lock()
            .jobs
            .values()
            .filter(|j| j.state == state)
            .cloned()
            .collect())
    }

    async fn advance_job(
        &self,
        id: TransferJobId,
        expected: JobState,
        adv: JobAdvance,
    ) -> CatalogResult<bool> {
        let mut t = self.inner.lock();
        let Some(job) = t.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.state != expected || !expected.may_advance_to(adv.to) {
            return Ok(false);
        }
        let now = SystemTime::now();
        job.state = adv.to;
        if let Some(cid) = adv.cid {
            job.cid = Some(cid);
        }
        if let Some(open) = adv.open {
            job.open = Some(open);
        }
        if let Some(exit) = adv.exit {
            job.exit = exit;
        }
        if let Some(error) = adv.error {
            job.error = Some(error);
        }
        match adv.to {
            JobState::Created => job.time_create = Some(now),
            JobState::Committed => job.time_commit = Some(now),
            JobState::Completed => job.time_complete = Some(now),
            JobState::Errored => job.time_error = Some(now),
            _ => {}
        }
        Ok(true)
    }

    async fn complete_job(&self, id: TransferJobId) -> CatalogResult<bool> {
        let mut t = self.inner.lock();
        let (fid, tsid) = match t.jobs.get(&id) {
            Some(job) if job.state == JobState::Reaped => (job.fid, job.tsid),
            _ => return Ok(false),
        };
        t.replicas.insert((fid, tsid));
        let size = t.files.get(&fid).map(|f| f.size).unwrap_or(0);
        let job = t.jobs.get_mut(&id).expect("job row checked above");
        job.state = JobState::Completed;
        job.progress = size;
        job.time_complete = Some(SystemTime::now());
        Ok(true)
    }

    async fn fail_job(&self, id: TransferJobId, error: &str) -> CatalogResult<bool> {
        let mut t = self.inner.lock();
        let Some(job) = t.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.state.is_terminal() {
            return Ok(false);
        }
        job.state = JobState::Errored;
        job.error = Some(error.to_string());
        job.time_error = Some(SystemTime::now());
        Ok(true)
    }

    async fn find_job_by_remote(
        &self,
        fsid: StorageNodeId,
        cid: RemoteJobId,
    ) -> CatalogResult<Option<TransferJobId>> {
        Ok(self
            .inner
            .lock()
            .jobs
            .values()
            .find(|j| j.fsid == fsid && j.cid == Some(cid))
            .map(|j| j.id))
    }

    async fn record_progress(&self, id: TransferJobId, bytes: u64) -> CatalogResult<()> {
        let mut t = self.inner.lock();
        if let Some(job) = t.jobs.get_mut(&id) {
            job.progress = bytes;
        }
        Ok(())
    }

    async fn record_replication(
        &self,
        fid: FileId,
        source: Option<ReplicationSource>,
        tsid: StorageNodeId,
        started: SystemTime,
        tag: &str,
    ) -> CatalogResult<()> {
        let mut t = self.inner.lock();
        t.replicas.insert((fid, tsid));
        if let Some(src) = source {
            t.next_job += 1;
            let id = TransferJobId(t.next_job);
            t.jobs.insert(
                id,
                TransferJobRecord {
                    id,
                    state: JobState::Completed,
                    fid,
                    fsid: src.fsid,
                    tsid,
                    cid: None,
                    open: None,
                    tag: tag.to_string(),
                    progress: src.size,
                    error: None,
                    exit: JobExit::default(),
                    time_new: started,
                    time_create: None,
                    time_commit: Some(started),
                    time_complete: Some(SystemTime::now()),
                    time_error: None,
                },
            );
        }
        Ok(())
    }

    async fn job_state_counts(&self) -> CatalogResult<Vec<(JobState, u64)>> {
        let t = self.inner.lock();
        let mut out = Vec::new();
        for state in JobState::all() {
            let n = t.jobs.values().filter(|j| j.state == state).count() as u64;
            if n > 0 {
                out.push((state, n));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fid(byte: u8) -> FileId {
        FileId::from_bytes([byte; 20])
    }

    async fn catalog_with_nodes(n: usize) -> (MemoryCatalog, Vec<StorageNodeId>) {
        let catalog = MemoryCatalog::new();
        let mut sids = Vec::new();
        for i in 0..n {
            let sid = catalog
                .upsert_storage_node(&format!("sn{i}.example.org:9094"), "/store", 1 << 30, true)
                .await
                .unwrap();
            sids.push(sid);
        }
        (catalog, sids)
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let (catalog, sids) = catalog_with_nodes(1).await;
        catalog.register(fid(1), 100, "sn0.example.org:9094").await.unwrap();
        catalog.register(fid(1), 100, "sn0.example.org:9094").await.unwrap();
        assert_eq!(catalog.file_count(), 1);
        assert_eq!(catalog.replica_count(), 1);
        assert!(catalog.replica_exists(fid(1), sids[0]).await.unwrap());
    }

    #[tokio::test]
    async fn register_keeps_original_size_and_minimum() {
        let (catalog, _) = catalog_with_nodes(1).await;
        catalog.register(fid(1), 100, "sn0.example.org:9094").await.unwrap();
        catalog.set_minimum_replicas(fid(1), 3).await.unwrap();
        catalog.register(fid(1), 100, "sn0.example.org:9094").await.unwrap();
        let file = catalog.file(fid(1)).await.unwrap().unwrap();
        assert_eq!(file.minimum_replicas, 3);
        assert_eq!(file.size, 100);
    }

    #[tokio::test]
    async fn set_minimum_replicas_reports_missing_file() {
        let (catalog, _) = catalog_with_nodes(1).await;
        assert!(!catalog.set_minimum_replicas(fid(9), 2).await.unwrap());
    }

    #[tokio::test]
    async fn file_replicas_skips_inactive_nodes() {
        let (catalog, sids) = catalog_with_nodes(2).await;
        catalog.register(fid(1), 10, "sn0.example.org:9094").await.unwrap();
        catalog.register(fid(1), 10, "sn1.example.org:9094").await.unwrap();
        assert_eq!(catalog.file_replicas(fid(1)).await.unwrap().len(), 2);

        catalog
            .upsert_storage_node("sn1.example.org:9094", "/store", 1 << 30, false)
            .await
            .unwrap();
        let locs = catalog.file_replicas(fid(1)).await.unwrap();
        assert_eq!(locs.len(), 1);
        assert_eq!(locs[0].sid, sids[0]);
    }

    #[tokio::test]
    async fn degraded_files_counts_inflight_transfers() {
        let (catalog, sids) = catalog_with_nodes(3).await;
        catalog.register(fid(1), 10, "sn0.example.org:9094").await.unwrap();
        catalog.set_minimum_replicas(fid(1), 2).await.unwrap();

        let future = SystemTime::now() + Duration::from_secs(60);
        let degraded = catalog.degraded_files(future).await.unwrap();
        assert_eq!(degraded.len(), 1);
        assert_eq!(degraded[0].replica_count, 1);

        // An in-flight transfer counts toward the replica total.
        catalog
            .insert_transfer_job(fid(1), sids[0], sids[1], "t")
            .await
            .unwrap();
        assert!(catalog.degraded_files(future).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn degraded_files_respects_minimum_age() {
        let (catalog, _) = catalog_with_nodes(1).await;
        catalog.register(fid(1), 10, "sn0.example.org:9094").await.unwrap();
        catalog.set_minimum_replicas(fid(1), 2).await.unwrap();
        let past = SystemTime::now() - Duration::from_secs(3600);
        assert!(catalog.degraded_files(past).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn advance_job_is_guarded_by_expected_state() {
        let (catalog, sids) = catalog_with_nodes(2).await;
        catalog.register(fid(1), 10, "sn0.example.org:9094").await.unwrap();
        let id = catalog
            .insert_transfer_job(fid(1), sids[0], sids[1], "t")
            .await
            .unwrap();

        assert!(catalog
            .advance_job(id, JobState::New, JobAdvance::to(JobState::Created))
            .await
            .unwrap());
        // Second actor loses the race.
        assert!(!catalog
            .advance_job(id, JobState::New, JobAdvance::to(JobState::Created))
            .await
            .unwrap());
        // Skipping states is refused even with a matching expected state.
        assert!(!catalog
            .advance_job(id, JobState::Created, JobAdvance::to(JobState::Waited))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn complete_job_inserts_replica_once_and_is_idempotent() {
        let (catalog, sids) = catalog_with_nodes(2).await;
        catalog.register(fid(1), 77, "sn0.example.org:9094").await.unwrap();
        let id = catalog
            .insert_transfer_job(fid(1), sids[0], sids[1], "t")
            .await
            .unwrap();
        for state in [JobState::Created, JobState::Committed, JobState::Waited, JobState::Reaped] {
            let job = catalog.job(id).unwrap();
            assert!(catalog.advance_job(id, job.state, JobAdvance::to(state)).await.unwrap());
        }

        assert!(catalog.complete_job(id).await.unwrap());
        assert!(catalog.replica_exists(fid(1), sids[1]).await.unwrap());
        let job = catalog.job(id).unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.progress, 77);

        // A second invocation matches zero rows and mutates nothing.
        assert!(!catalog.complete_job(id).await.unwrap());
        assert_eq!(catalog.replica_count(), 2);
    }

    #[tokio::test]
    async fn fail_job_refuses_terminal_rows() {
        let (catalog, sids) = catalog_with_nodes(2).await;
        catalog.register(fid(1), 10, "sn0.example.org:9094").await.unwrap();
        let id = catalog
            .insert_transfer_job(fid(1), sids[0], sids[1], "t")
            .await
            .unwrap();
        assert!(catalog.fail_job(id, "remote job lost").await.unwrap());
        let job = catalog.job(id).unwrap();
        assert_eq!(job.state, JobState::Errored);
        assert_eq!(job.error.as_deref(), Some("remote job lost"));
        assert!(job.time_error.is_some());
        assert!(!catalog.fail_job(id, "again").await.unwrap());
    }

    #[tokio::test]
    async fn find_job_by_remote_requires_matching_source() {
        let (catalog, sids) = catalog_with_nodes(2).await;
        catalog.register(fid(1), 10, "sn0.example.org:9094").await.unwrap();
        let id = catalog
            .insert_transfer_job(fid(1), sids[0], sids[1], "t")
            .await
            .unwrap();
        catalog
            .advance_job(
                id,
                JobState::New,
                JobAdvance::to(JobState::Created).with_cid(RemoteJobId(42)),
            )
            .await
            .unwrap();

        assert_eq!(
            catalog.find_job_by_remote(sids[0], RemoteJobId(42)).await.unwrap(),
            Some(id)
        );
        assert_eq!(catalog.find_job_by_remote(sids[1], RemoteJobId(42)).await.unwrap(), None);
        assert_eq!(catalog.find_job_by_remote(sids[0], RemoteJobId(7)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn record_replication_writes_audit_job() {
        let (catalog, sids) = catalog_with_nodes(2).await;
        catalog.register(fid(1), 512, "sn0.example.org:9094").await.unwrap();
        let started = SystemTime::now();
        catalog
            .record_replication(
                fid(1),
                Some(ReplicationSource { fsid: sids[0], size: 512 }),
                sids[1],
                started,
                "(dependency)",
            )
            .await
            .unwrap();

        assert!(catalog.replica_exists(fid(1), sids[1]).await.unwrap());
        let counts = catalog.job_state_counts().await.unwrap();
        assert_eq!(counts, vec![(JobState::Completed, 1)]);
        let jobs = catalog.jobs_in_state(JobState::Completed).await.unwrap();
        assert_eq!(jobs[0].progress, 512);
        assert_eq!(jobs[0].tag, "(dependency)");
    }

    #[tokio::test]
    async fn record_replication_without_source_skips_audit_job() {
        let (catalog, sids) = catalog_with_nodes(2).await;
        catalog.register(fid(1), 512, "sn0.example.org:9094").await.unwrap();
        catalog
            .record_replication(fid(1), None, sids[1], SystemTime::now(), "t")
            .await
            .unwrap();
        assert!(catalog.replica_exists(fid(1), sids[1]).await.unwrap());
        assert!(catalog.job_state_counts().await.unwrap().is_empty());
    }
}
