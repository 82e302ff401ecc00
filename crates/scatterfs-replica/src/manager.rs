//! The reconciliation tick.
//!
//! One tick runs the phase sequence schedule → create → commit → wait →
//! reap → complete → progress, advancing every in-flight transfer job at
//! most one state per relevant phase and scheduling at most one new job.
//! Each phase contains failures per item: a transient failure leaves the
//! job for the next tick, a permanent one routes it to `Errored`. State
//! only moves through the catalog's guarded compare-and-swap; a phase
//! that loses the swap skips every dependent side effect.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::{Instant, SystemTime};

use rand::seq::SliceRandom;
use tracing::{debug, warn};

use scatterfs_catalog::{
    Catalog, JobAdvance, JobState, StorageNodeId, TransferJobId, TransferJobRecord,
};

use crate::engine::ReplicaEngine;
use crate::error::{ErrorClass, NodeError, NodeErrorKind, ReplicaError, Result};
use crate::node::{JobSpec, NodeClient, StorageHost};
use crate::placement;

fn group_by_source(jobs: Vec<TransferJobRecord>) -> Vec<(StorageNodeId, Vec<TransferJobRecord>)> {
    let mut groups: BTreeMap<StorageNodeId, Vec<TransferJobRecord>> = BTreeMap::new();
    for job in jobs {
        groups.entry(job.fsid).or_default().push(job);
    }
    let mut out: Vec<_> = groups.into_iter().collect();
    // Visit nodes in random order so one bad node cannot starve the rest.
    out.shuffle(&mut rand::thread_rng());
    out
}

impl ReplicaEngine {
    /// Runs one reconciliation tick. Phase-level catalog failures abort
    /// only the affected phase; the tick is meant to be invoked
    /// repeatedly by a single scheduler authority.
    pub async fn tick(&self) {
        if let Err(err) = self.schedule().await {
            debug!(error = %err, "schedule phase aborted");
        }
        if let Err(err) = self.stats().await {
            debug!(error = %err, "stats report aborted");
        }
        if let Err(err) = self.create().await {
            debug!(error = %err, "create phase aborted");
        }
        if let Err(err) = self.commit().await {
            debug!(error = %err, "commit phase aborted");
        }
        if let Err(err) = self.wait().await {
            debug!(error = %err, "wait phase aborted");
        }
        if let Err(err) = self.reap().await {
            debug!(error = %err, "reap phase aborted");
        }
        if let Err(err) = self.complete().await {
            debug!(error = %err, "complete phase aborted");
        }
        if let Err(err) = self.progress().await {
            debug!(error = %err, "progress phase aborted");
        }
    }

    /// Schedules at most one transfer for the most degraded eligible
    /// file. The cap bounds the cost of the selection; repetition of the
    /// tick provides throughput over time.
    async fn schedule(&self) -> Result<()> {
        let cutoff = SystemTime::now() - self.config.min_schedule_age;
        let degraded = self.catalog.degraded_files(cutoff).await?;
        if degraded.is_empty() {
            return Ok(());
        }
        let busy = self.catalog.busy_transfer_sources().await?;
        let mut candidates = self.catalog.placement_stats().await?;
        placement::rank(&mut candidates);

        for file in degraded {
            let replicas = self.catalog.file_replicas(file.fid).await?;
            let Some(source) = replicas.iter().find(|l| !busy.contains(&l.sid)) else {
                continue;
            };
            let mut holders: HashSet<StorageNodeId> = replicas.iter().map(|l| l.sid).collect();
            holders.extend(self.catalog.inflight_targets(file.fid).await?);
            let Some(target) = candidates
                .iter()
                .find(|c| c.avail > file.size && !holders.contains(&c.sid))
            else {
                continue;
            };

            let id = self
                .catalog
                .insert_transfer_job(file.fid, source.sid, target.sid, "(replication)")
                .await?;
            debug!(
                job = %id,
                fid = %file.fid,
                from = %source.sid,
                to = %target.sid,
                have = file.replica_count,
                want = file.minimum_replicas,
                "scheduled transfer"
            );
            return Ok(());
        }
        Ok(())
    }

    /// Logs a job-state summary, rate-limited to the configured interval.
    async fn stats(&self) -> Result<()> {
        {
            let mut last = self.last_stats.lock();
            if last.map_or(false, |t| t.elapsed() < self.config.stats_interval) {
                return Ok(());
            }
            *last = Some(Instant::now());
        }
        let counts = self.catalog.job_state_counts().await?;
        if counts.is_empty() {
            return Ok(());
        }
        let summary = counts
            .iter()
            .map(|(state, n)| format!("{state} ({n})"))
            .collect::<Vec<_>>()
            .join("; ");
        debug!(transfers = %summary, "transfer job states");
        Ok(())
    }

    /// Submits a remote copy job for every `New` transfer.
    async fn create(&self) -> Result<()> {
        let mut jobs = self.catalog.jobs_in_state(JobState::New).await?;
        jobs.shuffle(&mut rand::thread_rng());
        for job in jobs {
            if let Err(err) = self.create_one(&job).await {
                self.contain(job.id, "create", err).await;
            }
        }
        Ok(())
    }

    async fn create_one(&self, job: &TransferJobRecord) -> Result<()> {
        let source = StorageHost::from(&self.catalog.storage_node(job.fsid).await?);
        let target = StorageHost::from(&self.catalog.storage_node(job.tsid).await?);
        let open = target.scratch_path();
        let spec = JobSpec::third_party_put(&source, &target, job.fid, &open, &job.tag);
        debug!(job = %job.id, source = %source.hostport, "creating remote job");

        let cid = self
            .nodes
            .job_submit(&source, &spec, self.config.control_deadline)
            .await?;
        let advanced = self
            .catalog
            .advance_job(
                job.id,
                JobState::New,
                JobAdvance::to(JobState::Created).with_cid(cid).with_open(open),
            )
            .await?;
        if !advanced {
            debug!(job = %job.id, "lost create transition, skipping");
        }
        Ok(())
    }

    /// Commits created jobs, batched per source node.
    async fn commit(&self) -> Result<()> {
        let jobs = self.catalog.jobs_in_state(JobState::Created).await?;
        for (fsid, batch) in group_by_source(jobs) {
            let host = StorageHost::from(&self.catalog.storage_node(fsid).await?);
            let cids: Vec<_> = batch.iter().filter_map(|j| j.cid).collect();
            debug!(source = %fsid, jobs = batch.len(), "committing remote jobs");
            match self
                .nodes
                .job_commit(&host, &cids, self.config.control_deadline)
                .await
            {
                Ok(()) => {
                    for job in &batch {
                        let advanced = self
                            .catalog
                            .advance_job(job.id, JobState::Created, JobAdvance::to(JobState::Committed))
                            .await?;
                        if !advanced {
                            debug!(job = %job.id, "lost commit transition");
                        }
                    }
                }
                Err(err) => self.contain_batch(&batch, "commit", err).await,
            }
        }
        Ok(())
    }

    /// Polls each source node of committed jobs for finished transfers
    /// and records their exit metadata.
    async fn wait(&self) -> Result<()> {
        let jobs = self.catalog.jobs_in_state(JobState::Committed).await?;
        let mut sources: Vec<StorageNodeId> = jobs
            .iter()
            .map(|j| j.fsid)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        sources.shuffle(&mut rand::thread_rng());

        for fsid in sources {
            let host = StorageHost::from(&self.catalog.storage_node(fsid).await?);
            debug!(source = %fsid, "polling for finished transfers");
            let statuses = match self.nodes.job_wait(&host, self.config.control_deadline).await {
                Ok(statuses) => statuses,
                Err(err) => {
                    // The poll names no specific job; leave the rows for
                    // the next tick regardless of classification.
                    debug!(source = %fsid, error = %err, "wait failed, will retry");
                    continue;
                }
            };
            for status in statuses {
                let Some(id) = self.catalog.find_job_by_remote(fsid, status.cid).await? else {
                    continue; // not a transfer job
                };
                let advanced = self
                    .catalog
                    .advance_job(
                        id,
                        JobState::Committed,
                        JobAdvance::to(JobState::Waited).with_exit(status.exit),
                    )
                    .await?;
                if advanced {
                    debug!(job = %id, "remote job finished");
                } else {
                    debug!(job = %id, "job not moved to WAITED");
                }
            }
        }
        Ok(())
    }

    /// Releases remote resources of waited jobs, batched per source node.
    async fn reap(&self) -> Result<()> {
        let jobs = self.catalog.jobs_in_state(JobState::Waited).await?;
        for (fsid, batch) in group_by_source(jobs) {
            let host = StorageHost::from(&self.catalog.storage_node(fsid).await?);
            let cids: Vec<_> = batch.iter().filter_map(|j| j.cid).collect();
            debug!(source = %fsid, jobs = batch.len(), "reaping remote jobs");
            match self
                .nodes
                .job_reap(&host, &cids, self.config.control_deadline)
                .await
            {
                Ok(()) => {
                    for job in &batch {
                        let advanced = self
                            .catalog
                            .advance_job(job.id, JobState::Waited, JobAdvance::to(JobState::Reaped))
                            .await?;
                        if !advanced {
                            debug!(job = %job.id, "lost reap transition");
                        }
                    }
                }
                Err(err) => self.contain_batch(&batch, "reap", err).await,
            }
        }
        Ok(())
    }

    /// Confirms reaped transfers: failed remote jobs go to `Errored`
    /// with a diagnostic; clean ones are renamed into place and their
    /// Replica row inserted.
    async fn complete(&self) -> Result<()> {
        let mut jobs = self.catalog.jobs_in_state(JobState::Reaped).await?;
        jobs.shuffle(&mut rand::thread_rng());
        for job in jobs {
            if !job.exit.is_clean() {
                let diagnostic = format!(
                    "remote job failed: status={} exit_status={} exit_code={} exit_signal={}{}",
                    job.exit.status.as_deref().unwrap_or("?"),
                    job.exit.exit_status.as_deref().unwrap_or("?"),
                    job.exit
                        .exit_code
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "?".to_string()),
                    job.exit.exit_signal.as_deref().unwrap_or("-"),
                    job.exit
                        .error
                        .as_deref()
                        .map(|e| format!(": {e}"))
                        .unwrap_or_default(),
                );
                let advanced = self
                    .catalog
                    .advance_job(
                        job.id,
                        JobState::Reaped,
                        JobAdvance::to(JobState::Errored).with_error(diagnostic),
                    )
                    .await?;
                if advanced {
                    warn!(job = %job.id, fid = %job.fid, "transfer failed remotely");
                }
                continue;
            }
            if let Err(err) = self.complete_one(&job).await {
                self.contain(job.id, "complete", err).await;
            }
        }
        Ok(())
    }

    async fn complete_one(&self, job: &TransferJobRecord) -> Result<()> {
        let control = self.config.control_deadline;
        let target = StorageHost::from(&self.catalog.storage_node(job.tsid).await?);
        let open = job.open.as_deref().ok_or_else(|| ReplicaError::Io {
            msg: format!("job {} has no scratch path", job.id),
        })?;
        let file = target.replica_path(job.fid);
        debug!(job = %job.id, fid = %job.fid, "completing transfer");

        match self.nodes.rename(&target, open, &file, control).await {
            Ok(()) => {}
            Err(err) if err.kind == NodeErrorKind::NotFound => {
                // A previous completion renamed it but the catalog update
                // was lost; confirm before proceeding.
                self.nodes.access(&target, &file, control).await?;
            }
            Err(err) => return Err(err.into()),
        }
        if !self.catalog.complete_job(job.id).await? {
            debug!(job = %job.id, "job already completed elsewhere");
        }
        Ok(())
    }

    /// Best-effort progress probe of committed transfers' destinations.
    async fn progress(&self) -> Result<()> {
        let mut jobs = self.catalog.jobs_in_state(JobState::Committed).await?;
        // Walk targets in node order so consecutive stats hit the same
        // connection.
        jobs.sort_by_key(|j| j.tsid);
        for job in jobs {
            if let Err(err) = self.progress_one(&job).await {
                self.contain(job.id, "progress", err).await;
            }
        }
        Ok(())
    }

    async fn progress_one(&self, job: &TransferJobRecord) -> Result<()> {
        let target = StorageHost::from(&self.catalog.storage_node(job.tsid).await?);
        let Some(open) = job.open.as_deref() else {
            return Ok(());
        };
        match self
            .nodes
            .stat(&target, open, self.config.progress_deadline)
            .await
        {
            Ok(info) => {
                debug!(job = %job.id, bytes = info.size, "transfer progress");
                self.catalog.record_progress(job.id, info.size).await?;
                Ok(())
            }
            Err(err) if err.kind == NodeErrorKind::NotFound => {
                debug!(job = %job.id, "destination not created yet");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Applies the error taxonomy to one job's failure: transient
    /// failures are left for the next tick, permanent ones are recorded.
    async fn contain(&self, id: TransferJobId, phase: &str, err: ReplicaError) {
        match ErrorClass::of(&err) {
            ErrorClass::Transient => {
                debug!(job = %id, phase, error = %err, "transient failure, leaving job for the next tick");
            }
            ErrorClass::Permanent => {
                warn!(job = %id, phase, error = %err, "permanent failure, recording");
                match self.catalog.fail_job(id, &err.to_string()).await {
                    Ok(true) => {}
                    Ok(false) => debug!(job = %id, "job already terminal"),
                    Err(e) => debug!(job = %id, error = %e, "could not record job failure"),
                }
            }
        }
    }

    async fn contain_batch(&self, batch: &[TransferJobRecord], phase: &str, err: NodeError) {
        for job in batch {
            self.contain(job.id, phase, err.clone().into()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::sim::{FaultOp, SimCluster};
    use scatterfs_catalog::{Catalog, FileId, MemoryCatalog};
    use std::sync::Arc;
    use std::time::Duration;

    const SRC: &str = "sn0.example.org:9094";
    const DST1: &str = "sn1.example.org:9094";
    const DST2: &str = "sn2.example.org:9094";

    struct Fixture {
        engine: ReplicaEngine,
        catalog: Arc<MemoryCatalog>,
        cluster: Arc<SimCluster>,
        sids: Vec<StorageNodeId>,
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    async fn fixture(hostports: &[&str]) -> Fixture {
        init_tracing();
        let catalog = Arc::new(MemoryCatalog::new());
        let cluster = Arc::new(SimCluster::new());
        let mut sids = Vec::new();
        for hostport in hostports {
            cluster.add_host(hostport);
            sids.push(
                catalog
                    .upsert_storage_node(hostport, "/store", 1 << 30, true)
                    .await
                    .unwrap(),
            );
        }
        let config = EngineConfig {
            min_schedule_age: Duration::ZERO,
            ..EngineConfig::default()
        };
        let engine = ReplicaEngine::new(catalog.clone(), cluster.clone(), config);
        Fixture {
            engine,
            catalog,
            cluster,
            sids,
        }
    }

    /// Seeds a file on the first host and registers it.
    async fn seed(f: &Fixture, byte: u8, size: usize, minimum_replicas: u32) -> FileId {
        let fid = FileId::from_bytes([byte; 20]);
        let host = StorageHost::new(SRC, "/store");
        f.cluster.insert_file(SRC, &host.replica_path(fid), vec![byte; size]);
        f.catalog.register(fid, size as u64, SRC).await.unwrap();
        f.catalog.set_minimum_replicas(fid, minimum_replicas).await.unwrap();
        fid
    }

    #[tokio::test]
    async fn one_tick_replicates_a_degraded_file_end_to_end() {
        let f = fixture(&[SRC, DST1]).await;
        let fid = seed(&f, 0x42, 256, 2).await;

        f.engine.tick().await;

        let jobs = f.catalog.jobs_in_state(JobState::Completed).await.unwrap();
        assert_eq!(jobs.len(), 1);
        let job = &jobs[0];
        assert_eq!(job.fid, fid);
        assert_eq!(job.fsid, f.sids[0]);
        assert_eq!(job.tsid, f.sids[1]);
        assert_eq!(job.progress, 256);
        assert!(job.exit.is_clean());
        assert!(job.time_create.is_some());
        assert!(job.time_commit.is_some());
        assert!(job.time_complete.is_some());

        assert!(f.catalog.replica_exists(fid, f.sids[1]).await.unwrap());
        let target = StorageHost::new(DST1, "/store");
        assert_eq!(
            f.cluster.file(DST1, &target.replica_path(fid)).unwrap(),
            vec![0x42; 256]
        );
        // Remote job resources were reaped.
        assert_eq!(f.cluster.job_count(SRC), 0);
    }

    #[tokio::test]
    async fn further_ticks_after_completion_mutate_nothing() {
        let f = fixture(&[SRC, DST1]).await;
        let fid = seed(&f, 0x42, 64, 2).await;

        f.engine.tick().await;
        let done = f.catalog.jobs_in_state(JobState::Completed).await.unwrap();
        let completed_at = done[0].time_complete;
        let replicas_before = f.catalog.replica_count();

        f.engine.tick().await;
        f.engine.tick().await;

        let jobs = f.catalog.jobs_in_state(JobState::Completed).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].time_complete, completed_at);
        assert_eq!(f.catalog.replica_count(), replicas_before);
        assert!(f.catalog.replica_exists(fid, f.sids[1]).await.unwrap());
    }

    #[tokio::test]
    async fn schedule_caps_at_one_new_job_per_tick() {
        // Two eligible targets with free space, replication factor 3:
        // still only one job is scheduled in a single tick.
        let f = fixture(&[SRC, DST1, DST2]).await;
        let fid = seed(&f, 0x17, 128, 3).await;
        // Keep the job in NEW so the cap is observable at tick end.
        f.cluster.inject_fault(
            SRC,
            FaultOp::JobSubmit,
            NodeError::new(NodeErrorKind::ConnectionReset, SRC, "reset"),
        );

        f.engine.tick().await;

        let new_jobs = f.catalog.jobs_in_state(JobState::New).await.unwrap();
        assert_eq!(new_jobs.len(), 1);
        assert_eq!(new_jobs[0].fid, fid);
        // Transient failure: nothing recorded.
        assert!(new_jobs[0].error.is_none());
    }

    #[tokio::test]
    async fn transient_wait_failure_leaves_job_committed_without_error() {
        let f = fixture(&[SRC, DST1]).await;
        let fid = seed(&f, 0x55, 512, 2).await;
        f.cluster.inject_fault(
            SRC,
            FaultOp::JobWait,
            NodeError::new(NodeErrorKind::ConnectionReset, SRC, "connection reset by peer"),
        );

        f.engine.tick().await;

        let jobs = f.catalog.jobs_in_state(JobState::Committed).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].error.is_none());
        assert!(!f.catalog.replica_exists(fid, f.sids[1]).await.unwrap());

        // The next tick recovers and finishes the transfer.
        f.engine.tick().await;
        assert!(f.catalog.replica_exists(fid, f.sids[1]).await.unwrap());
        assert_eq!(
            f.catalog.jobs_in_state(JobState::Completed).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn failed_remote_job_is_errored_with_diagnostic_and_no_replica() {
        let f = fixture(&[SRC, DST1]).await;
        let fid = seed(&f, 0x66, 512, 2).await;
        f.cluster.fail_next_job(SRC, 1, "disk full");

        f.engine.tick().await;

        let jobs = f.catalog.jobs_in_state(JobState::Errored).await.unwrap();
        assert_eq!(jobs.len(), 1);
        let job = &jobs[0];
        assert_eq!(job.exit.exit_code, Some(1));
        let diagnostic = job.error.as_deref().unwrap();
        assert!(!diagnostic.is_empty());
        assert!(diagnostic.contains("disk full"));
        assert!(job.time_error.is_some());
        assert!(!f.catalog.replica_exists(fid, f.sids[1]).await.unwrap());
    }

    #[tokio::test]
    async fn permanent_create_failure_records_the_job_as_errored() {
        let f = fixture(&[SRC, DST1]).await;
        seed(&f, 0x29, 64, 2).await;
        f.cluster.inject_fault(
            SRC,
            FaultOp::JobSubmit,
            NodeError::new(NodeErrorKind::PermissionDenied, SRC, "credential rejected"),
        );

        f.engine.tick().await;

        let jobs = f.catalog.jobs_in_state(JobState::Errored).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].error.as_deref().unwrap().contains("credential rejected"));
    }

    #[tokio::test]
    async fn schedule_skips_files_whose_sources_are_all_busy() {
        let f = fixture(&[SRC, DST1, DST2]).await;
        let fid = seed(&f, 0x31, 64, 2).await;
        // Another live transfer already uses the only source node.
        let other = FileId::from_bytes([0x99; 20]);
        f.catalog.register(other, 1, SRC).await.unwrap();
        f.catalog
            .insert_transfer_job(other, f.sids[0], f.sids[2], "t")
            .await
            .unwrap();

        f.engine.tick().await;

        for state in JobState::all() {
            for job in f.catalog.jobs_in_state(state).await.unwrap() {
                assert_ne!(job.fid, fid, "no transfer may be scheduled for {fid} this tick");
            }
        }
    }

    #[tokio::test]
    async fn schedule_skips_targets_without_room() {
        let f = fixture(&[SRC, DST1]).await;
        let fid = seed(&f, 0x27, 128, 2).await;
        // The only possible target cannot hold the file.
        f.catalog
            .upsert_storage_node(DST1, "/store", 16, true)
            .await
            .unwrap();

        f.engine.tick().await;

        for state in JobState::all() {
            for job in f.catalog.jobs_in_state(state).await.unwrap() {
                assert_ne!(job.fid, fid);
            }
        }
    }

    #[tokio::test]
    async fn progress_phase_records_observed_bytes() {
        let f = fixture(&[SRC, DST1]).await;
        seed(&f, 0x73, 1000, 2).await;
        // Hold the transfer in COMMITTED across two ticks.
        for _ in 0..2 {
            f.cluster.inject_fault(
                SRC,
                FaultOp::JobWait,
                NodeError::new(NodeErrorKind::Timeout, SRC, "slow"),
            );
        }

        f.engine.tick().await;
        let committed = f.catalog.jobs_in_state(JobState::Committed).await.unwrap();
        let job = &committed[0];
        assert_eq!(job.progress, 0);

        // Half the bytes have arrived at the destination scratch path.
        let open = job.open.clone().unwrap();
        f.cluster.insert_file(DST1, &open, vec![0x73; 500]);
        f.engine.tick().await;

        let job = f.catalog.job(job.id).unwrap();
        assert_eq!(job.state, JobState::Committed);
        assert_eq!(job.progress, 500);
    }

    #[tokio::test]
    async fn tick_on_an_empty_catalog_is_a_no_op() {
        let f = fixture(&[SRC]).await;
        f.engine.tick().await;
        assert_eq!(f.catalog.file_count(), 0);
        for state in JobState::all() {
            assert!(f.catalog.jobs_in_state(state).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn completed_rename_race_is_confirmed_by_probe() {
        let f = fixture(&[SRC, DST1]).await;
        let fid = seed(&f, 0x44, 64, 2).await;
        // Let the transfer reach REAPED, then sabotage the final rename:
        // the canonical file already exists and the scratch path is gone.
        f.cluster.inject_fault(
            SRC,
            FaultOp::JobWait,
            NodeError::new(NodeErrorKind::Timeout, SRC, "slow"),
        );
        f.engine.tick().await;

        let target = StorageHost::new(DST1, "/store");
        f.cluster
            .insert_file(DST1, &target.replica_path(fid), vec![0x44; 64]);
        f.cluster.inject_fault(
            DST1,
            FaultOp::Rename,
            NodeError::new(NodeErrorKind::NotFound, DST1, "no such file"),
        );

        f.engine.tick().await;
        assert!(f.catalog.replica_exists(fid, f.sids[1]).await.unwrap());
        assert_eq!(
            f.catalog.jobs_in_state(JobState::Completed).await.unwrap().len(),
            1
        );
    }
}
