//! Software simulation of a storage node pool.
//!
//! `SimCluster` implements [`NodeClient`] against per-host in-memory file
//! maps and a remote-job table whose committed `@put` jobs execute when
//! the node is next polled. Fault injection covers the engine's
//! error-containment paths without real hardware or a real network.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use scatterfs_catalog::{JobExit, RemoteJobId};

use crate::error::{NodeError, NodeErrorKind};
use crate::node::{FileInfo, JobSpec, NodeClient, NodeFile, RemoteJobStatus, StorageHost};

/// Which client operation an injected fault fires on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOp {
    /// Any operation against the host.
    Any,
    /// `open_read`.
    OpenRead,
    /// `create_exclusive`.
    CreateExclusive,
    /// `rename`.
    Rename,
    /// `access`.
    Access,
    /// `stat`.
    Stat,
    /// `third_party_put` (matched on the source host).
    ThirdPartyPut,
    /// `job_submit`.
    JobSubmit,
    /// `job_commit`.
    JobCommit,
    /// `job_wait`.
    JobWait,
    /// `job_reap`.
    JobReap,
}

struct Fault {
    op: FaultOp,
    error: NodeError,
}

enum JobPhase {
    Submitted,
    Committed,
    Done(JobExit),
}

struct SimJob {
    spec: JobSpec,
    phase: JobPhase,
}

#[derive(Default)]
struct SimHost {
    files: BTreeMap<String, Vec<u8>>,
    jobs: BTreeMap<RemoteJobId, SimJob>,
    faults: VecDeque<Fault>,
    job_failures: VecDeque<(i64, String)>,
}

#[derive(Default)]
struct SimState {
    hosts: HashMap<String, SimHost>,
    next_cid: i64,
}

impl SimState {
    fn host(&self, hostport: &str) -> Result<&SimHost, NodeError> {
        self.hosts.get(hostport).ok_or_else(|| {
            NodeError::new(NodeErrorKind::HostUnreachable, hostport, "no such host")
        })
    }

    fn host_mut(&mut self, hostport: &str) -> Result<&mut SimHost, NodeError> {
        self.hosts.get_mut(hostport).ok_or_else(|| {
            NodeError::new(NodeErrorKind::HostUnreachable, hostport, "no such host")
        })
    }

    fn take_fault(&mut self, hostport: &str, op: FaultOp) -> Option<NodeError> {
        let host = self.hosts.get_mut(hostport)?;
        let idx = host
            .faults
            .iter()
            .position(|f| f.op == op || f.op == FaultOp::Any)?;
        host.faults.remove(idx).map(|f| f.error)
    }

    /// Runs every committed job on `hostport`. A `@put` job copies its
    /// linked input into the open path on the target host named in its
    /// arguments.
    fn execute_jobs(&mut self, hostport: &str) {
        let pending: Vec<RemoteJobId> = match self.hosts.get(hostport) {
            Some(host) => host
                .jobs
                .iter()
                .filter(|(_, j)| matches!(j.phase, JobPhase::Committed))
                .map(|(cid, _)| *cid)
                .collect(),
            None => return,
        };

        for cid in pending {
            let (spec, forced) = {
                let host = self.hosts.get_mut(hostport).expect("host checked above");
                let spec = host.jobs.get(&cid).expect("job listed above").spec.clone();
                (spec, host.job_failures.pop_front())
            };

            let exit = if let Some((code, msg)) = forced {
                failed_exit(code, msg)
            } else {
                self.run_put(hostport, &spec)
            };

            let host = self.hosts.get_mut(hostport).expect("host checked above");
            host.jobs.get_mut(&cid).expect("job listed above").phase = JobPhase::Done(exit);
        }
    }

    fn run_put(&mut self, hostport: &str, spec: &JobSpec) -> JobExit {
        let (target_hostport, to_path) = match (spec.arguments.get(1), spec.arguments.get(3)) {
            (Some(h), Some(p)) => (h.clone(), p.clone()),
            _ => return failed_exit(1, "malformed @put arguments".to_string()),
        };
        let source_path = match spec
            .files
            .iter()
            .find(|f| f.task_path == "file")
            .map(|f| f.serv_path.clone())
        {
            Some(p) => p,
            None => return failed_exit(1, "no input file bound".to_string()),
        };

        let bytes = match self.hosts.get(hostport).and_then(|h| h.files.get(&source_path)) {
            Some(bytes) => bytes.clone(),
            None => return failed_exit(1, format!("{source_path}: no such file")),
        };
        match self.hosts.get_mut(&target_hostport) {
            Some(target) => {
                target.files.insert(to_path, bytes);
                JobExit {
                    error: None,
                    exit_code: Some(0),
                    exit_signal: None,
                    exit_status: Some("EXITED".to_string()),
                    status: Some("FINISHED".to_string()),
                }
            }
            None => failed_exit(1, format!("{target_hostport}: unreachable")),
        }
    }
}

fn failed_exit(code: i64, msg: String) -> JobExit {
    JobExit {
        error: Some(msg),
        exit_code: Some(code),
        exit_signal: None,
        exit_status: Some("EXITED".to_string()),
        status: Some("FINISHED".to_string()),
    }
}

/// In-memory storage node pool implementing [`NodeClient`].
#[derive(Clone, Default)]
pub struct SimCluster {
    state: Arc<Mutex<SimState>>,
}

impl SimCluster {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a host to the pool.
    pub fn add_host(&self, hostport: &str) {
        self.state
            .lock()
            .hosts
            .entry(hostport.to_string())
            .or_default();
    }

    /// Seeds a file on a host.
    pub fn insert_file(&self, hostport: &str, path: &str, bytes: Vec<u8>) {
        self.state
            .lock()
            .hosts
            .entry(hostport.to_string())
            .or_default()
            .files
            .insert(path.to_string(), bytes);
    }

    /// Contents of a file on a host, if present.
    pub fn file(&self, hostport: &str, path: &str) -> Option<Vec<u8>> {
        self.state.lock().hosts.get(hostport)?.files.get(path).cloned()
    }

    /// Number of remote jobs the host currently tracks.
    pub fn job_count(&self, hostport: &str) -> usize {
        self.state
            .lock()
            .hosts
            .get(hostport)
            .map(|h| h.jobs.len())
            .unwrap_or(0)
    }

    /// Arms a one-shot fault: the next matching operation against
    /// `hostport` fails with `error`.
    pub fn inject_fault(&self, hostport: &str, op: FaultOp, error: NodeError) {
        self.state
            .lock()
            .hosts
            .entry(hostport.to_string())
            .or_default()
            .faults
            .push_back(Fault { op, error });
    }

    /// Forces the next job executed on `hostport` to report the given
    /// exit code and error text instead of running.
    pub fn fail_next_job(&self, hostport: &str, exit_code: i64, message: &str) {
        self.state
            .lock()
            .hosts
            .entry(hostport.to_string())
            .or_default()
            .job_failures
            .push_back((exit_code, message.to_string()));
    }

    fn check_fault(&self, hostport: &str, op: FaultOp) -> Result<(), NodeError> {
        match self.state.lock().take_fault(hostport, op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

struct SimFile {
    state: Arc<Mutex<SimState>>,
    hostport: String,
    path: String,
    closed: bool,
}

impl SimFile {
    fn guard(&self) -> Result<(), NodeError> {
        if self.closed {
            return Err(NodeError::new(
                NodeErrorKind::Other,
                self.hostport.clone(),
                "stream is closed",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl NodeFile for SimFile {
    async fn pread(
        &mut self,
        size: usize,
        offset: u64,
        _deadline: Duration,
    ) -> Result<Vec<u8>, NodeError> {
        self.guard()?;
        let state = self.state.lock();
        let host = state.host(&self.hostport)?;
        let bytes = host.files.get(&self.path).ok_or_else(|| {
            NodeError::new(NodeErrorKind::NotFound, self.hostport.clone(), self.path.clone())
        })?;
        let start = (offset as usize).min(bytes.len());
        let end = start.saturating_add(size).min(bytes.len());
        Ok(bytes[start..end].to_vec())
    }

    async fn pwrite(
        &mut self,
        data: &[u8],
        offset: u64,
        _deadline: Duration,
    ) -> Result<usize, NodeError> {
        self.guard()?;
        let mut state = self.state.lock();
        let hostport = self.hostport.clone();
        let host = state.host_mut(&hostport)?;
        let bytes = host.files.entry(self.path.clone()).or_default();
        let end = offset as usize + data.len();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[offset as usize..end].copy_from_slice(data);
        Ok(data.len())
    }

    async fn ftruncate(&mut self, length: u64, _deadline: Duration) -> Result<(), NodeError> {
        self.guard()?;
        let mut state = self.state.lock();
        let hostport = self.hostport.clone();
        let host = state.host_mut(&hostport)?;
        let bytes = host.files.entry(self.path.clone()).or_default();
        bytes.resize(length as usize, 0);
        Ok(())
    }

    async fn close(&mut self, _deadline: Duration) -> Result<(), NodeError> {
        self.guard()?;
        self.closed = true;
        Ok(())
    }
}

#[async_trait]
impl NodeClient for SimCluster {
    async fn open_read(
        &self,
        host: &StorageHost,
        path: &str,
        _deadline: Duration,
    ) -> Result<Box<dyn NodeFile>, NodeError> {
        self.check_fault(&host.hostport, FaultOp::OpenRead)?;
        let state = self.state.lock();
        let sim = state.host(&host.hostport)?;
        if !sim.files.contains_key(path) {
            return Err(NodeError::new(NodeErrorKind::NotFound, &host.hostport, path));
        }
        drop(state);
        Ok(Box::new(SimFile {
            state: Arc::clone(&self.state),
            hostport: host.hostport.clone(),
            path: path.to_string(),
            closed: false,
        }))
    }

    async fn create_exclusive(
        &self,
        host: &StorageHost,
        path: &str,
        _deadline: Duration,
    ) -> Result<Box<dyn NodeFile>, NodeError> {
        self.check_fault(&host.hostport, FaultOp::CreateExclusive)?;
        let mut state = self.state.lock();
        let sim = state.host_mut(&host.hostport)?;
        if sim.files.contains_key(path) {
            return Err(NodeError::new(NodeErrorKind::AlreadyExists, &host.hostport, path));
        }
        sim.files.insert(path.to_string(), Vec::new());
        drop(state);
        Ok(Box::new(SimFile {
            state: Arc::clone(&self.state),
            hostport: host.hostport.clone(),
            path: path.to_string(),
            closed: false,
        }))
    }

    async fn rename(
        &self,
        host: &StorageHost,
        from: &str,
        to: &str,
        _deadline: Duration,
    ) -> Result<(), NodeError> {
        self.check_fault(&host.hostport, FaultOp::Rename)?;
        let mut state = self.state.lock();
        let sim = state.host_mut(&host.hostport)?;
        match sim.files.remove(from) {
            Some(bytes) => {
                sim.files.insert(to.to_string(), bytes);
                Ok(())
            }
            None => Err(NodeError::new(NodeErrorKind::NotFound, &host.hostport, from)),
        }
    }

    async fn access(
        &self,
        host: &StorageHost,
        path: &str,
        _deadline: Duration,
    ) -> Result<(), NodeError> {
        self.check_fault(&host.hostport, FaultOp::Access)?;
        let state = self.state.lock();
        let sim = state.host(&host.hostport)?;
        if sim.files.contains_key(path) {
            Ok(())
        } else {
            Err(NodeError::new(NodeErrorKind::NotFound, &host.hostport, path))
        }
    }

    async fn stat(
        &self,
        host: &StorageHost,
        path: &str,
        _deadline: Duration,
    ) -> Result<FileInfo, NodeError> {
        self.check_fault(&host.hostport, FaultOp::Stat)?;
        let state = self.state.lock();
        let sim = state.host(&host.hostport)?;
        match sim.files.get(path) {
            Some(bytes) => Ok(FileInfo {
                size: bytes.len() as u64,
            }),
            None => Err(NodeError::new(NodeErrorKind::NotFound, &host.hostport, path)),
        }
    }

    async fn third_party_put(
        &self,
        from: &StorageHost,
        from_path: &str,
        to: &StorageHost,
        to_path: &str,
        _deadline: Duration,
    ) -> Result<u64, NodeError> {
        self.check_fault(&from.hostport, FaultOp::ThirdPartyPut)?;
        let mut state = self.state.lock();
        let bytes = state
            .host(&from.hostport)?
            .files
            .get(from_path)
            .cloned()
            .ok_or_else(|| NodeError::new(NodeErrorKind::NotFound, &from.hostport, from_path))?;
        let len = bytes.len() as u64;
        state.host_mut(&to.hostport)?.files.insert(to_path.to_string(), bytes);
        Ok(len)
    }

    async fn job_submit(
        &self,
        host: &StorageHost,
        spec: &JobSpec,
        _deadline: Duration,
    ) -> Result<RemoteJobId, NodeError> {
        self.check_fault(&host.hostport, FaultOp::JobSubmit)?;
        let mut state = self.state.lock();
        state.host(&host.hostport)?;
        state.next_cid += 1;
        let cid = RemoteJobId(state.next_cid);
        state
            .host_mut(&host.hostport)
            .expect("host checked above")
            .jobs
            .insert(
                cid,
                SimJob {
                    spec: spec.clone(),
                    phase: JobPhase::Submitted,
                },
            );
        Ok(cid)
    }

    async fn job_commit(
        &self,
        host: &StorageHost,
        cids: &[RemoteJobId],
        _deadline: Duration,
    ) -> Result<(), NodeError> {
        self.check_fault(&host.hostport, FaultOp::JobCommit)?;
        let mut state = self.state.lock();
        let sim = state.host_mut(&host.hostport)?;
        for cid in cids {
            let job = sim.jobs.get_mut(cid).ok_or_else(|| {
                NodeError::new(NodeErrorKind::JobLost, &host.hostport, format!("job {cid}"))
            })?;
            if matches!(job.phase, JobPhase::Submitted) {
                job.phase = JobPhase::Committed;
            }
        }
        Ok(())
    }

    async fn job_wait(
        &self,
        host: &StorageHost,
        _deadline: Duration,
    ) -> Result<Vec<RemoteJobStatus>, NodeError> {
        self.check_fault(&host.hostport, FaultOp::JobWait)?;
        let mut state = self.state.lock();
        state.host(&host.hostport)?;
        state.execute_jobs(&host.hostport);
        let sim = state.host(&host.hostport)?;
        Ok(sim
            .jobs
            .iter()
            .filter_map(|(cid, job)| match &job.phase {
                JobPhase::Done(exit) => Some(RemoteJobStatus {
                    cid: *cid,
                    exit: exit.clone(),
                }),
                _ => None,
            })
            .collect())
    }

    async fn job_reap(
        &self,
        host: &StorageHost,
        cids: &[RemoteJobId],
        _deadline: Duration,
    ) -> Result<(), NodeError> {
        self.check_fault(&host.hostport, FaultOp::JobReap)?;
        let mut state = self.state.lock();
        let sim = state.host_mut(&host.hostport)?;
        for cid in cids {
            sim.jobs.remove(cid).ok_or_else(|| {
                NodeError::new(NodeErrorKind::JobLost, &host.hostport, format!("job {cid}"))
            })?;
        }
        Ok(())
    }
}
