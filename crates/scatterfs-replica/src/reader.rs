//! Client read path.

use std::time::Duration;

use rand::seq::SliceRandom;
use tracing::debug;

use scatterfs_catalog::{Catalog, FileId};

use crate::engine::ReplicaEngine;
use crate::error::{ReplicaError, Result};
use crate::node::{NodeClient, NodeFile, StorageHost};

/// A readable stream bound to one replica of a file.
pub struct ReplicaReader {
    fid: FileId,
    host: StorageHost,
    stream: Option<Box<dyn NodeFile>>,
    deadline: Duration,
}

impl ReplicaReader {
    /// The node this reader is bound to.
    pub fn host(&self) -> &StorageHost {
        &self.host
    }

    /// Reads up to `size` bytes at `offset` from the bound replica.
    pub async fn pread(&mut self, size: usize, offset: u64) -> Result<Vec<u8>> {
        let stream = self.stream.as_mut().ok_or(ReplicaError::InvalidState)?;
        let bytes = stream.pread(size, offset, self.deadline).await?;
        debug!(fid = %self.fid, size, offset, read = bytes.len(), "pread");
        Ok(bytes)
    }

    /// Closes the stream. The handle is unusable for further I/O;
    /// closing twice is an invalid-state error.
    pub async fn close(&mut self) -> Result<()> {
        let mut stream = self.stream.take().ok_or(ReplicaError::InvalidState)?;
        stream.close(self.deadline).await?;
        debug!(fid = %self.fid, host = %self.host.hostport, "closed replica stream");
        Ok(())
    }
}

impl ReplicaEngine {
    /// Opens a readable stream against a randomly chosen replica of
    /// `fid`, trying each candidate until one opens.
    ///
    /// Returns [`NotFound`](ReplicaError::NotFound) when no replica
    /// exists, or [`Io`](ReplicaError::Io) when replicas exist but every
    /// open attempt failed.
    pub async fn open_for_read(&self, fid: FileId) -> Result<ReplicaReader> {
        // Snapshot first so candidate probing holds no catalog locks.
        let mut candidates = self.catalog.file_replicas(fid).await?;
        if candidates.is_empty() {
            return Err(ReplicaError::NotFound { fid });
        }
        candidates.shuffle(&mut rand::thread_rng());

        for location in &candidates {
            let host = StorageHost::new(location.hostport.clone(), location.root.clone());
            let path = host.replica_path(fid);
            match self
                .nodes
                .open_read(&host, &path, self.config.control_deadline)
                .await
            {
                Ok(stream) => {
                    debug!(%fid, host = %host.hostport, %path, "opened replica");
                    return Ok(ReplicaReader {
                        fid,
                        host,
                        stream: Some(stream),
                        deadline: self.config.control_deadline,
                    });
                }
                Err(err) => {
                    debug!(%fid, host = %host.hostport, error = %err, "replica open failed, trying next");
                }
            }
        }
        Err(ReplicaError::Io {
            msg: format!("all {} replicas of {fid} refused to open", candidates.len()),
        })
    }
}
