//! Client write path.
//!
//! A new file is streamed to a placement-selected node under a temporary
//! path while a running content digest tracks the logical bytes. Closing
//! finalizes the digest into the file identifier, renames the temporary
//! file to its canonical content-addressed path, and registers the
//! replica.

use sha1::{Digest, Sha1};
use tracing::debug;

use scatterfs_catalog::{Catalog, FileId};

use crate::config::EngineConfig;
use crate::engine::ReplicaEngine;
use crate::error::{ReplicaError, Result};
use crate::node::{NodeClient, NodeFile, StorageHost};
use crate::placement;

use std::sync::Arc;

/// A writable stream for a file whose identity is not yet known.
pub struct FileWriter {
    host: StorageHost,
    path: String,
    stream: Option<Box<dyn NodeFile>>,
    digest: Sha1,
    size: u64,
    catalog: Arc<dyn Catalog>,
    nodes: Arc<dyn NodeClient>,
    config: EngineConfig,
}

impl FileWriter {
    /// The node this writer is bound to.
    pub fn host(&self) -> &StorageHost {
        &self.host
    }

    /// Bytes written so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Appends `data` at the current offset, feeding the accepted bytes
    /// into the running digest. Returns the bytes accepted.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or(ReplicaError::InvalidState)?;
        let n = stream
            .pwrite(data, self.size, self.config.control_deadline)
            .await?;
        self.digest.update(&data[..n]);
        self.size += n as u64;
        Ok(n)
    }

    /// Sets the logical length. Growing replays zero bytes through the
    /// digest; resetting to zero reinitializes it. Shrinking to a
    /// nonzero length is rejected.
    pub async fn truncate(&mut self, length: u64) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(ReplicaError::InvalidState)?;
        if 0 < length && length < self.size {
            return Err(ReplicaError::InvalidArgument {
                msg: format!("cannot shrink from {} to {length} bytes", self.size),
            });
        }
        stream.ftruncate(length, self.config.control_deadline).await?;
        if length == 0 {
            self.digest = Sha1::new();
            self.size = 0;
            return Ok(());
        }
        static ZEROES: [u8; 1 << 20] = [0u8; 1 << 20];
        let mut remaining = length - self.size;
        self.size = length;
        while remaining > 0 {
            let chunk = (ZEROES.len() as u64).min(remaining) as usize;
            self.digest.update(&ZEROES[..chunk]);
            remaining -= chunk as u64;
        }
        Ok(())
    }

    /// Closes the stream, finalizes the content identifier, renames the
    /// temporary file to its canonical path, and registers the replica.
    /// Returns the identifier and observed size.
    pub async fn close(&mut self) -> Result<(FileId, u64)> {
        let mut stream = self.stream.take().ok_or(ReplicaError::InvalidState)?;
        stream.close(self.config.control_deadline).await?;

        let digest = std::mem::take(&mut self.digest);
        let fid = FileId::from_bytes(digest.finalize().into());
        let replica = self.host.replica_path(fid);
        self.nodes
            .rename(&self.host, &self.path, &replica, self.config.control_deadline)
            .await?;
        self.catalog
            .register(fid, self.size, &self.host.hostport)
            .await?;
        debug!(%fid, size = self.size, host = %self.host.hostport, "write closed");
        Ok((fid, self.size))
    }
}

impl ReplicaEngine {
    /// Creates an exclusive temporary file on the best-ranked node that
    /// accepts it and returns a writer bound to it. Fails with
    /// [`Io`](ReplicaError::Io) when every node refuses.
    pub async fn create_for_write(&self) -> Result<FileWriter> {
        let mut candidates = self.catalog.placement_stats().await?;
        placement::rank(&mut candidates);

        for candidate in &candidates {
            let host = StorageHost::new(candidate.hostport.clone(), candidate.root.clone());
            let path = host.scratch_path();
            match self
                .nodes
                .create_exclusive(&host, &path, self.config.control_deadline)
                .await
            {
                Ok(stream) => {
                    debug!(host = %host.hostport, %path, "created write stream");
                    return Ok(FileWriter {
                        host,
                        path,
                        stream: Some(stream),
                        digest: Sha1::new(),
                        size: 0,
                        catalog: Arc::clone(&self.catalog),
                        nodes: Arc::clone(&self.nodes),
                        config: self.config.clone(),
                    });
                }
                Err(err) => {
                    // This node is no good, move on.
                    debug!(host = %host.hostport, error = %err, "create refused");
                }
            }
        }
        Err(ReplicaError::Io {
            msg: format!("no storage node accepted a new file ({} tried)", candidates.len()),
        })
    }
}
