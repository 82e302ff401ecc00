//! Synchronous replication: copy one file to a target node inline,
//! falling back across every known source replica.

use std::time::SystemTime;

use tracing::debug;

use scatterfs_catalog::{Catalog, FileId, ReplicationSource, StorageNodeId};

use crate::engine::ReplicaEngine;
use crate::error::{NodeErrorKind, ReplicaError, Result};
use crate::node::{NodeClient, StorageHost};

impl ReplicaEngine {
    /// Ensures a replica of `fid` exists on `target`, copying from an
    /// existing replica if needed. Idempotent: succeeds immediately when
    /// the Replica row already exists. Used when an operation needs an
    /// extra copy right now rather than via the reconciliation tick; a
    /// synthetic completed transfer job is recorded for audit.
    pub async fn replicate(&self, fid: FileId, target: StorageNodeId, tag: &str) -> Result<()> {
        if self.catalog.replica_exists(fid, target).await? {
            return Ok(());
        }
        debug!(%fid, %target, "synchronously replicating");

        let node = self.catalog.storage_node(target).await?;
        let target_host = StorageHost::from(&node);
        let open = target_host.scratch_path();
        let closed = target_host.replica_path(fid);
        let started = SystemTime::now();
        let control = self.config.control_deadline;

        let source = if self
            .nodes
            .access(&target_host, &closed, control)
            .await
            .is_ok()
        {
            // Already there, just not in the catalog yet.
            None
        } else {
            Some(self.copy_from_any_source(fid, target, &target_host, &open, &closed).await?)
        };

        self.catalog
            .record_replication(fid, source, target, started, tag)
            .await?;
        debug!(%fid, %target, "replica recorded");
        Ok(())
    }

    /// Tries a third-party copy from each existing replica in turn,
    /// renaming the scratch file into place on success.
    async fn copy_from_any_source(
        &self,
        fid: FileId,
        target: StorageNodeId,
        target_host: &StorageHost,
        open: &str,
        closed: &str,
    ) -> Result<ReplicationSource> {
        let control = self.config.control_deadline;
        let sources = self.catalog.file_replicas(fid).await?;

        for location in &sources {
            let from = StorageHost::new(location.hostport.clone(), location.root.clone());
            let from_path = from.replica_path(fid);
            let deadline = self.config.transfer_deadline(location.size);
            debug!(
                %fid,
                from = %from.hostport,
                to = %target_host.hostport,
                size = location.size,
                ?deadline,
                "third-party copy"
            );

            match self
                .nodes
                .third_party_put(&from, &from_path, target_host, open, deadline)
                .await
            {
                Ok(_) => {}
                Err(err) => {
                    debug!(%fid, from = %from.hostport, error = %err, "copy failed, trying next source");
                    continue;
                }
            }

            match self.nodes.rename(target_host, open, closed, control).await {
                Ok(()) => {
                    return Ok(ReplicationSource {
                        fsid: location.sid,
                        size: location.size,
                    });
                }
                Err(err) if err.kind == NodeErrorKind::NotFound => {
                    // A previous rename from this call may have won the
                    // race; re-check before giving up on this source.
                    if self.nodes.access(target_host, closed, control).await.is_ok() {
                        return Ok(ReplicationSource {
                            fsid: location.sid,
                            size: location.size,
                        });
                    }
                    debug!(%fid, from = %from.hostport, "scratch file vanished, trying next source");
                }
                Err(err) => {
                    debug!(%fid, from = %from.hostport, error = %err, "rename failed, trying next source");
                }
            }
        }

        Err(ReplicaError::Io {
            msg: format!(
                "no source replica of {fid} could be copied to node {target} ({} tried)",
                sources.len()
            ),
        })
    }
}
