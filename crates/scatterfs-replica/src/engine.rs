//! The replica engine service object.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::debug;

use scatterfs_catalog::{Catalog, FileId};

use crate::config::EngineConfig;
use crate::error::{ReplicaError, Result};
use crate::node::NodeClient;

/// The replica engine: serves client reads and writes against replicated
/// files, replicates synchronously on demand, and drives the
/// reconciliation tick.
///
/// All coordination happens through the injected [`Catalog`]; the engine
/// holds no in-process locks around its operations, so client paths and
/// the tick may run concurrently.
pub struct ReplicaEngine {
    pub(crate) catalog: Arc<dyn Catalog>,
    pub(crate) nodes: Arc<dyn NodeClient>,
    pub(crate) config: EngineConfig,
    pub(crate) last_stats: Mutex<Option<Instant>>,
}

impl ReplicaEngine {
    /// Builds an engine over the given catalog and node client.
    pub fn new(catalog: Arc<dyn Catalog>, nodes: Arc<dyn NodeClient>, config: EngineConfig) -> Self {
        Self {
            catalog,
            nodes,
            config,
            last_stats: Mutex::new(None),
        }
    }

    /// The catalog this engine coordinates through.
    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    /// Records that `fid` exists with `size` bytes at the node addressed
    /// by `hostport`. Idempotent bookkeeping; callers invoke it after
    /// confirming the bytes are physically present.
    pub async fn register(&self, fid: FileId, size: u64, hostport: &str) -> Result<()> {
        debug!(%fid, size, hostport, "registering replica");
        self.catalog.register(fid, size, hostport).await?;
        Ok(())
    }

    /// Updates a file's desired replication factor.
    pub async fn set_replication(&self, fid: FileId, minimum_replicas: u32) -> Result<()> {
        debug!(%fid, minimum_replicas, "updating replication factor");
        if self.catalog.set_minimum_replicas(fid, minimum_replicas).await? {
            Ok(())
        } else {
            Err(ReplicaError::InvalidArgument {
                msg: format!("no such file: {fid}"),
            })
        }
    }
}
