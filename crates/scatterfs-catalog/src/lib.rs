#![warn(missing_docs)]

//! ScatterFS catalog: the transactional record store behind the replica engine.
//!
//! The catalog holds four tables: content-addressed `File` rows, the
//! `StorageNode` inventory, the `Replica` edge set, and `TransferJob` rows
//! driving asynchronous replication. All access goes through the [`Catalog`]
//! trait so the engine can be run against any transactional backend;
//! [`MemoryCatalog`] is the in-process implementation.

pub mod error;
pub mod memory;
pub mod state;
pub mod store;
pub mod types;

pub use error::{CatalogError, CatalogResult};
pub use memory::MemoryCatalog;
pub use state::JobState;
pub use store::{Catalog, JobAdvance, ReplicationSource};
pub use types::{
    DegradedFile, FileId, FileRecord, JobExit, PlacementStats, RemoteJobId, ReplicaLocation,
    StorageNodeId, StorageNodeRecord, TransferJobId, TransferJobRecord,
};
