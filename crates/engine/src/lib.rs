//! # Engine - partition storage
//!
//! Durable, versioned storage for the partitions of a table. Records are
//! buffered in memory, flushed to immutable column table files, merged by
//! compaction and pushed to peer nodes by replication.
//!
//! ## Architecture
//!
//! ```text
//! insert_records(batch)
//!   |
//!   v
//! ┌──────────────────────────────────────────────────────────┐
//! │                       PARTITION                          │
//! │                                                          │
//! │ writer ─▶ head arena (RecordArena)                       │
//! │             |                                            │
//! │             |  commit(): freeze, flip, flush             │
//! │             v                                            │
//! │           <name>.cst + <name>.idx      ◀── IndexCache    │
//! │             |                                            │
//! │             |  compact(): tables > soft limit            │
//! │             v                                            │
//! │           one merged table, live versions only           │
//! │                                                          │
//! │ _snapshot  PartitionState: tables, lsm_sequence, offsets │
//! └──────────────────────────────────────────────────────────┘
//!             |
//!             | replicate(): rows with sequence > replica offset
//!             v
//!           peers
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module            | Purpose                                                 |
//! |-------------------|---------------------------------------------------------|
//! | [`partition`]     | `Partition` façade, directory layout, create / reopen   |
//! | [`state`]         | `PartitionState` and its atomic `_snapshot` file        |
//! | [`snapshot`]      | Immutable `PartitionSnapshot` and its swap handle       |
//! | [`writer`]        | `PartitionWriter` trait, LSM insert / commit / compact  |
//! | [`static_writer`] | Whole-file writer for static tables                     |
//! | [`compaction`]    | `CompactionStrategy` and the simple merge-all strategy  |
//! | [`lsm_table`]     | Bookkeeping columns, arena flush, table scanning        |
//! | [`reader`]        | Snapshot readers                                        |
//! | [`replication`]   | Replication schemes and strategies                      |
//! | [`transport`]     | Replica transport trait, HTTP implementation, envelopes |
//!
//! ## Versioning
//!
//! For every record id only the highest version is live. A write whose
//! version is not newer than the live one is dropped without error, which
//! makes replaying a replication batch a no-op.
//!
//! ## Crash Safety
//!
//! Table files, indexes and `_snapshot` are written to a temp file, fsynced
//! and renamed into place. `_snapshot` is the source of truth: on reopen temp
//! files and unreferenced tables are deleted, and a referenced but missing
//! table is reported as corruption. Records still in an arena when the
//! process dies are lost; callers re-deliver them.

pub mod compaction;
mod error;
pub mod lsm_table;
pub mod partition;
pub mod reader;
pub mod replication;
pub mod snapshot;
pub mod state;
pub mod static_writer;
pub mod table;
pub mod transport;
pub mod writer;

pub use arena::{Record, RecordId, Sha1Hash};
pub use compaction::{CompactionStrategy, SimpleCompactionStrategy};
pub use config::EngineConfig;
pub use error::PartitionError;
pub use partition::{EngineContext, Partition};
pub use reader::{LsmPartitionReader, PartitionReader, StaticPartitionReader};
pub use replication::{
    FixedReplicationScheme, LsmPartitionReplication, PartitionReplication, ReplicaRef,
    ReplicationScheme, StandaloneReplicationScheme, StaticPartitionReplication,
};
pub use snapshot::{PartitionSnapshot, PartitionSnapshotRef};
pub use state::{LsmTableRef, PartitionState, ReplicationState};
pub use static_writer::StaticPartitionWriter;
pub use table::{Table, TableStorage};
pub use transport::{
    HttpTransport, PartitionAddr, PartitionInfo, RecordEnvelope, RecordEnvelopeList,
    ReplicaTransport,
};
pub use writer::{LsmPartitionWriter, PartitionWriter};

#[cfg(test)]
mod tests;
