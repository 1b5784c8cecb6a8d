use thiserror::Error;

/// Partition-level failures callers may want to tell apart.
///
/// Returned wrapped in [`anyhow::Error`]; recover with `downcast_ref`.
#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("partition {0} is frozen")]
    Frozen(String),

    #[error("concurrent modification of partition {partition}: {reason}")]
    ConcurrentModification { partition: String, reason: String },

    #[error("can't merge CSTables after a new required column was added (column '{0}')")]
    SchemaIncompatible(String),

    #[error("corrupt partition: {0}")]
    Corrupt(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("replication to {addr} failed with status {status}: {body}")]
    Replication {
        addr: String,
        status: u16,
        body: String,
    },
}
