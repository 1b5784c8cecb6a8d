//! # Arena - pending writes for one partition generation
//!
//! A [`RecordArena`] buffers records that have been accepted by the write
//! path but not yet flushed into a column table. It is created empty, filled
//! by concurrent inserts, frozen when the writer flips it into the
//! "compacting" slot, flushed exactly once and then dropped.
//!
//! Records are keyed by a 160-bit [`Sha1Hash`]. Within one arena the highest
//! version of an id wins; the slot of the first insert is reused so
//! [`RecordArena::fetch_records`] yields rows in first-insert order, which is
//! the on-disk row order after a flush.

mod hash;

pub use hash::{RecordId, Sha1Hash};

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// One versioned write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub record_id: RecordId,
    pub version: u64,
    pub payload: Vec<u8>,
    /// Set by the writer when an older live version of the id existed.
    pub is_update: bool,
}

impl Record {
    pub fn new(record_id: RecordId, version: u64, payload: Vec<u8>) -> Self {
        Self {
            record_id,
            version,
            payload,
            is_update: false,
        }
    }
}

#[derive(Debug, Default)]
struct ArenaInner {
    records: Vec<Record>,
    slots: HashMap<RecordId, usize>,
    approx_size: usize,
}

/// Unordered, append-only buffer of [`Record`]s.
#[derive(Debug, Default)]
pub struct RecordArena {
    inner: RwLock<ArenaInner>,
    frozen: AtomicBool,
}

impl RecordArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `record`, returning `true` if it was accepted.
    ///
    /// A record is rejected when the arena already holds the same id at an
    /// equal or higher version, or when the arena has been frozen.
    pub fn insert_record(&self, record: Record) -> bool {
        if self.is_frozen() {
            return false;
        }

        let mut inner = self.inner.write();
        match inner.slots.get(&record.record_id).copied() {
            Some(slot) => {
                if inner.records[slot].version >= record.version {
                    return false;
                }
                let old_len = inner.records[slot].payload.len();
                inner.approx_size =
                    inner.approx_size.saturating_sub(old_len) + record.payload.len();
                inner.records[slot] = record;
            }
            None => {
                inner.approx_size += record.payload.len();
                let slot = inner.records.len();
                inner.slots.insert(record.record_id, slot);
                inner.records.push(record);
            }
        }
        true
    }

    /// Returns the version of `id` held by this arena, or `0` if absent.
    pub fn fetch_record_version(&self, id: &RecordId) -> u64 {
        let inner = self.inner.read();
        inner
            .slots
            .get(id)
            .map(|&slot| inner.records[slot].version)
            .unwrap_or(0)
    }

    /// Returns a copy of the record stored for `id`.
    pub fn fetch_record(&self, id: &RecordId) -> Option<Record> {
        let inner = self.inner.read();
        inner.slots.get(id).map(|&slot| inner.records[slot].clone())
    }

    /// Calls `f` once per record in first-insert order, stopping at the first
    /// error.
    pub fn fetch_records<F, E>(&self, mut f: F) -> Result<(), E>
    where
        F: FnMut(&Record) -> Result<(), E>,
    {
        let inner = self.inner.read();
        for record in &inner.records {
            f(record)?;
        }
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Sum of payload sizes in bytes.
    pub fn approx_size(&self) -> usize {
        self.inner.read().approx_size
    }

    /// Makes the arena immutable. Subsequent inserts are rejected.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }
}
