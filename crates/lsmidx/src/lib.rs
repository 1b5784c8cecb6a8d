//! # LSM Table Index
//!
//! Every column table file `<name>.cst` is accompanied by `<name>.idx`, a
//! sorted `record_id -> version` map ("vmap") of the rows it holds. The write
//! path and compaction consult the index instead of scanning the column
//! table whenever they need to know which version of an id is live.
//!
//! ## File layout
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ magic (u32 LE) "LSMI" | count (u64 LE)       │
//! ├──────────────────────────────────────────────┤
//! │ count × [record_id (20 bytes) | version u64] │
//! │ ids strictly ascending                       │
//! ├──────────────────────────────────────────────┤
//! │ crc32 (u32 LE) over every preceding byte     │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Parsed indexes are immutable and shared through an [`IndexCache`].

mod cache;

pub use cache::IndexCache;

use anyhow::{Context, Result};
use arena::{RecordId, Sha1Hash};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use std::collections::{BTreeMap, HashMap};
use std::fs::{rename, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Magic number identifying index files (ASCII "LSMI").
pub const INDEX_MAGIC: u32 = 0x4C53_4D49;

const ENTRY_BYTES: usize = Sha1Hash::SIZE + 8;
const HEADER_BYTES: usize = 4 + 8;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("not an index file (bad magic {0:#010x})")]
    BadMagic(u32),

    #[error("index checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("index truncated: {0} bytes")]
    Truncated(usize),

    #[error("index ids out of order at entry {0}")]
    Unsorted(usize),
}

/// Parsed, read-only vmap of one table file.
#[derive(Debug)]
pub struct LsmTableIndex {
    path: PathBuf,
    entries: Vec<(RecordId, u64)>,
}

impl LsmTableIndex {
    /// Persists `vmap` at `path`.
    ///
    /// Writes `<path>.tmp`, fsyncs it, renames it over `path` and fsyncs the
    /// parent directory.
    pub fn write(vmap: &BTreeMap<RecordId, u64>, path: &Path) -> Result<()> {
        let tmp_path = tmp_path_for(path);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .with_context(|| format!("failed to create {}", tmp_path.display()))?;

        let mut buf = Vec::with_capacity(HEADER_BYTES + vmap.len() * ENTRY_BYTES + 4);
        buf.write_u32::<LittleEndian>(INDEX_MAGIC)?;
        buf.write_u64::<LittleEndian>(vmap.len() as u64)?;
        for (id, version) in vmap {
            buf.write_all(id.as_bytes())?;
            buf.write_u64::<LittleEndian>(*version)?;
        }
        let mut hasher = Crc32::new();
        hasher.update(&buf);
        buf.write_u32::<LittleEndian>(hasher.finalize())?;

        let mut w = BufWriter::new(file);
        w.write_all(&buf)?;
        w.flush()?;
        w.into_inner()?.sync_all()?;

        rename(&tmp_path, path)?;
        if let Some(parent) = path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }

    /// Loads and validates the index at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let mut data = Vec::new();
        File::open(path)
            .with_context(|| format!("failed to open index {}", path.display()))?
            .read_to_end(&mut data)?;

        if data.len() < HEADER_BYTES + 4 {
            return Err(IndexError::Truncated(data.len()).into());
        }
        let (body, trailer) = data.split_at(data.len() - 4);
        let expected = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let mut hasher = Crc32::new();
        hasher.update(body);
        let actual = hasher.finalize();
        if expected != actual {
            return Err(IndexError::ChecksumMismatch { expected, actual }.into());
        }

        let mut r = body;
        let magic = r.read_u32::<LittleEndian>()?;
        if magic != INDEX_MAGIC {
            return Err(IndexError::BadMagic(magic).into());
        }
        let count = r.read_u64::<LittleEndian>()? as usize;
        if r.len() != count.saturating_mul(ENTRY_BYTES) {
            return Err(IndexError::Truncated(data.len()).into());
        }

        let mut entries: Vec<(RecordId, u64)> = Vec::with_capacity(count);
        for i in 0..count {
            let mut id = [0u8; Sha1Hash::SIZE];
            r.read_exact(&mut id)?;
            let version = r.read_u64::<LittleEndian>()?;
            let id = Sha1Hash::from_array(id);
            if let Some((prev, _)) = entries.last() {
                if *prev >= id {
                    return Err(IndexError::Unsorted(i).into());
                }
            }
            entries.push((id, version));
        }

        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &RecordId) -> Option<u64> {
        self.entries
            .binary_search_by(|(k, _)| k.cmp(id))
            .ok()
            .map(|i| self.entries[i].1)
    }

    /// Raises every id in `candidates` to the version held here, if higher.
    /// Ids not in `candidates` are ignored.
    pub fn lookup(&self, candidates: &mut HashMap<RecordId, u64>) {
        for (id, version) in candidates.iter_mut() {
            if let Some(v) = self.get(id) {
                if v > *version {
                    *version = v;
                }
            }
        }
    }

    /// Adds every id of this table that is not yet in `vmap`.
    ///
    /// Walking tables newest first, this leaves the winning version of each
    /// id in `vmap`.
    pub fn list(&self, vmap: &mut HashMap<RecordId, u64>) {
        for (id, version) in &self.entries {
            vmap.entry(*id).or_insert(*version);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RecordId, u64)> {
        self.entries.iter().map(|(id, v)| (id, *v))
    }
}

pub(crate) fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests;
