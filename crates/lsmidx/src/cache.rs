use anyhow::Result;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::LsmTableIndex;

/// Process-wide cache of parsed indexes, keyed by file path.
///
/// Shared by every partition writer. Callers delete the file before they
/// `flush` its path; `lookup` re-checks the file under the shard lock before
/// caching, so a load racing with that delete returns its copy uncached. A
/// caller holding an `Arc` keeps its copy alive after eviction.
#[derive(Debug, Default)]
pub struct IndexCache {
    entries: DashMap<PathBuf, Arc<LsmTableIndex>>,
}

impl IndexCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached index for `path`, loading it on first use.
    pub fn lookup(&self, path: &Path) -> Result<Arc<LsmTableIndex>> {
        if let Some(idx) = self.entries.get(path) {
            return Ok(idx.clone());
        }

        // Parse outside the shard lock; a racing loader may win, either copy is valid.
        let idx = Arc::new(LsmTableIndex::open(path)?);
        debug!(path = %path.display(), entries = idx.len(), "loaded table index");
        match self.entries.entry(path.to_path_buf()) {
            Entry::Occupied(e) => Ok(e.get().clone()),
            // Deleted while we parsed; flush may already have run.
            Entry::Vacant(_) if !path.exists() => Ok(idx),
            Entry::Vacant(e) => Ok(e.insert(idx).clone()),
        }
    }

    /// Evicts `path`, typically after its table file was deleted.
    pub fn flush(&self, path: &Path) {
        self.entries.remove(path);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
