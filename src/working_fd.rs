//! The working-descriptor cache: path → an open, readable descriptor used
//! as the source side of range-clones (spec.md §4.3).
//!
//! Modeled on `CheckpointsView` in `lib/file-source/src/checkpointer.rs`:
//! a `DashMap`-backed handle consulted from many threads with no outer
//! lock, plus an age-based sweep (`remove_expired`) run opportunistically
//! rather than on a timer.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;

use crate::config::{WORKING_FD_MAX_AGE, WORKING_FD_THRESHOLD};

struct WorkingFd {
    file: Arc<File>,
    atime: Instant,
}

/// At most one descriptor per path (spec.md §3 invariant). Descriptors
/// are never explicitly closed on eviction; dropping the last `Arc<File>`
/// lets the OS reclaim it via the ordinary (non-interposed) close path
/// (see DESIGN.md, Open Question 1).
#[derive(Default)]
pub struct WorkingFdCache {
    entries: DashMap<String, WorkingFd>,
}

impl WorkingFdCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached descriptor for `path`, opening it read-only if
    /// not already cached. Propagates the open failure verbatim on miss
    /// (spec.md §4.3).
    pub fn acquire(&self, path: &str) -> std::io::Result<Arc<File>> {
        self.maybe_collect();

        if let Some(mut entry) = self.entries.get_mut(path) {
            entry.atime = Instant::now();
            return Ok(Arc::clone(&entry.file));
        }

        let file = Arc::new(File::open(Path::new(path))?);
        self.entries.insert(
            path.to_string(),
            WorkingFd {
                file: Arc::clone(&file),
                atime: Instant::now(),
            },
        );
        Ok(file)
    }

    /// Scans and prunes stale entries once the cache's population crosses
    /// `WORKING_FD_THRESHOLD`. Called opportunistically at the top of
    /// `acquire` (spec.md §4.3).
    fn maybe_collect(&self) {
        if self.entries.len() < WORKING_FD_THRESHOLD {
            return;
        }

        let now = Instant::now();
        self.entries
            .retain(|_, entry| now.duration_since(entry.atime) < WORKING_FD_MAX_AGE);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}
