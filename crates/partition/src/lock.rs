//! Per-partition mutual exclusion.
//!
//! A partition merge reads, merges and rewrites one directory. Two merges of
//! the same directory must not interleave or one side's rows are lost, so
//! each partition directory gets its own mutex. Different partitions never
//! contend.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Lock table keyed by resolved partition directory.
#[derive(Debug, Default)]
pub struct LockTable {
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets or creates the lock for `partition_dir`.
    ///
    /// Hold the guard of the returned mutex for the whole read-merge-write;
    /// it is released when dropped, on every exit path.
    pub fn lock_for(&self, partition_dir: &Path) -> Arc<Mutex<()>> {
        self.locks
            .entry(partition_dir.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Number of partitions that have been locked at least once.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_path_shares_a_lock() {
        let table = LockTable::new();
        let a = table.lock_for(Path::new("root/p=1"));
        let b = table.lock_for(Path::new("root/p=1"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn different_paths_do_not_contend() {
        let table = LockTable::new();
        let a = table.lock_for(Path::new("root/p=1"));
        let b = table.lock_for(Path::new("root/p=2"));
        let _ga = a.lock();
        assert!(b.try_lock().is_some());
    }

    #[test]
    fn guard_release_on_drop() {
        let table = LockTable::new();
        let lock = table.lock_for(Path::new("root/p=1"));
        {
            let _guard = lock.lock();
            assert!(table.lock_for(Path::new("root/p=1")).try_lock().is_none());
        }
        assert!(lock.try_lock().is_some());
    }
}
