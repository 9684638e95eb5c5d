//! Trie shadow directory.
//!
//! LINEAR and POOL trie nodes are sized for cache locality on the read
//! path, so per-node update-side state (a mutex, child-count bookkeeping,
//! the fallback-removal counter) lives in a side table keyed by node
//! handle instead of inline in the node. Readers never consult this table;
//! only [`crate::trie::Trie`]'s update-side methods do.
//!
//! The mutex is reference-counted rather than owned by one record, since a
//! node that gets recompacted into a fresh one (growing or shrinking class)
//! must keep using the *same* mutex identity across the swap — a concurrent
//! updater blocked waiting on the old node's mutex must end up holding the
//! new node's lock once it wakes.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::spinlock::FasLock;

const BUCKETS: usize = 64;

fn bucket_for(node: u32) -> usize {
    (node as usize).wrapping_mul(2654435761) % BUCKETS
}

/// Shared mutex identity, kept alive across recompaction by reference count.
pub type ShadowMutex = Arc<FasLock<()>>;

struct Entry {
    node: u32,
    mutex: ShadowMutex,
    child_count: AtomicU32,
    fallback_removals: AtomicU32,
    level: u8,
}

/// A lookup-locked shadow record, held while the caller mutates the node it
/// describes. Dropping it releases the mutex.
///
/// Field order matters: `_lock` borrows from `_mutex` through a lifetime
/// extended by this struct, so it must drop first. Struct fields drop in
/// declaration order, and `_mutex`'s `Arc` keeps the lock's allocation
/// alive (and non-moving) for exactly as long as `_lock` needs it.
pub struct ShadowGuard<'a> {
    directory: &'a ShadowDirectory,
    node: u32,
    _lock: crate::spinlock::FasLockGuard<'static, ()>,
    _mutex: ShadowMutex,
}

impl<'a> ShadowGuard<'a> {
    pub fn child_count(&self) -> u32 {
        self.directory.with_entry(self.node, |e| e.child_count.load(Ordering::Acquire)).unwrap_or(0)
    }

    pub fn set_child_count(&self, n: u32) {
        self.directory.with_entry(self.node, |e| e.child_count.store(n, Ordering::Release));
    }

    pub fn fallback_removals(&self) -> u32 {
        self.directory
            .with_entry(self.node, |e| e.fallback_removals.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn set_fallback_removals(&self, n: u32) {
        self.directory
            .with_entry(self.node, |e| e.fallback_removals.store(n, Ordering::Release));
    }

    pub fn level(&self) -> u8 {
        self.directory.with_entry(self.node, |e| e.level).unwrap_or(0)
    }

    pub fn mutex(&self) -> ShadowMutex {
        self.directory
            .with_entry(self.node, |e| e.mutex.clone())
            .expect("shadow record present while guard is held")
    }
}

/// Concurrent hash table from trie node handle to shadow record.
pub struct ShadowDirectory {
    buckets: Vec<FasLock<Vec<Entry>>>,
}

impl ShadowDirectory {
    pub fn new() -> Self {
        let mut buckets = Vec::with_capacity(BUCKETS);
        for _ in 0..BUCKETS {
            buckets.push(FasLock::new(Vec::new()));
        }
        Self { buckets }
    }

    fn with_entry<R>(&self, node: u32, f: impl FnOnce(&Entry) -> R) -> Option<R> {
        let bucket = self.buckets[bucket_for(node)].lock();
        bucket.iter().find(|e| e.node == node).map(f)
    }

    /// Install a shadow record for `new_node` with the given initial child
    /// count. When `inherit_from` is `Some`, the new record reuses that
    /// node's mutex pointer instead of allocating a fresh one — used by
    /// recompaction so blocked waiters on the old node transparently end up
    /// serialized against the new one. Safe to call while still holding the
    /// inherited mutex: a brand new record is not reachable by any other
    /// updater until the caller publishes `new_node` into the tree, so no
    /// further locking of it is needed here.
    pub fn set(&self, new_node: u32, level: u8, child_count: u32, inherit_from: Option<u32>) {
        let mutex = match inherit_from {
            Some(old) => self
                .with_entry(old, |e| e.mutex.clone())
                .unwrap_or_else(|| Arc::new(FasLock::new(()))),
            None => Arc::new(FasLock::new(())),
        };
        let entry = Entry {
            node: new_node,
            mutex,
            child_count: AtomicU32::new(child_count),
            fallback_removals: AtomicU32::new(0),
            level,
        };
        self.buckets[bucket_for(new_node)].lock().push(entry);
    }

    /// Take the shadow record's mutex and hand back a guard, or `None` if
    /// the record was concurrently cleared.
    pub fn lookup_lock(&self, node: u32) -> Option<ShadowGuard<'_>> {
        let mutex = self.with_entry(node, |e| e.mutex.clone())?;
        let guard = mutex.lock();
        // SAFETY: extend the guard's borrow to 'static. Sound because the
        // guard is stored alongside the `Arc` it borrows from in
        // `ShadowGuard`, whose declared field order drops the guard before
        // the `Arc`, and the `Arc`'s heap allocation never moves.
        let guard: crate::spinlock::FasLockGuard<'static, ()> = unsafe { core::mem::transmute(guard) };
        Some(ShadowGuard {
            directory: self,
            node,
            _lock: guard,
            _mutex: mutex,
        })
    }

    /// Unlink `node`'s shadow record. Returns the record's mutex so the
    /// caller can decide whether to keep it alive (e.g. handing it to a
    /// freshly recompacted node via `set`'s `inherit_from`).
    pub fn clear(&self, node: u32) -> Option<ShadowMutex> {
        let mut bucket = self.buckets[bucket_for(node)].lock();
        let idx = bucket.iter().position(|e| e.node == node)?;
        Some(bucket.swap_remove(idx).mutex)
    }
}

impl Default for ShadowDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_lookup_lock_round_trip() {
        let dir = ShadowDirectory::new();
        dir.set(7, 2, 0, None);
        let guard = dir.lookup_lock(7).expect("record exists");
        assert_eq!(guard.level(), 2);
        guard.set_child_count(5);
        drop(guard);
        let guard = dir.lookup_lock(7).unwrap();
        assert_eq!(guard.child_count(), 5);
    }

    #[test]
    fn clear_makes_lookup_fail() {
        let dir = ShadowDirectory::new();
        dir.set(3, 0, 0, None);
        dir.clear(3);
        assert!(dir.lookup_lock(3).is_none());
    }

    #[test]
    fn recompaction_inherits_mutex_identity() {
        let dir = ShadowDirectory::new();
        dir.set(1, 0, 0, None);
        let old_mutex = dir.lookup_lock(1).unwrap().mutex();
        dir.clear(1);
        dir.set(2, 0, 0, Some(1));
        // Can't compare Arc identity directly without PartialEq on FasLock,
        // but both should point at the same allocation.
        let new_mutex = dir.lookup_lock(2).unwrap().mutex();
        assert!(Arc::ptr_eq(&old_mutex, &new_mutex));
    }
}
