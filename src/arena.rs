//! Stable-handle arena.
//!
//! Every node in [`crate::rbt`] and [`crate::trie`] is identified by a
//! `u32` handle into one of these arenas rather than by an owning pointer,
//! per the cyclic-parent-pointer design note: parent/child/root links become
//! plain `Copy` indices, and grace-period–deferred reclaim is "return the
//! slot to the free list" instead of `dealloc`.
//!
//! Storage is chunked so that growing the arena never moves an
//! already-handed-out slot: each chunk is a boxed, fixed-size block
//! allocated once and never resized, and the directory of chunks is an
//! array of atomically-published pointers. This is the same "segments
//! never move" idea the pack's lock-free radix tree
//! (`other_examples/...-radix.rs.rs`) uses for its child-pointer slots,
//! generalized from a 64-ary fan-out to a flat slot arena.
//!
//! Concurrency contract: [`Arena::alloc`] and [`Arena::recycle`] must be
//! serialized by the owning structure's writer discipline (the RBT's
//! external mutex, or the trie's shadow-directory mutex) — an arena backs
//! exactly one tree/trie, which already guarantees single-writer access.
//! [`Arena::get`] is lock-free and safe to call from any number of readers
//! concurrently with that one writer, provided the handle was obtained
//! through the owning structure's own publication discipline (i.e. the
//! reader found it by following already-published tree pointers).

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

const CHUNK_BITS: u32 = 8;
const CHUNK_SIZE: usize = 1 << CHUNK_BITS; // 256 slots per chunk
const MAX_CHUNKS: usize = 1 << 16; // 16M slots of capacity, ample for this crate's tests

struct Chunk<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

impl<T> Chunk<T> {
    fn new() -> Box<Self> {
        let mut slots = Vec::with_capacity(CHUNK_SIZE);
        for _ in 0..CHUNK_SIZE {
            slots.push(UnsafeCell::new(MaybeUninit::uninit()));
        }
        Box::new(Chunk {
            slots: slots.into_boxed_slice(),
        })
    }
}

/// A chunked, stable-address arena of `T`, indexed by `u32` handle.
pub struct Arena<T> {
    chunks: Box<[AtomicPtr<Chunk<T>>]>,
    next: AtomicUsize,
    free: UnsafeCell<Vec<u32>>,
}

unsafe impl<T: Send> Send for Arena<T> {}
unsafe impl<T: Send + Sync> Sync for Arena<T> {}

impl<T> Arena<T> {
    /// Create an empty arena.
    pub fn new() -> Self {
        let mut chunks = Vec::with_capacity(MAX_CHUNKS);
        for _ in 0..MAX_CHUNKS {
            chunks.push(AtomicPtr::new(core::ptr::null_mut()));
        }
        Self {
            chunks: chunks.into_boxed_slice(),
            next: AtomicUsize::new(0),
            free: UnsafeCell::new(Vec::new()),
        }
    }

    #[inline]
    fn split(idx: u32) -> (usize, usize) {
        let idx = idx as usize;
        (idx >> CHUNK_BITS, idx & (CHUNK_SIZE - 1))
    }

    fn chunk_for(&self, chunk_idx: usize) -> &Chunk<T> {
        let slot = &self.chunks[chunk_idx];
        let mut ptr = slot.load(Ordering::Acquire);
        if ptr.is_null() {
            // SAFETY: caller discipline guarantees a single writer thread
            // reaches this path; no CAS race is possible.
            let fresh = Box::into_raw(Chunk::new());
            slot.store(fresh, Ordering::Release);
            ptr = fresh;
        }
        unsafe { &*ptr }
    }

    /// Allocate a slot, writing `value` into it, and return its handle.
    ///
    /// # Safety
    ///
    /// Must only be called by the structure's single serialized writer.
    pub unsafe fn alloc(&self, value: T) -> u32 {
        let idx = {
            let free = &mut *self.free.get();
            free.pop()
        };
        let idx = match idx {
            Some(idx) => idx,
            None => {
                let idx = self.next.fetch_add(1, Ordering::Relaxed);
                assert!(
                    idx < MAX_CHUNKS * CHUNK_SIZE,
                    "rcu-index arena exhausted its handle space"
                );
                idx as u32
            }
        };
        let (chunk_idx, offset) = Self::split(idx);
        let chunk = self.chunk_for(chunk_idx);
        let cell = chunk.slots[offset].get();
        (*cell).write(value);
        idx
    }

    /// Borrow the value stored at `handle`.
    ///
    /// # Safety
    ///
    /// `handle` must have been returned by [`Self::alloc`] and not yet
    /// passed to [`Self::recycle`] (or, if it has, a grace period must not
    /// yet have elapsed so the slot has not been overwritten — i.e. normal
    /// RCU reader discipline: the handle was observed before the call that
    /// recycled it completed its grace period).
    #[inline]
    pub unsafe fn get(&self, handle: u32) -> &T {
        let (chunk_idx, offset) = Self::split(handle);
        let ptr = self.chunks[chunk_idx].load(Ordering::Acquire);
        debug_assert!(!ptr.is_null(), "dereferenced an arena handle that was never allocated");
        (*(*ptr).slots[offset].get()).assume_init_ref()
    }

    /// Return `handle`'s slot to the free list so a future [`Self::alloc`]
    /// can reuse it. The caller is responsible for having already run the
    /// value's destructor (typically via a grace-period-deferred drop glue
    /// function) and for only doing so after a grace period during which no
    /// reader can still observe the old value.
    ///
    /// # Safety
    ///
    /// Must only be called by the structure's single serialized writer, and
    /// only once per handle between allocations.
    pub unsafe fn recycle(&self, handle: u32) {
        let free = &mut *self.free.get();
        free.push(handle);
    }

    /// Drop the value at `handle` in place without recycling the slot.
    /// Used by `defer_reclaim` free-function glue: the grace period has
    /// elapsed, so it is safe to run `T`'s destructor now.
    ///
    /// # Safety
    ///
    /// Same obligations as [`Self::get`], plus: the value must not be
    /// dropped a second time.
    pub unsafe fn drop_in_place(&self, handle: u32) {
        let (chunk_idx, offset) = Self::split(handle);
        let ptr = self.chunks[chunk_idx].load(Ordering::Acquire);
        (*(*ptr).slots[offset].get()).assume_init_drop();
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Arena<T> {
    fn drop(&mut self) {
        // Best-effort: we don't track which slots are live vs. recycled vs.
        // never-allocated, so we don't run destructors here. Structures
        // built on top of this arena are expected to have already driven
        // every node through `defer_reclaim` (which calls `drop_in_place`)
        // before the arena itself goes out of scope; leaking on top of that
        // is only possible if a structure is dropped mid-grace-period,
        // matching the crate-wide "cancellation may leak, never corrupt"
        // policy.
        for chunk in self.chunks.iter() {
            let ptr = chunk.load(Ordering::Relaxed);
            if !ptr.is_null() {
                unsafe { drop(Box::from_raw(ptr)) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_get_round_trip() {
        let arena: Arena<u64> = Arena::new();
        let h = unsafe { arena.alloc(42) };
        assert_eq!(unsafe { *arena.get(h) }, 42);
    }

    #[test]
    fn handles_stay_stable_across_chunk_boundary() {
        let arena: Arena<u32> = Arena::new();
        let mut handles = Vec::new();
        for i in 0..(CHUNK_SIZE as u32 * 3) {
            handles.push(unsafe { arena.alloc(i) });
        }
        for (i, h) in handles.iter().enumerate() {
            assert_eq!(unsafe { *arena.get(*h) }, i as u32);
        }
    }

    #[test]
    fn recycle_then_alloc_reuses_slot() {
        let arena: Arena<u64> = Arena::new();
        let h1 = unsafe { arena.alloc(1) };
        unsafe {
            arena.drop_in_place(h1);
            arena.recycle(h1);
        }
        let h2 = unsafe { arena.alloc(2) };
        assert_eq!(h1, h2);
        assert_eq!(unsafe { *arena.get(h2) }, 2);
    }

    #[test]
    fn values_with_drop_glue_run_destructor_once() {
        use core::sync::atomic::AtomicUsize as Counter;
        struct Tracked<'a>(&'a Counter);
        impl Drop for Tracked<'_> {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Counter::new(0);
        let arena: Arena<Tracked<'_>> = Arena::new();
        let h = unsafe { arena.alloc(Tracked(&drops)) };
        unsafe { arena.drop_in_place(h) };
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
