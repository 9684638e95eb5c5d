//! Grace-period facade.
//!
//! This is the one piece of the crate that plays the role of an external
//! collaborator: [`crate::rbt`], [`crate::trie`], and [`crate::range`] are
//! all written against the four operations below (`read_lock`/`read_unlock`,
//! `defer_reclaim`, `barrier`) and never reach into epoch bookkeeping
//! directly. [`RcuDomain`] is a concrete, usable implementation of that
//! contract — a 3-bucket epoch reclaimer in the style of this crate's
//! `epoch` primitives, generalized so a single domain can back several
//! independent index structures at once.
//!
//! # Model
//!
//! Every thread that wants to read must first [`RcuDomain::register`],
//! which hands back a [`ReadHandle`] bound to that thread (it is `!Send`).
//! Read sections are bracketed with [`ReadHandle::read_lock`] /
//! [`ReadHandle::read_unlock`], which nest: the handle just carries an
//! active-section counter, so re-entrant brackets on one thread are free.
//! Writers defer frees with [`RcuDomain::defer_reclaim`] — this does not
//! require the calling thread to be registered, since updaters may run on
//! threads that never read. [`RcuDomain::barrier`] blocks until every
//! deferral submitted before the call has run.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::backoff::Backoff;
use crate::pr;
use crate::spinlock::FasLock;

const EPOCH_BUCKETS: usize = 3;
const EPOCH_GRACE: usize = 2;

struct Retired {
    ptr: *mut (),
    free_fn: unsafe fn(*mut ()),
}

unsafe impl Send for Retired {}

/// Per-thread registration record.
struct ReaderRecord {
    epoch: AtomicUsize,
    /// Nesting depth of active read sections; 0 means outside any.
    active: AtomicUsize,
    next: AtomicPtr<ReaderRecord>,
}

impl ReaderRecord {
    fn new() -> Self {
        Self {
            epoch: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

/// A grace-period context, threaded through the API as a single object per
/// design note (rather than relying on process-wide globals).
pub struct RcuDomain {
    epoch: AtomicUsize,
    readers: AtomicPtr<ReaderRecord>,
    garbage: [FasLock<Vec<Retired>>; EPOCH_BUCKETS],
}

impl RcuDomain {
    /// Create a fresh, empty domain. Corresponds to the facade's `init`.
    pub const fn new() -> Self {
        Self {
            epoch: AtomicUsize::new(0),
            readers: AtomicPtr::new(ptr::null_mut()),
            garbage: [FasLock::new(Vec::new()), FasLock::new(Vec::new()), FasLock::new(Vec::new())],
        }
    }

    /// Register the calling thread as a reader, returning a handle it keeps
    /// for the rest of its lifetime (or until the thread stops reading).
    pub fn register(&self) -> ReadHandle<'_> {
        let record = Box::into_raw(Box::new(ReaderRecord::new()));
        let mut head = self.readers.load(Ordering::Relaxed);
        loop {
            unsafe { (*record).next.store(head, Ordering::Relaxed) };
            match self.readers.compare_exchange_weak(
                head,
                record,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }
        ReadHandle {
            domain: self,
            record,
            _not_send: PhantomData,
        }
    }

    /// Defer `free_fn(obj)` until every read section active right now has
    /// ended. Never runs `free_fn` synchronously.
    ///
    /// # Safety
    ///
    /// `obj` must be a valid pointer that `free_fn` is the correct
    /// deallocation routine for, and must not be reclaimed by any other
    /// path.
    pub unsafe fn defer_reclaim<T>(&self, obj: *mut T, free_fn: unsafe fn(*mut T)) {
        let bucket = self.epoch.load(Ordering::Acquire) % EPOCH_BUCKETS;
        // SAFETY: the transmute only erases the pointee type for storage;
        // `free_fn` below is re-specialized to `T` by the caller-supplied
        // function pointer, which already carries the right type.
        let erased_free: unsafe fn(*mut ()) = core::mem::transmute(free_fn);
        self.garbage[bucket].lock().push(Retired {
            ptr: obj as *mut (),
            free_fn: erased_free,
        });
    }

    /// Attempt to advance the global epoch by one. Fails if some registered,
    /// active reader has not yet observed the current epoch.
    fn try_advance(&self) -> bool {
        let current = self.epoch.load(Ordering::Acquire);
        let mut node = self.readers.load(Ordering::Acquire);
        while !node.is_null() {
            let record = unsafe { &*node };
            if record.active.load(Ordering::Acquire) != 0
                && record.epoch.load(Ordering::Acquire) != current
            {
                return false;
            }
            node = record.next.load(Ordering::Acquire);
        }
        self.epoch
            .compare_exchange(current, current.wrapping_add(1), Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Free everything in the bucket that is `EPOCH_GRACE` epochs behind the
    /// current one — by construction, no active reader can still be inside a
    /// section that started before that bucket was last written.
    fn drain_quiescent_bucket(&self) {
        let current = self.epoch.load(Ordering::Acquire);
        let bucket = current.wrapping_sub(EPOCH_GRACE) % EPOCH_BUCKETS;
        let mut garbage = self.garbage[bucket].lock();
        for item in garbage.drain(..) {
            unsafe { (item.free_fn)(item.ptr) };
        }
    }

    /// Block until every deferral submitted before this call has run.
    pub fn barrier(&self) {
        let mut backoff = Backoff::new();
        // One full lap of EPOCH_BUCKETS advances guarantees anything
        // deferred before this call now sits in a bucket old enough to
        // drain, however many buckets it was pushed into.
        for _ in 0..EPOCH_BUCKETS {
            while !self.try_advance() {
                backoff.spin();
            }
            self.drain_quiescent_bucket();
        }
    }

    /// Number of entries awaiting reclamation across all epoch buckets.
    /// Exposed for tests and diagnostics, not part of the facade contract.
    pub fn pending_count(&self) -> usize {
        self.garbage.iter().map(|b| b.lock().len()).sum()
    }
}

impl Default for RcuDomain {
    fn default() -> Self {
        Self::new()
    }
}

/// A thread's registration with an [`RcuDomain`]. `!Send`: a reader's
/// nesting counter and its epoch record are only ever touched by the
/// thread that registered them.
pub struct ReadHandle<'a> {
    domain: &'a RcuDomain,
    record: *mut ReaderRecord,
    _not_send: PhantomData<*mut ()>,
}

impl<'a> ReadHandle<'a> {
    /// Enter a read section. Nesting is permitted and re-entrant: calling
    /// this `n` times requires `n` matching [`Self::read_unlock`] calls
    /// before the section is considered closed.
    #[inline]
    pub fn read_lock(&self) {
        let record = unsafe { &*self.record };
        if record.active.load(Ordering::Relaxed) == 0 {
            let global = self.domain.epoch.load(Ordering::Acquire);
            record.epoch.store(global, Ordering::Relaxed);
        }
        record.active.fetch_add(1, Ordering::Release);
        pr::fence_acquire();
    }

    /// Leave a read section previously entered with [`Self::read_lock`].
    #[inline]
    pub fn read_unlock(&self) {
        let record = unsafe { &*self.record };
        pr::fence_release();
        record.active.fetch_sub(1, Ordering::Release);
    }

    /// RAII bracket equivalent to a matched `read_lock`/`read_unlock` pair.
    #[inline]
    pub fn read_section(&self) -> ReadGuard<'a, '_> {
        self.read_lock();
        ReadGuard { handle: self }
    }

    /// Defer `free_fn(obj)` through the owning domain. See
    /// [`RcuDomain::defer_reclaim`].
    ///
    /// # Safety
    ///
    /// Same obligations as [`RcuDomain::defer_reclaim`].
    #[inline]
    pub unsafe fn defer_reclaim<T>(&self, obj: *mut T, free_fn: unsafe fn(*mut T)) {
        self.domain.defer_reclaim(obj, free_fn);
    }

    /// Block on the owning domain's [`RcuDomain::barrier`].
    #[inline]
    pub fn barrier(&self) {
        self.domain.barrier();
    }
}

impl Drop for ReadHandle<'_> {
    fn drop(&mut self) {
        let record = unsafe { &*self.record };
        // Mark inactive so a lingering scan during try_advance never blocks
        // on a reader that is going away; the record itself is intentionally
        // leaked-until-barrier since other threads may still be walking the
        // list concurrently with this drop. A production domain would unlink
        // it under `barrier`; out of scope here since handles normally live
        // for a thread's entire lifetime.
        record.active.store(0, Ordering::Release);
    }
}

/// RAII read-section guard returned by [`ReadHandle::read_section`].
pub struct ReadGuard<'a, 'h> {
    handle: &'h ReadHandle<'a>,
}

impl Drop for ReadGuard<'_, '_> {
    fn drop(&mut self) {
        self.handle.read_unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_bracket_read_section() {
        let domain = RcuDomain::new();
        let handle = domain.register();
        handle.read_lock();
        handle.read_unlock();
    }

    #[test]
    fn nested_read_sections_are_reentrant() {
        let domain = RcuDomain::new();
        let handle = domain.register();
        handle.read_lock();
        handle.read_lock();
        handle.read_unlock();
        handle.read_unlock();
    }

    #[test]
    fn guard_releases_on_drop() {
        let domain = RcuDomain::new();
        let handle = domain.register();
        {
            let _guard = handle.read_section();
        }
        // Another section should still be enterable.
        handle.read_lock();
        handle.read_unlock();
    }

    #[test]
    fn defer_reclaim_runs_after_barrier() {
        use core::sync::atomic::AtomicBool;
        static FREED: AtomicBool = AtomicBool::new(false);

        unsafe fn free_flag(p: *mut AtomicBool) {
            (*p).store(true, Ordering::SeqCst);
        }

        let domain = RcuDomain::new();
        let handle = domain.register();
        handle.read_lock();
        handle.read_unlock();

        unsafe {
            domain.defer_reclaim(&FREED as *const _ as *mut AtomicBool, free_flag);
        }
        assert!(!FREED.load(Ordering::SeqCst));
        domain.barrier();
        assert!(FREED.load(Ordering::SeqCst));
    }

    #[test]
    fn defer_reclaim_with_no_registered_readers_still_runs() {
        use core::sync::atomic::AtomicUsize as Counter;
        static COUNT: Counter = Counter::new(0);

        unsafe fn bump(p: *mut Counter) {
            (*p).fetch_add(1, Ordering::SeqCst);
        }

        let domain = RcuDomain::new();
        unsafe {
            domain.defer_reclaim(&COUNT as *const _ as *mut Counter, bump);
        }
        domain.barrier();
        assert_eq!(COUNT.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn barrier_drains_all_pending_work() {
        let domain = RcuDomain::new();
        let boxed: *mut u64 = Box::into_raw(Box::new(7u64));
        unsafe fn free_u64(p: *mut u64) {
            drop(Box::from_raw(p));
        }
        unsafe { domain.defer_reclaim(boxed, free_u64) };
        domain.barrier();
        assert_eq!(domain.pending_count(), 0);
    }
}
