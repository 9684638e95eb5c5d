//! Fetch-and-store spinlock.
//!
//! The sole lock primitive this crate's update side needs: [`shadow`][crate::shadow]
//! and [`range`][crate::range] both want a short-held mutex guarding a small
//! piece of state, not fairness guarantees, so the simplest (and fastest
//! under low contention) variant is all that's kept.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::backoff::Backoff;

/// A simple fetch-and-store spinlock.
///
/// This is the simplest and fastest spinlock, but is unfair - threads
/// may be starved under contention.
#[repr(C)]
pub struct FasLock<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

impl<T> FasLock<T> {
    /// Create a new unlocked spinlock.
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Try to acquire the lock without spinning.
    #[inline]
    pub fn try_lock(&self) -> Option<FasLockGuard<'_, T>> {
        if self.locked.swap(true, Ordering::Acquire) {
            None
        } else {
            Some(FasLockGuard { lock: self })
        }
    }

    /// Acquire the lock, spinning if necessary.
    #[inline]
    pub fn lock(&self) -> FasLockGuard<'_, T> {
        let mut backoff = Backoff::new();
        while self.locked.swap(true, Ordering::Acquire) {
            while self.locked.load(Ordering::Relaxed) {
                backoff.spin();
            }
        }
        FasLockGuard { lock: self }
    }

    /// Check if the lock is currently held.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

unsafe impl<T: Send> Send for FasLock<T> {}
unsafe impl<T: Send> Sync for FasLock<T> {}

/// RAII guard for FasLock.
pub struct FasLockGuard<'a, T: ?Sized> {
    lock: &'a FasLock<T>,
}

impl<T: ?Sized> Deref for FasLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for FasLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for FasLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fas_lock_new() {
        let lock = FasLock::new(42);
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_fas_lock_lock_unlock() {
        let lock = FasLock::new(42);

        {
            let guard = lock.lock();
            assert!(lock.is_locked());
            assert_eq!(*guard, 42);
        }

        assert!(!lock.is_locked());
    }

    #[test]
    fn test_fas_lock_try_lock() {
        let lock = FasLock::new(42);

        let guard = lock.try_lock();
        assert!(guard.is_some());
        assert!(lock.is_locked());

        let guard2 = lock.try_lock();
        assert!(guard2.is_none());

        drop(guard);
        let guard3 = lock.try_lock();
        assert!(guard3.is_some());
    }

    #[test]
    fn test_fas_lock_modify() {
        let lock = FasLock::new(0);

        {
            let mut guard = lock.lock();
            *guard = 42;
        }

        let guard = lock.lock();
        assert_eq!(*guard, 42);
    }
}
