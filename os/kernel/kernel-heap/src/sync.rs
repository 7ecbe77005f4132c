//! # Heap Lock
//!
//! The single critical section wrapped around every heap entry point. A
//! test-and-test-and-set spin lock whose waiting step is a [`Relax`]
//! strategy, so a kernel with a scheduler can yield instead of burning
//! cycles while another CPU holds the heap.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// What a waiter does between two looks at a held lock.
pub trait Relax {
    fn relax();
}

/// Busy-wait with the CPU's spin-loop hint.
pub struct Spin;

impl Relax for Spin {
    #[inline]
    fn relax() {
        spin_loop();
    }
}

pub struct HeapLock<T, R: Relax = Spin> {
    /// `true` while a guard is alive.
    locked: AtomicBool,
    inner: UnsafeCell<T>,
    _relax: PhantomData<R>,
}

// Safety: mutual exclusion; only T: Send may cross threads.
unsafe impl<T: Send, R: Relax> Sync for HeapLock<T, R> {}
unsafe impl<T: Send, R: Relax> Send for HeapLock<T, R> {}

impl<T, R: Relax> HeapLock<T, R> {
    #[must_use]
    pub const fn new(inner: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            inner: UnsafeCell::new(inner),
            _relax: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub fn try_lock(&self) -> Option<HeapLockGuard<'_, T, R>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
            .then(|| HeapLockGuard { lock: self })
    }

    /// Wait until acquired (TATAS), then return a guard.
    #[inline]
    #[must_use]
    pub fn lock(&self) -> HeapLockGuard<'_, T, R> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                R::relax();
            }
        }
        HeapLockGuard { lock: self }
    }

    #[inline]
    pub fn with_lock<U>(&self, f: impl FnOnce(&mut T) -> U) -> U {
        let mut g = self.lock();
        f(&mut g)
    }

    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

pub struct HeapLockGuard<'a, T, R: Relax> {
    lock: &'a HeapLock<T, R>,
}

impl<T, R: Relax> Deref for HeapLockGuard<'_, T, R> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T, R: Relax> DerefMut for HeapLockGuard<'_, T, R> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T, R: Relax> Drop for HeapLockGuard<'_, T, R> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};
    use std::thread;

    static RELAXED: AtomicUsize = AtomicUsize::new(0);

    struct Counting;

    impl Relax for Counting {
        fn relax() {
            RELAXED.fetch_add(1, Ordering::Relaxed);
            thread::yield_now();
        }
    }

    #[test]
    fn try_lock_fails_while_held() {
        let l: HeapLock<u8> = HeapLock::new(1);
        let g = l.try_lock();
        assert!(g.is_some());
        assert!(l.try_lock().is_none());
        drop(g);
        assert!(l.try_lock().is_some());
    }

    #[test]
    fn waiters_use_the_relax_strategy() {
        let lock = Arc::new(HeapLock::<usize, Counting>::new(0));
        let held = lock.lock();
        let start = Arc::new(Barrier::new(2));

        let waiter = {
            let lock = Arc::clone(&lock);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                lock.with_lock(|v| *v += 1);
            })
        };

        start.wait();
        while RELAXED.load(Ordering::Relaxed) == 0 {
            thread::yield_now();
        }
        drop(held);
        waiter.join().unwrap();
        assert_eq!(lock.with_lock(|v| *v), 1);
    }

    #[test]
    fn released_on_panic() {
        let l: HeapLock<u32> = HeapLock::new(0);
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            l.with_lock(|v| {
                *v = 7;
                panic!("boom");
            });
        }));
        assert!(res.is_err());
        assert_eq!(l.with_lock(|v| *v), 7);
    }
}
