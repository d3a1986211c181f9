//! Spin-based locks used by the registries and the embedded heap.
//!
//! Critical sections in this crate are O(1), so both locks spin rather than
//! park. The heap lock is reentrant for the holding call chain: the embedded
//! runtime re-enters host code mid-collection and host code calls back in.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Minimal writer spinlock. Readers of the structures this protects are
/// lock-free; only mutation paths take it.
pub(crate) struct SpinLock<T> {
    flag: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            flag: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SpinGuard<'_, T> {
        while self
            .flag
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        SpinGuard { lock: self }
    }
}

pub(crate) struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.flag.store(false, Ordering::Release);
    }
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

fn current_thread_id() -> u64 {
    THREAD_ID.with(|id| *id)
}

/// Coarse reentrant lock serializing embedded-heap access to one logical
/// thread. The holding call chain re-enters freely; other threads spin until
/// the outermost holder exits.
pub struct ReentrantLock {
    owner: AtomicU64,
    // Only the owning thread reads or writes the depth.
    depth: UnsafeCell<u64>,
}

unsafe impl Send for ReentrantLock {}
unsafe impl Sync for ReentrantLock {}

impl ReentrantLock {
    pub const fn new() -> Self {
        Self {
            owner: AtomicU64::new(0),
            depth: UnsafeCell::new(0),
        }
    }

    pub fn lock(&self) -> ReentrantGuard<'_> {
        let tid = current_thread_id();
        if self.owner.load(Ordering::Acquire) != tid {
            while self
                .owner
                .compare_exchange_weak(0, tid, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                std::hint::spin_loop();
            }
        }
        unsafe { *self.depth.get() += 1 };
        ReentrantGuard { lock: self }
    }

    /// True if the current thread is inside the lock.
    pub fn held_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Acquire) == current_thread_id()
    }
}

impl Default for ReentrantLock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ReentrantGuard<'a> {
    lock: &'a ReentrantLock,
}

impl Drop for ReentrantGuard<'_> {
    fn drop(&mut self) {
        unsafe {
            let depth = self.lock.depth.get();
            *depth -= 1;
            if *depth == 0 {
                self.lock.owner.store(0, Ordering::Release);
            }
        }
    }
}
