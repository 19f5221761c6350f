use crate::{AtomicTid, Tid};
use core::cell::UnsafeCell;
use core::ops::Deref;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Tid 0 is never handed out to a thread, so it marks the lock as free.
const UNOWNED: Tid = 0;

/// Owner recorded by [`ReentrantMutex::lock_exclusive`]. Never a thread id.
const EXCLUSIVE: Tid = Tid::MAX;

/// A spinning lock that the thread holding it may acquire again.
///
/// Ownership is tracked by thread id, which the caller supplies. Because the
/// same thread can hold several guards at once, guards only give shared
/// access to the data.
pub struct ReentrantMutex<T: ?Sized> {
    owner: AtomicTid,
    depth: AtomicUsize,
    data: UnsafeCell<T>,
}

pub struct ReentrantMutexGuard<'a, T: ?Sized + 'a> {
    mutex: &'a ReentrantMutex<T>,
}

unsafe impl<T: ?Sized + Send> Sync for ReentrantMutex<T> {}
unsafe impl<T: ?Sized + Send> Send for ReentrantMutex<T> {}

impl<T> ReentrantMutex<T> {
    pub const fn new(data: T) -> Self {
        Self {
            owner: AtomicTid::new(UNOWNED),
            depth: AtomicUsize::new(0),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> ReentrantMutex<T> {
    /// Acquires the lock on behalf of thread `tid`, spinning while another
    /// thread holds it.
    ///
    /// Panics if `tid` is 0 or `Tid::MAX`.
    #[must_use = "Mutex is released when guard falls out of scope."]
    pub fn lock(&self, tid: Tid) -> ReentrantMutexGuard<T> {
        assert_ne!(tid, UNOWNED, "tid 0 cannot own a lock");
        assert_ne!(tid, EXCLUSIVE, "tid {EXCLUSIVE} is reserved");

        // Only `tid` itself can have stored `tid`, so a stale read here can
        // never make another thread believe it already owns the lock.
        if self.owner.load(Ordering::Acquire) != tid {
            while self
                .owner
                .compare_exchange_weak(UNOWNED, tid, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                core::hint::spin_loop();
            }
        }
        self.depth.fetch_add(1, Ordering::Relaxed);

        ReentrantMutexGuard { mutex: self }
    }

    /// Acquires the lock for a caller with no thread identity.
    ///
    /// This never recurses: it waits until no one holds the lock, including
    /// other exclusive holders.
    #[must_use = "Mutex is released when guard falls out of scope."]
    pub fn lock_exclusive(&self) -> ReentrantMutexGuard<T> {
        while self
            .owner
            .compare_exchange_weak(UNOWNED, EXCLUSIVE, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        self.depth.fetch_add(1, Ordering::Relaxed);

        ReentrantMutexGuard { mutex: self }
    }

    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != UNOWNED
    }

    /// Returns the thread currently holding the lock, if any.
    pub fn owner(&self) -> Option<Tid> {
        match self.owner.load(Ordering::Relaxed) {
            UNOWNED | EXCLUSIVE => None,
            tid => Some(tid),
        }
    }
}

impl<'a, T: ?Sized> Deref for ReentrantMutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: Only the owning thread holds guards, and they are all shared.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T: ?Sized> Drop for ReentrantMutexGuard<'a, T> {
    fn drop(&mut self) {
        if self.mutex.depth.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.mutex.owner.store(UNOWNED, Ordering::Release);
        }
    }
}
