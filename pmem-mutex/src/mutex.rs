use core::fmt;
use core::marker::PhantomData;
use core::mem::{size_of, MaybeUninit};
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use pmem_pool::{registry, Persistent};

use crate::futex;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
/// Locked, and some thread may be parked waiting for it.
const CONTENDED: u32 = 2;

/// A mutual exclusion lock stored in a pool.
///
/// The lock does not own the data it protects; callers pair it with the fields of the same
/// durable record. Every byte being zero is the unlocked state.
#[repr(C)]
pub struct PMutex {
    /// The pool run this lock word belongs to. A lock from an older run is reset before use.
    run_id: AtomicU64,
    state: AtomicU32,
    _reserved: AtomicU32,
}

// Safety: all fields are integer atomics, so any bytes are a value. Zero is the unlocked state of
// a lock from no particular run; any other stale content is reset by `recover`.
unsafe impl Persistent for PMutex {}

/// Returned when a [`PMutex`] is constructed outside of durable storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum LockError {
    /// The slot at `addr` is not inside any mapped pool.
    NotInPool { addr: usize },
}

/// Ownership of a locked [`PMutex`]. Unlocks on drop.
#[must_use = "if unused the mutex will immediately unlock"]
pub struct PMutexGuard<'lt> {
    mutex: &'lt PMutex,
    /// Must be released by the thread that acquired it.
    _not_send: PhantomData<*const ()>,
}

impl PMutex {
    /// Construct an unlocked mutex in place.
    ///
    /// Whatever the slot contained before is overwritten. The slot must lie within a mapped pool,
    /// otherwise `LockError::NotInPool` is returned and the slot is left untouched.
    pub fn new_in(slot: &mut MaybeUninit<PMutex>) -> Result<&mut PMutex, LockError> {
        let addr = slot.as_ptr() as usize;
        let Some(region) = registry::lookup(addr, size_of::<PMutex>()) else {
            return Err(LockError::NotInPool { addr });
        };

        Ok(slot.write(PMutex {
            run_id: AtomicU64::new(region.run_id),
            state: AtomicU32::new(UNLOCKED),
            _reserved: AtomicU32::new(0),
        }))
    }

    /// The zeroed representation, as found in fresh pool allocations.
    #[cfg(test)]
    pub(crate) const fn zeroed() -> Self {
        PMutex {
            run_id: AtomicU64::new(0),
            state: AtomicU32::new(UNLOCKED),
            _reserved: AtomicU32::new(0),
        }
    }

    /// Block until the lock is acquired.
    ///
    /// Locking again from the thread that holds the lock deadlocks.
    pub fn lock(&self) -> PMutexGuard<'_> {
        self.lock_raw();
        PMutexGuard::new(self)
    }

    /// Acquire the lock if it is free, without blocking.
    ///
    /// Returns `None` whenever the lock is held, including by the calling thread.
    pub fn try_lock(&self) -> Option<PMutexGuard<'_>> {
        if self.try_lock_raw() {
            Some(PMutexGuard::new(self))
        } else {
            None
        }
    }

    /// Acquire the lock without a guard. Release it with [`PMutex::unlock_raw`].
    pub fn lock_raw(&self) {
        let state = self.state();

        if state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            Self::lock_contended(state);
        }
    }

    /// Try to acquire the lock without a guard, checking it exactly once.
    pub fn try_lock_raw(&self) -> bool {
        self.state()
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Release the lock.
    ///
    /// # Safety
    ///
    /// The calling thread must hold the lock, acquired through `lock_raw` or `try_lock_raw`.
    pub unsafe fn unlock_raw(&self) {
        if self.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            futex::wake_one(&self.state);
        }
    }

    /// Whether some thread holds the lock right now. Only a snapshot.
    pub fn is_locked(&self) -> bool {
        self.state().load(Ordering::Relaxed) != UNLOCKED
    }

    #[cold]
    fn lock_contended(state: &AtomicU32) {
        // Once we had to wait, we leave the word contended so our unlock wakes the next waiter.
        while state.swap(CONTENDED, Ordering::Acquire) != UNLOCKED {
            futex::wait(state, CONTENDED);
        }
    }

    /// The lock word, reset first if it was left behind by an earlier run of its pool.
    fn state(&self) -> &AtomicU32 {
        let addr = self as *const PMutex as usize;
        if let Some(region) = registry::lookup(addr, size_of::<PMutex>()) {
            self.recover(region.run_id);
        }

        &self.state
    }

    fn recover(&self, run_id: u64) {
        // Odd marker of a reset in progress during this run.
        let resetting = run_id.wrapping_sub(1);

        loop {
            let seen = self.run_id.load(Ordering::Acquire);

            if seen == run_id {
                return;
            }

            if seen == resetting {
                std::thread::yield_now();
                continue;
            }

            if self
                .run_id
                .compare_exchange(seen, resetting, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                self.state.store(UNLOCKED, Ordering::Relaxed);
                self._reserved.store(0, Ordering::Relaxed);
                self.run_id.store(run_id, Ordering::Release);
                return;
            }
        }
    }
}

impl<'lt> PMutexGuard<'lt> {
    fn new(mutex: &'lt PMutex) -> Self {
        PMutexGuard {
            mutex,
            _not_send: PhantomData,
        }
    }

    /// Release the lock now.
    pub fn unlock(self) {
        drop(self)
    }
}

impl Drop for PMutexGuard<'_> {
    fn drop(&mut self) {
        // Safety: the guard exists only while its thread holds the lock.
        unsafe { self.mutex.unlock_raw() }
    }
}

impl fmt::Debug for PMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PMutex")
            .field("run_id", &self.run_id.load(Ordering::Relaxed))
            .field("locked", &(self.state.load(Ordering::Relaxed) != UNLOCKED))
            .finish()
    }
}

impl fmt::Debug for PMutexGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PMutexGuard").field("mutex", self.mutex).finish()
    }
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::NotInPool { addr } => {
                write!(f, "persistent mutex at {addr:#x} is not inside a mapped pool")
            }
        }
    }
}

impl std::error::Error for LockError {}
