//! The mutex scenarios, run against the root of a fresh pool.
use core::mem::{size_of, MaybeUninit};
use core::sync::atomic::{AtomicU32, Ordering};

use pmem_mutex::{LockError, PMutex};
use pmem_pool::{Persistent, Pool};

use crate::check::{ensure, ensure_eq, Failure};

/// The pool root: one lock and the counter it guards.
#[repr(C)]
pub struct Root {
    pub pmutex: PMutex,
    pub counter: AtomicU32,
}

// Safety: zeroed is an unlocked mutex and a zero counter.
unsafe impl Persistent for Root {}

pub struct Workload {
    pub threads: u32,
    pub ops: u32,
}

impl Root {
    /// Load and store separately, only correct while `pmutex` is held.
    fn add(&self, delta: u32) {
        let value = self.counter.load(Ordering::Relaxed);
        self.counter.store(value.wrapping_add(delta), Ordering::Relaxed);
    }
}

pub fn run(pool: &Pool, load: &Workload) -> Result<(), Failure> {
    mutex_zero(pool)?;

    let root = pool.root::<Root>()?;
    let baseline = root.counter.load(Ordering::Relaxed);

    tracing::info!(threads = load.threads, ops = load.ops, "guarded increments");
    with_workers(root, load.threads, |root| increment(root, load.ops));
    ensure_eq!(
        root.counter.load(Ordering::Relaxed),
        baseline.wrapping_add(load.threads * load.ops)
    );

    tracing::info!(threads = load.threads, ops = load.ops, "held decrements");
    with_workers(root, load.threads, |root| decrement(root, load.ops));
    ensure_eq!(root.counter.load(Ordering::Relaxed), baseline);

    tracing::info!(threads = load.threads, "try_lock retries");
    with_workers(root, load.threads, try_lock_once);
    ensure_eq!(
        root.counter.load(Ordering::Relaxed),
        baseline.wrapping_add(load.threads)
    );

    pool.persist(&root.counter)?;

    stack_construction()?;
    error_handling(root)?;
    Ok(())
}

fn with_workers(root: &Root, threads: u32, worker: impl Fn(&Root) + Sync) {
    std::thread::scope(|scope| {
        for _ in 0..threads {
            scope.spawn(|| worker(root));
        }
    });
}

fn increment(root: &Root, ops: u32) {
    for _ in 0..ops {
        let _lock = root.pmutex.lock();
        root.add(1);
    }
}

fn decrement(root: &Root, ops: u32) {
    let lock = root.pmutex.lock();
    for _ in 0..ops {
        root.add(u32::MAX);
    }
    lock.unlock();
}

fn try_lock_once(root: &Root) {
    loop {
        if let Some(lock) = root.pmutex.try_lock() {
            root.add(1);
            lock.unlock();
            return;
        }

        std::thread::yield_now();
    }
}

/// Placement construction zeroes garbage, and zeroed storage is usable without construction.
fn mutex_zero(pool: &Pool) -> Result<(), Failure> {
    tracing::info!("zeroed and placed mutexes");

    let raw = pool.alloc_with::<PMutex>(|slot| {
        // Safety: the slot is exclusively ours and any bytes are valid for `MaybeUninit`.
        unsafe { slot.as_mut_ptr().cast::<u8>().write_bytes(1, size_of::<PMutex>()) }
    })?;

    // Safety: the allocation was just made and nothing else refers to it.
    let slot = unsafe { pool.direct_mut(raw)? };
    let placed: &PMutex = PMutex::new_in(slot)?;
    {
        let _lock = placed.lock();
        ensure!(placed.is_locked(), "placed mutex did not lock");
    }

    let zeroed = pool.transaction(|tx| tx.alloc::<PMutex>())?;
    let mutex = pool.get(zeroed)?;
    {
        let _lock = mutex.lock();
        ensure!(mutex.try_lock().is_none(), "zeroed mutex locked twice");
    }

    pool.transaction(|tx| {
        tx.free(raw)?;
        tx.free(zeroed)
    })?;

    Ok(())
}

/// A mutex is refused outside of the pool, with a lock error.
fn stack_construction() -> Result<(), Failure> {
    let mut slot = MaybeUninit::<PMutex>::uninit();
    let result = PMutex::new_in(&mut slot);

    ensure!(
        matches!(result, Err(LockError::NotInPool { .. })),
        "stack construction returned {result:?}"
    );

    Ok(())
}

/// `try_lock` on a held lock reports false from any thread and leaves the owner alone.
fn error_handling(root: &Root) -> Result<(), Failure> {
    let lock = root.pmutex.lock();

    ensure!(root.pmutex.try_lock().is_none(), "try_lock on own held lock");

    let elsewhere = std::thread::scope(|scope| {
        scope
            .spawn(|| root.pmutex.try_lock_raw())
            .join()
            .unwrap_or(true)
    });
    ensure!(!elsewhere, "try_lock from another thread on held lock");
    ensure!(root.pmutex.is_locked(), "owner lost the lock");

    lock.unlock();
    ensure!(!root.pmutex.is_locked(), "lock still held after unlock");
    Ok(())
}
