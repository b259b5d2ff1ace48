#![cfg(target_family = "unix")]
use core::sync::atomic::{AtomicU32, Ordering};

use memfile::CreateOptions;
use pmem_mutex::PMutex;
use pmem_pool::{Persistent, Pool, MIN_POOL};

const THREADS: u32 = 30;
const OPS: u32 = 200;

#[repr(C)]
struct Root {
    pmutex: PMutex,
    counter: AtomicU32,
}

unsafe impl Persistent for Root {}

fn with_root(method: impl FnOnce(&Root)) {
    let file = CreateOptions::new()
        .create(env!("CARGO_PKG_NAME"))
        .expect("to create a memory file");
    file.set_len(MIN_POOL).unwrap();

    let pool = Pool::create_in(file, "shared").unwrap();
    method(pool.root::<Root>().unwrap());
}

fn add(root: &Root, delta: u32) {
    let value = root.counter.load(Ordering::Relaxed);
    root.counter.store(value.wrapping_add(delta), Ordering::Relaxed);
}

#[test]
fn increment_then_decrement() {
    with_root(|root| {
        std::thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    for _ in 0..OPS {
                        let _lock = root.pmutex.lock();
                        add(root, 1);
                    }
                });
            }
        });
        assert_eq!(root.counter.load(Ordering::Relaxed), THREADS * OPS);

        std::thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    let lock = root.pmutex.lock();
                    for _ in 0..OPS {
                        add(root, u32::MAX);
                    }
                    lock.unlock();
                });
            }
        });
        assert_eq!(root.counter.load(Ordering::Relaxed), 0);
    });
}

#[test]
fn try_lock_until_acquired() {
    with_root(|root| {
        std::thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| loop {
                    if root.pmutex.try_lock_raw() {
                        add(root, 1);
                        // Safety: acquired just above on this thread.
                        unsafe { root.pmutex.unlock_raw() };
                        return;
                    }

                    std::thread::yield_now();
                });
            }
        });

        assert_eq!(root.counter.load(Ordering::Relaxed), THREADS);
        assert!(!root.pmutex.is_locked());
    });
}
