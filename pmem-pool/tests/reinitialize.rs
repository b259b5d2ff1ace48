#![cfg(target_family = "unix")]
use core::sync::atomic::{AtomicU64, Ordering};

use memfile::CreateOptions;
use pmem_pool::{Pool, PoolError, MIN_POOL};

#[test]
fn anonymous_pool_survives_remap() {
    let file = CreateOptions::new()
        .create(env!("CARGO_PKG_NAME"))
        .expect("to create a memory file");
    file.set_len(MIN_POOL).unwrap();
    let restore_from = file.try_clone().unwrap();

    let pool = Pool::create_in(file, "reinitialize").unwrap();
    let run = pool.run_id();
    let counter = pool.root::<[AtomicU64; 4]>().unwrap();
    counter[3].store(0xdead_beef, Ordering::Relaxed);
    pool.persist(counter).unwrap();
    drop(pool);

    let pool = Pool::open_in(restore_from, "reinitialize").unwrap();
    assert_eq!(pool.run_id(), run + 2);

    let counter = pool.root::<[AtomicU64; 4]>().unwrap();
    assert_eq!(counter[3].load(Ordering::Relaxed), 0xdead_beef);
}

#[test]
fn undersized_file_is_refused() {
    let file = CreateOptions::new()
        .create(env!("CARGO_PKG_NAME"))
        .expect("to create a memory file");
    file.set_len(MIN_POOL / 2).unwrap();

    let pool = Pool::create_in(file, "reinitialize");
    assert!(matches!(pool, Err(PoolError::TooSmall { .. })));
}

#[test]
#[cfg(target_os = "linux")]
fn shared_description_keeps_the_lock() {
    use std::os::unix::io::AsRawFd;

    let file = CreateOptions::new()
        .create(env!("CARGO_PKG_NAME"))
        .expect("to create a memory file");
    file.set_len(MIN_POOL).unwrap();
    let shared = file.try_clone().unwrap();

    let pool = Pool::create_in(file, "reinitialize").unwrap();
    let again = Pool::open_in(shared.try_clone().unwrap(), "reinitialize");
    assert!(matches!(again, Err(PoolError::Busy)));

    // A fresh description of the same memory file, as another process would hold.
    let other = std::fs::File::open(format!("/proc/self/fd/{}", shared.as_raw_fd())).unwrap();
    let locked = unsafe { libc::flock(other.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    assert_eq!(locked, -1);

    drop(pool);
    assert_eq!(unsafe { libc::flock(other.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) }, 0);
}
