//! Park and wake threads on a lock word.
//!
//! A pool is mapped by one process at a time, so every waiter on a word lives in this process and
//! the private futex operations suffice.
use core::sync::atomic::AtomicU32;

/// Sleep while `word` still holds `expected`. May return spuriously.
#[cfg(target_os = "linux")]
pub(crate) fn wait(word: &AtomicU32, expected: u32) {
    // Safety: `word` is a valid, aligned 32-bit location for the whole call. Errors such as
    // `EAGAIN` or `EINTR` are fine, callers re-check the word.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32,
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            core::ptr::null::<libc::timespec>(),
        );
    }
}

/// Wake at most one thread parked on `word`.
#[cfg(target_os = "linux")]
pub(crate) fn wake_one(word: &AtomicU32) {
    // Safety: see `wait`.
    unsafe {
        libc::syscall(libc::SYS_futex, word as *const AtomicU32, libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG, 1);
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn wait(_: &AtomicU32, _: u32) {
    std::thread::yield_now();
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn wake_one(_: &AtomicU32) {}
