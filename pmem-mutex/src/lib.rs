//! A mutex stored inside a persistent memory pool.
//!
//! [`PMutex`] is a plain lock word living in durable memory. The all-zero byte pattern is a valid
//! unlocked mutex, so a record that was allocated zeroed and never constructed, or that was
//! recovered after a crash, can be locked right away.
//!
//! The mutex only guards accesses within the processes that currently map the pool. It is not
//! part of the pool's transactions and is never rolled back. When a pool is opened again, any
//! lock that was still held by the previous mapping is released on its next use.
//!
//! Constructing a mutex outside of a pool is refused with [`LockError`]; the lock semantics only
//! make sense for storage that outlives the process.

mod futex;
mod mutex;

pub use mutex::{LockError, PMutex, PMutexGuard};
