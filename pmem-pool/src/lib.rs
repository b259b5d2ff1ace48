//! A durable memory pool, mapped shared from a file.
//!
//! The pool is the storage that persistent objects such as `pmem_mutex::PMutex` live in. It
//! consists of a header page, a root object and a heap. Everything inside the mapping is accessed
//! through atomics, so any number of threads may hold references into the pool at the same time.
//!
//! ## Durability
//!
//! Writes become durable when they are flushed with [`Pool::persist`] or when the pool is closed.
//! Each structural change (allocation, header updates) is written in an order where the last
//! store publishes it, so a crash leaves either the old or the new state visible. Transactions
//! keep their undo log in process memory only: a crash in the middle of a transaction is not
//! rolled back on the next open.
//!
//! ## Zeroed memory
//!
//! Only [`Persistent`] types are placed into a pool. Fresh allocations are zeroed and the
//! all-zero byte pattern must be a valid value of each such type. No constructor ever has to run.

mod error;
mod head;
mod heap;
mod pool;
mod ptr;
pub mod registry;
mod tx;

pub use error::PoolError;
pub use pool::{Pool, MIN_POOL};
pub use ptr::{PPtr, Persistent};
pub use tx::Transaction;
