use core::mem::size_of;
use std::panic::{self, AssertUnwindSafe};

use crate::{PPtr, Persistent, Pool, PoolError};

/// A unit of work over the pool that either commits fully or is rolled back.
///
/// Created by [`Pool::transaction`]. The undo information is kept in process memory.
pub struct Transaction<'pool> {
    pool: &'pool Pool,
    allocated: Vec<u64>,
    /// Frees only happen on commit.
    deferred_free: Vec<u64>,
    /// Frees already applied by a commit, revived if the commit fails.
    freed: Vec<u64>,
    undo: Vec<Undo>,
}

struct Undo {
    offset: u64,
    bytes: Vec<u8>,
}

impl Pool {
    /// Run `work` as a transaction.
    ///
    /// If `work` returns an error or panics, all snapshots are restored and all allocations made
    /// within it are released before the error is returned or the panic resumes. A commit that
    /// fails is rolled back the same way, so an error always means nothing took effect.
    pub fn transaction<R, E>(
        &self,
        work: impl FnOnce(&mut Transaction<'_>) -> Result<R, E>,
    ) -> Result<R, E>
    where
        E: From<PoolError>,
    {
        let mut tx = Transaction {
            pool: self,
            allocated: Vec::new(),
            deferred_free: Vec::new(),
            freed: Vec::new(),
            undo: Vec::new(),
        };

        match panic::catch_unwind(AssertUnwindSafe(|| work(&mut tx))) {
            Ok(Ok(value)) => match tx.commit() {
                Ok(()) => Ok(value),
                Err(err) => {
                    tx.abort();
                    Err(err.into())
                }
            },
            Ok(Err(err)) => {
                tx.abort();
                Err(err)
            }
            Err(payload) => {
                tx.abort();
                panic::resume_unwind(payload)
            }
        }
    }
}

impl<'pool> Transaction<'pool> {
    pub fn pool(&self) -> &'pool Pool {
        self.pool
    }

    /// Allocate a zeroed object. Released again if the transaction aborts.
    pub fn alloc<T: Persistent>(&mut self) -> Result<PPtr<T>, PoolError> {
        let offset = self
            .pool
            .alloc_block(size_of::<T>(), core::mem::align_of::<T>())?;
        self.allocated.push(offset);
        Ok(PPtr::from_offset(offset))
    }

    /// Free an object when the transaction commits.
    ///
    /// Every reason the free could be refused is checked here: the root object, pointers that are
    /// not allocated and freeing twice.
    pub fn free<T: Persistent>(&mut self, ptr: PPtr<T>) -> Result<(), PoolError> {
        self.pool.get(ptr)?;
        self.pool.check_freeable(ptr.offset())?;

        if self.deferred_free.contains(&ptr.offset()) {
            return Err(PoolError::InvalidPointer {
                offset: ptr.offset(),
            });
        }

        self.deferred_free.push(ptr.offset());
        Ok(())
    }

    /// Record the current bytes of an object so that an abort restores them.
    ///
    /// Other threads must not modify the object while the transaction runs.
    pub fn snapshot<T: Persistent>(&mut self, ptr: PPtr<T>) -> Result<&'pool T, PoolError> {
        let object = self.pool.get(ptr)?;
        // Safety: the object is in bounds and initialized, any bytes of a `Persistent` are.
        let bytes = unsafe {
            core::slice::from_raw_parts(object as *const T as *const u8, size_of::<T>())
        };

        self.undo.push(Undo {
            offset: ptr.offset(),
            bytes: bytes.to_vec(),
        });

        Ok(object)
    }

    fn commit(&mut self) -> Result<(), PoolError> {
        for &offset in &self.deferred_free {
            self.pool.check_freeable(offset)?;
        }

        for &offset in &self.deferred_free {
            self.freed.push(offset);
            self.pool.free_block(offset)?;
        }

        for undo in &self.undo {
            self.pool.flush_range(undo.offset, undo.bytes.len())?;
        }

        Ok(())
    }

    fn abort(self) {
        tracing::warn!(
            allocated = self.allocated.len(),
            freed = self.freed.len(),
            snapshots = self.undo.len(),
            "rolling back transaction"
        );

        for offset in self.freed.iter().rev() {
            if let Err(err) = self.pool.revive_block(*offset) {
                tracing::warn!(%err, offset, "failed to revive freed block");
            }
        }

        for undo in self.undo.iter().rev() {
            // Safety: the range was checked when the snapshot was taken and the object is not
            // accessed concurrently.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    undo.bytes.as_ptr(),
                    self.pool.at(undo.offset),
                    undo.bytes.len(),
                )
            };

            if let Err(err) = self.pool.flush_range(undo.offset, undo.bytes.len()) {
                tracing::warn!(%err, offset = undo.offset, "failed to flush restored range");
            }
        }

        for offset in self.allocated.iter().rev() {
            if let Err(err) = self.pool.free_block(*offset) {
                tracing::warn!(%err, offset, "failed to release allocation");
            }
        }
    }
}
