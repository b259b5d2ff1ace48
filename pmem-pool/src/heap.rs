//! First-fit heap behind the header page.
//!
//! Every block is a 16 byte header followed by its payload. Blocks are never split or merged.
//!
//! A freed block is stamped with the run that freed it and is only reused by a later run. All
//! references handed out by a mapping borrow its `Pool`, and a later run needs that `Pool` to be
//! gone, so zeroing a reused block never races a reader.
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::PoisonError;

use crate::head::{FIRST_RUN, PAGE_SZ};
use crate::{Pool, PoolError};

pub(crate) const BLOCK_ALIGN: usize = 16;
const HEADER_SZ: u64 = core::mem::size_of::<BlockHeader>() as u64;

/// Odd, so it never collides with the even run id stored in a freed block.
const ALLOCATED: u64 = 1;

#[repr(C)]
struct BlockHeader {
    /// Payload size, a multiple of `BLOCK_ALIGN`.
    size: AtomicU64,
    /// `ALLOCATED`, or the run id of the run that freed the block.
    state: AtomicU64,
}

impl Pool {
    /// Hand out a zeroed block and return the offset of its payload.
    pub(crate) fn alloc_block(&self, size: usize, align: usize) -> Result<u64, PoolError> {
        if align > BLOCK_ALIGN {
            return Err(PoolError::Alignment { align });
        }

        let need = size
            .max(1)
            .checked_next_multiple_of(BLOCK_ALIGN)
            .ok_or(PoolError::OutOfSpace { requested: size })? as u64;

        let _heap = self.heap.lock().unwrap_or_else(PoisonError::into_inner);
        let head = self.head();
        let next = head.heap_next.load(Ordering::Acquire);

        let (header, grow_to) = match self.find_free(need, next) {
            Some(header) => (header, None),
            None => {
                let end = next
                    .checked_add(HEADER_SZ + need)
                    .filter(|&end| end <= self.size() as u64)
                    .ok_or(PoolError::OutOfSpace { requested: size })?;
                (next, Some(end))
            }
        };

        let block = self.block(header);
        let payload = header + HEADER_SZ;
        let len = match grow_to {
            Some(_) => need,
            None => block.size.load(Ordering::Relaxed),
        };

        // Safety: the payload is in bounds and unreachable, it is either past `heap_next` or was
        // freed by an earlier run whose references are all gone.
        unsafe { self.at(payload).write_bytes(0, len as usize) };
        block.size.store(len, Ordering::Relaxed);
        block.state.store(ALLOCATED, Ordering::Release);
        self.flush_range(header, (HEADER_SZ + len) as usize)?;

        // Publishing the new end makes the block part of the heap.
        if let Some(end) = grow_to {
            head.heap_next.store(end, Ordering::Release);
            self.flush_range(0, PAGE_SZ)?;
        }

        tracing::trace!(offset = payload, size = len, "allocated block");
        Ok(payload)
    }

    pub(crate) fn free_block(&self, payload: u64) -> Result<(), PoolError> {
        let _heap = self.heap.lock().unwrap_or_else(PoisonError::into_inner);
        self.check_freeable(payload)?;
        self.set_state(payload, self.run_id())?;

        tracing::trace!(offset = payload, "freed block");
        Ok(())
    }

    /// Whether `free_block` would accept `payload` right now.
    pub(crate) fn check_freeable(&self, payload: u64) -> Result<(), PoolError> {
        if payload == self.head().root_offset.load(Ordering::Acquire) {
            return Err(PoolError::InvalidPointer { offset: payload });
        }

        self.check_live(payload, 0, 1)
    }

    /// Take back a block freed during this run, as if the free never happened. Blocks that are
    /// still allocated are left alone.
    pub(crate) fn revive_block(&self, payload: u64) -> Result<(), PoolError> {
        let _heap = self.heap.lock().unwrap_or_else(PoisonError::into_inner);
        let header = payload
            .checked_sub(HEADER_SZ)
            .ok_or(PoolError::InvalidPointer { offset: payload })?;

        match self.block(header).state.load(Ordering::Acquire) {
            ALLOCATED => Ok(()),
            state if state == self.run_id() => self.set_state(payload, ALLOCATED),
            _ => Err(PoolError::InvalidPointer { offset: payload }),
        }
    }

    fn set_state(&self, payload: u64, state: u64) -> Result<(), PoolError> {
        let header = payload - HEADER_SZ;
        self.block(header).state.store(state, Ordering::Release);
        self.flush_range(header, HEADER_SZ as usize)
    }

    /// Check that `payload` is the start of an allocated block of at least `size` bytes.
    pub(crate) fn check_live(&self, payload: u64, size: usize, align: usize) -> Result<(), PoolError> {
        let invalid = PoolError::InvalidPointer { offset: payload };

        if align > BLOCK_ALIGN
            || payload % BLOCK_ALIGN as u64 != 0
            || payload < PAGE_SZ as u64 + HEADER_SZ
            || payload >= self.head().heap_next.load(Ordering::Acquire)
        {
            return Err(invalid);
        }

        let block = self.block(payload - HEADER_SZ);
        let len = block.size.load(Ordering::Relaxed);

        if block.state.load(Ordering::Acquire) != ALLOCATED
            || len < size as u64
            || payload.checked_add(len).map_or(true, |end| end > self.size() as u64)
        {
            return Err(invalid);
        }

        Ok(())
    }

    fn find_free(&self, need: u64, next: u64) -> Option<u64> {
        let mut header = PAGE_SZ as u64;

        while header < next {
            let block = self.block(header);
            let len = block.size.load(Ordering::Relaxed);

            if len == 0 {
                break;
            }

            if self.reusable(block.state.load(Ordering::Acquire)) && len >= need {
                return Some(header);
            }

            header += HEADER_SZ + len;
        }

        None
    }

    /// Freed by a run that has ended.
    fn reusable(&self, state: u64) -> bool {
        state >= FIRST_RUN && state % 2 == 0 && state != self.run_id()
    }

    fn block(&self, header: u64) -> &BlockHeader {
        // Safety: headers are 16-aligned, in bounds and made of atomics.
        unsafe { &*(self.at(header) as *const BlockHeader) }
    }
}
