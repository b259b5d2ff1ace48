//! The header page at offset zero of every pool.
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::PoolError;

pub(crate) const PAGE_SZ: usize = 4096;
pub(crate) const LAYOUT_MAX: usize = 64;

/// Published last during creation. A file without it was never fully initialized.
const MAGIC: u64 = u64::from_le_bytes(*b"PMEMPOOL");
const VERSION: u32 = 2;
pub(crate) const FIRST_RUN: u64 = 2;

#[repr(C)]
pub(crate) struct HeadPage {
    magic: AtomicU64,
    version: AtomicU32,
    _reserved: AtomicU32,
    pub(crate) size: AtomicU64,
    /// Generation of the current mapping. Always even, odd values are reserved for locks that are
    /// being reset.
    pub(crate) run_id: AtomicU64,
    /// Offset of the first heap byte that was never handed out.
    pub(crate) heap_next: AtomicU64,
    pub(crate) root_offset: AtomicU64,
    pub(crate) root_size: AtomicU64,
    /// NUL padded, the last byte is always zero.
    layout: [AtomicU8; LAYOUT_MAX],
}

impl HeadPage {
    /// Convert a layout name into the padded on-disk form.
    pub(crate) fn layout_bytes(layout: &str) -> Result<[u8; LAYOUT_MAX], PoolError> {
        let raw = layout.as_bytes();
        if raw.len() >= LAYOUT_MAX || raw.contains(&0) {
            return Err(PoolError::LayoutTooLong { len: raw.len() });
        }

        let mut bytes = [0; LAYOUT_MAX];
        bytes[..raw.len()].copy_from_slice(raw);
        Ok(bytes)
    }

    pub(crate) fn configure(&self, size: u64, layout: &[u8; LAYOUT_MAX]) {
        self.magic.store(0, Ordering::Relaxed);
        self.version.store(VERSION, Ordering::Relaxed);
        self.size.store(size, Ordering::Relaxed);
        self.run_id.store(FIRST_RUN, Ordering::Relaxed);
        self.heap_next.store(PAGE_SZ as u64, Ordering::Relaxed);
        self.root_offset.store(0, Ordering::Relaxed);
        self.root_size.store(0, Ordering::Relaxed);

        for (t, &v) in self.layout.iter().zip(layout) {
            t.store(v, Ordering::Relaxed);
        }

        self.magic.store(MAGIC, Ordering::Release);
    }

    pub(crate) fn validate(&self, layout: &[u8; LAYOUT_MAX]) -> Result<(), PoolError> {
        if self.magic.load(Ordering::Acquire) != MAGIC {
            return Err(PoolError::BadMagic);
        }

        let version = self.version.load(Ordering::Relaxed);
        if version != VERSION {
            return Err(PoolError::VersionMismatch { found: version });
        }

        let found = self.layout();
        if found != *layout {
            return Err(PoolError::LayoutMismatch {
                expected: Self::layout_name(layout),
                found: Self::layout_name(&found),
            });
        }

        Ok(())
    }

    /// The next even generation after the stored one.
    pub(crate) fn following_run(&self) -> u64 {
        let run_id = (self.run_id.load(Ordering::Acquire) & !1).wrapping_add(2);
        // Zero marks a lock that never saw any run.
        if run_id == 0 {
            FIRST_RUN
        } else {
            run_id
        }
    }

    pub(crate) fn start_run(&self, run_id: u64) {
        self.run_id.store(run_id, Ordering::Release);
    }

    fn layout(&self) -> [u8; LAYOUT_MAX] {
        let mut bytes = [0; LAYOUT_MAX];
        for (b, t) in bytes.iter_mut().zip(&self.layout) {
            *b = t.load(Ordering::Relaxed);
        }
        bytes
    }

    fn layout_name(bytes: &[u8; LAYOUT_MAX]) -> String {
        let len = bytes.iter().position(|&b| b == 0).unwrap_or(LAYOUT_MAX);
        String::from_utf8_lossy(&bytes[..len]).into_owned()
    }
}

const _: () = assert!(core::mem::size_of::<HeadPage>() <= PAGE_SZ);
