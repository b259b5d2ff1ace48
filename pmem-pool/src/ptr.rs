use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, AtomicUsize};

/// Types that can be stored inside a pool.
///
/// # Safety
///
/// Implementors promise that every byte pattern of `size_of::<T>()` bytes, all-zero in
/// particular, is a valid value. The type contains no pointers or references into volatile
/// memory, and every mutation through a shared reference goes through atomics. The pool hands
/// out `&T` to any number of threads for whatever bytes a file holds, without running any
/// constructor.
///
/// `AtomicBool` is not `Persistent`: only `0` and `1` are valid for it.
pub unsafe trait Persistent: Sync {}

unsafe impl Persistent for AtomicU8 {}
unsafe impl Persistent for AtomicU16 {}
unsafe impl Persistent for AtomicU32 {}
unsafe impl Persistent for AtomicU64 {}
unsafe impl Persistent for AtomicUsize {}
unsafe impl<T: Persistent, const N: usize> Persistent for [T; N] {}

/// A typed pointer relative to the start of a pool.
///
/// It stays valid across process restarts. Resolve it with [`crate::Pool::get`].
pub struct PPtr<T> {
    offset: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> PPtr<T> {
    /// The pointer that never refers to any allocation.
    pub const fn null() -> Self {
        Self::from_offset(0)
    }

    pub(crate) const fn from_offset(offset: u64) -> Self {
        PPtr {
            offset,
            _marker: PhantomData,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_null(&self) -> bool {
        self.offset == 0
    }
}

impl<T> Clone for PPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for PPtr<T> {}

impl<T> PartialEq for PPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.offset == other.offset
    }
}

impl<T> Eq for PPtr<T> {}

impl<T> Hash for PPtr<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.offset.hash(state)
    }
}

impl<T> fmt::Debug for PPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PPtr({:#x})", self.offset)
    }
}
