use core::mem::{align_of, size_of, MaybeUninit};
use core::sync::atomic::Ordering;
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use memmap2::MmapRaw;

use crate::head::{HeadPage, FIRST_RUN, PAGE_SZ};
use crate::registry::{self, Region};
use crate::{PPtr, Persistent, PoolError};

/// The smallest pool that can be created or opened.
pub const MIN_POOL: u64 = 8 << 20;

/// A mapped pool.
///
/// Dropping the pool flushes and unmaps it. All references handed out borrow the pool, so no
/// reference into the mapping outlives it.
///
/// A pool file is mapped by at most one `Pool` at a time, across all processes. The mapping holds
/// an exclusive `flock` on the file until it is dropped.
pub struct Pool {
    map: MmapRaw,
    /// Dropped after `map`, the file is unmapped before another mapping can start a run.
    lock: FileLock,
    run_id: u64,
    /// Serializes heap changes of this process.
    pub(crate) heap: Mutex<()>,
    root: Mutex<()>,
}

impl Pool {
    /// Create a new pool file of `size` bytes at `path`.
    ///
    /// Fails if the file already exists. A file this call created is removed again when the pool
    /// could not be set up in it.
    pub fn create(path: impl AsRef<Path>, layout: &str, size: u64) -> Result<Self, PoolError> {
        let path = path.as_ref();
        HeadPage::layout_bytes(layout)?;

        if size < MIN_POOL {
            return Err(PoolError::TooSmall {
                size,
                min: MIN_POOL,
            });
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)?;

        tracing::debug!(path = %path.display(), size, layout, "creating pool");
        let pool = file
            .set_len(size)
            .map_err(PoolError::from)
            .and_then(|()| Self::create_in(file, layout));

        if pool.is_err() {
            if let Err(err) = std::fs::remove_file(path) {
                tracing::warn!(%err, path = %path.display(), "failed to remove partial pool");
            }
        }

        pool
    }

    /// Open the existing pool at `path`, checking that it was created with `layout`.
    pub fn open(path: impl AsRef<Path>, layout: &str) -> Result<Self, PoolError> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        tracing::debug!(path = %path.display(), layout, "opening pool");
        Self::open_in(file, layout)
    }

    /// Initialize a fresh pool in an already sized file.
    ///
    /// Any previous content of the file is discarded.
    pub fn create_in<T: AsRawFd>(fd: T, layout: &str) -> Result<Self, PoolError> {
        let layout = HeadPage::layout_bytes(layout)?;
        let identity = identity(fd.as_raw_fd())?;
        let lock = FileLock::acquire(fd.as_raw_fd(), identity)?;
        let map = Self::map(&fd)?;
        let pool = Self::register(map, lock, identity, FIRST_RUN)?;

        pool.head().configure(pool.size() as u64, &layout);
        pool.map.flush_range(0, PAGE_SZ)?;

        Ok(pool)
    }

    /// Map an existing pool from a file descriptor.
    ///
    /// Opening starts a new run: locks that were held when the pool was last mapped are released
    /// on their next use.
    pub fn open_in<T: AsRawFd>(fd: T, layout: &str) -> Result<Self, PoolError> {
        let layout = HeadPage::layout_bytes(layout)?;
        let identity = identity(fd.as_raw_fd())?;
        let lock = FileLock::acquire(fd.as_raw_fd(), identity)?;
        let map = Self::map(&fd)?;

        // Safety: `map` checked the mapping is larger than the header page.
        let head = unsafe { &*(map.as_ptr() as *const HeadPage) };
        head.validate(&layout)?;
        let run_id = head.following_run();

        let pool = Self::register(map, lock, identity, run_id)?;
        pool.head().start_run(run_id);
        pool.map.flush_range(0, PAGE_SZ)?;

        tracing::debug!(run_id, size = pool.size(), "mapped pool");
        Ok(pool)
    }

    /// Flush everything and unmap the pool.
    pub fn close(self) -> Result<(), PoolError> {
        self.map.flush()?;
        tracing::debug!(run_id = self.run_id, "closed pool");
        Ok(())
    }

    /// The generation of this mapping. Incremented by two on every open.
    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    /// Size of the mapping in bytes.
    pub fn size(&self) -> usize {
        self.map.len()
    }

    /// The root object, allocated zeroed on first access.
    pub fn root<T: Persistent>(&self) -> Result<&T, PoolError> {
        let ptr = self.root_ptr::<T>()?;
        self.get(ptr)
    }

    pub fn root_ptr<T: Persistent>(&self) -> Result<PPtr<T>, PoolError> {
        let _root = self.root.lock().unwrap_or_else(PoisonError::into_inner);
        let head = self.head();
        let size = size_of::<T>();

        let offset = head.root_offset.load(Ordering::Acquire);
        if offset != 0 {
            let found = head.root_size.load(Ordering::Relaxed);
            if found < size as u64 {
                return Err(PoolError::RootSizeMismatch {
                    requested: size,
                    found,
                });
            }

            return Ok(PPtr::from_offset(offset));
        }

        let offset = self.alloc_block(size, align_of::<T>())?;
        head.root_size.store(size as u64, Ordering::Relaxed);
        head.root_offset.store(offset, Ordering::Release);
        self.map.flush_range(0, PAGE_SZ)?;

        tracing::debug!(offset, size, "allocated root object");
        Ok(PPtr::from_offset(offset))
    }

    /// Resolve a pointer into this pool.
    pub fn get<T: Persistent>(&self, ptr: PPtr<T>) -> Result<&T, PoolError> {
        self.check_live(ptr.offset(), size_of::<T>(), align_of::<T>())?;
        // Safety: the block is in bounds, suitably aligned and allocated. Any bytes are a valid
        // `T` as it is `Persistent`.
        Ok(unsafe { &*(self.at(ptr.offset()) as *const T) })
    }

    /// Allocate an object outside of a transaction.
    ///
    /// The initializer has exclusive access to the zeroed slot before the pointer is returned.
    pub fn alloc_with<T: Persistent>(
        &self,
        init: impl FnOnce(&mut MaybeUninit<T>),
    ) -> Result<PPtr<T>, PoolError> {
        let size = size_of::<T>();
        let offset = self.alloc_block(size, align_of::<T>())?;

        // Safety: the block was just handed out, nobody else holds a pointer to it.
        let slot = unsafe { &mut *(self.at(offset) as *mut MaybeUninit<T>) };
        init(slot);
        self.map.flush_range(offset as usize, size)?;

        Ok(PPtr::from_offset(offset))
    }

    /// Exclusive, uninitialized access to an allocation, for placement construction.
    ///
    /// # Safety
    ///
    /// No other reference to the object may exist for the lifetime of the returned one.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn direct_mut<T: Persistent>(
        &self,
        ptr: PPtr<T>,
    ) -> Result<&mut MaybeUninit<T>, PoolError> {
        self.check_live(ptr.offset(), size_of::<T>(), align_of::<T>())?;
        Ok(&mut *(self.at(ptr.offset()) as *mut MaybeUninit<T>))
    }

    /// Flush the bytes of `value` to the backing file.
    pub fn persist<T: ?Sized>(&self, value: &T) -> Result<(), PoolError> {
        let addr = value as *const T as *const u8 as usize;
        let len = core::mem::size_of_val(value);
        let offset = addr.wrapping_sub(self.base() as usize);

        if offset >= self.size() || self.size() - offset < len {
            return Err(PoolError::InvalidPointer {
                offset: offset as u64,
            });
        }

        self.map.flush_range(offset, len)?;
        Ok(())
    }

    /// Flush the whole mapping.
    pub fn persist_all(&self) -> Result<(), PoolError> {
        self.map.flush()?;
        Ok(())
    }

    pub(crate) fn base(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    pub(crate) fn at(&self, offset: u64) -> *mut u8 {
        debug_assert!((offset as usize) < self.size());
        // Safety: callers only pass offsets inside the mapping.
        unsafe { self.base().add(offset as usize) }
    }

    pub(crate) fn head(&self) -> &HeadPage {
        // Safety: every mapping is at least `MIN_POOL` bytes and the header is all atomics.
        unsafe { &*(self.base() as *const HeadPage) }
    }

    pub(crate) fn flush_range(&self, offset: u64, len: usize) -> Result<(), PoolError> {
        self.map.flush_range(offset as usize, len)?;
        Ok(())
    }

    fn map<T: AsRawFd>(fd: &T) -> Result<MmapRaw, PoolError> {
        let map = MmapRaw::map_raw(fd)?;
        let size = map.len() as u64;

        if size < MIN_POOL {
            return Err(PoolError::TooSmall {
                size,
                min: MIN_POOL,
            });
        }

        Ok(map)
    }

    fn register(
        map: MmapRaw,
        lock: FileLock,
        identity: (u64, u64),
        run_id: u64,
    ) -> Result<Self, PoolError> {
        let start = map.as_ptr() as usize;
        let region = Region {
            start,
            end: start + map.len(),
            run_id,
        };

        if !registry::register(region, identity) {
            return Err(PoolError::Busy);
        }

        Ok(Pool {
            map,
            lock,
            run_id,
            heap: Mutex::new(()),
            root: Mutex::new(()),
        })
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if let Err(err) = self.map.flush() {
            tracing::warn!(%err, "failed to flush pool");
        }

        registry::unregister(self.base() as usize);
    }
}

/// An exclusive `flock` on a pool file, held on a descriptor of our own.
///
/// Other descriptors may share our open file description, so closing ours alone would not
/// release the lock. Dropping unlocks explicitly.
struct FileLock(OwnedFd);

impl FileLock {
    /// Refused with `Busy` while another process, or another description of the file in this
    /// one, holds the lock. Also refused while this process maps the file already: a description
    /// shared with that mapping would get the lock granted, and dropping us would release it.
    fn acquire(fd: RawFd, identity: (u64, u64)) -> Result<Self, PoolError> {
        if registry::is_mapped(identity) {
            return Err(PoolError::Busy);
        }

        // Safety: duplicating a descriptor does not touch memory, failure is reported as `-1`.
        let raw = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
        if raw < 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        // Safety: `raw` is a fresh descriptor nobody else owns.
        let own = unsafe { OwnedFd::from_raw_fd(raw) };

        // Safety: `own` is an open descriptor.
        if -1 == unsafe { libc::flock(own.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } {
            let err = std::io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EWOULDBLOCK) => PoolError::Busy,
                _ => err.into(),
            });
        }

        Ok(FileLock(own))
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Safety: the descriptor is open until our field is dropped.
        unsafe { libc::flock(self.0.as_raw_fd(), libc::LOCK_UN) };
    }
}

/// Device and inode of the file behind `fd`.
fn identity(fd: RawFd) -> Result<(u64, u64), PoolError> {
    let mut stat = MaybeUninit::<libc::stat>::zeroed();
    // Safety: passing a pointer to a correctly sized `stat` buffer.
    if -1 == unsafe { libc::fstat(fd, stat.as_mut_ptr()) } {
        return Err(std::io::Error::last_os_error().into());
    }

    // Safety: initialized on success.
    let stat = unsafe { stat.assume_init() };
    Ok((stat.st_dev as u64, stat.st_ino as u64))
}
