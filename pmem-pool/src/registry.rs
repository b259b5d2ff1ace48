//! Process-wide table of the address ranges of all mapped pools.
//!
//! Persistent primitives use this to tell durable addresses apart from stack or heap memory, and
//! to learn the run id of the pool they live in. Every lock operation asks, so each thread keeps
//! its last hit and only takes the table lock after a pool was mapped or unmapped.
use core::cell::Cell;
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

/// A mapped pool as seen from the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub start: usize,
    pub end: usize,
    pub run_id: u64,
}

struct Entry {
    region: Region,
    /// Device and inode of the backing file.
    identity: (u64, u64),
}

static REGIONS: RwLock<Vec<Entry>> = RwLock::new(Vec::new());
/// Bumped on every change of `REGIONS`, while its write lock is held.
static GENERATION: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static LAST_HIT: Cell<Option<(u64, Region)>> = const { Cell::new(None) };
}

impl Region {
    fn contains(&self, addr: usize, end: usize) -> bool {
        self.start <= addr && end <= self.end
    }
}

/// Find the pool mapping that contains all of `[addr, addr + len)`.
pub fn lookup(addr: usize, len: usize) -> Option<Region> {
    let end = addr.checked_add(len)?;
    let generation = GENERATION.load(Ordering::Acquire);

    if let Some((seen, region)) = LAST_HIT.with(Cell::get) {
        if seen == generation && region.contains(addr, end) {
            return Some(region);
        }
    }

    let regions = REGIONS.read().unwrap_or_else(PoisonError::into_inner);
    let found = regions
        .iter()
        .map(|entry| entry.region)
        .find(|region| region.contains(addr, end))?;

    // Tagged with the generation read before the table, a concurrent change only causes a miss.
    LAST_HIT.with(|last| last.set(Some((generation, found))));
    Some(found)
}

/// Whether the file with this device and inode is mapped by this process.
pub(crate) fn is_mapped(identity: (u64, u64)) -> bool {
    let regions = REGIONS.read().unwrap_or_else(PoisonError::into_inner);
    regions.iter().any(|entry| entry.identity == identity)
}

/// Returns `false` if the same file is already registered.
pub(crate) fn register(region: Region, identity: (u64, u64)) -> bool {
    let mut regions = REGIONS.write().unwrap_or_else(PoisonError::into_inner);

    if regions.iter().any(|entry| entry.identity == identity) {
        return false;
    }

    regions.push(Entry { region, identity });
    GENERATION.fetch_add(1, Ordering::Release);
    true
}

pub(crate) fn unregister(start: usize) {
    let mut regions = REGIONS.write().unwrap_or_else(PoisonError::into_inner);
    regions.retain(|entry| entry.region.start != start);
    GENERATION.fetch_add(1, Ordering::Release);
}
