//! The allocator callers actually use.
//!
//! [`ShmAllocator`] exposes the same five operations in every mode:
//! `allocate`, `allocate_zeroed`, `reallocate`, `free` and
//! `duplicate_string`. What happens underneath is picked once, when the
//! allocator is built, from an [`AllocMode`]:
//!
//! | tracking     | backing | what happens                                               |
//! |--------------|---------|------------------------------------------------------------|
//! | instrumented | shared  | descriptor in front of each block, registry in the pool, pool lock around every registry change and pool call |
//! | bare         | shared  | straight to the pool, which locks itself                   |
//! | instrumented | local   | C heap, side-table descriptors in a [`LocalHeap`]          |
//! | bare         | local   | straight to the C heap                                     |
//!
//! Local modes ignore the pool argument; it is still taken so callers don't
//! have to care which mode they were linked against.

use std::{ffi::CStr, fmt, ptr::NonNull};

use serde::{Deserialize, Serialize};

use super::{
    desc::{CallSite, ShmDesc, DESC_SIZE},
    local::{self, LocalHeap},
};
use crate::{error::ShmError, shm::pool::ShmPool, util::hint::cold};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tracking {
    /// Record size and call site of every live block.
    Instrumented,
    /// Pass straight through.
    Bare,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backing {
    /// Blocks live in the [`ShmPool`].
    Shared,
    /// Blocks live on this process's heap.
    Local,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocMode {
    pub tracking: Tracking,
    pub backing: Backing,
}

impl AllocMode {
    pub const INSTRUMENTED_SHARED: Self = Self::new(Tracking::Instrumented, Backing::Shared);
    pub const BARE_SHARED: Self = Self::new(Tracking::Bare, Backing::Shared);
    pub const INSTRUMENTED_LOCAL: Self = Self::new(Tracking::Instrumented, Backing::Local);
    pub const BARE_LOCAL: Self = Self::new(Tracking::Bare, Backing::Local);

    pub const ALL: [Self; 4] = [
        Self::INSTRUMENTED_SHARED,
        Self::BARE_SHARED,
        Self::INSTRUMENTED_LOCAL,
        Self::BARE_LOCAL,
    ];

    pub const fn new(tracking: Tracking, backing: Backing) -> Self {
        Self { tracking, backing }
    }

    pub fn is_instrumented(self) -> bool {
        self.tracking == Tracking::Instrumented
    }

    pub fn is_shared(self) -> bool {
        self.backing == Backing::Shared
    }
}

impl Default for AllocMode {
    fn default() -> Self {
        Self::INSTRUMENTED_SHARED
    }
}

impl fmt::Display for AllocMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tracking = match self.tracking {
            Tracking::Instrumented => "instrumented",
            Tracking::Bare => "bare",
        };
        let backing = match self.backing {
            Backing::Shared => "shared",
            Backing::Local => "local",
        };
        write!(f, "{tracking}-{backing}")
    }
}

impl std::str::FromStr for AllocMode {
    type Err = ShmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.to_string() == s)
            .ok_or_else(|| ShmError::Config(format!("unknown allocator mode '{s}'")))
    }
}

enum Strategy {
    InstrumentedShared,
    BareShared,
    InstrumentedLocal(LocalHeap),
    BareLocal,
}

/// Allocator front end. See the module docs for the modes.
pub struct ShmAllocator {
    strategy: Strategy,
    abort_on_unknown_chunk: bool,
}

impl ShmAllocator {
    pub fn new(mode: AllocMode) -> Self {
        let strategy = match (mode.tracking, mode.backing) {
            (Tracking::Instrumented, Backing::Shared) => Strategy::InstrumentedShared,
            (Tracking::Bare, Backing::Shared) => Strategy::BareShared,
            (Tracking::Instrumented, Backing::Local) => Strategy::InstrumentedLocal(LocalHeap::new()),
            (Tracking::Bare, Backing::Local) => Strategy::BareLocal,
        };
        Self {
            strategy,
            abort_on_unknown_chunk: true,
        }
    }

    /// Whether an unknown chunk aborts the process (the default) or is
    /// returned as [`ShmError::UnknownChunk`].
    pub fn abort_on_unknown_chunk(mut self, abort: bool) -> Self {
        self.abort_on_unknown_chunk = abort;
        self
    }

    pub fn mode(&self) -> AllocMode {
        match self.strategy {
            Strategy::InstrumentedShared => AllocMode::INSTRUMENTED_SHARED,
            Strategy::BareShared => AllocMode::BARE_SHARED,
            Strategy::InstrumentedLocal(_) => AllocMode::INSTRUMENTED_LOCAL,
            Strategy::BareLocal => AllocMode::BARE_LOCAL,
        }
    }

    /// The process-local tracking heap, in instrumented local mode.
    pub fn local_heap(&self) -> Option<&LocalHeap> {
        match &self.strategy {
            Strategy::InstrumentedLocal(heap) => Some(heap),
            _ => None,
        }
    }

    /// Allocate `size` bytes.
    pub fn allocate(&self, pool: &ShmPool, site: CallSite, size: usize) -> Result<NonNull<u8>, ShmError> {
        debug_assert!(size > 0);
        self.allocate_inner(pool, site, size, false)
    }

    /// Allocate `count * size` zero-filled bytes.
    pub fn allocate_zeroed(
        &self,
        pool: &ShmPool,
        site: CallSite,
        count: usize,
        size: usize,
    ) -> Result<NonNull<u8>, ShmError> {
        debug_assert!(count > 0);
        debug_assert!(size > 0);
        let bytes = count
            .checked_mul(size)
            .ok_or(ShmError::AllocationFailed { size: usize::MAX })?;
        self.allocate_inner(pool, site, bytes, true)
    }

    /// Resize `ptr` to `size` bytes, possibly moving it.
    ///
    /// A null `ptr` allocates, a zero `size` frees and returns `Ok(None)`.
    ///
    /// If the pool can't satisfy the new size the old block stays valid, and
    /// in instrumented modes it also stays tracked: its descriptor is put
    /// back into the registry before the error is returned.
    ///
    /// # Safety
    ///
    /// - in bare modes `ptr` must be a live block from this allocator (and,
    ///   when shared, from `pool`). Instrumented modes check it and report
    ///   anything else as [`ShmError::UnknownChunk`]
    pub unsafe fn reallocate(
        &self,
        pool: &ShmPool,
        site: CallSite,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Result<Option<NonNull<u8>>, ShmError> {
        let Some(ptr) = ptr else {
            return self.allocate(pool, site, size).map(Some);
        };
        if size == 0 {
            // SAFETY: requirement passed to caller
            unsafe { self.free(pool, site, ptr)? };
            return Ok(None);
        }

        match &self.strategy {
            Strategy::InstrumentedShared => self.shared_reallocate(pool, site, ptr, size).map(Some),
            // SAFETY: in bare modes the caller guarantees `ptr` is live and
            // ours; there is nothing we could check it against
            Strategy::BareShared => unsafe { pool.reallocate(ptr, size) }.map(Some),
            Strategy::InstrumentedLocal(heap) => match heap.reallocate(site, ptr, size)? {
                Some(data) => Ok(Some(data)),
                None => Err(self.unknown_chunk("reallocate", ptr, site)),
            },
            // SAFETY: as above
            Strategy::BareLocal => unsafe { local::realloc(ptr, size) }.map(Some),
        }
    }

    /// Release `ptr`.
    ///
    /// # Safety
    ///
    /// See [`ShmAllocator::reallocate()`].
    pub unsafe fn free(&self, pool: &ShmPool, site: CallSite, ptr: NonNull<u8>) -> Result<(), ShmError> {
        match &self.strategy {
            Strategy::InstrumentedShared => self.shared_free(pool, site, ptr),
            // SAFETY: see `reallocate()`
            Strategy::BareShared => unsafe { pool.deallocate(ptr) },
            Strategy::InstrumentedLocal(heap) => {
                if heap.free(ptr) {
                    Ok(())
                } else {
                    Err(self.unknown_chunk("free", ptr, site))
                }
            }
            Strategy::BareLocal => {
                // SAFETY: see `reallocate()`
                unsafe { local::free(ptr) };
                Ok(())
            }
        }
    }

    /// Copy `text`, terminator included, into a fresh block.
    pub fn duplicate_string(&self, pool: &ShmPool, site: CallSite, text: &CStr) -> Result<NonNull<u8>, ShmError> {
        let bytes = text.to_bytes_with_nul();
        // The copy doesn't need the pool lock, only the allocation does, and
        // `allocate_inner()` has released it by the time it returns.
        let data = self.allocate_inner(pool, site, bytes.len(), false)?;
        // SAFETY: `data` is a fresh block of `bytes.len()` bytes
        unsafe { data.as_ptr().copy_from_nonoverlapping(bytes.as_ptr(), bytes.len()) };
        Ok(data)
    }

    fn allocate_inner(
        &self,
        pool: &ShmPool,
        site: CallSite,
        size: usize,
        zeroed: bool,
    ) -> Result<NonNull<u8>, ShmError> {
        match &self.strategy {
            Strategy::InstrumentedShared => self.shared_allocate(pool, site, size, zeroed),
            Strategy::BareShared => pool.allocate(size, zeroed),
            Strategy::InstrumentedLocal(heap) => heap.allocate(site, size, zeroed),
            Strategy::BareLocal => local::malloc(size, zeroed),
        }
    }

    fn shared_allocate(
        &self,
        pool: &ShmPool,
        site: CallSite,
        size: usize,
        zeroed: bool,
    ) -> Result<NonNull<u8>, ShmError> {
        log::trace!("allocating {size:7} bytes in {site}");

        let total = ShmDesc::size_with_header(size).ok_or(ShmError::AllocationFailed { size })?;
        let mut guard = pool.lock()?;
        let base = guard.allocate(total, zeroed).map_err(|_| {
            cold(|| {
                log::error!("could not allocate {total} bytes from pool '{}'", pool.name());
                ShmError::AllocationFailed { size }
            })
        })?;

        // SAFETY: `base` is a fresh pool block of `total >= DESC_SIZE` bytes,
        // aligned for `ShmDesc`
        let desc = unsafe { ShmDesc::fill(base, size, &site) };
        // SAFETY: fresh, unlinked, and lives until `shared_free()`
        unsafe { guard.registry_mut().insert(desc) };

        // SAFETY: just written
        Ok(unsafe { desc.as_ref() }.payload())
    }

    fn shared_reallocate(
        &self,
        pool: &ShmPool,
        site: CallSite,
        ptr: NonNull<u8>,
        size: usize,
    ) -> Result<NonNull<u8>, ShmError> {
        let total = ShmDesc::size_with_header(size).ok_or(ShmError::AllocationFailed { size })?;
        let mut guard = pool.lock()?;

        let Some(desc) = guard.registry().find(ptr.as_ptr()) else {
            drop(guard);
            return Err(self.unknown_chunk("reallocate", ptr, site));
        };

        // The block may move, taking the descriptor with it.
        // SAFETY: `find()` just returned it from this registry
        unsafe { guard.registry_mut().remove(desc) };

        // SAFETY: registered descriptors sit at the base of live pool blocks
        let (old_base, old_bytes) = unsafe { (desc.as_ref().base(), desc.as_ref().bytes()) };
        // SAFETY: `old_base` is a live block of this pool
        let base = match unsafe { guard.reallocate(old_base, total) } {
            Ok(base) => base,
            Err(_) => {
                cold(|| {
                    log::error!(
                        "could not reallocate from {} to {total} bytes!",
                        old_bytes + DESC_SIZE
                    )
                });
                // The old block is untouched, so it goes back on the books.
                // SAFETY: unlinked above and still live
                unsafe { guard.registry_mut().insert(desc) };
                return Err(ShmError::AllocationFailed { size });
            }
        };

        // SAFETY: `base` is the (possibly moved) block, at least `total` bytes
        let desc = unsafe { ShmDesc::fill(base, size, &site) };
        // SAFETY: freshly written and unlinked
        unsafe { guard.registry_mut().insert(desc) };

        // SAFETY: just written
        Ok(unsafe { desc.as_ref() }.payload())
    }

    fn shared_free(&self, pool: &ShmPool, site: CallSite, ptr: NonNull<u8>) -> Result<(), ShmError> {
        let mut guard = pool.lock()?;

        let Some(desc) = guard.registry().find(ptr.as_ptr()) else {
            drop(guard);
            return Err(self.unknown_chunk("free", ptr, site));
        };

        // SAFETY: `find()` just returned it from this registry
        unsafe { guard.registry_mut().remove(desc) };
        // SAFETY: registered descriptors sit at the base of live pool blocks
        let base = unsafe { desc.as_ref() }.base();
        // SAFETY: `base` is live and now unreachable from the registry
        unsafe { guard.deallocate(base) };
        Ok(())
    }

    /// Report a pointer we never handed out. Must be called without the pool
    /// lock held, since it may not return.
    fn unknown_chunk(&self, op: &str, ptr: NonNull<u8>, site: CallSite) -> ShmError {
        log::error!(
            "cannot {op} unknown chunk at {ptr:p} ({}) from [{}:{} in {}()]!",
            site.what,
            site.file,
            site.line,
            site.func
        );
        if self.abort_on_unknown_chunk {
            std::process::abort();
        }
        ShmError::UnknownChunk {
            ptr: ptr.as_ptr() as usize,
            what: site.what,
            func: site.func,
            file: site.file,
            line: site.line,
        }
    }
}

impl fmt::Debug for ShmAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmAllocator")
            .field("mode", &self.mode())
            .field("abort_on_unknown_chunk", &self.abort_on_unknown_chunk)
            .finish()
    }
}

/// `allocate` with the caller's location filled in.
#[macro_export]
macro_rules! shmalloc {
    ($alloc:expr, $pool:expr, $size:expr) => {
        $alloc.allocate($pool, $crate::call_site!(), $size)
    };
}

/// `allocate_zeroed` with the caller's location filled in.
#[macro_export]
macro_rules! shcalloc {
    ($alloc:expr, $pool:expr, $count:expr, $size:expr) => {
        $alloc.allocate_zeroed($pool, $crate::call_site!(), $count, $size)
    };
}

/// `reallocate` with the caller's location and the pointer expression filled
/// in. Expands to an unsafe call.
#[macro_export]
macro_rules! shrealloc {
    ($alloc:expr, $pool:expr, $ptr:expr, $size:expr) => {
        $alloc.reallocate($pool, $crate::call_site!().with_what(stringify!($ptr)), $ptr, $size)
    };
}

/// `free` with the caller's location and the pointer expression filled in.
/// Expands to an unsafe call.
#[macro_export]
macro_rules! shfree {
    ($alloc:expr, $pool:expr, $ptr:expr) => {
        $alloc.free($pool, $crate::call_site!().with_what(stringify!($ptr)), $ptr)
    };
}

/// `duplicate_string` with the caller's location filled in.
#[macro_export]
macro_rules! shstrdup {
    ($alloc:expr, $pool:expr, $text:expr) => {
        $alloc.duplicate_string($pool, $crate::call_site!(), $text)
    };
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn pool() -> ShmPool {
        ShmPool::create("tracked", 1 << 20).unwrap()
    }

    fn allocator(mode: AllocMode) -> ShmAllocator {
        ShmAllocator::new(mode).abort_on_unknown_chunk(false)
    }

    fn site() -> CallSite {
        CallSite::new("tracked_test", "tracked.rs", 11)
    }

    fn live(pool: &ShmPool) -> usize {
        pool.lock().unwrap().registry().len()
    }

    #[test]
    fn mode_round_trips_through_its_name() {
        for mode in AllocMode::ALL {
            assert_eq!(mode.to_string().parse::<AllocMode>().unwrap(), mode);
        }
        assert!("shared".parse::<AllocMode>().is_err());
    }

    #[test]
    fn allocate_then_free_leaves_registry_unchanged() {
        let pool = pool();
        let alloc = allocator(AllocMode::INSTRUMENTED_SHARED);
        let keep = alloc.allocate(&pool, site(), 10).unwrap();
        let before: Vec<_> = pool.lock().unwrap().registry().iter().map(|d| d.payload()).collect();

        let tmp = alloc.allocate(&pool, site(), 100).unwrap();
        assert_eq!(live(&pool), 2);
        unsafe { alloc.free(&pool, site(), tmp).unwrap() };

        let after: Vec<_> = pool.lock().unwrap().registry().iter().map(|d| d.payload()).collect();
        assert_eq!(before, after);
        unsafe { alloc.free(&pool, site(), keep).unwrap() };
        assert_eq!(live(&pool), 0);
    }

    #[test]
    fn cardinality_follows_random_allocate_free_sequences() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        let pool = pool();
        let alloc = allocator(AllocMode::INSTRUMENTED_SHARED);
        let mut rng = StdRng::seed_from_u64(0x5348_4d50);
        let mut blocks = Vec::new();

        for _ in 0..2000 {
            if blocks.is_empty() || rng.gen_bool(0.55) {
                let size = rng.gen_range(1..512);
                let data = if rng.gen_bool(0.5) {
                    alloc.allocate(&pool, site(), size).unwrap()
                } else {
                    alloc.allocate_zeroed(&pool, site(), 1, size).unwrap()
                };
                blocks.push((data, size));
            } else {
                let (data, _) = blocks.swap_remove(rng.gen_range(0..blocks.len()));
                unsafe { alloc.free(&pool, site(), data).unwrap() };
            }
            assert_eq!(live(&pool), blocks.len());
        }

        let expected: usize = blocks.iter().map(|&(_, size)| size).sum();
        assert_eq!(pool.lock().unwrap().registry().total_bytes(), expected);
        for (data, _) in blocks {
            unsafe { alloc.free(&pool, site(), data).unwrap() };
        }
    }

    #[test]
    fn shared_modes_free_and_resize_page_sized_blocks() {
        let pool = pool();
        for mode in [AllocMode::INSTRUMENTED_SHARED, AllocMode::BARE_SHARED] {
            let alloc = allocator(mode);
            let a = alloc.allocate(&pool, site(), 4096).unwrap();
            let b = alloc.allocate_zeroed(&pool, site(), 4, 1024).unwrap();
            unsafe { alloc.free(&pool, site(), a).unwrap() };

            let b = unsafe { alloc.reallocate(&pool, site(), Some(b), 16 * 1024) }
                .unwrap()
                .unwrap();
            let b = unsafe { alloc.reallocate(&pool, site(), Some(b), 100) }
                .unwrap()
                .unwrap();
            if mode.is_instrumented() {
                assert_eq!(pool.lock().unwrap().registry().total_bytes(), 100);
            }
            unsafe { alloc.free(&pool, site(), b).unwrap() };
            assert_eq!(live(&pool), 0, "{mode}");
        }
    }

    #[test]
    fn descriptor_records_size_and_call_site() {
        let pool = pool();
        let alloc = allocator(AllocMode::INSTRUMENTED_SHARED);
        let data = alloc.allocate(&pool, site(), 77).unwrap();
        {
            let guard = pool.lock().unwrap();
            let desc = unsafe { guard.registry().find(data.as_ptr()).unwrap().as_ref() };
            assert_eq!(desc.bytes(), 77);
            assert_eq!(desc.func(), "tracked_test");
            assert_eq!(desc.file(), "tracked.rs");
            assert_eq!(desc.line(), 11);
            assert_eq!(desc.payload(), data);
        }
        unsafe { alloc.free(&pool, site(), data).unwrap() };
    }

    #[test]
    fn zeroed_allocation_is_zeroed() {
        let pool = pool();
        let alloc = allocator(AllocMode::INSTRUMENTED_SHARED);
        // dirty some memory first so a reused block would show it
        let dirty = alloc.allocate(&pool, site(), 256).unwrap();
        unsafe { dirty.as_ptr().write_bytes(0xff, 256) };
        unsafe { alloc.free(&pool, site(), dirty).unwrap() };

        let data = alloc.allocate_zeroed(&pool, site(), 16, 16).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(data.as_ptr(), 256) };
        assert!(bytes.iter().all(|&b| b == 0));
        let guard = pool.lock().unwrap();
        assert_eq!(guard.registry().total_bytes(), 256);
    }

    #[test]
    fn reallocate_null_allocates() {
        let pool = pool();
        let alloc = allocator(AllocMode::INSTRUMENTED_SHARED);
        let data = unsafe { alloc.reallocate(&pool, site(), None, 48) }.unwrap().unwrap();
        let guard = pool.lock().unwrap();
        let desc = guard.registry().find(data.as_ptr()).unwrap();
        assert_eq!(unsafe { desc.as_ref() }.bytes(), 48);
    }

    #[test]
    fn reallocate_to_zero_frees() {
        let pool = pool();
        let alloc = allocator(AllocMode::INSTRUMENTED_SHARED);
        let data = alloc.allocate(&pool, site(), 48).unwrap();
        assert_eq!(unsafe { alloc.reallocate(&pool, site(), Some(data), 0) }.unwrap(), None);
        assert_eq!(live(&pool), 0);
        assert!(matches!(
            unsafe { alloc.free(&pool, site(), data) },
            Err(ShmError::UnknownChunk { .. })
        ));
    }

    #[test]
    fn reallocate_moves_descriptor_with_block() {
        let pool = pool();
        let alloc = allocator(AllocMode::INSTRUMENTED_SHARED);
        let data = alloc.allocate(&pool, site(), 8).unwrap();
        // something after it so growing in place is unlikely
        let blocker = alloc.allocate(&pool, site(), 8).unwrap();
        unsafe { data.as_ptr().copy_from_nonoverlapping(b"payload!".as_ptr(), 8) };

        let moved = unsafe { alloc.reallocate(&pool, site(), Some(data), 64 * 1024) }.unwrap().unwrap();
        assert_eq!(unsafe { std::slice::from_raw_parts(moved.as_ptr(), 8) }, b"payload!");
        {
            let guard = pool.lock().unwrap();
            assert_eq!(guard.registry().len(), 2);
            let desc = guard.registry().find(moved.as_ptr()).unwrap();
            assert_eq!(unsafe { desc.as_ref() }.bytes(), 64 * 1024);
            if moved != data {
                assert!(guard.registry().find(data.as_ptr()).is_none());
            }
        }
        unsafe { alloc.free(&pool, site(), moved).unwrap() };
        unsafe { alloc.free(&pool, site(), blocker).unwrap() };
    }

    #[test]
    fn failed_reallocate_keeps_block_tracked() {
        let pool = pool();
        let alloc = allocator(AllocMode::INSTRUMENTED_SHARED);
        let data = alloc.allocate(&pool, site(), 32).unwrap();

        assert!(matches!(
            unsafe { alloc.reallocate(&pool, site(), Some(data), 8 << 20) },
            Err(ShmError::AllocationFailed { size }) if size == 8 << 20
        ));
        assert_eq!(live(&pool), 1);
        unsafe { alloc.free(&pool, site(), data).unwrap() };
    }

    #[test]
    fn exhausted_pool_fails_cleanly() {
        let pool = pool();
        let alloc = allocator(AllocMode::INSTRUMENTED_SHARED);
        assert!(matches!(
            alloc.allocate(&pool, site(), 8 << 20),
            Err(ShmError::AllocationFailed { size }) if size == 8 << 20
        ));
        assert_eq!(live(&pool), 0);
        // the lock was released on the way out
        drop(pool.lock().unwrap());
    }

    #[test]
    fn unknown_chunks_are_reported() {
        let pool = pool();
        let alloc = allocator(AllocMode::INSTRUMENTED_SHARED);
        let data = alloc.allocate(&pool, site(), 16).unwrap();
        let foreign = unsafe { NonNull::new_unchecked(data.as_ptr().add(4)) };

        let err = unsafe { alloc.free(&pool, site().with_what("foreign"), foreign) }.unwrap_err();
        assert!(matches!(err, ShmError::UnknownChunk { what: "foreign", line: 11, .. }));
        assert!(matches!(
            unsafe { alloc.reallocate(&pool, site(), Some(foreign), 32) },
            Err(ShmError::UnknownChunk { .. })
        ));

        unsafe { alloc.free(&pool, site(), data).unwrap() };
        // double free
        assert!(matches!(
            unsafe { alloc.free(&pool, site(), data) },
            Err(ShmError::UnknownChunk { .. })
        ));
        // and the lock is free again afterwards
        drop(pool.lock().unwrap());
    }

    #[test]
    fn duplicate_string_copies_terminator() {
        let pool = pool();
        for mode in AllocMode::ALL {
            let alloc = allocator(mode);
            let data = alloc.duplicate_string(&pool, site(), c"abc").unwrap();
            let bytes = unsafe { std::slice::from_raw_parts(data.as_ptr(), 4) };
            assert_eq!(bytes, b"abc\0", "{mode}");
            if mode == AllocMode::INSTRUMENTED_SHARED {
                let guard = pool.lock().unwrap();
                let desc = guard.registry().find(data.as_ptr()).unwrap();
                assert_eq!(unsafe { desc.as_ref() }.bytes(), 4);
            }
            if let Some(heap) = alloc.local_heap() {
                assert_eq!(heap.lookup(data.as_ptr()).map(|d| d.bytes), Some(4));
            }
            unsafe { alloc.free(&pool, site(), data).unwrap() };
        }
    }

    #[test]
    fn every_mode_honours_the_same_contract() {
        let pool = pool();
        for mode in AllocMode::ALL {
            let alloc = allocator(mode);
            assert_eq!(alloc.mode(), mode);

            let a = alloc.allocate(&pool, site(), 24).unwrap();
            let b = alloc.allocate_zeroed(&pool, site(), 3, 8).unwrap();
            assert!(unsafe { std::slice::from_raw_parts(b.as_ptr(), 24) }
                .iter()
                .all(|&byte| byte == 0));
            unsafe { a.as_ptr().write_bytes(7, 24) };

            let a = unsafe { alloc.reallocate(&pool, site(), Some(a), 4000) }.unwrap().unwrap();
            assert!(unsafe { std::slice::from_raw_parts(a.as_ptr(), 24) }
                .iter()
                .all(|&byte| byte == 7));
            assert_eq!(pool.contains(a.as_ptr()), mode.is_shared(), "{mode}");

            assert_eq!(unsafe { alloc.reallocate(&pool, site(), Some(b), 0) }.unwrap(), None);
            unsafe { alloc.free(&pool, site(), a).unwrap() };
        }
        assert_eq!(live(&pool), 0);
    }

    #[test]
    fn local_instrumented_detects_unknown_chunks() {
        let pool = pool();
        let alloc = allocator(AllocMode::INSTRUMENTED_LOCAL);
        let data = alloc.allocate(&pool, site(), 8).unwrap();
        assert_eq!(alloc.local_heap().unwrap().len(), 1);
        unsafe { alloc.free(&pool, site(), data).unwrap() };
        assert!(matches!(
            unsafe { alloc.free(&pool, site(), data) },
            Err(ShmError::UnknownChunk { .. })
        ));
        // local modes never touch the shared registry
        assert_eq!(live(&pool), 0);
    }

    #[test]
    fn shut_down_pool_is_lock_unavailable() {
        let pool = pool();
        let alloc = allocator(AllocMode::INSTRUMENTED_SHARED);
        let data = alloc.allocate(&pool, site(), 8).unwrap();
        pool.shutdown();
        assert!(matches!(alloc.allocate(&pool, site(), 8), Err(ShmError::LockUnavailable)));
        assert!(matches!(unsafe { alloc.free(&pool, site(), data) }, Err(ShmError::LockUnavailable)));
        assert!(matches!(
            unsafe { alloc.reallocate(&pool, site(), Some(data), 16) },
            Err(ShmError::LockUnavailable)
        ));
    }

    #[test]
    fn macros_capture_the_caller() {
        let pool = pool();
        let alloc = allocator(AllocMode::INSTRUMENTED_SHARED);
        let data = crate::shmalloc!(alloc, &pool, 12).unwrap();
        {
            let guard = pool.lock().unwrap();
            let desc = unsafe { guard.registry().find(data.as_ptr()).unwrap().as_ref() };
            assert!(desc.func().ends_with("macros_capture_the_caller"));
            assert!(desc.file().ends_with("tracked.rs"));
        }
        let data = unsafe { crate::shrealloc!(alloc, &pool, Some(data), 24) }.unwrap().unwrap();
        let text = crate::shstrdup!(alloc, &pool, c"hi").unwrap();
        let zeroed = crate::shcalloc!(alloc, &pool, 2, 2).unwrap();
        unsafe { crate::shfree!(alloc, &pool, data).unwrap() };
        unsafe { crate::shfree!(alloc, &pool, text).unwrap() };
        unsafe { crate::shfree!(alloc, &pool, zeroed).unwrap() };

        let err = unsafe { crate::shfree!(alloc, &pool, data) }.unwrap_err();
        assert!(matches!(err, ShmError::UnknownChunk { what: "data", .. }));
    }

    #[test]
    fn concurrent_allocations_never_share_a_payload() {
        let pool = pool();
        let alloc = allocator(AllocMode::INSTRUMENTED_SHARED);
        let seen = Mutex::new(Vec::new());

        crossbeam::scope(|s| {
            for t in 0..4 {
                let (pool, alloc, seen) = (&pool, &alloc, &seen);
                s.spawn(move |_| {
                    let mut mine = Vec::new();
                    for i in 0..200 {
                        mine.push(alloc.allocate(pool, site(), 16 + (i + t) % 64).unwrap());
                        if i % 3 == 0 {
                            let victim = mine.swap_remove(i % mine.len());
                            unsafe { alloc.free(pool, site(), victim).unwrap() };
                        }
                    }
                    seen.lock().unwrap().extend(mine.iter().map(|p| p.as_ptr() as usize));
                });
            }
        })
        .unwrap();

        let mut seen = seen.into_inner().unwrap();
        let total = seen.len();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), total);

        let guard = pool.lock().unwrap();
        assert_eq!(guard.registry().len(), total);
        for desc in guard.registry().iter() {
            assert!((16..80).contains(&desc.bytes()));
            assert_eq!(desc.func(), "tracked_test");
            assert!(seen.binary_search(&(desc.payload().as_ptr() as usize)).is_ok());
        }
    }
}
