//! A memory pool that every process forked after its creation can allocate
//! from.
//!
//! ```plaintext
//! +--------------------+ <- MmapRegion start
//! | PoolShared         |
//! |   magic, name      |
//! |   lock             |    futex word, cache padded
//! |   registry         |    live descriptors (instrumented builds only)
//! |   heap             |    dlmalloc state
//! +--------------------+ <- arena start, page aligned
//! | dlmalloc segment   |    handed to dlmalloc in one piece on its first
//! .                    .    request for system memory
//! +--------------------+ <- MmapRegion end
//! ```
//!
//! Everything the pool needs lives inside the mapping, so after a `fork()`
//! both sides see the same lock, heap and registry at the same addresses.

use std::{
    cell::UnsafeCell,
    mem,
    ptr::{self, NonNull},
    sync::atomic::{AtomicBool, Ordering},
};

use crossbeam::utils::CachePadded;
use dlmalloc::Dlmalloc;

use crate::{
    alloc::{
        desc::{c_field_to_string, copy_truncated, ShmDesc},
        registry::Registry,
    },
    error::ShmError,
    os::mem::{MmapRegion, PAGE_SIZE},
    shm::lock::{PoolLock, PoolLockGuard},
    util::{hint::cold, num::round_up},
};

const POOL_MAGIC: u32 = 0x5348_4d50;

pub const POOL_NAME_LENGTH: usize = 32;

/// Alignment of every block the heap hands out: dlmalloc's natural one, so
/// blocks can be resized and freed without knowing their size.
const HEAP_ALIGN: usize = 2 * mem::size_of::<usize>();

const _: () = assert!(HEAP_ALIGN >= mem::align_of::<ShmDesc>());

/// The system allocator dlmalloc sees: it owns the tail of the mapping and
/// gives all of it away on the first request. There is nothing more to give
/// after that, and nothing is ever returned.
struct SharedArena {
    base: *mut u8,
    size: usize,
    handed_out: AtomicBool,
}

// SAFETY: `base` points into a mapping that outlives the heap, and the heap
// is only ever touched under the pool lock.
unsafe impl Send for SharedArena {}

// SAFETY: the segment we return is valid, writable and page aligned, and we
// never report success for operations we don't perform.
unsafe impl dlmalloc::Allocator for SharedArena {
    fn alloc(&self, _size: usize) -> (*mut u8, usize, u32) {
        if self.handed_out.swap(true, Ordering::AcqRel) {
            return (ptr::null_mut(), 0, 0);
        }
        (self.base, self.size, 0)
    }

    fn remap(&self, _ptr: *mut u8, _oldsize: usize, _newsize: usize, _can_move: bool) -> *mut u8 {
        ptr::null_mut()
    }

    fn free_part(&self, _ptr: *mut u8, _oldsize: usize, _newsize: usize) -> bool {
        false
    }

    fn free(&self, _ptr: *mut u8, _size: usize) -> bool {
        false
    }

    fn can_release_part(&self, _flags: u32) -> bool {
        false
    }

    fn allocates_zeros(&self) -> bool {
        true
    }

    fn page_size(&self) -> usize {
        *PAGE_SIZE
    }
}

#[repr(C)]
struct PoolShared {
    magic: u32,
    name: [u8; POOL_NAME_LENGTH],
    lock: CachePadded<PoolLock>,
    registry: UnsafeCell<Registry>,
    heap: UnsafeCell<Dlmalloc<SharedArena>>,
}

/// Handle to a shared pool. Dropping it unmaps this process's view; other
/// processes keep theirs.
pub struct ShmPool {
    region: MmapRegion,
    shared: NonNull<PoolShared>,
}

// SAFETY: all mutable state behind `shared` is either atomic or only reached
// through a `PoolGuard`, which holds the pool lock.
unsafe impl Send for ShmPool {}
unsafe impl Sync for ShmPool {}

impl ShmPool {
    /// Smallest mapping we accept; dlmalloc wants a reasonable first segment.
    pub const MIN_SIZE: usize = 128 * 1024;

    /// Map a new pool of `size` bytes (header included).
    pub fn create(name: &str, size: usize) -> Result<Self, ShmError> {
        if size < Self::MIN_SIZE {
            return Err(ShmError::PoolTooSmall {
                size,
                min: Self::MIN_SIZE,
            });
        }

        let region = MmapRegion::map_shared(size)?;
        let arena_offset = round_up(mem::size_of::<PoolShared>(), *PAGE_SIZE);
        let arena = SharedArena {
            // SAFETY: `size >= MIN_SIZE` which is far larger than the header,
            // so the offset is still inside the mapping
            base: unsafe { region.as_ptr().add(arena_offset) },
            size: region.len() - arena_offset,
            handed_out: AtomicBool::new(false),
        };

        let mut pool_name = [0u8; POOL_NAME_LENGTH];
        copy_truncated(&mut pool_name, name);

        let shared = region.as_non_null().cast::<PoolShared>();
        // SAFETY: the mapping is page aligned, large enough for the header
        // and nobody else can see it yet
        unsafe {
            ptr::write(
                shared.as_ptr(),
                PoolShared {
                    magic: POOL_MAGIC,
                    name: pool_name,
                    lock: CachePadded::new(PoolLock::new()),
                    registry: UnsafeCell::new(Registry::new()),
                    heap: UnsafeCell::new(Dlmalloc::new_with_allocator(arena)),
                },
            );
        }
        let pool = Self { region, shared };

        // Make dlmalloc claim the arena as its top segment now, before a big
        // first request could claim it as a dedicated mmap chunk instead.
        let primer = pool.allocate(1, false)?;
        // SAFETY: just allocated from this pool
        unsafe { pool.deallocate(primer)? };

        log::info!(
            "created shared memory pool '{}' ({} bytes)",
            pool.name(),
            pool.region.len()
        );
        Ok(pool)
    }

    fn shared(&self) -> &PoolShared {
        // SAFETY: written in `create()` and valid as long as `region` is mapped
        unsafe { self.shared.as_ref() }
    }

    pub fn name(&self) -> String {
        c_field_to_string(&self.shared().name)
    }

    /// Size of the whole mapping.
    pub fn size(&self) -> usize {
        self.region.len()
    }

    /// Whether `ptr` points into this pool's mapping.
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.region.contains(ptr)
    }

    /// Take the pool lock. Blocks while another process or thread holds it.
    pub fn lock(&self) -> Result<PoolGuard<'_>, ShmError> {
        let shared = self.shared();
        if shared.magic != POOL_MAGIC {
            return cold(|| Err(ShmError::LockUnavailable));
        }
        let lock = shared.lock.acquire().inspect_err(|_| {
            log::error!("could not lock shared memory pool '{}'", self.name());
        })?;
        Ok(PoolGuard { pool: self, _lock: lock })
    }

    /// Destroy the pool lock. Operations already holding it finish, every
    /// later one fails with [`ShmError::LockUnavailable`].
    pub fn shutdown(&self) {
        log::info!("shutting down shared memory pool '{}'", self.name());
        self.shared().lock.destroy();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared().lock.is_destroyed()
    }

    /// Allocate `size` bytes, taking the pool lock for the duration.
    pub fn allocate(&self, size: usize, zeroed: bool) -> Result<NonNull<u8>, ShmError> {
        self.lock()?.allocate(size, zeroed)
    }

    /// Resize a block, taking the pool lock for the duration.
    ///
    /// # Safety
    ///
    /// See [`PoolGuard::reallocate()`].
    pub unsafe fn reallocate(&self, ptr: NonNull<u8>, size: usize) -> Result<NonNull<u8>, ShmError> {
        // SAFETY: requirement passed to caller
        unsafe { self.lock()?.reallocate(ptr, size) }
    }

    /// Return a block, taking the pool lock for the duration.
    ///
    /// # Safety
    ///
    /// See [`PoolGuard::deallocate()`].
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) -> Result<(), ShmError> {
        // SAFETY: requirement passed to caller
        unsafe { self.lock()?.deallocate(ptr) };
        Ok(())
    }
}

/// Proof that the pool lock is held. Gives access to the heap and to the
/// registry; the lock is released when this is dropped.
pub struct PoolGuard<'a> {
    pool: &'a ShmPool,
    _lock: PoolLockGuard<'a>,
}

impl PoolGuard<'_> {
    fn heap(&mut self) -> &mut Dlmalloc<SharedArena> {
        // SAFETY: we hold the pool lock and `&mut self` keeps this borrow
        // unique within the process
        unsafe { &mut *self.pool.shared().heap.get() }
    }

    pub fn pool(&self) -> &ShmPool {
        self.pool
    }

    pub fn registry(&self) -> &Registry {
        // SAFETY: we hold the pool lock, and mutation needs `&mut self`
        unsafe { &*self.pool.shared().registry.get() }
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        // SAFETY: as `heap()`
        unsafe { &mut *self.pool.shared().registry.get() }
    }

    /// Carve `size` bytes out of the pool, zero filled if `zeroed`.
    pub fn allocate(&mut self, size: usize, zeroed: bool) -> Result<NonNull<u8>, ShmError> {
        let heap = self.heap();
        // SAFETY: dlmalloc only needs exclusive access, which we have
        let data = unsafe {
            if zeroed {
                heap.calloc(size, HEAP_ALIGN)
            } else {
                heap.c_malloc(size)
            }
        };
        NonNull::new(data).ok_or_else(|| cold(|| ShmError::AllocationFailed { size }))
    }

    /// Resize the block at `ptr` to `size` bytes. The block may move; on
    /// failure the old block is left untouched.
    ///
    /// # Safety
    ///
    /// - `ptr` must have come from this pool and not been released yet
    pub unsafe fn reallocate(&mut self, ptr: NonNull<u8>, size: usize) -> Result<NonNull<u8>, ShmError> {
        let heap = self.heap();
        // SAFETY: requirement passed to caller; every block is naturally
        // aligned, so the size-free realloc keeps the alignment
        let data = unsafe { heap.c_realloc(ptr.as_ptr(), size) };
        NonNull::new(data).ok_or_else(|| cold(|| ShmError::AllocationFailed { size }))
    }

    /// Give a block back to the pool.
    ///
    /// # Safety
    ///
    /// - `ptr` must have come from this pool and not been released yet
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        let heap = self.heap();
        // SAFETY: requirement passed to caller
        unsafe { heap.c_free(ptr.as_ptr()) }
    }
}
