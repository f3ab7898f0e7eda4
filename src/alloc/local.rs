//! Process-local backing for builds that don't share memory between
//! processes. Blocks come straight from the C heap; the instrumented flavour
//! keeps its descriptors in a side table instead of in front of the payload,
//! since nothing outside this process ever needs to see them.

use std::{ptr::NonNull, sync::Mutex};

use ahash::RandomState;
use hashbrown::HashMap;

use crate::{alloc::desc::CallSite, error::ShmError, util::hint::cold};

pub(crate) mod c {
    pub use libc::{calloc, free, malloc, realloc};
}

/// What the side table remembers about a live block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalDesc {
    pub bytes: usize,
    pub site: CallSite,
}

/// Plain heap allocation without any bookkeeping.
pub fn malloc(size: usize, zeroed: bool) -> Result<NonNull<u8>, ShmError> {
    // SAFETY: any size is a valid request; null is handled below
    let data = unsafe {
        if zeroed {
            c::calloc(1, size)
        } else {
            c::malloc(size)
        }
    };
    NonNull::new(data as *mut u8).ok_or_else(|| cold(|| ShmError::AllocationFailed { size }))
}

/// # Safety
///
/// - `ptr` must have come from [`malloc()`] or [`realloc()`] and not been
///   freed yet
pub unsafe fn realloc(ptr: NonNull<u8>, size: usize) -> Result<NonNull<u8>, ShmError> {
    // SAFETY: requirement passed to caller; on failure `ptr` stays valid
    let data = unsafe { c::realloc(ptr.as_ptr() as _, size) };
    NonNull::new(data as *mut u8).ok_or_else(|| cold(|| ShmError::AllocationFailed { size }))
}

/// # Safety
///
/// - `ptr` must have come from [`malloc()`] or [`realloc()`] and not been
///   freed yet
pub unsafe fn free(ptr: NonNull<u8>) {
    // SAFETY: requirement passed to caller
    unsafe { c::free(ptr.as_ptr() as _) }
}

/// The process-local tracking heap: every block it hands out is recorded in
/// a side table keyed by payload address.
#[derive(Debug, Default)]
pub struct LocalHeap {
    live: Mutex<HashMap<usize, LocalDesc, RandomState>>,
}

impl LocalHeap {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(&self) -> std::sync::MutexGuard<'_, HashMap<usize, LocalDesc, RandomState>> {
        // A panic while holding this can't leave the table half-updated: every
        // critical section is a single insert or remove.
        self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn allocate(&self, site: CallSite, size: usize, zeroed: bool) -> Result<NonNull<u8>, ShmError> {
        let mut live = self.live();
        let data = malloc(size, zeroed)?;
        live.insert(data.as_ptr() as usize, LocalDesc { bytes: size, site });
        Ok(data)
    }

    /// Resize a tracked block. `Ok(None)` means `ptr` isn't one of ours.
    /// On failure the old block keeps its entry.
    pub fn reallocate(
        &self,
        site: CallSite,
        ptr: NonNull<u8>,
        size: usize,
    ) -> Result<Option<NonNull<u8>>, ShmError> {
        let mut live = self.live();
        let Some(old) = live.remove(&(ptr.as_ptr() as usize)) else {
            return Ok(None);
        };
        // SAFETY: the side table only holds blocks we allocated and haven't
        // freed
        match unsafe { realloc(ptr, size) } {
            Ok(data) => {
                live.insert(data.as_ptr() as usize, LocalDesc { bytes: size, site });
                Ok(Some(data))
            }
            Err(e) => {
                live.insert(ptr.as_ptr() as usize, old);
                Err(e)
            }
        }
    }

    /// Free a tracked block. Returns `false` if `ptr` isn't one of ours, in
    /// which case nothing is freed.
    pub fn free(&self, ptr: NonNull<u8>) -> bool {
        let mut live = self.live();
        if live.remove(&(ptr.as_ptr() as usize)).is_none() {
            return false;
        }
        // SAFETY: it was in the side table, so it is ours and still live
        unsafe { free(ptr) };
        true
    }

    pub fn len(&self) -> usize {
        self.live().len()
    }

    pub fn is_empty(&self) -> bool {
        self.live().is_empty()
    }

    pub fn lookup(&self, ptr: *const u8) -> Option<LocalDesc> {
        self.live().get(&(ptr as usize)).copied()
    }
}

impl Drop for LocalHeap {
    fn drop(&mut self) {
        let live = self.live.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !live.is_empty() {
            log::debug!("{} process-local allocations still live", live.len());
        }
    }
}
