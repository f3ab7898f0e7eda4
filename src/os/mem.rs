use std::{io, ptr::NonNull};

use libc::{mmap, munmap, MAP_ANONYMOUS, MAP_FAILED, MAP_SHARED, PROT_READ, PROT_WRITE};
use once_cell::sync::Lazy;

use crate::{
    error::ShmError,
    util::{hint::cold, num::round_up},
};

pub static PAGE_SIZE: Lazy<usize> = Lazy::new(page_size::get);

/// A read/write mapping that stays visible to every process `fork()`ed after
/// it was created. The mapping lands at the same address in each of them, so
/// plain pointers into it mean the same thing everywhere.
#[derive(Debug)]
pub struct MmapRegion {
    ptr: NonNull<u8>,
    size: usize,
}

// SAFETY: the region is just bytes; synchronising access to them is up to
// whoever hands out pointers into it.
unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}

impl MmapRegion {
    /// `mmap()` a shared, page-aligned arena of at least `size` bytes. The
    /// kernel hands back zeroed pages.
    pub fn map_shared(size: usize) -> Result<MmapRegion, ShmError> {
        if size == 0 {
            return Err(ShmError::Map(io::Error::new(
                io::ErrorKind::InvalidInput,
                "attempted to mmap() 0 bytes",
            )));
        }
        let size = round_up(size, *PAGE_SIZE);
        // SAFETY: anonymous mapping, so there is no fd to validate and the
        // kernel picks the address.
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                PROT_READ | PROT_WRITE,
                MAP_SHARED | MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == MAP_FAILED {
            return cold(|| Err(ShmError::Map(io::Error::last_os_error())));
        }
        let ptr = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| ShmError::Map(io::Error::other("mmap() returned null")))?;
        Ok(MmapRegion { ptr, size })
    }

    pub const fn as_non_null(&self) -> NonNull<u8> {
        self.ptr
    }

    pub const fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub const fn len(&self) -> usize {
        self.size
    }

    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Whether `ptr` lies inside this mapping.
    pub fn contains(&self, ptr: *const u8) -> bool {
        let start = self.ptr.as_ptr() as usize;
        (start..start + self.size).contains(&(ptr as usize))
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY:
        // - `ptr` came from `mmap()` and is page aligned
        // - `size` is exactly what we mapped
        unsafe {
            munmap(self.ptr.as_ptr() as _, self.size);
        }
    }
}
