//! Allocation descriptors: the record that sits directly in front of every
//! payload handed out by an instrumented shared allocator.
//!
//! ```plaintext
//! +--------------------+ <- base returned by the pool
//! | ShmDesc            |    size_of::<ShmDesc>() bytes, 16-byte aligned
//! |   prev / next      |
//! |   bytes, line      |
//! |   func[], file[]   |
//! +--------------------+ <- payload returned to the caller
//! | requested bytes    |    desc.bytes
//! .                    .
//! ```
//!
//! The descriptor and payload come out of a single pool request, so moving
//! the block on reallocation moves both.

use std::{
    fmt, mem,
    ptr::{self, NonNull},
};

use bytemuck::Zeroable;

/// Longest function name kept in a descriptor, terminator included.
pub const FUNC_NAME_LENGTH: usize = 64;

/// Longest file name kept in a descriptor, terminator included.
pub const FILE_NAME_LENGTH: usize = 64;

/// Where an allocation (or a free) was requested from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallSite {
    pub func: &'static str,
    pub file: &'static str,
    pub line: u32,
    /// What is being released or resized, usually the stringified pointer
    /// expression. Only shows up in diagnostics.
    pub what: &'static str,
}

impl CallSite {
    pub const fn new(func: &'static str, file: &'static str, line: u32) -> Self {
        Self {
            func,
            file,
            line,
            what: "",
        }
    }

    pub const fn with_what(self, what: &'static str) -> Self {
        Self { what, ..self }
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}: {})", self.func, self.file, self.line)
    }
}

/// Strip the trailing `::f` off the path of a function item declared inside
/// the caller, which leaves the caller's own path.
#[doc(hidden)]
pub fn enclosing_fn_name(item_path: &'static str) -> &'static str {
    let mut name = item_path.strip_suffix("::f").unwrap_or(item_path);
    // closures add `::{{closure}}` segments we don't care about
    while let Some(stripped) = name.strip_suffix("::{{closure}}") {
        name = stripped;
    }
    name
}

#[doc(hidden)]
pub fn type_name_of<T>(_: T) -> &'static str {
    std::any::type_name::<T>()
}

/// Build a [`CallSite`] for the current location.
#[macro_export]
macro_rules! call_site {
    () => {{
        fn f() {}
        $crate::alloc::desc::CallSite::new(
            $crate::alloc::desc::enclosing_fn_name($crate::alloc::desc::type_name_of(f)),
            file!(),
            line!(),
        )
    }};
}

/// Descriptor written at the base of every tracked block. Lives in pool
/// memory, so it must not own anything outside the pool.
#[repr(C, align(16))]
pub struct ShmDesc {
    pub(crate) prev: *mut ShmDesc,
    pub(crate) next: *mut ShmDesc,
    bytes: usize,
    line: u32,
    func: [u8; FUNC_NAME_LENGTH],
    file: [u8; FILE_NAME_LENGTH],
}

// SAFETY: every field is an integer, a byte array or a raw pointer, all of
// which are valid when zeroed.
unsafe impl Zeroable for ShmDesc {}

/// Bytes of bookkeeping in front of each tracked payload.
pub const DESC_SIZE: usize = mem::size_of::<ShmDesc>();

impl ShmDesc {
    /// Total pool request for a payload of `bytes`, or `None` on overflow.
    pub fn size_with_header(bytes: usize) -> Option<usize> {
        bytes.checked_add(DESC_SIZE)
    }

    /// Write a fresh, unlinked descriptor at `base`.
    ///
    /// # Safety
    ///
    /// - `base` must be valid for writes of `DESC_SIZE` bytes and aligned for
    ///   `ShmDesc`
    /// - nothing else may be looking at those bytes
    pub unsafe fn fill(base: NonNull<u8>, bytes: usize, site: &CallSite) -> NonNull<ShmDesc> {
        let mut desc = ShmDesc::zeroed();
        desc.bytes = bytes;
        desc.line = site.line;
        copy_truncated_path(&mut desc.func, site.func);
        copy_truncated(&mut desc.file, site.file);

        let desc_ptr = base.cast::<ShmDesc>();
        debug_assert!(desc_ptr.as_ptr().is_aligned());
        // SAFETY: requirements passed to caller
        unsafe { ptr::write(desc_ptr.as_ptr(), desc) };
        desc_ptr
    }

    /// The first byte the caller owns.
    pub fn payload(&self) -> NonNull<u8> {
        let base = self as *const ShmDesc as *mut u8;
        // SAFETY: the payload follows the descriptor inside the same block,
        // so this is at most one past the end of the allocation
        unsafe { NonNull::new_unchecked(base.add(DESC_SIZE)) }
    }

    /// The block the pool handed out, descriptor included.
    pub fn base(&self) -> NonNull<u8> {
        NonNull::from(self).cast()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn func(&self) -> String {
        c_field_to_string(&self.func)
    }

    pub fn file(&self) -> String {
        c_field_to_string(&self.file)
    }
}

impl fmt::Debug for ShmDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmDesc")
            .field("mem", &self.payload())
            .field("bytes", &self.bytes)
            .field("func", &self.func())
            .field("file", &self.file())
            .field("line", &self.line)
            .finish()
    }
}

/// Copy as much of `src` as fits into `dst`, always leaving a terminator and
/// never splitting a UTF-8 sequence.
pub(crate) fn copy_truncated(dst: &mut [u8], src: &str) {
    let mut len = src.len().min(dst.len() - 1);
    while !src.is_char_boundary(len) {
        len -= 1;
    }
    dst[..len].copy_from_slice(&src.as_bytes()[..len]);
    dst[len] = 0;
}

/// Like [`copy_truncated()`], but for `::` paths: drops leading segments
/// until the rest fits, so the innermost names survive.
pub(crate) fn copy_truncated_path(dst: &mut [u8], src: &str) {
    let cap = dst.len() - 1;
    let mut start = src.len().saturating_sub(cap);
    while !src.is_char_boundary(start) {
        start += 1;
    }
    if start > 0 {
        if let Some(sep) = src[start..].find("::") {
            if start + sep + 2 < src.len() {
                start += sep + 2;
            }
        }
    }
    copy_truncated(dst, &src[start..]);
}

pub(crate) fn c_field_to_string(field: &[u8]) -> String {
    let len = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..len]).into_owned()
}
