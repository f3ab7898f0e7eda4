//! The live-allocation registry of one pool.
//!
//! An intrusive, unordered, doubly linked list threaded through the
//! [`ShmDesc`]s themselves, so it needs no storage of its own beyond the head
//! pointer and it lives inside the pool header where every attached process
//! can see it. The registry has no lock: the pool lock covers it, and the
//! only way to get a `&mut Registry` for a shared pool is through a
//! [`PoolGuard`](crate::shm::pool::PoolGuard).

use std::{marker::PhantomData, ptr::NonNull};

use super::desc::ShmDesc;

#[repr(C)]
#[derive(Debug)]
pub struct Registry {
    head: *mut ShmDesc,
    len: usize,
}

impl Registry {
    pub const fn new() -> Self {
        Self {
            head: std::ptr::null_mut(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Link `desc` in. Order is irrelevant, so it goes at the front.
    ///
    /// # Safety
    ///
    /// - `desc` must point at a live descriptor that is not linked into any
    ///   registry, and must stay live until it is removed again
    pub unsafe fn insert(&mut self, desc: NonNull<ShmDesc>) {
        // SAFETY: requirement passed to caller
        debug_assert!(self.find(unsafe { desc.as_ref() }.payload().as_ptr()).is_none());

        let desc = desc.as_ptr();
        // SAFETY: `desc` is live and unlinked, `self.head` is either null or
        // a live descriptor by the registry invariant
        unsafe {
            (*desc).prev = std::ptr::null_mut();
            (*desc).next = self.head;
            if let Some(head) = self.head.as_mut() {
                head.prev = desc;
            }
        }
        self.head = desc;
        self.len += 1;
    }

    /// Unlink `desc`.
    ///
    /// # Safety
    ///
    /// - `desc` must currently be linked into *this* registry
    pub unsafe fn remove(&mut self, desc: NonNull<ShmDesc>) {
        let desc = desc.as_ptr();
        // SAFETY: `desc` and its neighbours are live members of this registry
        unsafe {
            let prev = (*desc).prev;
            let next = (*desc).next;
            match prev.as_mut() {
                Some(prev) => prev.next = next,
                None => {
                    debug_assert_eq!(self.head, desc);
                    self.head = next;
                }
            }
            if let Some(next) = next.as_mut() {
                next.prev = prev;
            }
            (*desc).prev = std::ptr::null_mut();
            (*desc).next = std::ptr::null_mut();
        }
        self.len -= 1;
    }

    /// Find the descriptor whose payload starts exactly at `payload`. Only
    /// compares addresses, so it is fine to ask about pointers we never
    /// handed out.
    pub fn find(&self, payload: *const u8) -> Option<NonNull<ShmDesc>> {
        self.iter()
            .find(|desc| desc.payload().as_ptr() as *const u8 == payload)
            .map(NonNull::from)
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            next: self.head,
            _registry: PhantomData,
        }
    }

    /// Sum of the payload sizes of every live descriptor.
    pub fn total_bytes(&self) -> usize {
        self.iter().map(ShmDesc::bytes).sum()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Iter<'a> {
    next: *mut ShmDesc,
    _registry: PhantomData<&'a Registry>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a ShmDesc;

    fn next(&mut self) -> Option<Self::Item> {
        // SAFETY: every linked descriptor is live for as long as the registry
        // is borrowed, since unlinking needs `&mut Registry`
        let desc = unsafe { self.next.as_ref()? };
        self.next = desc.next;
        Some(desc)
    }
}
