//! The pool lock: a futex word that lives inside the shared mapping, so every
//! process attached to the pool contends on the same 32 bits.
//!
//! The word has four states. `UNLOCKED` and `LOCKED` are what you'd expect,
//! `CONTENDED` means somebody may be sleeping on the futex and the releasing
//! side has to `wake()`, and `DESTROYED` is terminal: once the lock is
//! destroyed every acquisition fails and sleepers are woken so they can fail
//! too.

use std::sync::atomic::Ordering;

use linux_futex::{Futex, Shared};

use crate::error::ShmError;

const LOCK_UNLOCKED: u32 = 0;
const LOCK_LOCKED: u32 = 1;
const LOCK_CONTENDED: u32 = 2;
const LOCK_DESTROYED: u32 = u32::MAX;

/// Cross-process, non-reentrant mutex. Acquiring it twice from the same call
/// stack deadlocks.
#[repr(C)]
pub struct PoolLock {
    futex: Futex<Shared>,
}

impl PoolLock {
    pub const fn new() -> Self {
        Self {
            futex: Futex::new(LOCK_UNLOCKED),
        }
    }

    /// Block until the lock is ours, or fail if it has been destroyed.
    pub fn acquire(&self) -> Result<PoolLockGuard<'_>, ShmError> {
        let mut state = match self.futex.value.compare_exchange(
            LOCK_UNLOCKED,
            LOCK_LOCKED,
            Ordering::Acquire,
            Ordering::Relaxed,
        ) {
            Ok(_) => return Ok(PoolLockGuard { lock: self }),
            Err(state) => state,
        };

        loop {
            match state {
                LOCK_DESTROYED => return Err(ShmError::LockUnavailable),
                LOCK_UNLOCKED => {
                    // We can't know whether others are still asleep, so take
                    // the lock as contended and let release() wake them.
                    match self.futex.value.compare_exchange(
                        LOCK_UNLOCKED,
                        LOCK_CONTENDED,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => return Ok(PoolLockGuard { lock: self }),
                        Err(actual) => {
                            state = actual;
                            continue;
                        }
                    }
                }
                LOCK_LOCKED => {
                    if let Err(actual) = self.futex.value.compare_exchange(
                        LOCK_LOCKED,
                        LOCK_CONTENDED,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    ) {
                        state = actual;
                        continue;
                    }
                }
                _ => {}
            }
            // Spurious wake-ups and value mismatches both just mean "look
            // again".
            _ = self.futex.wait(LOCK_CONTENDED);
            state = self.futex.value.load(Ordering::Relaxed);
        }
    }

    fn release(&self) {
        let prev = self.futex.value.fetch_update(Ordering::Release, Ordering::Relaxed, |s| {
            (s != LOCK_DESTROYED).then_some(LOCK_UNLOCKED)
        });
        if prev == Ok(LOCK_CONTENDED) {
            self.futex.wake(1);
        }
    }

    /// Tear the lock down. Current holders keep it until their guard drops,
    /// everybody else (now and later) gets [`ShmError::LockUnavailable`].
    pub fn destroy(&self) {
        self.futex.value.store(LOCK_DESTROYED, Ordering::Release);
        self.futex.wake(i32::MAX);
    }

    pub fn is_destroyed(&self) -> bool {
        self.futex.value.load(Ordering::Acquire) == LOCK_DESTROYED
    }
}

impl Default for PoolLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Held for as long as the pool is ours. Dropping it releases the lock, which
/// is the only way the lock is ever released.
pub struct PoolLockGuard<'a> {
    lock: &'a PoolLock,
}

impl Drop for PoolLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}
