//! Leak-tracking allocation out of a memory pool shared between processes.
//!
//! A [`ShmPool`] is mapped once and inherited by every process `fork()`ed
//! afterwards. A [`ShmAllocator`] hands out blocks from it (or from the
//! process heap, depending on its [`AllocMode`]) and, when instrumented,
//! records who asked for each one so [`ShmAllocator::report_leaks`] can say
//! what is still around.
//!
//! ```no_run
//! use shmtrack::{shfree, shmalloc, ShmConfig};
//!
//! let (pool, alloc) = ShmConfig::default().build()?;
//! let block = shmalloc!(alloc, &pool, 64)?;
//! // SAFETY: `block` came from `alloc` and is still live
//! unsafe { shfree!(alloc, &pool, block)? };
//! alloc.report_leaks(&pool)?;
//! # Ok::<(), shmtrack::ShmError>(())
//! ```

pub mod alloc;
pub mod audio;
pub mod config;
pub mod error;
pub mod os;
pub mod serialize;
pub mod shm;
pub mod util;

pub use alloc::{
    desc::CallSite,
    leaks::LeakRecord,
    tracked::{AllocMode, Backing, ShmAllocator, Tracking},
};
pub use audio::ChannelMode;
pub use config::ShmConfig;
pub use error::ShmError;
pub use shm::pool::ShmPool;
