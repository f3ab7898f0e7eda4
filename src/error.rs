use std::io;

/// Everything that can go wrong while talking to a pool.
///
/// `LockUnavailable` and `AllocationFailed` are ordinary failures the caller
/// may retry or escalate. `UnknownChunk` means the caller handed us a pointer
/// the registry has never seen (or has already released); by the time it is
/// returned the shared bookkeeping can no longer be trusted, which is why
/// [`ShmAllocator`](crate::alloc::tracked::ShmAllocator) aborts on it unless
/// configured otherwise.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("could not lock shared memory pool")]
    LockUnavailable,

    #[error("could not allocate {size} bytes from pool")]
    AllocationFailed { size: usize },

    #[error("unknown chunk at {ptr:#x} ({what}) from [{file}:{line} in {func}()]")]
    UnknownChunk {
        ptr: usize,
        what: &'static str,
        func: &'static str,
        file: &'static str,
        line: u32,
    },

    #[error("pool of {size} bytes is smaller than the minimum of {min} bytes")]
    PoolTooSmall { size: usize, min: usize },

    #[error("could not map shared memory: {0}")]
    Map(#[source] io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}
