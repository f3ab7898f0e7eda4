//! Leak reporting: what is still live in a pool, and a way to keep that
//! around after the pool is gone.

use std::{
    fs::File,
    io::{Read, Write},
    path::Path,
};

use serde::{Deserialize, Serialize};

use super::{desc::ShmDesc, tracked::ShmAllocator};
use crate::{error::ShmError, shm::pool::ShmPool};

/// A live allocation, copied out of its descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakRecord {
    #[serde(with = "crate::serialize::serde_usize")]
    pub address: *const u8,
    pub bytes: usize,
    pub func: String,
    pub file: String,
    pub line: u32,
}

impl From<&ShmDesc> for LeakRecord {
    fn from(desc: &ShmDesc) -> Self {
        Self {
            address: desc.payload().as_ptr(),
            bytes: desc.bytes(),
            func: desc.func(),
            file: desc.file(),
            line: desc.line(),
        }
    }
}

impl ShmAllocator {
    /// Snapshot of every allocation still live in `pool`. Always empty unless
    /// this allocator is instrumented and shared.
    pub fn leaks(&self, pool: &ShmPool) -> Result<Vec<LeakRecord>, ShmError> {
        if !self.mode().is_instrumented() || !self.mode().is_shared() {
            return Ok(Vec::new());
        }
        let guard = pool.lock()?;
        Ok(guard.registry().iter().map(LeakRecord::from).collect())
    }

    /// Log every allocation still live in `pool` at debug level and return
    /// how many there were. Nothing is freed or unlinked.
    pub fn report_leaks(&self, pool: &ShmPool) -> Result<usize, ShmError> {
        if !self.mode().is_instrumented() || !self.mode().is_shared() {
            return Ok(0);
        }
        let guard = pool.lock()?;
        let registry = guard.registry();
        if registry.is_empty() {
            return Ok(0);
        }

        log::debug!("Shared memory allocations remaining ({}):", registry.len());
        for desc in registry.iter() {
            log::debug!(
                "{:7} bytes at {:p} allocated in {} ({}: {})",
                desc.bytes(),
                desc.payload(),
                desc.func(),
                desc.file(),
                desc.line()
            );
        }
        Ok(registry.len())
    }
}

pub fn write_leaks_to_file<P>(leaks: &[LeakRecord], path: P) -> Result<(), ShmError>
where
    P: AsRef<Path>,
{
    let mut file = File::create(path)?;
    file.write_all(&serde_json::to_vec_pretty(leaks)?)?;
    Ok(())
}

pub fn read_leaks_from_file<P>(path: P) -> Result<Vec<LeakRecord>, ShmError>
where
    P: AsRef<Path>,
{
    let mut file = File::open(path)?;
    let mut buf = String::new();
    file.read_to_string(&mut buf)?;
    Ok(serde_json::from_str(&buf)?)
}
