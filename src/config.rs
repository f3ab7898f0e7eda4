use std::{fs::File, io::Read, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    alloc::tracked::{AllocMode, ShmAllocator},
    error::ShmError,
    shm::pool::ShmPool,
};

/// Environment variable overriding [`ShmConfig::mode`], e.g.
/// `SHMTRACK_MODE=bare-local`.
pub const MODE_ENV_VAR: &str = "SHMTRACK_MODE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShmConfig {
    /// Size of the shared mapping, pool header included.
    pub pool_size: usize,
    pub pool_name: String,
    pub mode: AllocMode,
    pub abort_on_unknown_chunk: bool,
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            pool_size: 4 * 1024 * 1024,
            pool_name: "shmtrack".to_owned(),
            mode: AllocMode::default(),
            abort_on_unknown_chunk: true,
        }
    }
}

impl ShmConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ShmError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P>(path: P) -> Result<Self, ShmError>
    where
        P: AsRef<Path>,
    {
        let mut file = File::open(path)?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;
        Self::from_json_str(&buf)
    }

    /// Let [`MODE_ENV_VAR`] override the configured mode.
    pub fn apply_env(&mut self) -> Result<(), ShmError> {
        self.override_mode(std::env::var(MODE_ENV_VAR).ok().as_deref())
    }

    fn override_mode(&mut self, value: Option<&str>) -> Result<(), ShmError> {
        if let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) {
            self.mode = value.parse()?;
            log::debug!("allocator mode overridden to {} by {MODE_ENV_VAR}", self.mode);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ShmError> {
        if self.mode.is_shared() && self.pool_size < ShmPool::MIN_SIZE {
            return Err(ShmError::Config(format!(
                "pool_size {} is below the minimum of {} bytes",
                self.pool_size,
                ShmPool::MIN_SIZE
            )));
        }
        if self.pool_name.is_empty() {
            return Err(ShmError::Config("pool_name must not be empty".to_owned()));
        }
        Ok(())
    }

    /// Map the pool and build an allocator for it. Local modes still get a
    /// pool, so callers don't need to special-case them.
    pub fn build(&self) -> Result<(ShmPool, ShmAllocator), ShmError> {
        self.validate()?;
        let pool = ShmPool::create(&self.pool_name, self.pool_size.max(ShmPool::MIN_SIZE))?;
        let alloc = ShmAllocator::new(self.mode).abort_on_unknown_chunk(self.abort_on_unknown_chunk);
        Ok((pool, alloc))
    }
}
