pub mod lock;
pub mod pool;
