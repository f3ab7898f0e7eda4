//! Fork a few workers that all allocate from one pool, then list what they
//! left behind.
//!
//! ```plaintext
//! RUST_LOG=debug cargo run --example fork_share
//! ```

use shmtrack::{shfree, shmalloc, shstrdup, ShmAllocator, ShmConfig, ShmError, ShmPool};

const WORKERS: usize = 4;

fn worker(pool: &ShmPool, alloc: &ShmAllocator, id: usize) -> Result<(), ShmError> {
    let mut blocks = Vec::with_capacity(64);
    for i in 0..64 {
        blocks.push(shmalloc!(alloc, pool, 64 * (i % 8 + 1))?);
    }
    for block in blocks.drain(..) {
        unsafe { shfree!(alloc, pool, block)? };
    }
    // forget one on purpose
    if id % 2 == 0 {
        shstrdup!(alloc, pool, c"worker scratch")?;
    }
    Ok(())
}

fn main() -> Result<(), ShmError> {
    env_logger::init();

    let mut config = ShmConfig::default();
    config.apply_env()?;
    let (pool, alloc) = config.build()?;
    log::info!("running {WORKERS} workers in {} mode", alloc.mode());

    let mut children = Vec::new();
    for id in 0..WORKERS {
        // SAFETY: the child runs `worker()` and `_exit()`s
        match unsafe { libc::fork() } {
            -1 => return Err(std::io::Error::last_os_error().into()),
            0 => {
                let code = match worker(&pool, &alloc, id) {
                    Ok(()) => 0,
                    Err(e) => {
                        log::error!("worker {id}: {e}");
                        1
                    }
                };
                // SAFETY: leave without running the parent's destructors
                unsafe { libc::_exit(code) };
            }
            pid => children.push(pid),
        }
    }

    for pid in children {
        let mut status = 0;
        // SAFETY: `pid` is one of our children
        unsafe { libc::waitpid(pid, &mut status, 0) };
        if !libc::WIFEXITED(status) || libc::WEXITSTATUS(status) != 0 {
            log::error!("worker {pid} failed (status {status:#x})");
        }
    }

    let leaks = alloc.report_leaks(&pool)?;
    println!("{leaks} allocations left in pool '{}'", pool.name());
    pool.shutdown();
    Ok(())
}
