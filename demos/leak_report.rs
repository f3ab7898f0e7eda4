//! Leak a couple of blocks, report them, and save the report as JSON.
//!
//! ```plaintext
//! RUST_LOG=debug cargo run --example leak_report -- leaks.json
//! ```

use shmtrack::{
    alloc::leaks::{read_leaks_from_file, write_leaks_to_file},
    shcalloc, shfree, shmalloc, shrealloc, AllocMode, ChannelMode, ShmConfig, ShmError,
};

fn main() -> Result<(), ShmError> {
    env_logger::init();

    let path = std::env::args().nth(1).unwrap_or_else(|| "leaks.json".to_owned());
    let (pool, alloc) = ShmConfig {
        mode: AllocMode::INSTRUMENTED_SHARED,
        ..ShmConfig::default()
    }
    .build()?;

    let mode = ChannelMode::for_channels(2);
    let frames = 1024;
    let samples = shcalloc!(alloc, &pool, frames, mode.channels() as usize * 2)?;
    let scratch = shmalloc!(alloc, &pool, 100)?;
    let scratch = unsafe { shrealloc!(alloc, &pool, Some(scratch), 400) }?;
    let _leaked = shmalloc!(alloc, &pool, 33)?;

    if let Some(scratch) = scratch {
        unsafe { shfree!(alloc, &pool, scratch)? };
    }

    let count = alloc.report_leaks(&pool)?;
    let leaks = alloc.leaks(&pool)?;
    write_leaks_to_file(&leaks, &path)?;
    println!("wrote {count} leaks to {path}");

    for leak in read_leaks_from_file(&path)? {
        println!("{:7} bytes allocated in {} ({}: {})", leak.bytes, leak.func, leak.file, leak.line);
    }

    unsafe { shfree!(alloc, &pool, samples)? };
    Ok(())
}
