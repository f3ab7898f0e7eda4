pub mod desc;
pub mod leaks;
pub mod local;
pub mod registry;
pub mod tracked;
