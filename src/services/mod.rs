//! Service layer for symtier

pub mod debug;
pub mod scheduler;
pub mod symbolicator;
pub mod symfile;

pub use scheduler::DiskCacheScheduler;
pub use symbolicator::{HttpUpstream, Symbolicator, UpstreamClient};
