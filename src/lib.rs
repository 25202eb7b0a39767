//! symtier - Two-Tier Crash-Stack Symbolication Service
//!
//! Turns raw crash-stack frames (module + memory offset) into function
//! names. A SymServer front-end consults a fast in-memory string-KV and
//! coalesces misses into sub-requests for the DiskCache tier, which owns a
//! persistent, size-bounded LRU store of preprocessed symbol files.

pub mod cli;
pub mod config;
pub mod error;
pub mod infra;
pub mod models;
pub mod server;
pub mod services;

pub use error::{SymtierError, SymtierResult};
