//! Infrastructure layer for symtier
//!
//! Low-level storage and external integrations: the cache plane, upstream
//! symbol retrieval, and the L1 string-KV client.

pub mod cache;
pub mod fetch;
pub mod kv;
