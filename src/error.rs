//! Error types for symtier

use thiserror::Error;

pub type SymtierResult<T> = std::result::Result<T, SymtierError>;

#[derive(Debug, Error)]
pub enum SymtierError {
    #[error("{0}")]
    Cache(#[from] CacheError),

    #[error("{0}")]
    Symbol(#[from] SymbolError),

    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    Server(#[from] ServerError),

    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from the persistent LRU cache plane.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("path not in cache: {0}")]
    NoSuchKey(String),

    #[error("path already in cache: {0}")]
    KeyConflict(String),

    #[error("unable to free enough room for new cache file")]
    NoSpace,

    #[error(transparent)]
    Index(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CacheError {
    pub fn is_no_such_key(&self) -> bool {
        matches!(self, Self::NoSuchKey(_))
    }
}

/// Errors from symbol file decoding and lookup.
#[derive(Debug, Error)]
pub enum SymbolError {
    #[error("unrecognizable type of symbol file: {0}")]
    UnknownFormat(String),

    #[error("malformed symbol line {line} in {source_id}")]
    MalformedLine { source_id: String, line: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Request validation failures. The display string is what gets logged; the
/// client only ever sees a 400.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("request is not valid JSON")]
    NotJson,

    #[error("request is not an object")]
    NotAnObject,

    #[error("request does not contain '{0}'")]
    MissingField(&'static str),

    #[error("server supports versions 3 and 4 only ({0} requested)")]
    UnsupportedVersion(i64),

    #[error("{0}")]
    BadMemoryMap(&'static str),

    #[error("{0}")]
    BadStack(&'static str),
}

/// Failures in the request/response plumbing between tiers.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("worker is gone")]
    WorkerGone,

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    Parse(String),

    #[error("invalid value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
