//! Service configuration
//!
//! Loaded from a TOML file with `[disk_cache]` and `[sym_server]` tables.
//! Every field has a default so an empty file (or no file) yields a working
//! local setup.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level configuration for both tiers.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SymtierConfig {
    #[serde(default)]
    pub disk_cache: DiskCacheConfig,

    #[serde(default)]
    pub sym_server: SymServerConfig,
}

impl SymtierConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: SymtierConfig =
            toml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.sanitize()?;
        Ok(config)
    }

    /// Normalise values the rest of the code relies on: symbol URLs must end
    /// with `/`, the DiskCache address must carry a scheme, and the cache
    /// path must be absolute.
    pub fn sanitize(&mut self) -> Result<(), ConfigError> {
        for url in &mut self.disk_cache.symbol_urls {
            if !url.ends_with('/') {
                url.push('/');
            }
        }

        if self.disk_cache.max_size_mb == 0 {
            return Err(ConfigError::InvalidValue {
                key: "disk_cache.max_size_mb".to_string(),
                message: "cache size must be non-zero".to_string(),
            });
        }

        self.disk_cache.cache_path = std::path::absolute(&self.disk_cache.cache_path)?;

        let server = &mut self.sym_server.disk_cache_server;
        if !server.starts_with("http://") && !server.starts_with("https://") {
            *server = format!("http://{server}");
        }

        Ok(())
    }
}

/// DiskCache tier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskCacheConfig {
    #[serde(default = "defaults::cache_path")]
    pub cache_path: PathBuf,

    /// Read-only directories holding pre-deployed symbol files. Earlier
    /// directories win on path conflicts.
    #[serde(default)]
    pub local_symbol_dirs: Vec<PathBuf>,

    #[serde(default = "defaults::max_size_mb")]
    pub max_size_mb: u64,

    #[serde(default = "defaults::disk_cache_port")]
    pub port: u16,

    #[serde(default = "defaults::symbol_urls")]
    pub symbol_urls: Vec<String>,

    #[serde(default = "defaults::retries")]
    pub retries: u32,

    #[serde(default = "defaults::retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for DiskCacheConfig {
    fn default() -> Self {
        Self {
            cache_path: defaults::cache_path(),
            local_symbol_dirs: Vec::new(),
            max_size_mb: defaults::max_size_mb(),
            port: defaults::disk_cache_port(),
            symbol_urls: defaults::symbol_urls(),
            retries: defaults::retries(),
            retry_delay_ms: defaults::retry_delay_ms(),
        }
    }
}

impl DiskCacheConfig {
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb * 1024 * 1024
    }
}

/// SymServer tier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymServerConfig {
    #[serde(default = "defaults::sym_server_port")]
    pub port: u16,

    /// Addresses of the L1 string-KV servers. An empty list disables the L1
    /// tier entirely; every frame then goes to the DiskCache.
    #[serde(default = "defaults::memcached_servers")]
    pub memcached_servers: Vec<String>,

    #[serde(default = "defaults::disk_cache_server")]
    pub disk_cache_server: String,
}

impl Default for SymServerConfig {
    fn default() -> Self {
        Self {
            port: defaults::sym_server_port(),
            memcached_servers: defaults::memcached_servers(),
            disk_cache_server: defaults::disk_cache_server(),
        }
    }
}

mod defaults {
    use std::path::PathBuf;

    // DiskCache
    pub fn cache_path() -> PathBuf {
        PathBuf::from("./symtier-cache")
    }
    pub fn max_size_mb() -> u64 {
        200
    }
    pub fn disk_cache_port() -> u16 {
        8888
    }
    pub fn symbol_urls() -> Vec<String> {
        vec![
            "https://s3-us-west-2.amazonaws.com/org.mozilla.crash-stats.symbols-public/v1/"
                .to_string(),
        ]
    }
    pub fn retries() -> u32 {
        3
    }
    pub fn retry_delay_ms() -> u64 {
        500
    }

    // SymServer
    pub fn sym_server_port() -> u16 {
        8080
    }
    pub fn memcached_servers() -> Vec<String> {
        vec!["127.0.0.1:11211".to_string()]
    }
    pub fn disk_cache_server() -> String {
        "127.0.0.1:8888".to_string()
    }
}
