//! Command-line interface
//!
//! One subcommand per tier. Flags override the corresponding configuration
//! file values; everything else about process management (daemonisation,
//! supervision) lives outside this binary.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::{DiskCacheConfig, SymServerConfig};

#[derive(Debug, Parser)]
#[command(name = "symtier", version, about = "Two-tier crash-stack symbolication service")]
pub struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the DiskCache tier (persistent symbol cache + batch worker)
    DiskCache(DiskCacheArgs),

    /// Run the SymServer front-end tier
    SymServer(SymServerArgs),
}

#[derive(Debug, Args)]
pub struct DiskCacheArgs {
    /// Port to listen on
    #[arg(long, short)]
    pub port: Option<u16>,

    /// Directory holding the cache index and symbol files
    #[arg(long)]
    pub cache_path: Option<PathBuf>,

    /// Maximum cache size in megabytes
    #[arg(long)]
    pub max_size: Option<u64>,

    /// Upstream symbol URL; repeatable, replaces the configured list
    #[arg(long = "symbol-url")]
    pub symbol_urls: Vec<String>,

    /// Read-only local symbol directory; repeatable
    #[arg(long = "local-symbols")]
    pub local_symbol_dirs: Vec<PathBuf>,
}

impl DiskCacheArgs {
    pub fn apply(&self, config: &mut DiskCacheConfig) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(cache_path) = &self.cache_path {
            config.cache_path = cache_path.clone();
        }
        if let Some(max_size) = self.max_size {
            config.max_size_mb = max_size;
        }
        if !self.symbol_urls.is_empty() {
            config.symbol_urls = self.symbol_urls.clone();
        }
        if !self.local_symbol_dirs.is_empty() {
            config.local_symbol_dirs = self.local_symbol_dirs.clone();
        }
    }
}

#[derive(Debug, Args)]
pub struct SymServerArgs {
    /// Port to listen on
    #[arg(long, short)]
    pub port: Option<u16>,

    /// L1 server address; repeatable, replaces the configured list.
    /// A single "none" disables the L1 tier.
    #[arg(long = "memcached-server")]
    pub memcached_servers: Vec<String>,

    /// Address of the DiskCache tier
    #[arg(long)]
    pub disk_cache_server: Option<String>,
}

impl SymServerArgs {
    pub fn apply(&self, config: &mut SymServerConfig) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if !self.memcached_servers.is_empty() {
            if self.memcached_servers.len() == 1
                && self.memcached_servers[0].eq_ignore_ascii_case("none")
            {
                config.memcached_servers = Vec::new();
            } else {
                config.memcached_servers = self.memcached_servers.clone();
            }
        }
        if let Some(server) = &self.disk_cache_server {
            config.disk_cache_server = server.clone();
        }
    }
}
