//! symtier - Two-Tier Crash-Stack Symbolication Service
//!
//! Runs one tier per process: `symtier disk-cache` owns the persistent
//! symbol cache, `symtier sym-server` is the front-end that fans misses out
//! to it.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use symtier::cli::{Cli, Commands};
use symtier::config::SymtierConfig;
use symtier::infra::fetch::HttpSupplier;
use symtier::infra::kv::{KvStore, MemcachedClient};
use symtier::server;
use symtier::services::scheduler::DiskCacheScheduler;
use symtier::services::symbolicator::{HttpUpstream, Symbolicator};

fn main() {
    // Use RUST_LOG=symtier=debug for verbose output
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "symtier=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false).compact())
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to create runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(async_main()) {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

async fn async_main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => SymtierConfig::load(path)?,
        None => SymtierConfig::default(),
    };

    match cli.command {
        Commands::DiskCache(args) => {
            args.apply(&mut config.disk_cache);
            config.sanitize()?;
            let disk_cache = &config.disk_cache;
            tracing::info!(
                "starting DiskCache: cache at {}, budget {} MB",
                disk_cache.cache_path.display(),
                disk_cache.max_size_mb
            );

            let supplier = HttpSupplier::new(
                disk_cache.symbol_urls.clone(),
                disk_cache.retries,
                Duration::from_millis(disk_cache.retry_delay_ms),
            );
            let scheduler = Arc::new(DiskCacheScheduler::start(disk_cache, Box::new(supplier))?);
            server::diskcache::serve(disk_cache.port, scheduler).await?;
        }
        Commands::SymServer(args) => {
            args.apply(&mut config.sym_server);
            config.sanitize()?;
            let sym_server = &config.sym_server;
            tracing::info!(
                "starting SymServer: DiskCache at {}",
                sym_server.disk_cache_server
            );

            let l1 = MemcachedClient::new(sym_server.memcached_servers.clone())
                .map(|client| Arc::new(client) as Arc<dyn KvStore>);
            if l1.is_none() {
                tracing::warn!("no L1 servers configured, every frame goes to the DiskCache");
            }
            let upstream = Arc::new(HttpUpstream::new(sym_server.disk_cache_server.clone()));
            let symbolicator = Arc::new(Symbolicator::new(l1, upstream));
            server::symserver::serve(sym_server.port, symbolicator).await?;
        }
    }

    Ok(())
}
