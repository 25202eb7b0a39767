//! L1 string-KV client
//!
//! The front-end keeps single-frame symbols in an external memcached-style
//! server. Only the text protocol subset the symbolicator needs is spoken
//! here: `get`, `set`, `delete` and `flush_all`. Keys shard across the
//! configured servers by hash. Every operation is best-effort; an
//! unreachable server degrades to a cache miss and is logged, never
//! surfaced.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// The string-KV seam the symbolicator consumes.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: &str);
    async fn delete(&self, key: &str);
    async fn flush(&self);
}

pub struct MemcachedClient {
    servers: Vec<String>,
}

impl MemcachedClient {
    /// Returns `None` when no servers are configured; the caller then runs
    /// without an L1 tier.
    pub fn new(servers: Vec<String>) -> Option<Self> {
        if servers.is_empty() {
            None
        } else {
            Some(Self { servers })
        }
    }

    fn server_for(&self, key: &str) -> &str {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() % self.servers.len() as u64) as usize;
        &self.servers[index]
    }

    async fn connect(&self, server: &str) -> Option<BufReader<TcpStream>> {
        match TcpStream::connect(server).await {
            Ok(stream) => Some(BufReader::new(stream)),
            Err(e) => {
                tracing::warn!("cannot reach L1 server {server}: {e}");
                None
            }
        }
    }

    async fn roundtrip(&self, server: &str, command: &[u8]) -> Option<String> {
        let mut stream = self.connect(server).await?;
        stream.get_mut().write_all(command).await.ok()?;

        let mut line = String::new();
        stream.read_line(&mut line).await.ok()?;
        Some(line)
    }
}

#[async_trait]
impl KvStore for MemcachedClient {
    async fn get(&self, key: &str) -> Option<String> {
        let server = self.server_for(key);
        let mut stream = self.connect(server).await?;

        let command = format!("get {key}\r\n");
        stream.get_mut().write_all(command.as_bytes()).await.ok()?;

        let mut header = String::new();
        stream.read_line(&mut header).await.ok()?;
        let length = parse_value_header(&header)?;

        // Value bytes plus the trailing \r\n, then the END line
        let mut value = vec![0u8; length + 2];
        stream.read_exact(&mut value).await.ok()?;
        let mut end = String::new();
        stream.read_line(&mut end).await.ok()?;

        value.truncate(length);
        String::from_utf8(value).ok()
    }

    async fn set(&self, key: &str, value: &str) {
        let server = self.server_for(key);
        let command = format!("set {key} 0 0 {}\r\n{value}\r\n", value.len());
        match self.roundtrip(server, command.as_bytes()).await {
            Some(reply) if reply.trim_end() == "STORED" => {}
            Some(reply) => tracing::warn!("L1 set of {key} answered: {}", reply.trim_end()),
            None => {}
        }
    }

    async fn delete(&self, key: &str) {
        let server = self.server_for(key);
        let command = format!("delete {key}\r\n");
        // NOT_FOUND is a fine answer; deleting an absent key is a no-op
        let _ = self.roundtrip(server, command.as_bytes()).await;
    }

    async fn flush(&self) {
        for server in &self.servers {
            let _ = self.roundtrip(server, b"flush_all\r\n").await;
        }
    }
}

/// Parse a `VALUE <key> <flags> <bytes>` response header. Anything else
/// (usually a bare `END` for a miss) yields `None`.
fn parse_value_header(header: &str) -> Option<usize> {
    let mut fields = header.trim_end().split(' ');
    if fields.next() != Some("VALUE") {
        return None;
    }
    let _key = fields.next()?;
    let _flags = fields.next()?;
    fields.next()?.parse().ok()
}
