//! Symbol file retrieval from upstream storage
//!
//! Upstream is a list of HTTP base URLs tried in order, with a bounded
//! number of retry rounds. A URL that answered 404 for a request is not
//! asked again within that request. Retrieval never fails loudly: the
//! outcome is either the bytes or nothing, and the caller decides what an
//! unavailable symbol file means.

use std::collections::HashSet;
use std::io::Read;
use std::sync::OnceLock;
use std::time::Duration;

use flate2::read::{GzDecoder, ZlibDecoder};

use crate::models::module::ModuleId;

/// Source of symbol files. The DiskCache worker only sees this seam, so
/// tests can substitute canned symbol data for the network.
pub trait SymbolSupplier: Send {
    fn fetch(&self, module: &ModuleId, file_name: &str) -> Option<Vec<u8>>;
}

pub struct HttpSupplier {
    // Built lazily so it always lives on the worker thread, not on the
    // async runtime that constructed the supplier
    client: OnceLock<reqwest::blocking::Client>,
    symbol_urls: Vec<String>,
    retries: u32,
    retry_delay: Duration,
}

enum UrlOutcome {
    Data(Vec<u8>),
    Missing,
    Failed,
}

impl HttpSupplier {
    /// `symbol_urls` must already be normalised to end with `/`.
    pub fn new(symbol_urls: Vec<String>, retries: u32, retry_delay: Duration) -> Self {
        Self {
            client: OnceLock::new(),
            symbol_urls,
            retries,
            retry_delay,
        }
    }

    fn client(&self) -> &reqwest::blocking::Client {
        self.client.get_or_init(reqwest::blocking::Client::new)
    }

    fn fetch_url(&self, url: &str) -> UrlOutcome {
        let response = match self.client().get(url).send() {
            Ok(response) => response,
            Err(e) => {
                tracing::error!("exception when requesting symbol file at {url}: {e}");
                return UrlOutcome::Failed;
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            tracing::debug!("got HTTP 404 when requesting symbol file at {url}");
            return UrlOutcome::Missing;
        }
        if status != reqwest::StatusCode::OK {
            tracing::warn!("got HTTP {status} when requesting symbol file at {url}");
            return UrlOutcome::Failed;
        }

        let content_encoding = response
            .headers()
            .get(reqwest::header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(str::to_ascii_lowercase);

        let body = match response.bytes() {
            Ok(body) => body.to_vec(),
            Err(e) => {
                tracing::error!("failed reading symbol file body from {url}: {e}");
                return UrlOutcome::Failed;
            }
        };

        match decode_body(content_encoding.as_deref(), body) {
            Some(data) => UrlOutcome::Data(data),
            None => {
                tracing::error!("failed decompressing symbol file from {url}");
                UrlOutcome::Failed
            }
        }
    }
}

impl SymbolSupplier for HttpSupplier {
    fn fetch(&self, module: &ModuleId, file_name: &str) -> Option<Vec<u8>> {
        let mut skip: HashSet<usize> = HashSet::new();

        for round in 0..self.retries {
            if round > 0 {
                std::thread::sleep(self.retry_delay);
                tracing::debug!(
                    "retrying download of {}/{}/{file_name}",
                    module.lib_name,
                    module.breakpad_id
                );
            }
            for (url_index, base) in self.symbol_urls.iter().enumerate() {
                if skip.contains(&url_index) {
                    continue;
                }
                let url = build_url(base, module, file_name);
                match self.fetch_url(&url) {
                    UrlOutcome::Data(data) => return Some(data),
                    UrlOutcome::Missing => {
                        // This server does not have the file; no point
                        // asking it again on later rounds.
                        skip.insert(url_index);
                    }
                    UrlOutcome::Failed => {}
                }
            }
            if skip.len() == self.symbol_urls.len() {
                break;
            }
        }

        tracing::debug!(
            "unable to download {}/{}/{file_name}",
            module.lib_name,
            module.breakpad_id
        );
        None
    }
}

fn build_url(base: &str, module: &ModuleId, file_name: &str) -> String {
    format!(
        "{base}{}/{}/{}",
        urlencoding::encode(&module.lib_name),
        urlencoding::encode(&module.breakpad_id),
        urlencoding::encode(file_name)
    )
}

/// Decode a response body according to its `Content-Encoding`. Encoded
/// bodies try gzip first and fall back to bare zlib; if both fail the body
/// is treated as undecodable rather than passed through corrupted.
fn decode_body(content_encoding: Option<&str>, body: Vec<u8>) -> Option<Vec<u8>> {
    match content_encoding {
        Some("gzip") | Some("x-gzip") | Some("deflate") => {
            let mut decoded = Vec::new();
            if GzDecoder::new(body.as_slice())
                .read_to_end(&mut decoded)
                .is_ok()
            {
                return Some(decoded);
            }
            decoded.clear();
            if ZlibDecoder::new(body.as_slice())
                .read_to_end(&mut decoded)
                .is_ok()
            {
                return Some(decoded);
            }
            None
        }
        _ => Some(body),
    }
}
