//! HTTP surfaces for both tiers

pub mod diskcache;
pub mod symserver;
pub mod validate;

use std::net::SocketAddr;

use axum::http::HeaderMap;

/// Remote address for log lines, honouring `X-Forwarded-For` when a proxy
/// sits in front. The loopback check for debug requests always uses the
/// direct peer address, never this value.
pub(crate) fn remote_ip(headers: &HeaderMap, addr: &SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| addr.ip().to_string())
}
