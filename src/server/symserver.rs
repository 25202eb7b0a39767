//! SymServer HTTP surface
//!
//! `POST /` accepts symbolication and (loopback-only) debug requests.
//! `GET /__lbheartbeat__` answers the load balancer directly;
//! `GET /__heartbeat__` is forwarded as a debug heartbeat to the DiskCache
//! so the probe exercises the whole tier chain.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use uuid::Uuid;

use crate::models::request::ParsedRequest;
use crate::services::symbolicator::Symbolicator;

use super::remote_ip;
use super::validate::validate_request;

pub fn router(symbolicator: Arc<Symbolicator>) -> Router {
    Router::new()
        .route("/", post(handle_post))
        .route("/__lbheartbeat__", get(lb_heartbeat))
        .route("/__heartbeat__", get(heartbeat))
        .with_state(symbolicator)
}

pub async fn serve(port: u16, symbolicator: Arc<Symbolicator>) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("SymServer listening on {addr}");
    axum::serve(
        listener,
        router(symbolicator).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

async fn lb_heartbeat() -> StatusCode {
    StatusCode::OK
}

async fn heartbeat(State(symbolicator): State<Arc<Symbolicator>>) -> StatusCode {
    if symbolicator.upstream().heartbeat().await {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

async fn handle_post(
    State(symbolicator): State<Arc<Symbolicator>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let id = Uuid::new_v4().to_string();
    tracing::info!("{id} processing POST request REMOTE IP={}", remote_ip(&headers, &addr));

    let parsed = match validate_request(&body, addr.ip().is_loopback()) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::error!("{id} unable to validate request body: {e}");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    match parsed {
        ParsedRequest::Debug(debug) => match symbolicator.handle_debug(&debug, &id).await {
            Ok(value) => (StatusCode::OK, axum::Json(value)).into_response(),
            Err(e) => {
                tracing::error!("{id} debug action failed: {e}");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        },
        ParsedRequest::Symbolication(request) => {
            let value = symbolicator.symbolicate(request, &id).await;
            tracing::debug!("{id} response sent");
            (StatusCode::OK, axum::Json(value)).into_response()
        }
    }
}
