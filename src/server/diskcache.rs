//! DiskCache HTTP surface
//!
//! One route: `POST /` accepts symbolication and (loopback-only) debug
//! requests, `GET /` answers liveness probes. Each request gets a UUID used
//! to correlate its log lines with the worker's.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use uuid::Uuid;

use crate::models::request::ParsedRequest;
use crate::services::scheduler::DiskCacheScheduler;

use super::remote_ip;
use super::validate::validate_request;

pub fn router(scheduler: Arc<DiskCacheScheduler>) -> Router {
    Router::new()
        .route("/", get(liveness).post(handle_post))
        .with_state(scheduler)
}

pub async fn serve(port: u16, scheduler: Arc<DiskCacheScheduler>) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("DiskCache listening on {addr}");
    axum::serve(
        listener,
        router(scheduler).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

async fn liveness() -> StatusCode {
    StatusCode::OK
}

async fn handle_post(
    State(scheduler): State<Arc<DiskCacheScheduler>>,
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
    let version = match &parsed {
        ParsedRequest::Symbolication(request) => Some(request.version),
        ParsedRequest::Debug(_) => None,
    };

    match scheduler.submit(parsed, id.clone()).await {
        Ok(Ok(mut value)) => {
            if version == Some(3) {
                let stacks = value.get_mut("symbolicatedStacks").map(serde_json::Value::take);
                if let Some(stacks) = stacks {
                    value = stacks;
                }
            }
            tracing::debug!("{id} response sent");
            (StatusCode::OK, axum::Json(value)).into_response()
        }
        Ok(Err(e)) => {
            tracing::error!("{id} could not formulate response: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        Err(_) => {
            tracing::error!("{id} worker dropped the request");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
