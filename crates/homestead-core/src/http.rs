//! Local HTTP listener.
//!
//! The data routes live elsewhere; this module owns the pieces the control
//! plane is responsible for: `/health` and the [`transport_guard`]
//! middleware that applies the endpoint ownership matrix to every request
//! using the current [`RuntimeState`].

use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use crate::endpoints::{self, AccessDenied, AuthModel, Transport};
use crate::state::RuntimeState;
use crate::supervisor::ShutdownSignal;

/// Header set by the tunnel client on every forwarded request.
pub const TRANSPORT_HEADER: &str = "x-ps-transport";

/// Shared state for HTTP handlers.
#[derive(Debug, Clone)]
pub struct HttpState {
    /// Follows the state machine; updated by a transition listener.
    pub runtime: watch::Receiver<RuntimeState>,
    pub version: String,
    pub owner: Option<String>,
    pub started_at: Instant,
}

/// Build the router. Every route, and the fallback, sits behind the
/// transport guard.
pub fn router(state: Arc<HttpState>) -> axum::Router {
    axum::Router::new()
        .route("/health", get(handle_health))
        .fallback(handle_not_found)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            transport_guard,
        ))
        .with_state(state)
}

/// Serve `router` on an already-bound listener until shutdown.
pub async fn serve(
    listener: TcpListener,
    router: axum::Router,
    mut shutdown_rx: broadcast::Receiver<ShutdownSignal>,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "HTTP server listening");
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("HTTP server shutting down");
        })
        .await
}

/// Classify how a request arrived. The tunnel broker adds
/// `x-forwarded-for`; the tunnel client adds `x-ps-transport: tunnel`.
pub fn inbound_transport(headers: &HeaderMap) -> Transport {
    let tunneled_header = headers
        .get(TRANSPORT_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("tunnel"));

    if tunneled_header || headers.contains_key("x-forwarded-for") {
        Transport::Tunnel
    } else {
        Transport::Local
    }
}

/// Reject requests whose transport or timing the matrix does not allow.
///
/// On success the resolved [`AuthModel`] is stored in the request
/// extensions for the auth layer downstream.
pub async fn transport_guard(
    State(state): State<Arc<HttpState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let inbound = inbound_transport(request.headers());
    let route = format!("{} {}", request.method(), request.uri().path());
    let runtime = *state.runtime.borrow();

    match endpoints::check(&route, inbound, runtime) {
        Ok(auth) => {
            request.extensions_mut().insert(auth);
            next.run(request).await
        }
        Err(denied) => {
            debug!(%route, ?inbound, %runtime, reason = %denied, "Request rejected");
            denied_response(denied)
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorDetail {
    code: u16,
    error_code: &'static str,
    message: String,
}

fn error_response(status: StatusCode, error_code: &'static str, message: String) -> Response {
    let body = ErrorEnvelope {
        error: ErrorDetail {
            code: status.as_u16(),
            error_code,
            message,
        },
    };
    (status, Json(body)).into_response()
}

fn denied_response(denied: AccessDenied) -> Response {
    let (status, code) = match denied {
        AccessDenied::LocalOnly => (StatusCode::FORBIDDEN, "LOCAL_ONLY"),
        AccessDenied::TunnelOnly => (StatusCode::FORBIDDEN, "TUNNEL_ONLY"),
        AccessDenied::TunnelInactive => (StatusCode::SERVICE_UNAVAILABLE, "TUNNEL_INACTIVE"),
        AccessDenied::Unavailable { .. } => (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE"),
    };
    error_response(status, code, denied.to_string())
}

#[derive(Debug, Serialize, serde::Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime: u64,
    pub owner: Option<String>,
    pub runtime_state: RuntimeState,
}

async fn handle_health(State(state): State<Arc<HttpState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: state.version.clone(),
        uptime: state.started_at.elapsed().as_secs(),
        owner: state.owner.clone(),
        runtime_state: *state.runtime.borrow(),
    })
}

async fn handle_not_found(request: Request) -> Response {
    let auth = request.extensions().get::<AuthModel>().copied();
    debug!(path = %request.uri().path(), ?auth, "No handler for route");
    error_response(
        StatusCode::NOT_FOUND,
        "NOT_FOUND",
        format!("no route for {}", request.uri().path()),
    )
}
