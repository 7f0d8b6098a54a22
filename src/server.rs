//! Inbound HTTP surface.
//!
//! Legacy browsers are configured to use the gateway as their HTTP proxy,
//! so requests arrive in absolute form (`GET http://host/path`). Clients
//! that talk to the gateway directly are routed by their `Host` header.
//! There is no path routing at this level: one fallback handler hands
//! everything to the [`Gateway`].

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::State;
use axum::http::{header::HOST, Method, Request};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, Level};

use crate::content::GatewayResponse;
use crate::error::GatewayError;
use crate::gateway::Gateway;
use crate::site::pages::error_response;
use crate::site::RewriteContext;

/// Largest request body accepted from a client.
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

impl IntoResponse for GatewayResponse {
    fn into_response(self) -> Response {
        (self.status, self.headers, self.body).into_response()
    }
}

pub fn build_router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .fallback(handle)
        .with_state(gateway)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
}

/// Serve until Ctrl-C or SIGTERM.
pub async fn serve(addr: SocketAddr, gateway: Arc<Gateway>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Gateway listening");
    axum::serve(listener, build_router(gateway))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        if let Ok(mut stream) = signal(SignalKind::terminate()) {
            let _ = stream.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

async fn handle(State(gateway): State<Arc<Gateway>>, request: Request<Body>) -> Response {
    match context_from(request).await {
        Ok(ctx) => gateway.handle(&ctx).await.into_response(),
        Err(err) => error_response(&err).into_response(),
    }
}

/// Absolute URL the client asked for.
fn request_url(request: &Request<Body>) -> Result<String, GatewayError> {
    let uri = request.uri();
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Ok(uri.to_string());
    }
    let host = request
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .filter(|h| !h.is_empty())
        .ok_or_else(|| GatewayError::BadRequest("no Host header".to_string()))?;
    let path = uri.path_and_query().map_or("/", |pq| pq.as_str());
    Ok(format!("http://{host}{path}"))
}

async fn context_from(request: Request<Body>) -> Result<RewriteContext, GatewayError> {
    if request.method() == Method::CONNECT {
        return Err(GatewayError::MethodNotAllowed(Method::CONNECT));
    }
    let url = request_url(&request)?;
    let (parts, body) = request.into_parts();
    let body = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| GatewayError::BadRequest(format!("unreadable body: {e}")))?;
    RewriteContext::new(parts.method, &url, parts.headers, body)
}
