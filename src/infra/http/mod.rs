//! HTTP surface: one router, served over TCP or dispatched one request at a
//! time by a function host.

mod middleware;
mod rasterize;

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
    middleware as axum_middleware,
    response::Response,
    routing::{get, post},
};
use tower::ServiceExt;

use crate::{
    application::{
        error::HttpError,
        rasterize::{ChannelBroker, Renderer, StreamBridge},
    },
    config::RenderSettings,
};

pub use middleware::{CommittedRender, RequestContext};

/// Response body buffer between the bridge and the client connection.
pub const RESPONSE_BUFFER_BYTES: usize = 64 * 1024;

#[derive(Clone)]
pub struct HttpState {
    pub bridge: StreamBridge,
}

impl HttpState {
    pub fn new(broker: Arc<dyn ChannelBroker>, renderer: Arc<dyn Renderer>) -> Self {
        Self {
            bridge: StreamBridge::new(broker, renderer),
        }
    }

    /// Production wiring: named pipes under `fifo_dir`, rendered by Ghostscript.
    #[cfg(unix)]
    pub fn ghostscript(render: &RenderSettings) -> Self {
        use tracing::info;

        use crate::application::rasterize::{FifoBroker, GhostscriptRenderer};

        let broker = FifoBroker::new(&render.fifo_dir);
        let renderer = GhostscriptRenderer::new(&render.ghostscript_path, render.timeout);
        info!(
            target = "pdfrasterizer::http",
            ghostscript = %renderer.binary().display(),
            fifo_dir = %broker.dir().display(),
            timeout_secs = render.timeout.as_secs(),
            "Render backend configured"
        );
        Self::new(Arc::new(broker), Arc::new(renderer))
    }
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/rasterize", post(rasterize::rasterize))
        .route("/_health", get(health))
        .fallback(not_found)
        .with_state(state)
        .layer(axum_middleware::from_fn(middleware::log_responses))
        .layer(axum_middleware::from_fn(middleware::set_request_context))
}

/// Invoke the router once, the way a function host delivers a request.
pub async fn dispatch(router: Router, request: Request<Body>) -> Response {
    match router.oneshot(request).await {
        Ok(response) => response,
        Err(never) => match never {},
    }
}

async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn not_found(request: Request<Body>) -> HttpError {
    HttpError::new(
        "infra::http::not_found",
        StatusCode::NOT_FOUND,
        "Not found",
        format!("no route for {} {}", request.method(), request.uri().path()),
    )
}
