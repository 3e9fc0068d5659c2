//! Builds the single router that serves the whole WebDAV tree.
//!
//! WebDAV resources are addressed by arbitrary paths and most of the verbs
//! (`PROPFIND`, `MKCOL`, `COPY`, ...) are extension methods, so nothing is
//! routed by path. Every request reaches [`dispatch`] through the fallback.
//!
//! ## Layers (outermost first)
//! - `TraceLayer`: one span per request
//! - `apply_cors`: CORS headers on every response, including 401s
//! - `RequestBodyLimitLayer`: caps upload size
//! - `require_auth`: Basic credentials, skipped for `OPTIONS`

use crate::handlers::{
    AppState,
    dispatch::{apply_cors, dispatch, require_auth},
};
use axum::{Router, middleware};
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

/// Build the application router with its state attached.
pub fn routes(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .fallback(dispatch)
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(middleware::from_fn(apply_cors))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
