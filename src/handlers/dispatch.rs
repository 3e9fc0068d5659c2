//! Method routing and the two middleware layers every request passes
//! through: Basic authentication and CORS response headers.

use super::{AppState, DavRequest, props, read, tree, write};
use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderName, HeaderValue, Method, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use subtle::ConstantTimeEq;

/// Methods answered by this server, as advertised in `Allow`.
pub const SUPPORTED_METHODS: &str =
    "OPTIONS, PROPFIND, PROPPATCH, MKCOL, GET, HEAD, PUT, DELETE, COPY, MOVE";

/// Compliance classes advertised in the `DAV` header.
pub const DAV_CLASS: &str = "1, 3";

const CORS_ALLOW_HEADERS: &str = "authorization, content-type, depth, overwrite, destination, range";
const CORS_EXPOSE_HEADERS: &str =
    "content-type, content-length, dav, etag, last-modified, location, date, content-range";
const CORS_MAX_AGE: &str = "86400";

/// Router fallback: every request, whatever its path, lands here.
pub async fn dispatch(State(state): State<AppState>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let method = parts.method;
    let dav = DavRequest {
        uri: parts.uri,
        headers: parts.headers,
        body,
    };
    tracing::debug!(%method, path = dav.uri.path(), "dispatching");

    let result = match method.as_str() {
        "OPTIONS" => Ok(capabilities(StatusCode::NO_CONTENT)),
        "GET" => read::handle_get(&state, dav).await,
        "HEAD" => read::handle_head(&state, dav).await,
        "PUT" => write::handle_put(&state, dav).await,
        "MKCOL" => write::handle_mkcol(&state, dav).await,
        "DELETE" => write::handle_delete(&state, dav).await,
        "PROPFIND" => props::handle_propfind(&state, dav).await,
        "PROPPATCH" => props::handle_proppatch(&state, dav).await,
        "COPY" => tree::handle_copy(&state, dav).await,
        "MOVE" => tree::handle_move(&state, dav).await,
        _ => Ok(capabilities(StatusCode::METHOD_NOT_ALLOWED)),
    };
    result.unwrap_or_else(IntoResponse::into_response)
}

/// Empty response carrying `Allow` and `DAV`.
fn capabilities(status: StatusCode) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(header::ALLOW, HeaderValue::from_static(SUPPORTED_METHODS));
    headers.insert(
        HeaderName::from_static("dav"),
        HeaderValue::from_static(DAV_CLASS),
    );
    response
}

/// Reject requests whose `Authorization` header is not exactly the
/// configured Basic credentials. `OPTIONS` is always let through.
pub async fn require_auth(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        return next.run(req).await;
    }

    let authorized = {
        let expected = state.credentials.expected_header();
        let presented = req
            .headers()
            .get(header::AUTHORIZATION)
            .map(HeaderValue::as_bytes)
            .unwrap_or_default();
        presented.len() == expected.len() && bool::from(presented.ct_eq(expected))
    };
    if !authorized {
        tracing::warn!(method = %req.method(), path = req.uri().path(), "rejected credentials");
        return unauthorized(&state.realm);
    }
    next.run(req).await
}

fn unauthorized(realm: &str) -> Response {
    let mut response = Response::new(Body::from("Unauthorized"));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    let challenge = HeaderValue::from_str(&format!("Basic realm=\"{realm}\""))
        .unwrap_or_else(|_| HeaderValue::from_static("Basic"));
    response
        .headers_mut()
        .insert(header::WWW_AUTHENTICATE, challenge);
    response
}

/// Add the fixed CORS header set to every response.
pub async fn apply_cors(req: Request, next: Next) -> Response {
    let origin = req.headers().get(header::ORIGIN).cloned();
    let mut response = next.run(req).await;

    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        origin.unwrap_or_else(|| HeaderValue::from_static("*")),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(SUPPORTED_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(CORS_ALLOW_HEADERS),
    );
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static(CORS_EXPOSE_HEADERS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("false"),
    );
    headers.insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static(CORS_MAX_AGE),
    );
    response
}
