//! WebDAV method handlers.
//!
//! Every handler receives the shared [`AppState`] and the decomposed request,
//! and answers with a complete response or an [`AppError`](crate::errors::AppError).
//!
//! - `read`    : GET / HEAD, including the HTML collection index
//! - `write`   : PUT / MKCOL / DELETE
//! - `props`   : PROPFIND / PROPPATCH
//! - `tree`    : COPY / MOVE
//! - `dispatch`: method routing, the auth gate and CORS headers

pub mod dispatch;
pub mod props;
pub mod read;
pub mod tree;
pub mod write;

use crate::{
    config::Credentials,
    models::{conditions::parse_http_date, object::HttpMetadata},
    services::ObjectStore,
};
use axum::{
    body::Body,
    http::{HeaderMap, Uri, header},
};
use std::sync::Arc;

/// State shared by all requests. Immutable after start-up.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ObjectStore>,
    pub credentials: Credentials,
    pub realm: String,
    /// Concurrent per-object operations allowed in one COPY/MOVE.
    pub fanout: usize,
}

impl AppState {
    pub fn new(store: Arc<dyn ObjectStore>, credentials: Credentials) -> Self {
        Self {
            store,
            credentials,
            realm: "OBJECTDAV".into(),
            fanout: 32,
        }
    }
}

/// The parts of an inbound request the handlers look at.
pub struct DavRequest {
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Body,
}

impl DavRequest {
    /// Store key addressed by the request path.
    pub fn key(&self) -> String {
        resource_path(self.uri.path())
    }

    /// A trailing slash selects collection (listing) mode.
    pub fn is_collection_url(&self) -> bool {
        self.uri.path().ends_with('/')
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// HTTP metadata to store with an upload, taken from request headers.
    pub fn http_metadata(&self) -> HttpMetadata {
        let text = |name: header::HeaderName| {
            self.headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        HttpMetadata {
            content_type: text(header::CONTENT_TYPE),
            content_disposition: text(header::CONTENT_DISPOSITION),
            content_language: text(header::CONTENT_LANGUAGE),
            content_encoding: text(header::CONTENT_ENCODING),
            cache_control: text(header::CACHE_CONTROL),
            cache_expiry: text(header::EXPIRES).as_deref().and_then(parse_http_date),
        }
    }
}

/// Map a URL path to a store key: drop the leading slash and one trailing
/// slash.
pub fn resource_path(path: &str) -> String {
    let path = path.strip_prefix('/').unwrap_or(path);
    path.strip_suffix('/').unwrap_or(path).to_string()
}

/// Key of the enclosing collection, or `None` when the parent is the root.
pub fn parent_key(key: &str) -> Option<&str> {
    key.rsplit_once('/').map(|(parent, _)| parent)
}

/// Listing prefix for the children of `key`.
pub fn child_prefix(key: &str) -> String {
    if key.is_empty() {
        String::new()
    } else {
        format!("{key}/")
    }
}

/// Value of the `Depth` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    Zero,
    One,
    Infinity,
}

impl Depth {
    /// `Infinity` when absent, `None` for values outside `0`, `1`,
    /// `infinity`.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let Some(value) = headers.get("depth") else {
            return Some(Depth::Infinity);
        };
        match value.to_str().ok()?.trim().to_ascii_lowercase().as_str() {
            "0" => Some(Depth::Zero),
            "1" => Some(Depth::One),
            "infinity" => Some(Depth::Infinity),
            _ => None,
        }
    }
}
