//! GET and HEAD. Files stream straight from the store; collection URLs
//! render a small HTML index of their direct children.

use super::{AppState, DavRequest, child_prefix};
use crate::{
    errors::AppError,
    models::{
        conditions::{Preconditions, format_http_date},
        object::ObjectRecord,
        property::xml_escape,
        range::ByteRange,
    },
    services::{GetOptions, GetOutcome, ObjectBody, listing::list_all},
};
use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::Response,
};
use chrono::SecondsFormat;
use futures::TryStreamExt;

pub async fn handle_get(state: &AppState, req: DavRequest) -> Result<Response, AppError> {
    let key = req.key();
    if req.is_collection_url() {
        return list_collection(state, &key).await;
    }

    let opts = GetOptions {
        only_if: Preconditions::from_headers(&req.headers),
        range: ByteRange::from_headers(&req.headers),
    };
    match state.store.get(&key, opts).await? {
        GetOutcome::Absent => Err(AppError::not_found()),
        GetOutcome::PreconditionFailed(_) => Err(AppError::precondition_failed()),
        GetOutcome::Found(object) => Ok(object_response(object)),
    }
}

/// Same status and headers as GET, without the payload.
pub async fn handle_head(state: &AppState, req: DavRequest) -> Result<Response, AppError> {
    let response = handle_get(state, req).await?;
    let (parts, _) = response.into_parts();
    Ok(Response::from_parts(parts, Body::empty()))
}

async fn list_collection(state: &AppState, key: &str) -> Result<Response, AppError> {
    let children: Vec<ObjectRecord> = list_all(state.store.clone(), child_prefix(key), false)
        .try_collect()
        .await?;
    tracing::debug!(key, entries = children.len(), "rendering collection index");

    let mut page = String::from("<!DOCTYPE html><html><head><meta charset=\"utf-8\"></head><body>");
    if !key.is_empty() {
        page.push_str("<a href=\"../\">..</a><br>");
    }
    for child in children.iter().filter(|child| child.key != key) {
        let label = child
            .http_metadata
            .content_disposition
            .as_deref()
            .unwrap_or_else(|| child.name());
        page.push_str(&format!(
            "<a href=\"{}\">{}</a><br>",
            xml_escape(&child.href()),
            xml_escape(label)
        ));
    }
    page.push_str("</body></html>");

    let mut response = Response::new(Body::from(page));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    Ok(response)
}

fn object_response(object: ObjectBody) -> Response {
    let ObjectBody {
        record,
        range,
        body,
    } = object;

    let length = range.map(|r| r.len()).unwrap_or(0);
    let partial = range.is_some_and(|r| r.is_partial());

    let mut response = Response::new(Body::from_stream(body));
    *response.status_mut() = if partial {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };

    let headers = response.headers_mut();
    set_object_headers(headers, &record);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    if let Some(range) = range {
        insert_text(headers, header::CONTENT_RANGE, &range.header_value());
    }
    response
}

fn set_object_headers(headers: &mut HeaderMap, record: &ObjectRecord) {
    let http = &record.http_metadata;
    headers.insert(
        header::CONTENT_TYPE,
        http.content_type
            .as_deref()
            .and_then(|v| HeaderValue::from_str(v).ok())
            .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream")),
    );

    let optional = [
        (header::CONTENT_DISPOSITION, &http.content_disposition),
        (header::CONTENT_ENCODING, &http.content_encoding),
        (header::CONTENT_LANGUAGE, &http.content_language),
        (header::CACHE_CONTROL, &http.cache_control),
    ];
    for (name, value) in optional {
        if let Some(value) = value {
            insert_text(headers, name, value);
        }
    }
    if let Some(expiry) = http.cache_expiry {
        insert_text(
            headers,
            HeaderName::from_static("cache-expiry"),
            &expiry.to_rfc3339_opts(SecondsFormat::Millis, true),
        );
    }

    insert_text(headers, header::ETAG, &record.quoted_etag());
    insert_text(
        headers,
        header::LAST_MODIFIED,
        &format_http_date(&record.uploaded_at),
    );
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
}

/// Values that are not valid header text are dropped.
fn insert_text(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Credentials,
        models::object::{HttpMetadata, collection_metadata},
        services::{MemoryStore, ObjectStore, PutOptions, bytes_stream},
    };
    use axum::http::Uri;
    use std::sync::Arc;

    async fn state() -> AppState {
        let store = MemoryStore::new();
        store
            .put(
                "docs",
                bytes_stream(""),
                PutOptions {
                    custom_metadata: collection_metadata(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .put(
                "docs/notes.txt",
                bytes_stream("0123456789"),
                PutOptions {
                    http_metadata: HttpMetadata {
                        content_type: Some("text/plain".into()),
                        content_disposition: Some("<Notes>".into()),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        AppState::new(Arc::new(store), Credentials::new("u", "p"))
    }

    fn request(path: &'static str, headers: &[(&'static str, &'static str)]) -> DavRequest {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(*name, HeaderValue::from_static(*value));
        }
        DavRequest {
            uri: Uri::from_static(path),
            headers: map,
            body: Body::empty(),
        }
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn full_get_sets_object_headers() {
        let state = state().await;
        let response = handle_get(&state, request("/docs/notes.txt", &[]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers[header::CONTENT_LENGTH], "10");
        assert_eq!(headers[header::CONTENT_TYPE], "text/plain");
        assert_eq!(headers[header::CONTENT_RANGE], "bytes 0-9/10");
        assert_eq!(headers[header::ACCEPT_RANGES], "bytes");
        assert!(headers.contains_key(header::ETAG));
        assert_eq!(body_text(response).await, "0123456789");
    }

    #[tokio::test]
    async fn ranged_get_is_partial() {
        let state = state().await;
        let response = handle_get(&state, request("/docs/notes.txt", &[("range", "bytes=2-4")]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 2-4/10");
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "3");
        assert_eq!(body_text(response).await, "234");
    }

    #[tokio::test]
    async fn missing_and_failed_conditions() {
        let state = state().await;
        let err = handle_get(&state, request("/docs/none.txt", &[]))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let err = handle_get(&state, request("/docs/notes.txt", &[("if-match", "\"nope\"")]))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::PRECONDITION_FAILED);
    }

    #[tokio::test]
    async fn head_keeps_headers_and_drops_body() {
        let state = state().await;
        let response = handle_head(&state, request("/docs/notes.txt", &[]))
            .await
            .unwrap();
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "10");
        assert!(body_text(response).await.is_empty());
    }

    #[tokio::test]
    async fn collection_index_links_children() {
        let state = state().await;
        let page = body_text(handle_get(&state, request("/docs/", &[])).await.unwrap()).await;
        assert!(page.contains("<a href=\"../\">..</a>"));
        assert!(page.contains("<a href=\"/docs/notes.txt\">&lt;Notes&gt;</a>"));

        let root = body_text(handle_get(&state, request("/", &[])).await.unwrap()).await;
        assert!(!root.contains(".."));
        assert!(root.contains("<a href=\"/docs/\">docs</a>"));
    }
}
