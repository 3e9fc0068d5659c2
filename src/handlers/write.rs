//! PUT, MKCOL and DELETE.

use super::{AppState, DavRequest, child_prefix, parent_key};
use crate::{
    errors::AppError,
    models::{conditions::Preconditions, object::collection_metadata},
    services::{
        ByteStream, ObjectStore, PutOptions, StoreResult, empty_stream, listing::list_pages,
    },
};
use axum::{
    body::Body,
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use futures::{StreamExt, TryStreamExt};
use std::{collections::HashMap, io, pin::pin, sync::Arc};

/// Upload a file. The parent collection must already exist.
pub async fn handle_put(state: &AppState, req: DavRequest) -> Result<Response, AppError> {
    if req.is_collection_url() {
        return Err(AppError::method_not_allowed());
    }
    let key = req.key();
    let existing = state.store.head(&key).await?;
    if existing.is_some_and(|record| record.is_collection()) {
        return Err(AppError::method_not_allowed());
    }
    if !parent_is_collection(state.store.as_ref(), &key).await? {
        return Err(AppError::conflict());
    }

    let opts = PutOptions {
        only_if: Preconditions::from_headers(&req.headers),
        http_metadata: req.http_metadata(),
        custom_metadata: HashMap::new(),
    };
    let body: ByteStream = Box::pin(
        req.body
            .into_data_stream()
            .map(|chunk| chunk.map_err(io::Error::other)),
    );

    let Some(record) = state.store.put(&key, body, opts).await? else {
        return Err(AppError::precondition_failed());
    };
    tracing::info!(key = %record.key, size = record.size, "stored object");

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::CREATED;
    if let Ok(etag) = HeaderValue::from_str(&record.quoted_etag()) {
        response.headers_mut().insert(header::ETAG, etag);
    }
    Ok(response)
}

/// Create a collection marker.
pub async fn handle_mkcol(state: &AppState, req: DavRequest) -> Result<Response, AppError> {
    let key = req.key();
    if key.is_empty() || state.store.head(&key).await?.is_some() {
        return Err(AppError::method_not_allowed());
    }
    let parent_missing = match parent_key(&key) {
        Some(parent) => state.store.head(parent).await?.is_none(),
        None => false,
    };
    if parent_missing {
        return Err(AppError::conflict());
    }

    let opts = PutOptions {
        only_if: None,
        http_metadata: req.http_metadata(),
        custom_metadata: collection_metadata(),
    };
    if state.store.put(&key, empty_stream(), opts).await?.is_none() {
        return Err(AppError::precondition_failed());
    }
    tracing::info!(key = %key, "created collection");
    Ok(status_only(StatusCode::CREATED))
}

pub async fn handle_delete(state: &AppState, req: DavRequest) -> Result<Response, AppError> {
    let key = req.key();
    if key.is_empty() {
        let removed = delete_prefix(&state.store, "").await?;
        tracing::info!(removed, "cleared store");
        return Ok(status_only(StatusCode::NO_CONTENT));
    }
    if !delete_resource(&state.store, &key).await? {
        return Err(AppError::not_found());
    }
    tracing::info!(key = %key, "deleted resource");
    Ok(status_only(StatusCode::NO_CONTENT))
}

/// Delete `key` and, when it is a collection, everything below it.
///
/// Returns `false` when nothing is stored under `key`.
pub(crate) async fn delete_resource(store: &Arc<dyn ObjectStore>, key: &str) -> StoreResult<bool> {
    let Some(record) = store.head(key).await? else {
        return Ok(false);
    };
    store.delete(&[record.key.clone()]).await?;
    if record.is_collection() {
        delete_prefix(store, &child_prefix(key)).await?;
    }
    Ok(true)
}

/// Batch-delete every key under `prefix`, one store page at a time.
pub(crate) async fn delete_prefix(store: &Arc<dyn ObjectStore>, prefix: &str) -> StoreResult<usize> {
    let mut pages = pin!(list_pages(store.clone(), prefix, true));
    let mut removed = 0;
    while let Some(page) = pages.try_next().await? {
        if page.is_empty() {
            continue;
        }
        let keys: Vec<String> = page.into_iter().map(|record| record.key).collect();
        store.delete(&keys).await?;
        removed += keys.len();
    }
    Ok(removed)
}

/// The root always qualifies; any other parent must be a collection marker.
async fn parent_is_collection(store: &dyn ObjectStore, key: &str) -> StoreResult<bool> {
    match parent_key(key) {
        None => Ok(true),
        Some(parent) => Ok(store
            .head(parent)
            .await?
            .is_some_and(|record| record.is_collection())),
    }
}

pub(crate) fn status_only(status: StatusCode) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}
