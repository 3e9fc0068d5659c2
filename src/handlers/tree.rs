//! COPY and MOVE.
//!
//! Both methods share one engine. Every request is validated completely
//! before the first write; after that, per-object transfers run concurrently
//! (bounded by the configured fan-out) and are awaited together. A failed
//! member does not stop its siblings and nothing is rolled back.

use super::{
    AppState, DavRequest, Depth, child_prefix, parent_key, resource_path,
    write::{delete_resource, status_only},
};
use crate::{
    errors::AppError,
    services::{
        GetOptions, GetOutcome, ObjectStore, PutOptions, StoreError, StoreResult,
        listing::list_all,
    },
};
use axum::{
    http::{StatusCode, Uri},
    response::Response,
};
use futures::{StreamExt, TryStreamExt, stream};
use std::{io, sync::Arc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Copy,
    /// Copy, then delete each source key once its copy is written.
    Move,
}

/// Result of fanning a transfer out over a subtree.
#[derive(Debug, Default)]
pub struct TreeOutcome {
    pub completed: usize,
    /// Source keys whose transfer failed.
    pub failed: Vec<String>,
}

impl TreeOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn into_result(self) -> Result<usize, AppError> {
        if self.is_complete() {
            return Ok(self.completed);
        }
        Err(AppError::internal(format!(
            "{} of {} transfers failed: {}",
            self.failed.len(),
            self.failed.len() + self.completed,
            self.failed.join(", ")
        )))
    }
}

pub async fn handle_copy(state: &AppState, req: DavRequest) -> Result<Response, AppError> {
    transfer(state, req, TransferMode::Copy).await
}

pub async fn handle_move(state: &AppState, req: DavRequest) -> Result<Response, AppError> {
    transfer(state, req, TransferMode::Move).await
}

async fn transfer(
    state: &AppState,
    req: DavRequest,
    mode: TransferMode,
) -> Result<Response, AppError> {
    let store = &state.store;
    let source = req.key();
    let destination = destination_key(&req).ok_or_else(AppError::bad_request)?;
    if destination.is_empty() {
        return Err(AppError::bad_request());
    }

    let parent_missing = match parent_key(&destination) {
        Some(parent) => store.head(parent).await?.is_none(),
        None => false,
    };
    if parent_missing {
        return Err(AppError::conflict());
    }

    let destination_exists = store.head(&destination).await?.is_some();
    let may_overwrite = {
        let overwrite = req.header("overwrite").map(str::trim);
        match mode {
            TransferMode::Copy => overwrite != Some("F"),
            TransferMode::Move => overwrite == Some("T"),
        }
    };
    if destination_exists && !may_overwrite {
        return Err(AppError::precondition_failed());
    }

    let record = store.head(&source).await?.ok_or_else(AppError::not_found)?;
    if mode == TransferMode::Move && source == destination {
        return Err(AppError::bad_request());
    }
    if overlaps(&source, &destination) {
        return Err(AppError::bad_request());
    }
    let recursive = if record.is_collection() {
        match Depth::from_headers(&req.headers) {
            Some(Depth::Zero) => false,
            Some(Depth::Infinity) => true,
            Some(Depth::One) | None => return Err(AppError::bad_request()),
        }
    } else {
        false
    };

    if mode == TransferMode::Move && destination_exists {
        delete_resource(store, &destination).await?;
    }

    let mut plan = vec![(source.clone(), destination.clone())];
    if recursive {
        let descendants: Vec<String> = list_all(store.clone(), child_prefix(&source), true)
            .map_ok(|child| child.key)
            .try_collect()
            .await?;
        plan.extend(descendants.into_iter().map(|key| {
            let target = format!("{destination}{}", &key[source.len()..]);
            (key, target)
        }));
    }
    tracing::debug!(
        source = %source,
        destination = %destination,
        ?mode,
        objects = plan.len(),
        "transfer planned"
    );

    let outcome = run_plan(store, plan, mode, state.fanout).await;
    let moved = outcome.into_result()?;
    tracing::info!(
        source = %source,
        destination = %destination,
        ?mode,
        objects = moved,
        "transfer finished"
    );

    Ok(status_only(if destination_exists {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::CREATED
    }))
}

/// Store key named by the `Destination` header, which may be an absolute
/// URL or a bare path.
fn destination_key(req: &DavRequest) -> Option<String> {
    let uri: Uri = req.header("destination")?.parse().ok()?;
    Some(resource_path(uri.path()))
}

/// True when one key lies inside the other's subtree.
fn overlaps(source: &str, destination: &str) -> bool {
    destination.starts_with(&child_prefix(source)) || source.starts_with(&child_prefix(destination))
}

async fn run_plan(
    store: &Arc<dyn ObjectStore>,
    plan: Vec<(String, String)>,
    mode: TransferMode,
    fanout: usize,
) -> TreeOutcome {
    stream::iter(plan)
        .map(|(from, to)| {
            let store = store.clone();
            async move {
                let result = transfer_one(store.as_ref(), &from, &to, mode).await;
                (from, result)
            }
        })
        .buffer_unordered(fanout.max(1))
        .fold(TreeOutcome::default(), |mut outcome, (key, result)| async move {
            match result {
                Ok(()) => outcome.completed += 1,
                Err(err) => {
                    tracing::error!(key = %key, error = %err, "object transfer failed");
                    outcome.failed.push(key);
                }
            }
            outcome
        })
        .await
}

async fn transfer_one(
    store: &dyn ObjectStore,
    from: &str,
    to: &str,
    mode: TransferMode,
) -> StoreResult<()> {
    let object = match store.get(from, GetOptions::default()).await? {
        GetOutcome::Found(object) => object,
        GetOutcome::Absent | GetOutcome::PreconditionFailed(_) => {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("`{from}` disappeared during transfer"),
            )));
        }
    };
    let opts = PutOptions {
        only_if: None,
        http_metadata: object.record.http_metadata.clone(),
        custom_metadata: object.record.custom_metadata.clone(),
    };
    store.put(to, object.body, opts).await?;
    if mode == TransferMode::Move {
        store.delete(&[from.to_string()]).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Credentials,
        models::object::collection_metadata,
        services::{MemoryStore, bytes_stream},
    };
    use axum::{
        body::Body,
        http::{HeaderMap, HeaderValue},
    };

    async fn state() -> (AppState, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::with_page_size(2));
        let marker = PutOptions {
            custom_metadata: collection_metadata(),
            ..Default::default()
        };
        for key in ["src", "src/nested", "dst"] {
            store.put(key, bytes_stream(""), marker.clone()).await.unwrap();
        }
        for key in ["src/a.txt", "src/b.txt", "src/nested/c.txt", "dst/old.txt"] {
            store
                .put(key, bytes_stream(key.to_string()), PutOptions::default())
                .await
                .unwrap();
        }
        let state = AppState::new(store.clone(), Credentials::new("u", "p"));
        (state, store)
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

    fn status(result: Result<Response, AppError>) -> StatusCode {
        match result {
            Ok(response) => response.status(),
            Err(err) => err.status,
        }
    }

    #[tokio::test]
    async fn copy_subtree_keeps_source() {
        let (state, store) = state().await;
        let req = request("/src", &[("destination", "http://dav.example/copy/")]);
        assert_eq!(status(handle_copy(&state, req).await), StatusCode::CREATED);

        let keys = store.keys().await;
        for key in ["copy", "copy/a.txt", "copy/nested", "copy/nested/c.txt", "src/a.txt"] {
            assert!(keys.iter().any(|k| k == key), "missing {key}");
        }
        let copied = store.head("copy/nested").await.unwrap().unwrap();
        assert!(copied.is_collection());
    }

    #[tokio::test]
    async fn copy_depth_zero_copies_marker_only() {
        let (state, store) = state().await;
        let req = request("/src", &[("destination", "/solo"), ("depth", "0")]);
        assert_eq!(status(handle_copy(&state, req).await), StatusCode::CREATED);
        assert!(store.head("solo").await.unwrap().unwrap().is_collection());
        assert!(!store.keys().await.iter().any(|k| k.starts_with("solo/")));

        let req = request("/src", &[("destination", "/other"), ("depth", "1")]);
        assert_eq!(status(handle_copy(&state, req).await), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn move_replaces_destination_tree() {
        let (state, store) = state().await;
        let req = request("/src", &[("destination", "/dst")]);
        assert_eq!(
            status(handle_move(&state, req).await),
            StatusCode::PRECONDITION_FAILED
        );

        let req = request("/src", &[("destination", "/dst"), ("overwrite", "T")]);
        assert_eq!(status(handle_move(&state, req).await), StatusCode::NO_CONTENT);
        assert_eq!(
            store.keys().await,
            ["dst", "dst/a.txt", "dst/b.txt", "dst/nested", "dst/nested/c.txt"]
        );
    }

    #[tokio::test]
    async fn move_carries_metadata_and_payload() {
        let (state, store) = state().await;
        let mut opts = PutOptions::default();
        opts.http_metadata.content_type = Some("text/markdown".into());
        opts.http_metadata.content_disposition = Some("attachment; filename=a.md".into());
        opts.custom_metadata.insert("author".into(), "ann".into());
        store
            .put("src/a.txt", bytes_stream("# notes"), opts)
            .await
            .unwrap();
        let before = store.head("src/a.txt").await.unwrap().unwrap();

        let req = request("/src", &[("destination", "/moved"), ("depth", "infinity")]);
        assert_eq!(status(handle_move(&state, req).await), StatusCode::CREATED);

        let after = store.head("moved/a.txt").await.unwrap().unwrap();
        assert_eq!(after.http_metadata, before.http_metadata);
        assert_eq!(after.custom_metadata, before.custom_metadata);
        assert_eq!(after.etag, before.etag);
        let GetOutcome::Found(body) = store
            .get("moved/a.txt", GetOptions::default())
            .await
            .unwrap()
        else {
            panic!("moved object missing");
        };
        assert_eq!(&body.bytes().await.unwrap()[..], b"# notes");
        assert!(store.head("moved/nested").await.unwrap().unwrap().is_collection());
        assert!(!store.keys().await.iter().any(|k| k == "src" || k.starts_with("src/")));
    }

    #[tokio::test]
    async fn copy_honours_overwrite_false() {
        let (state, _) = state().await;
        let req = request("/src/a.txt", &[("destination", "/dst/old.txt"), ("overwrite", "F")]);
        assert_eq!(
            status(handle_copy(&state, req).await),
            StatusCode::PRECONDITION_FAILED
        );
        let req = request("/src/a.txt", &[("destination", "/dst/old.txt")]);
        assert_eq!(status(handle_copy(&state, req).await), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn validation_precedes_mutation() {
        let (state, store) = state().await;
        let before = store.keys().await;

        let cases = [
            (request("/src", &[]), StatusCode::BAD_REQUEST),
            (request("/src", &[("destination", "/")]), StatusCode::BAD_REQUEST),
            (request("/src", &[("destination", "/none/x")]), StatusCode::CONFLICT),
            (request("/gone", &[("destination", "/x")]), StatusCode::NOT_FOUND),
            (request("/src", &[("destination", "/src/nested/x")]), StatusCode::BAD_REQUEST),
        ];
        for (req, expected) in cases {
            assert_eq!(status(handle_copy(&state, req).await), expected);
        }
        let req = request("/dst", &[("destination", "/dst"), ("overwrite", "T")]);
        assert_eq!(status(handle_move(&state, req).await), StatusCode::BAD_REQUEST);

        assert_eq!(store.keys().await, before);
    }

    #[test]
    fn outcome_reports_failed_keys() {
        let outcome = TreeOutcome {
            completed: 2,
            failed: vec!["a/x".into()],
        };
        assert!(!outcome.is_complete());
        let err = outcome.into_result().unwrap_err();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.message.contains("a/x"));
        assert_eq!(TreeOutcome::default().into_result().unwrap(), 0);
    }
}
