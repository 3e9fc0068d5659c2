//! Lazy, cursor-following enumeration of everything under a prefix.

use super::{ListOptions, ObjectStore, StoreError, StoreResult};
use crate::models::object::ObjectRecord;
use futures::{Stream, TryStreamExt, stream};
use std::sync::Arc;

enum PageState {
    Start,
    Next(String),
    Done,
}

/// One item per store page. Each call starts paging from scratch.
///
/// Non-recursive listings rely on the store's `/` delimiter to hide keys
/// below the first level.
pub fn list_pages(
    store: Arc<dyn ObjectStore>,
    prefix: impl Into<String>,
    recursive: bool,
) -> impl Stream<Item = StoreResult<Vec<ObjectRecord>>> + Send + 'static {
    let prefix = prefix.into();
    stream::try_unfold(PageState::Start, move |state| {
        let store = store.clone();
        let prefix = prefix.clone();
        async move {
            let cursor = match state {
                PageState::Done => return Ok(None),
                PageState::Start => None,
                PageState::Next(cursor) => Some(cursor),
            };

            let page = store
                .list(ListOptions {
                    prefix,
                    delimiter: (!recursive).then(|| "/".to_string()),
                    cursor,
                    limit: None,
                })
                .await?;

            let next = match (page.truncated, page.cursor) {
                (true, Some(cursor)) => PageState::Next(cursor),
                _ => PageState::Done,
            };
            Ok::<_, StoreError>(Some((page.objects, next)))
        }
    })
}

/// Every record under `prefix`, in store order.
pub fn list_all(
    store: Arc<dyn ObjectStore>,
    prefix: impl Into<String>,
    recursive: bool,
) -> impl Stream<Item = StoreResult<ObjectRecord>> + Send + 'static {
    list_pages(store, prefix, recursive)
        .map_ok(|objects| stream::iter(objects.into_iter().map(Ok)))
        .try_flatten()
}
