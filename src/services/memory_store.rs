//! MemoryStore: the whole bucket in a `BTreeMap`, ordered by key.
//!
//! Used by the test suite and by `--backend memory` for throwaway servers.

use super::{
    ByteStream, DEFAULT_PAGE_SIZE, GetOptions, GetOutcome, ListOptions, ListPage, ObjectBody,
    ObjectStore, PutOptions, StoreResult, bytes_stream, decode_cursor, empty_stream,
    encode_cursor, ensure_key_safe, is_nested, read_with_digest,
};
use crate::models::{object::ObjectRecord, range::ContentRange};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::{collections::BTreeMap, ops::Bound};
use tokio::sync::RwLock;
use tracing::debug;

struct StoredObject {
    record: ObjectRecord,
    data: Bytes,
}

pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, StoredObject>>,
    page_size: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    /// A store whose `list` pages hold at most `page_size` records.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            page_size: page_size.max(1),
        }
    }

    /// Every key currently stored, in order.
    pub async fn keys(&self) -> Vec<String> {
        self.objects.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn head(&self, key: &str) -> StoreResult<Option<ObjectRecord>> {
        let objects = self.objects.read().await;
        Ok(objects.get(key).map(|o| o.record.clone()))
    }

    async fn get(&self, key: &str, opts: GetOptions) -> StoreResult<GetOutcome> {
        let objects = self.objects.read().await;
        let Some(object) = objects.get(key) else {
            return Ok(GetOutcome::Absent);
        };

        if let Some(only_if) = &opts.only_if {
            if !only_if.evaluate(Some(&object.record)) {
                return Ok(GetOutcome::PreconditionFailed(object.record.clone()));
            }
        }

        let range = ContentRange::resolve(opts.range.as_ref(), object.record.size);
        let body = match range {
            Some(r) => bytes_stream(object.data.slice(r.offset as usize..=r.end as usize)),
            None => empty_stream(),
        };

        Ok(GetOutcome::Found(ObjectBody {
            record: object.record.clone(),
            range,
            body,
        }))
    }

    async fn put(
        &self,
        key: &str,
        body: ByteStream,
        opts: PutOptions,
    ) -> StoreResult<Option<ObjectRecord>> {
        ensure_key_safe(key)?;
        let (data, etag) = read_with_digest(body).await?;

        let mut objects = self.objects.write().await;
        if let Some(only_if) = &opts.only_if {
            if !only_if.evaluate(objects.get(key).map(|o| &o.record)) {
                return Ok(None);
            }
        }

        let record = ObjectRecord {
            key: key.to_string(),
            size: data.len() as u64,
            uploaded_at: Utc::now(),
            etag,
            http_metadata: opts.http_metadata,
            custom_metadata: opts.custom_metadata,
        };
        objects.insert(
            key.to_string(),
            StoredObject {
                record: record.clone(),
                data,
            },
        );
        debug!("stored {} ({} bytes)", key, record.size);
        Ok(Some(record))
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<()> {
        let mut objects = self.objects.write().await;
        for key in keys {
            objects.remove(key);
        }
        Ok(())
    }

    async fn list(&self, opts: ListOptions) -> StoreResult<ListPage> {
        let limit = opts.limit.unwrap_or(self.page_size).max(1);
        let start = match &opts.cursor {
            Some(cursor) => Bound::Excluded(decode_cursor(cursor)?),
            None => Bound::Included(opts.prefix.clone()),
        };

        let objects = self.objects.read().await;
        let mut matching = objects
            .range::<String, _>((start, Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(&opts.prefix))
            .filter(|(key, _)| match &opts.delimiter {
                Some(delim) => !is_nested(key, &opts.prefix, delim),
                None => true,
            })
            .peekable();

        let mut page = Vec::new();
        while page.len() < limit {
            match matching.next() {
                Some((_, object)) => page.push(object.record.clone()),
                None => break,
            }
        }

        let truncated = matching.peek().is_some();
        let cursor = if truncated {
            page.last().map(|r: &ObjectRecord| encode_cursor(&r.key))
        } else {
            None
        };

        Ok(ListPage {
            objects: page,
            truncated,
            cursor,
        })
    }
}
