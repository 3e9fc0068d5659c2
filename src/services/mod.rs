//! The object-store capability consumed by the WebDAV handlers.
//!
//! Handlers only ever talk to `dyn ObjectStore`; the two backends are an
//! in-process map (`MemoryStore`) and SQLite metadata with on-disk payloads
//! (`SqliteStore`).

pub mod listing;
pub mod memory_store;
pub mod sqlite_store;

use crate::models::{
    conditions::Preconditions,
    object::{HttpMetadata, ObjectRecord},
    range::{ByteRange, ContentRange},
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, TryStreamExt, stream};
use std::{collections::HashMap, io, pin::Pin};
use thiserror::Error;

pub use memory_store::MemoryStore;
pub use sqlite_store::SqliteStore;

/// Default number of records returned by one `list` call.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

const MAX_OBJECT_KEY_LEN: usize = 1024;

/// Object payloads travel as a boxed byte stream.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid object key `{0}`")]
    InvalidKey(String),
    #[error("invalid listing cursor")]
    InvalidCursor,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    pub only_if: Option<Preconditions>,
    pub range: Option<ByteRange>,
}

/// An object together with (a range of) its payload.
pub struct ObjectBody {
    pub record: ObjectRecord,
    /// The range actually served; `None` for empty objects.
    pub range: Option<ContentRange>,
    pub body: ByteStream,
}

impl ObjectBody {
    /// Buffer the whole body.
    pub async fn bytes(self) -> io::Result<Bytes> {
        collect_body(self.body).await
    }
}

pub enum GetOutcome {
    Absent,
    /// The key exists but the request's preconditions did not hold; no body.
    PreconditionFailed(ObjectRecord),
    Found(ObjectBody),
}

#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub only_if: Option<Preconditions>,
    pub http_metadata: HttpMetadata,
    pub custom_metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub prefix: String,
    /// When set, keys with the delimiter after the prefix are folded away.
    pub delimiter: Option<String>,
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectRecord>,
    pub truncated: bool,
    pub cursor: Option<String>,
}

/// Flat key/value blob storage with prefix listing.
///
/// Stores never mutate a record in place: `put` replaces the whole key.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn head(&self, key: &str) -> StoreResult<Option<ObjectRecord>>;

    async fn get(&self, key: &str, opts: GetOptions) -> StoreResult<GetOutcome>;

    /// Write `body` under `key`. Returns `None` when `opts.only_if` fails.
    async fn put(
        &self,
        key: &str,
        body: ByteStream,
        opts: PutOptions,
    ) -> StoreResult<Option<ObjectRecord>>;

    /// Remove every listed key. Missing keys are ignored.
    async fn delete(&self, keys: &[String]) -> StoreResult<()>;

    async fn list(&self, opts: ListOptions) -> StoreResult<ListPage>;
}

pub fn bytes_stream(bytes: impl Into<Bytes>) -> ByteStream {
    let bytes = bytes.into();
    Box::pin(stream::once(async move { Ok::<_, io::Error>(bytes) }))
}

pub fn empty_stream() -> ByteStream {
    Box::pin(stream::empty::<io::Result<Bytes>>())
}

pub async fn collect_body(body: ByteStream) -> io::Result<Bytes> {
    let buf = body
        .try_fold(BytesMut::new(), |mut buf, chunk| async move {
            buf.extend_from_slice(&chunk);
            Ok(buf)
        })
        .await?;
    Ok(buf.freeze())
}

/// Keys accepted for writes: non-empty, bounded, no leading or trailing
/// slash and no control characters.
pub(crate) fn ensure_key_safe(key: &str) -> StoreResult<()> {
    let invalid = key.is_empty()
        || key.len() > MAX_OBJECT_KEY_LEN
        || key.starts_with('/')
        || key.ends_with('/')
        || key.bytes().any(|b| b.is_ascii_control());
    if invalid {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// True when `key` lies below a deeper level than `prefix` and would be
/// folded into a common prefix by `delimiter`.
pub(crate) fn is_nested(key: &str, prefix: &str, delimiter: &str) -> bool {
    key.strip_prefix(prefix)
        .is_some_and(|rest| rest.contains(delimiter))
}

pub(crate) fn encode_cursor(key: &str) -> String {
    general_purpose::STANDARD.encode(key)
}

pub(crate) fn decode_cursor(cursor: &str) -> StoreResult<String> {
    general_purpose::STANDARD
        .decode(cursor)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or(StoreError::InvalidCursor)
}

/// Lowercase hex MD5 over a stream, consumed chunk by chunk.
pub(crate) struct Digest(md5::Context);

impl Digest {
    pub fn new() -> Self {
        Self(md5::Context::new())
    }

    pub fn consume(&mut self, chunk: &[u8]) {
        self.0.consume(chunk);
    }

    pub fn finish(self) -> String {
        format!("{:x}", self.0.compute())
    }
}

/// Drain a body into memory while computing its etag.
pub(crate) async fn read_with_digest(mut body: ByteStream) -> io::Result<(Bytes, String)> {
    let mut digest = Digest::new();
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        digest.consume(&chunk);
        buf.extend_from_slice(&chunk);
    }
    Ok((buf.freeze(), digest.finish()))
}
