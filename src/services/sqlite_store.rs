//! src/services/sqlite_store.rs
//!
//! SqliteStore: object metadata in SQLite, payload bytes on local disk
//! sharded beneath `base_path/{shard}/{shard}/{md5(key)}`. Hashing the key
//! keeps `a` and `a/b` from fighting over the same directory entry.

use super::{
    ByteStream, DEFAULT_PAGE_SIZE, Digest, GetOptions, GetOutcome, ListOptions, ListPage,
    ObjectBody, ObjectStore, PutOptions, StoreError, StoreResult, decode_cursor, empty_stream,
    encode_cursor, ensure_key_safe, is_nested,
};
use crate::models::{
    object::{HttpMetadata, ObjectRecord},
    range::ContentRange,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use sqlx::{FromRow, QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::{
    io::{self, ErrorKind, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

/// Embedded schema, applied by [`SqliteStore::migrate`].
const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const COLUMNS: &str = "key, size_bytes, etag, uploaded_at, content_type, content_disposition, \
                       content_language, content_encoding, cache_control, cache_expiry, \
                       custom_metadata";

/// Keys per `DELETE ... IN (...)` statement, well under SQLite's bind limit.
const DELETE_BATCH: usize = 500;

#[derive(FromRow)]
struct ObjectRow {
    key: String,
    size_bytes: i64,
    etag: String,
    uploaded_at: DateTime<Utc>,
    content_type: Option<String>,
    content_disposition: Option<String>,
    content_language: Option<String>,
    content_encoding: Option<String>,
    cache_control: Option<String>,
    cache_expiry: Option<DateTime<Utc>>,
    custom_metadata: String,
}

impl TryFrom<ObjectRow> for ObjectRecord {
    type Error = StoreError;

    fn try_from(row: ObjectRow) -> StoreResult<Self> {
        Ok(ObjectRecord {
            key: row.key,
            size: row.size_bytes.max(0) as u64,
            etag: row.etag,
            uploaded_at: row.uploaded_at,
            http_metadata: HttpMetadata {
                content_type: row.content_type,
                content_disposition: row.content_disposition,
                content_language: row.content_language,
                content_encoding: row.content_encoding,
                cache_control: row.cache_control,
                cache_expiry: row.cache_expiry,
            },
            custom_metadata: serde_json::from_str(&row.custom_metadata)?,
        })
    }
}

#[derive(Clone)]
pub struct SqliteStore {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,

    page_size: usize,
}

impl SqliteStore {
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Apply the embedded schema. Idempotent.
    pub async fn migrate(&self) -> StoreResult<()> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        tracing::info!("Running {} migration statements...", statements.len());
        for stmt in statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    /// Two-level shard directories plus file name, all from MD5(key).
    fn object_path(&self, key: &str) -> PathBuf {
        let digest = md5::compute(key);
        let mut path = self.base_path.clone();
        path.push(format!("{:02x}", digest[0]));
        path.push(format!("{:02x}", digest[1]));
        path.push(format!("{:x}", digest));
        path
    }

    async fn fetch_record(&self, key: &str) -> StoreResult<Option<ObjectRecord>> {
        let sql = format!("SELECT {COLUMNS} FROM objects WHERE key = ?");
        let row = sqlx::query_as::<_, ObjectRow>(&sql)
            .bind(key)
            .fetch_optional(&*self.db)
            .await?;
        row.map(ObjectRecord::try_from).transpose()
    }

    /// Rows whose key starts with `prefix`, strictly after `after`, in key order.
    async fn fetch_rows(
        &self,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<ObjectRow>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {COLUMNS} FROM objects WHERE substr(key, 1, "
        ));
        builder.push_bind(prefix.chars().count() as i64);
        builder.push(") = ");
        builder.push_bind(prefix.to_string());
        if let Some(after) = after {
            builder.push(" AND key > ");
            builder.push_bind(after.to_string());
        }
        builder.push(" ORDER BY key ASC LIMIT ");
        builder.push_bind(limit as i64);

        Ok(builder.build_query_as().fetch_all(&*self.db).await?)
    }

    /// Stream a body into a temp file next to its final location.
    ///
    /// Returns the temp path, size and etag. The temp file is removed on error.
    async fn write_temp(
        &self,
        final_path: &Path,
        mut body: ByteStream,
    ) -> StoreResult<(PathBuf, u64, String)> {
        let parent = final_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StoreError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = create_in_shard(&parent, &tmp_path).await?;

        let mut size: u64 = 0;
        let mut digest = Digest::new();
        while let Some(chunk_res) = body.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(StoreError::Io(err));
                }
            };
            size += chunk.len() as u64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }

        Ok((tmp_path, size, digest.finish()))
    }

    /// Remove empty shard directories up to (not including) `base_path`.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.base_path) && current != self.base_path {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

/// Create `path` inside the shard directory `dir`.
///
/// A concurrent delete may prune `dir` between `create_dir_all` and the
/// create, so a `NotFound` gets one more attempt.
async fn create_in_shard(dir: &Path, path: &Path) -> io::Result<File> {
    fs::create_dir_all(dir).await?;
    match File::create(path).await {
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!("shard {} pruned during write, recreating", dir.display());
            fs::create_dir_all(dir).await?;
            File::create(path).await
        }
        other => other,
    }
}

#[async_trait]
impl ObjectStore for SqliteStore {
    async fn head(&self, key: &str) -> StoreResult<Option<ObjectRecord>> {
        self.fetch_record(key).await
    }

    async fn get(&self, key: &str, opts: GetOptions) -> StoreResult<GetOutcome> {
        let Some(record) = self.fetch_record(key).await? else {
            return Ok(GetOutcome::Absent);
        };

        if let Some(only_if) = &opts.only_if {
            if !only_if.evaluate(Some(&record)) {
                return Ok(GetOutcome::PreconditionFailed(record));
            }
        }

        let range = ContentRange::resolve(opts.range.as_ref(), record.size);
        let body: ByteStream = match range {
            None => empty_stream(),
            Some(r) => {
                let mut file = match File::open(self.object_path(key)).await {
                    Ok(file) => file,
                    Err(err) if err.kind() == ErrorKind::NotFound => {
                        debug!("payload for {} missing on disk", key);
                        return Ok(GetOutcome::Absent);
                    }
                    Err(err) => return Err(StoreError::Io(err)),
                };
                file.seek(SeekFrom::Start(r.offset)).await?;
                Box::pin(ReaderStream::new(file.take(r.len())))
            }
        };

        Ok(GetOutcome::Found(ObjectBody {
            record,
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

        if let Some(only_if) = &opts.only_if {
            let current = self.fetch_record(key).await?;
            if !only_if.evaluate(current.as_ref()) {
                return Ok(None);
            }
        }

        let file_path = self.object_path(key);
        let (tmp_path, size, etag) = self.write_temp(&file_path, body).await?;

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&file_path).await?;
                fs::rename(&tmp_path, &file_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::Io(err));
            }
        }

        let custom_metadata = serde_json::to_string(&opts.custom_metadata)?;
        let http = opts.http_metadata;
        let sql = format!(
            r#"
            INSERT INTO objects ({COLUMNS})
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                uploaded_at = excluded.uploaded_at,
                content_type = excluded.content_type,
                content_disposition = excluded.content_disposition,
                content_language = excluded.content_language,
                content_encoding = excluded.content_encoding,
                cache_control = excluded.cache_control,
                cache_expiry = excluded.cache_expiry,
                custom_metadata = excluded.custom_metadata
            RETURNING {COLUMNS}
            "#
        );

        let insert_result = sqlx::query_as::<_, ObjectRow>(&sql)
            .bind(key)
            .bind(size as i64)
            .bind(&etag)
            .bind(Utc::now())
            .bind(http.content_type)
            .bind(http.content_disposition)
            .bind(http.content_language)
            .bind(http.content_encoding)
            .bind(http.cache_control)
            .bind(http.cache_expiry)
            .bind(custom_metadata)
            .fetch_one(&*self.db)
            .await;

        match insert_result {
            Ok(row) => {
                debug!("stored {} ({} bytes) at {}", key, size, file_path.display());
                Ok(Some(row.try_into()?))
            }
            Err(err) => {
                let _ = fs::remove_file(&file_path).await;
                Err(StoreError::Sqlx(err))
            }
        }
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<()> {
        for chunk in keys.chunks(DELETE_BATCH) {
            let mut builder = QueryBuilder::<Sqlite>::new("DELETE FROM objects WHERE key IN (");
            let mut separated = builder.separated(", ");
            for key in chunk {
                separated.push_bind(key.clone());
            }
            separated.push_unseparated(")");
            builder.build().execute(&*self.db).await?;

            for key in chunk {
                let file_path = self.object_path(key);
                match fs::remove_file(&file_path).await {
                    Ok(_) => debug!("removed physical file {}", file_path.display()),
                    Err(err) if err.kind() == ErrorKind::NotFound => {
                        debug!("file {} already missing", file_path.display());
                    }
                    Err(err) => return Err(StoreError::Io(err)),
                }
                if let Some(parent) = file_path.parent() {
                    self.prune_empty_dirs(parent).await;
                }
            }
        }
        Ok(())
    }

    async fn list(&self, opts: ListOptions) -> StoreResult<ListPage> {
        let limit = opts.limit.unwrap_or(self.page_size).max(1);
        let mut after = opts.cursor.as_deref().map(decode_cursor).transpose()?;

        let mut objects: Vec<ObjectRecord> = Vec::new();
        let mut truncated = false;
        // Folded rows are skipped, so a page may need several fetches.
        'fetch: loop {
            let rows = self
                .fetch_rows(&opts.prefix, after.as_deref(), limit + 1)
                .await?;
            let exhausted = rows.len() <= limit;
            for row in rows {
                after = Some(row.key.clone());
                if let Some(delim) = &opts.delimiter {
                    if is_nested(&row.key, &opts.prefix, delim) {
                        continue;
                    }
                }
                if objects.len() == limit {
                    truncated = true;
                    break 'fetch;
                }
                objects.push(row.try_into()?);
            }
            if exhausted {
                break;
            }
        }

        let cursor = if truncated {
            objects.last().map(|r| encode_cursor(&r.key))
        } else {
            None
        };
        Ok(ListPage {
            objects,
            truncated,
            cursor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{object::collection_metadata, range::ByteRange};
    use crate::services::bytes_stream;
    use sqlx::sqlite::SqlitePoolOptions;
    use tempfile::TempDir;

    async fn test_store(page_size: usize) -> (SqliteStore, TempDir) {
        let tmp = TempDir::new().unwrap();
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteStore::new(Arc::new(pool), tmp.path()).with_page_size(page_size);
        store.migrate().await.unwrap();
        (store, tmp)
    }

    #[tokio::test]
    async fn round_trips_payload_and_metadata() {
        let (store, _tmp) = test_store(100).await;
        let mut opts = PutOptions::default();
        opts.http_metadata.content_type = Some("text/plain".into());
        opts.http_metadata.content_language = Some("en".into());
        opts.custom_metadata.insert("author".into(), "ann".into());

        let record = store
            .put("docs/readme.txt", bytes_stream("hello world"), opts)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.size, 11);
        assert_eq!(record.etag, format!("{:x}", md5::compute("hello world")));

        let head = store.head("docs/readme.txt").await.unwrap().unwrap();
        assert_eq!(head.http_metadata.content_language.as_deref(), Some("en"));
        assert_eq!(head.custom_metadata.get("author").map(String::as_str), Some("ann"));

        let opts = GetOptions {
            only_if: None,
            range: Some(ByteRange::Offset {
                offset: 6,
                length: None,
            }),
        };
        let GetOutcome::Found(body) = store.get("docs/readme.txt", opts).await.unwrap() else {
            panic!("expected body");
        };
        assert_eq!(&body.bytes().await.unwrap()[..], b"world");
    }

    #[tokio::test]
    async fn overwrite_replaces_whole_record() {
        let (store, _tmp) = test_store(100).await;
        let mut opts = PutOptions::default();
        opts.custom_metadata.insert("k".into(), "v".into());
        store.put("f", bytes_stream("one"), opts).await.unwrap();
        store
            .put("f", bytes_stream("second"), PutOptions::default())
            .await
            .unwrap();

        let head = store.head("f").await.unwrap().unwrap();
        assert_eq!(head.size, 6);
        assert!(head.custom_metadata.is_empty());
    }

    #[tokio::test]
    async fn empty_markers_have_no_payload_range() {
        let (store, _tmp) = test_store(100).await;
        store
            .put(
                "dir",
                empty_stream(),
                PutOptions {
                    custom_metadata: collection_metadata(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let GetOutcome::Found(body) = store.get("dir", GetOptions::default()).await.unwrap() else {
            panic!("expected marker");
        };
        assert!(body.record.is_collection());
        assert!(body.range.is_none());
        assert!(body.bytes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn listing_pages_and_folds() {
        let (store, _tmp) = test_store(2).await;
        for key in ["a", "a/1", "a/2", "a/3", "a/deep/x", "a/deep/y", "b"] {
            store
                .put(key, bytes_stream("."), PutOptions::default())
                .await
                .unwrap();
        }

        let mut keys = Vec::new();
        let mut cursor = None;
        loop {
            let page = store
                .list(ListOptions {
                    prefix: "a/".into(),
                    delimiter: Some("/".into()),
                    cursor: cursor.clone(),
                    limit: None,
                })
                .await
                .unwrap();
            keys.extend(page.objects.into_iter().map(|r| r.key));
            if !page.truncated {
                break;
            }
            cursor = page.cursor;
        }
        assert_eq!(keys, ["a/1", "a/2", "a/3"]);

        let all = store
            .list(ListOptions {
                prefix: "a/".into(),
                limit: Some(10),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(all.objects.len(), 5);
        assert!(!all.truncated);
    }

    #[tokio::test]
    async fn delete_removes_rows_and_files() {
        let (store, tmp) = test_store(100).await;
        store
            .put("x/y", bytes_stream("data"), PutOptions::default())
            .await
            .unwrap();
        let path = store.object_path("x/y");
        assert!(path.exists());

        store
            .delete(&["x/y".to_string(), "nope".to_string()])
            .await
            .unwrap();
        assert!(store.head("x/y").await.unwrap().is_none());
        assert!(!path.exists());
        assert!(tmp.path().exists());
    }

    #[tokio::test]
    async fn shard_is_recreated_after_prune() {
        let tmp = TempDir::new().unwrap();
        let shard = tmp.path().join("ab").join("cd");
        fs::create_dir_all(&shard).await.unwrap();
        fs::remove_dir(&shard).await.unwrap();

        let file = create_in_shard(&shard, &shard.join(".tmp-x")).await.unwrap();
        drop(file);
        assert!(shard.join(".tmp-x").exists());
    }

    #[tokio::test]
    async fn puts_survive_concurrent_deletes() {
        let (store, _tmp) = test_store(100).await;
        let store = Arc::new(store);
        for i in 0..64 {
            store
                .put(&format!("src/{i}"), bytes_stream("x"), PutOptions::default())
                .await
                .unwrap();
        }

        let tasks = (0..64).map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .put(&format!("dst/{i}"), bytes_stream("x"), PutOptions::default())
                    .await?;
                store.delete(&[format!("src/{i}")]).await
            })
        });
        for task in futures::future::join_all(tasks).await {
            task.unwrap().unwrap();
        }
        for i in 0..64 {
            assert!(store.head(&format!("dst/{i}")).await.unwrap().is_some());
            assert!(store.head(&format!("src/{i}")).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn rejects_unsafe_keys() {
        let (store, _tmp) = test_store(100).await;
        let err = store
            .put("/abs", bytes_stream("x"), PutOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
    }
}
