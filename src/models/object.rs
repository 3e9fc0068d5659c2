//! Represents an object (file or collection marker) held by the store.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Custom-metadata key that flags a collection marker.
pub const RESOURCETYPE_KEY: &str = "resourcetype";

/// The only value of [`RESOURCETYPE_KEY`] that makes a key a directory.
pub const COLLECTION_MARKER: &str = "<collection />";

/// Whether a key names a plain file or a directory marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    File,
    Collection,
}

impl ResourceKind {
    pub fn is_collection(self) -> bool {
        matches!(self, ResourceKind::Collection)
    }
}

/// HTTP-facing metadata stored alongside the object payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HttpMetadata {
    pub content_type: Option<String>,
    pub content_disposition: Option<String>,
    pub content_language: Option<String>,
    pub content_encoding: Option<String>,
    pub cache_control: Option<String>,
    pub cache_expiry: Option<DateTime<Utc>>,
}

/// A single stored object, as reported by `head`, `get` and `list`.
///
/// Records are immutable values: every change is a full rewrite of the key.
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectRecord {
    /// Store key (no leading or trailing slash).
    pub key: String,

    /// Payload size in bytes. Always 0 for collection markers.
    pub size: u64,

    /// When this version of the key was written.
    pub uploaded_at: DateTime<Utc>,

    /// MD5 of the payload, lowercase hex, unquoted.
    pub etag: String,

    pub http_metadata: HttpMetadata,

    /// Free-form string metadata, including the collection marker.
    pub custom_metadata: HashMap<String, String>,
}

impl ObjectRecord {
    pub fn kind(&self) -> ResourceKind {
        match self.custom_metadata.get(RESOURCETYPE_KEY) {
            Some(value) if value == COLLECTION_MARKER => ResourceKind::Collection,
            _ => ResourceKind::File,
        }
    }

    pub fn is_collection(&self) -> bool {
        self.kind().is_collection()
    }

    /// Last path segment of the key.
    pub fn name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }

    /// Absolute href for this record; collections carry a trailing slash.
    pub fn href(&self) -> String {
        if self.is_collection() {
            format!("/{}/", self.key)
        } else {
            format!("/{}", self.key)
        }
    }

    /// Quoted entity tag, as sent in `ETag` headers.
    pub fn quoted_etag(&self) -> String {
        format!("\"{}\"", self.etag)
    }
}

/// Custom metadata that marks a key as a collection.
pub fn collection_metadata() -> HashMap<String, String> {
    HashMap::from([(RESOURCETYPE_KEY.to_string(), COLLECTION_MARKER.to_string())])
}

#[cfg(test)]
pub(crate) fn test_record(key: &str, size: u64) -> ObjectRecord {
    ObjectRecord {
        key: key.to_string(),
        size,
        uploaded_at: Utc::now(),
        etag: "0123456789abcdef0123456789abcdef".into(),
        http_metadata: HttpMetadata::default(),
        custom_metadata: HashMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_value_decides_kind() {
        let mut record = test_record("docs", 0);
        assert_eq!(record.kind(), ResourceKind::File);

        record
            .custom_metadata
            .insert(RESOURCETYPE_KEY.into(), "collection".into());
        assert_eq!(record.kind(), ResourceKind::File);

        record.custom_metadata = collection_metadata();
        assert_eq!(record.kind(), ResourceKind::Collection);
    }

    #[test]
    fn href_marks_collections_with_trailing_slash() {
        let mut record = test_record("a/b", 0);
        assert_eq!(record.href(), "/a/b");
        assert_eq!(record.name(), "b");

        record.custom_metadata = collection_metadata();
        assert_eq!(record.href(), "/a/b/");
    }
}
