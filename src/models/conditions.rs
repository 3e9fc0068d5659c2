//! Conditional-request preconditions (`If-Match` and friends).
//!
//! The store evaluates these itself, the way it would for any client, so both
//! backends share one implementation.

use axum::http::{HeaderMap, header};
use chrono::{DateTime, Utc};

use super::object::ObjectRecord;

/// Entity-tag list from an `If-Match` / `If-None-Match` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EtagCondition {
    Any,
    Tags(Vec<String>),
}

impl EtagCondition {
    fn parse(value: &str) -> Self {
        if value.trim() == "*" {
            return EtagCondition::Any;
        }
        let tags = value
            .split(',')
            .map(|tag| strip_etag(tag).to_string())
            .filter(|tag| !tag.is_empty())
            .collect();
        EtagCondition::Tags(tags)
    }

    fn matches(&self, etag: &str) -> bool {
        match self {
            EtagCondition::Any => true,
            EtagCondition::Tags(tags) => tags.iter().any(|t| t == etag),
        }
    }
}

/// Strip the weak prefix and surrounding quotes from an entity tag.
fn strip_etag(tag: &str) -> &str {
    let tag = tag.trim();
    let tag = tag.strip_prefix("W/").unwrap_or(tag);
    tag.strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(tag)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preconditions {
    pub if_match: Option<EtagCondition>,
    pub if_none_match: Option<EtagCondition>,
    pub if_modified_since: Option<DateTime<Utc>>,
    pub if_unmodified_since: Option<DateTime<Utc>>,
}

impl Preconditions {
    /// Collect preconditions from request headers. Returns `None` when the
    /// request carries none, so stores can skip evaluation entirely.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let text = |name: header::HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let date = |name: header::HeaderName| text(name).as_deref().and_then(parse_http_date);

        let conditions = Preconditions {
            if_match: text(header::IF_MATCH).map(|v| EtagCondition::parse(&v)),
            if_none_match: text(header::IF_NONE_MATCH).map(|v| EtagCondition::parse(&v)),
            if_modified_since: date(header::IF_MODIFIED_SINCE),
            if_unmodified_since: date(header::IF_UNMODIFIED_SINCE),
        };

        (conditions != Preconditions::default()).then_some(conditions)
    }

    /// Evaluate against the current version of a key (`None` when absent).
    ///
    /// An absent key fails `If-Match` and passes `If-None-Match`; date
    /// conditions only constrain existing keys.
    pub fn evaluate(&self, current: Option<&ObjectRecord>) -> bool {
        let Some(record) = current else {
            return self.if_match.is_none();
        };

        if let Some(cond) = &self.if_match {
            if !cond.matches(&record.etag) {
                return false;
            }
        }
        if let Some(cond) = &self.if_none_match {
            if cond.matches(&record.etag) {
                return false;
            }
        }

        // HTTP dates carry whole seconds only.
        let uploaded = record.uploaded_at.timestamp();
        if let Some(since) = self.if_modified_since {
            if uploaded <= since.timestamp() {
                return false;
            }
        }
        if let Some(since) = self.if_unmodified_since {
            if uploaded > since.timestamp() {
                return false;
            }
        }
        true
    }
}

/// Parse an IMF-fixdate / RFC 2822 style HTTP date.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Format a timestamp the way HTTP headers and DAV properties expect.
pub fn format_http_date(at: &DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
