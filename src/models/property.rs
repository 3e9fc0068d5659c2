//! DAV property sets derived from object records.

use chrono::Utc;

use super::conditions::format_http_date;
use super::object::{COLLECTION_MARKER, ObjectRecord, RESOURCETYPE_KEY};

/// A property value as it is written into a `<prop>` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropValue {
    /// Character data, escaped on output.
    Text(String),
    /// Pre-formed XML content, written verbatim.
    Markup(&'static str),
}

/// Ordered mapping from lower-cased property name to value.
///
/// Properties with no value are never inserted, so they never show up as
/// empty elements.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertySet {
    entries: Vec<(String, PropValue)>,
}

impl PropertySet {
    /// Properties of the implicit root collection.
    pub fn root() -> Self {
        let now = format_http_date(&Utc::now());
        let mut set = PropertySet::default();
        set.text("creationdate", Some(now.clone()));
        set.text("getcontentlength", Some("0".into()));
        set.text("getlastmodified", Some(now));
        set.markup("resourcetype", COLLECTION_MARKER);
        set
    }

    pub fn from_record(record: &ObjectRecord) -> Self {
        let http = &record.http_metadata;
        let uploaded = format_http_date(&record.uploaded_at);

        let mut set = PropertySet::default();
        set.text("creationdate", Some(uploaded.clone()));
        set.text("displayname", http.content_disposition.clone());
        set.text("getcontentlanguage", http.content_language.clone());
        set.text("getcontentlength", Some(record.size.to_string()));
        set.text("getcontenttype", http.content_type.clone());
        set.text("getetag", Some(record.quoted_etag()));
        set.text("getlastmodified", Some(uploaded));
        if record.is_collection() {
            set.markup("resourcetype", COLLECTION_MARKER);
        } else {
            set.markup("resourcetype", "");
        }

        let mut dead: Vec<_> = record
            .custom_metadata
            .iter()
            .filter(|(name, _)| name.as_str() != RESOURCETYPE_KEY && is_xml_name(name))
            .collect();
        dead.sort();
        for (name, value) in dead {
            if set.get(name).is_none() {
                set.text(name, Some(value.clone()));
            }
        }
        set
    }

    fn text(&mut self, name: &str, value: Option<String>) {
        if let Some(value) = value {
            self.entries.push((name.to_string(), PropValue::Text(value)));
        }
    }

    fn markup(&mut self, name: &str, value: &'static str) {
        self.entries
            .push((name.to_string(), PropValue::Markup(value)));
    }

    pub fn get(&self, name: &str) -> Option<&PropValue> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Serialize as a sequence of `<name>value</name>` elements.
    pub fn to_xml(&self) -> String {
        let mut xml = String::new();
        for (name, value) in &self.entries {
            let body = match value {
                PropValue::Text(text) => xml_escape(text),
                PropValue::Markup(markup) => (*markup).to_string(),
            };
            xml.push_str(&format!("<{name}>{body}</{name}>"));
        }
        xml
    }
}

/// Conservative check that `name` can be used as an element name.
pub fn is_xml_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

pub fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
