//! Byte ranges: parsing the `Range` header and resolving it against an object size.

use axum::http::{HeaderMap, header};

/// A requested byte range, before the object size is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// Explicit start, optional length (`bytes=a-b`, `bytes=a-`).
    Offset { offset: u64, length: Option<u64> },
    /// Last `n` bytes (`bytes=-n`).
    Suffix(u64),
}

impl ByteRange {
    /// Parse a single-range `Range` header value.
    ///
    /// Multi-range and malformed values yield `None`; the caller then serves
    /// the whole object.
    pub fn parse(value: &str) -> Option<Self> {
        let ranges = value.trim().strip_prefix("bytes=")?.trim();
        if ranges.contains(',') {
            return None;
        }

        let (start, end) = ranges.split_once('-')?;
        match (start.trim(), end.trim()) {
            ("", suffix) => {
                let n: u64 = suffix.parse().ok()?;
                (n > 0).then_some(ByteRange::Suffix(n))
            }
            (start, "") => Some(ByteRange::Offset {
                offset: start.parse().ok()?,
                length: None,
            }),
            (start, end) => {
                let start: u64 = start.parse().ok()?;
                let end: u64 = end.parse().ok()?;
                if start > end {
                    return None;
                }
                Some(ByteRange::Offset {
                    offset: start,
                    length: Some(end - start + 1),
                })
            }
        }
    }

    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        headers
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(Self::parse)
    }
}

/// A range resolved against a concrete object size. Both ends are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub offset: u64,
    pub end: u64,
    pub size: u64,
}

impl ContentRange {
    /// Resolve `range` against `size`.
    ///
    /// Returns `None` for empty objects, which have no addressable bytes.
    /// Ranges that start past the end are ignored and the full object is used.
    pub fn resolve(range: Option<&ByteRange>, size: u64) -> Option<Self> {
        if size == 0 {
            return None;
        }
        let last = size - 1;
        let full = ContentRange {
            offset: 0,
            end: last,
            size,
        };

        let (offset, length) = match range {
            None => return Some(full),
            Some(ByteRange::Suffix(0)) => return Some(full),
            Some(ByteRange::Suffix(n)) => (size - (*n).min(size), None),
            Some(ByteRange::Offset { offset, length }) => (*offset, *length),
        };

        if offset > last || length == Some(0) {
            return Some(full);
        }

        let end = match length {
            Some(len) => offset.saturating_add(len - 1).min(last),
            None => last,
        };
        Some(ContentRange { offset, end, size })
    }

    pub fn len(&self) -> u64 {
        self.end - self.offset + 1
    }

    /// True when fewer bytes than the full object are served.
    pub fn is_partial(&self) -> bool {
        self.len() != self.size
    }

    pub fn header_value(&self) -> String {
        format!("bytes {}-{}/{}", self.offset, self.end, self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_ranges() {
        assert_eq!(
            ByteRange::parse("bytes=0-4"),
            Some(ByteRange::Offset {
                offset: 0,
                length: Some(5)
            })
        );
        assert_eq!(
            ByteRange::parse("bytes=7-"),
            Some(ByteRange::Offset {
                offset: 7,
                length: None
            })
        );
        assert_eq!(ByteRange::parse("bytes=-3"), Some(ByteRange::Suffix(3)));
    }

    #[test]
    fn rejects_unsupported_ranges() {
        assert_eq!(ByteRange::parse("bytes=0-1,4-5"), None);
        assert_eq!(ByteRange::parse("bytes=5-2"), None);
        assert_eq!(ByteRange::parse("bytes=-0"), None);
        assert_eq!(ByteRange::parse("items=0-1"), None);
        assert_eq!(ByteRange::parse("bytes=a-b"), None);
    }

    #[test]
    fn full_object_without_range() {
        let r = ContentRange::resolve(None, 10).unwrap();
        assert_eq!((r.offset, r.end), (0, 9));
        assert!(!r.is_partial());
        assert_eq!(r.header_value(), "bytes 0-9/10");
    }

    #[test]
    fn end_is_clamped_to_last_byte() {
        let range = ByteRange::Offset {
            offset: 4,
            length: Some(100),
        };
        let r = ContentRange::resolve(Some(&range), 10).unwrap();
        assert_eq!((r.offset, r.end), (4, 9));
        assert_eq!(r.len(), 6);
        assert!(r.is_partial());
    }

    #[test]
    fn suffix_shapes() {
        let r = ContentRange::resolve(Some(&ByteRange::Suffix(3)), 10).unwrap();
        assert_eq!((r.offset, r.end), (7, 9));

        let r = ContentRange::resolve(Some(&ByteRange::Suffix(30)), 10).unwrap();
        assert_eq!((r.offset, r.end), (0, 9));
        assert!(!r.is_partial());
    }

    #[test]
    fn out_of_bounds_offset_serves_everything() {
        let range = ByteRange::Offset {
            offset: 10,
            length: None,
        };
        let r = ContentRange::resolve(Some(&range), 10).unwrap();
        assert_eq!((r.offset, r.end), (0, 9));
    }

    #[test]
    fn bounds_hold_for_every_shape() {
        let shapes = [
            ByteRange::Offset {
                offset: 0,
                length: None,
            },
            ByteRange::Offset {
                offset: 3,
                length: Some(2),
            },
            ByteRange::Offset {
                offset: u64::MAX,
                length: Some(u64::MAX),
            },
            ByteRange::Offset {
                offset: 0,
                length: Some(u64::MAX),
            },
            ByteRange::Suffix(1),
            ByteRange::Suffix(u64::MAX),
        ];
        for size in [1u64, 2, 7, 4096] {
            for shape in &shapes {
                let r = ContentRange::resolve(Some(shape), size).unwrap();
                assert!(r.offset <= r.end, "{shape:?} / {size}");
                assert!(r.end <= size - 1, "{shape:?} / {size}");
            }
        }
    }

    #[test]
    fn empty_objects_have_no_range() {
        assert_eq!(ContentRange::resolve(None, 0), None);
        assert_eq!(ContentRange::resolve(Some(&ByteRange::Suffix(2)), 0), None);
    }
}
