//! Core data models for the WebDAV adapter.
//!
//! These types describe what the object store holds (records and their
//! metadata) and the request-side values (ranges, preconditions) that the
//! store evaluates on our behalf.

pub mod conditions;
pub mod object;
pub mod property;
pub mod proppatch;
pub mod range;
