//! WebDAV (class 1 and 3) front end for a flat, key-addressed object store.
//!
//! Collections are modelled as zero-length marker objects; everything else
//! is a plain object whose key is its URL path. See [`routes::routes::routes`]
//! for the HTTP entry point and [`services::ObjectStore`] for the storage
//! contract.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
