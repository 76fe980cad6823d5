//! Server-side core for syncing end-to-end encrypted collections.
//!
//! Clients push and pull versioned, encrypted collections (address books,
//! calendars, ...) composed of items. Each item carries a chronological chain
//! of encrypted revisions built from content-addressed chunks. This crate
//! orders, stores, deduplicates and serves those encrypted blobs while
//! enforcing consistency and access control; it never sees plaintext and
//! never resolves conflicts (a version mismatch is surfaced to the client as
//! an etag conflict).
//!
//! The transport layer (HTTP routing, authentication, base64url field
//! encoding) sits above this crate and calls [`Store`] with already-validated
//! input.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod chunks;
pub mod error;
pub mod stoken;
pub mod store;
pub mod sync;
pub mod uid;

pub use self::error::{Error, Result};
pub use self::stoken::Stoken;
pub use self::store::Store;
pub use self::uid::Uid;
