//! Embedded transactional key/value store.
//!
//! Values live in named buckets under byte keys. Any number of read-only
//! transactions may run alongside at most one writable transaction; a second
//! writer waits until the first closes. Typed accessors encode values as
//! JSON, the `*_bytes` accessors store raw bytes.
//!
//! ## Persisted layout
//!
//! ```text
//! state          last_sync, last_update, <resume token keys>
//! users          <asset id bytes> -> JSON Asset
//! devices        ...
//! groups         ...
//! computers      ...
//! relationships  "graph" -> JSON adjacency map
//! ```

mod sqlite;

pub use sqlite::{Store, Transaction};

/// Bucket holding synchronization cursors.
pub const STATE_BUCKET: &str = "state";

/// Bucket holding the group relationship graph.
pub const RELATIONSHIPS_BUCKET: &str = "relationships";

/// Key of the relationship graph inside [`RELATIONSHIPS_BUCKET`].
pub const RELATIONSHIPS_KEY: &[u8] = b"graph";
