//! # idsync-core
//!
//! Pure reconciliation logic for idsync (no I/O, instant tests).
//!
//! This crate implements the change classification and group expansion
//! algorithms without any network or disk I/O. The engine crate owns the
//! transaction that feeds records through them.
//!
//! - [`merge`] classifies a fetched record against its persisted copy
//! - [`mark_absent`] turns a complete enumeration into deletions for
//!   sources that never report them
//! - [`RelationshipGraph`] expands direct group memberships into transitive
//!   ones, tolerating cycles

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod graph;
pub mod merge;

pub use graph::RelationshipGraph;
pub use merge::{mark_absent, merge, MergeOutcome};
