//! # idsync-types
//!
//! Data model for the idsync entity synchronization engine.
//!
//! This crate provides the foundational types used across all idsync crates:
//! - [`Set`], [`Tree`] - Membership and graph containers with JSON support
//! - [`AssetId`], [`AssetKind`], [`State`] - Identity and classification
//! - [`Asset`], [`FetchedAsset`] - Persisted and freshly fetched records
//! - [`SyncCursors`], [`ResumeTokens`] - Synchronization progress
//! - [`Event`] - Documents handed to the downstream pipeline

#![warn(missing_docs)]
#![warn(clippy::all)]

mod asset;
mod collections;
mod cursor;
mod error;
mod event;
mod ids;

pub use asset::{Asset, AssetKind, Attributes, FetchedAsset, State};
pub use collections::{Set, Tree};
pub use cursor::{ResumeTokens, SyncCursors, LAST_SYNC_KEY, LAST_UPDATE_KEY};
pub use error::IdError;
pub use event::{Event, Marker};
pub use ids::AssetId;
