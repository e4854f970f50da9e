//! # idsync-engine
//!
//! Entity synchronization engine for identity sources.
//!
//! Each input pairs a [`Provider`](provider::Provider) with its own state
//! database and runs a two-timer loop:
//!
//! ```text
//!   sync timer ──► full sync ──┐                 ┌──► commit cursors
//!                              ├─► fetch ─► merge ─► publish ─► wait acks
//! update timer ─► update ──────┘                 └──► rollback on error
//! ```
//!
//! - [`storage`]: bucket/key store with one writer and snapshot readers
//! - [`statestore`]: per-cycle view of assets, cursors and the group graph
//! - [`tracker`]: the acknowledgement barrier gating each commit
//! - [`scheduler`]: the loop, panic recovery and failure accounting
//! - [`ratelimit`]: per-endpoint pacing retuned from quota headers
//!
//! Events are at-least-once: a crash between publishing and committing
//! repeats the cycle on restart.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod panic;
pub mod provider;
pub mod publish;
pub mod ratelimit;
pub mod registry;
pub mod scheduler;
pub mod statestore;
pub mod storage;
pub mod tracker;

pub use config::Config;
pub use error::{CycleError, EngineError, Result};
pub use scheduler::{CycleReport, SyncInput};
