//! The contract between the engine and identity sources.
//!
//! A provider enumerates records from one external directory. The engine
//! calls [`Provider::fetch`] with the resume tokens persisted by the last
//! committed cycle; an empty token map asks for a complete enumeration.

mod fixture;

pub use fixture::{FixtureConfig, FixtureProvider, HIGH_WATER_MARK};

use crate::error::ProviderError;
use crate::ratelimit::AdaptiveRateLimiter;
use async_trait::async_trait;
use idsync_types::{AssetKind, FetchedAsset, ResumeTokens};
use tokio_util::sync::CancellationToken;

/// What a fetch hands back.
#[derive(Debug, Clone, Default)]
pub struct FetchBatch {
    /// Records changed since the given tokens, or every record for a full
    /// enumeration.
    pub assets: Vec<FetchedAsset>,
    /// Tokens to resume from next time. Replaces the stored tokens once the
    /// cycle commits.
    pub tokens: ResumeTokens,
}

/// Shared resources available to a fetch.
#[derive(Debug, Clone, Copy)]
pub struct FetchContext<'a> {
    /// Shutdown signal; long fetches should stop early when it fires.
    pub cancel: &'a CancellationToken,
    /// Pacing for API calls. Call `wait` before each request and `update`
    /// after each response.
    pub limiter: &'a AdaptiveRateLimiter,
}

/// An identity source.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Registered provider name.
    fn name(&self) -> &str;

    /// Event field under which provider attributes are published.
    fn namespace(&self) -> &str {
        self.name()
    }

    /// Asset kinds this provider enumerates.
    fn kinds(&self) -> &[AssetKind];

    /// True if the source reports removals explicitly.
    ///
    /// Sources that don't get deletion-by-absence after each successful full
    /// enumeration.
    fn reports_deletions(&self) -> bool;

    /// Fetch records. An empty `tokens` map requests a full enumeration.
    async fn fetch(
        &self,
        ctx: FetchContext<'_>,
        tokens: &ResumeTokens,
    ) -> Result<FetchBatch, ProviderError>;
}
