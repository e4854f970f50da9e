//! File-backed provider.
//!
//! Reads a JSON array of fetched records. A full enumeration returns every
//! record; an incremental fetch returns records changed at or after the
//! stored high-water mark.

use super::{FetchBatch, FetchContext, Provider};
use crate::error::ProviderError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use idsync_types::{AssetKind, Event, FetchedAsset, ResumeTokens};
use serde::Deserialize;
use std::path::PathBuf;

/// Resume token holding the newest `when_changed` seen, as RFC 3339.
pub const HIGH_WATER_MARK: &str = "high_water_mark";

/// Settings read from the `[provider]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct FixtureConfig {
    /// JSON file holding the records.
    pub path: PathBuf,
    /// Whether records flagged `deleted` are trusted. When false, deletions
    /// are inferred from absence after full enumerations.
    #[serde(default = "default_reports_deletions")]
    pub reports_deletions: bool,
    /// Kinds to enumerate (default: all).
    #[serde(default = "default_kinds")]
    pub kinds: Vec<AssetKind>,
    /// Event field for attributes (default: `fixture`).
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

fn default_reports_deletions() -> bool {
    true
}

fn default_kinds() -> Vec<AssetKind> {
    AssetKind::ALL.to_vec()
}

fn default_namespace() -> String {
    FixtureProvider::NAME.to_string()
}

/// Provider serving records from a JSON file.
#[derive(Debug, Clone)]
pub struct FixtureProvider {
    config: FixtureConfig,
    endpoint: String,
}

impl FixtureProvider {
    /// Registered name.
    pub const NAME: &'static str = "fixture";

    /// Create a provider.
    pub fn new(config: FixtureConfig) -> Self {
        let endpoint = format!("file://{}", config.path.display());
        Self { config, endpoint }
    }

    /// Build from a `[provider]` table.
    pub fn from_toml(value: &toml::Value) -> Result<Self, ProviderError> {
        let config: FixtureConfig = value
            .clone()
            .try_into()
            .map_err(|e: toml::de::Error| ProviderError::Config(e.message().to_string()))?;
        if config.kinds.is_empty() {
            return Err(ProviderError::Config("kinds must not be empty".into()));
        }
        if !Event::is_field_path(&config.namespace) {
            return Err(ProviderError::Config(format!(
                "namespace {:?} is not a dotted field path",
                config.namespace
            )));
        }
        Ok(Self::new(config))
    }

    async fn read_records(&self) -> Result<Vec<FetchedAsset>, ProviderError> {
        let bytes = tokio::fs::read(&self.config.path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

fn parse_mark(tokens: &ResumeTokens) -> Result<Option<DateTime<Utc>>, ProviderError> {
    tokens
        .get(HIGH_WATER_MARK)
        .map(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| ProviderError::Fetch(format!("invalid {HIGH_WATER_MARK} {raw:?}: {e}")))
        })
        .transpose()
}

#[async_trait]
impl Provider for FixtureProvider {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn namespace(&self) -> &str {
        &self.config.namespace
    }

    fn kinds(&self) -> &[AssetKind] {
        &self.config.kinds
    }

    fn reports_deletions(&self) -> bool {
        self.config.reports_deletions
    }

    async fn fetch(
        &self,
        ctx: FetchContext<'_>,
        tokens: &ResumeTokens,
    ) -> Result<FetchBatch, ProviderError> {
        ctx.limiter.wait(&self.endpoint, ctx.cancel).await?;

        let since = parse_mark(tokens)?;
        let records = self.read_records().await?;

        let newest = records.iter().filter_map(|r| r.when_changed).max();
        let mark = match (since, newest) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        let assets: Vec<FetchedAsset> = records
            .into_iter()
            .filter(|r| self.config.kinds.contains(&r.kind))
            .filter(|r| match since {
                Some(since) => r.when_changed.is_some_and(|t| t >= since),
                None => true,
            })
            .map(|mut r| {
                if !self.config.reports_deletions {
                    r.deleted = false;
                }
                r
            })
            .collect();

        tracing::debug!(
            "Fixture fetch from {}: {} records ({})",
            self.config.path.display(),
            assets.len(),
            if since.is_some() { "incremental" } else { "full" }
        );

        let mut next = ResumeTokens::new();
        if let Some(mark) = mark {
            next.set(HIGH_WATER_MARK, mark.to_rfc3339());
        }
        Ok(FetchBatch {
            assets,
            tokens: next,
        })
    }
}
