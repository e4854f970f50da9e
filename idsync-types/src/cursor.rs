//! Synchronization progress markers.
//!
//! Cursors are the only state read before a fetch and the only state
//! advanced after a successful commit. An interrupted cycle leaves them
//! untouched, so the next cycle repeats work instead of skipping it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Store key of the last full synchronization time.
pub const LAST_SYNC_KEY: &str = "last_sync";

/// Store key of the last incremental update time.
pub const LAST_UPDATE_KEY: &str = "last_update";

/// Provider-specific resume tokens (delta link, next-page query,
/// high-water mark, ...).
///
/// An empty token set asks a provider for a complete enumeration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeTokens(BTreeMap<String, String>);

impl ResumeTokens {
    /// No tokens: full enumeration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a token.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Set a token, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Remove a token.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// True when there are no tokens.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over `(key, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// True if `key` names one of the reserved time cursors.
    pub fn is_reserved(key: &str) -> bool {
        key == LAST_SYNC_KEY || key == LAST_UPDATE_KEY
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ResumeTokens {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Per-provider synchronization cursor state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncCursors {
    /// Time of the last committed full synchronization.
    pub last_sync: Option<DateTime<Utc>>,
    /// Time of the last committed incremental update.
    pub last_update: Option<DateTime<Utc>>,
    /// Resume tokens for the next incremental fetch.
    pub tokens: ResumeTokens,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_tokens_mean_full_enumeration() {
        let mut tokens = ResumeTokens::new();
        assert!(tokens.is_empty());
        tokens.set("delta_link", "https://graph.example/delta?token=abc");
        assert!(!tokens.is_empty());
        assert_eq!(
            tokens.get("delta_link"),
            Some("https://graph.example/delta?token=abc")
        );
        assert_eq!(tokens.remove("delta_link").as_deref(), Some("https://graph.example/delta?token=abc"));
        assert!(tokens.is_empty());
    }

    #[test]
    fn reserved_keys() {
        assert!(ResumeTokens::is_reserved("last_sync"));
        assert!(ResumeTokens::is_reserved("last_update"));
        assert!(!ResumeTokens::is_reserved("next_users"));
    }

    #[test]
    fn tokens_from_pairs() {
        let tokens: ResumeTokens = [("a", "1"), ("b", "2")].into_iter().collect();
        let pairs: Vec<_> = tokens.iter().collect();
        assert_eq!(pairs, vec![("a", "1"), ("b", "2")]);
    }
}
