//! Change classification for fetched records.
//!
//! A fetched record is merged field by field into the persisted copy:
//! fetched attribute values override persisted ones per key, direct
//! memberships are unioned (minus explicit removals), and the deleted flag
//! is propagated. Deletion is terminal.

use chrono::{DateTime, Utc};
use idsync_types::{Asset, AssetId, FetchedAsset, Set, State};

/// Result of reconciling one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// First sighting; the asset was inserted.
    Discovered,
    /// The persisted copy changed.
    Modified,
    /// The asset is now deleted.
    Deleted,
    /// Nothing differed.
    Unchanged,
    /// Nothing to do: a deletion for an unknown asset, or any record for an
    /// already deleted one.
    Ignored,
}

impl MergeOutcome {
    /// True if the asset should be reported as changed.
    pub fn is_change(self) -> bool {
        matches!(self, Self::Discovered | Self::Modified | Self::Deleted)
    }
}

/// Merge `fetched` into `existing`.
///
/// `fresh` is true when `existing` was itself discovered earlier in the same
/// transaction; such an asset stays `Discovered` rather than becoming
/// `Modified`.
pub fn merge(existing: &mut Asset, fetched: FetchedAsset, fresh: bool) -> MergeOutcome {
    if existing.is_deleted() {
        return MergeOutcome::Ignored;
    }

    let mut changed = false;
    for (key, value) in fetched.attributes {
        if existing.attributes.get(&key) != Some(&value) {
            existing.attributes.insert(key, value);
            changed = true;
        }
    }
    changed |= existing.member_of.union_with(&fetched.member_of);
    changed |= existing.member_of.subtract(&fetched.member_of_removed);
    if fetched.when_changed.is_some() {
        existing.when_changed = fetched.when_changed;
    }

    if fetched.deleted {
        existing.state = State::Deleted;
        return MergeOutcome::Deleted;
    }
    if !changed {
        return MergeOutcome::Unchanged;
    }
    if fresh {
        return MergeOutcome::Discovered;
    }
    existing.state = State::Modified;
    MergeOutcome::Modified
}

/// Mark every live asset whose id is not in `seen` as deleted.
///
/// Used for sources that give no deletion signal: after a complete
/// enumeration, anything persisted but not enumerated is gone. `now` is
/// recorded as the change time since the source provides none. Returns the
/// ids that were newly deleted.
pub fn mark_absent<'a, I>(assets: I, seen: &Set<AssetId>, now: DateTime<Utc>) -> Vec<AssetId>
where
    I: IntoIterator<Item = &'a mut Asset>,
{
    let mut deleted = Vec::new();
    for asset in assets {
        if asset.is_deleted() || seen.contains(&asset.id) {
            continue;
        }
        asset.state = State::Deleted;
        asset.when_changed = Some(now);
        deleted.push(asset.id.clone());
    }
    deleted
}
