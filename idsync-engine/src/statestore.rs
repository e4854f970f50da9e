//! Per-input state held across one synchronization cycle.
//!
//! [`StateStore::open`] begins the single writable transaction, loads the
//! cursors, every persisted asset and the relationship graph into memory.
//! Fetched records are merged against those maps; nothing reaches the
//! database until [`StateStore::close`] is called with `commit = true`.

use crate::error::{StateError, StoreError};
use crate::storage::{Store, Transaction, RELATIONSHIPS_BUCKET, RELATIONSHIPS_KEY, STATE_BUCKET};
use chrono::{DateTime, Utc};
use idsync_core::{mark_absent, merge, MergeOutcome, RelationshipGraph};
use idsync_types::{
    Asset, AssetId, AssetKind, FetchedAsset, ResumeTokens, Set, State, SyncCursors, Tree,
    LAST_SYNC_KEY, LAST_UPDATE_KEY,
};
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, BTreeSet};

type AssetKey = (AssetKind, AssetId);

/// In-memory view of one input's persisted state, bound to an open writable
/// transaction.
#[derive(Debug)]
pub struct StateStore {
    tx: Transaction,
    cursors: SyncCursors,
    persisted_tokens: BTreeSet<String>,
    assets: BTreeMap<AssetKind, BTreeMap<AssetId, Asset>>,
    graph: RelationshipGraph,
    changed: BTreeSet<AssetKey>,
    fresh: BTreeSet<AssetKey>,
    purged: Vec<AssetKey>,
    closed: bool,
}

impl StateStore {
    /// Begin a writable transaction and load everything persisted.
    ///
    /// Waits if another writable transaction is open on `store`.
    pub async fn open(store: &Store) -> Result<Self, StateError> {
        let mut tx = store.begin_tx(true).await?;
        match Loaded::read(&mut tx).await {
            Ok(loaded) => Ok(Self {
                tx,
                persisted_tokens: loaded
                    .cursors
                    .tokens
                    .iter()
                    .map(|(k, _)| k.to_string())
                    .collect(),
                cursors: loaded.cursors,
                assets: loaded.assets,
                graph: loaded.graph,
                changed: BTreeSet::new(),
                fresh: BTreeSet::new(),
                purged: Vec::new(),
                closed: false,
            }),
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    tracing::error!("Failed to roll back after load error: {}", rb);
                }
                Err(e)
            }
        }
    }

    /// Synchronization cursors as loaded, plus any updates made this cycle.
    pub fn cursors(&self) -> &SyncCursors {
        &self.cursors
    }

    /// Mutable cursors; written back on commit.
    pub fn cursors_mut(&mut self) -> &mut SyncCursors {
        &mut self.cursors
    }

    /// The relationship graph.
    pub fn graph(&self) -> &RelationshipGraph {
        &self.graph
    }

    /// Look up an asset.
    pub fn asset(&self, kind: AssetKind, id: &AssetId) -> Option<&Asset> {
        self.assets.get(&kind)?.get(id)
    }

    /// Number of assets of `kind`, deleted ones included.
    pub fn len(&self, kind: AssetKind) -> usize {
        self.assets.get(&kind).map_or(0, BTreeMap::len)
    }

    /// True if no assets of any kind are held.
    pub fn is_empty(&self) -> bool {
        self.assets.values().all(BTreeMap::is_empty)
    }

    /// Merge a fetched record into the loaded state.
    ///
    /// An unknown record is inserted as `Discovered`; an unknown record
    /// reported deleted is ignored. A known record is merged field by field.
    pub fn store(&mut self, fetched: FetchedAsset) -> MergeOutcome {
        let kind = fetched.kind;
        let key: AssetKey = (kind, fetched.id.clone());
        let assets = self.assets.entry(kind).or_default();

        let outcome = match assets.get_mut(&key.1) {
            Some(existing) => merge(existing, fetched, self.fresh.contains(&key)),
            None if fetched.deleted => MergeOutcome::Ignored,
            None => {
                let asset = Asset::discovered(fetched);
                assets.insert(asset.id.clone(), asset);
                self.fresh.insert(key.clone());
                MergeOutcome::Discovered
            }
        };

        if outcome.is_change() {
            if let Some(asset) = assets.get(&key.1) {
                self.graph.record(asset);
            }
            self.changed.insert(key.clone());
        }
        tracing::trace!("Stored {} {}: {:?}", kind, key.1, outcome);
        outcome
    }

    /// Mark every live asset of `kind` absent from `seen` as deleted.
    ///
    /// Only valid after a complete, successful enumeration of `kind`.
    pub fn mark_absent_deleted(
        &mut self,
        kind: AssetKind,
        seen: &Set<AssetId>,
        now: DateTime<Utc>,
    ) -> Vec<AssetId> {
        let Some(assets) = self.assets.get_mut(&kind) else {
            return Vec::new();
        };
        let deleted = mark_absent(assets.values_mut(), seen, now);
        for id in &deleted {
            if kind == AssetKind::Group {
                self.graph.remove_group(id);
            }
            self.changed.insert((kind, id.clone()));
        }
        deleted
    }

    /// Drop assets whose deletion was committed by an earlier cycle.
    ///
    /// Their keys are deleted on commit. Returns how many were dropped.
    pub fn purge_deleted(&mut self) -> usize {
        let before = self.purged.len();
        for (kind, assets) in &mut self.assets {
            let gone: Vec<AssetId> = assets
                .iter()
                .filter(|(id, asset)| {
                    asset.is_deleted() && !self.changed.contains(&(*kind, (*id).clone()))
                })
                .map(|(id, _)| id.clone())
                .collect();
            for id in gone {
                assets.remove(&id);
                if *kind == AssetKind::Group {
                    self.graph.remove_group(&id);
                }
                self.purged.push((*kind, id));
            }
        }
        self.purged.len() - before
    }

    /// Recompute transitive memberships of every live asset.
    ///
    /// An asset whose transitive set changed is marked `Modified` unless it
    /// was discovered in this cycle. Returns how many assets changed.
    pub fn expand_memberships(&mut self) -> usize {
        let mut count = 0;
        for (kind, assets) in &mut self.assets {
            for (id, asset) in assets.iter_mut() {
                if asset.is_deleted() || !self.graph.refresh_transitive(asset) {
                    continue;
                }
                count += 1;
                let key = (*kind, id.clone());
                if !self.fresh.contains(&key) {
                    asset.state = State::Modified;
                }
                self.changed.insert(key);
            }
        }
        count
    }

    /// Assets changed in this cycle, in kind then id order.
    pub fn changed_assets(&self) -> Vec<&Asset> {
        self.changed
            .iter()
            .filter_map(|(kind, id)| self.asset(*kind, id))
            .collect()
    }

    /// Every live asset, plus assets deleted in this cycle.
    pub fn publishable_assets(&self) -> Vec<&Asset> {
        self.assets
            .iter()
            .flat_map(|(kind, assets)| {
                assets.iter().filter_map(move |(id, asset)| {
                    let newly_deleted = self.changed.contains(&(*kind, id.clone()));
                    (!asset.is_deleted() || newly_deleted).then_some(asset)
                })
            })
            .collect()
    }

    /// True once closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Close the transaction.
    ///
    /// With `commit = false` everything loaded or merged is discarded. With
    /// `commit = true` cursors, assets and the graph are written back and
    /// committed; on failure the transaction is rolled back and both errors
    /// are reported. Closing twice is a no-op.
    pub async fn close(&mut self, commit: bool) -> Result<(), StateError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if !commit {
            return self.tx.rollback().await.map_err(StateError::from);
        }

        let written = match self.write_back().await {
            Ok(()) => self.tx.commit().await,
            Err(e) => Err(e),
        };
        if let Err(source) = written {
            let rollback = self.tx.rollback().await.err();
            if let Some(rb) = &rollback {
                tracing::error!("Rollback after failed commit also failed: {}", rb);
            }
            return Err(StateError::Commit { source, rollback });
        }
        Ok(())
    }

    async fn write_back(&mut self) -> Result<(), StoreError> {
        let tx = &mut self.tx;

        if let Some(at) = &self.cursors.last_sync {
            tx.set(STATE_BUCKET, LAST_SYNC_KEY.as_bytes(), at).await?;
        }
        if let Some(at) = &self.cursors.last_update {
            tx.set(STATE_BUCKET, LAST_UPDATE_KEY.as_bytes(), at).await?;
        }
        for key in &self.persisted_tokens {
            if self.cursors.tokens.get(key).is_none() {
                tx.delete(STATE_BUCKET, key.as_bytes()).await?;
            }
        }
        for (key, value) in self.cursors.tokens.iter() {
            if ResumeTokens::is_reserved(key) {
                tracing::warn!("Skipping resume token with reserved key {}", key);
                continue;
            }
            tx.set(STATE_BUCKET, key.as_bytes(), value).await?;
        }

        for (kind, id) in &self.purged {
            tx.delete(kind.bucket(), &id.key_bytes()).await?;
        }
        for (kind, assets) in &self.assets {
            for (id, asset) in assets {
                tx.set(kind.bucket(), &id.key_bytes(), asset).await?;
            }
        }

        tx.set(RELATIONSHIPS_BUCKET, RELATIONSHIPS_KEY, self.graph.tree())
            .await?;
        Ok(())
    }
}

/// Everything read by [`StateStore::open`].
struct Loaded {
    cursors: SyncCursors,
    assets: BTreeMap<AssetKind, BTreeMap<AssetId, Asset>>,
    graph: RelationshipGraph,
}

impl Loaded {
    async fn read(tx: &mut Transaction) -> Result<Self, StateError> {
        let cursors = read_cursors(tx).await?;

        let mut assets = BTreeMap::new();
        for kind in AssetKind::ALL {
            let mut by_id = BTreeMap::new();
            for (_, value) in entries(tx, kind.bucket()).await? {
                let asset: Asset = decode(kind.bucket(), &value)?;
                by_id.insert(asset.id.clone(), asset);
            }
            assets.insert(kind, by_id);
        }

        let tree = match tx
            .get::<Tree<AssetId>>(RELATIONSHIPS_BUCKET, RELATIONSHIPS_KEY)
            .await
        {
            Ok(tree) => tree,
            Err(e) if e.is_not_found() => Tree::new(),
            Err(StoreError::Json(source)) => {
                return Err(StateError::Corrupt {
                    bucket: RELATIONSHIPS_BUCKET.to_string(),
                    source,
                })
            }
            Err(e) => return Err(e.into()),
        };

        tracing::debug!(
            "Loaded state: last_sync={:?} last_update={:?} assets={}",
            cursors.last_sync,
            cursors.last_update,
            assets.values().map(BTreeMap::len).sum::<usize>()
        );
        Ok(Self {
            cursors,
            assets,
            graph: RelationshipGraph::from_tree(tree),
        })
    }
}

/// Read the cursors through a read-only transaction.
///
/// Used to seed timers without taking the writer lock.
pub async fn load_cursors(store: &Store) -> Result<SyncCursors, StateError> {
    let mut tx = store.begin_tx(false).await?;
    let cursors = read_cursors(&mut tx).await;
    tx.rollback().await?;
    cursors
}

async fn read_cursors(tx: &mut Transaction) -> Result<SyncCursors, StateError> {
    let mut cursors = SyncCursors::default();
    for (key, value) in entries(tx, STATE_BUCKET).await? {
        let key = String::from_utf8_lossy(&key).into_owned();
        if key == LAST_SYNC_KEY {
            cursors.last_sync = Some(decode(STATE_BUCKET, &value)?);
        } else if key == LAST_UPDATE_KEY {
            cursors.last_update = Some(decode(STATE_BUCKET, &value)?);
        } else {
            let token: String = decode(STATE_BUCKET, &value)?;
            cursors.tokens.set(key, token);
        }
    }
    Ok(cursors)
}

/// All entries of a bucket; a missing bucket is empty.
async fn entries(
    tx: &mut Transaction,
    bucket: &str,
) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StateError> {
    let mut rows = Vec::new();
    let result = tx
        .for_each::<StoreError, _>(bucket, |k, v| {
            rows.push((k.to_vec(), v.to_vec()));
            Ok(())
        })
        .await;
    match result {
        Ok(()) => Ok(rows),
        Err(e) if e.is_not_found() => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

fn decode<T: DeserializeOwned>(bucket: &str, bytes: &[u8]) -> Result<T, StateError> {
    serde_json::from_slice(bytes).map_err(|source| StateError::Corrupt {
        bucket: bucket.to_string(),
        source,
    })
}
