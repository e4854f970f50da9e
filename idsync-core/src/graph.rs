//! Group relationship graph and transitive membership expansion.
//!
//! Edges point from a group to the groups it is a direct member of, so
//! expanding an asset's direct memberships yields every group it belongs to
//! through any number of intermediate groups. Membership graphs may contain
//! cycles (A in B, B in A); expansion visits each group at most once.

use idsync_types::{Asset, AssetId, AssetKind, Set, Tree};

/// Directed group-membership graph keyed by group identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelationshipGraph {
    tree: Tree<AssetId>,
}

impl RelationshipGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a persisted adjacency map.
    pub fn from_tree(tree: Tree<AssetId>) -> Self {
        Self { tree }
    }

    /// The underlying adjacency map, for persistence.
    pub fn tree(&self) -> &Tree<AssetId> {
        &self.tree
    }

    /// Make `group`'s outgoing edges match `parents` exactly.
    pub fn set_parents(&mut self, group: &AssetId, parents: &Set<AssetId>) {
        let stale: Vec<AssetId> = self
            .tree
            .neighbours(group)
            .map(|current| {
                current
                    .iter()
                    .filter(|p| !parents.contains(p))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        for parent in &stale {
            self.tree.remove_edge(group, parent);
        }
        self.tree.add_edge(group.clone(), parents.iter().cloned());
    }

    /// Drop a group and every edge that references it.
    pub fn remove_group(&mut self, group: &AssetId) {
        self.tree.remove_vertex(group);
    }

    /// Record a group asset: live groups contribute their memberships as
    /// edges, deleted groups are removed from the graph.
    ///
    /// Non-group assets are ignored.
    pub fn record(&mut self, asset: &Asset) {
        if asset.kind != AssetKind::Group {
            return;
        }
        if asset.is_deleted() {
            self.remove_group(&asset.id);
        } else {
            self.set_parents(&asset.id, &asset.member_of);
        }
    }

    /// Every group reachable from `direct`, `direct` included.
    pub fn expand(&self, direct: &Set<AssetId>) -> Set<AssetId> {
        self.tree.expand_from_set(direct)
    }

    /// Recompute `asset.transitive_member_of`. Returns true if it changed.
    pub fn refresh_transitive(&self, asset: &mut Asset) -> bool {
        let expanded = self.expand(&asset.member_of);
        if expanded == asset.transitive_member_of {
            return false;
        }
        asset.transitive_member_of = expanded;
        true
    }
}
