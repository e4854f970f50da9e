//! Generic membership and graph containers.
//!
//! [`Set`] is an unordered-membership collection and [`Tree`] a directed
//! adjacency graph built from it. Both serialize to plain JSON (an array and
//! an object of arrays respectively) so they can be persisted next to the
//! assets that reference them.
//!
//! Internally both use ordered std collections. Ordering is not part of the
//! contract; it only keeps the persisted bytes stable between runs.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// An unordered set of values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
#[serde(bound(
    serialize = "T: Serialize",
    deserialize = "T: Deserialize<'de> + Ord"
))]
pub struct Set<T: Ord> {
    items: BTreeSet<T>,
}

impl<T: Ord> Set<T> {
    /// Create an empty set.
    pub fn new() -> Self {
        Self {
            items: BTreeSet::new(),
        }
    }

    /// Add a value. Returns true if it was not already present.
    pub fn add(&mut self, value: T) -> bool {
        self.items.insert(value)
    }

    /// Remove a value. Returns true if it was present.
    pub fn remove(&mut self, value: &T) -> bool {
        self.items.remove(value)
    }

    /// Check membership.
    pub fn contains(&self, value: &T) -> bool {
        self.items.contains(value)
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True if the set has no members.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterate over the members.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// True if every member of `self` is also in `other`.
    pub fn is_subset(&self, other: &Set<T>) -> bool {
        self.items.is_subset(&other.items)
    }

    /// Remove every member.
    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T: Ord + Clone> Set<T> {
    /// Add every member of `other`. Returns true if anything was added.
    pub fn union_with(&mut self, other: &Set<T>) -> bool {
        let before = self.items.len();
        self.items.extend(other.items.iter().cloned());
        self.items.len() != before
    }

    /// Remove every member of `other`. Returns true if anything was removed.
    pub fn subtract(&mut self, other: &Set<T>) -> bool {
        let before = self.items.len();
        self.items.retain(|v| !other.items.contains(v));
        self.items.len() != before
    }

    /// Members as an owned vector.
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

impl<T: Ord> Default for Set<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Ord> FromIterator<T> for Set<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

impl<T: Ord> Extend<T> for Set<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        self.items.extend(iter);
    }
}

impl<T: Ord> IntoIterator for Set<T> {
    type Item = T;
    type IntoIter = std::collections::btree_set::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a, T: Ord> IntoIterator for &'a Set<T> {
    type Item = &'a T;
    type IntoIter = std::collections::btree_set::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// A directed graph mapping each vertex to the set of vertices one hop away.
///
/// Vertices with no outgoing edges are not stored; a vertex only exists as a
/// key while it has at least one neighbour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
#[serde(bound(
    serialize = "T: Serialize",
    deserialize = "T: Deserialize<'de> + Ord"
))]
pub struct Tree<T: Ord> {
    edges: BTreeMap<T, Set<T>>,
}

impl<T: Ord + Clone> Tree<T> {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self {
            edges: BTreeMap::new(),
        }
    }

    /// Add edges from `from` to each of `to`.
    pub fn add_edge<I>(&mut self, from: T, to: I)
    where
        I: IntoIterator<Item = T>,
    {
        let mut targets = to.into_iter().peekable();
        if targets.peek().is_none() {
            return;
        }
        self.edges.entry(from).or_default().extend(targets);
    }

    /// Remove the edge `from -> to`. The source vertex is dropped when its
    /// last edge goes.
    pub fn remove_edge(&mut self, from: &T, to: &T) -> bool {
        let Some(targets) = self.edges.get_mut(from) else {
            return false;
        };
        let removed = targets.remove(to);
        if targets.is_empty() {
            self.edges.remove(from);
        }
        removed
    }

    /// Remove a vertex and every edge pointing at it.
    ///
    /// Vertices left with no outgoing edges are pruned.
    pub fn remove_vertex(&mut self, vertex: &T) {
        self.edges.remove(vertex);
        self.edges.retain(|_, targets| {
            targets.remove(vertex);
            !targets.is_empty()
        });
    }

    /// One-hop neighbours of `vertex`.
    pub fn neighbours(&self, vertex: &T) -> Option<&Set<T>> {
        self.edges.get(vertex)
    }

    /// True if `vertex` has outgoing edges.
    pub fn has_vertex(&self, vertex: &T) -> bool {
        self.edges.contains_key(vertex)
    }

    /// Number of vertices with outgoing edges.
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// True if there are no edges.
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Iterate over `(vertex, neighbours)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&T, &Set<T>)> {
        self.edges.iter()
    }

    /// Everything reachable from `seeds`, seeds included.
    ///
    /// Each vertex is expanded at most once, so cycles terminate.
    pub fn expand<I>(&self, seeds: I) -> Set<T>
    where
        I: IntoIterator<Item = T>,
    {
        let mut seen = Set::new();
        let mut stack: Vec<T> = Vec::new();
        for seed in seeds {
            if seen.add(seed.clone()) {
                stack.push(seed);
            }
        }
        while let Some(vertex) = stack.pop() {
            if let Some(targets) = self.edges.get(&vertex) {
                for next in targets {
                    if seen.add(next.clone()) {
                        stack.push(next.clone());
                    }
                }
            }
        }
        seen
    }

    /// [`Tree::expand`] seeded from every member of `seeds`.
    pub fn expand_from_set(&self, seeds: &Set<T>) -> Set<T> {
        self.expand(seeds.iter().cloned())
    }
}

impl<T: Ord + Clone> Default for Tree<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> Set<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn set_add_and_remove() {
        let mut s = Set::new();
        assert!(s.add("a"));
        assert!(!s.add("a"));
        assert!(s.contains(&"a"));
        assert!(s.remove(&"a"));
        assert!(!s.remove(&"a"));
        assert!(s.is_empty());
    }

    #[test]
    fn set_json_membership_survives_reordering() {
        let s: Set<String> = serde_json::from_str(r#"["c","a","b","a"]"#).unwrap();
        let json = serde_json::to_string(&s).unwrap();
        let back: Set<String> = serde_json::from_str(&json).unwrap();

        assert_eq!(back, set(&["b", "c", "a"]));
        assert_eq!(back.len(), 3);
    }

    #[test]
    fn set_union_reports_change() {
        let mut s = set(&["g1"]);
        assert!(s.union_with(&set(&["g1", "g2"])));
        assert!(!s.union_with(&set(&["g2"])));
        assert_eq!(s, set(&["g1", "g2"]));
    }

    #[test]
    fn set_subtract_reports_change() {
        let mut s = set(&["g1", "g2"]);
        assert!(s.subtract(&set(&["g2", "g3"])));
        assert!(!s.subtract(&set(&["g3"])));
        assert_eq!(s, set(&["g1"]));
    }

    #[test]
    fn expand_includes_seeds_and_reachable() {
        let mut t = Tree::new();
        t.add_edge("a", ["b"]);
        t.add_edge("b", ["c", "d"]);
        t.add_edge("x", ["y"]);

        let got = t.expand(["a"]);
        let want: Set<&str> = ["a", "b", "c", "d"].into_iter().collect();
        assert_eq!(got, want);
    }

    #[test]
    fn expand_seed_without_edges_returns_seed() {
        let t: Tree<&str> = Tree::new();
        let got = t.expand(["lonely"]);
        assert_eq!(got.to_vec(), vec!["lonely"]);
    }

    #[test]
    fn expand_terminates_on_cycles() {
        let mut t = Tree::new();
        t.add_edge("a", ["b"]);
        t.add_edge("b", ["c"]);
        t.add_edge("c", ["a"]);
        t.add_edge("c", ["c"]);

        let got = t.expand(["b"]);
        assert_eq!(got.to_vec(), vec!["a", "b", "c"]);

        // Idempotent when re-expanded from its own result.
        assert_eq!(t.expand_from_set(&got), got);
    }

    #[test]
    fn expand_from_set_matches_expand() {
        let mut t = Tree::new();
        t.add_edge(1, [2]);
        t.add_edge(3, [4]);
        let seeds: Set<i32> = [1, 3].into_iter().collect();
        assert_eq!(t.expand_from_set(&seeds), t.expand([1, 3]));
        assert_eq!(t.expand_from_set(&seeds).to_vec(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn remove_edge_drops_empty_vertex() {
        let mut t = Tree::new();
        t.add_edge("a", ["b"]);
        assert!(t.remove_edge(&"a", &"b"));
        assert!(!t.has_vertex(&"a"));
        assert!(!t.remove_edge(&"a", &"b"));
    }

    #[test]
    fn remove_vertex_cascades() {
        let mut t = Tree::new();
        t.add_edge("a", ["b", "c"]);
        t.add_edge("d", ["b"]);
        t.add_edge("b", ["e"]);

        t.remove_vertex(&"b");

        assert!(!t.has_vertex(&"b"));
        assert_eq!(t.neighbours(&"a").unwrap().to_vec(), vec!["c"]);
        // "d" only pointed at "b".
        assert!(!t.has_vertex(&"d"));
        assert_eq!(t.expand(["a"]).to_vec(), vec!["a", "c"]);
    }

    #[test]
    fn add_edge_with_no_targets_is_noop() {
        let mut t: Tree<&str> = Tree::new();
        t.add_edge("a", []);
        assert!(t.is_empty());
    }

    #[test]
    fn tree_json_roundtrip() {
        let mut t = Tree::new();
        t.add_edge("g1".to_string(), ["g2".to_string()]);
        t.add_edge("g2".to_string(), ["g1".to_string(), "g3".to_string()]);

        let json = serde_json::to_string(&t).unwrap();
        assert_eq!(json, r#"{"g1":["g2"],"g2":["g1","g3"]}"#);

        let back: Tree<String> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
    }
}
