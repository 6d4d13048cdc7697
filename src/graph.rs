//! Resource Dependency Graph
//!
//! Tracks which pending resources wait on which prerequisites. The loader
//! never walks edges top-down; instead it asks for the **top nodes**, the
//! tracked resources with no unresolved prerequisites left, drives those,
//! and removes them once they reach a terminal state. Removal releases the
//! reverse edges, which promotes dependents into top nodes on a later tick.
//!
//! The graph is state-agnostic: callers decide which edges to record (a
//! prerequisite that already finished loading never enters the graph) and
//! when a node may be removed. All methods take `&mut self`; the manager
//! wraps the graph in its own lock.

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::resource::ResourceId;

#[derive(Debug, Default)]
struct GraphNode {
    depends_on: SmallVec<[ResourceId; 4]>,
    depended_by: SmallVec<[ResourceId; 4]>,
}

/// Dependency graph over pending resources.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: FxHashMap<ResourceId, GraphNode>,
    // Memoized top-node list, rebuilt lazily after any mutation.
    tops: Option<Vec<ResourceId>>,
}

impl DependencyGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks `id` as a node with no edges yet. No-op if already tracked.
    pub fn track(&mut self, id: ResourceId) {
        if !self.nodes.contains_key(&id) {
            self.nodes.insert(id, GraphNode::default());
            self.tops = None;
        }
    }

    /// Records that `dependent` cannot finish before `prerequisite`.
    ///
    /// Both endpoints are tracked on demand and duplicate edges collapse.
    /// Self-edges are ignored; a cycle is a caller bug and trips a debug
    /// assertion.
    pub fn add_edge(&mut self, dependent: ResourceId, prerequisite: ResourceId) {
        if dependent == prerequisite {
            debug_assert!(false, "resource declared a dependency on itself");
            return;
        }
        debug_assert!(
            !self.would_cycle(dependent, prerequisite),
            "dependency edge would close a cycle"
        );
        {
            let node = self.nodes.entry(dependent).or_default();
            if node.depends_on.contains(&prerequisite) {
                return;
            }
            node.depends_on.push(prerequisite);
        }
        self.nodes.entry(prerequisite).or_default().depended_by.push(dependent);
        self.tops = None;
    }

    /// Whether `id` is currently tracked.
    #[must_use]
    pub fn contains(&self, id: ResourceId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Number of tracked nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Unresolved prerequisite ids of `id`; empty when untracked.
    #[must_use]
    pub fn prerequisites(&self, id: ResourceId) -> Vec<ResourceId> {
        self.nodes.get(&id).map(|node| node.depends_on.to_vec()).unwrap_or_default()
    }

    /// Ids of tracked resources with no unresolved prerequisites, in no
    /// particular order. Memoized until the next mutation.
    pub fn top_nodes(&mut self) -> Vec<ResourceId> {
        if self.tops.is_none() {
            self.tops = Some(
                self.nodes
                    .iter()
                    .filter(|(_, node)| node.depends_on.is_empty())
                    .map(|(id, _)| *id)
                    .collect(),
            );
        }
        self.tops.clone().unwrap_or_default()
    }

    /// Removes a node whose load completed. Its dependents lose the edge
    /// and may become top nodes. The node must not have unresolved
    /// prerequisites of its own.
    pub fn remove_node(&mut self, id: ResourceId) {
        debug_assert!(
            self.nodes.get(&id).is_none_or(|n| n.depends_on.is_empty()),
            "removed a node that still has unresolved prerequisites"
        );
        self.detach(id);
    }

    /// Removes a node regardless of remaining edges, detaching it from its
    /// neighbors on both sides. Cleanup path for abandoned creations.
    pub fn detach(&mut self, id: ResourceId) {
        let Some(node) = self.nodes.remove(&id) else {
            return;
        };
        for pre in &node.depends_on {
            if let Some(p) = self.nodes.get_mut(pre) {
                p.depended_by.retain(|d| *d != id);
            }
        }
        for dep in &node.depended_by {
            if let Some(d) = self.nodes.get_mut(dep) {
                d.depends_on.retain(|p| *p != id);
            }
        }
        self.tops = None;
    }

    /// Drops every node and edge.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.tops = None;
    }

    /// Removes `id` together with every node connected to it, in either
    /// direction, calling `on_removed` for each (including `id`). Used for
    /// explicit teardown of an abandoned subgraph; ordinary failures retire
    /// through [`Self::remove_node`] like successes do.
    pub fn remove_connected_subgraph(
        &mut self,
        id: ResourceId,
        mut on_removed: impl FnMut(ResourceId),
    ) {
        if !self.nodes.contains_key(&id) {
            return;
        }
        let mut seen = FxHashSet::default();
        seen.insert(id);
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.remove(&current) else {
                continue;
            };
            on_removed(current);
            for next in node.depends_on.iter().chain(node.depended_by.iter()) {
                if seen.insert(*next) {
                    stack.push(*next);
                }
            }
        }
        self.tops = None;
    }

    // Cycle probe for debug assertions: adding dependent -> prerequisite
    // closes a cycle iff dependent is already reachable from prerequisite.
    fn would_cycle(&self, dependent: ResourceId, prerequisite: ResourceId) -> bool {
        let mut seen = FxHashSet::default();
        let mut stack = vec![prerequisite];
        while let Some(current) = stack.pop() {
            if current == dependent {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(node) = self.nodes.get(&current) {
                stack.extend(node.depends_on.iter().copied());
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use slotmap::SlotMap;

    use super::*;

    fn ids<const N: usize>() -> [ResourceId; N] {
        let mut arena: SlotMap<ResourceId, ()> = SlotMap::with_key();
        std::array::from_fn(|_| arena.insert(()))
    }

    #[test]
    fn test_tracked_node_without_edges_is_top() {
        let [a] = ids();
        let mut graph = DependencyGraph::new();
        graph.track(a);
        assert!(graph.contains(a));
        assert_eq!(graph.top_nodes(), vec![a]);
    }

    #[test]
    fn test_dependent_is_not_top_until_prerequisite_removed() {
        let [mat, prog] = ids();
        let mut graph = DependencyGraph::new();
        graph.add_edge(mat, prog);

        let tops = graph.top_nodes();
        assert_eq!(tops, vec![prog]);

        graph.remove_node(prog);
        assert_eq!(graph.top_nodes(), vec![mat]);

        graph.remove_node(mat);
        assert!(graph.is_empty());
    }

    #[test]
    fn test_duplicate_edges_collapse() {
        let [mat, prog] = ids();
        let mut graph = DependencyGraph::new();
        graph.add_edge(mat, prog);
        graph.add_edge(mat, prog);
        assert_eq!(graph.len(), 2);

        // A single removal must fully release the dependent.
        graph.remove_node(prog);
        assert_eq!(graph.top_nodes(), vec![mat]);
    }

    #[test]
    fn test_diamond_releases_in_waves() {
        // mat depends on two passes, both passes depend on one program.
        let [mat, pass_a, pass_b, prog] = ids();
        let mut graph = DependencyGraph::new();
        graph.add_edge(mat, pass_a);
        graph.add_edge(mat, pass_b);
        graph.add_edge(pass_a, prog);
        graph.add_edge(pass_b, prog);

        assert_eq!(graph.top_nodes(), vec![prog]);
        graph.remove_node(prog);

        let mut wave: Vec<_> = graph.top_nodes();
        wave.sort();
        let mut expected = vec![pass_a, pass_b];
        expected.sort();
        assert_eq!(wave, expected);

        graph.remove_node(pass_a);
        graph.remove_node(pass_b);
        assert_eq!(graph.top_nodes(), vec![mat]);
    }

    #[test]
    fn test_top_nodes_memo_survives_reads() {
        let [a, b] = ids();
        let mut graph = DependencyGraph::new();
        graph.add_edge(a, b);
        let first = graph.top_nodes();
        let second = graph.top_nodes();
        assert_eq!(first, second);
    }

    #[test]
    fn test_remove_connected_subgraph_takes_whole_component() {
        let [mat, prog, tex, lone] = ids();
        let mut graph = DependencyGraph::new();
        graph.add_edge(mat, prog);
        graph.add_edge(mat, tex);
        graph.track(lone);

        let mut removed = Vec::new();
        graph.remove_connected_subgraph(prog, |id| removed.push(id));

        removed.sort();
        let mut expected = vec![mat, prog, tex];
        expected.sort();
        assert_eq!(removed, expected);

        assert_eq!(graph.len(), 1);
        assert!(graph.contains(lone));
    }

    #[test]
    fn test_remove_node_is_noop_for_unknown_id() {
        let [a, ghost] = ids();
        let mut graph = DependencyGraph::new();
        graph.track(a);
        graph.remove_node(ghost);
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_detach_releases_both_directions() {
        // prog sits between mat (dependent) and tex (prerequisite).
        let [mat, prog, tex] = ids();
        let mut graph = DependencyGraph::new();
        graph.add_edge(mat, prog);
        graph.add_edge(prog, tex);

        graph.detach(prog);

        assert_eq!(graph.prerequisites(mat), Vec::new());
        let mut tops = graph.top_nodes();
        tops.sort();
        let mut expected = vec![mat, tex];
        expected.sort();
        assert_eq!(tops, expected);
    }

    #[test]
    fn test_prerequisites_lists_unresolved_edges() {
        let [mat, prog, tex] = ids();
        let mut graph = DependencyGraph::new();
        graph.add_edge(mat, prog);
        graph.add_edge(mat, tex);

        let mut prereqs = graph.prerequisites(mat);
        prereqs.sort();
        let mut expected = vec![prog, tex];
        expected.sort();
        assert_eq!(prereqs, expected);
        assert!(graph.prerequisites(prog).is_empty());
    }
}
