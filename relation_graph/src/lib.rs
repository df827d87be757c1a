// Typed directed relation graphs for the plan execution engine.
//
// Grounded on `graph::InnerGraph`/`graph::Walk` (pantsbuild-pants's
// dependency-graph crate): vertices are tracked in a side index keyed by the
// caller's vertex type, edges live in a `petgraph` graph, and bulk structural
// edits go through `petgraph` algorithms rather than hand-rolled traversal
// where one already exists (`toposort`, `has_path_connecting`). We use the
// `stable_graph` variant (as `graph::node::EntryId` does) so that removing a
// vertex never reindexes its neighbors.
#![deny(warnings)]
#![deny(clippy::all)]
#![allow(clippy::too_many_arguments, clippy::new_without_default)]

use std::cell::{Cell, RefCell};
use std::fmt;
use std::hash::Hash;
use std::rc::Rc;

use fnv::{FnvHashMap, FnvHashSet};
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use petgraph::Direction;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EdgeClass {
    Tree,
    NonTree,
    ForwardOrCross,
    Back,
}

/// A bitmask of `EdgeClass` values, used to select which edge kinds `each_bfs`
/// and `each_dfs` should report.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EdgeMask(u8);

impl EdgeMask {
    pub const TREE: EdgeMask = EdgeMask(1);
    pub const NON_TREE: EdgeMask = EdgeMask(2);
    pub const FORWARD_OR_CROSS: EdgeMask = EdgeMask(4);
    pub const BACK: EdgeMask = EdgeMask(8);
    pub const ALL: EdgeMask =
        EdgeMask(Self::TREE.0 | Self::NON_TREE.0 | Self::FORWARD_OR_CROSS.0 | Self::BACK.0);

    fn bit(class: EdgeClass) -> u8 {
        match class {
            EdgeClass::Tree => Self::TREE.0,
            EdgeClass::NonTree => Self::NON_TREE.0,
            EdgeClass::ForwardOrCross => Self::FORWARD_OR_CROSS.0,
            EdgeClass::Back => Self::BACK.0,
        }
    }

    pub fn contains(&self, class: EdgeClass) -> bool {
        self.0 & Self::bit(class) != 0
    }

    fn intersects(&self, other: EdgeMask) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for EdgeMask {
    type Output = EdgeMask;
    fn bitor(self, rhs: EdgeMask) -> EdgeMask {
        EdgeMask(self.0 | rhs.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DfsSignal {
    Continue,
    Prune,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RelationError {
    AlreadyLinked,
    Cycle,
    /// BFS has no forward/cross or back edges; requesting them is a usage error.
    InvalidBfsMask,
    NoSuchVertex,
}

impl fmt::Display for RelationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelationError::AlreadyLinked => write!(f, "vertices are already linked"),
            RelationError::Cycle => write!(f, "relation graph contains a cycle"),
            RelationError::InvalidBfsMask => {
                write!(f, "BFS cannot produce FORWARD_OR_CROSS or BACK edges")
            }
            RelationError::NoSuchVertex => write!(f, "vertex is not present in this relation"),
        }
    }
}

impl std::error::Error for RelationError {}

type PGraph<V, I> = StableDiGraph<V, I, u32>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// A named directed graph with per-edge payload, as described by spec section
/// 4.1 (Relation Graph). `strong` relations anchor GC liveness and forbid
/// cycles in the task dependency sense; `weak` relations exist only to record
/// constraints and are ignored by reachability-based liveness.
pub struct RelationGraph<V, I>
where
    V: Copy + Eq + Hash,
{
    strong: bool,
    pg: PGraph<V, I>,
    index: FnvHashMap<V, NodeIndex<u32>>,
    version: Cell<u64>,
    reverse_cache: RefCell<Option<(u64, Rc<RelationGraph<V, I>>)>>,
    undirected_cache: RefCell<Option<(u64, Rc<RelationGraph<V, I>>)>>,
}

impl<V, I> RelationGraph<V, I>
where
    V: Copy + Eq + Hash,
    I: Clone,
{
    pub fn new(strong: bool) -> Self {
        RelationGraph {
            strong,
            pg: StableDiGraph::new(),
            index: FnvHashMap::default(),
            version: Cell::new(0),
            reverse_cache: RefCell::new(None),
            undirected_cache: RefCell::new(None),
        }
    }

    pub fn strong(&self) -> bool {
        self.strong
    }

    fn touch(&self) {
        self.version.set(self.version.get() + 1);
    }

    fn idx(&self, v: V) -> Option<NodeIndex<u32>> {
        self.index.get(&v).copied()
    }

    /// Inserts a vertex with no edges, if it is not already present. Idempotent.
    pub fn insert(&mut self, v: V) {
        if !self.index.contains_key(&v) {
            let idx = self.pg.add_node(v);
            self.index.insert(v, idx);
            self.touch();
        }
    }

    /// Removes a vertex and all of its incident edges. Idempotent.
    pub fn remove(&mut self, v: V) {
        if let Some(idx) = self.index.remove(&v) {
            self.pg.remove_node(idx);
            self.touch();
        }
    }

    pub fn contains(&self, v: V) -> bool {
        self.index.contains_key(&v)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Links `src` to `dst` with the given payload. Fails with `AlreadyLinked`
    /// if this relation already connects the pair; use `set` to overwrite a
    /// payload explicitly.
    pub fn link(&mut self, src: V, dst: V, info: I) -> Result<(), RelationError> {
        self.insert(src);
        self.insert(dst);
        let (s, d) = (self.idx(src).unwrap(), self.idx(dst).unwrap());
        if self.pg.find_edge(s, d).is_some() {
            return Err(RelationError::AlreadyLinked);
        }
        self.pg.add_edge(s, d, info);
        self.touch();
        log::trace!("linked {s:?} -> {d:?} (strong={})", self.strong);
        Ok(())
    }

    /// Sets the payload for `src -> dst`, linking them if not already linked.
    pub fn set(&mut self, src: V, dst: V, info: I) {
        self.insert(src);
        self.insert(dst);
        let (s, d) = (self.idx(src).unwrap(), self.idx(dst).unwrap());
        if let Some(edge) = self.pg.find_edge(s, d) {
            self.pg[edge] = info;
        } else {
            self.pg.add_edge(s, d, info);
        }
        self.touch();
    }

    /// Removes the edge `src -> dst`, if present. Idempotent; returns whether
    /// an edge was actually removed.
    pub fn unlink(&mut self, src: V, dst: V) -> bool {
        let Some(s) = self.idx(src) else {
            return false;
        };
        let Some(d) = self.idx(dst) else {
            return false;
        };
        if let Some(edge) = self.pg.find_edge(s, d) {
            self.pg.remove_edge(edge);
            self.touch();
            true
        } else {
            false
        }
    }

    pub fn linked(&self, src: V, dst: V) -> bool {
        match (self.idx(src), self.idx(dst)) {
            (Some(s), Some(d)) => self.pg.find_edge(s, d).is_some(),
            _ => false,
        }
    }

    pub fn payload(&self, src: V, dst: V) -> Option<&I> {
        let s = self.idx(src)?;
        let d = self.idx(dst)?;
        let edge = self.pg.find_edge(s, d)?;
        self.pg.edge_weight(edge)
    }

    pub fn reachable(&self, src: V, dst: V) -> bool {
        match (self.idx(src), self.idx(dst)) {
            (Some(s), Some(d)) => {
                s == d || petgraph::algo::has_path_connecting(&self.pg, s, d, None)
            }
            _ => false,
        }
    }

    pub fn root(&self, v: V) -> bool {
        match self.idx(v) {
            Some(idx) => self
                .pg
                .edges_directed(idx, Direction::Incoming)
                .next()
                .is_none(),
            None => false,
        }
    }

    pub fn leaf(&self, v: V) -> bool {
        match self.idx(v) {
            Some(idx) => self
                .pg
                .edges_directed(idx, Direction::Outgoing)
                .next()
                .is_none(),
            None => false,
        }
    }

    pub fn singleton(&self, v: V) -> bool {
        self.root(v) && self.leaf(v)
    }

    pub fn vertices(&self) -> impl Iterator<Item = V> + '_ {
        self.index.keys().copied()
    }

    pub fn edges(&self) -> impl Iterator<Item = (V, V, &I)> {
        self.pg
            .edge_references()
            .map(move |e| (self.pg[e.source()], self.pg[e.target()], e.weight()))
    }

    /// Outgoing (or incoming) edges from `idx`, sorted by insertion order so
    /// that traversals are deterministic.
    fn neighbors_sorted(&self, idx: NodeIndex<u32>, dir: Direction) -> Vec<(NodeIndex<u32>, &I)> {
        let mut edges: Vec<_> = self
            .pg
            .edges_directed(idx, dir)
            .map(|e| {
                let other = if dir == Direction::Outgoing {
                    e.target()
                } else {
                    e.source()
                };
                (e.id().index(), other, e.weight())
            })
            .collect();
        edges.sort_by_key(|(ord, _, _)| *ord);
        edges.into_iter().map(|(_, other, w)| (other, w)).collect()
    }

    /// Breadth-first traversal from `start`, classifying edges as `Tree` (the
    /// edge used to first discover its target) or `NonTree` (any other edge
    /// encountered). BFS never produces `ForwardOrCross`/`Back` edges;
    /// requesting them in `mask` is a usage error.
    pub fn each_bfs(
        &self,
        start: V,
        mask: EdgeMask,
    ) -> Result<Vec<(V, V, I, EdgeClass)>, RelationError> {
        if mask.intersects(EdgeMask::FORWARD_OR_CROSS | EdgeMask::BACK) {
            return Err(RelationError::InvalidBfsMask);
        }
        let Some(start_idx) = self.idx(start) else {
            return Err(RelationError::NoSuchVertex);
        };

        let mut out = Vec::new();
        let mut visited: FnvHashSet<NodeIndex<u32>> = FnvHashSet::default();
        visited.insert(start_idx);
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(start_idx);

        while let Some(u) = queue.pop_front() {
            for (v, weight) in self.neighbors_sorted(u, Direction::Outgoing) {
                let class = if visited.insert(v) {
                    queue.push_back(v);
                    EdgeClass::Tree
                } else {
                    EdgeClass::NonTree
                };
                if mask.contains(class) {
                    out.push((self.pg[u], self.pg[v], weight.clone(), class));
                }
            }
        }
        Ok(out)
    }

    /// Depth-first traversal from `start` with full TREE/NON_TREE/
    /// FORWARD_OR_CROSS/BACK classification, using discovery/finish ordering.
    /// Returning `DfsSignal::Prune` from `on_edge` for a `Tree` edge skips
    /// descending into its target.
    pub fn each_dfs<F>(&self, start: V, mask: EdgeMask, mut on_edge: F) -> Result<(), RelationError>
    where
        F: FnMut(V, V, &I, EdgeClass) -> DfsSignal,
    {
        let Some(start_idx) = self.idx(start) else {
            return Err(RelationError::NoSuchVertex);
        };
        let mut color: FnvHashMap<NodeIndex<u32>, Color> = FnvHashMap::default();
        self.dfs_visit(start_idx, mask, &mut color, &mut on_edge);
        Ok(())
    }

    fn dfs_visit<F>(
        &self,
        u: NodeIndex<u32>,
        mask: EdgeMask,
        color: &mut FnvHashMap<NodeIndex<u32>, Color>,
        on_edge: &mut F,
    ) where
        F: FnMut(V, V, &I, EdgeClass) -> DfsSignal,
    {
        color.insert(u, Color::Gray);
        for (v, weight) in self.neighbors_sorted(u, Direction::Outgoing) {
            let class = match color.get(&v).copied().unwrap_or(Color::White) {
                Color::White => EdgeClass::Tree,
                Color::Gray => EdgeClass::Back,
                Color::Black => EdgeClass::ForwardOrCross,
            };

            let mut pruned = false;
            if mask.contains(class) {
                let signal = on_edge(self.pg[u], self.pg[v], weight, class);
                if class == EdgeClass::Tree && signal == DfsSignal::Prune {
                    pruned = true;
                }
            }

            if class == EdgeClass::Tree && !pruned {
                self.dfs_visit(v, mask, color, on_edge);
            } else if class == EdgeClass::Tree {
                // Pruned: mark as finished so later traversals treat it as a
                // completed (forward/cross) target rather than re-entering it.
                color.insert(v, Color::Black);
            }
        }
        color.insert(u, Color::Black);
    }

    /// Returns the vector order produced by a topological sort of this
    /// relation, or `RelationError::Cycle` if one exists.
    pub fn topological_sort(&self) -> Result<Vec<V>, RelationError> {
        petgraph::algo::toposort(&self.pg, None)
            .map(|ids| ids.into_iter().map(|id| self.pg[id]).collect())
            .map_err(|_| RelationError::Cycle)
    }

    /// Weakly-connected components among the vertices reachable (in either
    /// direction) from `seeds`, or across the whole graph when `seeds` is
    /// `None`.
    pub fn components(&self, seeds: Option<&[V]>, include_singletons: bool) -> Vec<Vec<V>> {
        let universe: Vec<NodeIndex<u32>> = match seeds {
            Some(seeds) => seeds.iter().filter_map(|v| self.idx(*v)).collect(),
            None => self.pg.node_indices().collect(),
        };

        let mut visited: FnvHashSet<NodeIndex<u32>> = FnvHashSet::default();
        let mut out = Vec::new();

        for &seed in &universe {
            if visited.contains(&seed) {
                continue;
            }
            let mut component = Vec::new();
            let mut queue = std::collections::VecDeque::new();
            queue.push_back(seed);
            visited.insert(seed);
            while let Some(u) = queue.pop_front() {
                component.push(self.pg[u]);
                for dir in [Direction::Outgoing, Direction::Incoming] {
                    for n in self.pg.neighbors_directed(u, dir) {
                        if visited.insert(n) {
                            queue.push_back(n);
                        }
                    }
                }
            }
            if include_singletons || component.len() > 1 {
                out.push(component);
            }
        }
        out
    }

    /// The subgraph generated by directed traversal from `seeds`. When
    /// `strict`, only edges whose endpoints are both inside the forward
    /// closure of `seeds` are kept; otherwise, boundary edges that point into
    /// the closure from outside it are also included (bringing their source
    /// vertex along).
    pub fn generated_subgraphs(&self, seeds: &[V], strict: bool) -> RelationGraph<V, I> {
        let mut reached: FnvHashSet<NodeIndex<u32>> = FnvHashSet::default();
        let mut queue = std::collections::VecDeque::new();
        for &seed in seeds {
            if let Some(idx) = self.idx(seed) {
                if reached.insert(idx) {
                    queue.push_back(idx);
                }
            }
        }
        while let Some(u) = queue.pop_front() {
            for v in self.pg.neighbors_directed(u, Direction::Outgoing) {
                if reached.insert(v) {
                    queue.push_back(v);
                }
            }
        }

        let mut out = RelationGraph::new(self.strong);
        for &idx in &reached {
            out.insert(self.pg[idx]);
        }
        for e in self.pg.edge_references() {
            let (s, d) = (e.source(), e.target());
            let s_in = reached.contains(&s);
            let d_in = reached.contains(&d);
            let keep = if strict { s_in && d_in } else { s_in || d_in };
            if keep {
                out.insert(self.pg[s]);
                out.insert(self.pg[d]);
                out.set(self.pg[s], self.pg[d], e.weight().clone());
            }
        }
        out
    }

    /// All edges within `depth` hops of `start`, in either direction.
    pub fn neighborhood(&self, start: V, depth: usize) -> Vec<(V, V, I)> {
        let Some(start_idx) = self.idx(start) else {
            return Vec::new();
        };
        let mut visited: FnvHashSet<NodeIndex<u32>> = FnvHashSet::default();
        visited.insert(start_idx);
        let mut frontier = vec![start_idx];
        let mut seen_edges: FnvHashSet<(NodeIndex<u32>, NodeIndex<u32>)> = FnvHashSet::default();
        let mut out = Vec::new();

        for _ in 0..depth {
            let mut next = Vec::new();
            for u in frontier {
                for dir in [Direction::Outgoing, Direction::Incoming] {
                    for e in self.pg.edges_directed(u, dir) {
                        let (s, d) = (e.source(), e.target());
                        if seen_edges.insert((s, d)) {
                            out.push((self.pg[s], self.pg[d], e.weight().clone()));
                        }
                        let other = if dir == Direction::Outgoing { d } else { s };
                        if visited.insert(other) {
                            next.push(other);
                        }
                    }
                }
            }
            frontier = next;
            if frontier.is_empty() {
                break;
            }
        }
        out
    }

    /// Compares edges incident to `vertices` in `self` with their counterpart
    /// (via `mapping`) in `other`, returning `(only_in_self, only_in_other,
    /// different_payload)`.
    pub fn difference<F>(
        &self,
        other: &RelationGraph<V, I>,
        vertices: &[V],
        mapping: F,
    ) -> (Vec<(V, V, I)>, Vec<(V, V, I)>, Vec<(V, V, I, I)>)
    where
        I: PartialEq,
        F: Fn(V) -> Option<V>,
    {
        let vset: FnvHashSet<V> = vertices.iter().copied().collect();
        let mut only_in_self = Vec::new();
        let mut different = Vec::new();

        for (s, d, info) in self.edges() {
            if !(vset.contains(&s) || vset.contains(&d)) {
                continue;
            }
            match (mapping(s), mapping(d)) {
                (Some(ms), Some(md)) => match other.payload(ms, md) {
                    Some(other_info) if other_info == info => {}
                    Some(other_info) => {
                        different.push((s, d, info.clone(), other_info.clone()));
                    }
                    None => only_in_self.push((s, d, info.clone())),
                },
                _ => only_in_self.push((s, d, info.clone())),
            }
        }

        let mapped_vset: FnvHashSet<V> = vertices.iter().filter_map(|&v| mapping(v)).collect();
        let reverse = |target: V| -> Option<V> {
            vertices
                .iter()
                .find(|&&v| mapping(v) == Some(target))
                .copied()
        };
        let mut only_in_other = Vec::new();
        for (s, d, info) in other.edges() {
            if !(mapped_vset.contains(&s) || mapped_vset.contains(&d)) {
                continue;
            }
            let both_mapped_back = reverse(s).is_some() && reverse(d).is_some();
            if !both_mapped_back {
                only_in_other.push((s, d, info.clone()));
                continue;
            }
            let (rs, rd) = (reverse(s).unwrap(), reverse(d).unwrap());
            if self.payload(rs, rd).is_none() {
                only_in_other.push((s, d, info.clone()));
            }
        }

        (only_in_self, only_in_other, different)
    }

    /// Returns a cached reversed view of this graph (same object identity
    /// across calls until the graph next mutates).
    pub fn reversed(&self) -> Rc<RelationGraph<V, I>> {
        let current = self.version.get();
        if let Some((v, g)) = self.reverse_cache.borrow().as_ref() {
            if *v == current {
                return g.clone();
            }
        }
        let mut reversed = RelationGraph::new(self.strong);
        for v in self.vertices() {
            reversed.insert(v);
        }
        for (s, d, info) in self.edges() {
            reversed.set(d, s, info.clone());
        }
        let rc = Rc::new(reversed);
        *self.reverse_cache.borrow_mut() = Some((current, rc.clone()));
        rc
    }

    /// Returns a cached undirected view of this graph (every edge mirrored in
    /// both directions), with the same object-identity caching as `reversed`.
    pub fn undirected(&self) -> Rc<RelationGraph<V, I>> {
        let current = self.version.get();
        if let Some((v, g)) = self.undirected_cache.borrow().as_ref() {
            if *v == current {
                return g.clone();
            }
        }
        let mut undirected = RelationGraph::new(self.strong);
        for v in self.vertices() {
            undirected.insert(v);
        }
        for (s, d, info) in self.edges() {
            undirected.set(s, d, info.clone());
            undirected.set(d, s, info.clone());
        }
        let rc = Rc::new(undirected);
        *self.undirected_cache.borrow_mut() = Some((current, rc.clone()));
        rc
    }
}
