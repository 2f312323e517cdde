//! K-partite graph over the reachable leaves of an ensemble.
//!
//! One part (independent set) per tree, one vertex per leaf. A vertex carries
//! the leaf's root-to-leaf box and its output value; two vertices from
//! different parts are compatible iff their boxes overlap. Bound propagation
//! annotates every vertex with admissible completion bounds.

use crate::boxes::{boxes_overlap, BoxRef, BoxStore, DomainPair};
use crate::error::SearchError;
use crate::trees::AddTree;
use crate::trees::Tree;

/// One reachable leaf of one tree.
#[derive(Debug, Clone, Copy)]
pub struct Vertex {
    /// Intersection of the split constraints on the root-to-leaf path.
    pub box_ref: BoxRef,
    /// The leaf value.
    pub output: f32,
    /// Tightest known lower bound on any full selection through this vertex.
    pub min_bound: f32,
    /// Tightest known upper bound on any full selection through this vertex.
    pub max_bound: f32,
}

impl Vertex {
    fn new(box_ref: BoxRef, output: f32) -> Self {
        Self {
            box_ref,
            output,
            min_bound: output,
            max_bound: output,
        }
    }
}

/// The vertex list of one tree-part.
#[derive(Debug, Clone, Default)]
pub struct IndependentSet {
    pub vertices: Vec<Vertex>,
}

/// A k-partite graph built from an [`AddTree`].
///
/// Owns the arena holding every vertex box. When the ensemble has a non-zero
/// base score, a synthetic singleton set carrying `(empty box, base)` is
/// prepended so that summing one vertex per set gives the full ensemble
/// output.
#[derive(Debug, Clone)]
pub struct Graph {
    store: BoxStore,
    sets: Vec<IndependentSet>,
}

impl Graph {
    /// Build the graph, including the base-score singleton set when the base
    /// score is non-zero.
    pub fn from_addtree(at: &AddTree) -> Result<Self, SearchError> {
        Self::build(at, true)
    }

    /// Build the graph with tree sets only; the caller accounts for the base
    /// score itself.
    pub fn from_addtree_no_base(at: &AddTree) -> Result<Self, SearchError> {
        Self::build(at, false)
    }

    fn build(at: &AddTree, with_base: bool) -> Result<Self, SearchError> {
        if at.num_leaf_values() != 1 {
            return Err(SearchError::NonScalarEnsemble {
                n_leaf_values: at.num_leaf_values(),
            });
        }

        let mut graph = Graph {
            store: BoxStore::new(),
            sets: Vec::with_capacity(at.num_trees() + 1),
        };

        let base = at.base_score(0);
        if with_base && base != 0.0 {
            graph.sets.push(IndependentSet {
                vertices: vec![Vertex::new(BoxRef::EMPTY, base)],
            });
        }

        for tree in at.trees() {
            let set = graph.fill_set(tree)?;
            graph.sets.push(set);
        }
        Ok(graph)
    }

    /// One vertex per leaf, in depth-first (left-to-right) leaf order. The
    /// leaf box is assembled by walking the path back to the root through the
    /// store workspace.
    fn fill_set(&mut self, tree: &Tree) -> Result<IndependentSet, SearchError> {
        let mut leaves = Vec::with_capacity(tree.num_leaves());
        tree.visit_leaves(|id| leaves.push(id));

        let mut vertices = Vec::with_capacity(leaves.len());
        for leaf in leaves {
            let mut node = leaf;
            while let Some(parent) = tree.parent(node) {
                let cond = tree.split(parent);
                self.store
                    .refine_workspace(cond.feat, cond.value, tree.is_left_child(node));
                node = parent;
            }
            let box_ref = self.store.push_workspace()?;
            vertices.push(Vertex::new(box_ref, tree.leaf_value(leaf, 0)));
        }
        Ok(IndependentSet { vertices })
    }

    /// Drop every vertex whose box fails the predicate.
    pub fn prune<F: FnMut(&[DomainPair]) -> bool>(&mut self, mut keep: F) {
        let Self { store, sets } = self;
        for set in sets.iter_mut() {
            set.vertices.retain(|v| keep(store.get(v.box_ref)));
        }
    }

    /// Intersect every vertex box with `b`; drop vertices whose intersection
    /// is empty, and replace surviving boxes with the intersection.
    ///
    /// On out-of-memory the graph is left memory-safe but partially pruned
    /// and should be discarded.
    pub fn prune_by_box(&mut self, b: &[DomainPair]) -> Result<(), SearchError> {
        let mut sets = std::mem::take(&mut self.sets);
        let result = (|| -> Result<(), SearchError> {
            for set in &mut sets {
                let old = std::mem::take(&mut set.vertices);
                for v in old {
                    if !boxes_overlap(self.store.get(v.box_ref), b) {
                        continue;
                    }
                    if !self.store.combine_in_workspace(b, v.box_ref) {
                        continue;
                    }
                    let new_ref = self.store.push_workspace()?;
                    set.vertices.push(Vertex::new(new_ref, v.output));
                }
            }
            Ok(())
        })();
        self.sets = sets;
        result
    }

    /// Per-vertex admissible completion bounds, propagated from the last set
    /// to the first. Returns the overall `(min, max)` ensemble bounds.
    ///
    /// A vertex with no compatible successor gets `±inf` bounds; an overall
    /// `±inf` result means the problem is infeasible (no full selection
    /// exists).
    pub fn propagate_outputs(&mut self) -> (f32, f32) {
        let Self { store, sets } = self;
        if sets.is_empty() {
            return (0.0, 0.0);
        }

        for i in (0..sets.len() - 1).rev() {
            let (head, tail) = sets.split_at_mut(i + 1);
            let current = &mut head[i];
            let next = &tail[0];
            for v in &mut current.vertices {
                let v_box = store.get(v.box_ref);
                let mut agg_min = f32::INFINITY;
                let mut agg_max = f32::NEG_INFINITY;
                for w in &next.vertices {
                    if boxes_overlap(v_box, store.get(w.box_ref)) {
                        agg_min = agg_min.min(w.min_bound);
                        agg_max = agg_max.max(w.max_bound);
                    }
                }
                v.min_bound = v.output + agg_min;
                v.max_bound = v.output + agg_max;
            }
        }

        let mut lo = f32::INFINITY;
        let mut hi = f32::NEG_INFINITY;
        for v in &sets[0].vertices {
            lo = lo.min(v.min_bound);
            hi = hi.max(v.max_bound);
        }
        (lo, hi)
    }

    /// Quick `(min, max)` bound ignoring box compatibility: the sum of each
    /// set's extreme outputs. Never tighter than [`Graph::propagate_outputs`].
    pub fn basic_bound(&self) -> (f32, f32) {
        let mut lo = 0.0f32;
        let mut hi = 0.0f32;
        for set in &self.sets {
            let mut set_lo = f32::INFINITY;
            let mut set_hi = f32::NEG_INFINITY;
            for v in &set.vertices {
                set_lo = set_lo.min(v.output);
                set_hi = set_hi.max(v.output);
            }
            lo += set_lo;
            hi += set_hi;
        }
        (lo, hi)
    }

    /// Combine every `k` consecutive sets into one: the Cartesian product
    /// restricted to overlapping pairs, with intersected boxes and summed
    /// outputs. `merge(1)` is a no-op.
    pub fn merge(&mut self, k: usize) -> Result<(), SearchError> {
        assert!(k >= 1, "merge factor must be at least 1");
        let old_sets = std::mem::take(&mut self.sets);
        let mut new_sets = Vec::new();
        let mut it = old_sets.into_iter();

        let mut result = Ok(());
        'outer: while let Some(mut acc) = it.next() {
            for _ in 1..k {
                let Some(next) = it.next() else { break };
                let mut combined = IndependentSet::default();
                for v0 in &acc.vertices {
                    for v1 in &next.vertices {
                        match self.store.combine_and_push(v0.box_ref, v1.box_ref) {
                            Ok(Some(box_ref)) => combined
                                .vertices
                                .push(Vertex::new(box_ref, v0.output + v1.output)),
                            Ok(None) => {} // incompatible pair
                            Err(e) => {
                                result = Err(e);
                                new_sets.push(combined);
                                break 'outer;
                            }
                        }
                    }
                }
                acc = combined;
            }
            new_sets.push(acc);
        }

        self.sets = new_sets;
        result
    }

    /// Sort every set's vertices by leaf output, smallest first.
    pub fn sort_by_output_asc(&mut self) {
        for set in &mut self.sets {
            set.vertices.sort_by(|a, b| a.output.total_cmp(&b.output));
        }
    }

    /// Sort every set's vertices by leaf output, largest first.
    pub fn sort_by_output_desc(&mut self) {
        for set in &mut self.sets {
            set.vertices.sort_by(|a, b| b.output.total_cmp(&a.output));
        }
    }

    /// Sort every set's vertices by propagated lower bound, smallest first.
    pub fn sort_by_bound_asc(&mut self) {
        for set in &mut self.sets {
            set.vertices.sort_by(|a, b| a.min_bound.total_cmp(&b.min_bound));
        }
    }

    /// Sort every set's vertices by propagated upper bound, largest first.
    pub fn sort_by_bound_desc(&mut self) {
        for set in &mut self.sets {
            set.vertices.sort_by(|a, b| b.max_bound.total_cmp(&a.max_bound));
        }
    }

    #[inline]
    pub fn num_independent_sets(&self) -> usize {
        self.sets.len()
    }

    pub fn num_vertices(&self) -> usize {
        self.sets.iter().map(|s| s.vertices.len()).sum()
    }

    pub fn num_vertices_in_set(&self, indep_set: usize) -> usize {
        self.sets[indep_set].vertices.len()
    }

    #[inline]
    pub fn set(&self, indep_set: usize) -> &IndependentSet {
        &self.sets[indep_set]
    }

    #[inline]
    pub fn sets(&self) -> &[IndependentSet] {
        &self.sets
    }

    #[inline]
    pub fn store(&self) -> &BoxStore {
        &self.store
    }
}

impl std::fmt::Display for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Graph {{")?;
        for set in &self.sets {
            writeln!(f, "  IndependentSet {{")?;
            for v in &set.vertices {
                writeln!(
                    f,
                    "    v({:.3},{:.3},{:.3}) {}",
                    v.output,
                    v.min_bound,
                    v.max_bound,
                    crate::boxes::format_box(self.store.get(v.box_ref)),
                )?;
            }
            writeln!(f, "  }}")?;
        }
        write!(f, "}}")
    }
}
