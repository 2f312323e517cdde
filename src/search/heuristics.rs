//! Per-goal search heuristics.
//!
//! A [`Heuristic`] scores states for the open list, scores them again for the
//! focal list, and fills in a freshly expanded child's `g`/`h` (and for the
//! distance goal, `dist`). The engine is generic over the heuristic, so each
//! goal pays only for what it uses.

use crate::boxes::{box_contains, boxes_overlap, BoxStore};
use crate::graph::Graph;
use crate::search::State;

/// What a heuristic gets to look at while updating a child state.
pub struct HeurCtx<'a> {
    /// Graph with propagated bounds, vertices sorted by upper bound
    /// descending.
    pub graph: &'a Graph,
    /// Arena holding the states' boxes.
    pub arena: &'a BoxStore,
}

/// Scoring contract between the engine and a search goal.
pub trait Heuristic {
    /// Fill in the scores of `child` (whose `indep_set` and box are already
    /// set) from its parent and the newly chosen leaf value. Returns `false`
    /// when the child provably cannot lead to a solution of interest; the
    /// engine then drops it.
    fn update(&self, child: &mut State, parent: &State, leaf_value: f32, ctx: &HeurCtx<'_>)
        -> bool;

    /// Open-list score under the given ε. Higher is better.
    fn open_score(&self, state: &State, eps: f32) -> f32;

    /// Relax a top-of-open score: states scoring at least the relaxed value
    /// belong to the focal list.
    fn relax_open_score(&self, top_score: f32, eps: f32) -> f32;

    /// The true ensemble output of a state (exact for solutions).
    fn true_output(&self, state: &State) -> f32;

    /// Strict order on the open list. Ties fall back to deeper states first,
    /// then insertion order, which keeps runs deterministic.
    fn better_open(&self, a: &State, b: &State, eps: f32) -> bool {
        let (fa, fb) = (self.open_score(a, eps), self.open_score(b, eps));
        if fa != fb {
            return fa > fb;
        }
        if a.indep_set != b.indep_set {
            return a.indep_set > b.indep_set;
        }
        a.seq < b.seq
    }

    /// Strict order on the focal list; may be inadmissible.
    fn better_focal(&self, a: &State, b: &State) -> bool;
}

/// Admissible completion bound: sum, over the sets from `start` on, of the
/// largest output among vertices compatible with `cbox`. `None` when some set
/// has no compatible vertex, i.e. the state cannot be completed.
fn completion_upper_bound(
    cbox: &[crate::boxes::DomainPair],
    graph: &Graph,
    start: usize,
) -> Option<f32> {
    let store = graph.store();
    let mut h = 0.0f32;
    for set in &graph.sets()[start..] {
        let mut best = f32::NEG_INFINITY;
        for w in &set.vertices {
            if boxes_overlap(store.get(w.box_ref), cbox) {
                best = best.max(w.output);
            }
        }
        if best == f32::NEG_INFINITY {
            return None;
        }
        h += best;
    }
    Some(h)
}

/// Maximize the ensemble output.
///
/// `g` is the summed output of the chosen leaves (plus base score), `h` an
/// admissible completion bound, and the open score the ARA* relaxation
/// `g + eps * h`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaxOutputHeuristic;

impl Heuristic for MaxOutputHeuristic {
    fn update(
        &self,
        child: &mut State,
        parent: &State,
        leaf_value: f32,
        ctx: &HeurCtx<'_>,
    ) -> bool {
        child.g = parent.g + leaf_value;

        let start = (child.indep_set + 1) as usize;
        let sets = ctx.graph.sets();
        if start >= sets.len() {
            child.h = 0.0;
            return true;
        }

        let cbox = ctx.arena.get(child.box_ref);
        let gstore = ctx.graph.store();

        // Bound-table cache: when the child's box sits inside the first
        // compatible vertex of the next set, that vertex's propagated bound
        // is a valid completion bound. Vertices are sorted by upper bound
        // descending, so the first compatible one carries the largest bound.
        for w in &sets[start].vertices {
            let wbox = gstore.get(w.box_ref);
            if boxes_overlap(wbox, cbox) {
                if box_contains(wbox, cbox) {
                    child.h = w.max_bound;
                    return child.h > f32::NEG_INFINITY;
                }
                break;
            }
        }

        match completion_upper_bound(cbox, ctx.graph, start) {
            Some(h) => {
                child.h = h;
                true
            }
            None => false,
        }
    }

    #[inline]
    fn open_score(&self, state: &State, eps: f32) -> f32 {
        state.g + eps * state.h
    }

    #[inline]
    fn relax_open_score(&self, top_score: f32, eps: f32) -> f32 {
        eps * top_score
    }

    #[inline]
    fn true_output(&self, state: &State) -> f32 {
        state.g
    }

    /// Prefer deeper states, then larger summed output: drives the focal pop
    /// toward finishing a clique.
    fn better_focal(&self, a: &State, b: &State) -> bool {
        if a.indep_set != b.indep_set {
            return a.indep_set > b.indep_set;
        }
        a.g > b.g
    }
}

/// Find the closest input (in summed per-feature box distance) to a reference
/// example whose ensemble output reaches a threshold.
///
/// States carry both the score `g` (used to prune selections that can no
/// longer reach the threshold) and the distance `dist` from the example to
/// the state's box. The open list minimizes distance via a negated score.
#[derive(Debug, Clone)]
pub struct MinDistToExampleHeuristic {
    example: Vec<f32>,
    threshold: f32,
}

impl MinDistToExampleHeuristic {
    pub fn new(example: Vec<f32>, threshold: f32) -> Self {
        Self { example, threshold }
    }

    fn distance_to_box(&self, pairs: &[crate::boxes::DomainPair]) -> f32 {
        pairs
            .iter()
            .map(|(feat, iv)| {
                let x = self.example.get(*feat as usize).copied().unwrap_or(0.0);
                iv.distance_to_value(x)
            })
            .sum()
    }
}

impl Heuristic for MinDistToExampleHeuristic {
    fn update(
        &self,
        child: &mut State,
        parent: &State,
        leaf_value: f32,
        ctx: &HeurCtx<'_>,
    ) -> bool {
        child.g = parent.g + leaf_value;

        let start = (child.indep_set + 1) as usize;
        let cbox = ctx.arena.get(child.box_ref);

        if start < ctx.graph.sets().len() {
            match completion_upper_bound(cbox, ctx.graph, start) {
                Some(h) => child.h = h,
                None => return false,
            }
        } else {
            child.h = 0.0;
        }

        // the score must still be able to reach the threshold
        if child.g + child.h < self.threshold {
            return false;
        }

        child.dist = self.distance_to_box(cbox);
        true
    }

    /// Negated distance: the max-heap then prefers the closest box.
    #[inline]
    fn open_score(&self, state: &State, _eps: f32) -> f32 {
        -state.dist
    }

    /// For non-positive scores, dividing by ε widens the focal window to
    /// distances within a `1/ε` factor of the best.
    #[inline]
    fn relax_open_score(&self, top_score: f32, eps: f32) -> f32 {
        top_score / eps
    }

    #[inline]
    fn true_output(&self, state: &State) -> f32 {
        state.g
    }

    fn better_focal(&self, a: &State, b: &State) -> bool {
        if a.dist != b.dist {
            return a.dist < b.dist;
        }
        a.indep_set > b.indep_set
    }
}
