//! Best-first search over partial leaf selections.
//!
//! The engine maintains a max-heap of *states* (one chosen leaf per tree for
//! trees `0..=indep_set`, plus the intersection of their boxes) ordered by
//! the ε-relaxed score `g + ε·h`. Expansion pops a state from the *focal
//! list* (the near-best states, ranked by an inadmissible secondary score),
//! walks the next tree's leaves compatible with the state's box, and pushes
//! one child per reachable leaf. States that chose a leaf in every tree are
//! solutions; with an admissible heuristic and ε = 1 the first popped
//! solution is optimal.

pub mod heap;
pub mod heuristics;
pub mod parallel;

pub use heuristics::{HeurCtx, Heuristic, MaxOutputHeuristic, MinDistToExampleHeuristic};
pub use parallel::ParSearch;

use std::sync::Arc;
use std::time::Instant;

use crate::boxes::{boxes_overlap, BoxRef, BoxStore, DomainPair};
use crate::error::SearchError;
use crate::graph::Graph;
use crate::logger::{SearchLogger, Verbosity};
use crate::trees::tree::ROOT;
use crate::trees::{AddTree, LeafIter, Tree};

/// Why a batch of steps ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Nothing stopped the engine; more work remains.
    None,
    /// The open list is exhausted; every reachable solution was emitted.
    NoMoreOpen,
    NumSolutionsExceeded,
    NumNewSolutionsExceeded,
    /// The best emitted solution provably cannot be improved.
    Optimal,
    /// The upper bound dropped below `stop_when_upper_less_than`.
    UpperLt,
    /// The lower bound rose above `stop_when_lower_greater_than`.
    LowerGt,
}

impl StopReason {
    /// Rank for worst-wins aggregation across workers: thresholds beat
    /// optimality beats exhaustion beats nothing. Errors are tracked
    /// separately and beat everything.
    pub(crate) fn precedence(self) -> u8 {
        match self {
            StopReason::None => 0,
            StopReason::NoMoreOpen => 1,
            StopReason::Optimal => 2,
            StopReason::NumSolutionsExceeded
            | StopReason::NumNewSolutionsExceeded
            | StopReason::UpperLt
            | StopReason::LowerGt => 3,
        }
    }
}

/// Tunable options of a search session.
#[derive(Debug, Clone)]
pub struct SearchSettings {
    /// Initial ε; overridden to 0.5 when `auto_eps` is on.
    pub eps: f32,
    /// Adapt ε as solutions arrive (ARA*-style schedule).
    pub auto_eps: bool,
    /// Bound on the number of open states examined per focal pop.
    pub max_focal_size: usize,
    /// Drop solutions whose output is below this value.
    pub reject_solution_when_output_less_than: f32,
    pub stop_when_num_solutions_exceeds: usize,
    pub stop_when_num_new_solutions_exceeds: usize,
    pub stop_when_optimal: bool,
    pub stop_when_upper_less_than: f32,
    pub stop_when_lower_greater_than: f32,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            eps: 0.95,
            auto_eps: true,
            max_focal_size: 1000,
            reject_solution_when_output_less_than: f32::NEG_INFINITY,
            stop_when_num_solutions_exceeds: usize::MAX,
            stop_when_num_new_solutions_exceeds: usize::MAX,
            stop_when_optimal: true,
            stop_when_upper_less_than: f32::NEG_INFINITY,
            stop_when_lower_greater_than: f32::INFINITY,
        }
    }
}

/// A partial selection of one leaf per tree for trees `0..=indep_set`.
#[derive(Debug, Clone, Copy)]
pub struct State {
    /// Index of the last tree with a chosen leaf; -1 for the initial state.
    pub indep_set: i16,
    /// Intersection of the chosen leaves' boxes.
    pub box_ref: BoxRef,
    /// Base score plus the summed outputs of the chosen leaves.
    pub g: f32,
    /// Admissible completion bound over the remaining trees.
    pub h: f32,
    /// Distance accumulator, used by the distance heuristic only.
    pub dist: f32,
    /// Insertion order, the final tie-break for determinism.
    pub seq: u32,
}

/// An emitted solution.
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    /// Seconds since the session started when this solution was found.
    pub time: f64,
    /// ε at the moment of discovery.
    pub eps: f32,
    /// Exact ensemble output on the solution box.
    pub output: f32,
    /// The solution's input-space box.
    pub box_pairs: Vec<DomainPair>,
}

/// Progress sample, appended once per [`Search::steps`] call.
#[derive(Debug, Clone, Copy)]
pub struct Snapshot {
    pub time: f64,
    pub num_steps: u64,
    pub num_solutions: usize,
    pub num_open: usize,
    pub eps: f32,
    /// `(lower, upper, top-of-open)`.
    pub bounds: (f32, f32, f32),
    pub avg_focal_size: f64,
}

#[derive(Debug, Clone)]
struct SolEntry {
    state: State,
    time: f64,
    eps: f32,
    output: f32,
}

/// Immutable precompute shared by all workers of a session: the (neutralized)
/// ensemble, the bound-propagated graph, and the per-node path boxes.
#[derive(Debug)]
struct SearchShared {
    at: AddTree,
    graph: Graph,
    /// `node_boxes[tree][node]`: intersection of the splits on the
    /// root-to-node path; [`BoxRef::INVALID`] when pruned unreachable.
    node_boxes: Vec<Vec<BoxRef>>,
    pre_store: BoxStore,
}

/// A single-threaded search session over an [`AddTree`].
pub struct Search<H: Heuristic> {
    shared: Arc<SearchShared>,
    pub settings: SearchSettings,
    heuristic: H,

    /// Arena for state boxes; its ceiling is the session's memory budget.
    store: BoxStore,
    open: Vec<State>,
    solutions: Vec<SolEntry>,
    snapshots: Vec<Snapshot>,

    eps: f32,
    eps_increment: f32,
    last_eps_update: f64,
    avg_eps_update_interval: f64,

    num_steps: u64,
    num_rejected_solutions: u64,
    sum_focal_size: u64,
    seq: u32,
    start: Instant,
    halted: Option<SearchError>,

    leafiter: LeafIter,
    eval_iter: LeafIter,
    focal: Vec<usize>,
    logger: SearchLogger,
}

impl Search<MaxOutputHeuristic> {
    /// Search for the input box maximizing the ensemble output.
    pub fn max_output(at: &AddTree) -> Result<Self, SearchError> {
        Self::with_heuristic(at, MaxOutputHeuristic)
    }
}

impl Search<MinDistToExampleHeuristic> {
    /// Search for the closest box to `example` whose output reaches
    /// `output_threshold`.
    pub fn min_dist_to_example(
        at: &AddTree,
        example: Vec<f32>,
        output_threshold: f32,
    ) -> Result<Self, SearchError> {
        Self::with_heuristic(
            at,
            MinDistToExampleHeuristic::new(example, output_threshold),
        )
    }
}

impl<H: Heuristic> Search<H> {
    /// Build a session with a custom heuristic and default settings.
    pub fn with_heuristic(at: &AddTree, heuristic: H) -> Result<Self, SearchError> {
        Self::with_settings(at, heuristic, SearchSettings::default())
    }

    /// Build a session with a custom heuristic.
    ///
    /// Leaf values are shifted non-negative (compensated in the base score)
    /// so that ε-relaxed scores of partial selections compare meaningfully.
    pub fn with_settings(
        at: &AddTree,
        heuristic: H,
        settings: SearchSettings,
    ) -> Result<Self, SearchError> {
        if at.num_leaf_values() != 1 {
            return Err(SearchError::NonScalarEnsemble {
                n_leaf_values: at.num_leaf_values(),
            });
        }
        let at = at.neutralize_negative_leaf_values();

        let mut graph = Graph::from_addtree_no_base(&at)?;
        graph.propagate_outputs();
        graph.sort_by_bound_desc();

        let mut pre_store = BoxStore::new();
        let mut node_boxes = Vec::with_capacity(at.num_trees());
        for tree in at.trees() {
            node_boxes.push(compute_node_boxes(tree, &mut pre_store)?);
        }

        let eps = if settings.auto_eps { 0.5 } else { settings.eps };

        let mut search = Search {
            shared: Arc::new(SearchShared {
                at,
                graph,
                node_boxes,
                pre_store,
            }),
            settings,
            heuristic,
            store: BoxStore::new(),
            open: Vec::new(),
            solutions: Vec::new(),
            snapshots: Vec::new(),
            eps,
            eps_increment: 0.05,
            last_eps_update: 0.0,
            avg_eps_update_interval: 0.02,
            num_steps: 0,
            num_rejected_solutions: 0,
            sum_focal_size: 0,
            seq: 0,
            start: Instant::now(),
            halted: None,
            leafiter: LeafIter::new(),
            eval_iter: LeafIter::new(),
            focal: Vec::new(),
            logger: SearchLogger::default(),
        };
        search.push_initial_state();
        Ok(search)
    }

    fn push_initial_state(&mut self) {
        let parent = State {
            indep_set: -1,
            box_ref: BoxRef::EMPTY,
            g: 0.0,
            h: 0.0,
            dist: 0.0,
            seq: 0,
        };
        let mut initial = parent;
        let shared = Arc::clone(&self.shared);
        let keep = {
            let ctx = HeurCtx {
                graph: &shared.graph,
                arena: &self.store,
            };
            self.heuristic
                .update(&mut initial, &parent, shared.at.base_score(0), &ctx)
        };
        if keep {
            self.push_state(initial);
        }
    }

    /// Run one step: pop the best focal state and either emit it as a
    /// solution or expand it over the next tree.
    ///
    /// Out-of-memory during expansion halts the session; further calls keep
    /// returning the error while solutions and bounds stay readable.
    pub fn step(&mut self) -> Result<StopReason, SearchError> {
        if let Some(e) = &self.halted {
            return Err(e.clone());
        }
        self.num_steps += 1;

        let Some(state) = self.pop_from_focal() else {
            return Ok(StopReason::NoMoreOpen);
        };

        if self.is_solution(&state) {
            let output = self.heuristic.true_output(&state);
            if output < self.settings.reject_solution_when_output_less_than {
                self.num_rejected_solutions += 1;
            } else {
                self.push_solution(state);
            }
            self.increase_eps();
        } else if let Err(e) = self.expand(state) {
            self.halted = Some(e.clone());
            return Err(e);
        }

        Ok(StopReason::None)
    }

    /// Run up to `n` steps, then evaluate the stop conditions and append a
    /// snapshot.
    pub fn steps(&mut self, n: usize) -> Result<StopReason, SearchError> {
        let num_sol_before = self.solutions.len();
        self.sum_focal_size = 0;
        let mut reason = StopReason::None;
        let mut count = 0usize;

        while reason == StopReason::None && count < n {
            reason = self.step()?;
            count += 1;
            if self.solutions.len() - num_sol_before
                >= self.settings.stop_when_num_new_solutions_exceeds
            {
                reason = StopReason::NumNewSolutionsExceeded;
            }
        }

        if reason == StopReason::None {
            let (lo, up, _) = self.current_bounds();
            if self.solutions.len() >= self.settings.stop_when_num_solutions_exceeds {
                reason = StopReason::NumSolutionsExceeded;
            } else if self.settings.stop_when_optimal && lo == up {
                reason = StopReason::Optimal;
            } else if lo > self.settings.stop_when_lower_greater_than {
                reason = StopReason::LowerGt;
            } else if up < self.settings.stop_when_upper_less_than {
                reason = StopReason::UpperLt;
            }
        }

        let avg_focal = if count > 0 {
            self.sum_focal_size as f64 / count as f64
        } else {
            0.0
        };
        self.push_snapshot(avg_focal);
        self.maybe_decrease_eps();

        Ok(reason)
    }

    /// Run batches of `batch_size` steps until a stop condition triggers or
    /// the wall-clock budget runs out.
    pub fn step_for(&mut self, num_seconds: f64, batch_size: usize) -> Result<StopReason, SearchError> {
        let deadline = self.time_since_start() + num_seconds;
        loop {
            let reason = self.steps(batch_size)?;
            if reason != StopReason::None || self.time_since_start() >= deadline {
                return Ok(reason);
            }
        }
    }

    #[inline]
    fn is_solution(&self, state: &State) -> bool {
        (state.indep_set + 1) as usize == self.shared.at.num_trees()
    }

    fn expand(&mut self, state: State) -> Result<(), SearchError> {
        let shared = Arc::clone(&self.shared);
        let next_tree = (state.indep_set + 1) as usize;
        let tree = shared.at.tree(next_tree);

        self.leafiter.setup(self.store.get(state.box_ref));
        while let Some(leaf) = self.leafiter.next(tree) {
            let leaf_ref = shared.node_boxes[next_tree][leaf as usize];
            if leaf_ref.is_invalid() {
                // removed by prune_by_box
                continue;
            }
            let leaf_box = shared.pre_store.get(leaf_ref);
            if !boxes_overlap(leaf_box, self.store.get(state.box_ref)) {
                // the flat-box DFS over-approximates; re-check precisely
                continue;
            }
            if !self.store.combine_in_workspace(leaf_box, state.box_ref) {
                continue;
            }
            let child_ref = self.store.push_workspace()?;

            let mut child = State {
                indep_set: state.indep_set + 1,
                box_ref: child_ref,
                g: 0.0,
                h: 0.0,
                dist: 0.0,
                seq: 0,
            };
            let keep = {
                let ctx = HeurCtx {
                    graph: &shared.graph,
                    arena: &self.store,
                };
                self.heuristic
                    .update(&mut child, &state, tree.leaf_value(leaf, 0), &ctx)
            };
            if keep {
                self.push_state(child);
            }
        }
        Ok(())
    }

    fn push_state(&mut self, mut state: State) {
        state.seq = self.seq;
        self.seq += 1;
        let h = &self.heuristic;
        let eps = self.eps;
        let less = |a: &State, b: &State| h.better_open(b, a, eps);
        heap::push(&mut self.open, state, &less);
    }

    fn pop_top(&mut self) -> Option<State> {
        let h = &self.heuristic;
        let eps = self.eps;
        let less = |a: &State, b: &State| h.better_open(b, a, eps);
        heap::pop(&mut self.open, &less)
    }

    /// Pearl & Kim focal pop: among the open states whose relaxed score is
    /// within the ε window of the top, expand the one the focal order
    /// prefers. The heap array is walked as an implicit binary tree, so only
    /// in-window states (at most `max_focal_size`) are visited.
    fn pop_from_focal(&mut self) -> Option<State> {
        if self.open.is_empty() {
            return None;
        }
        if self.eps >= 1.0 || self.settings.max_focal_size <= 1 {
            self.sum_focal_size += 1;
            return self.pop_top();
        }

        let h = &self.heuristic;
        let eps = self.eps;
        let open = &self.open;
        let relax = h.relax_open_score(h.open_score(&open[0], eps), eps);

        self.focal.clear();
        self.focal.push(0);
        let idx_less = |a: &usize, b: &usize| h.better_open(&open[*b], &open[*a], eps);

        let mut best = 0usize;
        let mut focal_size = 0usize;
        while let Some(i) = heap::pop(&mut self.focal, &idx_less) {
            if h.better_focal(&open[i], &open[best]) {
                best = i;
            }
            focal_size += 1;
            if focal_size >= self.settings.max_focal_size {
                break;
            }
            for child in [2 * i + 1, 2 * i + 2] {
                if child < open.len() && h.open_score(&open[child], eps) >= relax {
                    heap::push(&mut self.focal, child, &idx_less);
                }
            }
        }
        self.sum_focal_size += focal_size as u64;

        let less = |a: &State, b: &State| h.better_open(b, a, eps);
        heap::pop_at(&mut self.open, best, &less)
    }

    fn push_solution(&mut self, state: State) {
        let entry = SolEntry {
            time: self.time_since_start(),
            eps: self.eps,
            output: self.heuristic.true_output(&state),
            state,
        };
        self.solutions.push(entry);
        // keep solutions sorted best-first
        let mut i = self.solutions.len() - 1;
        while i > 0 {
            let better = self.heuristic.better_open(
                &self.solutions[i].state,
                &self.solutions[i - 1].state,
                self.eps,
            );
            if better {
                self.solutions.swap(i, i - 1);
                i -= 1;
            } else {
                break;
            }
        }
    }

    fn push_snapshot(&mut self, avg_focal_size: f64) {
        let snap = Snapshot {
            time: self.time_since_start(),
            num_steps: self.num_steps,
            num_solutions: self.solutions.len(),
            num_open: self.open.len(),
            eps: self.eps,
            bounds: self.current_bounds(),
            avg_focal_size,
        };
        self.logger.snapshot(&snap);
        self.snapshots.push(snap);
    }

    // --- ε schedule ---------------------------------------------------------

    fn increase_eps(&mut self) {
        if !self.settings.auto_eps {
            return;
        }
        let t = self.time_since_start();
        let dt = t - self.last_eps_update;

        // solutions arriving quickly: take larger ε steps
        if dt * 2.0 < self.avg_eps_update_interval {
            self.eps_increment *= 2.0;
        }
        self.last_eps_update = t;
        self.avg_eps_update_interval = 0.2 * self.avg_eps_update_interval + 0.8 * dt;

        let old = self.eps;
        self.eps = (self.eps + self.eps_increment).min(1.0);
        if old != self.eps {
            self.logger.eps_change(old, self.eps, self.current_bounds().1);
            self.rebuild_open();
        }
    }

    fn maybe_decrease_eps(&mut self) {
        if !self.settings.auto_eps {
            return;
        }
        let t = self.time_since_start();
        let dt = t - self.last_eps_update;

        if self.last_eps_update > 0.0 && dt > 2.0 * self.avg_eps_update_interval {
            self.avg_eps_update_interval = 0.2 * self.avg_eps_update_interval + 0.8 * dt;
            self.eps_increment = (self.eps_increment / 2.0).max(0.01);
            let old = self.eps;
            self.eps = (self.eps - self.eps_increment).max(0.5);
            if old != self.eps {
                self.logger.eps_change(old, self.eps, self.current_bounds().1);
                self.rebuild_open();
            }
        }
    }

    /// Current ε.
    #[inline]
    pub fn eps(&self) -> f32 {
        self.eps
    }

    /// Set ε and restore the heap order under the new relaxation.
    pub fn set_eps(&mut self, eps: f32) {
        self.eps = eps;
        self.rebuild_open();
    }

    fn rebuild_open(&mut self) {
        let h = &self.heuristic;
        let eps = self.eps;
        let less = |a: &State, b: &State| h.better_open(b, a, eps);
        heap::rebuild(&mut self.open, &less);
    }

    // --- introspection ------------------------------------------------------

    /// `(lower, upper, top)`: best emitted solution, proven upper bound, and
    /// the top-of-open relaxed score. When the open list is empty the top
    /// falls back to the lower bound.
    pub fn current_bounds(&self) -> (f32, f32, f32) {
        let mut lo = f32::NEG_INFINITY;
        if let Some(best) = self.solutions.first() {
            lo = self.heuristic.open_score(&best.state, self.eps);
        }
        let (up, top) = match self.open.first() {
            Some(state) => {
                let top = self.heuristic.open_score(state, self.eps);
                (top.max(lo), top)
            }
            None => (lo, lo),
        };
        (lo, up, top)
    }

    /// Is the best emitted solution provably optimal?
    pub fn is_optimal(&self) -> bool {
        let (lo, up, _) = self.current_bounds();
        lo == up
    }

    #[inline]
    pub fn num_solutions(&self) -> usize {
        self.solutions.len()
    }

    #[inline]
    pub fn num_open(&self) -> usize {
        self.open.len()
    }

    #[inline]
    pub fn num_steps(&self) -> u64 {
        self.num_steps
    }

    #[inline]
    pub fn num_rejected_solutions(&self) -> u64 {
        self.num_rejected_solutions
    }

    /// Seconds since the session was constructed.
    pub fn time_since_start(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    #[inline]
    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    /// The `i`-th best solution found so far.
    pub fn get_solution(&self, i: usize) -> Solution {
        let e = &self.solutions[i];
        Solution {
            time: e.time,
            eps: e.eps,
            output: e.output,
            box_pairs: self.store.get(e.state.box_ref).to_vec(),
        }
    }

    /// The error that halted this session, if any.
    #[inline]
    pub fn halted(&self) -> Option<&SearchError> {
        self.halted.as_ref()
    }

    /// Arena bytes currently reserved for state boxes.
    pub fn memory_used(&self) -> usize {
        self.store.mem_used()
    }

    /// Cap the state arena; reaching the cap halts the session.
    pub fn set_mem_capacity(&mut self, bytes: usize) {
        self.store.set_mem_capacity(bytes);
    }

    pub fn set_verbosity(&mut self, verbosity: Verbosity) {
        self.logger = SearchLogger::new(verbosity);
    }

    /// Exact ensemble output when `pairs` selects a unique reachable leaf in
    /// every tree; [`SearchError::AmbiguousBox`] otherwise.
    pub fn get_at_output_for_box(&mut self, pairs: &[DomainPair]) -> Result<f32, SearchError> {
        let shared = Arc::clone(&self.shared);
        let mut output = shared.at.base_score(0);
        for (tree_index, tree) in shared.at.trees().enumerate() {
            let node_boxes = &shared.node_boxes[tree_index];
            self.eval_iter.setup(pairs);
            let mut unique = None;
            while let Some(leaf) = self.eval_iter.next(tree) {
                let nb = node_boxes[leaf as usize];
                if nb.is_invalid() {
                    continue;
                }
                // the flat-box DFS over-approximates at split boundaries
                if !boxes_overlap(shared.pre_store.get(nb), pairs) {
                    continue;
                }
                if unique.replace(leaf).is_some() {
                    self.eval_iter.reset();
                    return Err(SearchError::AmbiguousBox { tree: tree_index });
                }
            }
            match unique {
                Some(leaf) => output += tree.leaf_value(leaf, 0),
                None => return Err(SearchError::AmbiguousBox { tree: tree_index }),
            }
        }
        Ok(output)
    }

    /// Restrict the search space to `pairs`: intersect every vertex and node
    /// box with it and drop what no longer overlaps.
    ///
    /// # Panics
    /// Panics when called after the first step or after the engine was
    /// sharded for parallel search; pruning mid-search is a programmer error.
    pub fn prune_by_box(&mut self, pairs: &[DomainPair]) -> Result<(), SearchError> {
        assert!(
            self.num_steps == 0,
            "prune_by_box is only legal before the first step"
        );
        let shared = Arc::get_mut(&mut self.shared)
            .expect("prune_by_box on an engine already sharded for parallel search");

        shared.graph.prune_by_box(pairs)?;
        shared.graph.propagate_outputs();
        shared.graph.sort_by_bound_desc();

        let SearchShared {
            node_boxes,
            pre_store,
            ..
        } = shared;
        for tree_boxes in node_boxes.iter_mut() {
            for nb in tree_boxes.iter_mut() {
                if nb.is_invalid() {
                    continue;
                }
                if boxes_overlap(pre_store.get(*nb), pairs)
                    && pre_store.combine_in_workspace(pairs, *nb)
                {
                    *nb = pre_store.push_workspace()?;
                } else {
                    *nb = BoxRef::INVALID;
                }
            }
        }
        Ok(())
    }

    // --- parallel support ---------------------------------------------------

    /// Split this engine into `k` workers' engines, dealing every k-th open
    /// state to each. State boxes are copied into the receiving engine's own
    /// arena; solutions stay with the first shard.
    pub(crate) fn shard(mut self, k: usize) -> Vec<Search<H>>
    where
        H: Clone,
    {
        let states: Vec<(State, Vec<DomainPair>)> = {
            let store = &self.store;
            self.open
                .drain(..)
                .map(|s| {
                    let pairs = store.get(s.box_ref).to_vec();
                    (s, pairs)
                })
                .collect()
        };
        let mem_cap = self.store.mem_capacity();

        let mut shards: Vec<Search<H>> = (0..k)
            .map(|_| Search {
                shared: Arc::clone(&self.shared),
                settings: self.settings.clone(),
                heuristic: self.heuristic.clone(),
                store: BoxStore::with_mem_capacity(mem_cap),
                open: Vec::new(),
                solutions: Vec::new(),
                snapshots: Vec::new(),
                eps: self.eps,
                eps_increment: self.eps_increment,
                last_eps_update: 0.0,
                avg_eps_update_interval: 0.02,
                num_steps: 0,
                num_rejected_solutions: 0,
                sum_focal_size: 0,
                seq: 0,
                start: Instant::now(),
                halted: None,
                leafiter: LeafIter::new(),
                eval_iter: LeafIter::new(),
                focal: Vec::new(),
                logger: self.logger.clone(),
            })
            .collect();

        for (j, (state, pairs)) in states.into_iter().enumerate() {
            shards[j % k].adopt_state(state, &pairs);
        }
        let entries: Vec<(SolEntry, Vec<DomainPair>)> = {
            let store = &self.store;
            self.solutions
                .drain(..)
                .map(|e| {
                    let pairs = store.get(e.state.box_ref).to_vec();
                    (e, pairs)
                })
                .collect()
        };
        for (entry, pairs) in entries {
            shards[0].adopt_solution(entry, &pairs);
        }
        shards
    }

    /// Take ownership of an open state from another engine, copying its box
    /// into this engine's arena. On out-of-memory the state is dropped and
    /// the engine halts.
    pub(crate) fn adopt_state(&mut self, mut state: State, pairs: &[DomainPair]) {
        match self.store.push_pairs(pairs) {
            Ok(r) => {
                state.box_ref = r;
                self.push_state(state);
            }
            Err(e) => self.halted = Some(e),
        }
    }

    fn adopt_solution(&mut self, mut entry: SolEntry, pairs: &[DomainPair]) {
        match self.store.push_pairs(pairs) {
            Ok(r) => {
                entry.state.box_ref = r;
                let state = entry.state;
                self.solutions.push(entry);
                // restore best-first order
                let mut i = self.solutions.len() - 1;
                while i > 0
                    && self
                        .heuristic
                        .better_open(&state, &self.solutions[i - 1].state, self.eps)
                {
                    self.solutions.swap(i, i - 1);
                    i -= 1;
                }
            }
            Err(e) => self.halted = Some(e),
        }
    }

    /// Drain the open list, materializing each state's box.
    pub(crate) fn drain_open(&mut self) -> Vec<(State, Vec<DomainPair>)> {
        let store = &self.store;
        self.open
            .drain(..)
            .map(|s| {
                let pairs = store.get(s.box_ref).to_vec();
                (s, pairs)
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn open_is_heap(&self) -> bool {
        let h = &self.heuristic;
        let eps = self.eps;
        let less = |a: &State, b: &State| h.better_open(b, a, eps);
        heap::is_heap(&self.open, &less)
    }
}

/// Per-node path boxes of one tree, committed to `store` in a single
/// explicit-stack DFS. The root's box is empty (universal).
fn compute_node_boxes(tree: &Tree, store: &mut BoxStore) -> Result<Vec<BoxRef>, SearchError> {
    let mut boxes = vec![BoxRef::EMPTY; tree.num_nodes()];
    let mut stack = vec![ROOT];
    while let Some(node) = stack.pop() {
        if tree.is_leaf(node) {
            continue;
        }
        let cond = tree.split(node);
        let parent_pairs = store.get(boxes[node as usize]).to_vec();
        for (child, went_left) in [(tree.left(node), true), (tree.right(node), false)] {
            store.combine_in_workspace(&parent_pairs, BoxRef::EMPTY);
            store.refine_workspace(cond.feat, cond.value, went_left);
            boxes[child as usize] = store.push_workspace()?;
            stack.push(child);
        }
    }
    Ok(boxes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trees::TreeBuilder;

    fn stump(feat: u32, split: f32, left: f32, right: f32) -> Tree {
        let mut b = TreeBuilder::new(1);
        b.add_split(feat, split, 1, 2);
        b.add_scalar_leaf(left);
        b.add_scalar_leaf(right);
        b.build().unwrap()
    }

    fn two_tree_at() -> AddTree {
        let mut at = AddTree::new(1);
        at.add_tree(stump(0, 0.0, -1.0, 1.0)).unwrap();
        at.add_tree(stump(0, 0.0, 2.0, -2.0)).unwrap();
        at
    }

    #[test]
    fn node_boxes_follow_paths() {
        let mut store = BoxStore::new();
        let tree = stump(0, 0.5, 1.0, 2.0);
        let boxes = compute_node_boxes(&tree, &mut store).unwrap();
        assert!(boxes[0].is_empty());
        assert_eq!(
            store.get(boxes[1]),
            &[(0, crate::interval::Interval::below(0.5))]
        );
        assert_eq!(
            store.get(boxes[2]),
            &[(0, crate::interval::Interval::at_or_above(0.5))]
        );
    }

    #[test]
    fn search_finds_the_optimum() {
        let at = two_tree_at();
        let mut search = Search::max_output(&at).unwrap();
        let reason = loop {
            match search.steps(1).unwrap() {
                StopReason::None => {}
                r => break r,
            }
        };
        assert_eq!(reason, StopReason::Optimal);

        let best = search.get_solution(0);
        assert_eq!(best.output, 1.0);
        assert_eq!(
            best.box_pairs,
            vec![(0, crate::interval::Interval::below(0.0))]
        );
    }

    #[test]
    fn heap_property_holds_after_every_step() {
        let at = two_tree_at();
        let mut search = Search::max_output(&at).unwrap();
        loop {
            match search.step().unwrap() {
                StopReason::None => assert!(search.open_is_heap()),
                _ => break,
            }
        }
    }

    #[test]
    fn solutions_emit_weakly_decreasing() {
        // deeper ensemble with several feasible cliques
        let mut at = AddTree::new(1);
        at.add_tree(stump(0, 0.0, 1.0, 3.0)).unwrap();
        at.add_tree(stump(1, 0.0, 2.0, 0.5)).unwrap();
        at.add_tree(stump(2, 0.0, -1.0, 0.25)).unwrap();

        let mut search = Search::max_output(&at).unwrap();
        search.settings.stop_when_optimal = false;
        while search.steps(16).unwrap() == StopReason::None {}

        assert!(search.num_solutions() >= 2);
        for i in 1..search.num_solutions() {
            assert!(search.get_solution(i - 1).output >= search.get_solution(i).output);
        }
    }

    #[test]
    fn halted_session_keeps_results() {
        let at = two_tree_at();
        let mut search = Search::max_output(&at).unwrap();
        search.set_mem_capacity(1);
        let err = loop {
            match search.step() {
                Ok(_) => continue,
                Err(e) => break e,
            }
        };
        assert!(matches!(err, SearchError::OutOfMemory { .. }));
        // the session is stopped but introspection still works
        assert!(matches!(search.step(), Err(SearchError::OutOfMemory { .. })));
        let _ = search.current_bounds();
    }

    #[test]
    fn snapshots_accumulate_per_steps_call() {
        let at = two_tree_at();
        let mut search = Search::max_output(&at).unwrap();
        search.steps(1).unwrap();
        search.steps(1).unwrap();
        assert_eq!(search.snapshots().len(), 2);
        assert!(search.snapshots()[0].num_steps <= search.snapshots()[1].num_steps);
    }

    #[test]
    fn step_for_stops_on_condition_before_deadline() {
        let at = two_tree_at();
        let mut search = Search::max_output(&at).unwrap();
        let reason = search.step_for(5.0, 1).unwrap();
        assert_ne!(reason, StopReason::None);
        assert!(search.time_since_start() < 5.0);
    }

    #[test]
    fn get_at_output_requires_unique_leaf() {
        let at = two_tree_at();
        let mut search = Search::max_output(&at).unwrap();
        let below = [(0u32, crate::interval::Interval::below(0.0))];
        assert_eq!(search.get_at_output_for_box(&below).unwrap(), 1.0);

        let err = search.get_at_output_for_box(&[]).unwrap_err();
        assert!(matches!(err, SearchError::AmbiguousBox { tree: 0 }));
    }
}
