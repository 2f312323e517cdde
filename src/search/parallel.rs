//! Parallel search driver.
//!
//! A fixed pool of worker threads, each owning an independent engine seeded
//! with every k-th state of the initial engine's open list. Workers share the
//! immutable precompute (ensemble, graph, node boxes) through an `Arc`; every
//! worker has its own arena, heap, and solution list. Coordination uses one
//! mutex and condvar per worker: a worker holds its lock while running a
//! batch, so the driver touches a worker's engine only while it is parked.
//!
//! At every `steps_for` boundary the driver gathers all open lists into a
//! pool and re-deals them round-robin, unifying ε to the pool minimum. Moved
//! states have their boxes copied into the receiving worker's arena, so box
//! handles are never cross-owned.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::SearchError;
use crate::search::{Heuristic, Search, Solution, StopReason};

/// Steps between deadline checks inside a worker.
const STEP_BATCH: usize = 100;

#[derive(Debug, Clone, Copy)]
enum Cmd {
    Idle,
    Run { millis: u64 },
    Stop,
}

struct Slot<H: Heuristic> {
    cmd: Cmd,
    engine: Search<H>,
    last_reason: StopReason,
    last_error: Option<SearchError>,
    /// Solution count at the start of the last `steps_for` call.
    solutions_before: usize,
}

struct WorkerSync<H: Heuristic> {
    slot: Mutex<Slot<H>>,
    cv: Condvar,
}

/// Drives `n` worker engines over disjoint shards of the search space.
pub struct ParSearch<H: Heuristic> {
    workers: Vec<Arc<WorkerSync<H>>>,
    handles: Vec<JoinHandle<()>>,
    rounds: usize,
}

impl<H: Heuristic + Clone + Send + 'static> ParSearch<H> {
    /// Spawn `num_workers` threads, sharding the given engine's open list.
    ///
    /// Shard a freshly constructed engine: after the first `steps_for` call
    /// the periodic redistribution keeps the workers balanced.
    pub fn new(engine: Search<H>, num_workers: usize) -> Self {
        assert!(num_workers >= 1, "need at least one worker");

        let mut workers = Vec::with_capacity(num_workers);
        let mut handles = Vec::with_capacity(num_workers);
        for engine in engine.shard(num_workers) {
            let sync = Arc::new(WorkerSync {
                slot: Mutex::new(Slot {
                    cmd: Cmd::Idle,
                    engine,
                    last_reason: StopReason::None,
                    last_error: None,
                    solutions_before: 0,
                }),
                cv: Condvar::new(),
            });
            let worker_sync = Arc::clone(&sync);
            handles.push(std::thread::spawn(move || worker_loop(worker_sync)));
            workers.push(sync);
        }
        ParSearch {
            workers,
            handles,
            rounds: 0,
        }
    }

    #[inline]
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Let all workers search until the wall-clock deadline elapses or their
    /// local stop conditions trigger, then wait for them to park. Work is
    /// redistributed at every call boundary after the first.
    pub fn steps_for(&mut self, millis: u64) {
        if self.rounds > 0 {
            self.redistribute_work();
        }
        self.rounds += 1;

        for w in &self.workers {
            let mut slot = w.slot.lock().unwrap();
            slot.solutions_before = slot.engine.num_solutions();
            slot.cmd = Cmd::Run { millis };
            w.cv.notify_all();
        }
        self.wait_all();
    }

    /// Pool all open states and deal them round-robin across the workers,
    /// unifying ε to the pool minimum. Only legal while workers are parked;
    /// blocks until they are.
    pub fn redistribute_work(&mut self) {
        let mut guards: Vec<MutexGuard<'_, Slot<H>>> = self
            .workers
            .iter()
            .map(|w| w.slot.lock().unwrap())
            .collect();

        let min_eps = guards
            .iter()
            .map(|g| g.engine.eps())
            .fold(1.0f32, f32::min);

        let mut pool = Vec::new();
        for g in guards.iter_mut() {
            pool.extend(g.engine.drain_open());
        }
        let n = guards.len();
        for (j, (state, pairs)) in pool.into_iter().enumerate() {
            guards[j % n].engine.adopt_state(state, &pairs);
        }
        for g in guards.iter_mut() {
            g.engine.set_eps(min_eps);
        }
    }

    fn wait_all(&self) {
        for w in &self.workers {
            let mut slot = w.slot.lock().unwrap();
            while !matches!(slot.cmd, Cmd::Idle) {
                slot = w.cv.wait(slot).unwrap();
            }
        }
    }

    /// Total solutions across all workers.
    pub fn num_solutions(&self) -> usize {
        self.for_each_worker(|s| s.engine.num_solutions()).iter().sum()
    }

    /// Solutions found during the last `steps_for` call.
    pub fn num_new_solutions(&self) -> usize {
        self.for_each_worker(|s| s.engine.num_solutions() - s.solutions_before)
            .iter()
            .sum()
    }

    /// Total open states across all workers.
    pub fn num_candidate_cliques(&self) -> usize {
        self.for_each_worker(|s| s.engine.num_open()).iter().sum()
    }

    /// Arena bytes per worker.
    pub fn current_memory(&self) -> Vec<usize> {
        self.for_each_worker(|s| s.engine.memory_used())
    }

    /// Merged `(lower, upper)` bounds over all workers.
    pub fn current_bounds(&self) -> (f32, f32) {
        let per_worker = self.for_each_worker(|s| s.engine.current_bounds());
        let mut lo = f32::NEG_INFINITY;
        let mut up = f32::NEG_INFINITY;
        for (l, u, _) in per_worker {
            lo = lo.max(l);
            up = up.max(u);
        }
        (lo, up)
    }

    /// Smallest ε across the pool.
    pub fn eps(&self) -> f32 {
        self.for_each_worker(|s| s.engine.eps())
            .into_iter()
            .fold(1.0f32, f32::min)
    }

    /// Force ε on every worker.
    pub fn set_eps(&mut self, eps: f32) {
        for w in &self.workers {
            let mut slot = w.slot.lock().unwrap();
            slot.engine.set_eps(eps);
        }
    }

    /// Set the bound thresholds that stop a worker's batch early.
    pub fn set_output_limits(&mut self, lower_greater_than: f32, upper_less_than: f32) {
        for w in &self.workers {
            let mut slot = w.slot.lock().unwrap();
            slot.engine.settings.stop_when_lower_greater_than = lower_greater_than;
            slot.engine.settings.stop_when_upper_less_than = upper_less_than;
        }
    }

    /// All solutions merged, best output first.
    pub fn solutions(&self) -> Vec<Solution> {
        let mut out = Vec::new();
        for w in &self.workers {
            let slot = w.slot.lock().unwrap();
            for i in 0..slot.engine.num_solutions() {
                out.push(slot.engine.get_solution(i));
            }
        }
        out.sort_by(|a, b| b.output.total_cmp(&a.output));
        out
    }

    /// Worst-wins aggregate of the workers' stop reasons. Any worker error
    /// (out of memory) takes precedence over every ordinary reason.
    pub fn stop_reason(&self) -> Result<StopReason, SearchError> {
        let mut worst = StopReason::None;
        for w in &self.workers {
            let slot = w.slot.lock().unwrap();
            if let Some(e) = &slot.last_error {
                return Err(e.clone());
            }
            if let Some(e) = slot.engine.halted() {
                return Err(e.clone());
            }
            if slot.last_reason.precedence() > worst.precedence() {
                worst = slot.last_reason;
            }
        }
        Ok(worst)
    }

    /// Is the globally best solution provably optimal?
    ///
    /// True when every worker with remaining open states runs at ε = 1 and
    /// its local upper bound does not beat the global best solution.
    pub fn is_optimal(&self) -> bool {
        let (lo, _) = self.current_bounds();
        for w in &self.workers {
            let slot = w.slot.lock().unwrap();
            if slot.engine.num_open() == 0 {
                continue;
            }
            if slot.engine.eps() < 1.0 {
                return false;
            }
            let (_, up, _) = slot.engine.current_bounds();
            if up > lo {
                return false;
            }
        }
        true
    }

    /// Orderly shutdown: stop and join every worker thread.
    pub fn join(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        for w in &self.workers {
            let mut slot = w.slot.lock().unwrap();
            slot.cmd = Cmd::Stop;
            w.cv.notify_all();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }

    fn for_each_worker<R>(&self, f: impl Fn(&Slot<H>) -> R) -> Vec<R> {
        self.workers
            .iter()
            .map(|w| f(&w.slot.lock().unwrap()))
            .collect()
    }
}

impl<H: Heuristic> Drop for ParSearch<H> {
    fn drop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        for w in &self.workers {
            let mut slot = w.slot.lock().unwrap();
            slot.cmd = Cmd::Stop;
            w.cv.notify_all();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop<H: Heuristic>(sync: Arc<WorkerSync<H>>) {
    let mut slot = sync.slot.lock().unwrap();
    loop {
        while matches!(slot.cmd, Cmd::Idle) {
            slot = sync.cv.wait(slot).unwrap();
        }
        match slot.cmd {
            Cmd::Stop => return,
            Cmd::Run { millis } => {
                let deadline = Instant::now() + Duration::from_millis(millis);
                slot.last_reason = StopReason::None;
                loop {
                    match slot.engine.steps(STEP_BATCH) {
                        Ok(StopReason::None) => {
                            if Instant::now() >= deadline {
                                break;
                            }
                        }
                        Ok(reason) => {
                            slot.last_reason = reason;
                            break;
                        }
                        Err(e) => {
                            slot.last_error = Some(e);
                            break;
                        }
                    }
                }
            }
            Cmd::Idle => unreachable!(),
        }
        slot.cmd = Cmd::Idle;
        sync.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trees::{AddTree, TreeBuilder};

    fn small_ensemble() -> AddTree {
        let mut at = AddTree::new(1);
        for feat in 0..3u32 {
            let mut b = TreeBuilder::new(1);
            b.add_split(feat, 0.0, 1, 2);
            b.add_scalar_leaf(feat as f32);
            b.add_scalar_leaf(-(feat as f32) + 0.5);
            at.add_tree(b.build().unwrap()).unwrap();
        }
        at
    }

    #[test]
    fn parallel_matches_serial_optimum() {
        let at = small_ensemble();

        let mut serial = Search::max_output(&at).unwrap();
        while serial.steps(64).unwrap() == StopReason::None {}
        let best_serial = serial.get_solution(0).output;

        let engine = Search::max_output(&at).unwrap();
        let mut par = ParSearch::new(engine, 3);
        for _ in 0..4 {
            par.steps_for(20);
        }
        let merged = par.solutions();
        assert!(!merged.is_empty());
        assert_eq!(merged[0].output, best_serial);
        par.join();
    }

    #[test]
    fn workers_report_memory_and_open_counts() {
        let engine = Search::max_output(&small_ensemble()).unwrap();
        let mut par = ParSearch::new(engine, 2);
        assert_eq!(par.num_workers(), 2);
        par.steps_for(10);
        assert_eq!(par.current_memory().len(), 2);
        let _ = par.num_candidate_cliques();
        par.join();
    }

    #[test]
    fn shutdown_via_drop_joins_threads() {
        let engine = Search::max_output(&small_ensemble()).unwrap();
        let mut par = ParSearch::new(engine, 2);
        par.steps_for(5);
        drop(par);
    }
}
