//! veriboost: verification and optimization for additive tree ensembles.
//!
//! Given a gradient-boosted forest or random forest, this crate answers
//! global reachability questions ("what is the maximum output over this
//! input region?") and robustness questions ("what is the smallest
//! perturbation of an example that pushes the score past a threshold?").
//!
//! Both reduce to a best-first search over the Cartesian product of per-tree
//! leaves, constrained by the intersection of each leaf's input-space box.
//! See [`search::Search`] for the engine and [`search::ParSearch`] for the
//! multi-threaded driver.

pub mod boxes;
pub mod error;
pub mod graph;
pub mod interval;
pub mod io;
pub mod logger;
pub mod search;
pub mod testing;
pub mod trees;

pub use boxes::{BoxRef, BoxStore, DomainPair};
pub use error::{ModelError, SearchError};
pub use graph::Graph;
pub use interval::{FeatId, Interval};
pub use search::{ParSearch, Search, SearchSettings, Snapshot, Solution, StopReason};
pub use trees::{AddTree, Tree, TreeBuilder};
