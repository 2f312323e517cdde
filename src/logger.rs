//! Structured progress logging for search sessions.
//!
//! Every logger is owned by one engine; there is no global logging state.

use crate::search::Snapshot;

/// How much a [`SearchLogger`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Verbosity {
    /// No output.
    #[default]
    Silent,
    /// One line per snapshot.
    Info,
    /// Snapshots plus ε adjustments.
    Debug,
}

/// Per-engine progress logger.
#[derive(Debug, Clone, Default)]
pub struct SearchLogger {
    verbosity: Verbosity,
}

impl SearchLogger {
    pub fn new(verbosity: Verbosity) -> Self {
        Self { verbosity }
    }

    #[inline]
    pub fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    pub(crate) fn snapshot(&self, snap: &Snapshot) {
        if self.verbosity >= Verbosity::Info {
            let (lo, up, top) = snap.bounds;
            eprintln!(
                "[search] t={:.3}s steps={} sols={} open={} eps={:.2} bounds=({lo:.4}, {up:.4}, {top:.4}) focal={:.1}",
                snap.time, snap.num_steps, snap.num_solutions, snap.num_open, snap.eps,
                snap.avg_focal_size,
            );
        }
    }

    pub(crate) fn eps_change(&self, old: f32, new: f32, upper: f32) {
        if self.verbosity >= Verbosity::Debug && old != new {
            eprintln!("[search] eps {old:.3} -> {new:.3} (upper {upper:.4})");
        }
    }
}
