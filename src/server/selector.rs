//! Round-robin replica placement policy.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Picks replica targets for each write out of a candidate pool. One shared
/// counter advances by exactly one per write, so consecutive writes get
/// windows rotated by one position.
#[derive(Debug, Default)]
pub struct ReplicaSelector {
    counter: AtomicUsize,
}

impl ReplicaSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current counter value, i.e. the start of the next window.
    pub fn counter(&self) -> usize {
        self.counter.load(Ordering::Relaxed)
    }

    /// Selects `min(tolerance, candidates.len())` distinct candidates at
    /// positions `(counter + i) mod n`. The counter is advanced even when
    /// the pool is empty, since it counts writes, not placements.
    pub fn select<T: Clone>(&self, candidates: &[T], tolerance: usize) -> Vec<T> {
        let start = self.counter.fetch_add(1, Ordering::Relaxed);
        let n = candidates.len();
        if n == 0 {
            return vec![];
        }

        let k = tolerance.min(n);
        (0..k)
            .map(|i| candidates[(start % n + i) % n].clone())
            .collect()
    }
}
