//! Load balancing across an eligible candidate set
use std::sync::atomic::{AtomicUsize, Ordering};

/// Load balancing algorithm trait
pub trait LoadBalancingAlgorithm: Send + Sync {
    /// Pick an index into a candidate set of `len` entries
    fn select_index(&self, len: usize) -> Option<usize>;
}

/// Round-robin load balancing algorithm.
///
/// One counter is shared by every selection made through the owning router,
/// so load spreads evenly over time regardless of which routing mode asked.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl LoadBalancingAlgorithm for RoundRobin {
    fn select_index(&self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }

        let index = self.counter.fetch_add(1, Ordering::Relaxed) % len;
        Some(index)
    }
}
