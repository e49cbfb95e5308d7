//! Round-robin selection over the ready channels of one language.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use data_model::FunctionId;
use tracing::debug;

/// The one question the load balancer asks a channel.
pub trait LoadBalancedChannel {
    fn has_loaded_function(&self, function_id: &FunctionId) -> bool;
}

/// Rotates over ready channels, preferring those that acknowledged loading
/// the target function. When none has, any ready channel is used — workers
/// are expected to lazily load functions on first invocation. An empty
/// ready set yields `None` and the caller must buffer.
pub struct RoundRobinLoadBalancer {
    counter: AtomicUsize,
}

impl RoundRobinLoadBalancer {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }

    pub fn select<'a, C: LoadBalancedChannel>(
        &self,
        function_id: &FunctionId,
        ready: &'a [Arc<C>],
    ) -> Option<&'a Arc<C>> {
        if ready.is_empty() {
            return None;
        }
        let preferred: Vec<&'a Arc<C>> = ready
            .iter()
            .filter(|channel| channel.has_loaded_function(function_id))
            .collect();
        let pool: Vec<&'a Arc<C>> = if preferred.is_empty() {
            debug!(
                function_id = %function_id,
                "no channel has acknowledged this function; falling back to any ready channel"
            );
            ready.iter().collect()
        } else {
            preferred
        };
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % pool.len();
        Some(pool[index])
    }
}

impl Default for RoundRobinLoadBalancer {
    fn default() -> Self {
        Self::new()
    }
}
