//! Observability sink for connection and server counts.

use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::trace;

/// Receives the gauges the client set maintains.
pub trait MetricsSink: Send + Sync {
    /// Number of clients currently held by the set.
    fn set_server_connections_count(&self, count: usize);

    /// Server count the set is currently reconciling towards.
    fn set_server_count(&self, count: usize);
}

/// In-process gauges, readable by health endpoints and tests.
#[derive(Debug, Default)]
pub struct AgentMetrics {
    server_connections: AtomicUsize,
    server_count: AtomicUsize,
}

impl AgentMetrics {
    pub fn server_connections_count(&self) -> usize {
        self.server_connections.load(Ordering::Relaxed)
    }

    pub fn server_count(&self) -> usize {
        self.server_count.load(Ordering::Relaxed)
    }
}

impl MetricsSink for AgentMetrics {
    fn set_server_connections_count(&self, count: usize) {
        trace!(server_connections = count, "gauge updated");
        self.server_connections.store(count, Ordering::Relaxed);
    }

    fn set_server_count(&self, count: usize) {
        trace!(server_count = count, "gauge updated");
        self.server_count.store(count, Ordering::Relaxed);
    }
}
