//! Server count authorities that take priority over counts reported on dial.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn, Instrument};

use crate::common;

/// Reports the number of live proxy server instances.
pub trait ServerLeaseCounter: Send + Sync {
    fn count(&self) -> usize;
}

/// Counts proxy server instances as the distinct addresses behind the server name.
///
/// A background task re-resolves the address every refresh interval. A failed
/// or empty resolution keeps the previous count.
#[derive(Debug)]
pub struct DnsLeaseCounter {
    count: Arc<AtomicUsize>,
    refresh_task: JoinHandle<()>,
}

impl DnsLeaseCounter {
    /// Starts the refresh task. It stops when `stop` fires or the counter is dropped.
    pub fn spawn(address: String, refresh_interval: Duration, stop: CancellationToken) -> Self {
        let count = Arc::new(AtomicUsize::new(0));
        let span = tracing::info_span!("dns_lease_counter", server_address = %address);
        let refresh_task = tokio::spawn(
            Self::refresh_loop(address, refresh_interval, count.clone(), stop).instrument(span),
        );
        Self {
            count,
            refresh_task,
        }
    }

    async fn refresh_loop(
        address: String,
        refresh_interval: Duration,
        count: Arc<AtomicUsize>,
        stop: CancellationToken,
    ) {
        let mut interval = common::tick_interval(refresh_interval);
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = interval.tick() => {}
            }
            match common::resolve_addrs(&address).await {
                Ok(addrs) if addrs.is_empty() => {
                    warn!("DNS resolution returned an empty list. Keeping the previous server count.");
                }
                Ok(addrs) => {
                    let previous = count.swap(addrs.len(), Ordering::Relaxed);
                    if previous != addrs.len() {
                        debug!(previous, current = addrs.len(), ?addrs, "server leases refreshed");
                    }
                }
                Err(e) => {
                    error!("DNS resolution failed: {}. Keeping the previous server count.", e);
                }
            }
        }
    }
}

impl ServerLeaseCounter for DnsLeaseCounter {
    fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}

impl Drop for DnsLeaseCounter {
    fn drop(&mut self) {
        self.refresh_task.abort();
    }
}
