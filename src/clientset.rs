//! # Client Set
//!
//! A `ClientSet` holds one client per instance of a highly available proxy
//! server fleet. Every instance is reached through the same address, so the
//! agent cannot choose which instance answers a dial. The set keeps dialing,
//! deduplicates by the server id each instance reports, and converges the
//! number of clients to the number of live servers.
//!
//! The desired server count comes from a [`ServerLeaseCounter`] when one is
//! configured, otherwise from the count the last answering server reported.
//!
//! ## Lifecycle
//!
//! 1. Build the set with [`ClientSetConfig::new_agent_client_set`].
//! 2. Call [`ClientSet::serve`] to start the sync loop in the background.
//! 3. Cancel the stop token. The loop notices it after its current sleep,
//!    closes every client, and empties the set.
//!
//! The drain token is never acted upon here. It is handed to every client
//! through [`DialParams`] and exposed through [`ClientSet::is_draining`].

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::backoff::Backoff;
use crate::client::{Client, ClientFactory, ConnectivityState, DialParams};
use crate::error::{ClientError, DuplicateServerError};
use crate::lease::ServerLeaseCounter;
use crate::metrics::{AgentMetrics, MetricsSink};

/// Configuration of a [`ClientSet`].
#[derive(Clone)]
pub struct ClientSetConfig {
    /// Proxy server address as `host:port`. Assumed to front an HA fleet.
    pub address: String,
    pub agent_id: String,
    /// Identifiers the server uses when choosing an agent.
    pub agent_identifiers: String,
    /// Base interval of the sync loop.
    pub sync_interval: Duration,
    /// Interval at which each client logs its connection health.
    pub probe_interval: Duration,
    /// Ceiling the sync interval backs off to while dials keep failing.
    pub sync_interval_cap: Duration,
    pub service_account_token_path: Option<PathBuf>,
    pub warn_on_channel_limit: bool,
    /// Keep dialing after the server count is reached, to pick up new servers.
    pub sync_forever: bool,
    pub xfr_channel_size: usize,
    pub server_lease_counter: Option<Arc<dyn ServerLeaseCounter>>,
    pub metrics: Arc<dyn MetricsSink>,
}

impl Default for ClientSetConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            agent_id: String::new(),
            agent_identifiers: String::new(),
            sync_interval: Duration::from_secs(1),
            probe_interval: Duration::from_secs(1),
            sync_interval_cap: Duration::from_secs(10),
            service_account_token_path: None,
            warn_on_channel_limit: false,
            sync_forever: false,
            xfr_channel_size: 150,
            server_lease_counter: None,
            metrics: Arc::new(AgentMetrics::default()),
        }
    }
}

impl ClientSetConfig {
    /// Builds the client set. `drain` marks the agent as pending termination,
    /// `stop` ends the sync loop and closes all clients.
    pub fn new_agent_client_set<F: ClientFactory>(
        self,
        factory: F,
        drain: CancellationToken,
        stop: CancellationToken,
    ) -> Arc<ClientSet<F>> {
        let dial_params = DialParams {
            address: self.address,
            agent_id: self.agent_id,
            agent_identifiers: self.agent_identifiers,
            probe_interval: self.probe_interval,
            service_account_token_path: self.service_account_token_path,
            warn_on_channel_limit: self.warn_on_channel_limit,
            xfr_channel_size: self.xfr_channel_size,
            drain: drain.clone(),
        };
        Arc::new(ClientSet {
            clients: Mutex::new(HashMap::new()),
            server_counts: Mutex::new(ServerCounts::default()),
            factory,
            dial_params,
            lease_counter: self.server_lease_counter,
            metrics: self.metrics,
            sync_interval: self.sync_interval,
            sync_interval_cap: self.sync_interval_cap,
            sync_forever: self.sync_forever,
            drain,
            stop,
        })
    }
}

#[derive(Debug, Default)]
struct ServerCounts {
    /// Last server count reported by a proxy server on dial.
    last_received: usize,
    /// Last value returned by `server_count`, from whichever source had priority.
    last_resolved: usize,
}

/// Clients connected to each instance of an HA proxy server, keyed by server id.
pub struct ClientSet<F: ClientFactory> {
    clients: Mutex<HashMap<String, Arc<F::Client>>>,
    server_counts: Mutex<ServerCounts>,
    factory: F,
    dial_params: DialParams,
    lease_counter: Option<Arc<dyn ServerLeaseCounter>>,
    metrics: Arc<dyn MetricsSink>,
    sync_interval: Duration,
    sync_interval_cap: Duration,
    sync_forever: bool,
    drain: CancellationToken,
    stop: CancellationToken,
}

impl<F: ClientFactory> ClientSet<F> {
    pub fn clients_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// Number of clients whose transport reports `Ready`.
    pub fn healthy_clients_count(&self) -> usize {
        self.clients
            .lock()
            .values()
            .filter(|c| c.state() == ConnectivityState::Ready)
            .count()
    }

    pub fn has_id(&self, server_id: &str) -> bool {
        self.clients.lock().contains_key(server_id)
    }

    /// Adds a client for `server_id`.
    ///
    /// A server id already present is rejected and the existing client is kept.
    /// The rejected client is not closed here.
    pub fn add_client(
        &self,
        server_id: &str,
        client: Arc<F::Client>,
    ) -> Result<(), DuplicateServerError> {
        let mut clients = self.clients.lock();
        match clients.entry(server_id.to_string()) {
            Entry::Occupied(_) => Err(DuplicateServerError {
                server_id: server_id.to_string(),
            }),
            Entry::Vacant(entry) => {
                entry.insert(client);
                self.metrics.set_server_connections_count(clients.len());
                Ok(())
            }
        }
    }

    /// Closes and removes the client for `server_id`. No-op if it is absent.
    pub fn remove_client(&self, server_id: &str) {
        let mut clients = self.clients.lock();
        if let Some(client) = clients.remove(server_id) {
            client.close();
            self.metrics.set_server_connections_count(clients.len());
        }
    }

    /// Like `remove_client`, but only if the set still holds this exact client.
    fn remove_client_if_current(&self, server_id: &str, client: &Arc<F::Client>) {
        let mut clients = self.clients.lock();
        if let Entry::Occupied(entry) = clients.entry(server_id.to_string()) {
            if Arc::ptr_eq(entry.get(), client) {
                entry.remove().close();
                self.metrics.set_server_connections_count(clients.len());
            }
        }
    }

    /// True once the agent has been marked as pending termination.
    pub fn is_draining(&self) -> bool {
        self.drain.is_cancelled()
    }

    pub fn drain_signal(&self) -> &CancellationToken {
        &self.drain
    }

    /// Resolves the number of proxy servers to hold clients for.
    ///
    /// The lease counter takes priority over the count reported on dial. Every
    /// change of the resolved value is logged once.
    pub fn server_count(&self) -> usize {
        let mut counts = self.server_counts.lock();
        let server_count = match &self.lease_counter {
            Some(counter) => counter.count(),
            None => counts.last_received,
        };

        if server_count != counts.last_resolved {
            warn!(
                "change detected in proxy server count (was: {}, now: {})",
                counts.last_resolved, server_count
            );
            counts.last_resolved = server_count;
        }
        drop(counts);

        self.metrics.set_server_count(server_count);
        server_count
    }

    /// One reconciliation step: dials a new client unless the set already
    /// covers the resolved server count.
    ///
    /// Returns the server count the step reconciled against along with the
    /// outcome of the dial.
    pub async fn connect_once(self: &Arc<Self>) -> (usize, Result<(), ClientError>) {
        let server_count = self.server_count();

        if !self.sync_forever && server_count != 0 && self.clients_count() >= server_count {
            return (server_count, Ok(()));
        }

        let (client, received_server_count) = match self.factory.dial(&self.dial_params).await {
            Ok(dialed) => dialed,
            Err(e) => return (server_count, Err(e)),
        };
        self.server_counts.lock().last_received = received_server_count;

        let client = Arc::new(client);
        let server_id = client.server_id().to_string();
        if let Err(e) = self.add_client(&server_id, client.clone()) {
            client.close();
            return (server_count, Err(e.into()));
        }
        info!(server_id = %server_id, "sync added client connecting to proxy server");

        self.spawn_serve(server_id, client);
        (server_count, Ok(()))
    }

    fn spawn_serve(self: &Arc<Self>, server_id: String, client: Arc<F::Client>) {
        let span = info_span!(
            "client_serve",
            agent_identifiers = %self.dial_params.agent_identifiers,
            server_address = %self.dial_params.address,
            server_id = %server_id,
        );
        let evict = EvictOnDrop {
            client_set: Arc::clone(self),
            server_id,
            client,
        };
        tokio::spawn(
            async move {
                evict.client.clone().serve().await;
                debug!("client finished serving");
                drop(evict);
            }
            .instrument(span),
        );
    }

    /// Starts the sync loop in the background and returns its handle.
    pub fn serve(self: &Arc<Self>) -> JoinHandle<()> {
        let span = info_span!(
            "client_set_sync",
            agent_identifiers = %self.dial_params.agent_identifiers,
            server_address = %self.dial_params.address,
        );
        tokio::spawn(Arc::clone(self).sync().instrument(span))
    }

    fn reset_backoff(&self) -> Backoff {
        Backoff::new(self.sync_interval, self.sync_interval_cap)
    }

    /// Keeps the number of clients at or above the number of proxy servers
    /// until the stop signal fires.
    async fn sync(self: Arc<Self>) {
        let _shutdown = ShutdownOnDrop(&*self);
        let mut backoff = self.reset_backoff();
        loop {
            let (server_count, result) = self.connect_once().await;
            let duration = self.next_sync_delay(&mut backoff, server_count, &result);
            tokio::time::sleep(duration).await;
            if self.stop.is_cancelled() {
                info!("Stop signal received, leaving sync loop.");
                return;
            }
        }
    }

    /// Picks the sleep before the next step and updates `backoff`.
    ///
    /// A duplicate server while more servers remain to be found is retried at
    /// the base interval. Once the set already covers the server count it backs
    /// off like any other failure.
    fn next_sync_delay(
        &self,
        backoff: &mut Backoff,
        server_count: usize,
        result: &Result<(), ClientError>,
    ) -> Duration {
        match result {
            Ok(()) => {
                *backoff = self.reset_backoff();
                backoff.jittered()
            }
            Err(ClientError::Duplicate(dse)) => {
                let clients_count = self.clients_count();
                debug!(
                    server_id = %dse.server_id,
                    server_count,
                    clients_count,
                    "duplicate server"
                );
                if server_count != 0 && clients_count >= server_count {
                    backoff.step()
                } else {
                    *backoff = self.reset_backoff();
                    backoff.jittered()
                }
            }
            Err(e) => {
                error!(error = %e, "cannot connect once");
                backoff.step()
            }
        }
    }

    /// Closes every client and empties the set.
    fn shutdown(&self) {
        let mut clients = self.clients.lock();
        for (server_id, client) in clients.drain() {
            debug!(server_id = %server_id, "closing client on shutdown");
            client.close();
        }
        self.metrics.set_server_connections_count(0);
    }
}

struct ShutdownOnDrop<'a, F: ClientFactory>(&'a ClientSet<F>);

impl<F: ClientFactory> Drop for ShutdownOnDrop<'_, F> {
    fn drop(&mut self) {
        self.0.shutdown();
    }
}

/// Evicts a served client once its serving task ends, even if `serve()` panics.
struct EvictOnDrop<F: ClientFactory> {
    client_set: Arc<ClientSet<F>>,
    server_id: String,
    client: Arc<F::Client>,
}

impl<F: ClientFactory> Drop for EvictOnDrop<F> {
    fn drop(&mut self) {
        self.client_set
            .remove_client_if_current(&self.server_id, &self.client);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    use super::*;
    use crate::backoff::{BACKOFF_FACTOR, BACKOFF_JITTER};
    use crate::testing::{DialOutcome, MockClient, ScriptedFactory};

    const SYNC_INTERVAL: Duration = Duration::from_millis(100);
    const SYNC_INTERVAL_CAP: Duration = Duration::from_millis(1000);

    struct FixedLeases(usize);

    impl ServerLeaseCounter for FixedLeases {
        fn count(&self) -> usize {
            self.0
        }
    }

    fn client_set(
        factory: ScriptedFactory,
        sync_forever: bool,
    ) -> (Arc<ClientSet<ScriptedFactory>>, Arc<AgentMetrics>) {
        let metrics = Arc::new(AgentMetrics::default());
        let config = ClientSetConfig {
            address: "proxy.test:8091".to_string(),
            agent_id: "agent-1".to_string(),
            sync_interval: SYNC_INTERVAL,
            sync_interval_cap: SYNC_INTERVAL_CAP,
            sync_forever,
            metrics: metrics.clone(),
            ..Default::default()
        };
        let set = config.new_agent_client_set(
            factory,
            CancellationToken::new(),
            CancellationToken::new(),
        );
        (set, metrics)
    }

    fn is_base_interval(d: Duration) -> bool {
        d >= SYNC_INTERVAL.mul_f64(1.0 - BACKOFF_JITTER) && d <= SYNC_INTERVAL.mul_f64(1.0 + BACKOFF_JITTER)
    }

    /// Counts events whose message contains `needle`.
    struct MessageCounter {
        needle: &'static str,
        hits: Arc<AtomicUsize>,
    }

    impl<S: tracing::Subscriber> Layer<S> for MessageCounter {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            let mut message = MessageVisitor(String::new());
            event.record(&mut message);
            if message.0.contains(self.needle) {
                self.hits.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    struct MessageVisitor(String);

    impl tracing::field::Visit for MessageVisitor {
        fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
            if field.name() == "message" {
                self.0 = format!("{:?}", value);
            }
        }
    }

    fn duplicate(server_id: &str) -> Result<(), ClientError> {
        Err(DuplicateServerError {
            server_id: server_id.to_string(),
        }
        .into())
    }

    #[test]
    fn test_add_rejects_duplicate_and_keeps_first() {
        let (set, metrics) = client_set(ScriptedFactory::new(vec![]), false);
        let first = MockClient::new("srv-a");
        let second = MockClient::new("srv-a");

        set.add_client("srv-a", Arc::new(first.clone())).unwrap();
        let err = set.add_client("srv-a", Arc::new(second.clone())).unwrap_err();

        assert_eq!(err.server_id, "srv-a");
        assert_eq!(set.clients_count(), 1);
        assert_eq!(metrics.server_connections_count(), 1);

        // The kept client is the first one; removing it closes the first only.
        set.remove_client("srv-a");
        assert_eq!(first.close_calls(), 1);
        assert_eq!(second.close_calls(), 0);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let (set, metrics) = client_set(ScriptedFactory::new(vec![]), false);
        let client = MockClient::new("srv-a");
        set.add_client("srv-a", Arc::new(client.clone())).unwrap();
        set.add_client("srv-b", Arc::new(MockClient::new("srv-b"))).unwrap();

        set.remove_client("srv-a");
        set.remove_client("srv-a");

        assert_eq!(client.close_calls(), 1);
        assert_eq!(set.clients_count(), 1);
        assert!(!set.has_id("srv-a"));
        assert!(set.has_id("srv-b"));
        assert_eq!(metrics.server_connections_count(), 1);
    }

    #[test]
    fn test_remove_if_current_ignores_replaced_client() {
        let (set, _) = client_set(ScriptedFactory::new(vec![]), false);
        let stale = Arc::new(MockClient::new("srv-a"));
        let current = Arc::new(MockClient::new("srv-a"));

        set.add_client("srv-a", stale.clone()).unwrap();
        set.remove_client("srv-a");
        set.add_client("srv-a", current.clone()).unwrap();

        set.remove_client_if_current("srv-a", &stale);
        assert!(set.has_id("srv-a"));
        assert_eq!(current.close_calls(), 0);

        set.remove_client_if_current("srv-a", &current);
        assert!(!set.has_id("srv-a"));
        assert_eq!(current.close_calls(), 1);
    }

    #[test]
    fn test_healthy_clients_count() {
        let (set, _) = client_set(ScriptedFactory::new(vec![]), false);
        let ready = MockClient::new("srv-a");
        let connecting = MockClient::new("srv-b");
        connecting.set_state(ConnectivityState::Connecting);
        let closed = MockClient::new("srv-c");
        closed.close();

        set.add_client("srv-a", Arc::new(ready)).unwrap();
        set.add_client("srv-b", Arc::new(connecting)).unwrap();
        set.add_client("srv-c", Arc::new(closed)).unwrap();

        assert_eq!(set.clients_count(), 3);
        assert_eq!(set.healthy_clients_count(), 1);
    }

    #[test]
    fn test_server_count_prefers_lease_counter() {
        let metrics = Arc::new(AgentMetrics::default());
        let config = ClientSetConfig {
            server_lease_counter: Some(Arc::new(FixedLeases(3))),
            metrics: metrics.clone(),
            ..Default::default()
        };
        let set = config.new_agent_client_set(
            ScriptedFactory::new(vec![]),
            CancellationToken::new(),
            CancellationToken::new(),
        );
        set.server_counts.lock().last_received = 5;

        assert_eq!(set.server_count(), 3);
        assert_eq!(set.server_counts.lock().last_resolved, 3);
        assert_eq!(metrics.server_count(), 3);
    }

    #[test]
    fn test_server_count_tracks_last_received() {
        let (set, _) = client_set(ScriptedFactory::new(vec![]), false);
        assert_eq!(set.server_count(), 0);

        set.server_counts.lock().last_received = 2;
        assert_eq!(set.server_count(), 2);
        assert_eq!(set.server_count(), 2);
        assert_eq!(set.server_counts.lock().last_resolved, 2);
    }

    #[test]
    fn test_server_count_change_is_logged_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(MessageCounter {
            needle: "change detected in proxy server count",
            hits: hits.clone(),
        });
        let (set, _) = client_set(ScriptedFactory::new(vec![]), false);

        tracing::subscriber::with_default(subscriber, || {
            assert_eq!(set.server_count(), 0);
            set.server_counts.lock().last_received = 2;
            assert_eq!(set.server_count(), 2);
            assert_eq!(set.server_count(), 2);
            set.server_counts.lock().last_received = 3;
            assert_eq!(set.server_count(), 3);
            assert_eq!(set.server_count(), 3);
        });

        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_success_resets_backoff() {
        let (set, _) = client_set(ScriptedFactory::new(vec![]), false);
        let mut backoff = set.reset_backoff();
        let failure: Result<(), ClientError> = Err(ClientError::Handshake("refused".to_string()));
        for _ in 0..5 {
            set.next_sync_delay(&mut backoff, 0, &failure);
        }
        assert!(backoff.current() > SYNC_INTERVAL);

        let delay = set.next_sync_delay(&mut backoff, 0, &Ok(()));
        assert!(is_base_interval(delay), "{:?}", delay);
        assert_eq!(backoff.current(), SYNC_INTERVAL);
    }

    #[test]
    fn test_generic_failures_escalate_up_to_cap() {
        let (set, _) = client_set(ScriptedFactory::new(vec![]), false);
        let mut backoff = set.reset_backoff();
        let failure: Result<(), ClientError> = Err(ClientError::Handshake("refused".to_string()));

        let mut last_nominal = Duration::ZERO;
        for _ in 0..15 {
            let nominal = backoff.current();
            let delay = set.next_sync_delay(&mut backoff, 0, &failure);
            assert!(nominal >= last_nominal);
            assert!(delay <= SYNC_INTERVAL_CAP.mul_f64(1.0 + BACKOFF_JITTER));
            last_nominal = nominal;
        }
        assert_eq!(backoff.current(), SYNC_INTERVAL_CAP);
    }

    #[test]
    fn test_duplicate_while_discovering_retries_fast() {
        let (set, _) = client_set(ScriptedFactory::new(vec![]), false);
        set.add_client("srv-a", Arc::new(MockClient::new("srv-a"))).unwrap();

        let mut backoff = set.reset_backoff();
        backoff.step();
        backoff.step();

        // 1 client, 3 servers: more remain to be found.
        let delay = set.next_sync_delay(&mut backoff, 3, &duplicate("srv-a"));
        assert!(is_base_interval(delay), "{:?}", delay);
        assert_eq!(backoff.current(), SYNC_INTERVAL);

        // Unknown server count.
        backoff.step();
        let delay = set.next_sync_delay(&mut backoff, 0, &duplicate("srv-a"));
        assert!(is_base_interval(delay), "{:?}", delay);
        assert_eq!(backoff.current(), SYNC_INTERVAL);
    }

    #[test]
    fn test_duplicate_at_capacity_escalates() {
        let (set, _) = client_set(ScriptedFactory::new(vec![]), false);
        set.add_client("srv-a", Arc::new(MockClient::new("srv-a"))).unwrap();
        set.add_client("srv-b", Arc::new(MockClient::new("srv-b"))).unwrap();

        let mut backoff = set.reset_backoff();
        set.next_sync_delay(&mut backoff, 2, &duplicate("srv-a"));
        assert_eq!(backoff.current(), SYNC_INTERVAL.mul_f64(BACKOFF_FACTOR));

        let delay = set.next_sync_delay(&mut backoff, 2, &duplicate("srv-a"));
        let escalated = SYNC_INTERVAL.mul_f64(BACKOFF_FACTOR);
        assert!(delay >= escalated.mul_f64(1.0 - BACKOFF_JITTER), "{:?}", delay);
        assert!(backoff.current() > escalated);
    }

    #[tokio::test]
    async fn test_connect_once_closes_duplicate() {
        let factory = ScriptedFactory::new(vec![
            DialOutcome::connect("srv-a", 2),
            DialOutcome::connect("srv-a", 2),
        ]);
        let (set, _) = client_set(factory.clone(), false);

        let (_, first) = set.connect_once().await;
        assert!(first.is_ok());

        let (server_count, second) = set.connect_once().await;
        assert_eq!(server_count, 2);
        let err = second.unwrap_err();
        assert_eq!(err.as_duplicate().map(|d| d.server_id.as_str()), Some("srv-a"));

        let dialed = factory.dialed();
        assert_eq!(dialed.len(), 2);
        assert_eq!(dialed[0].close_calls(), 0);
        assert_eq!(dialed[1].close_calls(), 1);
        assert_eq!(set.clients_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_once_keeps_last_received_on_dial_error() {
        let factory = ScriptedFactory::new(vec![
            DialOutcome::connect("srv-a", 3),
            DialOutcome::fail("connection refused"),
        ]);
        let (set, _) = client_set(factory, false);

        set.connect_once().await.1.unwrap();
        let (server_count, result) = set.connect_once().await;

        assert_eq!(server_count, 3);
        assert!(matches!(result, Err(ClientError::Io(_))));
        assert_eq!(set.server_counts.lock().last_received, 3);
    }

    #[tokio::test]
    async fn test_served_client_removes_itself_when_closed() {
        let factory = ScriptedFactory::new(vec![DialOutcome::connect("srv-a", 1)]);
        let (set, metrics) = client_set(factory.clone(), false);

        set.connect_once().await.1.unwrap();
        assert_eq!(set.clients_count(), 1);

        // Ending the serve loop from the client's side evicts it.
        factory.dialed()[0].close();
        for _ in 0..100 {
            if set.clients_count() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(set.clients_count(), 0);
        assert_eq!(metrics.server_connections_count(), 0);
    }

    #[tokio::test]
    async fn test_panicking_serve_still_evicts_client() {
        let factory = ScriptedFactory::new(vec![DialOutcome::connect("srv-b", 1)]);
        let (set, metrics) = client_set(factory.clone(), false);
        let client = MockClient::new("srv-a");
        client.set_panic_on_serve();
        let client = Arc::new(client);

        set.add_client("srv-a", client.clone()).unwrap();
        set.server_counts.lock().last_received = 1;
        set.spawn_serve("srv-a".to_string(), client.clone());
        for _ in 0..100 {
            if set.clients_count() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(set.clients_count(), 0);
        assert_eq!(client.close_calls(), 1);
        assert_eq!(metrics.server_connections_count(), 0);

        // The freed slot is dialed again instead of short-circuiting.
        let (server_count, result) = set.connect_once().await;
        assert_eq!(server_count, 1);
        assert!(result.is_ok());
        assert_eq!(factory.dials(), 1);
        assert!(set.has_id("srv-b"));
    }

    #[tokio::test]
    async fn test_drain_is_exposed_to_clients() {
        let (set, _) = client_set(ScriptedFactory::new(vec![]), false);
        assert!(!set.is_draining());
        set.dial_params.drain.cancel();
        assert!(set.is_draining());
        assert!(set.drain_signal().is_cancelled());
    }
}
