//! Contracts between the client set and the connections it manages.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::ClientError;

/// Connectivity of a single client's transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

/// A single logical connection to one proxy server instance.
pub trait Client: Send + Sync + 'static {
    /// Identity assigned by the proxy server during the handshake.
    fn server_id(&self) -> &str;

    fn state(&self) -> ConnectivityState;

    /// Closes the transport. Calling it more than once has no further effect.
    fn close(&self);

    /// Serves the connection until it ends. Runs as its own task.
    fn serve(self: Arc<Self>) -> impl Future<Output = ()> + Send;
}

/// Dials new clients towards the proxy server address.
///
/// Transport and TLS options live in the factory itself.
pub trait ClientFactory: Send + Sync + 'static {
    type Client: Client;

    /// Dials one connection and returns it with the server count reported by
    /// whichever server instance answered (0 if unknown).
    fn dial(
        &self,
        params: &DialParams,
    ) -> impl Future<Output = Result<(Self::Client, usize), ClientError>> + Send;
}

/// Agent-side parameters handed to the factory on every dial.
#[derive(Debug, Clone)]
pub struct DialParams {
    /// Proxy server address as `host:port`.
    pub address: String,
    pub agent_id: String,
    pub agent_identifiers: String,
    /// How often a served client logs its connection health.
    pub probe_interval: Duration,
    pub service_account_token_path: Option<PathBuf>,
    pub warn_on_channel_limit: bool,
    pub xfr_channel_size: usize,
    /// Fires when the agent is pending termination.
    pub drain: CancellationToken,
}
