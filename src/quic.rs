//! QUIC clients towards proxy server instances.
//!
//! After the QUIC handshake the agent sends an `agent_hello` datagram and the
//! server answers with a `server_hello` datagram carrying its id and the number
//! of server instances it knows about. Both are newline separated, first line
//! the message name, then `key=value` lines:
//!
//! ```text
//! server_hello
//! id=proxy-server-0
//! count=3
//! ```
//!
//! Once served, a client accepts server-initiated streams and proxies each of
//! them to a local TCP address.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use quinn::{ReadExactError, RecvStream, SendStream};
use rand::seq::SliceRandom;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::client::{Client, ClientFactory, ConnectivityState, DialParams};
use crate::common;
use crate::error::ClientError;

/// ALPN protocol advertised to proxy servers.
pub const AGENT_ALPN: &[u8] = b"proxy-agent";

const AGENT_HELLO: &str = "agent_hello";
const SERVER_HELLO: &str = "server_hello";
const NOTIFY_SHUTDOWN: &[u8] = b"notify_shutdown";
const NOTIFY_DRAIN: &[u8] = b"notify_drain";

/// Identity and fleet size reported by a proxy server right after connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub server_id: String,
    /// Number of server instances, 0 if the server did not say.
    pub server_count: usize,
}

impl ServerHello {
    pub fn parse(msg: &[u8]) -> Result<Self, ClientError> {
        let text = std::str::from_utf8(msg)
            .map_err(|_| ClientError::Handshake("server hello is not valid UTF-8".to_string()))?;
        let mut lines = text.lines();
        if lines.next() != Some(SERVER_HELLO) {
            return Err(ClientError::Handshake(
                "unexpected message instead of server hello".to_string(),
            ));
        }

        let mut server_id = None;
        let mut server_count = 0;
        for line in lines {
            match line.split_once('=') {
                Some(("id", id)) if !id.is_empty() => server_id = Some(id.to_string()),
                Some(("count", count)) => {
                    server_count = count.parse().map_err(|_| {
                        ClientError::Handshake(format!("invalid server count {:?}", count))
                    })?;
                }
                _ => trace!("Ignoring server hello line {:?}", line),
            }
        }

        let server_id = server_id
            .ok_or_else(|| ClientError::Handshake("server hello carries no id".to_string()))?;
        Ok(Self {
            server_id,
            server_count,
        })
    }
}

/// Builds the hello datagram the agent sends after connecting.
pub fn agent_hello(params: &DialParams, token: Option<&str>) -> Vec<u8> {
    let mut msg = format!(
        "{}\nid={}\nidentifiers={}",
        AGENT_HELLO, params.agent_id, params.agent_identifiers
    );
    if let Some(token) = token {
        msg.push_str("\ntoken=");
        msg.push_str(token.trim());
    }
    msg.into_bytes()
}

/// Dials proxy server instances over a shared QUIC endpoint.
#[derive(Debug, Clone)]
pub struct QuicClientFactory {
    endpoint: quinn::Endpoint,
    handshake_timeout: Duration,
    /// Local TCP address server-initiated streams are proxied to.
    forward_address: String,
}

impl QuicClientFactory {
    pub fn new(endpoint: quinn::Endpoint, handshake_timeout: Duration, forward_address: String) -> Self {
        Self {
            endpoint,
            handshake_timeout,
            forward_address,
        }
    }

    async fn connect(&self, params: &DialParams) -> Result<(QuicClient, usize), ClientError> {
        let (server_name, _) = common::split_host_port(&params.address)
            .ok_or_else(|| ClientError::NoAddress(params.address.clone()))?;
        let token = match &params.service_account_token_path {
            Some(path) => Some(tokio::fs::read_to_string(path).await?),
            None => None,
        };

        // Land on one of the instances behind the address, like a load balancer would.
        let addrs = common::resolve_addrs(&params.address)
            .await
            .map_err(|source| ClientError::Resolve {
                address: params.address.clone(),
                source,
            })?;
        let addr = *addrs
            .choose(&mut rand::thread_rng())
            .ok_or_else(|| ClientError::NoAddress(params.address.clone()))?;

        info!(remote_addr = %addr, "Attempting to establish QUIC connection...");
        let start_time_utc = Utc::now();
        let connection = self.endpoint.connect(addr, server_name)?.await?;
        let peer_cn = common::peer_common_name(&connection);

        let hello = agent_hello(params, token.as_deref());
        if let Err(e) = connection.send_datagram(hello.into()) {
            connection.close(0u32.into(), b"Handshake Failed");
            return Err(ClientError::Handshake(format!("failed to send agent hello: {}", e)));
        }

        let server_hello =
            match tokio::time::timeout(self.handshake_timeout, connection.read_datagram()).await {
                Ok(Ok(bytes)) => ServerHello::parse(&bytes),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(ClientError::Handshake(format!(
                    "no server hello within {:?}",
                    self.handshake_timeout
                ))),
            };
        let server_hello = match server_hello {
            Ok(hello) => hello,
            Err(e) => {
                connection.close(0u32.into(), b"Handshake Failed");
                return Err(e);
            }
        };

        info!(
            message = "QUIC connection started",
            startAt = %start_time_utc.to_rfc3339(),
            quic_connection_id = %connection.stable_id(),
            server_id = %server_hello.server_id,
            peer_cn = ?peer_cn,
            server_ip = %addr,
            server_count = server_hello.server_count,
        );

        let client = QuicClient {
            connection,
            server_id: server_hello.server_id,
            server_addr: addr,
            start_time: Instant::now(),
            forward_address: self.forward_address.clone(),
            probe_interval: params.probe_interval,
            warn_on_channel_limit: params.warn_on_channel_limit,
            xfr_channel_size: params.xfr_channel_size.max(1),
            drain: params.drain.clone(),
            stream_count: Arc::new(AtomicUsize::new(0)),
        };
        Ok((client, server_hello.server_count))
    }
}

impl ClientFactory for QuicClientFactory {
    type Client = QuicClient;

    fn dial(
        &self,
        params: &DialParams,
    ) -> impl Future<Output = Result<(QuicClient, usize), ClientError>> + Send {
        self.connect(params)
    }
}

/// A QUIC connection to one proxy server instance.
#[derive(Debug)]
pub struct QuicClient {
    connection: quinn::Connection,
    server_id: String,
    server_addr: SocketAddr,
    start_time: Instant,
    forward_address: String,
    probe_interval: Duration,
    warn_on_channel_limit: bool,
    xfr_channel_size: usize,
    drain: CancellationToken,
    /// Streams currently being proxied.
    stream_count: Arc<AtomicUsize>,
}

impl QuicClient {
    async fn run(&self) {
        let (stream_tx, stream_rx) = mpsc::channel(self.xfr_channel_size);
        let dispatcher = tokio::spawn(dispatch_streams(
            stream_rx,
            self.forward_address.clone(),
            self.stream_count.clone(),
        ));
        let mut health_tick = common::tick_interval(self.probe_interval);
        let mut drain_sent = false;

        let reason = loop {
            tokio::select! {
                reason = self.connection.closed() => break reason,

                _ = self.drain.cancelled(), if !drain_sent => {
                    drain_sent = true;
                    info!("Agent is draining, notifying proxy server {}.", self.server_addr);
                    if let Err(e) = self.connection.send_datagram(NOTIFY_DRAIN.to_vec().into()) {
                        warn!("Failed to send notify_drain datagram to {}: {}", self.server_addr, e);
                    }
                }

                // Diagnostics only. A dead connection ends the loop through `closed()`.
                _ = health_tick.tick() => {
                    trace!(
                        state = ?self.state(),
                        rtt = ?self.connection.rtt(),
                        active_streams = self.stream_count.load(Ordering::Relaxed),
                        "connection health"
                    );
                }

                datagram = self.connection.read_datagram() => {
                    if let Ok(bytes) = datagram {
                        if bytes.as_ref() == NOTIFY_SHUTDOWN {
                            info!("Received notify_shutdown from proxy server ({}). Closing connection.", self.server_addr);
                            self.connection.close(0u32.into(), b"Server Shutdown");
                        } else {
                            debug!(len = bytes.len(), "Ignoring unknown control datagram.");
                        }
                    }
                }

                accepted = self.connection.accept_bi() => match accepted {
                    Ok(streams) => self.queue_stream(&stream_tx, streams).await,
                    Err(e) => trace!("Stream listener for {} is stopping: {}", self.server_addr, e),
                },
            }
        };
        dispatcher.abort();

        info!(
            message = "QUIC connection ended",
            quic_connection_id = %self.connection.stable_id(),
            server_ip = %self.server_addr,
            duration_secs = self.start_time.elapsed().as_secs_f64(),
            reason = %reason,
            terminateReason = terminate_reason(&reason),
        );
    }

    async fn queue_stream(
        &self,
        stream_tx: &mpsc::Sender<(SendStream, RecvStream)>,
        streams: (SendStream, RecvStream),
    ) {
        let on_full = || {
            if self.warn_on_channel_limit {
                warn!(
                    "Stream channel to {} is full ({} slots), waiting for room.",
                    self.server_addr, self.xfr_channel_size
                );
            }
        };
        let closed = async {
            self.connection.closed().await;
        };
        match enqueue(stream_tx, streams, on_full, closed).await {
            Ok(()) => {}
            Err(EnqueueError::ReceiverGone) => {
                error!("Stream dispatcher for {} is gone. Dropping stream.", self.server_addr);
            }
            Err(EnqueueError::Cancelled) => {
                debug!("Connection to {} closed while waiting for room. Dropping stream.", self.server_addr);
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum EnqueueError {
    ReceiverGone,
    Cancelled,
}

/// Queues `item` on a bounded channel. When the channel is full, calls
/// `on_full` and waits for room unless `cancel` resolves first.
async fn enqueue<T>(
    tx: &mpsc::Sender<T>,
    item: T,
    on_full: impl FnOnce(),
    cancel: impl Future<Output = ()>,
) -> Result<(), EnqueueError> {
    match tx.try_send(item) {
        Ok(()) => Ok(()),
        Err(TrySendError::Closed(_)) => Err(EnqueueError::ReceiverGone),
        Err(TrySendError::Full(item)) => {
            on_full();
            tokio::select! {
                sent = tx.send(item) => sent.map_err(|_| EnqueueError::ReceiverGone),
                _ = cancel => Err(EnqueueError::Cancelled),
            }
        }
    }
}

impl Client for QuicClient {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    fn state(&self) -> ConnectivityState {
        if self.connection.close_reason().is_some() {
            ConnectivityState::Shutdown
        } else {
            ConnectivityState::Ready
        }
    }

    fn close(&self) {
        self.connection.close(0u32.into(), b"Client Closed");
    }

    fn serve(self: Arc<Self>) -> impl Future<Output = ()> + Send {
        async move { self.run().await }
    }
}

fn terminate_reason(reason: &quinn::ConnectionError) -> &'static str {
    match reason {
        quinn::ConnectionError::LocallyClosed => "shutdown",
        quinn::ConnectionError::ConnectionClosed(_)
        | quinn::ConnectionError::ApplicationClosed(_)
        | quinn::ConnectionError::Reset => "terminatedByPeer",
        quinn::ConnectionError::VersionMismatch
        | quinn::ConnectionError::TransportError(_)
        | quinn::ConnectionError::TimedOut
        | quinn::ConnectionError::CidsExhausted => "error",
    }
}

/// Decrements the active stream count when dropped.
struct StreamGuard {
    count: Arc<AtomicUsize>,
}

impl StreamGuard {
    fn new(count: Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::Relaxed);
        Self { count }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let prev = self.count.fetch_sub(1, Ordering::Relaxed);
        trace!("Stream guard dropped. Active streams: {}", prev.saturating_sub(1));
    }
}

async fn dispatch_streams(
    mut stream_rx: mpsc::Receiver<(SendStream, RecvStream)>,
    forward_address: String,
    stream_count: Arc<AtomicUsize>,
) {
    while let Some((send, recv)) = stream_rx.recv().await {
        let guard = StreamGuard::new(stream_count.clone());
        tokio::spawn(forward_stream(send, recv, guard, forward_address.clone()));
    }
}

/// Proxies one server-initiated stream to the local forward address.
///
/// The server sends a single signal byte first; it is relayed to the local
/// service once the TCP connection is up.
async fn forward_stream(
    mut send_stream: SendStream,
    mut recv_stream: RecvStream,
    _guard: StreamGuard,
    forward_address: String,
) {
    let mut first_byte = [0u8; 1];
    if let Err(e) = recv_stream.read_exact(&mut first_byte).await {
        if let ReadExactError::FinishedEarly(0) = e {
            info!("Stream closed before the signal byte was received.");
        } else {
            error!("Failed to read the signal byte from stream: {}", e);
        }
        return;
    }

    let mut tcp_stream = match TcpStream::connect(&forward_address).await {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to connect to local TCP service at {}: {}", forward_address, e);
            let _ = send_stream.reset(1u32.into());
            return;
        }
    };
    if let Err(e) = tcp_stream.write_all(&first_byte).await {
        error!("Failed to send signal byte to local TCP service {}: {}", forward_address, e);
        let _ = send_stream.reset(2u32.into());
        return;
    }

    let (mut tcp_read, mut tcp_write) = tcp_stream.into_split();
    let quic_to_tcp = async {
        let n = tokio::io::copy(&mut recv_stream, &mut tcp_write).await?;
        tcp_write.shutdown().await?;
        Ok::<u64, std::io::Error>(n)
    };
    let tcp_to_quic = async {
        let n = tokio::io::copy(&mut tcp_read, &mut send_stream).await?;
        send_stream.finish().map_err(std::io::Error::other)?;
        Ok::<u64, std::io::Error>(n)
    };

    match tokio::try_join!(quic_to_tcp, tcp_to_quic) {
        Ok((quic_r, tcp_r)) => info!(
            "Proxy to {} finished. Bytes (QUIC -> TCP): {}, (TCP -> QUIC): {}.",
            forward_address, quic_r, tcp_r
        ),
        Err(e) => error!("Proxy to {} failed: {}", forward_address, e),
    }
}
