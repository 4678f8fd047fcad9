// Agent side of an HA proxy tunnel. Keeps one QUIC connection to every proxy
// server instance behind PROXY_SERVER_HOST and proxies server-initiated
// streams to FORWARD_ADDRESS.
//
// USAGE:
//   RUST_LOG=info cargo run --bin proxy-agent -- --proxy-server-host proxy.example.com ...
//
// SIGTERM drains (the servers are told the agent is going away) and then stops.
// SIGINT and SIGQUIT stop immediately.
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use proxy_agent::common;
use proxy_agent::quic::{QuicClientFactory, AGENT_ALPN};
use proxy_agent::{ClientSetConfig, DnsLeaseCounter, ServerLeaseCounter};

#[derive(Parser)]
struct Args {
    #[arg(long, env = "PROXY_SERVER_HOST")]
    proxy_server_host: String,
    #[arg(long, env = "PROXY_SERVER_PORT", default_value = "8091")]
    proxy_server_port: u16,
    #[arg(long, env = "AGENT_ID")]
    agent_id: String,
    #[arg(long, env = "AGENT_IDENTIFIERS", default_value = "")]
    agent_identifiers: String,
    #[arg(long, env = "AGENT_TRUST_CERTIFICATE_ROOT")]
    ca_cert: String,
    #[arg(long, env = "AGENT_CLIENT_CERTIFICATE")]
    agent_cert: String,
    #[arg(long, env = "AGENT_CLIENT_CERTIFICATE_KEY")]
    agent_key: String,
    #[arg(long, env = "FORWARD_ADDRESS")]
    forward_address: String,
    #[arg(long, env = "SYNC_INTERVAL_MS", default_value = "1000",
          value_parser = clap::value_parser!(u64).range(1..))]
    sync_interval_ms: u64,
    #[arg(long, env = "PROBE_INTERVAL_MS", default_value = "1000",
          value_parser = clap::value_parser!(u64).range(1..))]
    probe_interval_ms: u64,
    #[arg(long, env = "SYNC_INTERVAL_CAP_MS", default_value = "10000")]
    sync_interval_cap_ms: u64,
    #[arg(long, env = "SYNC_FOREVER")]
    sync_forever: bool,
    #[arg(long, env = "HANDSHAKE_TIMEOUT_MS", default_value = "5000")]
    handshake_timeout_ms: u64,
    #[arg(long, env = "SERVICE_ACCOUNT_TOKEN_PATH")]
    service_account_token_path: Option<PathBuf>,
    #[arg(long, env = "WARN_ON_CHANNEL_LIMIT")]
    warn_on_channel_limit: bool,
    #[arg(long, env = "XFR_CHANNEL_SIZE", default_value = "150")]
    xfr_channel_size: usize,
    /// Take the server count from DNS instead of from the servers themselves.
    #[arg(long, env = "COUNT_SERVER_LEASES")]
    count_server_leases: bool,
    #[arg(long, env = "LEASE_REFRESH_INTERVAL_MS", default_value = "10000",
          value_parser = clap::value_parser!(u64).range(1..))]
    lease_refresh_interval_ms: u64,
    /// How long SIGTERM waits between draining and stopping.
    #[arg(long, env = "DRAIN_GRACE_PERIOD_MS", default_value = "10000")]
    drain_grace_period_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    common::setup_tracing();
    common::initialize_crypto_provider();

    // Install signal handlers early to fail fast if they cannot be registered.
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigquit = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::quit())?;

    let address = format!("{}:{}", args.proxy_server_host, args.proxy_server_port);
    info!(
        "Proxy agent started (PID: {}), agent id {}, proxy server {}, forwarding to {}",
        std::process::id(),
        args.agent_id,
        address,
        args.forward_address
    );

    let (certs, key, truststore) =
        common::load_certs_and_key(&args.agent_cert, &args.agent_key, &args.ca_cert)?;
    let endpoint = common::create_quic_client_endpoint(certs, key, truststore, &[AGENT_ALPN])?;

    let drain = CancellationToken::new();
    let stop = CancellationToken::new();

    let server_lease_counter = if args.count_server_leases {
        let counter = DnsLeaseCounter::spawn(
            address.clone(),
            Duration::from_millis(args.lease_refresh_interval_ms),
            stop.clone(),
        );
        Some(Arc::new(counter) as Arc<dyn ServerLeaseCounter>)
    } else {
        None
    };

    let factory = QuicClientFactory::new(
        endpoint.clone(),
        Duration::from_millis(args.handshake_timeout_ms),
        args.forward_address.clone(),
    );
    let config = ClientSetConfig {
        address,
        agent_id: args.agent_id,
        agent_identifiers: args.agent_identifiers,
        sync_interval: Duration::from_millis(args.sync_interval_ms),
        probe_interval: Duration::from_millis(args.probe_interval_ms),
        sync_interval_cap: Duration::from_millis(args.sync_interval_cap_ms),
        service_account_token_path: args.service_account_token_path,
        warn_on_channel_limit: args.warn_on_channel_limit,
        sync_forever: args.sync_forever,
        xfr_channel_size: args.xfr_channel_size,
        server_lease_counter,
        ..Default::default()
    };
    let client_set = config.new_agent_client_set(factory, drain.clone(), stop.clone());
    let sync_task = client_set.serve();

    // --- Main Thread Wait ---
    let graceful = tokio::select! {
        _ = sigint.recv() => {
            info!("SIGINT received. Initiating immediate shutdown.");
            false
        },
        _ = sigterm.recv() => {
            info!("SIGTERM received. Draining before shutdown.");
            true
        },
        _ = sigquit.recv() => {
            info!("SIGQUIT received. Initiating immediate shutdown.");
            false
        },
    };

    if graceful {
        drain.cancel();
        let interrupted = async {
            tokio::select! {
                _ = sigint.recv() => info!("SIGINT received while draining. Cutting the drain short."),
                _ = sigquit.recv() => info!("SIGQUIT received while draining. Cutting the drain short."),
            }
        };
        wait_drain_grace_period(Duration::from_millis(args.drain_grace_period_ms), interrupted).await;
    }

    // --- Final Cleanup ---
    info!("Executing final cleanup...");
    stop.cancel();
    if let Err(e) = sync_task.await {
        warn!("Sync task ended abnormally: {}", e);
    }
    info!(
        clients = client_set.clients_count(),
        "Client set shut down."
    );

    endpoint.close(0u32.into(), b"shutting down");
    endpoint.wait_idle().await;
    info!("Shutdown complete.");

    Ok(())
}

/// Waits out the drain grace period. Returns false if `interrupted` resolved first.
async fn wait_drain_grace_period(
    grace_period: Duration,
    interrupted: impl Future<Output = ()>,
) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(grace_period) => true,
        _ = interrupted => false,
    }
}
