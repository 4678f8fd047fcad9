use quinn::crypto::rustls::QuicClientConfig;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::error::Error;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;
use x509_parser::oid_registry::OID_X509_COMMON_NAME;
use x509_parser::parse_x509_certificate;

const MAX_CONCURRENT_UNI_STREAMS: u8 = 0;
const KEEP_ALIVE_INTERVAL_SECS: u64 = 50;
const DATAGRAM_RECEIVE_BUFFER_SIZE: usize = 1024 * 1024;

/// Initializes the tracing subscriber for logging.
pub fn setup_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .with_current_span(true)
        .init();
}

/// Installs the default crypto provider.
pub fn initialize_crypto_provider() {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("A process-wide crypto provider is already installed.");
    }
}

/// Loads the agent certificate chain, its private key, and a trust store from PEM files.
///
/// # Arguments
///
/// * `my_cert_path`: Path to the agent certificate PEM file.
/// * `my_key_path`: Path to the agent private key PEM file.
/// * `trust_ca_cert_path`: Path to the trusted CA certificate(s) PEM file.
pub fn load_certs_and_key(
    my_cert_path: &str,
    my_key_path: &str,
    trust_ca_cert_path: &str,
) -> Result<
    (
        Vec<CertificateDer<'static>>,
        PrivateKeyDer<'static>,
        quinn::rustls::RootCertStore,
    ),
    Box<dyn Error>,
> {
    let certs = CertificateDer::pem_file_iter(my_cert_path)?
        .map(|cert_result| cert_result.map_err(|e| e.into()))
        .collect::<Result<Vec<_>, Box<dyn Error>>>()?;

    let key = PrivateKeyDer::from_pem_file(my_key_path)?;

    let mut truststore = quinn::rustls::RootCertStore::empty();
    for cert in CertificateDer::pem_file_iter(trust_ca_cert_path)? {
        truststore.add(cert?)?;
    }

    Ok((certs, key, truststore))
}

/// Creates the QUIC client endpoint used to dial proxy server instances.
///
/// Sets up mutual TLS, the ALPN protocols, and the transport parameters
/// (keep-alive, no idle timeout, datagram buffer for control messages).
pub fn create_quic_client_endpoint(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    truststore: quinn::rustls::RootCertStore,
    alpn_protocols: &[&[u8]],
) -> Result<quinn::Endpoint, Box<dyn Error>> {
    let mut client_config = quinn::rustls::ClientConfig::builder()
        .with_root_certificates(truststore)
        .with_client_auth_cert(certs, key)?;
    client_config.alpn_protocols = alpn_protocols.iter().map(|p| p.to_vec()).collect();

    let mut quic_client_config =
        quinn::ClientConfig::new(Arc::new(QuicClientConfig::try_from(client_config)?));
    let mut transport_config = quinn::TransportConfig::default();
    transport_config
        .max_concurrent_uni_streams(MAX_CONCURRENT_UNI_STREAMS.into())
        .keep_alive_interval(Some(Duration::from_secs(KEEP_ALIVE_INTERVAL_SECS)))
        .datagram_receive_buffer_size(Some(DATAGRAM_RECEIVE_BUFFER_SIZE))
        .max_idle_timeout(None);
    quic_client_config.transport_config(Arc::new(transport_config));

    let mut endpoint = quinn::Endpoint::client("[::]:0".parse()?)?;
    endpoint.set_default_client_config(quic_client_config);
    Ok(endpoint)
}

/// Returns the Common Name of the certificate the proxy server presented.
pub fn peer_common_name(connection: &quinn::Connection) -> Option<String> {
    let identity = connection.peer_identity()?;
    let certs = identity.downcast_ref::<Vec<CertificateDer<'static>>>()?;
    let server_cert = certs.first()?;

    match parse_x509_certificate(server_cert.as_ref()) {
        Ok((_, parsed_cert)) => {
            info!("  - Subject: {}", parsed_cert.subject());
            info!("  - Issuer:  {}", parsed_cert.issuer());
            parsed_cert
                .subject()
                .iter()
                .flat_map(|rdn| rdn.iter())
                .find(|attr| attr.attr_type() == &OID_X509_COMMON_NAME)
                .and_then(|attr| attr.attr_value().as_str().ok())
                .map(String::from)
        }
        Err(_) => {
            error!("Failed to parse proxy server certificate.");
            None
        }
    }
}

/// Splits `host:port` into its parts. Bracketed IPv6 hosts are unwrapped.
pub fn split_host_port(address: &str) -> Option<(&str, u16)> {
    let (host, port) = address.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    Some((host, port))
}

/// Resolves `host:port` to its distinct socket addresses off the async runtime.
pub async fn resolve_addrs(address: &str) -> std::io::Result<Vec<SocketAddr>> {
    let address = address.to_string();
    let mut addrs = tokio::task::spawn_blocking(move || {
        address
            .to_socket_addrs()
            .map(|addrs| addrs.collect::<Vec<_>>())
    })
    .await
    .map_err(std::io::Error::other)??;
    addrs.sort();
    addrs.dedup();
    Ok(addrs)
}

/// Shortest period a periodic task ticks at. `tokio::time::interval` panics on zero.
pub const MIN_TICK_PERIOD: Duration = Duration::from_millis(1);

/// Builds a tokio interval, raising `period` to [`MIN_TICK_PERIOD`] if needed.
pub fn tick_interval(period: Duration) -> tokio::time::Interval {
    tokio::time::interval(period.max(MIN_TICK_PERIOD))
}
