//! Error types for the client set and its dialers.

/// Returned when a client for an already connected server is added to the set.
///
/// The rejected client is not owned by the set; whoever tried to add it has to
/// close it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("duplicate server: {server_id}")]
pub struct DuplicateServerError {
    pub server_id: String,
}

/// Failure of a single attempt to add a client to the set.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The proxy server address could not be resolved.
    #[error("failed to resolve proxy server address {address}: {source}")]
    Resolve {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Resolution succeeded but produced no usable address.
    #[error("proxy server address {0} resolved to no addresses")]
    NoAddress(String),

    #[error("failed to initiate connection: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("connection failed: {0}")]
    Connection(#[from] quinn::ConnectionError),

    /// The server did not complete the agent handshake.
    #[error("handshake with proxy server failed: {0}")]
    Handshake(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Duplicate(#[from] DuplicateServerError),
}

impl ClientError {
    /// Returns the duplicate server error if this attempt landed on a known server.
    pub fn as_duplicate(&self) -> Option<&DuplicateServerError> {
        match self {
            ClientError::Duplicate(dse) => Some(dse),
            _ => None,
        }
    }
}
