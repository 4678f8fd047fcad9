//! Test doubles for the client set.
//!
//! [`ScriptedFactory`] replays a fixed list of dial outcomes and keeps a
//! handle to every [`MockClient`] it produced, so tests can inspect what the
//! set did with each one.
//!
//! ```ignore
//! let factory = ScriptedFactory::new(vec![
//!     DialOutcome::connect("srv-a", 2),
//!     DialOutcome::connect("srv-b", 2),
//! ]);
//! let set = ClientSetConfig::default().new_agent_client_set(factory.clone(), drain, stop);
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::client::{Client, ClientFactory, ConnectivityState, DialParams};
use crate::error::ClientError;

/// A client that serves until it is closed and counts `close` calls.
///
/// Clones share state.
#[derive(Debug, Clone)]
pub struct MockClient {
    inner: Arc<MockClientInner>,
}

#[derive(Debug)]
struct MockClientInner {
    server_id: String,
    state: Mutex<ConnectivityState>,
    close_calls: AtomicUsize,
    closed: CancellationToken,
    panic_on_serve: AtomicBool,
}

impl MockClient {
    pub fn new(server_id: &str) -> Self {
        Self {
            inner: Arc::new(MockClientInner {
                server_id: server_id.to_string(),
                state: Mutex::new(ConnectivityState::Ready),
                close_calls: AtomicUsize::new(0),
                closed: CancellationToken::new(),
                panic_on_serve: AtomicBool::new(false),
            }),
        }
    }

    pub fn set_state(&self, state: ConnectivityState) {
        *self.inner.state.lock() = state;
    }

    /// Makes `serve()` panic instead of waiting for `close`.
    pub fn set_panic_on_serve(&self) {
        self.inner.panic_on_serve.store(true, Ordering::SeqCst);
    }

    pub fn close_calls(&self) -> usize {
        self.inner.close_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }
}

impl Client for MockClient {
    fn server_id(&self) -> &str {
        &self.inner.server_id
    }

    fn state(&self) -> ConnectivityState {
        if self.is_closed() {
            ConnectivityState::Shutdown
        } else {
            *self.inner.state.lock()
        }
    }

    fn close(&self) {
        self.inner.close_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.closed.cancel();
    }

    fn serve(self: Arc<Self>) -> impl Future<Output = ()> + Send {
        async move {
            if self.inner.panic_on_serve.load(Ordering::SeqCst) {
                panic!("serve failed for {}", self.inner.server_id);
            }
            self.inner.closed.cancelled().await;
        }
    }
}

/// Result of one scripted dial.
#[derive(Debug, Clone)]
pub enum DialOutcome {
    Connect { server_id: String, server_count: usize },
    Fail(String),
}

impl DialOutcome {
    pub fn connect(server_id: &str, server_count: usize) -> Self {
        DialOutcome::Connect {
            server_id: server_id.to_string(),
            server_count,
        }
    }

    pub fn fail(reason: &str) -> Self {
        DialOutcome::Fail(reason.to_string())
    }
}

/// Factory replaying scripted outcomes in order. The last outcome repeats forever.
///
/// Clones share the script and the record of dialed clients.
#[derive(Debug, Clone)]
pub struct ScriptedFactory {
    inner: Arc<ScriptedFactoryInner>,
}

#[derive(Debug)]
struct ScriptedFactoryInner {
    script: Mutex<VecDeque<DialOutcome>>,
    dials: AtomicUsize,
    dialed: Mutex<Vec<MockClient>>,
    last_params: Mutex<Option<DialParams>>,
}

impl ScriptedFactory {
    pub fn new(outcomes: Vec<DialOutcome>) -> Self {
        Self {
            inner: Arc::new(ScriptedFactoryInner {
                script: Mutex::new(outcomes.into()),
                dials: AtomicUsize::new(0),
                dialed: Mutex::new(Vec::new()),
                last_params: Mutex::new(None),
            }),
        }
    }

    /// Number of dial attempts, successful or not.
    pub fn dials(&self) -> usize {
        self.inner.dials.load(Ordering::SeqCst)
    }

    /// Every client handed out so far, in dial order.
    pub fn dialed(&self) -> Vec<MockClient> {
        self.inner.dialed.lock().clone()
    }

    /// Parameters of the most recent dial.
    pub fn last_params(&self) -> Option<DialParams> {
        self.inner.last_params.lock().clone()
    }

    fn next_outcome(&self) -> Option<DialOutcome> {
        let mut script = self.inner.script.lock();
        if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        }
    }
}

impl ClientFactory for ScriptedFactory {
    type Client = MockClient;

    fn dial(
        &self,
        params: &DialParams,
    ) -> impl Future<Output = Result<(MockClient, usize), ClientError>> + Send {
        self.inner.dials.fetch_add(1, Ordering::SeqCst);
        *self.inner.last_params.lock() = Some(params.clone());
        let outcome = self.next_outcome();
        let inner = self.inner.clone();
        async move {
            match outcome {
                Some(DialOutcome::Connect {
                    server_id,
                    server_count,
                }) => {
                    let client = MockClient::new(&server_id);
                    inner.dialed.lock().push(client.clone());
                    Ok((client, server_count))
                }
                Some(DialOutcome::Fail(reason)) => Err(ClientError::Io(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    reason,
                ))),
                None => Err(ClientError::Handshake("dial script is empty".to_string())),
            }
        }
    }
}
