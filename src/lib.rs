//! # Proxy Agent
//!
//! Keeps one tunnel connection to every instance of a horizontally scaled proxy
//! server fleet reachable through a single address.
//!
//! The heart of the crate is [`clientset::ClientSet`]: it dials the shared
//! address over and over, deduplicates the server instances it lands on by
//! their reported id, and converges the number of live clients to the number
//! of live servers. [`quic`] provides the QUIC clients the agent binary uses.

pub mod backoff;
pub mod client;
pub mod clientset;
pub mod common;
pub mod error;
pub mod lease;
pub mod metrics;
pub mod quic;
pub mod testing;

pub use client::{Client, ClientFactory, ConnectivityState, DialParams};
pub use clientset::{ClientSet, ClientSetConfig};
pub use error::{ClientError, DuplicateServerError};
pub use lease::{DnsLeaseCounter, ServerLeaseCounter};
pub use metrics::{AgentMetrics, MetricsSink};
