//! # Monitors
//!
//! Event producers feeding the orchestrator. The Docker monitor
//! subscribes to the container daemon's event stream; the RPC monitor
//! accepts authenticated launcher requests on a Unix socket. Both
//! normalize their platform's signals into [`shared_types::EventInfo`]
//! and forward to one handler contract.

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod docker;
pub mod rpc;

pub use docker::{DefaultMetadataExtractor, DockerMetadataExtractor, DockerMonitor};
pub use rpc::RpcMonitor;

use async_trait::async_trait;
use shared_types::{EventInfo, TriremeError};
use thiserror::Error;

/// Default socket the RPC monitor listens on.
pub const MONITOR_SOCKET: &str = "/var/run/monitor.sock";

/// Default Docker daemon endpoint.
pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Default Docker socket type.
pub const DEFAULT_DOCKER_SOCKET_TYPE: &str = "unix";

/// Errors from monitor operations.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// The container daemon cannot be reached.
    #[error("Docker daemon unreachable: {0}")]
    DockerUnavailable(String),

    /// The endpoint configuration is not supported.
    #[error("Unsupported socket type {0}")]
    UnsupportedSocket(String),

    /// A container lacks the metadata needed to build an event.
    #[error("Container metadata incomplete: {0}")]
    Metadata(String),

    /// The monitor socket could not be served.
    #[error("Monitor transport failure: {0}")]
    Transport(String),
}

/// The single contract both monitors forward into.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: EventInfo) -> Result<(), TriremeError>;
}

/// A running event producer.
#[async_trait]
pub trait Monitor: Send + Sync {
    /// Begin producing events. Returns once the producer task is up.
    async fn start(&self) -> Result<(), MonitorError>;

    /// Stop accepting new events and drain the producer task.
    async fn stop(&self);
}
