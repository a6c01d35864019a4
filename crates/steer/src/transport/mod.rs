//! Transport layer contract.
//!
//! A transport packages an application-level server (HTTP, WebSocket, …)
//! behind a small capability set; the balancer core never speaks the
//! application protocol. Concrete transports live with the application;
//! this module only defines what the master and worker runtimes consume:
//! the port, the permanence flag that selects the routing policy, and the
//! internal [`ServerHandle`] connections are injected into.

mod server;

use std::io;
use std::sync::Arc;

use async_trait::async_trait;

pub use server::{ServerClosed, ServerHandle};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind port {port}: {source}")]
    Bind { port: u16, source: io::Error },

    #[error("transport i/o error: {0}")]
    Io(#[from] io::Error),
}

/// The pluggable transport contract.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// TCP port the application serves on. In cluster mode the master binds
    /// it; workers never do.
    fn port(&self) -> u16;

    /// The transport's internal server.
    fn server(&self) -> &Arc<ServerHandle>;

    /// True when connections are long-lived and session-bearing, which
    /// selects sticky routing; false selects round-robin.
    fn is_permanent_connection(&self) -> bool;

    /// Bind (where permitted) and serve until the server closes.
    async fn start(&self) -> Result<(), TransportError>;
}
