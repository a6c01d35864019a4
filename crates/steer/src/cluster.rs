//! Cluster entry point and top-level error type.

use std::io;
use std::sync::Arc;

use crate::config::ClusterConfig;
use crate::master;
use crate::role::Role;
use crate::supervisor::SpawnError;
use crate::transport::{Transport, TransportError};
use crate::worker;

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The master could not bind the shared port. The only fatal startup
    /// error; everything else is logged and survived.
    #[error("failed to bind listener on port {port}: {source}")]
    Bind { port: u16, source: io::Error },

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The process was classified as a worker but `CLUSTER_CONTROL_SOCKET`
    /// is missing: it was started by hand rather than by a master.
    #[error("CLUSTER_CONTROL_SOCKET is not set; worker started outside a cluster master")]
    MissingControlSocket,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Run the process in its detected role.
///
/// In the master this binds `transport.port()`, spawns the worker pool, and
/// balances accepted connections until shutdown. In a worker (a child the
/// master spawned from its own program image) it adopts handed-off sockets
/// and drives `transport.start()`. Call this from `main` with the same
/// arguments in both cases; the environment decides which path runs.
///
/// A worker returning `Err` should terminate its process with a non-zero
/// status; propagating the error out of `main` does exactly that.
pub async fn run(transport: Arc<dyn Transport>, config: ClusterConfig) -> Result<(), ClusterError> {
    match Role::detect() {
        Role::Master => master::run(transport, config).await,
        Role::Worker => worker::run(transport).await,
    }
}
