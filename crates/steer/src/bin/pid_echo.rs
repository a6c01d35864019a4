//! Minimal transport for driving a cluster by hand or from tests.
//!
//! Every connection is greeted with `pid:<worker pid>\n`, which makes the
//! routing policy observable from outside. A client that answers `close`
//! makes the worker close its server voluntarily.
//!
//! Configured through the environment (inherited by workers, so master and
//! children build identical transports):
//! - `PID_ECHO_PORT` (default 8080)
//! - `PID_ECHO_WORKERS` (default 2)
//! - `PID_ECHO_RESPAWN` ("1" to respawn, default off)
//! - `PID_ECHO_STICKY` ("1" declares permanent connections, default off)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use steer::{ClusterConfig, ServerHandle, Transport, TransportError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

struct PidEcho {
    port: u16,
    permanent: bool,
    server: Arc<ServerHandle>,
}

#[async_trait]
impl Transport for PidEcho {
    fn port(&self) -> u16 {
        self.port
    }

    fn server(&self) -> &Arc<ServerHandle> {
        &self.server
    }

    fn is_permanent_connection(&self) -> bool {
        self.permanent
    }

    async fn start(&self) -> Result<(), TransportError> {
        // Standalone mode binds here; under a cluster master listen is
        // neutralized and connections only arrive through the sink.
        if let Some(listener) = self.server.listen(self.port).await? {
            let server = Arc::clone(&self.server);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    if server.inject(stream).is_err() {
                        break;
                    }
                }
            });
        }

        let mut connections = self
            .server
            .take_connections()
            .ok_or_else(|| TransportError::Io(std::io::Error::other("server already started")))?;
        let mut closed = self.server.closed();

        loop {
            tokio::select! {
                Some(stream) = connections.recv() => {
                    let server = Arc::clone(&self.server);
                    tokio::spawn(handle(stream, server));
                }
                _ = closed.changed() => return Ok(()),
            }
        }
    }
}

async fn handle(mut stream: TcpStream, server: Arc<ServerHandle>) {
    let greeting = format!("pid:{}\n", std::process::id());
    if stream.write_all(greeting.as_bytes()).await.is_err() {
        return;
    }

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let read = tokio::time::timeout(Duration::from_millis(200), reader.read_line(&mut line)).await;
    if matches!(read, Ok(Ok(n)) if n > 0) && line.trim() == "close" {
        server.close().await;
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).is_ok_and(|v| v == "1")
}

#[tokio::main]
async fn main() -> Result<(), steer::ClusterError> {
    // Master-side subscriber; the worker runtime installs its own in the
    // child process.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let port = std::env::var("PID_ECHO_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);
    let workers = std::env::var("PID_ECHO_WORKERS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(2);

    let transport = Arc::new(PidEcho {
        port,
        permanent: env_flag("PID_ECHO_STICKY"),
        server: Arc::new(ServerHandle::new()),
    });
    let config = ClusterConfig::new()
        .with_workers(workers)
        .with_respawn(env_flag("PID_ECHO_RESPAWN"));

    steer::run(transport, config).await
}
