//! Worker runtime: adopts handed-off sockets and runs the transport.
//!
//! A worker never binds the shared port. It connects back to the master on
//! the control socket named in its environment, re-injects every socket it
//! receives into the transport server as if it had been locally accepted,
//! and announces voluntary closes upstream before they run.

use std::os::fd::OwnedFd;
use std::sync::Arc;

use tokio::net::UnixStream;

use crate::bridge::codec;
use crate::bridge::fdpass::{self, FrameReader};
use crate::bridge::protocol::{MasterMessage, WorkerMessage};
use crate::cluster::ClusterError;
use crate::role::{CONTROL_SOCKET_ENV, WORKER_ID_ENV};
use crate::transport::{ServerHandle, Transport};

pub async fn run(transport: Arc<dyn Transport>) -> Result<(), ClusterError> {
    init_tracing();

    let socket_path =
        std::env::var(CONTROL_SOCKET_ENV).map_err(|_| ClusterError::MissingControlSocket)?;
    let channel = Arc::new(UnixStream::connect(&socket_path).await?);

    let uid = std::env::var(WORKER_ID_ENV)
        .ok()
        .and_then(|v| v.parse::<u64>().ok());
    tracing::info!(?uid, "worker connected to master");

    let server = Arc::clone(transport.server());

    // Wrap close: the notice goes upstream before the original close runs.
    let close_channel = Arc::clone(&channel);
    server.set_close_hook(move || {
        Box::pin(async move {
            match codec::encode(&WorkerMessage::Close) {
                Ok(frame) => {
                    if let Err(e) = fdpass::send_frame(&close_channel, &frame, None).await {
                        tracing::warn!(error = %e, "failed to announce close to master");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to encode close notice"),
            }
        })
    });

    // Subscribe to handoffs before the transport starts serving.
    let inject_server = Arc::clone(&server);
    let reader_channel = Arc::clone(&channel);
    tokio::spawn(async move {
        let mut reader = FrameReader::new(reader_channel);
        loop {
            // Decode to JSON first: an unknown message is ignored (its
            // descriptor, if any, just closes), only a broken stream is fatal.
            match reader.next_frame::<serde_json::Value>().await {
                Ok(Some((value, fd))) => match serde_json::from_value::<MasterMessage>(value) {
                    Ok(msg) => handle_master_message(&inject_server, msg, fd),
                    Err(_) => tracing::warn!("ignoring unrecognized control message"),
                },
                Ok(None) => {
                    tracing::error!("control channel closed (master gone?), closing server");
                    inject_server.close().await;
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "control channel error, closing server");
                    inject_server.close().await;
                    break;
                }
            }
        }
    });

    // Binding already happened in the master; start must not touch the port.
    server.neutralize_listen();
    transport.start().await.map_err(|e| {
        tracing::error!(error = %e, "transport failed to start");
        ClusterError::Transport(e)
    })
}

/// Apply one control frame from the master. A balancing frame turns its
/// attached descriptor back into a TCP stream and feeds it to the server
/// exactly as a local accept would; nothing has read from the socket yet, so
/// the application sees the client's bytes from the first one.
pub(crate) fn handle_master_message(
    server: &ServerHandle,
    msg: MasterMessage,
    fd: Option<OwnedFd>,
) {
    match msg {
        MasterMessage::Balancing => {
            let Some(fd) = fd else {
                tracing::warn!("balancing frame arrived without a socket, ignoring");
                return;
            };

            let std_stream = std::net::TcpStream::from(fd);
            if let Err(e) = std_stream.set_nonblocking(true) {
                tracing::warn!(error = %e, "failed to prepare handed-off socket");
                return;
            }
            match tokio::net::TcpStream::from_std(std_stream) {
                Ok(stream) => {
                    if server.inject(stream).is_err() {
                        tracing::warn!("server sink closed, dropping handed-off connection");
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to adopt handed-off socket");
                }
            }
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn accepted_with_pending_bytes(payload: &[u8]) -> (TcpStream, OwnedFd) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        client.write_all(payload).await.unwrap();

        // Duplicate the descriptor the way SCM_RIGHTS delivery does, then
        // close the "master's" copy; the dup shares the open connection.
        let master_copy = accepted.into_std().unwrap();
        let owned = OwnedFd::from(master_copy.try_clone().unwrap());
        drop(master_copy);
        (client, owned)
    }

    #[tokio::test]
    async fn balancing_with_fd_injects_a_pristine_stream() {
        let server = ServerHandle::new();
        let mut connections = server.take_connections().unwrap();

        let (_client, fd) = accepted_with_pending_bytes(b"hello worker").await;
        handle_master_message(&server, MasterMessage::Balancing, Some(fd));

        assert_eq!(server.connections(), 1);

        let mut stream = connections.recv().await.unwrap();
        let mut buf = [0u8; 12];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello worker");
    }

    #[tokio::test]
    async fn balancing_without_fd_is_ignored() {
        let server = ServerHandle::new();
        let _connections = server.take_connections().unwrap();

        handle_master_message(&server, MasterMessage::Balancing, None);
        assert_eq!(server.connections(), 0);
    }
}
