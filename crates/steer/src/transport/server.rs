//! The transport's internal server object.
//!
//! `ServerHandle` is the seam between the balancer core and a concrete
//! transport. A transport running standalone binds its own listener through
//! [`ServerHandle::listen`] and feeds accepted sockets into
//! [`ServerHandle::inject`]; in a cluster worker the runtime neutralizes
//! `listen` (the master owns the port) and injects sockets received over the
//! control channel instead. Either way the transport consumes connections
//! from the same sink and cannot tell the difference.

use std::io;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures::future::BoxFuture;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

/// Async hook run by [`ServerHandle::close`] before the close is signaled.
pub type CloseHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

#[derive(Debug, thiserror::Error)]
#[error("server connection sink is closed")]
pub struct ServerClosed;

pub struct ServerHandle {
    conn_tx: mpsc::UnboundedSender<TcpStream>,
    conn_rx: StdMutex<Option<mpsc::UnboundedReceiver<TcpStream>>>,
    connections: AtomicU64,
    listen_enabled: AtomicBool,
    close_hook: StdMutex<Option<CloseHook>>,
    closed_tx: watch::Sender<bool>,
}

impl ServerHandle {
    pub fn new() -> Self {
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);
        Self {
            conn_tx,
            conn_rx: StdMutex::new(Some(conn_rx)),
            connections: AtomicU64::new(0),
            listen_enabled: AtomicBool::new(true),
            close_hook: StdMutex::new(None),
            closed_tx,
        }
    }

    /// Take the connection stream. The transport implementation calls this
    /// once and serves every socket that arrives on it.
    pub fn take_connections(&self) -> Option<mpsc::UnboundedReceiver<TcpStream>> {
        self.conn_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    /// Hand a socket to the server exactly as a local accept would: bump the
    /// connection counter, then emit it on the connection sink.
    pub fn inject(&self, stream: TcpStream) -> Result<(), ServerClosed> {
        self.connections.fetch_add(1, Ordering::AcqRel);
        self.conn_tx.send(stream).map_err(|_| ServerClosed)
    }

    /// Total connections the server has been handed since startup.
    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Acquire)
    }

    /// Disable [`listen`](Self::listen). Called by the worker runtime before
    /// `start`: binding already happened in the master.
    pub fn neutralize_listen(&self) {
        self.listen_enabled.store(false, Ordering::Release);
    }

    /// Bind the serving port. Returns `None` when listening is neutralized.
    pub async fn listen(&self, port: u16) -> io::Result<Option<TcpListener>> {
        if !self.listen_enabled.load(Ordering::Acquire) {
            tracing::debug!(port, "listen suppressed, socket owned by master");
            return Ok(None);
        }
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        Ok(Some(listener))
    }

    /// Install a hook that runs inside [`close`](Self::close) before the
    /// closed signal fires. Replaces any previous hook.
    pub fn set_close_hook<F>(&self, hook: F)
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        if let Ok(mut slot) = self.close_hook.lock() {
            *slot = Some(Box::new(hook));
        }
    }

    /// Close the server: run the wrapped hook, then flip the closed signal
    /// that `start` implementations wait on.
    pub async fn close(&self) {
        let hook = self.close_hook.lock().ok().and_then(|mut slot| slot.take());
        if let Some(hook) = hook {
            hook().await;
        }
        let _ = self.closed_tx.send(true);
    }

    /// Watch for the closed signal.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }
}

impl Default for ServerHandle {
    fn default() -> Self {
        Self::new()
    }
}
