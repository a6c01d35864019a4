//! Master runtime: owns the listening socket and routes accepted connections.
//!
//! The master never speaks the application protocol and never reads a byte
//! from an accepted socket: the stream is accepted, routed, and its
//! descriptor shipped to the chosen worker while no read has ever been
//! polled. Routing state (the ordered worker list) is owned by this single
//! event loop; supervision tasks only talk to it over a channel, so there is
//! no locking anywhere on the routing path.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;

use crate::balancer::{Balancer, Policy};
use crate::cluster::ClusterError;
use crate::config::ClusterConfig;
use crate::supervisor::{Supervisor, WorkerEvent, WorkerHandle};
use crate::transport::Transport;

pub async fn run(transport: Arc<dyn Transport>, config: ClusterConfig) -> Result<(), ClusterError> {
    let port = transport.port();
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|source| ClusterError::Bind { port, source })?;

    let seed: u32 = rand::random();
    let policy = Policy::for_transport(transport.is_permanent_connection());
    let balancer = Balancer::new(seed, policy);
    tracing::info!(port, workers = config.workers, ?policy, "master listening");

    let (event_tx, mut event_rx) = mpsc::channel::<WorkerEvent>(64);
    let mut supervisor = Supervisor::new(config.env.clone(), event_tx)?;

    // Workers come up one at a time so ids and routing order match spawn
    // order; the listener is already bound, early clients just queue in the
    // accept backlog.
    let mut workers: VecDeque<WorkerHandle> = VecDeque::with_capacity(config.workers);
    for _ in 0..config.workers {
        workers.push_back(supervisor.spawn_worker().await?);
    }

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => dispatch(&balancer, &mut workers, socket, peer).await,
                Err(e) => tracing::warn!(error = %e, "accept failed"),
            },

            Some(event) = event_rx.recv() => {
                handle_worker_event(event, &mut workers, &mut supervisor, config.respawn).await;
            }

            _ = sigint.recv() => {
                tracing::info!("received SIGINT, shutting down");
                break;
            }

            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
                break;
            }
        }
    }

    for worker in &workers {
        worker.terminate();
    }
    Ok(())
}

/// Route one accepted socket. A connection that cannot be delivered is
/// dropped on the spot, with no retry against another worker; the client sees an
/// abrupt close and retries. The routing list is never mutated on failure;
/// dead workers are pruned when their exit event arrives.
async fn dispatch(
    balancer: &Balancer,
    workers: &mut VecDeque<WorkerHandle>,
    socket: TcpStream,
    peer: SocketAddr,
) {
    let addr = peer.ip().to_string();

    let Some(index) = balancer.select(workers, &addr) else {
        tracing::warn!(%addr, "no workers available, dropping connection");
        return;
    };

    let worker = &workers[index];
    match worker.send_connection(&socket).await {
        Ok(()) => {
            tracing::debug!(%addr, uid = worker.uid(), "connection handed off");
        }
        Err(e) => {
            tracing::error!(%addr, uid = worker.uid(), error = %e, "handoff failed, dropping connection");
        }
    }
    // The master's descriptor closes here; on success the worker already
    // holds its own duplicate.
}

async fn handle_worker_event(
    event: WorkerEvent,
    workers: &mut VecDeque<WorkerHandle>,
    supervisor: &mut Supervisor,
    respawn: bool,
) {
    match event {
        WorkerEvent::Exited { uid, code } => {
            tracing::warn!(uid, ?code, "worker exited");
            reap(workers, supervisor, uid, respawn).await;
        }
        WorkerEvent::Closed { uid } => {
            tracing::info!(uid, "worker closed its server");
            reap(workers, supervisor, uid, respawn).await;
        }
        WorkerEvent::Error { uid, error } => {
            tracing::warn!(uid, %error, "worker channel error");
        }
    }
}

/// Remove a worker from the routing list and, per policy, replace it. The
/// exit that follows a voluntary close finds the uid already gone and is a
/// no-op, so a close-then-exit pair respawns exactly once.
async fn reap(
    workers: &mut VecDeque<WorkerHandle>,
    supervisor: &mut Supervisor,
    uid: u64,
    respawn: bool,
) {
    let Some(position) = workers.iter().position(|w| w.uid() == uid) else {
        return;
    };
    workers.remove(position);

    if respawn {
        match supervisor.spawn_worker().await {
            Ok(replacement) => {
                tracing::info!(uid = replacement.uid(), "respawned worker");
                workers.push_back(replacement);
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to respawn worker");
            }
        }
    } else {
        tracing::info!(remaining = workers.len(), "worker not respawned");
    }
}
