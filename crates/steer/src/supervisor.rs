//! Worker process supervision.
//!
//! The supervisor forks the master's own program image: the child re-enters
//! `main`, the role detector sees `CLUSTER_MASTER_PID` in its environment and
//! takes the worker path. Each spawn binds a fresh Unix control socket, puts
//! its path in the child's environment, and waits for the child to dial back;
//! that stream then carries handoffs downstream and close notices upstream.
//!
//! Exit, in-band messages, and channel errors are all reported into the
//! master event loop as [`WorkerEvent`]s; the respawn decision lives there.

use std::collections::HashMap;
use std::io;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::net::{TcpStream, UnixListener, UnixStream};
use tokio::sync::mpsc;

use crate::bridge::codec;
use crate::bridge::fdpass::{self, FrameReader};
use crate::bridge::protocol::{MasterMessage, WorkerMessage};
use crate::role::{CONTROL_SOCKET_ENV, MASTER_PID_ENV, WORKER_ID_ENV};

/// How long a freshly spawned child gets to connect its control socket.
const CONTROL_ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

const DEBUG_FLAGS: [&str; 4] = [
    "--inspect",
    "--inspect-brk",
    "--inspect-port",
    "--debug-port",
];
const DEFAULT_DEBUG_PORT: u32 = 9229;
const MAX_PORT: u32 = 65535;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn worker process: {0}")]
    Io(#[from] io::Error),

    #[error("worker {uid} never connected its control socket")]
    ControlTimeout { uid: u64 },
}

/// Lifecycle notifications delivered to the master event loop.
#[derive(Debug)]
pub enum WorkerEvent {
    /// The child process exited (crash or normal termination).
    Exited { uid: u64, code: Option<i32> },
    /// The worker announced a voluntary server close.
    Closed { uid: u64 },
    /// Control channel error. The worker is kept; an exit follows if the
    /// process actually died.
    Error { uid: u64, error: String },
}

/// Master-side handle to one live worker.
pub struct WorkerHandle {
    uid: u64,
    pid: u32,
    channel: Arc<UnixStream>,
    connected: Arc<AtomicBool>,
}

impl WorkerHandle {
    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Hand an accepted socket to this worker. The master must not have read
    /// from it; the kernel duplicates the descriptor into the child and the
    /// caller drops its copy afterwards.
    pub async fn send_connection(&self, socket: &TcpStream) -> io::Result<()> {
        if !self.is_connected() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "worker control channel is down",
            ));
        }
        let frame = codec::encode(&MasterMessage::Balancing)?;
        fdpass::send_frame(&self.channel, &frame, Some(socket.as_raw_fd())).await
    }

    /// Ask the child to terminate. Best-effort; used on master shutdown.
    pub fn terminate(&self) {
        // pid 0 would signal the whole process group.
        if self.pid != 0 {
            let _ = kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM);
        }
    }
}

pub struct Supervisor {
    env_overlay: HashMap<String, String>,
    master_args: Vec<String>,
    master_pid: u32,
    control_dir: PathBuf,
    next_uid: u64,
    spawn_count: u32,
    event_tx: mpsc::Sender<WorkerEvent>,
}

impl Supervisor {
    pub fn new(
        env_overlay: HashMap<String, String>,
        event_tx: mpsc::Sender<WorkerEvent>,
    ) -> io::Result<Self> {
        let master_pid = std::process::id();
        let control_dir = std::env::temp_dir().join(format!("steer-{master_pid}"));
        std::fs::create_dir_all(&control_dir)?;

        Ok(Self {
            env_overlay,
            master_args: std::env::args().skip(1).collect(),
            master_pid,
            control_dir,
            next_uid: 1,
            spawn_count: 0,
            event_tx,
        })
    }

    /// Spawn one worker and wait for its control socket to come up.
    pub async fn spawn_worker(&mut self) -> Result<WorkerHandle, SpawnError> {
        let (uid, debug_offset) = self.next_ids();

        let socket_path = self.control_dir.join(format!("worker-{uid}.sock"));
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }
        let listener = UnixListener::bind(&socket_path)?;

        let exe = std::env::current_exe()?;
        let args = rewrite_debug_args(&self.master_args, debug_offset);

        let mut command = tokio::process::Command::new(&exe);
        command
            .args(&args)
            .envs(&self.env_overlay)
            .env(MASTER_PID_ENV, self.master_pid.to_string())
            .env(WORKER_ID_ENV, uid.to_string())
            .env(CONTROL_SOCKET_ENV, &socket_path)
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let pid = child.id().unwrap_or(0);
        tracing::debug!(uid, pid, "worker process spawned, waiting for control socket");

        let stream = match tokio::time::timeout(CONTROL_ACCEPT_TIMEOUT, listener.accept()).await {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(SpawnError::Io(e));
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(SpawnError::ControlTimeout { uid });
            }
        };
        drop(listener);
        let _ = std::fs::remove_file(&socket_path);

        let channel = Arc::new(stream);
        let connected = Arc::new(AtomicBool::new(true));

        // Exit watcher owns the child.
        let exit_tx = self.event_tx.clone();
        let exit_connected = Arc::clone(&connected);
        tokio::spawn(async move {
            let code = child.wait().await.ok().and_then(|status| status.code());
            exit_connected.store(false, Ordering::Release);
            let _ = exit_tx.send(WorkerEvent::Exited { uid, code }).await;
        });

        // Upstream message reader.
        let msg_tx = self.event_tx.clone();
        let reader_channel = Arc::clone(&channel);
        let reader_connected = Arc::clone(&connected);
        tokio::spawn(async move {
            let mut reader = FrameReader::new(reader_channel);
            loop {
                match reader.next_frame::<serde_json::Value>().await {
                    Ok(Some((value, _fd))) => {
                        match serde_json::from_value::<WorkerMessage>(value) {
                            Ok(WorkerMessage::Close) => {
                                let _ = msg_tx.send(WorkerEvent::Closed { uid }).await;
                            }
                            Err(_) => {
                                tracing::debug!(uid, "ignoring unrecognized worker message");
                            }
                        }
                    }
                    Ok(None) => {
                        reader_connected.store(false, Ordering::Release);
                        break;
                    }
                    Err(e) => {
                        reader_connected.store(false, Ordering::Release);
                        let _ = msg_tx
                            .send(WorkerEvent::Error {
                                uid,
                                error: e.to_string(),
                            })
                            .await;
                        break;
                    }
                }
            }
        });

        tracing::info!(uid, pid, "worker online");
        Ok(WorkerHandle {
            uid,
            pid,
            channel,
            connected,
        })
    }

    /// Allocate the next unique id and debug-port offset. Ids are monotonic
    /// across the master's lifetime and never reused; the offset advances on
    /// every spawn, respawns included.
    fn next_ids(&mut self) -> (u64, u32) {
        let uid = self.next_uid;
        self.next_uid += 1;
        self.spawn_count += 1;
        (uid, self.spawn_count)
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.control_dir);
    }
}

/// Copy the master's argv for a child, moving any debugger flag onto a fresh
/// port so child debuggers never collide with the master's or each other's.
fn rewrite_debug_args(args: &[String], offset: u32) -> Vec<String> {
    let Some(master_port) = args.iter().find_map(|arg| parse_debug_flag(arg)) else {
        return args.to_vec();
    };

    let mut port = master_port + offset;
    if port > MAX_PORT {
        port -= 1;
    }

    let mut rewritten: Vec<String> = args
        .iter()
        .filter(|arg| !is_inspect_brk(arg))
        .cloned()
        .collect();
    rewritten.push(format!("--inspect-brk={port}"));
    rewritten
}

/// Recognize a debugger flag and extract its port (default when bare).
fn parse_debug_flag(arg: &str) -> Option<u32> {
    for flag in DEBUG_FLAGS {
        if arg == flag {
            return Some(DEFAULT_DEBUG_PORT);
        }
        if let Some(value) = arg.strip_prefix(flag)
            && let Some(value) = value.strip_prefix('=')
        {
            return Some(value.parse().unwrap_or(DEFAULT_DEBUG_PORT));
        }
    }
    None
}

fn is_inspect_brk(arg: &str) -> bool {
    arg == "--inspect-brk" || arg.starts_with("--inspect-brk=")
}
