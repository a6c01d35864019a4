//! Whole-cluster tests against the real `pid_echo` binary: one master
//! process, real forked workers, descriptors crossing process boundaries.
//!
//! Every observation goes through TCP like a real client; worker identity is
//! read from the `pid:<n>` greeting.

#![cfg(unix)]

use std::collections::HashSet;
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

const BIN: &str = env!("CARGO_BIN_EXE_pid_echo");

const READY_DEADLINE: Duration = Duration::from_secs(30);
const OBSERVE_DEADLINE: Duration = Duration::from_secs(20);

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind probe port");
    listener.local_addr().unwrap().port()
}

struct Cluster {
    master: Child,
    port: u16,
}

impl Cluster {
    fn launch(workers: usize, respawn: bool, sticky: bool) -> Self {
        let port = free_port();
        let master = Command::new(BIN)
            .env("PID_ECHO_PORT", port.to_string())
            .env("PID_ECHO_WORKERS", workers.to_string())
            .env("PID_ECHO_RESPAWN", if respawn { "1" } else { "0" })
            .env("PID_ECHO_STICKY", if sticky { "1" } else { "0" })
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn master");

        let cluster = Self { master, port };
        cluster.await_ready();
        cluster
    }

    fn await_ready(&self) {
        let deadline = Instant::now() + READY_DEADLINE;
        while Instant::now() < deadline {
            if self.try_pid().is_some() {
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        panic!("cluster on port {} never became ready", self.port);
    }

    /// One client connection; returns the serving worker's pid, or None on
    /// any transient failure (connection refused during startup, dropped
    /// during a respawn gap).
    fn try_pid(&self) -> Option<u32> {
        let addr = SocketAddr::from(([127, 0, 0, 1], self.port));
        let stream = TcpStream::connect_timeout(&addr, Duration::from_secs(2)).ok()?;
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .ok()?;

        let mut line = String::new();
        BufReader::new(stream).read_line(&mut line).ok()?;
        line.trim().strip_prefix("pid:")?.parse().ok()
    }

    fn pid(&self) -> u32 {
        let deadline = Instant::now() + OBSERVE_DEADLINE;
        while Instant::now() < deadline {
            if let Some(pid) = self.try_pid() {
                return pid;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        panic!("no worker answered on port {}", self.port);
    }

    /// Connect and ask the serving worker to close its server voluntarily.
    fn close_one(&self) -> u32 {
        let addr = SocketAddr::from(([127, 0, 0, 1], self.port));
        let stream = TcpStream::connect_timeout(&addr, Duration::from_secs(2)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let pid = line.trim().strip_prefix("pid:").unwrap().parse().unwrap();

        reader.get_mut().write_all(b"close\n").unwrap();
        pid
    }

    /// Keep connecting until a worker outside `known` answers.
    fn await_new_pid(&self, known: &HashSet<u32>) -> u32 {
        let deadline = Instant::now() + OBSERVE_DEADLINE;
        while Instant::now() < deadline {
            if let Some(pid) = self.try_pid()
                && !known.contains(&pid)
            {
                return pid;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        panic!("no replacement worker appeared on port {}", self.port);
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        // SIGTERM lets the master terminate its workers on the way out.
        let _ = kill(Pid::from_raw(self.master.id() as i32), Signal::SIGTERM);

        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if matches!(self.master.try_wait(), Ok(Some(_))) {
                return;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        let _ = self.master.kill();
        let _ = self.master.wait();
    }
}

#[test]
fn round_robin_alternates_between_two_workers() {
    let cluster = Cluster::launch(2, false, false);

    let a = cluster.pid();
    let b = cluster.pid();
    let c = cluster.pid();

    assert_ne!(a, b, "sequential connections must hit different workers");
    assert_eq!(a, c, "third connection wraps back to the first worker");
}

#[test]
fn sticky_keeps_one_source_address_on_one_worker() {
    let cluster = Cluster::launch(3, false, true);

    let first = cluster.pid();
    for _ in 0..9 {
        assert_eq!(
            cluster.pid(),
            first,
            "every connection from one address must land on one worker"
        );
    }
}

#[test]
fn killed_worker_is_respawned() {
    let cluster = Cluster::launch(2, true, false);

    let mut initial = HashSet::new();
    for _ in 0..4 {
        initial.insert(cluster.pid());
    }
    assert_eq!(initial.len(), 2);

    let victim = *initial.iter().next().unwrap();
    kill(Pid::from_raw(victim as i32), Signal::SIGKILL).unwrap();

    let replacement = cluster.await_new_pid(&initial);
    assert!(!initial.contains(&replacement));

    // Pool size is preserved: the survivor still serves too.
    let mut after = HashSet::new();
    for _ in 0..6 {
        after.insert(cluster.pid());
    }
    assert!(after.len() >= 2, "expected two live workers, saw {after:?}");
}

#[test]
fn voluntarily_closed_worker_is_respawned() {
    let cluster = Cluster::launch(2, true, false);

    let mut initial = HashSet::new();
    for _ in 0..4 {
        initial.insert(cluster.pid());
    }
    assert_eq!(initial.len(), 2);

    cluster.close_one();

    let replacement = cluster.await_new_pid(&initial);
    assert!(!initial.contains(&replacement));
}

#[test]
fn no_respawn_shrinks_the_pool() {
    let cluster = Cluster::launch(2, false, false);

    let mut initial = HashSet::new();
    for _ in 0..4 {
        initial.insert(cluster.pid());
    }
    assert_eq!(initial.len(), 2);

    let victim = *initial.iter().next().unwrap();
    kill(Pid::from_raw(victim as i32), Signal::SIGKILL).unwrap();

    // The survivor keeps serving and no new pid ever shows up.
    let survivor: HashSet<u32> = initial.iter().copied().filter(|p| *p != victim).collect();
    let deadline = Instant::now() + Duration::from_secs(3);
    let mut seen = HashSet::new();
    while Instant::now() < deadline {
        if let Some(pid) = cluster.try_pid() {
            seen.insert(pid);
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(seen, survivor);
}
