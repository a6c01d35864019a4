//! Routing decision over the ordered worker list.
//!
//! Two policies, selected once at startup from the transport's declared
//! connection style:
//!
//! - **Round-robin** for short-lived connections: strict FIFO rotation of the
//!   worker list.
//! - **Sticky** for long-lived connections: `hash(remote addr) mod len`, so a
//!   given client address always maps to the same worker while the list
//!   length is unchanged.
//!
//! The balancer itself is stateless apart from the hash seed; rotation state
//! is the order of the list it is handed.

use std::collections::VecDeque;

use crate::hash::hash;

/// Substituted when the listener reports no remote address.
const FALLBACK_ADDR: &str = "127.0.0.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    RoundRobin,
    Sticky,
}

impl Policy {
    /// Permanent (session-bearing) connections pin to a worker; everything
    /// else rotates.
    pub fn for_transport(is_permanent_connection: bool) -> Self {
        if is_permanent_connection {
            Policy::Sticky
        } else {
            Policy::RoundRobin
        }
    }
}

pub struct Balancer {
    seed: u32,
    policy: Policy,
}

impl Balancer {
    pub fn new(seed: u32, policy: Policy) -> Self {
        Self { seed, policy }
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Pick the worker for a connection from `remote_addr`, returning its
    /// index into `workers`.
    ///
    /// Round-robin rotates the list (head moves to the tail and is selected);
    /// sticky leaves the order untouched. An empty list yields `None`.
    pub fn select<T>(&self, workers: &mut VecDeque<T>, remote_addr: &str) -> Option<usize> {
        if workers.is_empty() {
            return None;
        }

        match self.policy {
            Policy::RoundRobin => {
                let head = workers.pop_front()?;
                workers.push_back(head);
                Some(workers.len() - 1)
            }
            Policy::Sticky => {
                let addr = if remote_addr.is_empty() {
                    FALLBACK_ADDR
                } else {
                    remote_addr
                };
                Some(hash(self.seed, addr.as_bytes()) as usize % workers.len())
            }
        }
    }
}
