//! Cluster configuration.

use std::collections::HashMap;

/// Configuration for the worker pool, built once at startup and immutable
/// afterwards.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Number of worker children to keep alive.
    pub workers: usize,
    /// Replace a worker that exits or voluntarily closes.
    pub respawn: bool,
    /// Extra environment entries overlaid onto each child's inherited
    /// environment.
    pub env: HashMap<String, String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().max(1),
            respawn: true,
            env: HashMap::new(),
        }
    }
}

impl ClusterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_respawn(mut self, respawn: bool) -> Self {
        self.respawn = respawn;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }
}
