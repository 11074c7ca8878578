//! Server configuration.
//!
//! Endpoints come from the environment (`PUB_ENDPOINT`, `SUB_ENDPOINT`);
//! worker count from `WORKER_THREADS`. Everything else is compiled-in
//! defaults validated the same way as the component configs.

use std::env;
use std::time::Duration;

use crate::stdx::object_pool::PoolConfig;
use crate::workers::default_workers;

/// Publish-side default: bind and serve responses to anyone subscribed.
pub const DEFAULT_PUB_ENDPOINT: &str = "tcp://*:5556";
/// Command-side default.
pub const DEFAULT_SUB_ENDPOINT: &str = "tcp://localhost:5555";

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Response egress endpoint (PUB, bound).
    pub pub_endpoint: String,
    /// Command ingress endpoint (SUB, bound, no topic filter).
    pub sub_endpoint: String,
    /// Worker thread count.
    pub workers: usize,
    /// Worker input FIFO capacity.
    pub queue_cap: usize,
    /// Emit a latency log frame per method invocation.
    pub benchmark: bool,
    /// Task record pool sizing.
    pub task_pool: PoolConfig,
    /// Outbound frame pool sizing.
    pub frame_pool: PoolConfig,
    /// Scavenger period for both pools; `None` disables scavenging.
    pub scavenge_interval: Option<Duration>,
}

impl ServerConfig {
    /// Defaults overridden by `PUB_ENDPOINT`, `SUB_ENDPOINT`, and
    /// `WORKER_THREADS`. Invalid values are reported and ignored.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(endpoint) = env::var("PUB_ENDPOINT") {
            if !endpoint.is_empty() {
                cfg.pub_endpoint = endpoint;
            }
        }
        if let Ok(endpoint) = env::var("SUB_ENDPOINT") {
            if !endpoint.is_empty() {
                cfg.sub_endpoint = endpoint;
            }
        }
        if let Ok(raw) = env::var("WORKER_THREADS") {
            match raw.parse::<usize>() {
                Ok(n) if n > 0 => cfg.workers = n,
                _ => eprintln!("ignoring invalid WORKER_THREADS={raw}"),
            }
        }
        cfg
    }

    /// Validate configuration. Panics on invalid values.
    pub fn validate(&self) {
        assert!(!self.pub_endpoint.is_empty(), "pub_endpoint must be set");
        assert!(!self.sub_endpoint.is_empty(), "sub_endpoint must be set");
        assert!(self.workers > 0, "workers must be > 0");
        assert!(self.queue_cap > 0, "queue_cap must be > 0");
        self.task_pool.validate();
        self.frame_pool.validate();
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            pub_endpoint: DEFAULT_PUB_ENDPOINT.to_owned(),
            sub_endpoint: DEFAULT_SUB_ENDPOINT.to_owned(),
            workers: default_workers(),
            queue_cap: 1024,
            benchmark: false,
            task_pool: PoolConfig {
                prealloc: 1024,
                max_thread_cache: 32,
                dynamic_expansion: true,
                max_total_objects: 8192,
            },
            frame_pool: PoolConfig {
                prealloc: 1024,
                max_thread_cache: 32,
                dynamic_expansion: true,
                max_total_objects: 8192,
            },
            scavenge_interval: Some(Duration::from_secs(1)),
        }
    }
}
