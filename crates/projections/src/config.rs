use serde::{Deserialize, Serialize};

use crate::RetryPolicy;

/// Projector settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectorConfig {
    /// Number of worker shards; each aggregate always maps to the same shard.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Bound of each shard queue. Producers wait when it is full.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_workers() -> usize {
    8
}

fn default_queue_capacity() -> usize {
    1_024
}

impl Default for ProjectorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            retry: RetryPolicy::default(),
        }
    }
}

impl ProjectorConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}
