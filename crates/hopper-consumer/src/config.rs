//! Consumer tunables.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Flush the active batch once it grows past this many bytes.
    pub segment_target_size: u64,
    /// Flush the active batch once its first record is this old.
    pub segment_target_age: Duration,
    /// Number of distinct stores that must acknowledge a replicate.
    pub replication_factor: usize,
    /// Give up on a batch after `multiplier × |ingesters|` consecutive
    /// gather errors.
    pub gather_error_multiplier: usize,
    /// Pause before retrying when the cluster can't make progress.
    pub wait_time: Duration,
    /// Cadence of the state machine.
    pub step_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            segment_target_size: default_segment_target_size(),
            segment_target_age: default_segment_target_age(),
            replication_factor: default_replication_factor(),
            gather_error_multiplier: default_gather_error_multiplier(),
            wait_time: default_wait_time(),
            step_interval: default_step_interval(),
        }
    }
}

fn default_segment_target_size() -> u64 {
    16 * 1024 * 1024
}

fn default_segment_target_age() -> Duration {
    Duration::from_secs(30)
}

fn default_replication_factor() -> usize {
    2
}

fn default_gather_error_multiplier() -> usize {
    2
}

fn default_wait_time() -> Duration {
    Duration::from_secs(1)
}

fn default_step_interval() -> Duration {
    Duration::from_millis(100)
}
