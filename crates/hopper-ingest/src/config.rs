//! Ingest API configuration.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// How long a dequeued segment may stay reserved before the driver
    /// fails it back into the queue.
    pub pending_timeout: Duration,
    /// How often the driver sweeps for expired reservations.
    pub clean_interval: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            pending_timeout: default_pending_timeout(),
            clean_interval: default_clean_interval(),
        }
    }
}

fn default_pending_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_clean_interval() -> Duration {
    Duration::from_secs(1)
}
