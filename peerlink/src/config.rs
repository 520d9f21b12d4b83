//! Configuration types and defaults

use std::time::Duration;

/// Session manager configuration
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Peer ID this manager signs outbound envelopes with
    pub local_peer: String,
    /// Sessions idle longer than this are closed by a sweep
    pub inactivity_timeout: Duration,
    /// Attempts per outbound signaling message before the session is
    /// closed with a transport failure
    pub max_send_retries: u32,
    /// Base delay for exponential backoff between send retries
    pub retry_backoff: Duration,
    /// Interval between periodic timeout sweeps
    pub sweep_interval: Duration,
}

impl ManagerConfig {
    /// Defaults with the given local peer ID
    pub fn new(local_peer: impl Into<String>) -> Self {
        Self {
            local_peer: local_peer.into(),
            inactivity_timeout: Duration::from_secs(60),
            max_send_retries: 3,
            retry_backoff: Duration::from_millis(100),
            sweep_interval: Duration::from_secs(10),
        }
    }

    /// Short timeouts for tests and local development
    pub fn fast(local_peer: impl Into<String>) -> Self {
        Self {
            inactivity_timeout: Duration::from_millis(500),
            retry_backoff: Duration::from_millis(5),
            sweep_interval: Duration::from_millis(100),
            ..Self::new(local_peer)
        }
    }
}
