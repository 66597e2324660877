//! Connection configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables shared by server-accepted and client-dialed connections.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnConfig {
    /// Deadline for a single transport read. `None` means wait forever.
    pub read_timeout: Option<Duration>,
    /// Deadline for a single transport write. `None` means wait forever.
    pub write_timeout: Option<Duration>,
    /// Default `ask` timeout, used when a caller does not pass its own.
    pub ask_timeout: Duration,
    /// Capacity of the per-connection outbound frame queue.
    pub send_queue: usize,
    /// Lifetime broadcast-drop budget before a slow peer is closed.
    pub max_drops: u64,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            read_timeout: None,
            write_timeout: Some(Duration::from_secs(60)),
            ask_timeout: Duration::from_secs(30),
            send_queue: 64,
            max_drops: 100,
        }
    }
}
