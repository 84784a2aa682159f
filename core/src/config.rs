use std::time::Duration;

/// How the channel manager places a newly accepted connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AllocPolicy {
    /// Pack onto the busiest channel, letting the others stay idle.
    #[default]
    PackHighest,
    /// Classic balancing: pick the channel with the fewest connections.
    SpreadLowest,
}

/// General config for the server-side transport.
#[derive(Clone)]
pub struct ServerConfig {
    /// Number of poller channels. 0 means `max(1, cpu_count / 2)`.
    pub num_channels: usize,
    /// Per-connection read buffer, in bytes.
    pub read_buf_size: usize,
    /// Per-connection write buffer, in bytes.
    pub write_buf_size: usize,
    /// Capacity of each channel's pending-add queue.
    pub pending_conn_cap: usize,
    /// Capacity of each connection's outbound stream queue.
    pub write_queue_cap: usize,
    /// Placement policy of the channel manager.
    pub alloc_policy: AllocPolicy,
    /// Wait for all connections to be closed, with a timeout.
    pub server_close_wait: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            num_channels: 0,
            read_buf_size: 16 * 1024,
            write_buf_size: 16 * 1024,
            pending_conn_cap: 4096,
            write_queue_cap: 16,
            alloc_policy: AllocPolicy::default(),
            server_close_wait: Duration::from_secs(90),
        }
    }
}

impl ServerConfig {
    /// Resolve `num_channels` against the machine.
    pub fn channel_count(&self) -> usize {
        if self.num_channels > 0 {
            return self.num_channels;
        }
        let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        (cpus / 2).max(1)
    }
}

/// General config for the client-side transport.
#[derive(Clone)]
pub struct ClientConfig {
    /// Read buffer of the blocking client connection, in bytes.
    pub read_buf_size: usize,
    /// Staging buffer for outbound writes, in bytes.
    pub write_buf_size: usize,
    /// Capacity of the outbound stream queue.
    pub write_queue_cap: usize,
    /// Minimum time between two connect attempts.
    pub reconnect_min: Duration,
    /// Hard cap on a pluggable handshake (websocket upgrade).
    pub handshake_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            read_buf_size: 16 * 1024,
            write_buf_size: 16 * 1024,
            write_queue_cap: 16,
            reconnect_min: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_count_default() {
        let config = ServerConfig::default();
        assert!(config.channel_count() >= 1);
        let fixed = ServerConfig { num_channels: 3, ..Default::default() };
        assert_eq!(fixed.channel_count(), 3);
    }
}
