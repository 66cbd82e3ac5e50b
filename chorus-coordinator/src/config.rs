use std::time::Duration;

/// Timing knobs for the coordinator side of the protocol.
///
/// The establishment barriers (epoch proposal, epoch acknowledgement, and the
/// new-leader acknowledgement) are each bounded by `init_limit` ticks; a
/// replica that falls `sync_limit` ticks behind during broadcast is dropped.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    pub tick_time: Duration,
    pub init_limit: u32,
    pub sync_limit: u32,
    pub ping_interval: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            tick_time: Duration::from_millis(2000),
            init_limit: 10,
            sync_limit: 5,
            ping_interval: Duration::from_millis(1000),
        }
    }
}

impl ProtocolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tick_time(mut self, tick_time: Duration) -> Self {
        self.tick_time = tick_time;
        self
    }

    pub fn with_init_limit(mut self, init_limit: u32) -> Self {
        self.init_limit = init_limit;
        self
    }

    pub fn with_sync_limit(mut self, sync_limit: u32) -> Self {
        self.sync_limit = sync_limit;
        self
    }

    pub fn with_ping_interval(mut self, ping_interval: Duration) -> Self {
        self.ping_interval = ping_interval;
        self
    }

    /// Maximum time a replica may take to complete establishment.
    pub fn init_timeout(&self) -> Duration {
        self.tick_time * self.init_limit
    }

    /// Maximum time a replica may go silent during broadcast.
    pub fn sync_timeout(&self) -> Duration {
        self.tick_time * self.sync_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_scale_with_tick_time() {
        let config = ProtocolConfig::new()
            .with_tick_time(Duration::from_millis(100))
            .with_init_limit(4)
            .with_sync_limit(2);
        assert_eq!(config.init_timeout(), Duration::from_millis(400));
        assert_eq!(config.sync_timeout(), Duration::from_millis(200));
    }
}
