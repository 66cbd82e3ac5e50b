use std::time::Duration;

/// Timing knobs for the replica side. Establishment reads are bounded by
/// `init_limit` ticks and broadcast-phase silence by `sync_limit` ticks,
/// matching the bounds the coordinator applies on its end.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    pub tick_time: Duration,
    pub init_limit: u32,
    pub sync_limit: u32,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            tick_time: Duration::from_millis(2000),
            init_limit: 10,
            sync_limit: 5,
        }
    }
}

impl ReplicaConfig {
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

    /// Maximum time to wait for any single establishment packet.
    pub fn init_timeout(&self) -> Duration {
        self.tick_time * self.init_limit
    }

    /// Maximum coordinator silence tolerated during broadcast. The
    /// coordinator pings well inside this bound.
    pub fn sync_timeout(&self) -> Duration {
        self.tick_time * self.sync_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_timeout_scales_with_tick_time() {
        let config = ReplicaConfig::new()
            .with_tick_time(Duration::from_millis(50))
            .with_init_limit(3);
        assert_eq!(config.init_timeout(), Duration::from_millis(150));
    }

    #[test]
    fn sync_timeout_scales_with_tick_time() {
        let config = ReplicaConfig::new()
            .with_tick_time(Duration::from_millis(50))
            .with_sync_limit(4);
        assert_eq!(config.sync_timeout(), Duration::from_millis(200));
    }
}
