use std::time::Duration;

/// Runtime configuration.
#[derive(Clone)]
pub struct Config {
    /// Reactor threads per worker process. 0 = number of CPUs.
    pub threads: usize,
    /// Worker processes. 0 = run everything in the calling process
    /// (no fork, no cluster pipes).
    pub workers: usize,
    /// Connection-slot capacity (one slot per kernel fd). Clamped against
    /// RLIMIT_NOFILE at startup.
    pub capacity: u32,
    /// TCP listen backlog.
    pub backlog: i32,
    /// Enable TCP_NODELAY on accepted and outbound connections.
    pub tcp_nodelay: bool,
    /// Grace budget for draining pending writes at shutdown.
    pub shutdown_grace: Duration,
    /// Maximum cluster frame payload before continuation splitting.
    /// Must be at least 1 MiB.
    pub cluster_max_payload: usize,
    /// Default inactivity timeout in seconds applied to accepted
    /// connections. 0 = none until the protocol sets one.
    pub default_timeout: u8,
    /// Emit state transition lines through the `log` facade.
    pub state_log: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            threads: 0,
            workers: 0,
            capacity: 131_072,
            backlog: 1024,
            tcp_nodelay: true,
            shutdown_grace: Duration::from_secs(8),
            cluster_max_payload: 1 << 20,
            default_timeout: 0,
            state_log: true,
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error message for the
    /// first value out of range.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        if self.capacity == 0 || self.capacity > (1 << 24) {
            return Err(crate::error::Error::Config(
                "capacity must be > 0 and <= 2^24".into(),
            ));
        }
        if self.backlog <= 0 {
            return Err(crate::error::Error::Config("backlog must be > 0".into()));
        }
        if self.cluster_max_payload < (1 << 20) {
            return Err(crate::error::Error::Config(
                "cluster_max_payload must be at least 1 MiB".into(),
            ));
        }
        if self.shutdown_grace > Duration::from_secs(255) {
            return Err(crate::error::Error::Config(
                "shutdown_grace must be <= 255s".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`Config`] with discoverable methods and `build()` validation.
///
/// # Example
///
/// ```rust
/// use evline::ConfigBuilder;
///
/// let config = ConfigBuilder::new()
///     .threads(2)
///     .workers(0)
///     .capacity(4096)
///     .build()
///     .expect("invalid config");
/// ```
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default config values.
    pub fn new() -> Self {
        Self::default()
    }

    // ── Concurrency ──────────────────────────────────────────────────

    /// Reactor threads per worker. 0 = number of CPUs.
    pub fn threads(mut self, n: usize) -> Self {
        self.config.threads = n;
        self
    }

    /// Worker processes. 0 = single-process mode.
    pub fn workers(mut self, n: usize) -> Self {
        self.config.workers = n;
        self
    }

    // ── Connections ──────────────────────────────────────────────────

    /// Connection-slot capacity.
    pub fn capacity(mut self, n: u32) -> Self {
        self.config.capacity = n;
        self
    }

    /// TCP listen backlog.
    pub fn backlog(mut self, n: i32) -> Self {
        self.config.backlog = n;
        self
    }

    /// Enable or disable TCP_NODELAY.
    pub fn tcp_nodelay(mut self, enable: bool) -> Self {
        self.config.tcp_nodelay = enable;
        self
    }

    /// Default inactivity timeout (seconds) for accepted connections.
    pub fn default_timeout(mut self, secs: u8) -> Self {
        self.config.default_timeout = secs;
        self
    }

    // ── Shutdown & cluster ───────────────────────────────────────────

    /// Grace budget for the shutdown drain.
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace = grace;
        self
    }

    /// Maximum cluster frame payload before splitting.
    pub fn cluster_max_payload(mut self, bytes: usize) -> Self {
        self.config.cluster_max_payload = bytes;
        self
    }

    /// Emit state transition lines through the `log` facade.
    pub fn state_log(mut self, enable: bool) -> Self {
        self.config.state_log = enable;
        self
    }

    // ── Terminal ─────────────────────────────────────────────────────

    /// Validate and build the final [`Config`].
    pub fn build(self) -> Result<Config, crate::error::Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_capacity() {
        let err = ConfigBuilder::new().capacity(0).build();
        assert!(err.is_err());
    }

    #[test]
    fn rejects_small_cluster_payload() {
        let err = ConfigBuilder::new().cluster_max_payload(1024).build();
        assert!(err.is_err());
    }

    #[test]
    fn builder_sets_fields() {
        let config = ConfigBuilder::new()
            .threads(3)
            .workers(2)
            .capacity(256)
            .tcp_nodelay(false)
            .build()
            .unwrap();
        assert_eq!(config.threads, 3);
        assert_eq!(config.workers, 2);
        assert_eq!(config.capacity, 256);
        assert!(!config.tcp_nodelay);
    }
}
