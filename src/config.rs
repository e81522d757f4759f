//! Environment-driven configuration, in the shape of `fuser`'s
//! `SessionConfig` builder.

use std::env;
use std::io;
use std::time::Duration;

const ENV_NO_CACHE_RESTORE: &str = "EOS_FUSE_NO_CACHE_RESTORE";
const ENV_LAZY_LAG_OPEN: &str = "EOS_FUSE_LAZY_LAG_OPEN";
const ENV_LAZY_LAG_CLOSE: &str = "EOS_FUSE_LAZY_LAG_CLOSE";
const ENV_OPEN_MAX_RETRIES: &str = "EOS_FUSE_OPEN_MAX_RETRIES";

const DEFAULT_OPEN_MAX_RETRIES: u64 = 100;

/// Tunables the layout wrapper reads from the environment, with
/// programmatic overrides for tests and embedders.
#[derive(Clone, Debug)]
pub struct WrapperConfig {
    no_cache_restore: bool,
    lazy_lag_open: Option<Duration>,
    lazy_lag_close: Option<Duration>,
    open_max_retries: u64,
}

impl Default for WrapperConfig {
    fn default() -> Self {
        WrapperConfig {
            no_cache_restore: false,
            lazy_lag_open: None,
            lazy_lag_close: None,
            open_max_retries: DEFAULT_OPEN_MAX_RETRIES,
        }
    }
}

fn parse_millis(raw: &str) -> Option<Duration> {
    raw.parse::<u64>().ok().map(Duration::from_millis)
}

impl WrapperConfig {
    /// Build a config from the four recognized environment variables.
    /// Unset or unparsable values fall back to their defaults; this never
    /// fails.
    pub fn from_env() -> Self {
        let no_cache_restore = env::var(ENV_NO_CACHE_RESTORE).is_ok();
        let lazy_lag_open = env::var(ENV_LAZY_LAG_OPEN)
            .ok()
            .and_then(|v| parse_millis(&v));
        let lazy_lag_close = env::var(ENV_LAZY_LAG_CLOSE)
            .ok()
            .and_then(|v| parse_millis(&v));
        let open_max_retries = env::var(ENV_OPEN_MAX_RETRIES)
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_OPEN_MAX_RETRIES);

        WrapperConfig {
            no_cache_restore,
            lazy_lag_open,
            lazy_lag_close,
            open_max_retries,
        }
    }

    /// Disable (or re-enable) Restore regardless of environment.
    pub fn no_cache_restore(mut self, value: bool) -> Self {
        self.no_cache_restore = value;
        self
    }

    /// Set the test-hook sleep issued before the synchronous data-server
    /// open.
    pub fn lazy_lag_open(mut self, value: Option<Duration>) -> Self {
        self.lazy_lag_open = value;
        self
    }

    /// Set the test-hook sleep issued at the start of `close`.
    pub fn lazy_lag_close(mut self, value: Option<Duration>) -> Self {
        self.lazy_lag_close = value;
        self
    }

    /// Set the cap on stale-redirect retries during synchronous open.
    pub fn open_max_retries(mut self, value: u64) -> Self {
        self.open_max_retries = value;
        self
    }

    /// Whether Restore is disabled.
    pub fn is_restore_disabled(&self) -> bool {
        self.no_cache_restore
    }

    /// The configured open-lag sleep, if any.
    pub fn lazy_lag_open_duration(&self) -> Option<Duration> {
        self.lazy_lag_open
    }

    /// The configured close-lag sleep, if any.
    pub fn lazy_lag_close_duration(&self) -> Option<Duration> {
        self.lazy_lag_close
    }

    /// The configured stale-redirect retry cap.
    pub fn open_max_retries_count(&self) -> u64 {
        self.open_max_retries
    }

    /// Reject configurations that can never make progress.
    pub fn validate(&self) -> io::Result<()> {
        if self.open_max_retries == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "open_max_retries must be at least 1",
            ));
        }
        Ok(())
    }
}
