//! Configuration for the sync loops.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Wait between cycles when none is configured.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(4);

/// Default size of the buffer used to move bytes within a cycle.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Login for the remote endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// User name.
    pub user: String,
    /// Password.
    pub password: String,
}

impl Credentials {
    /// Creates credentials.
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Where and how to reach the remote endpoint.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Endpoint address (`host:port`).
    pub address: String,
    /// Login, if the endpoint requires one.
    pub credentials: Option<Credentials>,
    /// Deadline for establishing the connection.
    pub connect_timeout: Duration,
    /// Deadline for each blocking read or write; `None` waits forever.
    pub io_timeout: Option<Duration>,
}

impl RemoteConfig {
    /// Creates a remote configuration.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            credentials: None,
            connect_timeout: Duration::from_secs(10),
            io_timeout: Some(Duration::from_secs(30)),
        }
    }

    /// Sets the login.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Sets the connect deadline.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the per-operation deadline.
    pub fn with_io_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.io_timeout = timeout;
        self
    }
}

/// Where the producer holds a delta between EXTRACT and TRANSFER.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Staging {
    /// A heap buffer. Fine for log-sized deltas.
    #[default]
    Memory,
    /// An anonymous temporary file, deleted when the cycle ends.
    TempFile {
        /// Directory for the file; the system temp dir when `None`.
        dir: Option<PathBuf>,
    },
}

/// Configuration for the upload side.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Path of the file on the remote endpoint.
    pub remote_path: String,
    /// Delta staging area.
    pub staging: Staging,
    /// Read size used while extracting.
    pub chunk_size: usize,
}

impl ProducerConfig {
    /// Creates a producer configuration.
    pub fn new(remote_path: impl Into<String>) -> Self {
        Self {
            remote_path: remote_path.into(),
            staging: Staging::Memory,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Sets the staging area.
    pub fn with_staging(mut self, staging: Staging) -> Self {
        self.staging = staging;
        self
    }

    /// Sets the extraction chunk size.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }
}

/// Configuration for the download side.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Path of the file on the remote endpoint.
    pub remote_path: String,
    /// Ask the endpoint to start the stream at the watermark instead of
    /// discarding the prefix client-side.
    pub range_reads: bool,
    /// On startup, cut the destination back to the watermark if an
    /// uncommitted append left extra bytes behind.
    pub truncate_on_resume: bool,
    /// Buffer size used while appending.
    pub chunk_size: usize,
}

impl ConsumerConfig {
    /// Creates a consumer configuration.
    pub fn new(remote_path: impl Into<String>) -> Self {
        Self {
            remote_path: remote_path.into(),
            range_reads: true,
            truncate_on_resume: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Enables or disables endpoint-side range reads.
    pub fn with_range_reads(mut self, enabled: bool) -> Self {
        self.range_reads = enabled;
        self
    }

    /// Enables or disables truncation of uncommitted bytes on resume.
    pub fn with_truncate_on_resume(mut self, enabled: bool) -> Self {
        self.truncate_on_resume = enabled;
        self
    }

    /// Sets the append buffer size.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }
}

/// Configuration for restarting a failed loop.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, counting the first run.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries: the first error is fatal.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.add_jitter = enabled;
        self
    }

    /// Calculates the delay before a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // up to 25%
            let jitter = delay_secs * 0.25 * clock_jitter();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::no_retry()
    }
}

/// Pseudo-random fraction in `[0, 1)` taken from the clock.
fn clock_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn producer_config_builder() {
        let config = ProducerConfig::new("/shared/file1.txt")
            .with_staging(Staging::TempFile { dir: None })
            .with_chunk_size(0);

        assert_eq!(config.remote_path, "/shared/file1.txt");
        assert_eq!(config.staging, Staging::TempFile { dir: None });
        assert_eq!(config.chunk_size, 1);
    }

    #[test]
    fn consumer_config_defaults() {
        let config = ConsumerConfig::new("/shared/file1.txt");
        assert!(config.range_reads);
        assert!(!config.truncate_on_resume);
    }

    #[test]
    fn credentials_debug_redacts_password() {
        let creds = Credentials::new("ftpuser", "hunter2");
        let debug = format!("{creds:?}");
        assert!(debug.contains("ftpuser"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn default_retry_is_fatal() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 1);
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);

        let delay1 = config.delay_for_attempt(1);
        assert!(delay1 >= Duration::from_millis(100));
        assert!(delay1 <= Duration::from_millis(125));

        let delay2 = config.delay_for_attempt(2);
        assert!(delay2 >= Duration::from_millis(200));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0)
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(5));
    }
}
