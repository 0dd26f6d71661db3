//! Per transaction settings.

use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_REDIRECTS: usize = 10;
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// `micro-http-client/<crate version>`
pub const DEFAULT_USER_AGENT: &str = concat!("micro-http-client/", env!("CARGO_PKG_VERSION"));

/// Knobs a transaction reads when it starts and on every step.
///
/// `timeout` bounds each pending native step, not the transaction as a whole: the
/// timer is armed when a step goes pending and cleared when it completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub follow_redirects: bool,
    pub max_redirects: usize,
    /// Largest request body chunk handed to the backend at once.
    pub buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            follow_redirects: true,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_user_agent<S: Into<String>>(mut self, user_agent: S) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    #[must_use]
    pub fn with_follow_redirects(mut self, follow_redirects: bool) -> Self {
        self.follow_redirects = follow_redirects;
        self
    }

    #[must_use]
    pub fn with_max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// The timeout in (fractional) seconds.
    pub fn timeout_sec(&self) -> f64 {
        self.timeout.as_secs_f64()
    }

    /// Sets the timeout from seconds; negative, NaN or overflowing values are ignored.
    ///
    /// Returns whether the value was accepted.
    pub fn set_timeout_sec(&mut self, secs: f64) -> bool {
        match Duration::try_from_secs_f64(secs) {
            Ok(timeout) => {
                self.timeout = timeout;
                true
            }
            Err(_) => false,
        }
    }
}
