//! Rate limiting for repeated log lines
//!
//! Candidate apply failures, broadcast send failures and statistics polling
//! errors tend to repeat once per tick or per peer. The throttler keeps one
//! timestamp per key and lets a line through at most once per interval.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Log throttler keyed by message kind
///
/// Keys carry the peer id where the failure is per peer (`"send:w1"`,
/// `"candidate:w1"`), so one noisy peer does not silence another.
///
/// # Example
///
/// ```rust
/// use rendezvous::utils::LogThrottler;
/// use std::time::Duration;
///
/// let throttler = LogThrottler::new(Duration::from_secs(5));
///
/// assert!(throttler.should_log("send:w1"));
/// // Within the interval the same key is held back
/// assert!(!throttler.should_log("send:w1"));
/// // Other keys are independent
/// assert!(throttler.should_log("send:w2"));
/// ```
pub struct LogThrottler {
    /// Last time a line went out, per key
    last_logged: RwLock<HashMap<String, Instant>>,
    interval: Duration,
}

impl LogThrottler {
    /// Create a throttler
    ///
    /// # Arguments
    ///
    /// * `interval` - Minimum time between two lines with the same key
    pub fn new(interval: Duration) -> Self {
        Self {
            last_logged: RwLock::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Returns `true` if a line for `key` may be logged now
    ///
    /// Records the time when it returns `true`.
    ///
    /// # Arguments
    ///
    /// * `key` - Message kind, usually prefixed with what failed
    pub fn should_log(&self, key: &str) -> bool {
        let now = Instant::now();

        {
            let map = self.last_logged.read();
            if let Some(last) = map.get(key) {
                if now.duration_since(*last) < self.interval {
                    return false;
                }
            }
        }

        let mut map = self.last_logged.write();
        if let Some(last) = map.get(key) {
            if now.duration_since(*last) < self.interval {
                return false;
            }
        }
        map.insert(key.to_string(), now);
        true
    }

    /// Forget a key, e.g. when a peer is torn down
    pub fn clear(&self, key: &str) {
        self.last_logged.write().remove(key);
    }

    /// Forget every key with the given prefix
    ///
    /// # Arguments
    ///
    /// * `prefix` - Key prefix, e.g. `"send:w1"` once peer `w1` is gone
    pub fn clear_prefix(&self, prefix: &str) {
        self.last_logged.write().retain(|k, _| !k.starts_with(prefix));
    }

    pub fn clear_all(&self) {
        self.last_logged.write().clear();
    }

    pub fn len(&self) -> usize {
        self.last_logged.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_logged.read().is_empty()
    }
}

impl Default for LogThrottler {
    /// 5 second interval
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Throttled `tracing::warn!`
///
/// ```rust
/// use rendezvous::utils::LogThrottler;
/// use rendezvous::warn_throttled;
///
/// let throttler = LogThrottler::default();
/// warn_throttled!(throttler, "send:peer-1", "Send to {} failed", "peer-1");
/// ```
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::warn!($($arg)*);
        }
    };
}

/// Throttled `tracing::debug!`
#[macro_export]
macro_rules! debug_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::debug!($($arg)*);
        }
    };
}
