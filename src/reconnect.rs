//! Reconnect decisions.
//!
//! A [`ReconnectPolicy`] is asked after every failed attempt and after every session that ends.
//! When Retry-After handling is enabled the user's policy is wrapped in a [`RetryAfterPolicy`],
//! which answers 503 failures itself and hands everything else through.

use crate::{Close, Error};
use parking_lot::Mutex;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, info};

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// 503 answers retried per client before the wrapped policy takes over.
pub const RETRY_AFTER_THRESHOLD: u32 = 5;
/// Largest server-requested delay honoured, in seconds.
pub const RETRY_AFTER_MAX_DELAY: i64 = 300;

pub trait ReconnectPolicy: Send + Sync {
    /// Called when an open session ends. `close` is `None` when the connection dropped without
    /// a close frame.
    fn on_disconnect(&self, _close: Option<&Close>) -> bool {
        false
    }

    /// Called when an attempt fails before the session opened.
    fn on_connect_failure(&self, _error: &Error) -> bool {
        false
    }

    /// Wait before the next attempt. Zero reconnects immediately.
    fn delay(&self) -> Duration {
        DEFAULT_RECONNECT_DELAY
    }
}

/// Never reconnects.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverReconnect;

impl ReconnectPolicy for NeverReconnect {}

/// Reconnects up to `max_attempts` times with a fixed delay, on both failures and disconnects.
#[derive(Debug)]
pub struct FixedDelay {
    delay: Duration,
    max_attempts: Option<u32>,
    attempts: AtomicU32,
}

impl FixedDelay {
    pub fn new(delay: Duration, max_attempts: Option<u32>) -> Self {
        FixedDelay {
            delay,
            max_attempts,
            attempts: AtomicU32::new(0),
        }
    }

    fn next_attempt(&self) -> bool {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        self.max_attempts.map_or(true, |max| attempt < max)
    }
}

impl ReconnectPolicy for FixedDelay {
    fn on_disconnect(&self, _close: Option<&Close>) -> bool {
        self.next_attempt()
    }

    fn on_connect_failure(&self, _error: &Error) -> bool {
        self.next_attempt()
    }

    fn delay(&self) -> Duration {
        self.delay
    }
}

/// Honours `Retry-After` on 503 answers and defers every other decision to `inner`.
pub struct RetryAfterPolicy {
    inner: Option<Arc<dyn ReconnectPolicy>>,
    retries: AtomicU32,
    // Some when the last decision was a Retry-After retry
    retry_after: Mutex<Option<Duration>>,
}

impl fmt::Debug for RetryAfterPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryAfterPolicy")
            .field("inner", &self.inner.is_some())
            .field("retries", &self.retries.load(Ordering::SeqCst))
            .finish()
    }
}

impl RetryAfterPolicy {
    pub fn new(inner: Option<Arc<dyn ReconnectPolicy>>) -> Self {
        RetryAfterPolicy {
            inner,
            retries: AtomicU32::new(0),
            retry_after: Mutex::new(None),
        }
    }
}

impl ReconnectPolicy for RetryAfterPolicy {
    fn on_disconnect(&self, close: Option<&Close>) -> bool {
        *self.retry_after.lock() = None;
        self.inner
            .as_ref()
            .is_some_and(|inner| inner.on_disconnect(close))
    }

    fn on_connect_failure(&self, error: &Error) -> bool {
        if let Error::RetryAfter { delay: Some(delay) } = error.root() {
            let retry = self.retries.fetch_add(1, Ordering::SeqCst);
            if retry < RETRY_AFTER_THRESHOLD && *delay <= RETRY_AFTER_MAX_DELAY {
                let delay = Duration::from_secs((*delay).max(0) as u64);
                info!(?delay, retry = retry + 1, "retrying after 503");
                *self.retry_after.lock() = Some(delay);
                return true;
            }
            debug!(delay, retry, "not honouring Retry-After");
        }

        *self.retry_after.lock() = None;
        self.inner
            .as_ref()
            .is_some_and(|inner| inner.on_connect_failure(error))
    }

    fn delay(&self) -> Duration {
        if let Some(delay) = *self.retry_after.lock() {
            return delay;
        }
        self.inner
            .as_ref()
            .map_or(Duration::ZERO, |inner| inner.delay())
    }
}
