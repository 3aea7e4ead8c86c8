//! Per-identity rate limiting.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{GatewayError, Result};

/// Identities tracked before expired windows are swept.
const SWEEP_THRESHOLD: usize = 1024;

/// How the window moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowPolicy {
    /// Counter resets when `window` has elapsed since the first request.
    #[default]
    Fixed,
    /// At most `max_requests` in any interval of length `window`.
    Sliding,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    #[serde(with = "crate::config::duration_ms", rename = "window_ms")]
    pub window: Duration,
    pub policy: WindowPolicy,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window: Duration::from_secs(60),
            policy: WindowPolicy::Fixed,
        }
    }
}

#[derive(Debug)]
enum Window {
    Fixed { start: Instant, count: u32 },
    Sliding(VecDeque<Instant>),
}

impl Window {
    fn expired(&self, now: Instant, window: Duration) -> bool {
        match self {
            Window::Fixed { start, .. } => now.duration_since(*start) >= window,
            Window::Sliding(hits) => hits
                .back()
                .map_or(true, |last| now.duration_since(*last) >= window),
        }
    }
}

/// Throttles executions per caller identity.
///
/// Checks are a short critical section on one mutex and never wait on a
/// running execution.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count one request against `identity`, or reject it.
    ///
    /// A rejected request does not consume budget.
    pub fn check_and_increment(&self, identity: &str) -> Result<()> {
        let now = Instant::now();
        let limit = self.config.max_requests;
        let window = self.config.window;
        let mut windows = self.windows.lock();

        if windows.len() >= SWEEP_THRESHOLD {
            windows.retain(|_, w| !w.expired(now, window));
        }

        let state = windows.entry(identity.to_string()).or_insert_with(|| match self.config.policy {
            WindowPolicy::Fixed => Window::Fixed { start: now, count: 0 },
            WindowPolicy::Sliding => Window::Sliding(VecDeque::new()),
        });

        let allowed = match state {
            Window::Fixed { start, count } => {
                if now.duration_since(*start) >= window {
                    *start = now;
                    *count = 0;
                }
                if *count < limit {
                    *count += 1;
                    true
                } else {
                    false
                }
            }
            Window::Sliding(hits) => {
                while hits.front().is_some_and(|t| now.duration_since(*t) >= window) {
                    hits.pop_front();
                }
                if (hits.len() as u32) < limit {
                    hits.push_back(now);
                    true
                } else {
                    false
                }
            }
        };

        if allowed {
            Ok(())
        } else {
            tracing::warn!(identity, limit, ?window, "rate limit exceeded");
            Err(GatewayError::RateLimitExceeded { limit, window })
        }
    }

    /// Requests `identity` may still make in its current window.
    pub fn remaining(&self, identity: &str) -> u32 {
        let now = Instant::now();
        let window = self.config.window;
        let windows = self.windows.lock();
        let used = match windows.get(identity) {
            None => 0,
            Some(Window::Fixed { start, count }) => {
                if now.duration_since(*start) >= window {
                    0
                } else {
                    *count
                }
            }
            Some(Window::Sliding(hits)) => hits
                .iter()
                .filter(|t| now.duration_since(**t) < window)
                .count() as u32,
        };
        self.config.max_requests.saturating_sub(used)
    }

    /// Forget all state for `identity`.
    pub fn reset(&self, identity: &str) {
        self.windows.lock().remove(identity);
    }
}
