//! Gateway-wide configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::audit::AuditConfig;
use crate::error::{GatewayError, Result};
use crate::filter::FilterConfig;
use crate::limiter::RateLimitConfig;
use crate::sandbox::SandboxConfig;

/// Everything needed to construct a [`Gateway`](crate::Gateway).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Root of the sandboxed module tree.
    pub module_root: PathBuf,
    /// Maximum number of compiled modules kept in the cache.
    pub cache_capacity: usize,
    /// Largest file the discovery `read` call will return.
    pub max_read_bytes: u64,
    pub sandbox: SandboxConfig,
    pub rate_limit: RateLimitConfig,
    pub filter: FilterConfig,
    pub audit: AuditConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            module_root: PathBuf::from("modules"),
            cache_capacity: 64,
            max_read_bytes: 1024 * 1024,
            sandbox: SandboxConfig::default(),
            rate_limit: RateLimitConfig::default(),
            filter: FilterConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// A default configuration rooted at `module_root`.
    pub fn new(module_root: impl Into<PathBuf>) -> Self {
        Self {
            module_root: module_root.into(),
            ..Self::default()
        }
    }

    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| GatewayError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the gateway unusable.
    pub fn validate(&self) -> Result<()> {
        if self.cache_capacity == 0 {
            return Err(GatewayError::Config("cache_capacity must be at least 1".into()));
        }
        if self.sandbox.timeout.is_zero() {
            return Err(GatewayError::Config("sandbox.timeout_ms must be positive".into()));
        }
        if self.sandbox.epoch_tick_interval.is_zero() {
            return Err(GatewayError::Config(
                "sandbox.epoch_tick_interval_ms must be positive".into(),
            ));
        }
        if self.rate_limit.max_requests == 0 || self.rate_limit.window.is_zero() {
            return Err(GatewayError::Config(
                "rate_limit needs a positive max_requests and window_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Serde adapter storing a [`Duration`](std::time::Duration) as integer
/// milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
