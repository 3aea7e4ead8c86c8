//! Sandbox configuration with builder pattern.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Resource ceilings and capability settings for one sandboxed call.
///
/// Every ceiling is enforced independently. The defaults are starting
/// points, not policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Maximum wall-clock time before the call is aborted.
    #[serde(with = "crate::config::duration_ms", rename = "timeout_ms")]
    pub timeout: Duration,
    /// Extra time the async side waits past `timeout` before giving up on
    /// the blocking task.
    #[serde(with = "crate::config::duration_ms", rename = "grace_ms")]
    pub grace: Duration,
    /// Maximum linear memory in bytes.
    pub max_memory: u64,
    /// Maximum wasm stack in bytes.
    pub max_stack: usize,
    /// Maximum fuel (instruction count limit).
    pub max_fuel: Option<u64>,
    /// Maximum size of any single string or buffer crossing the boundary.
    pub max_string_bytes: usize,
    /// Maximum number of entries in any array or object crossing the boundary.
    pub max_collection_len: usize,
    /// Maximum number of concurrently open guest file handles.
    pub max_open_files: usize,
    /// Capacity of each captured stdout/stderr pipe.
    pub max_output_bytes: usize,
    /// Epoch interruption interval used by the watchdog.
    #[serde(with = "crate::config::duration_ms", rename = "epoch_tick_interval_ms")]
    pub epoch_tick_interval: Duration,
    /// Directory under which per-call scratch directories are created.
    pub scratch_root: PathBuf,
    /// Host environment variables passed through to the guest.
    pub env_allowlist: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            grace: Duration::from_millis(250),
            max_memory: 64 * 1024 * 1024, // 64MB
            max_stack: 512 * 1024,
            max_fuel: None,
            max_string_bytes: 1024 * 1024,
            max_collection_len: 10_000,
            max_open_files: 16,
            max_output_bytes: 64 * 1024,
            epoch_tick_interval: Duration::from_millis(10),
            scratch_root: std::env::temp_dir(),
            env_allowlist: Vec::new(),
        }
    }
}

impl SandboxConfig {
    /// Create a new builder for SandboxConfig.
    pub fn builder() -> SandboxConfigBuilder {
        SandboxConfigBuilder::default()
    }
}

/// Builder for creating SandboxConfig instances.
#[derive(Debug, Clone, Default)]
pub struct SandboxConfigBuilder {
    timeout: Option<Duration>,
    grace: Option<Duration>,
    max_memory: Option<u64>,
    max_stack: Option<usize>,
    max_fuel: Option<u64>,
    max_string_bytes: Option<usize>,
    max_collection_len: Option<usize>,
    max_open_files: Option<usize>,
    max_output_bytes: Option<usize>,
    epoch_tick_interval: Option<Duration>,
    scratch_root: Option<PathBuf>,
    env_allowlist: Vec<String>,
}

impl SandboxConfigBuilder {
    /// Set the maximum execution timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the grace period after the timeout.
    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = Some(grace);
        self
    }

    /// Set the maximum memory limit in bytes.
    pub fn max_memory(mut self, bytes: u64) -> Self {
        self.max_memory = Some(bytes);
        self
    }

    /// Set the maximum wasm stack size in bytes.
    pub fn max_stack(mut self, bytes: usize) -> Self {
        self.max_stack = Some(bytes);
        self
    }

    /// Set the maximum fuel (instruction count).
    pub fn max_fuel(mut self, fuel: u64) -> Self {
        self.max_fuel = Some(fuel);
        self
    }

    /// Set the maximum size of a single string or buffer.
    pub fn max_string_bytes(mut self, bytes: usize) -> Self {
        self.max_string_bytes = Some(bytes);
        self
    }

    /// Set the maximum array/object length.
    pub fn max_collection_len(mut self, len: usize) -> Self {
        self.max_collection_len = Some(len);
        self
    }

    /// Set the maximum number of open guest file handles.
    pub fn max_open_files(mut self, count: usize) -> Self {
        self.max_open_files = Some(count);
        self
    }

    /// Set the capacity of the captured stdout/stderr pipes.
    pub fn max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = Some(bytes);
        self
    }

    /// Set the epoch tick interval for timeout checking.
    pub fn epoch_tick_interval(mut self, interval: Duration) -> Self {
        self.epoch_tick_interval = Some(interval);
        self
    }

    /// Set the directory that holds per-call scratch directories.
    pub fn scratch_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(path.into());
        self
    }

    /// Allow a host environment variable through to the guest.
    pub fn allow_env(mut self, name: impl Into<String>) -> Self {
        self.env_allowlist.push(name.into());
        self
    }

    /// Build the SandboxConfig.
    pub fn build(self) -> SandboxConfig {
        let default = SandboxConfig::default();
        SandboxConfig {
            timeout: self.timeout.unwrap_or(default.timeout),
            grace: self.grace.unwrap_or(default.grace),
            max_memory: self.max_memory.unwrap_or(default.max_memory),
            max_stack: self.max_stack.unwrap_or(default.max_stack),
            max_fuel: self.max_fuel.or(default.max_fuel),
            max_string_bytes: self.max_string_bytes.unwrap_or(default.max_string_bytes),
            max_collection_len: self
                .max_collection_len
                .unwrap_or(default.max_collection_len),
            max_open_files: self.max_open_files.unwrap_or(default.max_open_files),
            max_output_bytes: self.max_output_bytes.unwrap_or(default.max_output_bytes),
            epoch_tick_interval: self
                .epoch_tick_interval
                .unwrap_or(default.epoch_tick_interval),
            scratch_root: self.scratch_root.unwrap_or(default.scratch_root),
            env_allowlist: self.env_allowlist,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SandboxConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.max_memory, 64 * 1024 * 1024);
        assert_eq!(config.max_open_files, 16);
        assert!(config.env_allowlist.is_empty());
    }

    #[test]
    fn test_builder() {
        let config = SandboxConfig::builder()
            .timeout(Duration::from_secs(5))
            .max_memory(32 * 1024 * 1024)
            .max_fuel(1_000_000)
            .max_collection_len(100)
            .allow_env("TZ")
            .build();

        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.max_memory, 32 * 1024 * 1024);
        assert_eq!(config.max_fuel, Some(1_000_000));
        assert_eq!(config.max_collection_len, 100);
        assert_eq!(config.env_allowlist, vec!["TZ".to_string()]);
        assert_eq!(config.max_string_bytes, 1024 * 1024);
    }

    #[test]
    fn test_deserialize_millis() {
        let config: SandboxConfig =
            serde_json::from_str(r#"{"timeout_ms": 1500, "max_open_files": 4}"#).unwrap();
        assert_eq!(config.timeout, Duration::from_millis(1500));
        assert_eq!(config.max_open_files, 4);
        assert_eq!(config.grace, Duration::from_millis(250));
    }
}
