//! Engine configuration

use crate::isolation::ProcessLimits;
use crate::language::Language;
use crate::{FuturideError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for an execution engine instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum accepted code length, in characters
    pub max_code_length: usize,

    /// Wall-clock limit for running a program
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Wall-clock limit for compiling a program
    #[serde(with = "humantime_serde")]
    pub compile_timeout: Duration,

    /// Maximum number of executions in flight at once
    pub max_concurrent: usize,

    /// Maximum captured bytes per stream
    pub max_output_bytes: usize,

    /// Directory under which per-execution workspaces are created
    pub workspace_root: PathBuf,

    /// Interpreters and compilers
    pub toolchain: Toolchain,

    /// Limits applied to program processes
    pub limits: ProcessLimits,

    /// Limits applied to the compiler
    pub compile_limits: ProcessLimits,

    /// V8 heap ceiling for JavaScript evaluation
    pub javascript_heap_bytes: usize,

    /// Per-client request throttling
    pub rate_limit: RateLimitConfig,

    /// Operator-supplied denylist additions
    pub denylist: DenylistConfig,

    /// Environment handed to child processes (everything else is cleared)
    pub env: Vec<(String, String)>,
}

/// Paths of the external toolchain
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Toolchain {
    /// Python interpreter
    pub python: PathBuf,

    /// C compiler
    pub cc: PathBuf,

    /// Flags passed to the C compiler ahead of the source file
    pub cflags: Vec<String>,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            python: PathBuf::from("python3"),
            cc: PathBuf::from("gcc"),
            cflags: [
                "-std=gnu11",
                "-O2",
                "-Wall",
                "-fstack-protector-strong",
                "-D_FORTIFY_SOURCE=2",
                "-fPIE",
                "-pie",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

/// Sliding-window rate limit settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Disable to let every request through
    pub enabled: bool,

    /// Requests allowed per client within one window
    pub max_requests: usize,

    /// Trailing window length
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 50,
            window: Duration::from_secs(3600),
        }
    }
}

/// Extra denylist patterns per language, added on top of the built-in rules
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DenylistConfig {
    pub extra: BTreeMap<Language, Vec<String>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_code_length: 50_000,
            timeout: Duration::from_secs(10),
            compile_timeout: Duration::from_secs(10),
            max_concurrent: 8,
            max_output_bytes: 1024 * 1024, // 1MB
            workspace_root: std::env::temp_dir().join("futuride"),
            toolchain: Toolchain::default(),
            limits: ProcessLimits::default(),
            compile_limits: ProcessLimits::compiler(),
            javascript_heap_bytes: 64 * 1024 * 1024, // 64MB
            rate_limit: RateLimitConfig::default(),
            denylist: DenylistConfig::default(),
            env: vec![
                ("PATH".into(), "/usr/local/bin:/usr/bin:/bin".into()),
                ("LANG".into(), "C.UTF-8".into()),
            ],
        }
    }
}

impl EngineConfig {
    /// Create a new config builder
    #[must_use]
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Defaults with a generous rate limit, for test suites
    #[must_use]
    pub fn for_testing() -> Self {
        let mut config = Self::default();
        config.rate_limit.max_requests = 1000;
        config
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_code_length == 0 {
            return Err(FuturideError::Config("max_code_length must be positive".into()));
        }
        if self.max_concurrent == 0 {
            return Err(FuturideError::Config("max_concurrent must be positive".into()));
        }
        if self.max_output_bytes == 0 {
            return Err(FuturideError::Config("max_output_bytes must be positive".into()));
        }
        if self.timeout.is_zero() || self.compile_timeout.is_zero() {
            return Err(FuturideError::Config("timeouts must be non-zero".into()));
        }
        if self.rate_limit.enabled && self.rate_limit.window.is_zero() {
            return Err(FuturideError::Config("rate limit window must be non-zero".into()));
        }
        Ok(())
    }
}

/// Get the default socket path
///
/// Returns:
/// - `$FUTURIDE_SOCKET` if set
/// - `/run/futuride/futuride.sock` otherwise
#[must_use]
pub fn default_socket_path() -> PathBuf {
    std::env::var_os("FUTURIDE_SOCKET")
        .map_or_else(|| PathBuf::from("/run/futuride/futuride.sock"), PathBuf::from)
}

/// Builder for EngineConfig
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    #[must_use]
    pub fn max_code_length(mut self, chars: usize) -> Self {
        self.config.max_code_length = chars;
        self
    }

    #[must_use]
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.config.timeout = duration;
        self
    }

    #[must_use]
    pub fn compile_timeout(mut self, duration: Duration) -> Self {
        self.config.compile_timeout = duration;
        self
    }

    #[must_use]
    pub fn max_concurrent(mut self, n: usize) -> Self {
        self.config.max_concurrent = n;
        self
    }

    #[must_use]
    pub fn max_output_bytes(mut self, bytes: usize) -> Self {
        self.config.max_output_bytes = bytes;
        self
    }

    #[must_use]
    pub fn workspace_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.workspace_root = path.into();
        self
    }

    #[must_use]
    pub fn limits(mut self, limits: ProcessLimits) -> Self {
        self.config.limits = limits;
        self
    }

    #[must_use]
    pub fn rate_limit(mut self, max_requests: usize, window: Duration) -> Self {
        self.config.rate_limit.enabled = true;
        self.config.rate_limit.max_requests = max_requests;
        self.config.rate_limit.window = window;
        self
    }

    #[must_use]
    pub fn disable_rate_limit(mut self) -> Self {
        self.config.rate_limit.enabled = false;
        self
    }

    #[must_use]
    pub fn deny_pattern(mut self, language: Language, pattern: impl Into<String>) -> Self {
        self.config
            .denylist
            .extra
            .entry(language)
            .or_default()
            .push(pattern.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn build(self) -> EngineConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_limits() {
        let config = EngineConfig::default();
        assert_eq!(config.max_code_length, 50_000);
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert_eq!(config.rate_limit.max_requests, 50);
        assert_eq!(config.rate_limit.window, Duration::from_secs(3600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn testing_profile_raises_rate_limit() {
        assert_eq!(EngineConfig::for_testing().rate_limit.max_requests, 1000);
    }

    #[test]
    fn rejects_zero_concurrency() {
        let config = EngineConfig::builder().max_concurrent(0).build();
        assert!(matches!(config.validate(), Err(FuturideError::Config(_))));
    }

    #[test]
    fn builder_collects_deny_patterns() {
        let config = EngineConfig::builder()
            .deny_pattern(Language::Python, r"\bturtle\b")
            .deny_pattern(Language::Python, r"\bantigravity\b")
            .build();
        assert_eq!(config.denylist.extra[&Language::Python].len(), 2);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"timeout": "3s", "rate_limit": {"max_requests": 5}}"#)
                .unwrap();
        assert_eq!(config.timeout, Duration::from_secs(3));
        assert_eq!(config.rate_limit.max_requests, 5);
        assert_eq!(config.rate_limit.window, Duration::from_secs(3600));
        assert_eq!(config.max_code_length, 50_000);
    }
}
