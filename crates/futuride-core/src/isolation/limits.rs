//! Resource limits for child processes

use nix::sys::resource::{getrlimit, setrlimit, Resource};
use serde::{Deserialize, Serialize};

/// rlimit ceilings applied inside the child before exec
///
/// `None` leaves the inherited limit untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessLimits {
    /// Virtual address space in bytes (RLIMIT_AS)
    pub address_space_bytes: Option<u64>,
    /// CPU seconds (RLIMIT_CPU); the kernel sends SIGXCPU then SIGKILL
    pub cpu_seconds: Option<u64>,
    /// Largest file the process may write (RLIMIT_FSIZE)
    pub file_size_bytes: Option<u64>,
    /// Open file descriptors (RLIMIT_NOFILE)
    pub open_files: Option<u64>,
    /// Processes for the real user id (RLIMIT_NPROC). Counts every process of
    /// that user on the host, so it is off by default.
    pub max_processes: Option<u64>,
}

impl Default for ProcessLimits {
    fn default() -> Self {
        Self {
            address_space_bytes: Some(512 * 1024 * 1024), // 512MB
            cpu_seconds: Some(15),
            file_size_bytes: Some(16 * 1024 * 1024), // 16MB
            open_files: Some(64),
            max_processes: None,
        }
    }
}

impl ProcessLimits {
    /// Looser limits for the C compiler driver and its subprocesses
    #[must_use]
    pub const fn compiler() -> Self {
        Self {
            address_space_bytes: Some(2 * 1024 * 1024 * 1024), // 2GB
            cpu_seconds: Some(30),
            file_size_bytes: Some(64 * 1024 * 1024), // 64MB
            open_files: Some(256),
            max_processes: None,
        }
    }

    /// Apply the limits to the calling process.
    ///
    /// Runs between fork and exec: no allocation, only raw syscalls.
    pub fn apply(&self) -> nix::Result<()> {
        lower(Resource::RLIMIT_CORE, 0, 0)?;

        if let Some(bytes) = self.address_space_bytes {
            lower(Resource::RLIMIT_AS, bytes, bytes)?;
        }
        if let Some(secs) = self.cpu_seconds {
            // soft < hard so SIGXCPU arrives before the hard kill
            lower(Resource::RLIMIT_CPU, secs, secs.saturating_add(1))?;
        }
        if let Some(bytes) = self.file_size_bytes {
            lower(Resource::RLIMIT_FSIZE, bytes, bytes)?;
        }
        if let Some(n) = self.open_files {
            lower(Resource::RLIMIT_NOFILE, n, n)?;
        }
        if let Some(n) = self.max_processes {
            lower(Resource::RLIMIT_NPROC, n, n)?;
        }

        Ok(())
    }
}

/// Set a limit without ever raising the inherited hard ceiling (which would EPERM)
fn lower(resource: Resource, soft: u64, hard: u64) -> nix::Result<()> {
    let (_, current_hard) = getrlimit(resource)?;
    let hard = hard.min(current_hard);
    setrlimit(resource, soft.min(hard), hard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiler_limits_are_looser() {
        let run = ProcessLimits::default();
        let compile = ProcessLimits::compiler();
        assert!(compile.address_space_bytes > run.address_space_bytes);
        assert!(compile.cpu_seconds > run.cpu_seconds);
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let limits: ProcessLimits =
            serde_json::from_str(r#"{"max_processes": 32}"#).unwrap();
        assert_eq!(limits.max_processes, Some(32));
        assert_eq!(limits.open_files, Some(64));
    }
}
