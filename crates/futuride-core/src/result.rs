//! Execution result types

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Boundary error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    RateLimited,
    InvalidInput,
    ValidationRejected,
    CompileFailed,
    ExecutionTimeout,
    ExecutionFailed,
    InternalError,
}

/// Which phase produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// C compilation step
    Compile,
    /// Program execution (subprocess or embedded evaluation)
    Run,
    /// Markup handed back for client-side rendering
    Render,
}

/// Result of a single execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Standard output, bounded by the configured maximum
    pub stdout: String,

    /// Standard error, bounded by the configured maximum
    pub stderr: String,

    /// Exit code, absent when killed by a signal or timeout
    pub exit_code: Option<i32>,

    /// Terminating signal, if any
    pub signal: Option<i32>,

    /// Whether the wall-clock timeout fired
    pub timed_out: bool,

    /// Exit code 0, not timed out, no fault
    pub success: bool,

    /// Phase that produced this result
    pub stage: Stage,

    /// Whether stdout or stderr was cut at the output limit
    pub truncated: bool,

    /// Wall-clock duration
    pub duration: Duration,

    /// Infrastructure fault (spawn failure, cancellation). Logged, never serialized.
    #[serde(skip)]
    pub fault: Option<String>,
}

impl ExecutionResult {
    /// Raw markup returned for client-side rendering
    #[must_use]
    pub const fn rendered(markup: String) -> Self {
        Self {
            stdout: markup,
            stderr: String::new(),
            exit_code: None,
            signal: None,
            timed_out: false,
            success: true,
            stage: Stage::Render,
            truncated: false,
            duration: Duration::ZERO,
            fault: None,
        }
    }

    /// Result describing an infrastructure fault
    #[must_use]
    pub fn faulted(stage: Stage, fault: impl Into<String>, duration: Duration) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            signal: None,
            timed_out: false,
            success: false,
            stage,
            truncated: false,
            duration,
            fault: Some(fault.into()),
        }
    }

    #[must_use]
    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = stage;
        self
    }

    /// Boundary classification, `None` when the execution succeeded
    #[must_use]
    pub const fn error_kind(&self) -> Option<ErrorKind> {
        if self.fault.is_some() {
            Some(ErrorKind::InternalError)
        } else if self.timed_out {
            Some(ErrorKind::ExecutionTimeout)
        } else if self.success {
            None
        } else if matches!(self.stage, Stage::Compile) {
            Some(ErrorKind::CompileFailed)
        } else {
            Some(ErrorKind::ExecutionFailed)
        }
    }
}
