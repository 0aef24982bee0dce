//! # futuride-core
//!
//! Secure execution engine for untrusted code submissions.
//!
//! This crate provides the pieces behind a single `execute(code, language, client)`
//! entry point:
//! - Denylist validation of submitted source per language
//! - Run-scoped workspaces that are removed on every exit path
//! - Per-language strategies (interpret, compile-then-run, embedded evaluation, render)
//! - A process runner with wall-clock timeouts that kills the whole process group
//! - A sliding-window rate limiter keyed by client identity
//!
//! None of this is a formal security boundary. It is defense-in-depth built from
//! pattern denial and process limits.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod engine;
pub mod error;
pub mod isolation;
#[cfg(feature = "javascript")]
pub mod javascript;
pub mod language;
pub mod protocol;
pub mod ratelimit;
pub mod result;
pub mod runner;
pub mod strategy;
pub mod validator;
pub mod workspace;

pub use config::EngineConfig;
pub use engine::{Engine, EngineStatus, ExecutionRequest};
pub use error::FuturideError;
pub use language::{Language, LanguageInfo};
pub use protocol::ExecuteResponse;
pub use ratelimit::{RateLimiter, SlidingWindowLimiter, UnlimitedLimiter};
pub use result::{ErrorKind, ExecutionResult, Stage};
pub use validator::{ValidationResult, Validator};

/// Crate-level result type
pub type Result<T> = std::result::Result<T, FuturideError>;
