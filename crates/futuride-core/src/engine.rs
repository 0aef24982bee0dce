//! Execution engine
//!
//! Orchestrates one request end to end: input checks, rate limiting, denylist
//! validation, a scoped workspace, the language strategy and the runner.

use crate::config::EngineConfig;
#[cfg(feature = "javascript")]
use crate::javascript::JavaScriptEvaluator;
use crate::language::Language;
use crate::protocol::ExecuteResponse;
use crate::ratelimit::{RateLimiter, SlidingWindowLimiter, UnlimitedLimiter};
use crate::result::{ExecutionResult, Stage};
use crate::runner::ProcessRunner;
use crate::strategy::{Launch, Strategy};
use crate::validator::Validator;
use crate::workspace::Workspace;
use crate::{FuturideError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// One submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub code: String,
    pub language: Language,
    pub client_id: String,
}

impl ExecutionRequest {
    #[must_use]
    pub fn new(code: impl Into<String>, language: Language, client_id: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            language,
            client_id: client_id.into(),
        }
    }
}

/// Engine load snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub active: usize,
    pub max_concurrent: usize,
    pub tracked_clients: usize,
}

/// Counts an execution as active for as long as it is alive
struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Secure execution engine. Share it behind an `Arc`; every method takes `&self`.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    validator: Validator,
    limiter: Arc<dyn RateLimiter>,
    runner: ProcessRunner,
    #[cfg(feature = "javascript")]
    javascript: JavaScriptEvaluator,
    permits: Arc<Semaphore>,
    active: AtomicUsize,
    shutdown: CancellationToken,
}

impl Engine {
    /// Build an engine with the limiter described by `config.rate_limit`
    pub fn new(config: EngineConfig) -> Result<Self> {
        let limiter: Arc<dyn RateLimiter> = if config.rate_limit.enabled {
            Arc::new(SlidingWindowLimiter::new(
                config.rate_limit.max_requests,
                config.rate_limit.window,
            ))
        } else {
            Arc::new(UnlimitedLimiter)
        };
        Self::with_rate_limiter(config, limiter)
    }

    /// Build an engine around an externally provided limiter
    pub fn with_rate_limiter(config: EngineConfig, limiter: Arc<dyn RateLimiter>) -> Result<Self> {
        config.validate()?;
        let validator = Validator::new(config.max_code_length, &config.denylist)?;
        let runner = ProcessRunner::new(config.max_output_bytes, config.env.clone());

        tracing::info!(
            max_concurrent = config.max_concurrent,
            timeout = ?config.timeout,
            workspace_root = ?config.workspace_root,
            rate_limited = config.rate_limit.enabled,
            "engine ready"
        );

        Ok(Self {
            #[cfg(feature = "javascript")]
            javascript: JavaScriptEvaluator::new(
                config.javascript_heap_bytes,
                config.max_output_bytes,
            ),
            permits: Arc::new(Semaphore::new(config.max_concurrent)),
            active: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
            config,
            validator,
            limiter,
            runner,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Typed entry point
    pub async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        let started = Instant::now();
        let language = request.language;
        let client = request.client_id.as_str();
        let code_len = request.code.len();

        if self.shutdown.is_cancelled() {
            return Err(FuturideError::Runtime("engine is shutting down".into()));
        }

        if let Some(violation) = self.validator.check_input(&request.code) {
            tracing::debug!(
                client,
                %language,
                code_len,
                reason = %violation.reason(),
                "invalid input"
            );
            return Err(violation.into());
        }

        if !self.limiter.allow(client) {
            tracing::warn!(client, %language, "rate limit exceeded");
            return Err(FuturideError::RateLimited);
        }

        if let Some(violation) = self.validator.check_patterns(&request.code, language) {
            tracing::warn!(
                client,
                %language,
                code_len,
                reason = %violation.reason(),
                "code rejected"
            );
            return Err(violation.into());
        }

        // Markup never runs, so it does not compete for execution slots
        let _permit = if matches!(language, Language::Html) {
            None
        } else {
            Some(self.acquire().await?)
        };
        let _active = ActiveGuard::enter(&self.active);

        tracing::debug!(client, %language, code_len, "executing");

        let workspace = self.create_workspace(language, &request.code).await?;
        let outcome = self.launch(language, &workspace).await;
        self.release_workspace(workspace).await?;
        let result = outcome?;

        if let Some(fault) = &result.fault {
            tracing::error!(
                client,
                %language,
                stage = ?result.stage,
                fault = %fault,
                "execution fault"
            );
            return Err(FuturideError::Runtime(fault.clone()));
        }

        tracing::debug!(
            client,
            %language,
            code_len,
            duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            exit_code = ?result.exit_code,
            timed_out = result.timed_out,
            success = result.success,
            "execution finished"
        );

        Ok(result)
    }

    /// Untyped boundary entry point. Every outcome, including rejections, comes
    /// back as a response.
    pub async fn execute_text(
        &self,
        code: impl Into<String>,
        language: &str,
        client_id: impl Into<String>,
    ) -> ExecuteResponse {
        let language = match language.parse::<Language>() {
            Ok(language) => language,
            Err(e) => return ExecuteResponse::from_error(&e),
        };
        let request = ExecutionRequest::new(code, language, client_id);

        match self.execute(&request).await {
            Ok(result) => {
                let timeout = if matches!(result.stage, Stage::Compile) {
                    self.config.compile_timeout
                } else {
                    self.config.timeout
                };
                ExecuteResponse::from_result(result, timeout)
            }
            Err(e) => ExecuteResponse::from_error(&e),
        }
    }

    #[must_use]
    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            active: self.active.load(Ordering::SeqCst),
            max_concurrent: self.config.max_concurrent,
            tracked_clients: self.limiter.tracked_clients(),
        }
    }

    /// Evict rate-limit entries with no requests inside the window
    pub fn sweep_idle_clients(&self) {
        self.limiter.sweep();
    }

    /// Cancel in-flight executions, refuse new ones and forget rate-limit state
    pub fn shutdown(&self) {
        tracing::info!(active = self.active.load(Ordering::SeqCst), "engine shutting down");
        self.shutdown.cancel();
        self.permits.close();
        self.limiter.clear();
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| FuturideError::Runtime("engine is shut down".into()))
    }

    async fn create_workspace(&self, language: Language, code: &str) -> Result<Workspace> {
        let root: PathBuf = self.config.workspace_root.clone();
        let code = code.to_owned();
        let created = tokio::task::spawn_blocking(move || Workspace::create(&root, language, &code))
            .await
            .map_err(|e| FuturideError::Runtime(format!("workspace task failed: {e}")))?;

        created.inspect_err(|e| tracing::error!(%language, error = %e, "workspace unavailable"))
    }

    async fn release_workspace(&self, workspace: Workspace) -> Result<()> {
        tokio::task::spawn_blocking(move || workspace.close())
            .await
            .map_err(|e| FuturideError::Runtime(format!("workspace task failed: {e}")))?
            .inspect_err(|e| tracing::error!(error = %e, "workspace cleanup failed"))
    }

    async fn launch(&self, language: Language, workspace: &Workspace) -> Result<ExecutionResult> {
        let cancel = self.shutdown.child_token();
        let strategy = Strategy::for_language(language, &self.config);

        match strategy.build_command(workspace) {
            Launch::Interpret(command) => {
                Ok(self.runner.run(&command, workspace.root(), &cancel).await)
            }
            Launch::CompileThenRun { compile, run } => {
                let compiled = self
                    .runner
                    .run(&compile, workspace.root(), &cancel)
                    .await
                    .with_stage(Stage::Compile);
                if !compiled.success {
                    return Ok(compiled);
                }
                if !compiled.stderr.is_empty() {
                    tracing::debug!(
                        diagnostics_len = compiled.stderr.len(),
                        "compiled with warnings"
                    );
                }
                Ok(self.runner.run(&run, workspace.root(), &cancel).await)
            }
            Launch::Embedded { source, timeout } => {
                let source = tokio::fs::read_to_string(&source).await?;
                self.evaluate(source, timeout, &cancel).await
            }
            Launch::Render => {
                let markup = tokio::fs::read_to_string(workspace.source_file()).await?;
                Ok(ExecutionResult::rendered(markup))
            }
        }
    }

    #[cfg(feature = "javascript")]
    async fn evaluate(
        &self,
        source: String,
        timeout: std::time::Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        Ok(self.javascript.evaluate(source, timeout, cancel).await)
    }

    #[cfg(not(feature = "javascript"))]
    #[allow(clippy::unused_async)]
    async fn evaluate(
        &self,
        _source: String,
        _timeout: std::time::Duration,
        _cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        tracing::error!("javascript requested but the runtime is not compiled in");
        Err(FuturideError::Runtime("JavaScript runtime not enabled".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::ErrorKind;

    fn engine(root: &std::path::Path) -> Engine {
        Engine::new(
            EngineConfig::builder()
                .workspace_root(root)
                .rate_limit(2, std::time::Duration::from_secs(3600))
                .build(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn html_is_returned_verbatim() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine(root.path());

        let response = engine.execute_text("<h1>Test</h1>", "html", "client").await;
        assert!(response.success);
        assert_eq!(response.output, "<h1>Test</h1>");
        assert_eq!(response.error, None);
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn unknown_language_is_invalid_input() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine(root.path());

        let response = engine.execute_text("print(1)", "cobol", "client").await;
        assert_eq!(response.kind, Some(ErrorKind::InvalidInput));
        assert_eq!(response.error.as_deref(), Some("Unsupported language"));
        assert_eq!(engine.status().tracked_clients, 0);
    }

    #[tokio::test]
    async fn rejections_count_but_input_errors_do_not() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine(root.path());

        for _ in 0..5 {
            let response = engine.execute_text("   ", "python", "client").await;
            assert_eq!(response.kind, Some(ErrorKind::InvalidInput));
        }

        let denied = engine.execute_text("import subprocess", "python", "client").await;
        assert_eq!(denied.kind, Some(ErrorKind::ValidationRejected));

        let html = engine.execute_text("<p>ok</p>", "html", "client").await;
        assert!(html.success);

        let limited = engine.execute_text("<p>ok</p>", "html", "client").await;
        assert_eq!(limited.kind, Some(ErrorKind::RateLimited));
    }

    #[tokio::test]
    async fn shutdown_refuses_new_work() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine(root.path());
        engine.shutdown();

        let response = engine.execute_text("print(1)", "python", "client").await;
        assert_eq!(response.kind, Some(ErrorKind::InternalError));
        assert_eq!(engine.status().tracked_clients, 0);
    }

    /// Admits nothing and remembers who asked
    #[derive(Debug, Default)]
    struct Closed {
        asked: parking_lot::Mutex<Vec<String>>,
    }

    impl RateLimiter for Closed {
        fn allow(&self, client_id: &str) -> bool {
            self.asked.lock().push(client_id.to_owned());
            false
        }

        fn sweep(&self) {}

        fn tracked_clients(&self) -> usize {
            self.asked.lock().len()
        }

        fn clear(&self) {
            self.asked.lock().clear();
        }
    }

    #[tokio::test]
    async fn injected_limiter_gates_requests() {
        let root = tempfile::tempdir().unwrap();
        let limiter = Arc::new(Closed::default());
        let config = EngineConfig::builder().workspace_root(root.path()).build();
        let engine = Engine::with_rate_limiter(config, limiter.clone()).unwrap();

        let response = engine.execute_text("<p>hi</p>", "html", "10.1.2.3").await;
        assert_eq!(response.kind, Some(ErrorKind::RateLimited));
        assert_eq!(*limiter.asked.lock(), ["10.1.2.3"]);
        assert_eq!(engine.status().tracked_clients, 1);

        engine.shutdown();
        assert_eq!(engine.status().tracked_clients, 0);
    }

    #[tokio::test]
    async fn disabled_rate_limit_admits_everything() {
        let root = tempfile::tempdir().unwrap();
        let engine = Engine::new(
            EngineConfig::builder()
                .workspace_root(root.path())
                .rate_limit(1, std::time::Duration::from_secs(3600))
                .disable_rate_limit()
                .build(),
        )
        .unwrap();

        for _ in 0..20 {
            let response = engine.execute_text("<p>ok</p>", "html", "client").await;
            assert!(response.success, "{response:?}");
        }
        assert_eq!(engine.status().tracked_clients, 0);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = EngineConfig::builder()
            .deny_pattern(Language::C, "(unclosed")
            .build();
        assert!(matches!(Engine::new(config), Err(FuturideError::Config(_))));
    }
}
