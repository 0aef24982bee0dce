//! Embedded JavaScript evaluation
//!
//! Each evaluation gets a brand new V8 isolate through `deno_core`, with no
//! extensions registered: there are no ops for files, processes, timers or
//! the network. Isolates are `!Send`, so every one of them lives on its own OS
//! thread with a current-thread tokio runtime. The async side keeps an
//! [`v8::IsolateHandle`] and terminates the isolate on timeout or cancellation.

use crate::result::{ExecutionResult, Stage};
use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::runner::TRUNCATION_MARKER;

/// Time allowed for a terminated isolate to hand back its captured output
const TERMINATION_GRACE: Duration = Duration::from_secs(2);

/// Extra heap granted once the ceiling is hit so termination can unwind
const HEAP_GRACE_BYTES: usize = 1024 * 1024;

/// Installed before user code runs. Called with the output limit in UTF-16
/// units; the Rust side trims to bytes afterwards.
const BOOTSTRAP: &str = r#"
(limit) => {
    const stringify = JSON.stringify;
    const out = { stdout: "", stderr: "", stdout_truncated: false, stderr_truncated: false };

    const show = (value) => {
        if (typeof value === "string") return value;
        try {
            const text = stringify(value);
            return text === undefined ? String(value) : text;
        } catch (_) {
            return String(value);
        }
    };

    const writer = (stream) => (...args) => {
        const line = args.map(show).join(" ") + "\n";
        const room = limit - out[stream].length;
        if (line.length > room) {
            out[stream] += line.slice(0, Math.max(room, 0));
            out[stream + "_truncated"] = true;
        } else {
            out[stream] += line;
        }
    };

    const log = writer("stdout");
    const err = writer("stderr");
    Object.defineProperty(globalThis, "console", {
        value: Object.freeze({ log, info: log, debug: log, warn: err, error: err, trace: err }),
        configurable: false,
        writable: false,
    });
    Object.defineProperty(globalThis, "__futurideCollect", {
        value: () => stringify(out),
        configurable: false,
        writable: false,
        enumerable: false,
    });

    delete globalThis.Deno;
    delete globalThis.__bootstrap;
    delete globalThis.eval;

    const AsyncFunction = (async function () {}).constructor;
    const GeneratorFunction = (function* () {}).constructor;
    for (const ctor of [Function, AsyncFunction, GeneratorFunction]) {
        Object.defineProperty(ctor.prototype, "constructor", {
            value: undefined,
            configurable: false,
            writable: false,
        });
    }
}
"#;

/// What the isolate thread reports back
#[derive(Debug, Default)]
struct Evaluation {
    stdout: String,
    stderr: String,
    stdout_truncated: bool,
    stderr_truncated: bool,
    /// Uncaught exception text, including termination
    threw: Option<String>,
    heap_exhausted: bool,
}

#[derive(Debug, Default, Deserialize)]
struct Captured {
    stdout: String,
    stderr: String,
    stdout_truncated: bool,
    stderr_truncated: bool,
}

/// Runs JavaScript sources in throwaway isolates
#[derive(Debug, Clone, Copy)]
pub struct JavaScriptEvaluator {
    heap_bytes: usize,
    max_output_bytes: usize,
}

impl JavaScriptEvaluator {
    #[must_use]
    pub const fn new(heap_bytes: usize, max_output_bytes: usize) -> Self {
        Self {
            heap_bytes,
            max_output_bytes,
        }
    }

    /// Evaluate `source` until it completes, times out or `cancel` fires.
    ///
    /// Never fails: thread or isolate setup problems come back as a faulted result.
    pub async fn evaluate(
        &self,
        source: String,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let started = Instant::now();
        let (handle_tx, handle_rx) = oneshot::channel();
        let (result_tx, mut result_rx) = oneshot::channel();
        let evaluator = *self;

        let spawned = std::thread::Builder::new()
            .name("futuride-js".into())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to build isolate runtime");
                        return;
                    }
                };
                let evaluation = rt.block_on(evaluator.run_isolate(&source, handle_tx));
                if result_tx.send(evaluation).is_err() {
                    tracing::debug!("evaluation receiver dropped");
                }
            });

        if let Err(e) = spawned {
            tracing::error!(error = %e, "failed to spawn isolate thread");
            return ExecutionResult::faulted(
                Stage::Run,
                format!("isolate thread: {e}"),
                started.elapsed(),
            );
        }

        let Ok(handle) = handle_rx.await else {
            return ExecutionResult::faulted(
                Stage::Run,
                "isolate thread exited before start",
                started.elapsed(),
            );
        };
        // Terminates the isolate if this future is dropped mid-evaluation
        let _guard = Terminator(handle.clone());

        let mut timed_out = false;
        let mut cancelled = false;
        let received = tokio::select! {
            evaluation = &mut result_rx => evaluation,
            () = tokio::time::sleep(timeout) => {
                timed_out = true;
                handle.terminate_execution();
                tokio::time::timeout(TERMINATION_GRACE, &mut result_rx).await.unwrap_or_else(|_| {
                    tracing::warn!("terminated isolate did not report back");
                    Ok(Evaluation::default())
                })
            }
            () = cancel.cancelled() => {
                cancelled = true;
                handle.terminate_execution();
                Ok(Evaluation::default())
            }
        };

        let duration = started.elapsed();
        let evaluation = match received {
            Ok(evaluation) => evaluation,
            Err(_) => {
                return ExecutionResult::faulted(Stage::Run, "isolate thread panicked", duration);
            }
        };

        if cancelled {
            tracing::info!("evaluation cancelled");
            return ExecutionResult::faulted(Stage::Run, "cancelled", duration);
        }

        let mut result = ExecutionResult {
            stdout: evaluation.stdout,
            stderr: evaluation.stderr,
            exit_code: None,
            signal: None,
            timed_out,
            success: false,
            stage: Stage::Run,
            truncated: false,
            duration,
            fault: None,
        };

        if timed_out {
            tracing::info!(?timeout, "evaluation timed out");
        } else if evaluation.heap_exhausted {
            append_line(&mut result.stderr, "RangeError: JavaScript heap limit exceeded");
            result.exit_code = Some(1);
        } else if let Some(threw) = evaluation.threw {
            append_line(&mut result.stderr, &threw);
            result.exit_code = Some(1);
        } else {
            result.exit_code = Some(0);
            result.success = true;
        }

        let streams = [
            (&mut result.stdout, evaluation.stdout_truncated),
            (&mut result.stderr, evaluation.stderr_truncated),
        ];
        for (stream, cut_in_isolate) in streams {
            if bound(stream, self.max_output_bytes) {
                result.truncated = true;
            } else if cut_in_isolate {
                stream.push_str(TRUNCATION_MARKER);
                result.truncated = true;
            }
        }

        result
    }

    async fn run_isolate(
        self,
        source: &str,
        handle_tx: oneshot::Sender<v8::IsolateHandle>,
    ) -> Evaluation {
        let mut runtime = JsRuntime::new(RuntimeOptions {
            create_params: Some(v8::CreateParams::default().heap_limits(0, self.heap_bytes)),
            ..Default::default()
        });

        let heap_state = Box::new(HeapLimitState {
            handle: runtime.v8_isolate().thread_safe_handle(),
            triggered: AtomicBool::new(false),
        });
        runtime.v8_isolate().add_near_heap_limit_callback(
            near_heap_limit_callback,
            std::ptr::from_ref::<HeapLimitState>(&*heap_state)
                .cast_mut()
                .cast::<std::ffi::c_void>(),
        );

        if handle_tx
            .send(runtime.v8_isolate().thread_safe_handle())
            .is_err()
        {
            drop(runtime);
            drop(heap_state);
            return Evaluation::default();
        }

        let mut evaluation = Evaluation::default();
        let limit = self.max_output_bytes;

        match runtime.execute_script("[futuride:bootstrap]", format!("({BOOTSTRAP})({limit});")) {
            Ok(_) => {
                evaluation.threw = match runtime.execute_script("main.js", source.to_owned()) {
                    Ok(_) => runtime
                        .run_event_loop(PollEventLoopOptions::default())
                        .await
                        .err()
                        .map(|e| e.to_string()),
                    Err(e) => Some(e.to_string()),
                };
            }
            Err(e) => {
                tracing::error!(error = %e, "javascript bootstrap failed");
                evaluation.threw = Some("JavaScript context setup failed".into());
            }
        }

        // Clear a pending termination so the collector can still run
        runtime.v8_isolate().cancel_terminate_execution();
        evaluation.heap_exhausted = heap_state.triggered.load(Ordering::SeqCst);

        // A full heap would push the collector past the ceiling again
        if !evaluation.heap_exhausted {
            if let Some(captured) = collect(&mut runtime) {
                evaluation.stdout = captured.stdout;
                evaluation.stderr = captured.stderr;
                evaluation.stdout_truncated = captured.stdout_truncated;
                evaluation.stderr_truncated = captured.stderr_truncated;
            }
        }

        // The callback's data pointer must stay valid for the isolate's lifetime
        drop(runtime);
        drop(heap_state);
        evaluation
    }
}

fn collect(runtime: &mut JsRuntime) -> Option<Captured> {
    let value = match runtime.execute_script("[futuride:collect]", "__futurideCollect()") {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(error = %e, "failed to collect console output");
            return None;
        }
    };

    let json = {
        let scope = &mut runtime.handle_scope();
        let local = v8::Local::new(scope, value);
        local.to_rust_string_lossy(scope)
    };

    serde_json::from_str(&json)
        .map_err(|e| tracing::warn!(error = %e, "malformed console capture"))
        .ok()
}

/// Cut `text` to at most `limit` bytes on a char boundary, appending the marker.
fn bound(text: &mut String, limit: usize) -> bool {
    if text.len() <= limit {
        return false;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
    text.push_str(TRUNCATION_MARKER);
    true
}

fn append_line(text: &mut String, line: &str) {
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    text.push_str(line);
}

struct Terminator(v8::IsolateHandle);

impl Drop for Terminator {
    fn drop(&mut self) {
        // No-op once the isolate is gone
        self.0.terminate_execution();
    }
}

struct HeapLimitState {
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
}

extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` is the boxed HeapLimitState registered in run_isolate,
    // which is dropped only after the runtime that invokes this callback.
    let state = unsafe { &*data.cast::<HeapLimitState>() };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + HEAP_GRACE_BYTES
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluator() -> JavaScriptEvaluator {
        JavaScriptEvaluator::new(64 * 1024 * 1024, 1024 * 1024)
    }

    async fn eval(source: &str, timeout: Duration) -> ExecutionResult {
        evaluator()
            .evaluate(source.into(), timeout, &CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn console_log_is_captured() {
        let result = eval(
            "console.log('Hello, World!'); console.log(1, {a: 2}); console.error('warn');",
            Duration::from_secs(5),
        )
        .await;

        assert!(result.success, "{result:?}");
        assert_eq!(result.stdout, "Hello, World!\n1 {\"a\":2}\n");
        assert_eq!(result.stderr, "warn\n");
        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn uncaught_exception_fails() {
        let result = eval(
            "console.log('before'); throw new Error('boom');",
            Duration::from_secs(5),
        )
        .await;

        assert!(!result.success);
        assert_eq!(result.exit_code, Some(1));
        assert_eq!(result.stdout, "before\n");
        assert!(result.stderr.contains("boom"));
    }

    #[tokio::test]
    async fn infinite_loop_is_terminated() {
        let started = Instant::now();
        let result =
            eval("console.log('spin'); while (true) {}", Duration::from_millis(300)).await;

        assert!(result.timed_out);
        assert!(!result.success);
        assert_eq!(result.exit_code, None);
        assert_eq!(result.stdout, "spin\n");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn host_escape_hatches_are_gone() {
        let result = eval(
            "console.log(typeof Deno, typeof eval, typeof require, typeof fetch);\n\
             console.log(typeof __bootstrap, typeof globalThis.__bootstrap);",
            Duration::from_secs(5),
        )
        .await;

        assert!(result.success, "{result:?}");
        assert_eq!(
            result.stdout,
            "undefined undefined undefined undefined\nundefined undefined\n"
        );
    }

    #[tokio::test]
    async fn isolates_share_nothing() {
        let first = eval("var leaked = 42; console.log(leaked);", Duration::from_secs(5)).await;
        let second = eval("console.log(typeof leaked);", Duration::from_secs(5)).await;

        assert_eq!(first.stdout, "42\n");
        assert_eq!(second.stdout, "undefined\n");
    }

    #[tokio::test]
    async fn heap_ceiling_is_enforced() {
        let result = JavaScriptEvaluator::new(16 * 1024 * 1024, 1024)
            .evaluate(
                "const hog = []; while (true) { hog.push(new Array(100000).fill(1)); }".into(),
                Duration::from_secs(30),
                &CancellationToken::new(),
            )
            .await;

        assert!(!result.success);
        assert!(!result.timed_out);
        assert!(result.stderr.contains("heap limit"));
    }

    #[test]
    fn bound_respects_char_boundaries() {
        let mut text = "héllo".to_string();
        assert!(bound(&mut text, 2));
        assert_eq!(text, format!("h{TRUNCATION_MARKER}"));

        let mut short = "ok".to_string();
        assert!(!bound(&mut short, 10));
        assert_eq!(short, "ok");
    }
}
