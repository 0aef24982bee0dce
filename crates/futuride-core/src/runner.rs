//! Subprocess launcher with wall-clock timeouts and bounded capture

use crate::isolation::{GroupGuard, GroupId};
use crate::result::{ExecutionResult, Stage};
use crate::strategy::CommandSpec;
use nix::errno::Errno;
use parking_lot::Mutex;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

const READ_CHUNK: usize = 8192;
const READER_GRACE: Duration = Duration::from_millis(500);
const EXIT_DRAIN: Duration = Duration::from_millis(200);
const SPAWN_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Bytes captured from one stream
#[derive(Debug, Default)]
struct Capture {
    bytes: Vec<u8>,
    truncated: bool,
}

impl Capture {
    fn render(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        text
    }
}

type SharedCapture = Arc<Mutex<Capture>>;

enum Outcome {
    Exited(ExitStatus),
    WaitFailed(io::Error),
    TimedOut,
    Cancelled,
}

/// Launches [`CommandSpec`]s in a fresh process group under rlimits
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    max_output_bytes: usize,
    env: Vec<(String, String)>,
}

impl ProcessRunner {
    #[must_use]
    pub const fn new(max_output_bytes: usize, env: Vec<(String, String)>) -> Self {
        Self {
            max_output_bytes,
            env,
        }
    }

    /// Run `spec` inside `working_dir` until it exits, times out or `cancel` fires.
    ///
    /// Never fails: launch problems come back as a faulted result.
    pub async fn run(
        &self,
        spec: &CommandSpec,
        working_dir: &Path,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let started = Instant::now();
        let mut command = self.command(spec, working_dir);

        let mut child = match spawn(&mut command).await {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(program = ?spec.program, error = %e, "failed to spawn process");
                return ExecutionResult::faulted(
                    Stage::Run,
                    format!("spawn {}: {e}", spec.program.display()),
                    started.elapsed(),
                );
            }
        };

        tracing::debug!(pid = ?child.id(), program = ?spec.program, "process spawned");
        // Declared after `child` so a dropped future kills the group before the
        // leader is reaped by `kill_on_drop`
        let mut group = GroupGuard::new(child.id().and_then(GroupId::from_child_pid));

        let stdout = Arc::new(Mutex::new(Capture::default()));
        let stderr = Arc::new(Mutex::new(Capture::default()));
        let readers = [
            child
                .stdout
                .take()
                .map(|pipe| spawn_reader(pipe, Arc::clone(&stdout), self.max_output_bytes)),
            child
                .stderr
                .take()
                .map(|pipe| spawn_reader(pipe, Arc::clone(&stderr), self.max_output_bytes)),
        ];

        let outcome = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => Outcome::Exited(status),
                Err(e) => Outcome::WaitFailed(e),
            },
            () = tokio::time::sleep(spec.timeout) => Outcome::TimedOut,
            () = cancel.cancelled() => Outcome::Cancelled,
        };

        let mut readers: Vec<JoinHandle<()>> = readers.into_iter().flatten().collect();
        if matches!(outcome, Outcome::Exited(_)) {
            // The leader is reaped. Its pgid stays ours only while a descendant
            // still holds a pipe open, so sweep only in that case.
            if drain(&mut readers, EXIT_DRAIN).await {
                group.disarm();
            } else {
                tracing::debug!("descendants outlived the program");
                group.terminate();
            }
        } else {
            group.terminate();
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "failed to reap child");
            }
        }

        if !drain(&mut readers, READER_GRACE).await {
            tracing::warn!("output reader did not finish after kill");
        }

        let stdout = stdout.lock();
        let stderr = stderr.lock();
        let mut result = ExecutionResult {
            stdout: stdout.render(),
            stderr: stderr.render(),
            exit_code: None,
            signal: None,
            timed_out: false,
            success: false,
            stage: Stage::Run,
            truncated: stdout.truncated || stderr.truncated,
            duration: started.elapsed(),
            fault: None,
        };

        match outcome {
            Outcome::Exited(status) => {
                result.exit_code = status.code();
                result.signal = status.signal();
                result.success = status.success();
            }
            Outcome::WaitFailed(e) => {
                tracing::error!(error = %e, "waiting on child failed");
                result.fault = Some(format!("wait: {e}"));
            }
            Outcome::TimedOut => {
                tracing::info!(timeout = ?spec.timeout, "execution timed out");
                result.timed_out = true;
            }
            Outcome::Cancelled => {
                tracing::info!("execution cancelled");
                result.fault = Some("cancelled".into());
            }
        }

        result
    }

    fn command(&self, spec: &CommandSpec, working_dir: &Path) -> Command {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(working_dir)
            .env_clear()
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .env("HOME", working_dir)
            .env("TMPDIR", working_dir)
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);

        let limits = spec.limits;
        // The closure only issues getrlimit/setrlimit, both async-signal-safe
        unsafe {
            command.pre_exec(move || limits.apply().map_err(io::Error::from));
        }

        command
    }
}

async fn spawn(command: &mut Command) -> io::Result<Child> {
    match command.spawn() {
        Err(e) if is_transient(&e) => {
            tracing::warn!(error = %e, "transient spawn failure, retrying once");
            tokio::time::sleep(SPAWN_RETRY_DELAY).await;
            command.spawn()
        }
        other => other,
    }
}

fn is_transient(e: &io::Error) -> bool {
    e.raw_os_error().map(Errno::from_raw).is_some_and(|errno| {
        matches!(
            errno,
            Errno::EAGAIN | Errno::ENOMEM | Errno::EMFILE | Errno::ENFILE
        )
    })
}

/// Wait up to `grace` for every reader, dropping the finished ones.
///
/// Returns whether all of them reached EOF.
async fn drain(readers: &mut Vec<JoinHandle<()>>, grace: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + grace;
    while let Some(reader) = readers.last_mut() {
        if tokio::time::timeout_at(deadline, reader).await.is_err() {
            return false;
        }
        readers.pop();
    }
    true
}

/// Drain a pipe to EOF, keeping at most `limit` bytes.
///
/// Reading continues past the limit so a chatty child never blocks on a full pipe.
fn spawn_reader<R>(mut pipe: R, capture: SharedCapture, limit: usize) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let n = match pipe.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(error = %e, "output pipe read failed");
                    break;
                }
            };

            let mut capture = capture.lock();
            let room = limit.saturating_sub(capture.bytes.len());
            if n > room {
                capture.truncated = true;
            }
            let keep = n.min(room);
            capture.bytes.extend_from_slice(&chunk[..keep]);
        }
    })
}
