//! Boundary response and the daemon wire protocol
//!
//! Frames are a 4-byte big-endian length followed by a MessagePack body with
//! named fields.

use crate::engine::EngineStatus;
use crate::language::LanguageInfo;
use crate::result::{ErrorKind, ExecutionResult, Stage};
use crate::{FuturideError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default ceiling on a single frame body
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// What the web layer receives for one execute call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    /// Program stdout, or the markup itself for html
    pub output: String,
    pub error: Option<String>,
    pub success: bool,
    pub kind: Option<ErrorKind>,
    pub timed_out: bool,
    pub exit_code: Option<i32>,
}

impl ExecuteResponse {
    /// Build the response for a finished execution.
    ///
    /// `timeout` is the limit that applied to the stage the result came from.
    #[must_use]
    pub fn from_result(result: ExecutionResult, timeout: Duration) -> Self {
        let kind = result.error_kind();
        let error = match kind {
            None => non_empty(result.stderr),
            Some(ErrorKind::ExecutionTimeout) => Some(format!(
                "Execution timed out after {}s",
                timeout.as_secs()
            )),
            Some(ErrorKind::CompileFailed) => non_empty(result.stderr)
                .or_else(|| Some("Compilation failed".into())),
            Some(ErrorKind::ExecutionFailed) => non_empty(result.stderr).or_else(|| {
                Some(match (result.exit_code, result.signal) {
                    (Some(code), _) => format!("Process exited with status {code}"),
                    (None, Some(signal)) => format!("Process killed by signal {signal}"),
                    (None, None) => "Process exited abnormally".into(),
                })
            }),
            Some(_) => Some(crate::error::INTERNAL_ERROR_MESSAGE.into()),
        };

        // A failed compile has no program output to show
        let output = if matches!(result.stage, Stage::Compile) {
            String::new()
        } else {
            result.stdout
        };

        Self {
            output,
            error,
            success: kind.is_none(),
            kind,
            timed_out: result.timed_out,
            exit_code: result.exit_code,
        }
    }

    /// Response for a request rejected before or instead of running
    #[must_use]
    pub fn from_error(err: &FuturideError) -> Self {
        Self {
            output: String::new(),
            error: Some(err.public_message()),
            success: false,
            kind: Some(err.kind()),
            timed_out: false,
            exit_code: None,
        }
    }
}

fn non_empty(text: String) -> Option<String> {
    (!text.trim().is_empty()).then_some(text)
}

/// Request types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// Execute code on behalf of a client
    Execute {
        code: String,
        /// Kept as text so an unknown name is reported as invalid input
        language: String,
        client_id: String,
    },
    /// List supported languages
    Languages,
    /// Engine status
    Status,
    /// Ping
    Ping,
}

/// Response types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    /// Execution result
    Execute(ExecuteResponse),
    /// Supported languages
    Languages { languages: Vec<LanguageInfo> },
    /// Engine status
    Status {
        active: usize,
        max_concurrent: usize,
        tracked_clients: usize,
    },
    /// Pong
    Pong,
    /// Error
    Error { message: String },
}

impl From<EngineStatus> for Response {
    fn from(status: EngineStatus) -> Self {
        Self::Status {
            active: status.active,
            max_concurrent: status.max_concurrent,
            tracked_clients: status.tracked_clients,
        }
    }
}

/// Encode a message to msgpack
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(msg).map_err(|e| FuturideError::Protocol(format!("encode: {e}")))
}

/// Decode a message from msgpack
pub fn decode<'a, T: Deserialize<'a>>(data: &'a [u8]) -> Result<T> {
    rmp_serde::from_slice(data).map_err(|e| FuturideError::Protocol(format!("decode: {e}")))
}

/// Read one frame. `Ok(None)` means the peer closed the stream between frames.
pub async fn read_frame<R>(reader: &mut R, max_bytes: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > max_bytes {
        return Err(FuturideError::Protocol(format!(
            "frame too large: {len} bytes (max {max_bytes})"
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Write one frame and flush
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(body.len())
        .map_err(|_| FuturideError::Protocol(format!("frame too large: {} bytes", body.len())))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Encode and send a message
pub async fn send<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    write_frame(writer, &encode(msg)?).await
}

/// Receive and decode a message. `Ok(None)` on a clean close.
pub async fn recv<R, T>(reader: &mut R, max_bytes: usize) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    match read_frame(reader, max_bytes).await? {
        Some(body) => decode(&body).map(Some),
        None => Ok(None),
    }
}
