//! futuride CLI - run code through the engine directly or through the daemon

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futuride_core::config::default_socket_path;
use futuride_core::protocol::{self, Request, Response, DEFAULT_MAX_FRAME_BYTES};
use futuride_core::{Engine, EngineConfig, ExecuteResponse};
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::net::UnixStream;

#[derive(Parser)]
#[command(name = "futuride")]
#[command(author, version, about = "Execute untrusted code submissions safely")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run code directly (without daemon)
    Run {
        /// Code to execute (or - for stdin)
        code: String,

        /// python, c, javascript or html
        #[arg(short, long, default_value = "python")]
        language: String,

        /// Timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Client identity used for rate limiting
        #[arg(long, default_value = "cli")]
        client: String,
    },

    /// Execute code via the daemon
    Exec {
        /// Code to execute (or - for stdin)
        code: String,

        /// python, c, javascript or html
        #[arg(short, long, default_value = "python")]
        language: String,

        /// Socket path (defaults to FUTURIDE_SOCKET env var or /run/futuride/futuride.sock)
        #[arg(short, long)]
        socket: Option<PathBuf>,

        /// Client identity used for rate limiting
        #[arg(long, default_value = "cli")]
        client: String,
    },

    /// Get daemon status
    Status {
        /// Socket path (defaults to FUTURIDE_SOCKET env var or /run/futuride/futuride.sock)
        #[arg(short, long)]
        socket: Option<PathBuf>,
    },

    /// Ping the daemon
    Ping {
        /// Socket path (defaults to FUTURIDE_SOCKET env var or /run/futuride/futuride.sock)
        #[arg(short, long)]
        socket: Option<PathBuf>,
    },

    /// List languages supported by the daemon
    Languages {
        /// Socket path (defaults to FUTURIDE_SOCKET env var or /run/futuride/futuride.sock)
        #[arg(short, long)]
        socket: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("futuride=warn".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            code,
            language,
            timeout,
            client,
        } => {
            let mut builder = EngineConfig::builder();
            if let Some(secs) = timeout {
                builder = builder.timeout(Duration::from_secs(secs));
            }
            let engine = Engine::new(builder.build())?;
            let response = engine
                .execute_text(read_code(code)?, &language, client)
                .await;
            print_execute(&response)
        }

        Commands::Exec {
            code,
            language,
            socket,
            client,
        } => {
            let request = Request::Execute {
                code: read_code(code)?,
                language,
                client_id: client,
            };
            match call(socket, &request).await? {
                Response::Execute(response) => print_execute(&response),
                other => unexpected(other),
            }
        }

        Commands::Status { socket } => match call(socket, &Request::Status).await? {
            status @ Response::Status { .. } => print_json(&status),
            other => unexpected(other),
        },

        Commands::Ping { socket } => match call(socket, &Request::Ping).await? {
            Response::Pong => {
                println!("pong");
                Ok(ExitCode::SUCCESS)
            }
            other => unexpected(other),
        },

        Commands::Languages { socket } => match call(socket, &Request::Languages).await? {
            Response::Languages { languages } => {
                for info in &languages {
                    println!("{:<12} {:<12} {}", info.id.as_str(), info.name, info.extension);
                }
                Ok(ExitCode::SUCCESS)
            }
            other => unexpected(other),
        },
    }
}

/// `-` reads the program from stdin
fn read_code(code: String) -> Result<String> {
    if code != "-" {
        return Ok(code);
    }
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .context("failed to read code from stdin")?;
    Ok(buf)
}

/// One request, one response over a fresh connection
async fn call(socket: Option<PathBuf>, request: &Request) -> Result<Response> {
    let socket = socket.unwrap_or_else(default_socket_path);
    tracing::debug!(socket = ?socket, "connecting to daemon");
    let mut stream = UnixStream::connect(&socket)
        .await
        .with_context(|| format!("failed to connect to {}", socket.display()))?;

    protocol::send(&mut stream, request).await?;
    match protocol::recv(&mut stream, DEFAULT_MAX_FRAME_BYTES).await? {
        Some(response) => Ok(response),
        None => bail!("daemon closed the connection without responding"),
    }
}

fn print_execute(response: &ExecuteResponse) -> Result<ExitCode> {
    print_json(response)?;
    Ok(if response.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<ExitCode> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(ExitCode::SUCCESS)
}

fn unexpected(response: Response) -> Result<ExitCode> {
    match response {
        Response::Error { message } => bail!("daemon error: {message}"),
        other => bail!("unexpected response: {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use futuride_core::Language;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_defaults_to_python() {
        let cli = Cli::parse_from(["futuride", "run", "print(1)"]);
        match cli.command {
            Commands::Run {
                language, client, timeout, ..
            } => {
                assert_eq!(language.parse::<Language>().unwrap(), Language::Python);
                assert_eq!(client, "cli");
                assert_eq!(timeout, None);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn literal_code_is_passed_through() {
        assert_eq!(read_code("print(1)".into()).unwrap(), "print(1)");
    }
}
