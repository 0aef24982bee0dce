//! Unix socket server

use futuride_core::protocol::{self, Request, Response};
use futuride_core::{Engine, FuturideError, Language};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Accept connections until `shutdown` fires, then cancel in-flight work and
/// give connections up to `grace` to finish.
pub async fn run(
    listener: UnixListener,
    engine: Arc<Engine>,
    max_frame_bytes: usize,
    grace: Duration,
    shutdown: CancellationToken,
) {
    let connections = TaskTracker::new();

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let engine = Arc::clone(&engine);
                    let shutdown = shutdown.clone();
                    connections.spawn(async move {
                        let served =
                            handle_connection(stream, &engine, max_frame_bytes, &shutdown).await;
                        if let Err(e) = served {
                            tracing::warn!(error = %e, "connection error");
                        }
                    });
                }
                Err(e) => tracing::warn!(error = %e, "accept failed"),
            },
        }
    }

    tracing::info!(connections = connections.len(), "no longer accepting connections");
    engine.shutdown();
    connections.close();
    if tokio::time::timeout(grace, connections.wait()).await.is_err() {
        tracing::warn!(remaining = connections.len(), "connections still open after grace period");
    }
}

/// Serve one client until it disconnects or the daemon shuts down
async fn handle_connection(
    mut stream: UnixStream,
    engine: &Engine,
    max_frame_bytes: usize,
    shutdown: &CancellationToken,
) -> futuride_core::Result<()> {
    loop {
        let frame = tokio::select! {
            () = shutdown.cancelled() => break,
            frame = protocol::read_frame(&mut stream, max_frame_bytes) => frame,
        };

        let body = match frame {
            Ok(Some(body)) => body,
            Ok(None) => break,
            Err(e @ FuturideError::Protocol(_)) => {
                // The stream is no longer aligned on a frame boundary
                protocol::send(&mut stream, &error_response(&e)).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let response = match protocol::decode::<Request>(&body) {
            Ok(request) => handle_request(request, engine).await,
            Err(e) => {
                tracing::debug!(error = %e, "undecodable request");
                error_response(&e)
            }
        };

        protocol::send(&mut stream, &response).await?;
    }

    Ok(())
}

/// Handle a single request
async fn handle_request(request: Request, engine: &Engine) -> Response {
    match request {
        Request::Execute {
            code,
            language,
            client_id,
        } => Response::Execute(engine.execute_text(code, &language, client_id).await),
        Request::Languages => Response::Languages {
            languages: Language::all().map(Language::info).to_vec(),
        },
        Request::Status => engine.status().into(),
        Request::Ping => Response::Pong,
    }
}

fn error_response(err: &FuturideError) -> Response {
    Response::Error {
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futuride_core::protocol::{recv, send, DEFAULT_MAX_FRAME_BYTES};
    use futuride_core::{EngineConfig, ErrorKind};
    use std::path::Path;

    fn start(dir: &Path) -> (std::path::PathBuf, CancellationToken, tokio::task::JoinHandle<()>) {
        let socket = dir.join("futuride.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let engine = Arc::new(
            Engine::new(EngineConfig::builder().workspace_root(dir.join("ws")).build()).unwrap(),
        );
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(run(
            listener,
            engine,
            DEFAULT_MAX_FRAME_BYTES,
            Duration::from_secs(1),
            shutdown.clone(),
        ));
        (socket, shutdown, server)
    }

    async fn call(stream: &mut UnixStream, request: &Request) -> Response {
        send(stream, request).await.unwrap();
        recv(stream, DEFAULT_MAX_FRAME_BYTES).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn serves_requests_over_one_connection() {
        let dir = tempfile::tempdir().unwrap();
        let (socket, shutdown, server) = start(dir.path());
        let mut stream = UnixStream::connect(&socket).await.unwrap();

        assert!(matches!(call(&mut stream, &Request::Ping).await, Response::Pong));

        match call(&mut stream, &Request::Languages).await {
            Response::Languages { languages } => assert_eq!(languages.len(), 4),
            other => panic!("unexpected response: {other:?}"),
        }

        let execute = Request::Execute {
            code: "<h1>Test</h1>".into(),
            language: "html".into(),
            client_id: "tester".into(),
        };
        match call(&mut stream, &execute).await {
            Response::Execute(response) => {
                assert!(response.success);
                assert_eq!(response.output, "<h1>Test</h1>");
            }
            other => panic!("unexpected response: {other:?}"),
        }

        match call(&mut stream, &Request::Status).await {
            Response::Status {
                active,
                tracked_clients,
                ..
            } => {
                assert_eq!(active, 0);
                assert_eq!(tracked_clients, 1);
            }
            other => panic!("unexpected response: {other:?}"),
        }

        shutdown.cancel();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_language_is_reported_as_invalid_input() {
        let dir = tempfile::tempdir().unwrap();
        let (socket, shutdown, server) = start(dir.path());
        let mut stream = UnixStream::connect(&socket).await.unwrap();

        let execute = Request::Execute {
            code: "DISPLAY 'HI'".into(),
            language: "cobol".into(),
            client_id: "tester".into(),
        };
        match call(&mut stream, &execute).await {
            Response::Execute(response) => {
                assert_eq!(response.kind, Some(ErrorKind::InvalidInput));
            }
            other => panic!("unexpected response: {other:?}"),
        }

        shutdown.cancel();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn garbage_frames_get_an_error_response() {
        let dir = tempfile::tempdir().unwrap();
        let (socket, shutdown, server) = start(dir.path());
        let mut stream = UnixStream::connect(&socket).await.unwrap();

        protocol::write_frame(&mut stream, b"\xc1not msgpack").await.unwrap();
        let response: Response = recv(&mut stream, DEFAULT_MAX_FRAME_BYTES).await.unwrap().unwrap();
        assert!(matches!(response, Response::Error { .. }));

        // The connection stays usable
        assert!(matches!(call(&mut stream, &Request::Ping).await, Response::Pong));

        shutdown.cancel();
        server.await.unwrap();
    }
}
