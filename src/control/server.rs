//! Control server for Unix sockets (Linux/macOS) and Named Pipes (Windows)
//!
//! Listens for incoming control connections and dispatches line-delimited
//! JSON requests to the handler.

use crate::control::{ApiError, ApiRequest, ApiResponse, CommandHandler};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tracing::{debug, error, info};

/// Default socket path for Unix systems.
#[cfg(unix)]
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/meshnode-agent.sock";

/// Default pipe name for Windows.
#[cfg(windows)]
pub const DEFAULT_PIPE_NAME: &str = r"\\.\pipe\meshnode-agent";

/// Control server manages the control API socket/pipe.
pub struct ControlServer {
    socket_path: PathBuf,
    handler: Arc<CommandHandler>,
}

impl ControlServer {
    /// Create a new control server.
    pub fn new(socket_path: PathBuf, handler: Arc<CommandHandler>) -> Self {
        Self {
            socket_path,
            handler,
        }
    }

    /// Start the control server. Runs until the listener errors or the
    /// process is signalled; callers wrap this in a `tokio::select!` against
    /// their own cancellation token.
    #[cfg(unix)]
    pub async fn start(&self) -> Result<(), ApiError> {
        info!("control: starting server at {:?}", self.socket_path);

        if self.socket_path.exists() {
            info!("control: removing stale socket at {:?}", self.socket_path);
            std::fs::remove_file(&self.socket_path)
                .map_err(|e| ApiError::InternalError(format!("failed to remove stale socket: {}", e)))?;
        }

        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ApiError::InternalError(format!("failed to create socket directory: {}", e)))?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .map_err(|e| ApiError::InternalError(format!("failed to bind unix socket: {}", e)))?;

        info!("control: listening at {:?}", self.socket_path);

        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let handler = self.handler.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, handler).await {
                            error!("control: connection handler error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("control: failed to accept connection: {}", e);
                }
            }
        }
    }

    /// Start the control server (Windows).
    #[cfg(windows)]
    pub async fn start(&self) -> Result<(), ApiError> {
        Err(ApiError::InternalError("windows named-pipe server not yet implemented".to_string()))
    }

    /// Remove the socket file. Idempotent.
    #[cfg(unix)]
    pub async fn shutdown(&self) -> Result<(), ApiError> {
        info!("control: shutting down server");
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .map_err(|e| ApiError::InternalError(format!("failed to remove socket: {}", e)))?;
        }
        Ok(())
    }

    /// Shutdown (Windows stub).
    #[cfg(windows)]
    pub async fn shutdown(&self) -> Result<(), ApiError> {
        info!("control: shutting down server");
        Ok(())
    }
}

#[cfg(unix)]
async fn handle_connection(
    stream: tokio::net::UnixStream,
    handler: Arc<CommandHandler>,
) -> Result<(), ApiError> {
    debug!("control: new client connection");

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();

        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("control: client disconnected");
                break;
            }
            Ok(_) => {
                let request_str = line.trim();
                if request_str.is_empty() {
                    continue;
                }

                debug!("control: received request: {}", request_str);

                let response = match ApiRequest::from_json(request_str) {
                    Ok(request) => handler.handle_request(request).await,
                    Err(e) => {
                        error!("control: failed to parse request: {}", e);
                        ApiResponse::error("unknown".to_string(), ApiError::ParseError(e.to_string()))
                    }
                };

                let response_str = response
                    .to_json()
                    .map_err(|e| ApiError::InternalError(format!("failed to serialize response: {}", e)))?;

                writer
                    .write_all(response_str.as_bytes())
                    .await
                    .map_err(|e| ApiError::InternalError(format!("failed to write response: {}", e)))?;
                writer
                    .write_all(b"\n")
                    .await
                    .map_err(|e| ApiError::InternalError(format!("failed to write newline: {}", e)))?;
                writer
                    .flush()
                    .await
                    .map_err(|e| ApiError::InternalError(format!("failed to flush response: {}", e)))?;
            }
            Err(e) => {
                error!("control: failed to read from socket: {}", e);
                break;
            }
        }
    }

    Ok(())
}
