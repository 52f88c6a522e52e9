//! Control client used by the CLI.
//!
//! Each call opens a fresh connection, sends one request, waits for one
//! response and closes. Nothing is retried: a missing daemon surfaces as
//! [`ControlClientError::ConnectionRefused`] immediately.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

use super::protocol::{
    ControlRequest, ControlResponse, ErrorCode, HealthResult, LogsResult, ReloadResult,
    StatusResult, StopResult, commands, encode_frame,
};

/// Errors from the control client.
#[derive(Debug, thiserror::Error)]
pub enum ControlClientError {
    #[error("no daemon is listening at {}", .path.display())]
    ConnectionRefused { path: PathBuf },

    #[error("no response from daemon within {}ms", .timeout.as_millis())]
    Timeout { timeout: Duration },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("daemon closed the connection without responding")]
    Closed,

    #[error("daemon returned {code}: {message}")]
    Daemon { code: ErrorCode, message: String },

    #[error("failed to parse response: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Typed client for the daemon's control channel.
#[derive(Debug, Clone)]
pub struct ControlClient {
    address: PathBuf,
    timeout: Duration,
}

impl ControlClient {
    pub fn new(address: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }

    pub fn address(&self) -> &Path {
        &self.address
    }

    /// Send one request and return the raw response.
    ///
    /// Error responses from the daemon are returned as `Ok` here; the typed
    /// helpers below turn them into [`ControlClientError::Daemon`].
    pub async fn request(
        &self,
        request: &ControlRequest,
    ) -> Result<ControlResponse, ControlClientError> {
        debug!(command = %request.command, address = %self.address.display(), "Sending control request");
        let timeout = self.timeout;
        match tokio::time::timeout(timeout, self.exchange(request)).await {
            Ok(result) => result,
            Err(_) => Err(ControlClientError::Timeout { timeout }),
        }
    }

    #[cfg(unix)]
    async fn exchange(
        &self,
        request: &ControlRequest,
    ) -> Result<ControlResponse, ControlClientError> {
        let stream = tokio::net::UnixStream::connect(&self.address)
            .await
            .map_err(|e| self.connect_error(e))?;
        send_and_receive(stream, request).await
    }

    #[cfg(windows)]
    async fn exchange(
        &self,
        request: &ControlRequest,
    ) -> Result<ControlResponse, ControlClientError> {
        use tokio::net::windows::named_pipe::ClientOptions;

        let stream = ClientOptions::new()
            .open(self.address.as_os_str())
            .map_err(|e| self.connect_error(e))?;
        send_and_receive(stream, request).await
    }

    fn connect_error(&self, e: io::Error) -> ControlClientError {
        match e.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => {
                ControlClientError::ConnectionRefused {
                    path: self.address.clone(),
                }
            }
            _ => ControlClientError::Io(e),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        request: ControlRequest,
    ) -> Result<T, ControlClientError> {
        let response = self.request(&request).await?;
        if let Some(error) = response.error {
            return Err(ControlClientError::Daemon {
                code: error.code,
                message: error.message,
            });
        }
        let result = response.result.unwrap_or(serde_json::Value::Null);
        Ok(serde_json::from_value(result)?)
    }

    pub async fn status(&self) -> Result<StatusResult, ControlClientError> {
        self.call(ControlRequest::new(commands::STATUS)).await
    }

    pub async fn stop(&self) -> Result<StopResult, ControlClientError> {
        self.call(ControlRequest::new(commands::STOP)).await
    }

    pub async fn reload(&self) -> Result<ReloadResult, ControlClientError> {
        self.call(ControlRequest::new(commands::RELOAD)).await
    }

    pub async fn health(&self) -> Result<HealthResult, ControlClientError> {
        self.call(ControlRequest::new(commands::HEALTH)).await
    }

    pub async fn logs(&self, limit: Option<usize>) -> Result<LogsResult, ControlClientError> {
        let mut request = ControlRequest::new(commands::LOGS);
        if let Some(limit) = limit {
            request = request.with_arg("limit", limit);
        }
        self.call(request).await
    }
}

async fn send_and_receive<S>(
    stream: S,
    request: &ControlRequest,
) -> Result<ControlResponse, ControlClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);

    writer.write_all(&encode_frame(request)?).await?;
    writer.flush().await?;

    let mut line = String::new();
    let read = BufReader::new(reader).read_line(&mut line).await?;
    if read == 0 {
        return Err(ControlClientError::Closed);
    }
    Ok(serde_json::from_str(line.trim_end())?)
}
