//! Control server: newline-delimited JSON over a Unix socket or named pipe.
//!
//! Each accepted connection gets its own task and serves requests one at a
//! time. Handlers reach shared daemon state only through the
//! [`ControlHandler`] they are given, so all state access funnels through
//! whatever synchronization the handler owns.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::protocol::{
    ControlRequest, ControlResponse, ErrorCode, MAX_FRAME_LEN, decode_request, encode_frame,
};
use crate::BoxFuture;
use crate::supervisor::ShutdownSignal;

/// Dispatches decoded requests. Implemented by the supervisor; tests
/// supply their own.
pub trait ControlHandler: Send + Sync + 'static {
    fn handle(&self, request: ControlRequest) -> BoxFuture<'_, ControlResponse>;
}

/// A bound control-channel listener.
///
/// Binding is the daemon's mutual-exclusion primitive: it fails with
/// [`io::ErrorKind::AddrInUse`] while another live server answers at the
/// same address.
pub struct ControlListener {
    address: PathBuf,
    #[cfg(unix)]
    inner: tokio::net::UnixListener,
    #[cfg(windows)]
    inner: tokio::net::windows::named_pipe::NamedPipeServer,
}

impl ControlListener {
    /// Bind the control channel at `address`.
    #[cfg(unix)]
    pub fn bind(address: &Path) -> io::Result<Self> {
        use std::os::unix::fs::PermissionsExt;

        if let Some(parent) = address.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if std::os::unix::net::UnixStream::connect(address).is_ok() {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("a control server is already listening at {}", address.display()),
            ));
        }
        if address.exists() {
            debug!(path = %address.display(), "Removing stale control socket");
            std::fs::remove_file(address)?;
        }

        let inner = tokio::net::UnixListener::bind(address)?;

        if let Err(e) = std::fs::set_permissions(address, std::fs::Permissions::from_mode(0o600)) {
            warn!(path = %address.display(), error = %e, "Could not restrict control socket permissions");
        }

        Ok(Self {
            address: address.to_path_buf(),
            inner,
        })
    }

    /// Bind the control channel at `address`.
    #[cfg(windows)]
    pub fn bind(address: &Path) -> io::Result<Self> {
        use tokio::net::windows::named_pipe::ServerOptions;

        let inner = ServerOptions::new()
            .first_pipe_instance(true)
            .create(address.as_os_str())
            .map_err(|e| {
                if e.kind() == io::ErrorKind::PermissionDenied {
                    io::Error::new(
                        io::ErrorKind::AddrInUse,
                        format!("a control server is already listening at {}", address.display()),
                    )
                } else {
                    e
                }
            })?;

        Ok(Self {
            address: address.to_path_buf(),
            inner,
        })
    }

    /// The address this listener is bound to.
    pub fn address(&self) -> &Path {
        &self.address
    }

    /// Stop listening without serving. Removes the socket file.
    pub fn close(self) {
        let Self { address, inner } = self;
        drop(inner);
        #[cfg(unix)]
        std::fs::remove_file(&address).ok();
        debug!(address = %address.display(), "Control listener closed");
    }
}

/// Serve control requests until a shutdown signal arrives.
///
/// The socket file is removed on return. Connections already accepted keep
/// running to completion; work a handler has started is never cancelled
/// because its client went away.
pub async fn serve(
    listener: ControlListener,
    handler: Arc<dyn ControlHandler>,
    mut shutdown_rx: broadcast::Receiver<ShutdownSignal>,
) -> io::Result<()> {
    let ControlListener { address, inner } = listener;
    info!(address = %address.display(), "Control server listening");

    let result = accept_loop(&address, inner, handler, &mut shutdown_rx).await;

    #[cfg(unix)]
    std::fs::remove_file(&address).ok();

    info!("Control server stopped");
    result
}

#[cfg(unix)]
async fn accept_loop(
    _address: &Path,
    listener: tokio::net::UnixListener,
    handler: Arc<dyn ControlHandler>,
    shutdown_rx: &mut broadcast::Receiver<ShutdownSignal>,
) -> io::Result<()> {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => spawn_connection(stream, Arc::clone(&handler)),
                    Err(e) => warn!(error = %e, "Failed to accept control connection"),
                }
            }
            _ = shutdown_rx.recv() => return Ok(()),
        }
    }
}

#[cfg(windows)]
async fn accept_loop(
    address: &Path,
    first_instance: tokio::net::windows::named_pipe::NamedPipeServer,
    handler: Arc<dyn ControlHandler>,
    shutdown_rx: &mut broadcast::Receiver<ShutdownSignal>,
) -> io::Result<()> {
    use tokio::net::windows::named_pipe::ServerOptions;

    // Each connected client takes the current pipe instance; a fresh one is
    // created before the client is handed off.
    let mut server = first_instance;
    loop {
        tokio::select! {
            connected = server.connect() => {
                connected?;
                let next = ServerOptions::new().create(address.as_os_str())?;
                let stream = std::mem::replace(&mut server, next);
                spawn_connection(stream, Arc::clone(&handler));
            }
            _ = shutdown_rx.recv() => return Ok(()),
        }
    }
}

fn spawn_connection<S>(stream: S, handler: Arc<dyn ControlHandler>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = handle_connection(stream, handler).await {
            debug!(error = %e, "Control connection ended with error");
        }
    });
}

/// Serve one connection: read frames, dispatch, write responses.
pub async fn handle_connection<S>(stream: S, handler: Arc<dyn ControlHandler>) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut frame = Vec::with_capacity(256);

    loop {
        frame.clear();
        let read = (&mut reader)
            .take(MAX_FRAME_LEN as u64 + 1)
            .read_until(b'\n', &mut frame)
            .await?;
        if read == 0 {
            return Ok(());
        }
        if frame.last() == Some(&b'\n') {
            frame.pop();
        }

        let request = match decode_request(&frame) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Rejecting malformed control frame");
                let response = ControlResponse::failure(ErrorCode::Protocol, e.to_string());
                write_response(&mut writer, &response).await?;
                writer.shutdown().await.ok();
                return Ok(());
            }
        };

        debug!(command = %request.command, "Control request");
        let response = handler.handle(request).await;
        write_response(&mut writer, &response).await?;
    }
}

async fn write_response<W>(writer: &mut W, response: &ControlResponse) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_frame(response).map_err(io::Error::other)?;
    writer.write_all(&bytes).await?;
    writer.flush().await
}

/// Convenience for handlers: an `unknown_command` response.
pub fn unknown_command(command: &str) -> ControlResponse {
    ControlResponse::failure(
        ErrorCode::UnknownCommand,
        format!("unknown command: {command}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct Echo;

    impl ControlHandler for Echo {
        fn handle(&self, request: ControlRequest) -> BoxFuture<'_, ControlResponse> {
            Box::pin(async move {
                match request.command.as_str() {
                    "echo" => ControlResponse::success(json!(request.args)),
                    other => unknown_command(other),
                }
            })
        }
    }

    async fn roundtrip(input: &[u8]) -> Vec<ControlResponse> {
        let (client, server) = tokio::io::duplex(1024 * 128);
        let task = tokio::spawn(handle_connection(server, Arc::new(Echo)));

        let (read_half, mut write_half) = tokio::io::split(client);
        write_half.write_all(input).await.unwrap();
        write_half.shutdown().await.unwrap();

        let mut lines = BufReader::new(read_half).lines();
        let mut responses = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            responses.push(serde_json::from_str(&line).unwrap());
        }
        task.await.unwrap().unwrap();
        responses
    }

    #[tokio::test]
    async fn test_sequential_requests_on_one_connection() {
        let responses = roundtrip(
            b"{\"command\":\"echo\",\"args\":{\"n\":1}}\n{\"command\":\"echo\",\"args\":{\"n\":2}}\n",
        )
        .await;
        assert_eq!(
            responses,
            vec![
                ControlResponse::success(json!({"n": 1})),
                ControlResponse::success(json!({"n": 2})),
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_command_keeps_connection_open() {
        let responses =
            roundtrip(b"{\"command\":\"nope\"}\n{\"command\":\"echo\"}\n").await;
        assert_eq!(responses.len(), 2);
        assert_eq!(
            responses[0].error.as_ref().map(|e| e.code),
            Some(ErrorCode::UnknownCommand)
        );
        assert!(responses[1].ok);
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_connection() {
        let responses = roundtrip(b"{oops\n{\"command\":\"echo\"}\n").await;
        assert_eq!(responses.len(), 1);
        assert_eq!(
            responses[0].error.as_ref().map(|e| e.code),
            Some(ErrorCode::Protocol)
        );
    }

    #[tokio::test]
    async fn test_oversized_frame_is_protocol_error() {
        let mut input = vec![b'a'; MAX_FRAME_LEN + 10];
        input.push(b'\n');
        let responses = roundtrip(&input).await;
        assert_eq!(responses.len(), 1);
        assert!(!responses[0].ok);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_second_bind_fails_while_first_is_live() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("ipc.sock");

        let first = ControlListener::bind(&path).unwrap();
        let err = ControlListener::bind(&path).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
        drop(first);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_bind_replaces_stale_socket_file() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("ipc.sock");
        std::fs::write(&path, b"stale").unwrap();

        let listener = ControlListener::bind(&path).unwrap();
        assert_eq!(listener.address(), path.as_path());
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_close_removes_socket_and_frees_address() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("ipc.sock");

        ControlListener::bind(&path).unwrap().close();
        assert!(!path.exists());
        ControlListener::bind(&path).unwrap().close();
    }
}
