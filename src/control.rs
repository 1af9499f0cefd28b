//! TCP control endpoint: one JSON command in, one `{"return": ...}` out.

use crate::command::{ControlCommand, ControlReply};
use crate::inbox::InboxHandle;
use bytes::BytesMut;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Largest command accepted on one connection.
pub const MAX_COMMAND_BYTES: usize = 1024;

const READ_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
/// How long in-flight replies may take once the listener is told to stop.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid command: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("command exceeds {MAX_COMMAND_BYTES} bytes")]
    TooLarge,
    #[error("connection closed before a command arrived")]
    Empty,
    #[error("timed out waiting for a command")]
    Timeout,
}

pub struct ControlListener {
    listener: TcpListener,
    max_connections: usize,
}

impl ControlListener {
    pub fn bind(addr: SocketAddr, max_connections: usize) -> Result<Self, ControlError> {
        let socket = socket2::Socket::new(
            if addr.is_ipv4() {
                socket2::Domain::IPV4
            } else {
                socket2::Domain::IPV6
            },
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        // restarts must not wait out TIME_WAIT
        socket.set_reuse_address(true)?;
        if addr.is_ipv6() {
            socket.set_only_v6(false)?;
        }
        socket.bind(&addr.into())?;
        socket.listen(128)?;
        socket.set_nonblocking(true)?;

        let std_listener: std::net::TcpListener = socket.into();
        let listener = TcpListener::from_std(std_listener)?;
        Ok(Self {
            listener,
            max_connections,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ControlError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until `stop` fires or its sender is dropped, then
    /// gives in-flight handlers `DRAIN_TIMEOUT` to write their replies.
    /// `ready` fires once, before the first accept.
    pub async fn serve(
        self,
        inbox: InboxHandle,
        ready: oneshot::Sender<()>,
        mut stop: oneshot::Receiver<()>,
    ) {
        match self.local_addr() {
            Ok(addr) => info!("Control listener on {}", addr),
            Err(e) => warn!("Control listener address unavailable: {}", e),
        }
        if ready.send(()).is_err() {
            debug!("Nobody waiting for the listener to become ready");
        }

        let permits = Arc::new(Semaphore::new(self.max_connections));
        let mut handlers = JoinSet::new();
        loop {
            let permit = tokio::select! {
                _ = &mut stop => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let accepted = tokio::select! {
                _ = &mut stop => break,
                accepted = self.listener.accept() => accepted,
            };
            let (mut stream, peer) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Control accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            let inbox = inbox.clone();
            handlers.spawn(async move {
                if let Err(e) = handle_connection(&mut stream, &inbox).await {
                    debug!("Control connection from {} failed: {}", peer, e);
                }
                drop(permit);
            });
            while handlers.try_join_next().is_some() {}
        }

        drop(self.listener);
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while handlers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "Dropping {} control connection(s) still open at shutdown",
                handlers.len()
            );
        }
    }
}

/// Reads one command, waits for the Controller to apply it, writes the reply.
async fn handle_connection<S>(stream: &mut S, inbox: &InboxHandle) -> Result<(), ControlError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let reply = match tokio::time::timeout(READ_TIMEOUT, read_command(stream)).await {
        Ok(Ok(command)) => inbox.submit(command).await,
        Ok(Err(e)) => ControlReply::Error(e.to_string()),
        Err(_) => ControlReply::Error(ControlError::Timeout.to_string()),
    };
    stream.write_all(&reply.to_wire()).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Reads until the bytes so far form a JSON document, the peer closes, or
/// `MAX_COMMAND_BYTES` have arrived.
pub async fn read_command<R>(reader: &mut R) -> Result<ControlCommand, ControlError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(MAX_COMMAND_BYTES);
    let mut chunk = [0u8; 256];
    loop {
        let room = (MAX_COMMAND_BYTES - buf.len()).min(chunk.len());
        let n = reader.read(&mut chunk[..room]).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        match serde_json::from_slice::<Value>(&buf) {
            Ok(value) => return Ok(ControlCommand::from_value(value)?),
            Err(e) if e.is_eof() => {}
            Err(e) => return Err(e.into()),
        }
        if buf.len() >= MAX_COMMAND_BYTES {
            return Err(ControlError::TooLarge);
        }
    }
    if buf.iter().all(u8::is_ascii_whitespace) {
        return Err(ControlError::Empty);
    }
    Ok(ControlCommand::parse(&buf)?)
}

/// Client side used by `linkmon ctl`.
pub async fn send_command(addr: &str, command: &Value) -> Result<Value, ControlError> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(&serde_json::to_vec(command)?).await?;
    stream.shutdown().await?;

    let mut reply = Vec::new();
    tokio::time::timeout(READ_TIMEOUT, stream.read_to_end(&mut reply))
        .await
        .map_err(|_| ControlError::Timeout)??;
    Ok(serde_json::from_slice(&reply)?)
}
