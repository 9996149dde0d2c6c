//! Local stream sockets for the control plane.
//!
//! Unix domain sockets on unix, named pipes on Windows. Both sides of the
//! protocol drive a connection through [`run_connection`], which reads
//! newline-delimited messages and writes whatever is queued in the outbox.

use super::address::ControlAddress;
use super::codec::{encode, ControlDecoder, ControlMessage};
use crate::config::ControlConfig;
use crate::Result;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Byte stream of one control connection.
pub trait ControlIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ControlIo for T {}

pub type ControlStream = Box<dyn ControlIo>;

/// Listener bound to a control address.
///
/// Binding fails with [`io::ErrorKind::AddrInUse`] while another listener (or
/// a stale socket file) holds the address.
pub struct ControlListener {
    #[cfg(unix)]
    inner: tokio::net::UnixListener,
    #[cfg(windows)]
    pipe_name: String,
    #[cfg(windows)]
    next: tokio::net::windows::named_pipe::NamedPipeServer,
}

impl ControlListener {
    #[cfg(unix)]
    pub fn bind(addr: &ControlAddress) -> io::Result<Self> {
        let inner = tokio::net::UnixListener::bind(addr.path())?;
        Ok(Self { inner })
    }

    #[cfg(windows)]
    pub fn bind(addr: &ControlAddress) -> io::Result<Self> {
        use tokio::net::windows::named_pipe::ServerOptions;

        let pipe_name = addr.path().to_string_lossy().into_owned();
        let next = ServerOptions::new()
            .first_pipe_instance(true)
            .create(&pipe_name)
            .map_err(|e| match e.kind() {
                io::ErrorKind::PermissionDenied => io::Error::new(io::ErrorKind::AddrInUse, e),
                _ => e,
            })?;
        Ok(Self { pipe_name, next })
    }

    #[cfg(unix)]
    pub async fn accept(&mut self) -> io::Result<ControlStream> {
        let (stream, _) = self.inner.accept().await?;
        Ok(Box::new(stream))
    }

    #[cfg(windows)]
    pub async fn accept(&mut self) -> io::Result<ControlStream> {
        use tokio::net::windows::named_pipe::ServerOptions;

        self.next.connect().await?;
        let replacement = ServerOptions::new().create(&self.pipe_name)?;
        let connected = std::mem::replace(&mut self.next, replacement);
        Ok(Box::new(connected))
    }
}

/// Open a connection to a control address.
#[cfg(unix)]
pub async fn connect(addr: &ControlAddress) -> io::Result<ControlStream> {
    let stream = tokio::net::UnixStream::connect(addr.path()).await?;
    Ok(Box::new(stream))
}

#[cfg(windows)]
pub async fn connect(addr: &ControlAddress) -> io::Result<ControlStream> {
    use tokio::net::windows::named_pipe::ClientOptions;

    let client = ClientOptions::new().open(addr.path())?;
    Ok(Box::new(client))
}

/// Something queued for the writing side of a connection.
#[derive(Debug)]
pub enum Outbound {
    Message(ControlMessage),
    /// Flush, shut the connection down and acknowledge once done.
    Close(Option<oneshot::Sender<()>>),
}

/// How a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEnd {
    /// The peer closed the stream or it failed.
    Peer,
    /// This side asked for the close.
    Local,
}

pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, msg: &ControlMessage) -> Result<()> {
    let bytes = encode(msg)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Drive one connection until either side closes it.
///
/// Decoded messages are handed to `on_message` in arrival order; returning
/// `false` stops reading and ends the connection.
pub async fn run_connection<F>(
    stream: ControlStream,
    mut outbox: mpsc::UnboundedReceiver<Outbound>,
    mut on_message: F,
) -> ConnectionEnd
where
    F: FnMut(ControlMessage) -> bool,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut decoder = ControlDecoder::default();
    let mut buf = vec![0u8; ControlConfig::READ_CHUNK_SIZE];

    loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                let (messages, eof) = match read {
                    Ok(0) => (decoder.finish(), true),
                    Ok(n) => (decoder.feed(&buf[..n]), false),
                    Err(e) => {
                        debug!("Control connection read failed: {}", e);
                        (decoder.finish(), true)
                    }
                };
                for msg in messages {
                    if !on_message(msg) {
                        let _ = writer.shutdown().await;
                        return ConnectionEnd::Local;
                    }
                }
                if eof {
                    return ConnectionEnd::Peer;
                }
            }
            queued = outbox.recv() => match queued {
                Some(Outbound::Message(msg)) => {
                    if let Err(e) = write_message(&mut writer, &msg).await {
                        debug!("Control connection write failed: {}", e);
                        return ConnectionEnd::Peer;
                    }
                }
                Some(Outbound::Close(ack)) => {
                    let _ = writer.shutdown().await;
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                    return ConnectionEnd::Local;
                }
                None => {
                    let _ = writer.shutdown().await;
                    return ConnectionEnd::Local;
                }
            }
        }
    }
}
