use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use ibp_protocol::Message;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::{ServerTransport, Transport};
use crate::error::TransportError;

/// Newline-delimited JSON over one Unix stream.
struct LineChannel {
    reader: Mutex<Option<Lines<BufReader<OwnedReadHalf>>>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    connected: AtomicBool,
    closed: CancellationToken,
}

impl LineChannel {
    fn new() -> Self {
        Self {
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
            closed: CancellationToken::new(),
        }
    }

    fn with_stream(stream: UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: Mutex::new(Some(BufReader::new(reader).lines())),
            writer: Mutex::new(Some(writer)),
            connected: AtomicBool::new(true),
            closed: CancellationToken::new(),
        }
    }

    async fn attach(&self, stream: UnixStream) {
        let (reader, writer) = stream.into_split();
        *self.reader.lock().await = Some(BufReader::new(reader).lines());
        *self.writer.lock().await = Some(writer);
        self.connected.store(true, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.closed.is_cancelled()
    }

    async fn send(&self, message: &Message) -> Result<(), TransportError> {
        let json = message.encode()?;

        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(TransportError::NotConnected)?;

        trace!(kind = %message.kind(), len = json.len(), "send");
        let mut line = json.into_bytes();
        line.push(b'\n');

        if let Err(e) = write_line(writer, &line).await {
            self.connected.store(false, Ordering::SeqCst);
            return Err(TransportError::Io(e));
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Message, TransportError> {
        let mut reader = self.reader.lock().await;
        let lines = reader.as_mut().ok_or(TransportError::NotConnected)?;

        loop {
            let line = tokio::select! {
                _ = self.closed.cancelled() => return Err(TransportError::Closed),
                line = lines.next_line() => line?,
            };

            let Some(line) = line else {
                debug!("Peer closed connection");
                self.connected.store(false, Ordering::SeqCst);
                return Err(TransportError::Closed);
            };

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            trace!(line_len = line.len(), "recv");
            return Ok(Message::decode(line)?);
        }
    }

    async fn shutdown(&self) {
        self.closed.cancel();
        self.connected.store(false, Ordering::SeqCst);

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.reader.lock().await.take();
    }
}

async fn write_line(writer: &mut OwnedWriteHalf, line: &[u8]) -> std::io::Result<()> {
    writer.write_all(line).await?;
    writer.flush().await
}

/// Client end of the watch socket.
pub struct UnixSocketTransport {
    channel: LineChannel,
}

impl UnixSocketTransport {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, TransportError> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).await?;
        debug!(socket = ?path, "Connected");
        Ok(Self {
            channel: LineChannel::with_stream(stream),
        })
    }
}

#[async_trait]
impl Transport for UnixSocketTransport {
    async fn send(&self, message: &Message) -> Result<(), TransportError> {
        self.channel.send(message).await
    }

    async fn recv(&self) -> Result<Message, TransportError> {
        self.channel.recv().await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.channel.shutdown().await;
        Ok(())
    }
}

/// Server end of the watch socket. Accepts a single peer, after which the
/// listener is dropped and further connection attempts are refused.
pub struct UnixSocketServer {
    path: StdMutex<Option<PathBuf>>,
    listener: StdMutex<Option<Arc<UnixListener>>>,
    channel: LineChannel,
}

impl Default for UnixSocketServer {
    fn default() -> Self {
        Self::new()
    }
}

impl UnixSocketServer {
    pub fn new() -> Self {
        Self {
            path: StdMutex::new(None),
            listener: StdMutex::new(None),
            channel: LineChannel::new(),
        }
    }
}

#[async_trait]
impl Transport for UnixSocketServer {
    async fn send(&self, message: &Message) -> Result<(), TransportError> {
        self.channel.send(message).await
    }

    async fn recv(&self) -> Result<Message, TransportError> {
        self.channel.recv().await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.channel.shutdown().await;
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let path = self.path.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(path) = path {
            match fs::remove_file(&path) {
                Ok(()) => debug!(socket = ?path, "Removed socket"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ServerTransport for UnixSocketServer {
    fn serve(&self, address: &Path) -> Result<(), TransportError> {
        if address.exists() {
            fs::remove_file(address)?;
        }
        if let Some(parent) = address.parent() {
            fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(address)?;
        info!(socket = ?address, "Listening for connections");

        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(listener));
        *self.path.lock().unwrap_or_else(PoisonError::into_inner) = Some(address.to_path_buf());
        Ok(())
    }

    async fn accept(&self) -> Result<(), TransportError> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(TransportError::NotAccepted)?;

        let (stream, _) = tokio::select! {
            _ = self.channel.closed.cancelled() => return Err(TransportError::NotAccepted),
            accepted = listener.accept() => accepted?,
        };

        self.channel.attach(stream).await;
        debug!("Client connected");
        Ok(())
    }

    fn has_connection(&self) -> bool {
        self.channel.is_connected()
    }
}
