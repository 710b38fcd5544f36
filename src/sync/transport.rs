//! TCP transport layer for sync communication
//!
//! Provides the framed stream used between leader and followers:
//! - Magic header exchange on connect
//! - Length-prefixed JSON frames
//! - LZ4 compression for large payloads
//! - Per-connection writer tasks fed through a channel

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::protocol::{PeerId, SyncMessage};

/// Protocol header sent by the connecting side before the first frame
pub const MAGIC: &[u8; 11] = b"peersync-v1";

/// Maximum frame size (16 MB)
const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Compression threshold (64 KB)
const COMPRESSION_THRESHOLD: usize = 64 * 1024;

/// Error type for transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Invalid protocol header")]
    InvalidHeader,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(u32),

    #[error("Disconnected")]
    Disconnected,
}

/// Connect to a leader and send the protocol header
pub async fn connect(addr: &str, timeout: Duration) -> Result<TcpStream, TransportError> {
    debug!("Connecting to {}", addr);

    let mut stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(TransportError::ConnectionFailed(format!("{}: {}", addr, e)));
        }
        Err(_) => {
            return Err(TransportError::ConnectionFailed(format!(
                "{}: timed out after {:?}",
                addr, timeout
            )));
        }
    };

    stream.set_nodelay(true)?;
    stream.write_all(MAGIC).await?;
    stream.flush().await?;

    debug!("Magic header sent to {}", addr);
    Ok(stream)
}

/// Verify the protocol header of an accepted connection
pub async fn accept_handshake<T>(stream: &mut T) -> Result<(), TransportError>
where
    T: tokio::io::AsyncRead + Unpin,
{
    let mut magic = [0u8; MAGIC.len()];
    stream.read_exact(&mut magic).await?;

    if &magic != MAGIC {
        return Err(TransportError::InvalidHeader);
    }
    Ok(())
}

/// Write a message to a stream
pub async fn write_message<T>(stream: &mut T, msg: &SyncMessage) -> Result<(), TransportError>
where
    T: tokio::io::AsyncWrite + Unpin,
{
    let payload = msg
        .encode()
        .map_err(|e| TransportError::Encode(e.to_string()))?;

    // Compress if large
    let (data, compressed) = if payload.len() > COMPRESSION_THRESHOLD {
        let compressed = lz4_flex::compress_prepend_size(&payload);
        (compressed, true)
    } else {
        (payload, false)
    };

    // Write: [compressed_flag: 1 byte] [length: 4 bytes BE] [data]
    let len = u32::try_from(data.len()).unwrap_or(u32::MAX);
    if len > MAX_MESSAGE_SIZE {
        return Err(TransportError::MessageTooLarge(len));
    }

    let mut header = [0u8; 5];
    header[0] = u8::from(compressed);
    header[1..5].copy_from_slice(&len.to_be_bytes());

    stream.write_all(&header).await?;
    stream.write_all(&data).await?;
    stream.flush().await?;

    Ok(())
}

/// Read a message from a stream
///
/// A clean close of the stream before a header is read yields
/// [`TransportError::Disconnected`].
pub async fn read_message<T>(stream: &mut T) -> Result<SyncMessage, TransportError>
where
    T: tokio::io::AsyncRead + Unpin,
{
    // Read header
    let mut header = [0u8; 5];
    if let Err(e) = stream.read_exact(&mut header).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(TransportError::Disconnected);
        }
        return Err(TransportError::Io(e));
    }

    let compressed = header[0] == 1;
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);

    if len > MAX_MESSAGE_SIZE {
        return Err(TransportError::MessageTooLarge(len));
    }

    // Read payload
    let mut data = vec![0u8; len as usize];
    stream.read_exact(&mut data).await?;

    // Decompress if needed
    let payload = if compressed {
        lz4_flex::decompress_size_prepended(&data)
            .map_err(|e| TransportError::Decode(format!("Decompression failed: {}", e)))?
    } else {
        data
    };

    SyncMessage::decode(&payload).map_err(|e| TransportError::Decode(e.to_string()))
}

/// Sending side of a connection
///
/// Messages are queued on an unbounded channel and written in order by a
/// dedicated task, so handlers never hold the socket across an await.
#[derive(Debug, Clone)]
pub struct PeerLink {
    pub peer_id: PeerId,
    pub addr: SocketAddr,
    tx: mpsc::UnboundedSender<SyncMessage>,
}

impl PeerLink {
    /// Spawn the writer task for `writer` and return the link feeding it
    pub fn spawn(
        peer_id: PeerId,
        addr: SocketAddr,
        mut writer: OwnedWriteHalf,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<SyncMessage>();
        let label = peer_id.clone();

        let handle = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write_message(&mut writer, &msg).await {
                    debug!("Writer for {} stopped on {}: {}", label, msg.event(), e);
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        (Self { peer_id, addr, tx }, handle)
    }

    /// Queue a message for this peer
    pub fn send(&self, msg: SyncMessage) -> Result<(), TransportError> {
        self.tx.send(msg).map_err(|_| TransportError::Disconnected)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
