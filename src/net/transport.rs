//! Framed wire transport.
//!
//! Length-prefixed bincode frames over any async byte stream. The size
//! guard runs before decode on both directions; an oversized frame is a
//! connection-fatal protocol fault. `duplex_pair` builds two connected
//! in-memory ends for tests and in-process wiring.

use super::messages::{Msg, MAX_MSG_SIZE};
use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

#[derive(Debug, Error)]
pub enum NetError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("decode: {0}")]
    Decode(String),
    #[error("message too large: {size} bytes (max {max})")]
    Oversized { size: usize, max: usize },
    #[error("connection closed")]
    Closed,
}

async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Msg, NetError> {
    let mut len_buf = [0u8; 4];
    if let Err(e) = r.read_exact(&mut len_buf).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(NetError::Closed);
        }
        return Err(NetError::Io(e));
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_MSG_SIZE {
        return Err(NetError::Oversized { size: len, max: MAX_MSG_SIZE });
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    bincode::deserialize(&buf).map_err(|e| NetError::Decode(e.to_string()))
}

async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, msg: &Msg) -> Result<(), NetError> {
    let bytes = bincode::serialize(msg).map_err(|e| NetError::Decode(e.to_string()))?;
    if bytes.len() > MAX_MSG_SIZE {
        return Err(NetError::Oversized { size: bytes.len(), max: MAX_MSG_SIZE });
    }
    w.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
    w.write_all(&bytes).await?;
    w.flush().await?;
    Ok(())
}

#[async_trait]
pub trait MsgReader: Send {
    async fn read_msg(&mut self) -> Result<Msg, NetError>;
}

#[async_trait]
pub trait MsgWriter: Send {
    async fn write_msg(&mut self, msg: &Msg) -> Result<(), NetError>;
}

/// Both directions of one connection; used whole during the handshake,
/// then split into reader and writer halves.
pub struct FramedConn<S> {
    io: S,
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin + 'static> FramedConn<S> {
    pub fn new(io: S) -> Self {
        Self { io }
    }

    pub async fn read_msg(&mut self) -> Result<Msg, NetError> {
        read_frame(&mut self.io).await
    }

    pub async fn write_msg(&mut self, msg: &Msg) -> Result<(), NetError> {
        write_frame(&mut self.io, msg).await
    }

    pub fn split(self) -> (Box<dyn MsgReader>, Box<dyn MsgWriter>) {
        let (r, w) = tokio::io::split(self.io);
        (Box::new(FramedReader { r }), Box::new(FramedWriter { w }))
    }
}

struct FramedReader<S> {
    r: ReadHalf<S>,
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Send + 'static> MsgReader for FramedReader<S> {
    async fn read_msg(&mut self) -> Result<Msg, NetError> {
        read_frame(&mut self.r).await
    }
}

struct FramedWriter<S> {
    w: WriteHalf<S>,
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Send + 'static> MsgWriter for FramedWriter<S> {
    async fn write_msg(&mut self, msg: &Msg) -> Result<(), NetError> {
        write_frame(&mut self.w, msg).await
    }
}

/// Two connected in-memory connections (ours, theirs).
pub fn duplex_pair() -> (FramedConn<DuplexStream>, FramedConn<DuplexStream>) {
    let (a, b) = tokio::io::duplex(MAX_MSG_SIZE);
    (FramedConn::new(a), FramedConn::new(b))
}
