//! Length-prefixed framing shared by every message on a connection.
//!
//! A frame is `kind: u8`, `length: u32` (big endian), then `length` bytes of
//! body.

use crate::{Result, RoutingError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Directory join request (JSON)
    Join = 1,
    /// Peer table answering a join (JSON)
    JoinReply = 2,
    /// One serialized onion layer (bincode)
    Onion = 3,
    /// Blocked-destination update (JSON)
    Policy = 4,
    /// Empty acknowledgement
    Ack = 5,
}

impl TryFrom<u8> for FrameKind {
    type Error = RoutingError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(FrameKind::Join),
            2 => Ok(FrameKind::JoinReply),
            3 => Ok(FrameKind::Onion),
            4 => Ok(FrameKind::Policy),
            5 => Ok(FrameKind::Ack),
            other => Err(RoutingError::Protocol(format!("unknown frame kind {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(kind: FrameKind, body: Vec<u8>) -> Self {
        Self { kind, body }
    }

    pub fn ack() -> Self {
        Self::new(FrameKind::Ack, Vec::new())
    }

    pub fn json<T: Serialize>(kind: FrameKind, value: &T) -> Result<Self> {
        Ok(Self::new(kind, serde_json::to_vec(value)?))
    }

    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Bytes this frame occupies on the wire.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.body.len()
    }

    /// Fails unless this frame is of the expected kind.
    pub fn expect_kind(&self, kind: FrameKind) -> Result<()> {
        if self.kind != kind {
            return Err(RoutingError::Protocol(format!(
                "expected {:?} frame, got {:?}",
                kind, self.kind
            )));
        }
        Ok(())
    }
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let length = u32::try_from(frame.body.len())
        .map_err(|_| RoutingError::Protocol("frame body exceeds u32 length".into()))?;

    let mut header = [0u8; HEADER_LEN];
    header[0] = frame.kind as u8;
    header[1..].copy_from_slice(&length.to_be_bytes());

    writer.write_all(&header).await?;
    writer.write_all(&frame.body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame, rejecting bodies larger than `max_body` before allocating.
pub async fn read_frame<R>(reader: &mut R, max_body: usize) -> Result<Frame>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let kind = FrameKind::try_from(header[0])?;
    let length = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if length > max_body {
        return Err(RoutingError::Protocol(format!(
            "frame of {length} bytes exceeds limit of {max_body}"
        )));
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    Ok(Frame { kind, body })
}
