// Wire format for the socket transport: u32 big-endian length + CBOR body

use super::ReduceOp;
use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Maximum encoded frame size (512MB)
pub const FRAME_SIZE_LIMIT: usize = 512 * 1024 * 1024;

/// Message exchanged between a worker and rank 0
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// Worker introduces itself to rank 0
    Hello { rank: usize, world_size: usize },
    /// Rank 0 accepts the worker once every rank has joined
    Welcome { group_id: Uuid },
    /// Rank 0 refuses the worker
    Reject { reason: String },
    /// Buffer owned by `src`, travelling to the other ranks
    Broadcast { seq: u64, src: usize, data: Vec<f32> },
    /// Worker contribution to an all-reduce
    Reduce { seq: u64, op: ReduceOp, data: Vec<f32> },
    /// Reduced result sent back by rank 0
    Reduced { seq: u64, data: Vec<f32> },
    /// Worker reached a barrier
    Barrier { seq: u64 },
    /// Rank 0 releases a barrier
    Release { seq: u64 },
    /// Worker is tearing down its end
    Leave { rank: usize },
}

impl Frame {
    /// Short name for logs and protocol errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "hello",
            Frame::Welcome { .. } => "welcome",
            Frame::Reject { .. } => "reject",
            Frame::Broadcast { .. } => "broadcast",
            Frame::Reduce { .. } => "reduce",
            Frame::Reduced { .. } => "reduced",
            Frame::Barrier { .. } => "barrier",
            Frame::Release { .. } => "release",
            Frame::Leave { .. } => "leave",
        }
    }
}

/// Read one length-prefixed CBOR frame
pub async fn read_frame<T>(io: &mut T) -> io::Result<Frame>
where
    T: AsyncRead + Unpin,
{
    let len = io.read_u32().await? as usize;

    if len > FRAME_SIZE_LIMIT {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Frame size {} exceeds limit {}", len, FRAME_SIZE_LIMIT),
        ));
    }

    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;

    ciborium::from_reader(&buf[..]).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Write one length-prefixed CBOR frame
pub async fn write_frame<T>(io: &mut T, frame: &Frame) -> io::Result<()>
where
    T: AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    ciborium::into_writer(frame, &mut buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    if buf.len() > FRAME_SIZE_LIMIT {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Frame size {} exceeds limit {}", buf.len(), FRAME_SIZE_LIMIT),
        ));
    }

    io.write_u32(buf.len() as u32).await?;
    io.write_all(&buf).await?;
    io.flush().await?;

    Ok(())
}
