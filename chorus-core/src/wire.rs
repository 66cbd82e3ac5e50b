//! Length-prefixed packet framing over any byte-oriented duplex stream.
//!
//! Each frame is a `u32` big-endian length followed by the bincode-encoded
//! [`Packet`]. The codec assumes the underlying transport preserves byte
//! order and delivers a private stream per peer connection; handshake and TLS
//! concerns live below this layer.

use crate::{ChorusError, Packet, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

/// Upper bound on one frame; a snapshot of the full state must fit.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

pub struct FramedReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub async fn read_packet(&mut self) -> Result<Packet> {
        let length = self
            .inner
            .read_u32()
            .await
            .map_err(|e| ChorusError::network(format!("failed to read frame length: {}", e)))?;

        if length as usize > MAX_FRAME_SIZE {
            return Err(ChorusError::network(format!(
                "frame too large: {} bytes",
                length
            )));
        }

        let mut payload = vec![0u8; length as usize];
        self.inner
            .read_exact(&mut payload)
            .await
            .map_err(|e| ChorusError::network(format!("failed to read frame payload: {}", e)))?;

        Ok(bincode::deserialize(&payload)?)
    }
}

pub struct FramedWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FramedWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        let encoded = bincode::serialize(packet)?;
        if encoded.len() > MAX_FRAME_SIZE {
            return Err(ChorusError::network(format!(
                "packet too large: {} bytes",
                encoded.len()
            )));
        }

        self.inner
            .write_u32(encoded.len() as u32)
            .await
            .map_err(|e| ChorusError::network(format!("failed to write frame length: {}", e)))?;
        self.inner
            .write_all(&encoded)
            .await
            .map_err(|e| ChorusError::network(format!("failed to write frame payload: {}", e)))?;
        self.inner
            .flush()
            .await
            .map_err(|e| ChorusError::network(format!("failed to flush frame: {}", e)))?;
        Ok(())
    }
}

/// Split a duplex stream into a framed reader/writer pair.
pub fn framed<S>(stream: S) -> (FramedReader<ReadHalf<S>>, FramedWriter<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite,
{
    let (read_half, write_half) = tokio::io::split(stream);
    (FramedReader::new(read_half), FramedWriter::new(write_half))
}
