//! Framed packet transport over the subsystem byte channel.
//!
//! The connection owns the two byte pipes handed over by the SSH transport
//! for the "sftp" subsystem. Outbound packets serialize on the writer mutex
//! so a frame is never interleaved with another writer's; inbound frames are
//! consumed by exactly one reader at a time (the client during one-shot
//! operations, or the pipelined engine's receiver task) — the reader mutex
//! enforces that discipline rather than multiplexing.

use crate::sftp::wire::{Packet, MAX_MSG_LENGTH};
use ferry_platform::{FerryError, FerryResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// A full-duplex SFTP packet channel.
pub struct Connection {
    reader: Mutex<Box<dyn AsyncRead + Send + Unpin>>,
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl Connection {
    /// Wraps the subsystem byte pipes.
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Mutex::new(Box::new(reader)),
            writer: Mutex::new(Box::new(writer)),
        }
    }

    /// Sends one packet: fills the 4-byte length prefix the encoder
    /// reserved, then writes header and payload back-to-back under the
    /// writer lock.
    pub async fn send(&self, packet: &(dyn Packet + Sync)) -> FerryResult<()> {
        let mut header = packet.encode_header();
        let payload = packet.payload();
        let length = (header.len() + payload.len() - 4) as u32;
        header[..4].copy_from_slice(&length.to_be_bytes());

        let mut writer = self.writer.lock().await;
        writer.write_all(&header).await?;
        if !payload.is_empty() {
            writer.write_all(payload).await?;
        }
        writer.flush().await?;
        Ok(())
    }

    /// Receives one packet, returning its type byte and body.
    ///
    /// Validates `0 < length <= 256 KiB` before reading the body. A clean
    /// end-of-stream on the length prefix surfaces as [`FerryError::Eof`];
    /// a stream that dies inside a frame is a protocol error.
    pub async fn recv(&self) -> FerryResult<(u8, Vec<u8>)> {
        let mut reader = self.reader.lock().await;

        let mut length_bytes = [0u8; 4];
        reader
            .read_exact(&mut length_bytes)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => FerryError::Eof,
                _ => FerryError::Io(e),
            })?;
        let length = u32::from_be_bytes(length_bytes);

        if length > MAX_MSG_LENGTH {
            return Err(FerryError::Protocol(format!(
                "packet too long: {} bytes",
                length
            )));
        }
        if length == 0 {
            return Err(FerryError::Protocol("packet too short".to_string()));
        }

        let mut typ = [0u8; 1];
        reader.read_exact(&mut typ).await.map_err(unexpected_eos)?;

        let mut body = vec![0u8; length as usize - 1];
        reader.read_exact(&mut body).await.map_err(unexpected_eos)?;

        Ok((typ[0], body))
    }

    /// Shuts down the outbound pipe.
    pub async fn close(&self) -> FerryResult<()> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }
}

fn unexpected_eos(e: std::io::Error) -> FerryError {
    match e.kind() {
        std::io::ErrorKind::UnexpectedEof => {
            FerryError::Protocol("unexpected end of stream".to_string())
        }
        _ => FerryError::Io(e),
    }
}
