//! Remote file handles and the sequential transfer paths.
//!
//! A [`RemoteFile`] owns an opaque server handle and an absolute offset
//! cursor. Both transfer directions hold the handle's mutex for their entire
//! duration, so at most one transfer runs per handle and the connection's
//! receive side has a single consumer.

use super::client::SftpClient;
use super::pipeline;
use super::progress::ProgressSink;
use super::wire::{
    self, DataPacket, PacketType, ReadPacket, WritePacket,
};
use ferry_platform::{FerryError, FerryResult};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

pub(crate) struct FileState {
    pub(crate) handle: Vec<u8>,
    pub(crate) offset: u64,
}

/// How a chunk read ended. Bytes assembled before the end are always
/// handed back with it, never discarded.
#[derive(Debug)]
pub(crate) enum ChunkEnd {
    /// The requested range was filled.
    Filled,
    /// The stream ended inside the range.
    Eof,
    /// The server or channel failed inside the range.
    Failed(FerryError),
}

/// An open remote file.
///
/// Created by [`SftpClient::open`] or [`SftpClient::create`]; the server
/// handle is released by [`close`](RemoteFile::close), after which all
/// operations fail with [`FerryError::Closed`].
pub struct RemoteFile {
    client: SftpClient,
    path: String,
    state: Mutex<FileState>,
}

impl RemoteFile {
    pub(crate) fn new(client: SftpClient, path: String, handle: Vec<u8>) -> Self {
        Self {
            client,
            path,
            state: Mutex::new(FileState { handle, offset: 0 }),
        }
    }

    /// The remote path this handle was opened with.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Current offset cursor.
    pub async fn offset(&self) -> u64 {
        self.state.lock().await.offset
    }

    /// Releases the remote handle. The handle is cleared before the wire
    /// exchange, so a second close fails locally with `Closed`.
    pub async fn close(&self) -> FerryResult<()> {
        let mut state = self.state.lock().await;
        if state.handle.is_empty() {
            return Err(FerryError::Closed);
        }
        let handle = std::mem::take(&mut state.handle);
        self.client.close_handle(&handle).await?;
        debug!(path = %self.path, "closed remote file");
        Ok(())
    }

    /// Uploads bytes from `reader` starting at the current offset.
    ///
    /// `size` is the expected transfer size; it selects between the
    /// sequential path and the pipelined engine and sizes progress totals.
    /// Returns the number of bytes read from `reader`. On failure the offset
    /// cursor reflects only chunks the server acknowledged (pipelined: the
    /// lowest failed offset).
    pub async fn read_from<R>(
        &self,
        reader: &mut R,
        size: u64,
        progress: Option<&ProgressSink>,
    ) -> FerryResult<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut state = self.state.lock().await;
        if state.handle.is_empty() {
            return Err(FerryError::Closed);
        }
        let FileState { handle, offset } = &mut *state;

        if pipeline::use_pipeline(self.client.config(), size) {
            pipeline::upload(&self.client, handle.as_slice(), offset, reader, size, progress).await
        } else {
            self.read_from_sequential(handle.as_slice(), offset, reader, size, progress)
                .await
        }
    }

    async fn read_from_sequential<R>(
        &self,
        handle: &[u8],
        offset: &mut u64,
        reader: &mut R,
        size: u64,
        progress: Option<&ProgressSink>,
    ) -> FerryResult<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        let max_packet = self.client.config().max_packet as usize;
        let mut buf = vec![0u8; max_packet];
        let mut total = 0u64;
        let started = Instant::now();

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                debug!(path = %self.path, total, "upload complete");
                return Ok(total);
            }
            self.write_chunk_at(handle, *offset, &buf[..n]).await?;
            *offset += n as u64;
            total += n as u64;
            if let Some(sink) = progress {
                sink.chunk(n as u64, total, size, started.elapsed());
            }
        }
    }

    /// Sends one WRITE and awaits its STATUS.
    async fn write_chunk_at(&self, handle: &[u8], offset: u64, data: &[u8]) -> FerryResult<()> {
        let id = self.client.next_request_id();
        self.client
            .conn()
            .send(&WritePacket {
                id,
                handle,
                offset,
                data,
            })
            .await?;

        let (typ, body) = self.client.conn().recv().await?;
        match PacketType::from_u8(typ) {
            Some(PacketType::Status) => wire::status_to_result(id, &body),
            _ => Err(FerryError::Protocol(format!(
                "unimplemented packet type: got {}",
                wire::packet_name(typ)
            ))),
        }
    }

    /// Downloads bytes into `writer` starting at the current offset.
    ///
    /// `size` is a hint: it selects between the sequential path and the
    /// pipelined engine and sizes progress totals, but the transfer always
    /// runs until the server reports end-of-stream. Returns the number of
    /// bytes written. A STATUS of EOF (or OK) on a READ ends the transfer
    /// normally.
    pub async fn write_to<W>(
        &self,
        writer: &mut W,
        size: u64,
        progress: Option<&ProgressSink>,
    ) -> FerryResult<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut state = self.state.lock().await;
        if state.handle.is_empty() {
            return Err(FerryError::Closed);
        }
        let FileState { handle, offset } = &mut *state;

        if pipeline::use_pipeline(self.client.config(), size) {
            pipeline::download(&self.client, handle.as_slice(), offset, writer, size, progress)
                .await
        } else {
            self.write_to_sequential(handle.as_slice(), offset, writer, size, progress)
                .await
        }
    }

    async fn write_to_sequential<W>(
        &self,
        handle: &[u8],
        offset: &mut u64,
        writer: &mut W,
        size: u64,
        progress: Option<&ProgressSink>,
    ) -> FerryResult<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let max_packet = self.client.config().max_packet as usize;
        let mut buf = vec![0u8; max_packet];
        let mut total = 0u64;
        let started = Instant::now();

        loop {
            let (n, end) = self.read_chunk_at(handle, &mut buf, *offset).await;
            // bytes fetched before a mid-chunk failure are still delivered
            // and move the cursor, then the failure propagates
            if n > 0 {
                *offset += n as u64;
                writer.write_all(&buf[..n]).await?;
                total += n as u64;
                if let Some(sink) = progress {
                    sink.chunk(n as u64, total, size, started.elapsed());
                }
            }
            match end {
                ChunkEnd::Filled => {}
                ChunkEnd::Eof => {
                    writer.flush().await?;
                    debug!(path = %self.path, total, "download complete");
                    return Ok(total);
                }
                ChunkEnd::Failed(e) => return Err(e),
            }
        }
    }

    /// Fills `buf` from the remote file at `off`, reissuing READs for short
    /// DATA replies until the buffer is full or the stream ends. Returns the
    /// bytes assembled together with how the chunk ended; a failure after a
    /// short reply still reports the bytes already copied.
    async fn read_chunk_at(&self, handle: &[u8], buf: &mut [u8], off: u64) -> (usize, ChunkEnd) {
        let mut n = 0usize;
        while n < buf.len() {
            let id = self.client.next_request_id();
            let send_result = self
                .client
                .conn()
                .send(&ReadPacket {
                    id,
                    handle,
                    offset: off + n as u64,
                    len: (buf.len() - n) as u32,
                })
                .await;
            if let Err(e) = send_result {
                return (n, ChunkEnd::Failed(e));
            }

            let (typ, body) = match self.client.conn().recv().await {
                Ok(frame) => frame,
                Err(e) => return (n, ChunkEnd::Failed(e)),
            };
            match PacketType::from_u8(typ) {
                Some(PacketType::Status) => {
                    return match wire::status_to_result(id, &body) {
                        // OK on a READ carries no data: end of stream
                        Ok(()) | Err(FerryError::Eof) => (n, ChunkEnd::Eof),
                        Err(e) => (n, ChunkEnd::Failed(e)),
                    };
                }
                Some(PacketType::Data) => {
                    let data = match DataPacket::decode(&body) {
                        Ok(data) => data,
                        Err(e) => return (n, ChunkEnd::Failed(e)),
                    };
                    if data.id != id {
                        return (n, ChunkEnd::Failed(wire::unexpected_id(id, data.id)));
                    }
                    if data.data.is_empty() {
                        return (n, ChunkEnd::Eof);
                    }
                    let m = data.data.len().min(buf.len() - n);
                    buf[n..n + m].copy_from_slice(&data.data[..m]);
                    n += m;
                }
                _ => {
                    return (
                        n,
                        ChunkEnd::Failed(FerryError::Protocol(format!(
                            "unimplemented packet type: got {}",
                            wire::packet_name(typ)
                        ))),
                    )
                }
            }
        }
        (n, ChunkEnd::Filled)
    }
}
