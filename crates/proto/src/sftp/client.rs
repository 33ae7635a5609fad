//! SFTP client: version handshake and one-shot operations.
//!
//! Every one-shot operation allocates a fresh request id, sends the request,
//! receives exactly one reply on the same task and checks the reply type
//! against the set allowed for that request. Transfers that need the
//! pipelined engine go through [`RemoteFile`](super::file::RemoteFile),
//! which takes over the receive side for the duration of the transfer.

use super::conn::Connection;
use super::file::RemoteFile;
use super::wire::{
    self, open_flags, packet_name, FileAttributes, HandlePacket, InitPacket, NamePacket,
    OpenDirPacket, OpenPacket, PacketType, RealPathPacket, ReadDirPacket, RemovePacket,
    RmdirPacket, StatPacket, StatusPacket, VersionPacket, MkdirPacket,
};
use ferry_platform::{FerryError, FerryResult};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

/// Default payload cap for a single READ or WRITE chunk (192 KiB).
pub const DEFAULT_MAX_PACKET: u32 = 192 * 1024;

/// Default number of in-flight requests sustained by the pipelined engine.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 64;

/// SFTP client configuration.
#[derive(Debug, Clone)]
pub struct SftpClientConfig {
    /// Largest payload carried by a single READ or WRITE.
    pub max_packet: u32,
    /// In-flight request cap for pipelined transfers.
    pub max_concurrent_requests: usize,
    /// Whether transfers larger than `max_packet` use the pipelined engine.
    pub concurrent_transfers: bool,
}

impl Default for SftpClientConfig {
    fn default() -> Self {
        Self {
            max_packet: DEFAULT_MAX_PACKET,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            concurrent_transfers: true,
        }
    }
}

impl SftpClientConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-chunk payload cap.
    pub fn with_max_packet(mut self, max_packet: u32) -> Self {
        self.max_packet = max_packet;
        self
    }

    /// Sets the in-flight request cap.
    pub fn with_max_concurrent_requests(mut self, max: usize) -> Self {
        self.max_concurrent_requests = max;
        self
    }

    /// Enables or disables pipelined transfers.
    pub fn with_concurrent_transfers(mut self, enabled: bool) -> Self {
        self.concurrent_transfers = enabled;
        self
    }
}

pub(crate) struct ClientInner {
    pub(crate) conn: Connection,
    next_request_id: AtomicU32,
    pub(crate) config: SftpClientConfig,
}

/// A directory entry returned by [`SftpClient::read_dir`].
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Entry name (no path components)
    pub filename: String,
    /// Entry attributes
    pub attrs: FileAttributes,
}

/// SFTP v3 client over an established subsystem channel.
///
/// Cloning is cheap and shares the underlying connection and request-id
/// counter.
#[derive(Clone)]
pub struct SftpClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for SftpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpClient").finish_non_exhaustive()
    }
}

impl SftpClient {
    /// Connects over the given subsystem byte pipes with defaults.
    ///
    /// Performs the INIT/VERSION handshake; a server speaking any version
    /// other than 3 is rejected.
    pub async fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> FerryResult<Self> {
        Self::with_config(reader, writer, SftpClientConfig::default()).await
    }

    /// Connects with an explicit configuration.
    pub async fn with_config(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        config: SftpClientConfig,
    ) -> FerryResult<Self> {
        let client = Self {
            inner: Arc::new(ClientInner {
                conn: Connection::new(reader, writer),
                next_request_id: AtomicU32::new(1),
                config,
            }),
        };
        client.handshake().await?;
        Ok(client)
    }

    async fn handshake(&self) -> FerryResult<()> {
        debug!("initializing sftp protocol");
        self.conn()
            .send(&InitPacket {
                version: wire::SFTP_VERSION,
                extensions: vec![],
            })
            .await?;

        let (typ, body) = self.conn().recv().await.map_err(|e| match e {
            FerryError::Eof => {
                FerryError::Protocol("server closed connection during version exchange".to_string())
            }
            other => other,
        })?;

        if typ != PacketType::Version as u8 {
            return Err(wire::unexpected_packet(PacketType::Version, typ));
        }

        let version = VersionPacket::decode(&body)?.version;
        if version != wire::SFTP_VERSION {
            return Err(FerryError::Protocol(format!(
                "unexpected server version: want {}, got {}",
                wire::SFTP_VERSION,
                version
            )));
        }

        info!("sftp session established (version {})", version);
        Ok(())
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.inner.conn
    }

    pub(crate) fn config(&self) -> &SftpClientConfig {
        &self.inner.config
    }

    pub(crate) fn next_request_id(&self) -> u32 {
        self.inner.next_request_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Canonicalizes a remote path.
    ///
    /// `""`, `"~"` and `"~/"` are treated as `"."`, and a leading `"~/"` is
    /// stripped to a relative path, so callers can use shell-style home
    /// paths; everything else passes through untouched.
    pub async fn real_path(&self, path: &str) -> FerryResult<String> {
        let path = normalize_home_path(path);
        let id = self.next_request_id();
        self.conn()
            .send(&RealPathPacket {
                id,
                path: path.to_string(),
            })
            .await?;

        let (typ, body) = self.conn().recv().await?;
        match PacketType::from_u8(typ) {
            Some(PacketType::Name) => {
                let name = NamePacket::decode(&body)?;
                if name.id != id {
                    return Err(wire::unexpected_id(id, name.id));
                }
                if name.entries.len() != 1 {
                    return Err(FerryError::Protocol(format!(
                        "unexpected name count: want 1, got {}",
                        name.entries.len()
                    )));
                }
                Ok(name.entries[0].filename.clone())
            }
            Some(PacketType::Status) => Err(status_error(id, &body)),
            _ => Err(unimplemented_reply(typ)),
        }
    }

    /// Retrieves the attributes of a remote path.
    pub async fn stat(&self, path: &str) -> FerryResult<FileAttributes> {
        let id = self.next_request_id();
        self.conn()
            .send(&StatPacket {
                id,
                path: path.to_string(),
            })
            .await?;

        let (typ, body) = self.conn().recv().await?;
        match PacketType::from_u8(typ) {
            Some(PacketType::Attrs) => {
                let attrs = wire::AttrsPacket::decode(&body)?;
                if attrs.id != id {
                    return Err(wire::unexpected_id(id, attrs.id));
                }
                Ok(attrs.attrs)
            }
            Some(PacketType::Status) => Err(status_error(id, &body)),
            _ => Err(unimplemented_reply(typ)),
        }
    }

    /// True when the remote path exists and is a directory.
    pub async fn is_dir(&self, path: &str) -> FerryResult<bool> {
        Ok(self.stat(path).await?.is_dir())
    }

    /// True when the remote path exists and is a regular file.
    pub async fn is_regular(&self, path: &str) -> FerryResult<bool> {
        Ok(self.stat(path).await?.is_regular())
    }

    async fn open_with_flags(&self, path: &str, pflags: u32) -> FerryResult<RemoteFile> {
        let id = self.next_request_id();
        self.conn()
            .send(&OpenPacket {
                id,
                path: path.to_string(),
                pflags,
                attrs: FileAttributes::new(),
            })
            .await?;

        let (typ, body) = self.conn().recv().await?;
        match PacketType::from_u8(typ) {
            Some(PacketType::Handle) => {
                let handle = HandlePacket::decode(&body)?;
                if handle.id != id {
                    return Err(wire::unexpected_id(id, handle.id));
                }
                debug!(path, "opened remote file");
                Ok(RemoteFile::new(self.clone(), path.to_string(), handle.handle))
            }
            Some(PacketType::Status) => Err(status_error(id, &body)),
            _ => Err(unimplemented_reply(typ)),
        }
    }

    /// Opens a remote file for reading.
    pub async fn open(&self, path: &str) -> FerryResult<RemoteFile> {
        self.open_with_flags(path, open_flags::READ).await
    }

    /// Creates (or truncates) a remote file for writing.
    pub async fn create(&self, path: &str) -> FerryResult<RemoteFile> {
        self.open_with_flags(
            path,
            open_flags::READ | open_flags::WRITE | open_flags::CREAT | open_flags::TRUNC,
        )
        .await
    }

    /// Creates a remote directory.
    pub async fn mkdir(&self, path: &str) -> FerryResult<()> {
        let id = self.next_request_id();
        self.conn()
            .send(&MkdirPacket {
                id,
                path: path.to_string(),
                attrs: FileAttributes::new(),
            })
            .await?;
        self.recv_status(id).await
    }

    /// Opens a remote directory, returning its handle.
    pub async fn open_dir(&self, path: &str) -> FerryResult<Vec<u8>> {
        let id = self.next_request_id();
        self.conn()
            .send(&OpenDirPacket {
                id,
                path: path.to_string(),
            })
            .await?;

        let (typ, body) = self.conn().recv().await?;
        match PacketType::from_u8(typ) {
            Some(PacketType::Handle) => {
                let handle = HandlePacket::decode(&body)?;
                if handle.id != id {
                    return Err(wire::unexpected_id(id, handle.id));
                }
                Ok(handle.handle)
            }
            Some(PacketType::Status) => Err(status_error(id, &body)),
            _ => Err(unimplemented_reply(typ)),
        }
    }

    /// Lists a remote directory, filtering `.` and `..`.
    pub async fn read_dir(&self, path: &str) -> FerryResult<Vec<DirEntry>> {
        let handle = self.open_dir(path).await?;
        let result = self.read_dir_entries(&handle).await;
        let close_result = self.close_handle(&handle).await;
        let entries = result?;
        close_result?;
        debug!(path, count = entries.len(), "listed remote directory");
        Ok(entries)
    }

    async fn read_dir_entries(&self, handle: &[u8]) -> FerryResult<Vec<DirEntry>> {
        let mut entries = Vec::new();
        loop {
            let id = self.next_request_id();
            self.conn().send(&ReadDirPacket { id, handle }).await?;

            let (typ, body) = self.conn().recv().await?;
            match PacketType::from_u8(typ) {
                Some(PacketType::Name) => {
                    let name = NamePacket::decode(&body)?;
                    if name.id != id {
                        return Err(wire::unexpected_id(id, name.id));
                    }
                    for entry in name.entries {
                        if entry.filename == "." || entry.filename == ".." {
                            continue;
                        }
                        // longname parsed and discarded
                        entries.push(DirEntry {
                            filename: entry.filename,
                            attrs: entry.attrs,
                        });
                    }
                }
                Some(PacketType::Status) => {
                    return match wire::status_to_result(id, &body) {
                        Ok(()) | Err(FerryError::Eof) => Ok(entries),
                        Err(e) => Err(e),
                    };
                }
                _ => return Err(unimplemented_reply(typ)),
            }
        }
    }

    /// Releases a remote file or directory handle.
    pub async fn close_handle(&self, handle: &[u8]) -> FerryResult<()> {
        let id = self.next_request_id();
        self.conn()
            .send(&wire::ClosePacket { id, handle })
            .await?;
        self.recv_status(id).await
    }

    /// Removes a remote file.
    pub async fn remove_file(&self, path: &str) -> FerryResult<()> {
        let id = self.next_request_id();
        self.conn()
            .send(&RemovePacket {
                id,
                path: path.to_string(),
            })
            .await?;
        self.recv_status(id).await
    }

    /// Removes an empty remote directory.
    pub async fn remove_directory(&self, path: &str) -> FerryResult<()> {
        let id = self.next_request_id();
        self.conn()
            .send(&RmdirPacket {
                id,
                path: path.to_string(),
            })
            .await?;
        self.recv_status(id).await
    }

    /// Removes a remote directory tree.
    ///
    /// Children are removed depth-first before their parent's RMDIR; the
    /// first failing child aborts the walk, leaving ancestors in place.
    pub async fn remove_all(&self, path: &str) -> FerryResult<()> {
        let entries = self.read_dir(path).await?;
        for entry in entries {
            let child = join_remote(path, &entry.filename);
            if entry.attrs.is_dir() {
                Box::pin(self.remove_all(&child)).await?;
            } else {
                self.remove_file(&child).await?;
            }
        }
        self.remove_directory(path).await
    }

    /// Awaits a STATUS reply for `id` and normalizes it.
    async fn recv_status(&self, id: u32) -> FerryResult<()> {
        let (typ, body) = self.conn().recv().await?;
        match PacketType::from_u8(typ) {
            Some(PacketType::Status) => wire::status_to_result(id, &body),
            _ => Err(unimplemented_reply(typ)),
        }
    }

    /// Closes the underlying connection. Further operations fail.
    pub async fn close(&self) -> FerryResult<()> {
        self.conn().close().await
    }
}

/// Maps a STATUS reply received where a different packet was expected.
///
/// An OK status in that position is itself a protocol violation: the server
/// acknowledged success without producing the promised handle or name.
fn status_error(id: u32, body: &[u8]) -> FerryError {
    match wire::status_to_result(id, body) {
        Ok(()) => {
            // decode again for the code in the message; body already validated
            let code = StatusPacket::decode(body).map(|s| s.code).unwrap_or(0);
            FerryError::Protocol(format!("unexpected status reply with code {}", code))
        }
        Err(e) => e,
    }
}

fn unimplemented_reply(typ: u8) -> FerryError {
    FerryError::Protocol(format!("unimplemented packet type: got {}", packet_name(typ)))
}

/// Applies the shell-style home normalization of remote paths.
fn normalize_home_path(path: &str) -> &str {
    match path {
        "" | "~" | "~/" => ".",
        _ => path.strip_prefix("~/").unwrap_or(path),
    }
}

/// Joins a remote directory and a child name with `/`.
pub(crate) fn join_remote(dir: &str, name: &str) -> String {
    if dir.is_empty() || dir == "." {
        return name.to_string();
    }
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_home_path() {
        assert_eq!(normalize_home_path(""), ".");
        assert_eq!(normalize_home_path("~"), ".");
        assert_eq!(normalize_home_path("~/"), ".");
        assert_eq!(normalize_home_path("~/srv/app"), "srv/app");
        assert_eq!(normalize_home_path("/var/log"), "/var/log");
        assert_eq!(normalize_home_path("relative/path"), "relative/path");
    }

    #[test]
    fn test_join_remote() {
        assert_eq!(join_remote("/srv", "app"), "/srv/app");
        assert_eq!(join_remote("/", "app"), "/app");
        assert_eq!(join_remote(".", "app"), "app");
        assert_eq!(join_remote("", "app"), "app");
    }

    #[test]
    fn test_config_builder() {
        let config = SftpClientConfig::new()
            .with_max_packet(128 * 1024)
            .with_max_concurrent_requests(4)
            .with_concurrent_transfers(false);
        assert_eq!(config.max_packet, 128 * 1024);
        assert_eq!(config.max_concurrent_requests, 4);
        assert!(!config.concurrent_transfers);
    }

    #[test]
    fn test_config_defaults() {
        let config = SftpClientConfig::default();
        assert_eq!(config.max_packet, 192 * 1024);
        assert_eq!(config.max_concurrent_requests, 64);
        assert!(config.concurrent_transfers);
    }
}
