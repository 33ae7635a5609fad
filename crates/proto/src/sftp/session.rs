//! Filesystem-level compound operations over the SFTP client.
//!
//! The session adapter resolves caller paths through `REALPATH`, shapes
//! destinations (a transfer into an existing directory lands under the
//! source's basename) and walks directory trees, using `tokio::fs` on the
//! local side and the client's operations on the remote side.

use super::client::{join_remote, SftpClient};
use super::file::RemoteFile;
use super::progress::ProgressSink;
use super::wire::FileAttributes;
use crate::transport::SubsystemTransport;
use ferry_platform::{FerryError, FerryResult};
use std::path::Path;
use tokio::fs;
use tracing::{info, warn};

/// Session adapter configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Whether a failure inside a recursive directory send aborts the walk.
    ///
    /// The permissive mode logs the failure and keeps walking siblings.
    pub strict_dir_errors: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            strict_dir_errors: true,
        }
    }
}

impl SessionConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the directory-send error policy.
    pub fn with_strict_dir_errors(mut self, strict: bool) -> Self {
        self.strict_dir_errors = strict;
        self
    }
}

/// High-level file and directory operations on one SFTP connection.
pub struct SftpSession {
    client: SftpClient,
    config: SessionConfig,
}

impl SftpSession {
    /// Wraps an established client with default configuration.
    pub fn new(client: SftpClient) -> Self {
        Self::with_config(client, SessionConfig::default())
    }

    /// Wraps an established client.
    pub fn with_config(client: SftpClient, config: SessionConfig) -> Self {
        Self { client, config }
    }

    /// Opens the "sftp" subsystem on the given transport and performs the
    /// version handshake.
    pub async fn from_transport<T>(transport: &mut T) -> FerryResult<Self>
    where
        T: SubsystemTransport + ?Sized,
    {
        let pipes = transport.open_subsystem("sftp").await?;
        let client = SftpClient::new(pipes.reader, pipes.writer).await?;
        Ok(Self::new(client))
    }

    /// The underlying SFTP client.
    pub fn client(&self) -> &SftpClient {
        &self.client
    }

    /// Stats a remote path after resolving it.
    pub async fn stat(&self, path: &str) -> FerryResult<FileAttributes> {
        let path = self.client.real_path(path).await?;
        self.client.stat(&path).await
    }

    /// Creates a remote directory after resolving its path.
    pub async fn mkdir(&self, path: &str) -> FerryResult<()> {
        let path = self.client.real_path(path).await?;
        self.client.mkdir(&path).await
    }

    /// Removes a remote file after resolving its path.
    pub async fn remove_file(&self, path: &str) -> FerryResult<()> {
        let path = self.client.real_path(path).await?;
        self.client.remove_file(&path).await
    }

    /// Removes an empty remote directory after resolving its path.
    pub async fn remove_directory(&self, path: &str) -> FerryResult<()> {
        let path = self.client.real_path(path).await?;
        self.client.remove_directory(&path).await
    }

    /// Removes a remote directory tree after resolving its path.
    pub async fn remove_all(&self, path: &str) -> FerryResult<()> {
        let path = self.client.real_path(path).await?;
        self.client.remove_all(&path).await
    }

    /// Uploads a local file.
    ///
    /// When the resolved remote path names a directory, the file lands
    /// inside it under the local basename. Returns the bytes transferred.
    pub async fn send_file(
        &self,
        local: impl AsRef<Path>,
        remote: &str,
        progress: Option<&ProgressSink>,
    ) -> FerryResult<u64> {
        let local = local.as_ref();
        let remote = self.client.real_path(remote).await?;
        let dest = if self.client.is_dir(&remote).await.unwrap_or(false) {
            join_remote(&remote, local_basename(local)?)
        } else {
            remote
        };
        info!(local = %local.display(), remote = %dest, "sending file");
        self.send_one(local, &dest, progress).await
    }

    /// Downloads a remote regular file.
    ///
    /// When the local path names an existing directory, the file lands
    /// inside it under the remote basename; an existing local file is
    /// refused. Returns the bytes transferred.
    pub async fn receive_file(
        &self,
        remote: &str,
        local: impl AsRef<Path>,
        progress: Option<&ProgressSink>,
    ) -> FerryResult<u64> {
        let remote = self.client.real_path(remote).await?;
        let attrs = self.client.stat(&remote).await?;
        if !attrs.is_regular() {
            return Err(FerryError::InvalidArgument(
                "remote source is not a regular file".to_string(),
            ));
        }

        let mut dest = local.as_ref().to_path_buf();
        match fs::metadata(&dest).await {
            Ok(meta) if meta.is_dir() => dest.push(remote_basename(&remote)),
            Ok(_) => {
                return Err(FerryError::InvalidArgument(
                    "local file already exists".to_string(),
                ))
            }
            Err(_) => {}
        }

        info!(remote = %remote, local = %dest.display(), "receiving file");
        self.receive_one(&remote, &dest, attrs.size.unwrap_or(0), progress)
            .await
    }

    /// Uploads a directory tree.
    ///
    /// The tree is recreated under `remote/<basename(local)>`. Regular-file
    /// completions are reported on `events`; failures inside subdirectories
    /// follow [`SessionConfig::strict_dir_errors`].
    pub async fn send_dir(
        &self,
        local: impl AsRef<Path>,
        remote: &str,
        events: Option<&ProgressSink>,
    ) -> FerryResult<()> {
        let local = local.as_ref();
        let remote = self.client.real_path(remote).await?;
        let dest = join_remote(&remote, local_basename(local)?);
        info!(local = %local.display(), remote = %dest, "sending directory");
        self.send_dir_tree(local, &dest, events).await
    }

    async fn send_dir_tree(
        &self,
        local: &Path,
        remote: &str,
        events: Option<&ProgressSink>,
    ) -> FerryResult<()> {
        self.client.mkdir(remote).await?;
        let mut entries = fs::read_dir(local).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let file_type = entry.file_type().await?;
            let child_remote = join_remote(remote, &name);
            if file_type.is_dir() {
                let result =
                    Box::pin(self.send_dir_tree(&entry.path(), &child_remote, events)).await;
                if let Err(err) = result {
                    if self.config.strict_dir_errors {
                        return Err(err);
                    }
                    warn!(remote = %child_remote, error = %err, "continuing past failed subdirectory");
                }
            } else if file_type.is_file() {
                self.send_one(&entry.path(), &child_remote, None).await?;
                if let Some(sink) = events {
                    sink.file_done(&child_remote);
                }
            }
        }
        Ok(())
    }

    /// Downloads a directory tree into `local/<basename(remote)>`.
    pub async fn receive_dir(
        &self,
        remote: &str,
        local: impl AsRef<Path>,
        events: Option<&ProgressSink>,
    ) -> FerryResult<()> {
        let remote = self.client.real_path(remote).await?;
        let dest = local.as_ref().join(remote_basename(&remote));
        info!(remote = %remote, local = %dest.display(), "receiving directory");
        self.receive_dir_tree(&remote, &dest, events).await
    }

    async fn receive_dir_tree(
        &self,
        remote: &str,
        local: &Path,
        events: Option<&ProgressSink>,
    ) -> FerryResult<()> {
        let entries = self.client.read_dir(remote).await?;
        fs::create_dir(local).await?;
        for entry in entries {
            let child_remote = join_remote(remote, &entry.filename);
            let child_local = local.join(&entry.filename);
            if entry.attrs.is_dir() {
                Box::pin(self.receive_dir_tree(&child_remote, &child_local, events)).await?;
            } else if entry.attrs.is_regular() {
                let size = entry.attrs.size.unwrap_or(0);
                self.receive_one(&child_remote, &child_local, size, None)
                    .await?;
                if let Some(sink) = events {
                    sink.file_done(&child_local.display().to_string());
                }
            }
        }
        Ok(())
    }

    async fn send_one(
        &self,
        local: &Path,
        remote: &str,
        progress: Option<&ProgressSink>,
    ) -> FerryResult<u64> {
        let meta = fs::metadata(local).await?;
        let mut src = fs::File::open(local).await?;
        let file = self.client.create(remote).await?;
        let result = file.read_from(&mut src, meta.len(), progress).await;
        let transferred = finish_transfer(&file, result).await?;
        Ok(transferred)
    }

    async fn receive_one(
        &self,
        remote: &str,
        local: &Path,
        size: u64,
        progress: Option<&ProgressSink>,
    ) -> FerryResult<u64> {
        let file = self.client.open(remote).await?;
        let mut out = match fs::File::create(local).await {
            Ok(out) => out,
            Err(e) => {
                // release the remote handle before surfacing the local error
                let _ = file.close().await;
                return Err(e.into());
            }
        };
        let result = file.write_to(&mut out, size, progress).await;
        let transferred = finish_transfer(&file, result).await?;
        Ok(transferred)
    }

    /// Closes the underlying connection.
    pub async fn close(&self) -> FerryResult<()> {
        self.client.close().await
    }
}

/// Closes the handle exactly once and folds its result into the transfer's.
async fn finish_transfer(file: &RemoteFile, result: FerryResult<u64>) -> FerryResult<u64> {
    let close_result = file.close().await;
    let transferred = result?;
    close_result?;
    Ok(transferred)
}

fn local_basename(path: &Path) -> FerryResult<&str> {
    path.file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| FerryError::InvalidArgument(format!("bad local path: {}", path.display())))
}

fn remote_basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}
