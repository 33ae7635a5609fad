//! SFTP (SSH File Transfer Protocol) client, version 3.
//!
//! # Architecture
//!
//! SFTP runs as an SSH subsystem over an SSH channel. The SSH transport
//! itself is external (see [`crate::transport`]); this module owns
//! everything above the subsystem's byte pipes:
//!
//! 1. Length-prefixed packet framing ([`conn`])
//! 2. The v3 packet set ([`wire`])
//! 3. Request/reply operations and the handshake ([`client`])
//! 4. File handles and sequential transfers ([`file`])
//! 5. The pipelined concurrent transfer engine (internal)
//! 6. Filesystem-level compound operations ([`session`])
//!
//! # Protocol Flow
//!
//! ```text
//! Client                          Server
//!   |-- SSH_FXP_INIT -------------->|
//!   |<- SSH_FXP_VERSION ------------|
//!   |                               |
//!   |-- SSH_FXP_OPEN -------------->|
//!   |<- SSH_FXP_HANDLE -------------|
//!   |                               |
//!   |-- SSH_FXP_WRITE (offset 0) -->|
//!   |-- SSH_FXP_WRITE (offset n) -->|   pipelined: many in flight
//!   |<- SSH_FXP_STATUS -------------|
//!   |<- SSH_FXP_STATUS -------------|
//!   |                               |
//!   |-- SSH_FXP_CLOSE ------------->|
//!   |<- SSH_FXP_STATUS -------------|
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use ferry_proto::sftp::{SftpClient, SftpSession};
//!
//! # async fn example(
//! #     reader: tokio::io::ReadHalf<tokio::io::DuplexStream>,
//! #     writer: tokio::io::WriteHalf<tokio::io::DuplexStream>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! // reader/writer are the "sftp" subsystem pipes from the SSH transport
//! let client = SftpClient::new(reader, writer).await?;
//! let session = SftpSession::new(client);
//!
//! session.send_file("target/app.tar.gz", "~/releases", None).await?;
//! session.receive_file("~/releases/app.tar.gz", "backup.tar.gz", None).await?;
//! session.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # References
//!
//! - [SFTP Draft v3](https://datatracker.ietf.org/doc/html/draft-ietf-secsh-filexfer-02)

pub mod client;
pub mod conn;
pub mod file;
mod pipeline;
pub mod progress;
pub mod session;
pub mod wire;

pub use client::{DirEntry, SftpClient, SftpClientConfig};
pub use conn::Connection;
pub use file::RemoteFile;
pub use progress::{ProgressSink, ProgressUpdate};
pub use session::{SessionConfig, SftpSession};
pub use wire::{FileAttributes, PacketType, StatusCode};
