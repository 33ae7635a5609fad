//! SSH transport contract consumed by the SFTP subsystem.
//!
//! Ferry does not implement the SSH transport. The library that does —
//! dialing, authentication, channel allocation — hands over a pair of byte
//! pipes for the requested subsystem, and everything above runs on those.
//! Host-key policy is explicit configuration passed into construction, not
//! process-global state.

use async_trait::async_trait;
use base64::Engine;
use ferry_platform::{FerryError, FerryResult};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// The byte pipes of one subsystem channel.
pub struct SubsystemPipes {
    /// Bytes flowing from the server (the channel's stdout)
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Bytes flowing to the server (the channel's stdin)
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl SubsystemPipes {
    /// Wraps a reader/writer pair.
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

/// An established SSH connection able to open subsystem channels.
///
/// Implemented by whatever SSH library carries the session; errors from the
/// subsystem request are fatal for the session.
#[async_trait]
pub trait SubsystemTransport: Send {
    /// Requests the named subsystem ("sftp") and returns its byte pipes.
    async fn open_subsystem(&mut self, name: &str) -> FerryResult<SubsystemPipes>;
}

/// Outcome of checking a server key against the known-hosts file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyStatus {
    /// The key matches a recorded entry.
    Known,
    /// No entry exists for this host.
    Unknown,
    /// An entry exists with a different key.
    Changed,
}

/// Known-hosts verification policy.
///
/// Each line of the file is `hostname key-type base64-key`. When the trust
/// flag is set, an unknown host's key is appended and accepted; otherwise
/// unknown hosts are rejected. A changed key is always rejected.
#[derive(Debug, Clone)]
pub struct HostKeyPolicy {
    known_hosts: PathBuf,
    trust_unknown: bool,
}

impl HostKeyPolicy {
    /// Creates a policy over the given known-hosts file.
    pub fn new(known_hosts: impl Into<PathBuf>, trust_unknown: bool) -> Self {
        Self {
            known_hosts: known_hosts.into(),
            trust_unknown,
        }
    }

    /// Path of the known-hosts file.
    pub fn known_hosts_path(&self) -> &Path {
        &self.known_hosts
    }

    /// Looks the host up without side effects.
    pub fn check(&self, hostname: &str, key_type: &str, key: &[u8]) -> FerryResult<HostKeyStatus> {
        let contents = match std::fs::read_to_string(&self.known_hosts) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        let encoded = base64::engine::general_purpose::STANDARD.encode(key);
        let mut seen = false;
        for line in contents.lines() {
            let mut fields = line.split_whitespace();
            let (Some(host), Some(typ), Some(recorded)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            if host != hostname || typ != key_type {
                continue;
            }
            seen = true;
            if recorded == encoded {
                return Ok(HostKeyStatus::Known);
            }
        }
        Ok(if seen {
            HostKeyStatus::Changed
        } else {
            HostKeyStatus::Unknown
        })
    }

    /// Verifies a server key, applying the trust flag to unknown hosts.
    pub fn verify(&self, hostname: &str, key_type: &str, key: &[u8]) -> FerryResult<()> {
        match self.check(hostname, key_type, key)? {
            HostKeyStatus::Known => Ok(()),
            HostKeyStatus::Changed => Err(FerryError::Config(format!(
                "host key for {} has changed",
                hostname
            ))),
            HostKeyStatus::Unknown if self.trust_unknown => {
                self.append(hostname, key_type, key)?;
                debug!(hostname, "recorded new host key");
                Ok(())
            }
            HostKeyStatus::Unknown => Err(FerryError::Config(format!(
                "unknown host key for {}",
                hostname
            ))),
        }
    }

    fn append(&self, hostname: &str, key_type: &str, key: &[u8]) -> FerryResult<()> {
        use std::io::Write;

        let encoded = base64::engine::general_purpose::STANDARD.encode(key);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.known_hosts)
            .map_err(|_| FerryError::Config("failed to open known hosts file".to_string()))?;
        writeln!(file, "{} {} {}", hostname, key_type, encoded)
            .map_err(|_| FerryError::Config("failed to write to known hosts file".to_string()))?;
        Ok(())
    }
}
