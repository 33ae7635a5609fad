//! Protocol implementations for the Ferry deployment toolkit.
//!
//! This crate provides the SFTP client core that Ferry drives file
//! transfers with:
//!
//! - **SFTP v3** (draft-ietf-secsh-filexfer-02) — hand-rolled client with a
//!   pipelined concurrent transfer engine
//! - **Transport contract** — the seam to whatever SSH library carries the
//!   session
//!
//! # Features
//!
//! - `sftp` (default) - SFTP client support
//!
//! # Example
//!
//! ```rust
//! use ferry_proto::sftp::wire::{InitPacket, Packet};
//!
//! // Render an INIT packet for the wire (the connection fills the length
//! // prefix before writing).
//! let packet = InitPacket { version: 3, extensions: vec![] };
//! let header = packet.encode_header();
//! assert_eq!(header[4], 1); // SSH_FXP_INIT
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "sftp")]
pub mod sftp;
pub mod transport;
