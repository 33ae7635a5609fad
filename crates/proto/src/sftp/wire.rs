//! SFTP v3 wire codec.
//!
//! Packet layouts follow draft-ietf-secsh-filexfer-02. On the wire a packet
//! is a 32-bit big-endian length prefix followed by `type (1) || body`; the
//! length covers type and body but not itself.
//!
//! Encoders render a contiguous buffer whose leading four bytes are reserved
//! for the length prefix; the connection fills them just before writing.
//! `WritePacket` is the hot path: its payload is a borrowed slice written
//! after the header, never copied into it.
//!
//! All decoding is length-checked; a field that runs past the end of the
//! buffer is a protocol error, never a panic.

use ferry_platform::{FerryError, FerryResult};

/// SFTP protocol version spoken by this implementation.
pub const SFTP_VERSION: u32 = 3;

/// Largest frame accepted on the wire (length prefix excluded).
pub const MAX_MSG_LENGTH: u32 = 256 * 1024;

/// SFTP packet type (SSH_FXP_*).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// SSH_FXP_INIT - Initialize session
    Init = 1,
    /// SSH_FXP_VERSION - Version response
    Version = 2,
    /// SSH_FXP_OPEN - Open file
    Open = 3,
    /// SSH_FXP_CLOSE - Close file/directory handle
    Close = 4,
    /// SSH_FXP_READ - Read from file
    Read = 5,
    /// SSH_FXP_WRITE - Write to file
    Write = 6,
    /// SSH_FXP_OPENDIR - Open directory
    OpenDir = 11,
    /// SSH_FXP_READDIR - Read directory entries
    ReadDir = 12,
    /// SSH_FXP_REMOVE - Remove file
    Remove = 13,
    /// SSH_FXP_MKDIR - Create directory
    MkDir = 14,
    /// SSH_FXP_RMDIR - Remove directory
    RmDir = 15,
    /// SSH_FXP_REALPATH - Canonicalize path
    RealPath = 16,
    /// SSH_FXP_STAT - Get file attributes
    Stat = 17,
    /// SSH_FXP_STATUS - Status response
    Status = 101,
    /// SSH_FXP_HANDLE - Handle response
    Handle = 102,
    /// SSH_FXP_DATA - Data response
    Data = 103,
    /// SSH_FXP_NAME - Name response
    Name = 104,
    /// SSH_FXP_ATTRS - Attributes response
    Attrs = 105,
}

impl PacketType {
    /// Convert from the wire byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Init),
            2 => Some(Self::Version),
            3 => Some(Self::Open),
            4 => Some(Self::Close),
            5 => Some(Self::Read),
            6 => Some(Self::Write),
            11 => Some(Self::OpenDir),
            12 => Some(Self::ReadDir),
            13 => Some(Self::Remove),
            14 => Some(Self::MkDir),
            15 => Some(Self::RmDir),
            16 => Some(Self::RealPath),
            17 => Some(Self::Stat),
            101 => Some(Self::Status),
            102 => Some(Self::Handle),
            103 => Some(Self::Data),
            104 => Some(Self::Name),
            105 => Some(Self::Attrs),
            _ => None,
        }
    }

    /// Wire name of the packet type.
    pub fn name(self) -> &'static str {
        match self {
            Self::Init => "SSH_FXP_INIT",
            Self::Version => "SSH_FXP_VERSION",
            Self::Open => "SSH_FXP_OPEN",
            Self::Close => "SSH_FXP_CLOSE",
            Self::Read => "SSH_FXP_READ",
            Self::Write => "SSH_FXP_WRITE",
            Self::OpenDir => "SSH_FXP_OPENDIR",
            Self::ReadDir => "SSH_FXP_READDIR",
            Self::Remove => "SSH_FXP_REMOVE",
            Self::MkDir => "SSH_FXP_MKDIR",
            Self::RmDir => "SSH_FXP_RMDIR",
            Self::RealPath => "SSH_FXP_REALPATH",
            Self::Stat => "SSH_FXP_STAT",
            Self::Status => "SSH_FXP_STATUS",
            Self::Handle => "SSH_FXP_HANDLE",
            Self::Data => "SSH_FXP_DATA",
            Self::Name => "SSH_FXP_NAME",
            Self::Attrs => "SSH_FXP_ATTRS",
        }
    }
}

/// Formats an arbitrary wire byte as a packet-type name for diagnostics.
pub fn packet_name(value: u8) -> String {
    match PacketType::from_u8(value) {
        Some(t) => t.name().to_string(),
        None => format!("unknown({})", value),
    }
}

/// SFTP status code (SSH_FX_*).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StatusCode {
    /// SSH_FX_OK - Success
    Ok = 0,
    /// SSH_FX_EOF - End of file
    Eof = 1,
    /// SSH_FX_NO_SUCH_FILE - No such file
    NoSuchFile = 2,
    /// SSH_FX_PERMISSION_DENIED - Permission denied
    PermissionDenied = 3,
    /// SSH_FX_FAILURE - General failure
    Failure = 4,
    /// SSH_FX_BAD_MESSAGE - Bad message
    BadMessage = 5,
    /// SSH_FX_NO_CONNECTION - No connection
    NoConnection = 6,
    /// SSH_FX_CONNECTION_LOST - Connection lost
    ConnectionLost = 7,
    /// SSH_FX_OP_UNSUPPORTED - Operation not supported
    OpUnsupported = 8,
}

impl StatusCode {
    /// Convert from the wire value.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::Eof),
            2 => Some(Self::NoSuchFile),
            3 => Some(Self::PermissionDenied),
            4 => Some(Self::Failure),
            5 => Some(Self::BadMessage),
            6 => Some(Self::NoConnection),
            7 => Some(Self::ConnectionLost),
            8 => Some(Self::OpUnsupported),
            _ => None,
        }
    }

    /// Default human-readable message for the code.
    pub fn message(self) -> &'static str {
        match self {
            Self::Ok => "success",
            Self::Eof => "end of file",
            Self::NoSuchFile => "no such file or directory",
            Self::PermissionDenied => "permission denied",
            Self::Failure => "failure",
            Self::BadMessage => "bad message",
            Self::NoConnection => "no connection",
            Self::ConnectionLost => "connection lost",
            Self::OpUnsupported => "operation not supported",
        }
    }
}

/// File open flag bits (SSH_FXF_*).
pub mod open_flags {
    /// SSH_FXF_READ - Open for reading
    pub const READ: u32 = 0x00000001;
    /// SSH_FXF_WRITE - Open for writing
    pub const WRITE: u32 = 0x00000002;
    /// SSH_FXF_APPEND - Force writes to append
    pub const APPEND: u32 = 0x00000004;
    /// SSH_FXF_CREAT - Create if missing
    pub const CREAT: u32 = 0x00000008;
    /// SSH_FXF_TRUNC - Truncate to zero length
    pub const TRUNC: u32 = 0x00000010;
    /// SSH_FXF_EXCL - Fail if the file exists
    pub const EXCL: u32 = 0x00000020;
}

/// File attribute flag bits (SSH_FILEXFER_ATTR_*).
pub mod attr_flags {
    /// SSH_FILEXFER_ATTR_SIZE
    pub const SIZE: u32 = 0x00000001;
    /// SSH_FILEXFER_ATTR_UIDGID
    pub const UIDGID: u32 = 0x00000002;
    /// SSH_FILEXFER_ATTR_PERMISSIONS
    pub const PERMISSIONS: u32 = 0x00000004;
    /// SSH_FILEXFER_ATTR_ACMODTIME
    pub const ACMODTIME: u32 = 0x00000008;
    /// SSH_FILEXFER_ATTR_EXTENDED
    pub const EXTENDED: u32 = 0x80000000;
}

/// POSIX file-type bits carried in the permissions field.
pub mod file_mode {
    /// S_IFMT - file type mask
    pub const TYPE_MASK: u32 = 0xF000;
    /// S_IFDIR - directory
    pub const DIR: u32 = 0x4000;
    /// S_IFREG - regular file
    pub const REGULAR: u32 = 0x8000;
}

const ERR_SHORT_PACKET: &str = "packet too short";

fn short_packet() -> FerryError {
    FerryError::Protocol(ERR_SHORT_PACKET.to_string())
}

/// Builds the "unexpected id" protocol error.
pub fn unexpected_id(want: u32, got: u32) -> FerryError {
    FerryError::Protocol(format!("unexpected id: want {}, got {}", want, got))
}

/// Builds the "unexpected packet" protocol error.
pub fn unexpected_packet(want: PacketType, got: u8) -> FerryError {
    FerryError::Protocol(format!(
        "unexpected packet: want {}, got {}",
        want.name(),
        packet_name(got)
    ))
}

// Encode primitives. u64 is rendered as two big-endian u32 halves, strings
// as a u32 length followed by raw bytes (no terminator, no UTF-8 check).

/// Appends a big-endian u32.
pub fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

/// Appends a big-endian u64.
pub fn put_u64(buf: &mut Vec<u8>, v: u64) {
    put_u32(buf, (v >> 32) as u32);
    put_u32(buf, v as u32);
}

/// Appends a length-prefixed byte string.
pub fn put_bytes(buf: &mut Vec<u8>, v: &[u8]) {
    put_u32(buf, v.len() as u32);
    buf.extend_from_slice(v);
}

/// Reads a big-endian u32, returning the value and the remaining bytes.
pub fn take_u32(b: &[u8]) -> FerryResult<(u32, &[u8])> {
    if b.len() < 4 {
        return Err(short_packet());
    }
    let v = u32::from_be_bytes([b[0], b[1], b[2], b[3]]);
    Ok((v, &b[4..]))
}

/// Reads a big-endian u64 (two u32 halves).
pub fn take_u64(b: &[u8]) -> FerryResult<(u64, &[u8])> {
    let (hi, b) = take_u32(b)?;
    let (lo, b) = take_u32(b)?;
    Ok(((u64::from(hi) << 32) | u64::from(lo), b))
}

/// Reads a length-prefixed byte string.
pub fn take_bytes(b: &[u8]) -> FerryResult<(&[u8], &[u8])> {
    let (n, b) = take_u32(b)?;
    let n = n as usize;
    if b.len() < n {
        return Err(short_packet());
    }
    Ok((&b[..n], &b[n..]))
}

/// Reads a length-prefixed string, converting lossily to UTF-8.
pub fn take_string(b: &[u8]) -> FerryResult<(String, &[u8])> {
    let (raw, rest) = take_bytes(b)?;
    Ok((String::from_utf8_lossy(raw).into_owned(), rest))
}

/// An extended attribute pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionPair {
    /// Extension type name
    pub name: String,
    /// Extension data
    pub data: String,
}

/// File attributes with flag-gated fields.
///
/// Only fields present in the wire flag mask are populated; encoding writes
/// exactly the populated fields and no others. `uid`/`gid` and
/// `atime`/`mtime` travel as pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttributes {
    /// File size in bytes
    pub size: Option<u64>,
    /// User ID
    pub uid: Option<u32>,
    /// Group ID
    pub gid: Option<u32>,
    /// Permission bits, including the POSIX `S_IF*` type bits
    pub permissions: Option<u32>,
    /// Access time (Unix timestamp)
    pub atime: Option<u32>,
    /// Modification time (Unix timestamp)
    pub mtime: Option<u32>,
    /// Extended attribute pairs
    pub extended: Vec<ExtensionPair>,
}

impl FileAttributes {
    /// Creates empty attributes.
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the permission bits mark a directory.
    pub fn is_dir(&self) -> bool {
        self.permissions
            .map(|m| m & file_mode::TYPE_MASK == file_mode::DIR)
            .unwrap_or(false)
    }

    /// True when the permission bits mark a regular file.
    pub fn is_regular(&self) -> bool {
        self.permissions
            .map(|m| m & file_mode::TYPE_MASK == file_mode::REGULAR)
            .unwrap_or(false)
    }

    fn flags(&self) -> u32 {
        let mut flags = 0u32;
        if self.size.is_some() {
            flags |= attr_flags::SIZE;
        }
        if self.uid.is_some() && self.gid.is_some() {
            flags |= attr_flags::UIDGID;
        }
        if self.permissions.is_some() {
            flags |= attr_flags::PERMISSIONS;
        }
        if self.atime.is_some() && self.mtime.is_some() {
            flags |= attr_flags::ACMODTIME;
        }
        if !self.extended.is_empty() {
            flags |= attr_flags::EXTENDED;
        }
        flags
    }

    /// Appends the flag mask and flagged fields in canonical order.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.flags());
        if let Some(size) = self.size {
            put_u64(buf, size);
        }
        if let (Some(uid), Some(gid)) = (self.uid, self.gid) {
            put_u32(buf, uid);
            put_u32(buf, gid);
        }
        if let Some(permissions) = self.permissions {
            put_u32(buf, permissions);
        }
        if let (Some(atime), Some(mtime)) = (self.atime, self.mtime) {
            put_u32(buf, atime);
            put_u32(buf, mtime);
        }
        if !self.extended.is_empty() {
            put_u32(buf, self.extended.len() as u32);
            for pair in &self.extended {
                put_bytes(buf, pair.name.as_bytes());
                put_bytes(buf, pair.data.as_bytes());
            }
        }
    }

    /// Parses a flag mask and the flagged fields, returning the rest.
    pub fn decode(b: &[u8]) -> FerryResult<(Self, &[u8])> {
        let (flags, mut b) = take_u32(b)?;
        let mut attrs = Self::new();

        if flags & attr_flags::SIZE != 0 {
            let (size, rest) = take_u64(b)?;
            attrs.size = Some(size);
            b = rest;
        }
        if flags & attr_flags::UIDGID != 0 {
            let (uid, rest) = take_u32(b)?;
            let (gid, rest) = take_u32(rest)?;
            attrs.uid = Some(uid);
            attrs.gid = Some(gid);
            b = rest;
        }
        if flags & attr_flags::PERMISSIONS != 0 {
            let (mode, rest) = take_u32(b)?;
            attrs.permissions = Some(mode);
            b = rest;
        }
        if flags & attr_flags::ACMODTIME != 0 {
            let (atime, rest) = take_u32(b)?;
            let (mtime, rest) = take_u32(rest)?;
            attrs.atime = Some(atime);
            attrs.mtime = Some(mtime);
            b = rest;
        }
        if flags & attr_flags::EXTENDED != 0 {
            let (count, rest) = take_u32(b)?;
            b = rest;
            let mut extended = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let (name, rest) = take_string(b)?;
                let (data, rest) = take_string(rest)?;
                extended.push(ExtensionPair { name, data });
                b = rest;
            }
            attrs.extended = extended;
        }
        Ok((attrs, b))
    }
}

/// A packet that can be rendered for the wire.
///
/// `encode_header` produces the frame with a zeroed 4-byte length prefix,
/// the type byte and all fixed fields; `payload` is any trailing data
/// written back-to-back after the header.
pub trait Packet {
    /// Renders the length-prefix placeholder, type byte and fixed fields.
    fn encode_header(&self) -> Vec<u8>;

    /// Trailing payload written after the header without copying.
    fn payload(&self) -> &[u8] {
        &[]
    }
}

fn new_header(packet_type: PacketType, capacity: usize) -> Vec<u8> {
    let mut b = Vec::with_capacity(capacity);
    b.extend_from_slice(&[0u8; 4]);
    b.push(packet_type as u8);
    b
}

fn encode_id_bytes(packet_type: PacketType, id: u32, data: &[u8]) -> Vec<u8> {
    let mut b = new_header(packet_type, 4 + 1 + 4 + 4 + data.len());
    put_u32(&mut b, id);
    put_bytes(&mut b, data);
    b
}

fn decode_id_bytes(body: &[u8]) -> FerryResult<(u32, &[u8])> {
    let (id, body) = take_u32(body)?;
    let (data, _) = take_bytes(body)?;
    Ok((id, data))
}

/// SSH_FXP_INIT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitPacket {
    /// Protocol version offered by the client
    pub version: u32,
    /// Extension pairs
    pub extensions: Vec<ExtensionPair>,
}

impl InitPacket {
    /// Parses an INIT body.
    pub fn decode(body: &[u8]) -> FerryResult<Self> {
        let (version, mut b) = take_u32(body)?;
        let mut extensions = Vec::new();
        while !b.is_empty() {
            let (name, rest) = take_string(b)?;
            let (data, rest) = take_string(rest)?;
            extensions.push(ExtensionPair { name, data });
            b = rest;
        }
        Ok(Self {
            version,
            extensions,
        })
    }
}

impl Packet for InitPacket {
    fn encode_header(&self) -> Vec<u8> {
        let mut b = new_header(PacketType::Init, 4 + 1 + 4);
        put_u32(&mut b, self.version);
        for pair in &self.extensions {
            put_bytes(&mut b, pair.name.as_bytes());
            put_bytes(&mut b, pair.data.as_bytes());
        }
        b
    }
}

/// SSH_FXP_VERSION.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionPacket {
    /// Protocol version selected by the server
    pub version: u32,
    /// Extension pairs
    pub extensions: Vec<ExtensionPair>,
}

impl VersionPacket {
    /// Parses a VERSION body.
    pub fn decode(body: &[u8]) -> FerryResult<Self> {
        let (version, mut b) = take_u32(body)?;
        let mut extensions = Vec::new();
        while !b.is_empty() {
            let (name, rest) = take_string(b)?;
            let (data, rest) = take_string(rest)?;
            extensions.push(ExtensionPair { name, data });
            b = rest;
        }
        Ok(Self {
            version,
            extensions,
        })
    }
}

impl Packet for VersionPacket {
    fn encode_header(&self) -> Vec<u8> {
        let mut b = new_header(PacketType::Version, 4 + 1 + 4);
        put_u32(&mut b, self.version);
        for pair in &self.extensions {
            put_bytes(&mut b, pair.name.as_bytes());
            put_bytes(&mut b, pair.data.as_bytes());
        }
        b
    }
}

/// SSH_FXP_OPEN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenPacket {
    /// Request id
    pub id: u32,
    /// Remote path
    pub path: String,
    /// SSH_FXF_* open flags
    pub pflags: u32,
    /// Initial attributes
    pub attrs: FileAttributes,
}

impl OpenPacket {
    /// Parses an OPEN body.
    pub fn decode(body: &[u8]) -> FerryResult<Self> {
        let (id, b) = take_u32(body)?;
        let (path, b) = take_string(b)?;
        let (pflags, b) = take_u32(b)?;
        let (attrs, _) = FileAttributes::decode(b)?;
        Ok(Self {
            id,
            path,
            pflags,
            attrs,
        })
    }
}

impl Packet for OpenPacket {
    fn encode_header(&self) -> Vec<u8> {
        let mut b = new_header(PacketType::Open, 4 + 1 + 4 + 4 + self.path.len() + 8);
        put_u32(&mut b, self.id);
        put_bytes(&mut b, self.path.as_bytes());
        put_u32(&mut b, self.pflags);
        self.attrs.encode(&mut b);
        b
    }
}

/// SSH_FXP_CLOSE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosePacket<'a> {
    /// Request id
    pub id: u32,
    /// Handle to release
    pub handle: &'a [u8],
}

impl<'a> ClosePacket<'a> {
    /// Parses a CLOSE body.
    pub fn decode(body: &'a [u8]) -> FerryResult<Self> {
        let (id, handle) = decode_id_bytes(body)?;
        Ok(Self { id, handle })
    }
}

impl Packet for ClosePacket<'_> {
    fn encode_header(&self) -> Vec<u8> {
        encode_id_bytes(PacketType::Close, self.id, self.handle)
    }
}

/// SSH_FXP_READ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadPacket<'a> {
    /// Request id
    pub id: u32,
    /// Open file handle
    pub handle: &'a [u8],
    /// Absolute read offset
    pub offset: u64,
    /// Number of bytes requested
    pub len: u32,
}

impl<'a> ReadPacket<'a> {
    /// Parses a READ body.
    pub fn decode(body: &'a [u8]) -> FerryResult<Self> {
        let (id, b) = take_u32(body)?;
        let (handle, b) = take_bytes(b)?;
        let (offset, b) = take_u64(b)?;
        let (len, _) = take_u32(b)?;
        Ok(Self {
            id,
            handle,
            offset,
            len,
        })
    }
}

impl Packet for ReadPacket<'_> {
    fn encode_header(&self) -> Vec<u8> {
        let mut b = new_header(PacketType::Read, 4 + 1 + 4 + 4 + self.handle.len() + 8 + 4);
        put_u32(&mut b, self.id);
        put_bytes(&mut b, self.handle);
        put_u64(&mut b, self.offset);
        put_u32(&mut b, self.len);
        b
    }
}

/// SSH_FXP_WRITE.
///
/// The data chunk stays a borrowed slice; the connection writes it directly
/// after the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WritePacket<'a> {
    /// Request id
    pub id: u32,
    /// Open file handle
    pub handle: &'a [u8],
    /// Absolute write offset
    pub offset: u64,
    /// Data chunk
    pub data: &'a [u8],
}

impl<'a> WritePacket<'a> {
    /// Parses a WRITE body.
    pub fn decode(body: &'a [u8]) -> FerryResult<Self> {
        let (id, b) = take_u32(body)?;
        let (handle, b) = take_bytes(b)?;
        let (offset, b) = take_u64(b)?;
        let (data, _) = take_bytes(b)?;
        Ok(Self {
            id,
            handle,
            offset,
            data,
        })
    }
}

impl Packet for WritePacket<'_> {
    fn encode_header(&self) -> Vec<u8> {
        let mut b = new_header(PacketType::Write, 4 + 1 + 4 + 4 + self.handle.len() + 8 + 4);
        put_u32(&mut b, self.id);
        put_bytes(&mut b, self.handle);
        put_u64(&mut b, self.offset);
        put_u32(&mut b, self.data.len() as u32);
        b
    }

    fn payload(&self) -> &[u8] {
        self.data
    }
}

macro_rules! id_path_packet {
    ($(#[$doc:meta])* $name:ident, $typ:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            /// Request id
            pub id: u32,
            /// Remote path
            pub path: String,
        }

        impl $name {
            /// Parses the packet body.
            pub fn decode(body: &[u8]) -> FerryResult<Self> {
                let (id, b) = take_u32(body)?;
                let (path, _) = take_string(b)?;
                Ok(Self { id, path })
            }
        }

        impl Packet for $name {
            fn encode_header(&self) -> Vec<u8> {
                encode_id_bytes($typ, self.id, self.path.as_bytes())
            }
        }
    };
}

id_path_packet!(
    /// SSH_FXP_OPENDIR.
    OpenDirPacket,
    PacketType::OpenDir
);
id_path_packet!(
    /// SSH_FXP_REMOVE.
    RemovePacket,
    PacketType::Remove
);
id_path_packet!(
    /// SSH_FXP_RMDIR.
    RmdirPacket,
    PacketType::RmDir
);
id_path_packet!(
    /// SSH_FXP_REALPATH.
    RealPathPacket,
    PacketType::RealPath
);
id_path_packet!(
    /// SSH_FXP_STAT.
    StatPacket,
    PacketType::Stat
);

/// SSH_FXP_MKDIR.
///
/// Carries an attribute block; this client always sends an empty one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MkdirPacket {
    /// Request id
    pub id: u32,
    /// Remote path
    pub path: String,
    /// Initial directory attributes
    pub attrs: FileAttributes,
}

impl MkdirPacket {
    /// Parses a MKDIR body.
    pub fn decode(body: &[u8]) -> FerryResult<Self> {
        let (id, b) = take_u32(body)?;
        let (path, b) = take_string(b)?;
        let (attrs, _) = FileAttributes::decode(b)?;
        Ok(Self { id, path, attrs })
    }
}

impl Packet for MkdirPacket {
    fn encode_header(&self) -> Vec<u8> {
        let mut b = new_header(PacketType::MkDir, 4 + 1 + 4 + 4 + self.path.len() + 4);
        put_u32(&mut b, self.id);
        put_bytes(&mut b, self.path.as_bytes());
        self.attrs.encode(&mut b);
        b
    }
}

/// SSH_FXP_READDIR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadDirPacket<'a> {
    /// Request id
    pub id: u32,
    /// Open directory handle
    pub handle: &'a [u8],
}

impl<'a> ReadDirPacket<'a> {
    /// Parses a READDIR body.
    pub fn decode(body: &'a [u8]) -> FerryResult<Self> {
        let (id, handle) = decode_id_bytes(body)?;
        Ok(Self { id, handle })
    }
}

impl Packet for ReadDirPacket<'_> {
    fn encode_header(&self) -> Vec<u8> {
        encode_id_bytes(PacketType::ReadDir, self.id, self.handle)
    }
}

/// SSH_FXP_STATUS reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPacket {
    /// Echoed request id
    pub id: u32,
    /// SSH_FX_* code
    pub code: u32,
    /// Server message
    pub message: String,
    /// Language tag
    pub language: String,
}

impl StatusPacket {
    /// Builds a STATUS reply from a code, using its default message.
    pub fn from_code(id: u32, code: StatusCode) -> Self {
        Self {
            id,
            code: code as u32,
            message: code.message().to_string(),
            language: String::new(),
        }
    }

    /// Parses a STATUS body. Message and language are optional on the wire.
    pub fn decode(body: &[u8]) -> FerryResult<Self> {
        let (id, b) = take_u32(body)?;
        let (code, b) = take_u32(b)?;
        let (message, b) = take_string(b).unwrap_or((String::new(), &[]));
        let (language, _) = take_string(b).unwrap_or((String::new(), &[]));
        Ok(Self {
            id,
            code,
            message,
            language,
        })
    }
}

impl Packet for StatusPacket {
    fn encode_header(&self) -> Vec<u8> {
        let mut b = new_header(
            PacketType::Status,
            4 + 1 + 4 + 4 + 4 + self.message.len() + 4 + self.language.len(),
        );
        put_u32(&mut b, self.id);
        put_u32(&mut b, self.code);
        put_bytes(&mut b, self.message.as_bytes());
        put_bytes(&mut b, self.language.as_bytes());
        b
    }
}

/// SSH_FXP_HANDLE reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlePacket {
    /// Echoed request id
    pub id: u32,
    /// Opaque server handle
    pub handle: Vec<u8>,
}

impl HandlePacket {
    /// Parses a HANDLE body.
    pub fn decode(body: &[u8]) -> FerryResult<Self> {
        let (id, handle) = decode_id_bytes(body)?;
        Ok(Self {
            id,
            handle: handle.to_vec(),
        })
    }
}

impl Packet for HandlePacket {
    fn encode_header(&self) -> Vec<u8> {
        encode_id_bytes(PacketType::Handle, self.id, &self.handle)
    }
}

/// SSH_FXP_DATA reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket<'a> {
    /// Echoed request id
    pub id: u32,
    /// Data chunk
    pub data: &'a [u8],
}

impl<'a> DataPacket<'a> {
    /// Parses a DATA body without copying the chunk.
    pub fn decode(body: &'a [u8]) -> FerryResult<Self> {
        let (id, data) = decode_id_bytes(body)?;
        Ok(Self { id, data })
    }
}

impl Packet for DataPacket<'_> {
    fn encode_header(&self) -> Vec<u8> {
        let mut b = new_header(PacketType::Data, 4 + 1 + 4 + 4);
        put_u32(&mut b, self.id);
        put_u32(&mut b, self.data.len() as u32);
        b
    }

    fn payload(&self) -> &[u8] {
        self.data
    }
}

/// One entry of an SSH_FXP_NAME reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameEntry {
    /// File name
    pub filename: String,
    /// Long listing line (parsed and otherwise ignored)
    pub longname: String,
    /// Entry attributes
    pub attrs: FileAttributes,
}

/// SSH_FXP_NAME reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamePacket {
    /// Echoed request id
    pub id: u32,
    /// Directory entries
    pub entries: Vec<NameEntry>,
}

impl NamePacket {
    /// Parses a NAME body.
    pub fn decode(body: &[u8]) -> FerryResult<Self> {
        let (id, b) = take_u32(body)?;
        let (count, mut b) = take_u32(b)?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (filename, rest) = take_string(b)?;
            let (longname, rest) = take_string(rest)?;
            let (attrs, rest) = FileAttributes::decode(rest)?;
            entries.push(NameEntry {
                filename,
                longname,
                attrs,
            });
            b = rest;
        }
        Ok(Self { id, entries })
    }
}

impl Packet for NamePacket {
    fn encode_header(&self) -> Vec<u8> {
        let mut b = new_header(PacketType::Name, 4 + 1 + 4 + 4);
        put_u32(&mut b, self.id);
        put_u32(&mut b, self.entries.len() as u32);
        for entry in &self.entries {
            put_bytes(&mut b, entry.filename.as_bytes());
            put_bytes(&mut b, entry.longname.as_bytes());
            entry.attrs.encode(&mut b);
        }
        b
    }
}

/// SSH_FXP_ATTRS reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrsPacket {
    /// Echoed request id
    pub id: u32,
    /// File attributes
    pub attrs: FileAttributes,
}

impl AttrsPacket {
    /// Parses an ATTRS body.
    pub fn decode(body: &[u8]) -> FerryResult<Self> {
        let (id, b) = take_u32(body)?;
        let (attrs, _) = FileAttributes::decode(b)?;
        Ok(Self { id, attrs })
    }
}

impl Packet for AttrsPacket {
    fn encode_header(&self) -> Vec<u8> {
        let mut b = new_header(PacketType::Attrs, 4 + 1 + 4 + 4);
        put_u32(&mut b, self.id);
        self.attrs.encode(&mut b);
        b
    }
}

/// Decodes a STATUS body, checks the echoed id and maps the code to a
/// categorical result: OK is success, EOF/NO_SUCH_FILE/PERMISSION_DENIED
/// become their categorical errors, everything else keeps the numeric code
/// and server message.
pub fn status_to_result(want_id: u32, body: &[u8]) -> FerryResult<()> {
    let status = StatusPacket::decode(body)?;
    if status.id != want_id {
        return Err(unexpected_id(want_id, status.id));
    }
    match StatusCode::from_u32(status.code) {
        Some(StatusCode::Ok) => Ok(()),
        Some(StatusCode::Eof) => Err(FerryError::Eof),
        Some(StatusCode::NoSuchFile) => Err(FerryError::NotFound),
        Some(StatusCode::PermissionDenied) => Err(FerryError::PermissionDenied),
        _ => Err(FerryError::Status {
            code: status.code,
            message: if status.message.is_empty() {
                StatusCode::from_u32(status.code)
                    .map(|c| c.message().to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            } else {
                status.message
            },
        }),
    }
}
