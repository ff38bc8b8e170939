//! SFTP v3 wire codec.
//!
//! Every packet is framed as:
//!
//! ```text
//! uint32    length        (of everything after this field)
//! byte      type
//! byte[n]   payload
//! ```
//!
//! Integers are big-endian, strings are `uint32 length` + bytes. Request
//! payloads start with a `uint32` request id.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use sftpfs_kernel::{Attributes, DirEntry, OpenFlags, StatusCode};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::constants::MAX_PACKET_LEN;
use crate::protocol::Request;

/// Packet type byte (`SSH_FXP_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Init = 1,
    Version = 2,
    Open = 3,
    Close = 4,
    Read = 5,
    Write = 6,
    Lstat = 7,
    Fstat = 8,
    Setstat = 9,
    Fsetstat = 10,
    Opendir = 11,
    Readdir = 12,
    Remove = 13,
    Mkdir = 14,
    Rmdir = 15,
    Realpath = 16,
    Stat = 17,
    Rename = 18,
    Readlink = 19,
    Symlink = 20,
    Status = 101,
    Handle = 102,
    Data = 103,
    Name = 104,
    Attrs = 105,
    Extended = 200,
    ExtendedReply = 201,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::Init,
            2 => Self::Version,
            3 => Self::Open,
            4 => Self::Close,
            5 => Self::Read,
            6 => Self::Write,
            7 => Self::Lstat,
            8 => Self::Fstat,
            9 => Self::Setstat,
            10 => Self::Fsetstat,
            11 => Self::Opendir,
            12 => Self::Readdir,
            13 => Self::Remove,
            14 => Self::Mkdir,
            15 => Self::Rmdir,
            16 => Self::Realpath,
            17 => Self::Stat,
            18 => Self::Rename,
            19 => Self::Readlink,
            20 => Self::Symlink,
            101 => Self::Status,
            102 => Self::Handle,
            103 => Self::Data,
            104 => Self::Name,
            105 => Self::Attrs,
            200 => Self::Extended,
            201 => Self::ExtendedReply,
            _ => return None,
        })
    }
}

/// ATTRS flag bits (`SSH_FILEXFER_ATTR_*`).
pub mod attr_flags {
    pub const SIZE: u32 = 0x0000_0001;
    pub const UIDGID: u32 = 0x0000_0002;
    pub const PERMISSIONS: u32 = 0x0000_0004;
    pub const ACMODTIME: u32 = 0x0000_0008;
    pub const EXTENDED: u32 = 0x8000_0000;
}

/// Codec failure.
///
/// Carries the request id whenever it could be read, so the caller can
/// answer BAD_MESSAGE to the right request instead of dropping it.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("truncated packet")]
    Truncated { id: Option<u32> },

    #[error("packet of {len} bytes exceeds the {MAX_PACKET_LEN} byte limit")]
    Oversized { len: u32, id: Option<u32> },

    #[error("string is not valid UTF-8")]
    InvalidUtf8 { id: Option<u32> },

    #[error("unexpected packet type {0}")]
    UnexpectedType(u8),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl WireError {
    /// Request id of the offending packet, when known.
    pub fn request_id(&self) -> Option<u32> {
        match self {
            WireError::Truncated { id }
            | WireError::Oversized { id, .. }
            | WireError::InvalidUtf8 { id } => *id,
            WireError::UnexpectedType(_) | WireError::Io(_) => None,
        }
    }

    /// True when the stream itself is unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WireError::Io(_))
    }
}

/// A decoded client packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// SSH_FXP_INIT with the client's version.
    Init(u32),
    /// A request the dispatcher understands.
    Request(Request),
    /// Extended or unknown packet type with a readable id.
    Unsupported { id: u32, kind: u8 },
}

/// A decoded server packet, for clients and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Version(u32),
    Status { id: u32, code: u32, message: String },
    Handle { id: u32, token: Vec<u8> },
    Data { id: u32, data: Vec<u8> },
    Name { id: u32, entries: Vec<DirEntry> },
    Attrs { id: u32, attrs: Attributes },
}

// ============================================================================
// Framing
// ============================================================================

/// Read one packet body (type byte onward). `Ok(None)` on clean EOF.
///
/// An oversized packet is drained from the stream and reported with its id,
/// so the connection can reply and keep going.
pub async fn read_packet<R>(reader: &mut R) -> Result<Option<Bytes>, WireError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if len == 0 {
        return Err(WireError::Truncated { id: None });
    }

    if len > MAX_PACKET_LEN {
        let mut head = [0u8; 5];
        reader.read_exact(&mut head).await?;
        let id = u32::from_be_bytes([head[1], head[2], head[3], head[4]]);
        let mut rest = reader.take((len - head.len() as u32) as u64);
        tokio::io::copy(&mut rest, &mut tokio::io::sink()).await?;
        return Err(WireError::Oversized { len, id: Some(id) });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(Some(Bytes::from(body)))
}

/// Build a framed packet: length placeholder, type, then `build`'s payload.
fn frame(kind: PacketType, build: impl FnOnce(&mut BytesMut)) -> Bytes {
    let mut out = BytesMut::with_capacity(64);
    out.put_u32(0);
    out.put_u8(kind as u8);
    build(&mut out);
    let len = (out.len() - 4) as u32;
    out[..4].copy_from_slice(&len.to_be_bytes());
    out.freeze()
}

// ============================================================================
// Primitive reader
// ============================================================================

struct Reader {
    buf: Bytes,
    id: Option<u32>,
}

impl Reader {
    fn new(buf: Bytes) -> Self {
        Self { buf, id: None }
    }

    fn need(&self, n: usize) -> Result<(), WireError> {
        if self.buf.remaining() < n {
            Err(WireError::Truncated { id: self.id })
        } else {
            Ok(())
        }
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    /// Read the request id and remember it for error reporting.
    fn id(&mut self) -> Result<u32, WireError> {
        let id = self.u32()?;
        self.id = Some(id);
        Ok(id)
    }

    fn bytes(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.u32()? as usize;
        self.need(len)?;
        Ok(self.buf.split_to(len).to_vec())
    }

    fn string(&mut self) -> Result<String, WireError> {
        let raw = self.bytes()?;
        String::from_utf8(raw).map_err(|_| WireError::InvalidUtf8 { id: self.id })
    }

    fn attrs(&mut self) -> Result<Attributes, WireError> {
        let flags = self.u32()?;
        let mut attrs = Attributes::new();

        if flags & attr_flags::SIZE != 0 {
            attrs.size = Some(self.u64()?);
        }
        if flags & attr_flags::UIDGID != 0 {
            attrs.uid = Some(self.u32()?);
            attrs.gid = Some(self.u32()?);
        }
        if flags & attr_flags::PERMISSIONS != 0 {
            attrs.mode = Some(self.u32()?);
        }
        if flags & attr_flags::ACMODTIME != 0 {
            attrs.atime = Some(self.u32()?);
            attrs.mtime = Some(self.u32()?);
        }
        if flags & attr_flags::EXTENDED != 0 {
            // Vendor extensions are parsed past and ignored.
            let count = self.u32()?;
            for _ in 0..count {
                self.bytes()?;
                self.bytes()?;
            }
        }
        Ok(attrs)
    }
}

fn put_string(out: &mut BytesMut, value: &[u8]) {
    out.put_u32(value.len() as u32);
    out.put_slice(value);
}

fn put_attrs(out: &mut BytesMut, attrs: &Attributes) {
    let mut flags = 0u32;
    if attrs.size.is_some() {
        flags |= attr_flags::SIZE;
    }
    if attrs.uid.is_some() && attrs.gid.is_some() {
        flags |= attr_flags::UIDGID;
    }
    if attrs.mode.is_some() {
        flags |= attr_flags::PERMISSIONS;
    }
    if attrs.atime.is_some() && attrs.mtime.is_some() {
        flags |= attr_flags::ACMODTIME;
    }

    out.put_u32(flags);
    if let Some(size) = attrs.size {
        out.put_u64(size);
    }
    if let (Some(uid), Some(gid)) = (attrs.uid, attrs.gid) {
        out.put_u32(uid);
        out.put_u32(gid);
    }
    if let Some(mode) = attrs.mode {
        out.put_u32(mode);
    }
    if let (Some(atime), Some(mtime)) = (attrs.atime, attrs.mtime) {
        out.put_u32(atime);
        out.put_u32(mtime);
    }
}

// ============================================================================
// Inbound
// ============================================================================

/// Decode a client packet body (type byte onward).
pub fn decode(body: Bytes) -> Result<Inbound, WireError> {
    let mut r = Reader::new(body);
    let kind = r.u8()?;

    let Some(packet) = PacketType::from_u8(kind) else {
        let id = r.id()?;
        return Ok(Inbound::Unsupported { id, kind });
    };

    if packet == PacketType::Init {
        return Ok(Inbound::Init(r.u32()?));
    }

    let id = r.id()?;
    let request = match packet {
        PacketType::Open => Request::Open {
            id,
            path: r.string()?,
            flags: OpenFlags::from_bits(r.u32()?),
            attrs: r.attrs()?,
        },
        PacketType::Close => Request::Close { id, handle: r.bytes()? },
        PacketType::Read => Request::Read {
            id,
            handle: r.bytes()?,
            offset: r.u64()?,
            len: r.u32()?,
        },
        PacketType::Write => Request::Write {
            id,
            handle: r.bytes()?,
            offset: r.u64()?,
            data: r.bytes()?,
        },
        PacketType::Lstat => Request::Lstat { id, path: r.string()? },
        PacketType::Fstat => Request::Fstat { id, handle: r.bytes()? },
        PacketType::Setstat => Request::Setstat {
            id,
            path: r.string()?,
            attrs: r.attrs()?,
        },
        PacketType::Fsetstat => Request::Fsetstat {
            id,
            handle: r.bytes()?,
            attrs: r.attrs()?,
        },
        PacketType::Opendir => Request::Opendir { id, path: r.string()? },
        PacketType::Readdir => Request::Readdir { id, handle: r.bytes()? },
        PacketType::Remove => Request::Remove { id, path: r.string()? },
        PacketType::Mkdir => Request::Mkdir {
            id,
            path: r.string()?,
            attrs: r.attrs()?,
        },
        PacketType::Rmdir => Request::Rmdir { id, path: r.string()? },
        PacketType::Realpath => Request::Realpath { id, path: r.string()? },
        PacketType::Stat => Request::Stat { id, path: r.string()? },
        PacketType::Rename => Request::Rename {
            id,
            old_path: r.string()?,
            new_path: r.string()?,
        },
        PacketType::Readlink => Request::Readlink { id, path: r.string()? },
        // OpenSSH order: target first, then the link to create.
        PacketType::Symlink => Request::Symlink {
            id,
            target_path: r.string()?,
            link_path: r.string()?,
        },
        PacketType::Init
        | PacketType::Version
        | PacketType::Status
        | PacketType::Handle
        | PacketType::Data
        | PacketType::Name
        | PacketType::Attrs
        | PacketType::Extended
        | PacketType::ExtendedReply => return Ok(Inbound::Unsupported { id, kind }),
    };

    Ok(Inbound::Request(request))
}

/// Encode a client request, as a client would send it.
pub fn encode_request(request: &Request) -> Bytes {
    match request {
        Request::Open { id, path, flags, attrs } => frame(PacketType::Open, |out| {
            out.put_u32(*id);
            put_string(out, path.as_bytes());
            out.put_u32(flags.bits());
            put_attrs(out, attrs);
        }),
        Request::Close { id, handle } => handle_only(PacketType::Close, *id, handle),
        Request::Read { id, handle, offset, len } => frame(PacketType::Read, |out| {
            out.put_u32(*id);
            put_string(out, handle);
            out.put_u64(*offset);
            out.put_u32(*len);
        }),
        Request::Write { id, handle, offset, data } => frame(PacketType::Write, |out| {
            out.put_u32(*id);
            put_string(out, handle);
            out.put_u64(*offset);
            put_string(out, data);
        }),
        Request::Lstat { id, path } => path_only(PacketType::Lstat, *id, path),
        Request::Fstat { id, handle } => handle_only(PacketType::Fstat, *id, handle),
        Request::Setstat { id, path, attrs } => frame(PacketType::Setstat, |out| {
            out.put_u32(*id);
            put_string(out, path.as_bytes());
            put_attrs(out, attrs);
        }),
        Request::Fsetstat { id, handle, attrs } => frame(PacketType::Fsetstat, |out| {
            out.put_u32(*id);
            put_string(out, handle);
            put_attrs(out, attrs);
        }),
        Request::Opendir { id, path } => path_only(PacketType::Opendir, *id, path),
        Request::Readdir { id, handle } => handle_only(PacketType::Readdir, *id, handle),
        Request::Remove { id, path } => path_only(PacketType::Remove, *id, path),
        Request::Mkdir { id, path, attrs } => frame(PacketType::Mkdir, |out| {
            out.put_u32(*id);
            put_string(out, path.as_bytes());
            put_attrs(out, attrs);
        }),
        Request::Rmdir { id, path } => path_only(PacketType::Rmdir, *id, path),
        Request::Realpath { id, path } => path_only(PacketType::Realpath, *id, path),
        Request::Stat { id, path } => path_only(PacketType::Stat, *id, path),
        Request::Rename { id, old_path, new_path } => frame(PacketType::Rename, |out| {
            out.put_u32(*id);
            put_string(out, old_path.as_bytes());
            put_string(out, new_path.as_bytes());
        }),
        Request::Readlink { id, path } => path_only(PacketType::Readlink, *id, path),
        Request::Symlink { id, target_path, link_path } => frame(PacketType::Symlink, |out| {
            out.put_u32(*id);
            put_string(out, target_path.as_bytes());
            put_string(out, link_path.as_bytes());
        }),
    }
}

/// Encode SSH_FXP_INIT.
pub fn encode_init(version: u32) -> Bytes {
    frame(PacketType::Init, |out| out.put_u32(version))
}

fn path_only(kind: PacketType, id: u32, path: &str) -> Bytes {
    frame(kind, |out| {
        out.put_u32(id);
        put_string(out, path.as_bytes());
    })
}

fn handle_only(kind: PacketType, id: u32, handle: &[u8]) -> Bytes {
    frame(kind, |out| {
        out.put_u32(id);
        put_string(out, handle);
    })
}

// ============================================================================
// Outbound
// ============================================================================

/// SSH_FXP_VERSION with no extensions.
pub fn encode_version(version: u32) -> Bytes {
    frame(PacketType::Version, |out| out.put_u32(version))
}

/// SSH_FXP_STATUS. An empty message falls back to the code's default text.
pub fn encode_status(id: u32, code: StatusCode, message: &str) -> Bytes {
    let message = if message.is_empty() { code.message() } else { message };
    frame(PacketType::Status, |out| {
        out.put_u32(id);
        out.put_u32(code as u32);
        put_string(out, message.as_bytes());
        put_string(out, b"");
    })
}

pub fn encode_handle(id: u32, token: &[u8]) -> Bytes {
    frame(PacketType::Handle, |out| {
        out.put_u32(id);
        put_string(out, token);
    })
}

pub fn encode_data(id: u32, data: &[u8]) -> Bytes {
    frame(PacketType::Data, |out| {
        out.put_u32(id);
        put_string(out, data);
    })
}

pub fn encode_name(id: u32, entries: &[DirEntry]) -> Bytes {
    frame(PacketType::Name, |out| {
        out.put_u32(id);
        out.put_u32(entries.len() as u32);
        for entry in entries {
            put_string(out, entry.filename.as_bytes());
            put_string(out, entry.longname.as_bytes());
            put_attrs(out, &entry.attrs);
        }
    })
}

pub fn encode_attrs(id: u32, attrs: &Attributes) -> Bytes {
    frame(PacketType::Attrs, |out| {
        out.put_u32(id);
        put_attrs(out, attrs);
    })
}

/// Decode a server packet body (type byte onward).
pub fn decode_response(body: Bytes) -> Result<Response, WireError> {
    let mut r = Reader::new(body);
    let kind = r.u8()?;

    match PacketType::from_u8(kind) {
        Some(PacketType::Version) => Ok(Response::Version(r.u32()?)),
        Some(PacketType::Status) => {
            let id = r.id()?;
            let code = r.u32()?;
            let message = r.string()?;
            Ok(Response::Status { id, code, message })
        }
        Some(PacketType::Handle) => {
            let id = r.id()?;
            Ok(Response::Handle { id, token: r.bytes()? })
        }
        Some(PacketType::Data) => {
            let id = r.id()?;
            Ok(Response::Data { id, data: r.bytes()? })
        }
        Some(PacketType::Name) => {
            let id = r.id()?;
            let count = r.u32()?;
            let mut entries = Vec::new();
            for _ in 0..count {
                let filename = r.string()?;
                let longname = r.string()?;
                let attrs = r.attrs()?;
                entries.push(DirEntry::new(filename, longname, attrs));
            }
            Ok(Response::Name { id, entries })
        }
        Some(PacketType::Attrs) => {
            let id = r.id()?;
            Ok(Response::Attrs { id, attrs: r.attrs()? })
        }
        _ => Err(WireError::UnexpectedType(kind)),
    }
}
