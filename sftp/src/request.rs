//! Client requests.
//!
//! Every request body is `type | id | fields`, except INIT which carries the protocol version in
//! place of an id. Only the fields of the given operation are rendered.

use bytes::{BufMut, Bytes, BytesMut};

use crate::attrs::FileAttributes;
use crate::flags::{OpenFlags, RenameFlags};
use crate::wire::{self, Reader, WireError};

/// Message discriminants of protocol version 3, requests and answers alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::FromRepr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
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
    pub fn decode(raw: u8) -> Result<Self, WireError> {
        Self::from_repr(raw).ok_or(WireError::UnknownPacketType(raw))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Open {
        path: String,
        flags: OpenFlags,
        attrs: FileAttributes,
    },
    Close {
        handle: Bytes,
    },
    Read {
        handle: Bytes,
        offset: u64,
        len: u32,
    },
    Write {
        handle: Bytes,
        offset: u64,
        data: Bytes,
    },
    Lstat {
        path: String,
    },
    Fstat {
        handle: Bytes,
    },
    Setstat {
        path: String,
        attrs: FileAttributes,
    },
    Fsetstat {
        handle: Bytes,
        attrs: FileAttributes,
    },
    Opendir {
        path: String,
    },
    Readdir {
        handle: Bytes,
    },
    Remove {
        path: String,
    },
    Mkdir {
        path: String,
        attrs: FileAttributes,
    },
    Rmdir {
        path: String,
    },
    Realpath {
        path: String,
    },
    Stat {
        path: String,
    },
    /// The flag word is a v4 addition; v3 servers ignore it.
    Rename {
        src: String,
        dst: String,
        flags: RenameFlags,
    },
    Readlink {
        path: String,
    },
    /// Creates `link` pointing at `target`. On the wire the target comes first, which is the order
    /// OpenSSH uses (it differs from the draft).
    Symlink {
        link: String,
        target: String,
    },
    Extended {
        name: String,
        data: Bytes,
    },
}

/// Encodes the INIT message body.
pub fn encode_init(version: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(PacketType::Init as u8);
    buf.put_u32(version);
    buf.freeze()
}

/// Decodes an INIT message body, returning the offered protocol version.
pub fn decode_init(body: Bytes) -> Result<u32, WireError> {
    let mut reader = Reader::new(body);
    let raw = reader.u8("packet type")?;
    if raw != PacketType::Init as u8 {
        return Err(WireError::UnexpectedPacketType {
            expected: "INIT",
            got: raw,
        });
    }
    let version = reader.u32("protocol version")?;
    reader.finish("INIT")?;
    Ok(version)
}

impl Request {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Request::Open { .. } => PacketType::Open,
            Request::Close { .. } => PacketType::Close,
            Request::Read { .. } => PacketType::Read,
            Request::Write { .. } => PacketType::Write,
            Request::Lstat { .. } => PacketType::Lstat,
            Request::Fstat { .. } => PacketType::Fstat,
            Request::Setstat { .. } => PacketType::Setstat,
            Request::Fsetstat { .. } => PacketType::Fsetstat,
            Request::Opendir { .. } => PacketType::Opendir,
            Request::Readdir { .. } => PacketType::Readdir,
            Request::Remove { .. } => PacketType::Remove,
            Request::Mkdir { .. } => PacketType::Mkdir,
            Request::Rmdir { .. } => PacketType::Rmdir,
            Request::Realpath { .. } => PacketType::Realpath,
            Request::Stat { .. } => PacketType::Stat,
            Request::Rename { .. } => PacketType::Rename,
            Request::Readlink { .. } => PacketType::Readlink,
            Request::Symlink { .. } => PacketType::Symlink,
            Request::Extended { .. } => PacketType::Extended,
        }
    }

    /// Renders the message body (everything after the length prefix) for request `id`.
    pub fn encode(&self, id: u32) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size_hint());
        buf.put_u8(self.packet_type() as u8);
        buf.put_u32(id);
        match self {
            Request::Open { path, flags, attrs } => {
                wire::put_string(&mut buf, path);
                buf.put_u32(flags.bits());
                attrs.encode(&mut buf);
            }
            Request::Close { handle }
            | Request::Fstat { handle }
            | Request::Readdir { handle } => {
                wire::put_data(&mut buf, handle);
            }
            Request::Read {
                handle,
                offset,
                len,
            } => {
                wire::put_data(&mut buf, handle);
                buf.put_u64(*offset);
                buf.put_u32(*len);
            }
            Request::Write {
                handle,
                offset,
                data,
            } => {
                wire::put_data(&mut buf, handle);
                buf.put_u64(*offset);
                wire::put_data(&mut buf, data);
            }
            Request::Lstat { path }
            | Request::Opendir { path }
            | Request::Remove { path }
            | Request::Rmdir { path }
            | Request::Realpath { path }
            | Request::Stat { path }
            | Request::Readlink { path } => {
                wire::put_string(&mut buf, path);
            }
            Request::Setstat { path, attrs } | Request::Mkdir { path, attrs } => {
                wire::put_string(&mut buf, path);
                attrs.encode(&mut buf);
            }
            Request::Fsetstat { handle, attrs } => {
                wire::put_data(&mut buf, handle);
                attrs.encode(&mut buf);
            }
            Request::Rename { src, dst, flags } => {
                wire::put_string(&mut buf, src);
                wire::put_string(&mut buf, dst);
                buf.put_u32(flags.bits());
            }
            Request::Symlink { link, target } => {
                wire::put_string(&mut buf, target);
                wire::put_string(&mut buf, link);
            }
            Request::Extended { name, data } => {
                wire::put_string(&mut buf, name);
                buf.put_slice(data);
            }
        }
        buf.freeze()
    }

    fn size_hint(&self) -> usize {
        // type + id + a little room for the fixed fields
        let fixed = 32;
        match self {
            Request::Write { handle, data, .. } => fixed + handle.len() + data.len(),
            Request::Extended { name, data } => fixed + name.len() + data.len(),
            _ => fixed + 64,
        }
    }

    /// Parses a request body as produced by [`Request::encode`], returning its id.
    pub fn decode(body: Bytes) -> Result<(u32, Self), WireError> {
        let mut reader = Reader::new(body);
        let raw = reader.u8("packet type")?;
        let packet_type = PacketType::decode(raw)?;
        let id = reader.u32("request id")?;
        let request = match packet_type {
            PacketType::Open => Request::Open {
                path: reader.string("filename")?,
                flags: OpenFlags::decode(reader.u32("open flags")?)?,
                attrs: FileAttributes::decode(&mut reader)?,
            },
            PacketType::Close => Request::Close {
                handle: reader.data("handle")?,
            },
            PacketType::Read => Request::Read {
                handle: reader.data("handle")?,
                offset: reader.u64("offset")?,
                len: reader.u32("length")?,
            },
            PacketType::Write => Request::Write {
                handle: reader.data("handle")?,
                offset: reader.u64("offset")?,
                data: reader.data("write data")?,
            },
            PacketType::Lstat => Request::Lstat {
                path: reader.string("path")?,
            },
            PacketType::Fstat => Request::Fstat {
                handle: reader.data("handle")?,
            },
            PacketType::Setstat => Request::Setstat {
                path: reader.string("path")?,
                attrs: FileAttributes::decode(&mut reader)?,
            },
            PacketType::Fsetstat => Request::Fsetstat {
                handle: reader.data("handle")?,
                attrs: FileAttributes::decode(&mut reader)?,
            },
            PacketType::Opendir => Request::Opendir {
                path: reader.string("path")?,
            },
            PacketType::Readdir => Request::Readdir {
                handle: reader.data("handle")?,
            },
            PacketType::Remove => Request::Remove {
                path: reader.string("filename")?,
            },
            PacketType::Mkdir => Request::Mkdir {
                path: reader.string("path")?,
                attrs: FileAttributes::decode(&mut reader)?,
            },
            PacketType::Rmdir => Request::Rmdir {
                path: reader.string("path")?,
            },
            PacketType::Realpath => Request::Realpath {
                path: reader.string("path")?,
            },
            PacketType::Stat => Request::Stat {
                path: reader.string("path")?,
            },
            PacketType::Rename => Request::Rename {
                src: reader.string("old path")?,
                dst: reader.string("new path")?,
                flags: RenameFlags::decode(reader.u32("rename flags")?)?,
            },
            PacketType::Readlink => Request::Readlink {
                path: reader.string("path")?,
            },
            PacketType::Symlink => {
                let target = reader.string("link target")?;
                let link = reader.string("link path")?;
                Request::Symlink { link, target }
            }
            PacketType::Extended => Request::Extended {
                name: reader.string("extended request name")?,
                data: reader.rest(),
            },
            PacketType::Init
            | PacketType::Version
            | PacketType::Status
            | PacketType::Handle
            | PacketType::Data
            | PacketType::Name
            | PacketType::Attrs
            | PacketType::ExtendedReply => {
                return Err(WireError::UnexpectedPacketType {
                    expected: "request",
                    got: raw,
                });
            }
        };
        reader.finish("request")?;
        Ok((id, request))
    }
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = self.packet_type();
        match self {
            Request::Open { path, flags, .. } => write!(f, "{kind}({path:?}, {flags})"),
            Request::Close { handle }
            | Request::Fstat { handle }
            | Request::Readdir { handle }
            | Request::Fsetstat { handle, .. } => write!(f, "{kind}({handle:?})"),
            Request::Read {
                handle,
                offset,
                len,
            } => write!(f, "{kind}({handle:?}, {offset}, {len})"),
            Request::Write {
                handle,
                offset,
                data,
            } => write!(f, "{kind}({handle:?}, {offset}, {} bytes)", data.len()),
            Request::Lstat { path }
            | Request::Opendir { path }
            | Request::Remove { path }
            | Request::Rmdir { path }
            | Request::Realpath { path }
            | Request::Stat { path }
            | Request::Readlink { path }
            | Request::Setstat { path, .. }
            | Request::Mkdir { path, .. } => write!(f, "{kind}({path:?})"),
            Request::Rename { src, dst, flags } => write!(f, "{kind}({src:?}, {dst:?}, {flags})"),
            Request::Symlink { link, target } => write!(f, "{kind}({link:?} -> {target:?})"),
            Request::Extended { name, data } => {
                write!(f, "{kind}({name:?}, {} bytes)", data.len())
            }
        }
    }
}
