//! Server answers.
//!
//! Dispatch on the type byte is a plain `match`; anything that is not an answer kind (or has
//! bytes left over after its fields) is malformed data.

use bytes::{BufMut, Bytes, BytesMut};

use crate::attrs::FileAttributes;
use crate::request::PacketType;
use crate::status::Status;
use crate::wire::{self, Reader, WireError};

/// One entry of a NAME answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameEntry {
    pub filename: String,
    /// `ls -l` style rendering, informational only
    pub longname: String,
    pub attrs: FileAttributes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    Status(Status),
    Handle(Bytes),
    Data(Bytes),
    Name(Vec<NameEntry>),
    Attrs(FileAttributes),
    ExtendedReply(Bytes),
}

impl Answer {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Answer::Status(_) => PacketType::Status,
            Answer::Handle(_) => PacketType::Handle,
            Answer::Data(_) => PacketType::Data,
            Answer::Name(_) => PacketType::Name,
            Answer::Attrs(_) => PacketType::Attrs,
            Answer::ExtendedReply(_) => PacketType::ExtendedReply,
        }
    }

    pub fn status(&self) -> Option<&Status> {
        match self {
            Answer::Status(status) => Some(status),
            _ => None,
        }
    }

    /// Parses an answer body, returning the id of the request it answers.
    pub fn decode(body: Bytes) -> Result<(u32, Self), WireError> {
        let mut reader = Reader::new(body);
        if reader.remaining() == 0 {
            return Err(WireError::Empty);
        }
        let raw = reader.u8("packet type")?;
        let packet_type = PacketType::decode(raw)?;
        let id = reader.u32("request id")?;
        let answer = match packet_type {
            PacketType::Status => Answer::Status(Status::decode(&mut reader)?),
            PacketType::Handle => Answer::Handle(reader.data("handle")?),
            PacketType::Data => Answer::Data(reader.data("data")?),
            PacketType::Name => {
                let count = reader.u32("name count")?;
                let mut entries = Vec::new();
                for _ in 0..count {
                    entries.push(NameEntry {
                        filename: reader.string("filename")?,
                        longname: reader.string("longname")?,
                        attrs: FileAttributes::decode(&mut reader)?,
                    });
                }
                Answer::Name(entries)
            }
            PacketType::Attrs => Answer::Attrs(FileAttributes::decode(&mut reader)?),
            PacketType::ExtendedReply => Answer::ExtendedReply(reader.rest()),
            _ => {
                return Err(WireError::UnexpectedPacketType {
                    expected: "answer",
                    got: raw,
                });
            }
        };
        reader.finish("answer")?;
        Ok((id, answer))
    }

    pub fn encode(&self, id: u32) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(self.packet_type() as u8);
        buf.put_u32(id);
        match self {
            Answer::Status(status) => status.encode(&mut buf),
            Answer::Handle(data) | Answer::Data(data) => wire::put_data(&mut buf, data),
            Answer::Name(entries) => {
                buf.put_u32(entries.len() as u32);
                for entry in entries {
                    wire::put_string(&mut buf, &entry.filename);
                    wire::put_string(&mut buf, &entry.longname);
                    entry.attrs.encode(&mut buf);
                }
            }
            Answer::Attrs(attrs) => attrs.encode(&mut buf),
            Answer::ExtendedReply(data) => buf.put_slice(data),
        }
        buf.freeze()
    }
}

impl std::fmt::Display for Answer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Answer::Status(status) => write!(f, "STATUS {status}"),
            Answer::Handle(handle) => write!(f, "HANDLE {handle:?}"),
            Answer::Data(data) => write!(f, "DATA {} bytes", data.len()),
            Answer::Name(entries) => {
                write!(f, "NAME")?;
                for entry in entries {
                    write!(f, " {:?}", entry.filename)?;
                }
                Ok(())
            }
            Answer::Attrs(attrs) => write!(f, "ATTRS {attrs:?}"),
            Answer::ExtendedReply(data) => write!(f, "EXTENDED_REPLY {} bytes", data.len()),
        }
    }
}

/// The server's reply to INIT: its protocol version and the extensions it announces.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Version {
    pub version: u32,
    pub extensions: Vec<(String, String)>,
}

impl Version {
    pub fn decode(body: Bytes) -> Result<Self, WireError> {
        let mut reader = Reader::new(body);
        let raw = reader.u8("packet type")?;
        if raw != PacketType::Version as u8 {
            return Err(WireError::UnexpectedPacketType {
                expected: "VERSION",
                got: raw,
            });
        }
        let version = reader.u32("protocol version")?;
        let mut extensions = Vec::new();
        while reader.remaining() > 0 {
            let name = reader.string("extension name")?;
            let data = reader.string("extension data")?;
            extensions.push((name, data));
        }
        Ok(Self {
            version,
            extensions,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(PacketType::Version as u8);
        buf.put_u32(self.version);
        for (name, data) in &self.extensions {
            wire::put_string(&mut buf, name);
            wire::put_string(&mut buf, data);
        }
        buf.freeze()
    }
}
