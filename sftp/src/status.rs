//! Result codes carried by STATUS answers.

use bytes::{BufMut, BytesMut};

use crate::wire::{self, Reader, WireError};

/// `SSH_FX_*` result codes of protocol version 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::FromRepr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(u32)]
pub enum StatusCode {
    Ok = 0,
    Eof = 1,
    NoSuchFile = 2,
    PermissionDenied = 3,
    Failure = 4,
    BadMessage = 5,
    NoConnection = 6,
    ConnectionLost = 7,
    OpUnsupported = 8,
    InvalidHandle = 9,
    NoSuchPath = 10,
    FileAlreadyExists = 11,
    WriteProtect = 12,
    NoMedia = 13,
}

impl StatusCode {
    pub fn decode(code: u32) -> Result<Self, WireError> {
        Self::from_repr(code).ok_or(WireError::UnknownStatus(code))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
    pub language: String,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            language: String::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.code as u32);
        wire::put_string(buf, &self.message);
        wire::put_string(buf, &self.language);
    }

    pub(crate) fn decode(reader: &mut Reader) -> Result<Self, WireError> {
        let code = StatusCode::decode(reader.u32("status code")?)?;
        let message = reader.string("status message")?;
        let language = reader.string("status language")?;
        Ok(Self {
            code,
            message,
            language,
        })
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}
