//! Bit-flag sets used on the wire.
//!
//! Encoding is the bitwise OR of the members; decoding refuses integers carrying bits outside the
//! known set.

use bitflags::{Flags, bitflags};

use crate::wire::WireError;

bitflags! {
    /// `SSH_FXF_*` flags of an OPEN request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OpenFlags: u32 {
        const READ = 0x0000_0001;
        const WRITE = 0x0000_0002;
        const APPEND = 0x0000_0004;
        const CREAT = 0x0000_0008;
        const TRUNC = 0x0000_0010;
        const EXCL = 0x0000_0020;
    }
}

bitflags! {
    /// `SSH_FXF_RENAME_*` flags of a RENAME request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RenameFlags: u32 {
        const OVERWRITE = 0x0000_0001;
        const ATOMIC = 0x0000_0002;
        const NATIVE = 0x0000_0004;
    }
}

bitflags! {
    /// `SSH_FILEXFER_ATTR_*` bits announcing which fields follow in an attribute block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AttrFlags: u32 {
        const SIZE = 0x0000_0001;
        const UIDGID = 0x0000_0002;
        const PERMISSIONS = 0x0000_0004;
        const ACMODTIME = 0x0000_0008;
        const EXTENDED = 0x8000_0000;
    }
}

fn decode<F: Flags<Bits = u32>>(kind: &'static str, bits: u32) -> Result<F, WireError> {
    F::from_bits(bits).ok_or(WireError::InvalidFlags { kind, bits })
}

fn render<F: Flags<Bits = u32>>(flags: &F, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    if flags.is_empty() {
        return write!(f, "0");
    }
    bitflags::parser::to_writer(flags, f)
}

impl OpenFlags {
    pub fn decode(bits: u32) -> Result<Self, WireError> {
        decode("open", bits)
    }
}

impl RenameFlags {
    pub fn decode(bits: u32) -> Result<Self, WireError> {
        decode("rename", bits)
    }
}

impl AttrFlags {
    pub fn decode(bits: u32) -> Result<Self, WireError> {
        decode("attribute", bits)
    }
}

impl std::fmt::Display for OpenFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        render(self, f)
    }
}

impl std::fmt::Display for RenameFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        render(self, f)
    }
}

impl std::fmt::Display for AttrFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        render(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_as_bitwise_or() {
        let flags = OpenFlags::WRITE | OpenFlags::CREAT | OpenFlags::TRUNC;
        assert_eq!(flags.bits(), 0x1a);
        assert!(flags.contains(OpenFlags::CREAT));
        assert!(!flags.contains(OpenFlags::EXCL));
        assert_eq!(flags.to_string(), "WRITE | CREAT | TRUNC");
    }

    #[test]
    fn decoding_rejects_unknown_bits() {
        assert_eq!(
            OpenFlags::decode(0x40),
            Err(WireError::InvalidFlags {
                kind: "open",
                bits: 0x40
            })
        );
        assert!(RenameFlags::decode(0x8).is_err());
        assert!(AttrFlags::decode(0x10).is_err());
        assert_eq!(
            AttrFlags::decode(0x8000_0001).unwrap(),
            AttrFlags::SIZE | AttrFlags::EXTENDED
        );
    }

    #[test]
    fn empty_set_renders_as_zero() {
        assert_eq!(RenameFlags::empty().to_string(), "0");
        assert_eq!(RenameFlags::decode(0).unwrap(), RenameFlags::empty());
    }
}
