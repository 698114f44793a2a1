//! File attribute blocks.
//!
//! ```text
//! uint32   flags
//! uint64   size              present if flags & SIZE
//! uint32   uid, gid          present if flags & UIDGID
//! uint32   permissions       present if flags & PERMISSIONS
//! uint32   atime, mtime      present if flags & ACMODTIME
//! uint32   extended_count    present if flags & EXTENDED
//! string   extended_type     repeated extended_count times,
//! data     extended_data     each type followed by its data
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::flags::AttrFlags;
use crate::wire::{self, Reader, WireError};

/// Attributes of a remote file; absent fields are simply not transmitted.
///
/// The flag word is derived from which fields are set, so an encoded block is always consistent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttributes {
    pub size: Option<u64>,
    pub uid_gid: Option<(u32, u32)>,
    pub permissions: Option<u32>,
    /// access and modification time, seconds since the epoch
    pub times: Option<(u32, u32)>,
    /// vendor specific `name@domain` pairs, carried opaquely
    pub extended: Vec<(String, Bytes)>,
}

impl FileAttributes {
    pub fn with_permissions(mode: u32) -> Self {
        Self {
            permissions: Some(mode),
            ..Default::default()
        }
    }

    pub fn flags(&self) -> AttrFlags {
        let mut flags = AttrFlags::empty();
        if self.size.is_some() {
            flags |= AttrFlags::SIZE;
        }
        if self.uid_gid.is_some() {
            flags |= AttrFlags::UIDGID;
        }
        if self.permissions.is_some() {
            flags |= AttrFlags::PERMISSIONS;
        }
        if self.times.is_some() {
            flags |= AttrFlags::ACMODTIME;
        }
        if !self.extended.is_empty() {
            flags |= AttrFlags::EXTENDED;
        }
        flags
    }

    pub fn is_empty(&self) -> bool {
        self.flags().is_empty()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.flags().bits());
        if let Some(size) = self.size {
            buf.put_u64(size);
        }
        if let Some((uid, gid)) = self.uid_gid {
            buf.put_u32(uid);
            buf.put_u32(gid);
        }
        if let Some(permissions) = self.permissions {
            buf.put_u32(permissions);
        }
        if let Some((atime, mtime)) = self.times {
            buf.put_u32(atime);
            buf.put_u32(mtime);
        }
        if !self.extended.is_empty() {
            buf.put_u32(self.extended.len() as u32);
            for (name, value) in &self.extended {
                wire::put_string(buf, name);
                wire::put_data(buf, value);
            }
        }
    }

    pub fn decode(reader: &mut Reader) -> Result<Self, WireError> {
        let flags = AttrFlags::decode(reader.u32("attribute flags")?)?;
        let mut attrs = Self::default();
        if flags.contains(AttrFlags::SIZE) {
            attrs.size = Some(reader.u64("size attribute")?);
        }
        if flags.contains(AttrFlags::UIDGID) {
            let uid = reader.u32("uid attribute")?;
            let gid = reader.u32("gid attribute")?;
            attrs.uid_gid = Some((uid, gid));
        }
        if flags.contains(AttrFlags::PERMISSIONS) {
            attrs.permissions = Some(reader.u32("permissions attribute")?);
        }
        if flags.contains(AttrFlags::ACMODTIME) {
            let atime = reader.u32("atime attribute")?;
            let mtime = reader.u32("mtime attribute")?;
            attrs.times = Some((atime, mtime));
        }
        if flags.contains(AttrFlags::EXTENDED) {
            let count = reader.u32("extended attribute count")?;
            for _ in 0..count {
                let name = reader.string("extended attribute name")?;
                let value = reader.data("extended attribute value")?;
                attrs.extended.push((name, value));
            }
        }
        Ok(attrs)
    }
}
