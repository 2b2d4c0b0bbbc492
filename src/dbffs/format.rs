//! DBFFS on-image format definitions.
//!
//! An image starts with a 4-byte signature followed by a chain of entry records:
//!
//! ```text
//! signature: u32        one of FILE_SIG, DIRECTORY_SIG, LINK_SIG
//! next:      u32        bytes from the start of this field to the next record, 0 on the last
//! name_len:  u8
//! name:      [u8; name_len]
//! ```
//!
//! The name is followed by the type-specific body: a `u16` child count for directories, the
//! `size`/`csize` pair and the payload for files, and a length-prefixed target for links.
//!
//! Multi-byte integers use the byte order chosen at build time, which has to match the device.

// Integers are stored as raw byte arrays so the same structs serve both byte orders.

use std::fmt;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const IMAGE_SIG: u32 = 0xDBFF5000;
pub const FILE_SIG: u32 = 0xDBFF500F;
pub const DIRECTORY_SIG: u32 = 0xDBFF500D;
pub const LINK_SIG: u32 = 0xDBFF5001;

/// Position of the `next` field inside a record.  Offsets are measured from here.
pub const NEXT_FIELD_OFFSET: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Endian {
    /// The byte order of the ESP8266.
    #[default]
    Little,
    Big,
}

impl Endian {
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            Endian::Big
        } else {
            Endian::Little
        }
    }

    pub fn u16_bytes(self, value: u16) -> [u8; 2] {
        match self {
            Endian::Little => value.to_le_bytes(),
            Endian::Big => value.to_be_bytes(),
        }
    }

    pub fn u32_bytes(self, value: u32) -> [u8; 4] {
        match self {
            Endian::Little => value.to_le_bytes(),
            Endian::Big => value.to_be_bytes(),
        }
    }

    pub fn read_u16(self, bytes: [u8; 2]) -> u16 {
        match self {
            Endian::Little => u16::from_le_bytes(bytes),
            Endian::Big => u16::from_be_bytes(bytes),
        }
    }

    pub fn read_u32(self, bytes: [u8; 4]) -> u32 {
        match self {
            Endian::Little => u32::from_le_bytes(bytes),
            Endian::Big => u32::from_be_bytes(bytes),
        }
    }
}

impl fmt::Display for Endian {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Endian::Little => "little-endian",
            Endian::Big => "big-endian",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    File,
    Directory,
    Link,
}

impl EntryType {
    pub fn signature(self) -> u32 {
        match self {
            EntryType::File => FILE_SIG,
            EntryType::Directory => DIRECTORY_SIG,
            EntryType::Link => LINK_SIG,
        }
    }

    pub fn from_signature(signature: u32) -> Option<Self> {
        match signature {
            FILE_SIG => Some(EntryType::File),
            DIRECTORY_SIG => Some(EntryType::Directory),
            LINK_SIG => Some(EntryType::Link),
            _ => None,
        }
    }
}

/// The fixed part at the start of every record.
#[derive(Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned)]
#[repr(C)]
pub struct EntryHeader {
    pub signature: [u8; 4],
    pub next: [u8; 4],
    pub name_len: u8,
}

impl EntryHeader {
    pub fn new(endian: Endian, kind: EntryType, next: u32, name_len: u8) -> Self {
        Self {
            signature: endian.u32_bytes(kind.signature()),
            next: endian.u32_bytes(next),
            name_len,
        }
    }

    pub fn signature(&self, endian: Endian) -> u32 {
        endian.read_u32(self.signature)
    }

    pub fn next(&self, endian: Endian) -> u32 {
        endian.read_u32(self.next)
    }
}

/// Follows the name of a file record.
#[derive(Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned)]
#[repr(C)]
pub struct FileHeader {
    pub size: [u8; 4],
    /// 0 when the payload is stored uncompressed.
    pub csize: [u8; 4],
}

impl FileHeader {
    pub fn new(endian: Endian, size: u32, csize: u32) -> Self {
        Self {
            size: endian.u32_bytes(size),
            csize: endian.u32_bytes(csize),
        }
    }

    pub fn size(&self, endian: Endian) -> u32 {
        endian.read_u32(self.size)
    }

    pub fn csize(&self, endian: Endian) -> u32 {
        endian.read_u32(self.csize)
    }
}
