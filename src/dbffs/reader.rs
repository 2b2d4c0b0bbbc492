//! Parsing DBFFS images the way the device does: a forward scan over flash reads.

use std::io;

use log::trace;
use thiserror::Error;
use zerocopy::{FromBytes, IntoBytes};

use crate::{
    compress::decompress,
    dbffs::format::{Endian, EntryHeader, EntryType, FileHeader, IMAGE_SIG, NEXT_FIELD_OFFSET},
    flash::{FlashError, FlashRead},
    DEFAULT_MAX_DEPTH,
};

#[derive(Error, Debug)]
pub enum ReaderError {
    #[error(transparent)]
    Flash(#[from] FlashError),
    #[error("Bad image signature {0:#010x}")]
    BadImageSignature(u32),
    #[error("Bad entry signature {signature:#010x} at offset {offset:#x}")]
    BadEntrySignature { signature: u32, offset: usize },
    #[error("No entry named {0:?}")]
    NotFound(String),
    #[error("{0:?} is not a file")]
    NotAFile(String),
    #[error("Too many link hops resolving {0:?}")]
    DepthExceeded(String),
    #[error("Failed to decompress {0:?}")]
    Decompress(String, #[source] io::Error),
    #[error("{name:?} decompressed to {got} bytes, expected {expected}")]
    SizeMismatch {
        name: String,
        expected: u32,
        got: usize,
    },
}

type ReadResult<T> = Result<T, ReaderError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryBody {
    Directory {
        entries: u16,
    },
    File {
        size: u32,
        /// 0 for raw payloads.
        csize: u32,
        /// Absolute position of the payload in the region.
        data_offset: usize,
    },
    Link {
        target: Box<[u8]>,
    },
}

/// One parsed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Position of the record's signature.
    pub offset: usize,
    pub next: u32,
    pub name: Box<[u8]>,
    pub body: EntryBody,
}

impl Entry {
    pub fn kind(&self) -> EntryType {
        match self.body {
            EntryBody::Directory { .. } => EntryType::Directory,
            EntryBody::File { .. } => EntryType::File,
            EntryBody::Link { .. } => EntryType::Link,
        }
    }

    /// Position of the following record, or `None` for the last one.
    pub fn next_offset(&self) -> Option<usize> {
        match self.next {
            0 => None,
            next => Some(self.offset + NEXT_FIELD_OFFSET + next as usize),
        }
    }

    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

#[derive(Debug)]
pub struct Reader<F> {
    flash: F,
    endian: Endian,
}

impl<F: FlashRead> Reader<F> {
    /// Checks the image signature at the start of `flash`.
    pub fn open(flash: F, endian: Endian) -> ReadResult<Self> {
        let reader = Self { flash, endian };
        let signature = reader.read_u32(0)?;
        if signature != IMAGE_SIG {
            return Err(ReaderError::BadImageSignature(signature));
        }
        Ok(reader)
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    fn read_bytes(&self, offset: usize, len: usize) -> ReadResult<Box<[u8]>> {
        let mut buf = vec![0; len];
        self.flash.read(&mut buf, offset)?;
        Ok(buf.into_boxed_slice())
    }

    fn read_struct<T: FromBytes + IntoBytes>(&self, offset: usize) -> ReadResult<T> {
        let mut value = T::new_zeroed();
        self.flash.read(value.as_mut_bytes(), offset)?;
        Ok(value)
    }

    fn read_u32(&self, offset: usize) -> ReadResult<u32> {
        Ok(self.endian.read_u32(self.read_struct(offset)?))
    }

    /// Parses the record starting at `offset`.
    pub fn entry_at(&self, offset: usize) -> ReadResult<Entry> {
        let header: EntryHeader = self.read_struct(offset)?;
        let signature = header.signature(self.endian);
        let Some(kind) = EntryType::from_signature(signature) else {
            return Err(ReaderError::BadEntrySignature { signature, offset });
        };

        let name_offset = offset + size_of::<EntryHeader>();
        let name = self.read_bytes(name_offset, header.name_len as usize)?;
        let body_offset = name_offset + name.len();

        let body = match kind {
            EntryType::Directory => EntryBody::Directory {
                entries: self.endian.read_u16(self.read_struct(body_offset)?),
            },
            EntryType::File => {
                let file: FileHeader = self.read_struct(body_offset)?;
                EntryBody::File {
                    size: file.size(self.endian),
                    csize: file.csize(self.endian),
                    data_offset: body_offset + size_of::<FileHeader>(),
                }
            }
            EntryType::Link => {
                let [len]: [u8; 1] = self.read_struct(body_offset)?;
                EntryBody::Link {
                    target: self.read_bytes(body_offset + 1, len as usize)?,
                }
            }
        };

        Ok(Entry {
            offset,
            next: header.next(self.endian),
            name,
            body,
        })
    }

    /// Iterates over all records in chain order.
    pub fn entries(&self) -> Entries<'_, F> {
        let first = size_of::<u32>();
        Entries {
            reader: self,
            next: (first < self.flash.size()).then_some(first),
        }
    }

    /// Finds the record called exactly `name` (no leading separator).
    pub fn find(&self, name: &[u8]) -> ReadResult<Option<Entry>> {
        for entry in self.entries() {
            let entry = entry?;
            if *entry.name == *name {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Looks up `path`, following link entries.
    pub fn lookup(&self, path: &[u8]) -> ReadResult<Entry> {
        let mut path = path.to_vec();
        for _ in 0..=DEFAULT_MAX_DEPTH {
            let name = path.strip_prefix(b"/").unwrap_or(&path[..]);
            trace!("lookup {:?}", String::from_utf8_lossy(name));
            let Some(entry) = self.find(name)? else {
                return Err(ReaderError::NotFound(
                    String::from_utf8_lossy(name).into_owned(),
                ));
            };
            let EntryBody::Link { target } = &entry.body else {
                return Ok(entry);
            };
            path = target.to_vec();
        }
        Err(ReaderError::DepthExceeded(
            String::from_utf8_lossy(&path).into_owned(),
        ))
    }

    /// Returns the uncompressed content of a file entry.
    pub fn read_file(&self, entry: &Entry) -> ReadResult<Vec<u8>> {
        let EntryBody::File {
            size,
            csize,
            data_offset,
        } = entry.body
        else {
            return Err(ReaderError::NotAFile(entry.name_lossy()));
        };

        if csize == 0 {
            return Ok(self.read_bytes(data_offset, size as usize)?.into_vec());
        }

        let compressed = self.read_bytes(data_offset, csize as usize)?;
        let data = decompress(&compressed)
            .map_err(|err| ReaderError::Decompress(entry.name_lossy(), err))?;
        if data.len() != size as usize {
            return Err(ReaderError::SizeMismatch {
                name: entry.name_lossy(),
                expected: size,
                got: data.len(),
            });
        }
        Ok(data)
    }
}

pub struct Entries<'r, F> {
    reader: &'r Reader<F>,
    next: Option<usize>,
}

impl<F: FlashRead> Iterator for Entries<'_, F> {
    type Item = ReadResult<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.next.take()?;
        let entry = self.reader.entry_at(offset);
        if let Ok(entry) = &entry {
            self.next = entry.next_offset();
        }
        Some(entry)
    }
}
