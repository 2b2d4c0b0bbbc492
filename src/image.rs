//! In-memory form of a DBFFS image: the ordered chain of entries produced by a tree walk.

use std::fmt;

use thiserror::Error;

use crate::MAX_ENTRIES;

/// Longest name or link target an entry can carry (8-bit length prefix).
pub const MAX_NAME_LEN: usize = 255;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImageError {
    #[error("Name {name:?} is {len} bytes long, the limit is {MAX_NAME_LEN}")]
    NameTooLong { name: String, len: usize },
    #[error("File {name:?} is {size} bytes long, the limit is 4 GiB")]
    FileTooLarge { name: String, size: usize },
    #[error("Directory {name:?} has {count} entries, the limit is 65535")]
    TooManyChildren { name: String, count: usize },
    #[error("No more than {MAX_ENTRIES} entries fit in an image")]
    TooManyEntries,
}

/// A byte string of at most [`MAX_NAME_LEN`] bytes.  Used for entry names and link targets.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct EntryName(Box<[u8]>);

impl EntryName {
    pub fn new(name: impl Into<Box<[u8]>>) -> Result<Self, ImageError> {
        let name = name.into();
        if name.len() > MAX_NAME_LEN {
            return Err(ImageError::NameTooLong {
                name: String::from_utf8_lossy(&name).into_owned(),
                len: name.len(),
            });
        }
        Ok(Self(name))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The length prefix written in front of the name.
    pub fn len_u8(&self) -> u8 {
        // Checked in new()
        self.0.len() as u8
    }
}

impl fmt::Debug for EntryName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&String::from_utf8_lossy(&self.0), f)
    }
}

impl fmt::Display for EntryName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

#[derive(Debug)]
pub struct FileEntry {
    pub name: EntryName,
    data: Box<[u8]>,
    cdata: Option<Box<[u8]>>,
}

impl FileEntry {
    /// Creates a file entry.  The compressed form is only kept if it is strictly smaller than the
    /// raw content.
    pub fn new(
        name: EntryName,
        data: Box<[u8]>,
        compressed: Option<Vec<u8>>,
    ) -> Result<Self, ImageError> {
        if u32::try_from(data.len()).is_err() {
            return Err(ImageError::FileTooLarge {
                name: name.to_string(),
                size: data.len(),
            });
        }
        let cdata = compressed
            .filter(|c| c.len() < data.len())
            .map(Vec::into_boxed_slice);
        Ok(Self { name, data, cdata })
    }

    /// Uncompressed length.
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    /// Compressed length, or 0 if the content is stored raw.
    pub fn csize(&self) -> u32 {
        self.cdata.as_ref().map_or(0, |c| c.len() as u32)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The bytes that go into the image: compressed if that is smaller, raw otherwise.
    pub fn payload(&self) -> &[u8] {
        self.cdata.as_deref().unwrap_or(&self.data[..])
    }
}

#[derive(Debug)]
pub struct DirectoryEntry {
    pub name: EntryName,
    /// Number of direct children recorded in the image.  Informational only.
    pub entries: u16,
}

impl DirectoryEntry {
    pub fn new(name: EntryName, count: usize) -> Result<Self, ImageError> {
        let entries = u16::try_from(count).map_err(|_| ImageError::TooManyChildren {
            name: name.to_string(),
            count,
        })?;
        Ok(Self { name, entries })
    }
}

#[derive(Debug)]
pub struct LinkEntry {
    pub name: EntryName,
    /// Normalized absolute path in the image namespace.
    pub target: EntryName,
}

#[derive(Debug)]
pub enum FsEntry {
    File(FileEntry),
    Directory(DirectoryEntry),
    Link(LinkEntry),
}

impl FsEntry {
    pub fn name(&self) -> &EntryName {
        match self {
            FsEntry::File(file) => &file.name,
            FsEntry::Directory(dir) => &dir.name,
            FsEntry::Link(link) => &link.name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FsEntry::File(..) => "file",
            FsEntry::Directory(..) => "directory",
            FsEntry::Link(..) => "link",
        }
    }
}

/// The entry chain, in discovery order.
#[derive(Debug, Default)]
pub struct Image {
    entries: Vec<FsEntry>,
}

impl Image {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry to the end of the chain.
    pub fn add_entry(&mut self, entry: FsEntry) -> Result<(), ImageError> {
        if self.entries.len() >= MAX_ENTRIES {
            return Err(ImageError::TooManyEntries);
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Replaces the child count of the directory at `index`.  Other entries are left alone.
    pub fn set_directory_entries(&mut self, index: usize, count: usize) -> Result<(), ImageError> {
        if let Some(FsEntry::Directory(dir)) = self.entries.get_mut(index) {
            *dir = DirectoryEntry::new(dir.name.clone(), count)?;
        }
        Ok(())
    }

    pub fn entries(&self) -> &[FsEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_name_length_boundary() {
        assert_eq!(EntryName::new(vec![b'a'; 255]).unwrap().len_u8(), 255);
        assert_eq!(
            EntryName::new(vec![b'a'; 256]).unwrap_err(),
            ImageError::NameTooLong {
                name: "a".repeat(256),
                len: 256
            }
        );
        assert_eq!(EntryName::new(*b"").unwrap().len_u8(), 0);
    }

    #[test]
    fn test_file_keeps_smaller_representation() {
        let name = EntryName::new(*b"f").unwrap();
        let file = FileEntry::new(name.clone(), (*b"aaaaaaaa").into(), Some(vec![1, 2])).unwrap();
        assert_eq!((file.size(), file.csize()), (8, 2));
        assert_eq!(file.payload(), [1u8, 2]);

        // Equal size is not an improvement
        let file = FileEntry::new(name.clone(), (*b"ab").into(), Some(vec![1, 2])).unwrap();
        assert_eq!((file.size(), file.csize()), (2, 0));
        assert_eq!(file.payload(), b"ab");

        let file = FileEntry::new(name, (*b"ab").into(), None).unwrap();
        assert_eq!(file.csize(), 0);
    }

    #[test]
    fn test_directory_child_limit() {
        let name = EntryName::new(*b"d").unwrap();
        assert_eq!(DirectoryEntry::new(name.clone(), 65535).unwrap().entries, 65535);
        assert!(matches!(
            DirectoryEntry::new(name, 65536),
            Err(ImageError::TooManyChildren { count: 65536, .. })
        ));
    }

    #[test]
    fn test_set_directory_entries() {
        let mut image = Image::new();
        let dir = DirectoryEntry::new(EntryName::new(*b"d").unwrap(), 3).unwrap();
        image.add_entry(FsEntry::Directory(dir)).unwrap();
        image.set_directory_entries(0, 2).unwrap();
        assert!(matches!(&image.entries()[0], FsEntry::Directory(dir) if dir.entries == 2));
        assert!(matches!(
            image.set_directory_entries(0, 70000),
            Err(ImageError::TooManyChildren { count: 70000, .. })
        ));
    }

    #[test]
    fn test_add_entry_limit() {
        let mut image = Image::new();
        for _ in 0..MAX_ENTRIES {
            let dir = DirectoryEntry::new(EntryName::new(*b"d").unwrap(), 0).unwrap();
            image.add_entry(FsEntry::Directory(dir)).unwrap();
        }
        let dir = DirectoryEntry::new(EntryName::new(*b"d").unwrap(), 0).unwrap();
        assert_eq!(
            image.add_entry(FsEntry::Directory(dir)).unwrap_err(),
            ImageError::TooManyEntries
        );
        assert_eq!(image.len(), MAX_ENTRIES);
    }
}
