use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::Path,
};

use log::{debug, info};
use thiserror::Error;
use zerocopy::{Immutable, IntoBytes};

use crate::{
    dbffs::format::{Endian, EntryHeader, EntryType, FileHeader, IMAGE_SIG, NEXT_FIELD_OFFSET},
    image::{FsEntry, Image},
};

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("Entry {name:?} was measured at {expected} bytes but {written} were produced")]
    Serialization {
        name: String,
        expected: usize,
        written: usize,
    },
    #[error("Entry {name:?} is too large to be skipped over ({len} bytes)")]
    OffsetOverflow { name: String, len: usize },
    #[error("Failed to write image to {path:?}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

trait Output {
    fn write(&mut self, data: &[u8]);
    fn len(&self) -> usize;

    fn write_struct(&mut self, st: impl IntoBytes + Immutable) {
        self.write(st.as_bytes());
    }
}

#[derive(Default)]
struct FirstPass {
    offset: usize,
}

impl Output for FirstPass {
    fn write(&mut self, data: &[u8]) {
        self.offset += data.len();
    }

    fn len(&self) -> usize {
        self.offset
    }
}

#[derive(Default)]
struct SecondPass {
    output: Vec<u8>,
}

impl Output for SecondPass {
    fn write(&mut self, data: &[u8]) {
        self.output.extend_from_slice(data);
    }

    fn len(&self) -> usize {
        self.output.len()
    }
}

fn entry_type(entry: &FsEntry) -> EntryType {
    match entry {
        FsEntry::File(..) => EntryType::File,
        FsEntry::Directory(..) => EntryType::Directory,
        FsEntry::Link(..) => EntryType::Link,
    }
}

fn write_entry(output: &mut impl Output, entry: &FsEntry, next: u32, endian: Endian) {
    let name = entry.name();
    output.write_struct(EntryHeader::new(
        endian,
        entry_type(entry),
        next,
        name.len_u8(),
    ));
    output.write(name.as_bytes());

    match entry {
        FsEntry::Directory(dir) => output.write(&endian.u16_bytes(dir.entries)),
        FsEntry::File(file) => {
            output.write_struct(FileHeader::new(endian, file.size(), file.csize()));
            output.write(file.payload());
        }
        FsEntry::Link(link) => {
            output.write(&[link.target.len_u8()]);
            output.write(link.target.as_bytes());
        }
    }
}

/// Number of bytes `entry` occupies in an image, header included.
pub fn encoded_len(entry: &FsEntry) -> usize {
    let mut first_pass = FirstPass::default();
    // Neither the byte order nor the offset value change the length.
    write_entry(&mut first_pass, entry, 0, Endian::default());
    first_pass.len()
}

fn next_offset(entry: &FsEntry, len: usize, last: bool) -> Result<u32, WriteError> {
    if last {
        return Ok(0);
    }
    u32::try_from(len - NEXT_FIELD_OFFSET).map_err(|_| WriteError::OffsetOverflow {
        name: entry.name().to_string(),
        len,
    })
}

/// Produces the bytes of one record, checking them against the measured length.
pub fn serialize_entry(entry: &FsEntry, last: bool, endian: Endian) -> Result<Vec<u8>, WriteError> {
    let expected = encoded_len(entry);
    let next = next_offset(entry, expected, last)?;

    let mut second_pass = SecondPass::default();
    write_entry(&mut second_pass, entry, next, endian);

    if second_pass.len() != expected {
        return Err(WriteError::Serialization {
            name: entry.name().to_string(),
            expected,
            written: second_pass.len(),
        });
    }
    Ok(second_pass.output)
}

/// Writes the image signature and every entry in order.  Returns the number of entries written.
pub fn write_image(
    writer: &mut impl Write,
    image: &Image,
    endian: Endian,
) -> Result<usize, WriteError> {
    let io_error = |source| WriteError::Io {
        path: String::from("<stream>"),
        source,
    };

    writer
        .write_all(&endian.u32_bytes(IMAGE_SIG))
        .map_err(io_error)?;

    let count = image.len();
    for (idx, entry) in image.entries().iter().enumerate() {
        info!("Writing {} {}", entry.kind(), entry.name());
        let bytes = serialize_entry(entry, idx + 1 == count, endian)?;
        writer.write_all(&bytes).map_err(io_error)?;
    }

    debug!("Wrote {count} entries ({endian})");
    Ok(count)
}

/// Serializes `image` into memory.
pub fn mkfs_dbffs(image: &Image, endian: Endian) -> Result<Box<[u8]>, WriteError> {
    let mut output = vec![];
    write_image(&mut output, image, endian)?;
    Ok(output.into_boxed_slice())
}

/// Creates (or truncates) `path` and writes `image` to it.
pub fn write_image_file(path: &Path, image: &Image, endian: Endian) -> Result<usize, WriteError> {
    let io_error = |source| WriteError::Io {
        path: path.display().to_string(),
        source,
    };

    let file = File::create(path).map_err(io_error)?;
    let mut writer = BufWriter::new(file);
    let count = match write_image(&mut writer, image, endian) {
        Err(WriteError::Io { source, .. }) => return Err(io_error(source)),
        other => other?,
    };
    let file = writer
        .into_inner()
        .map_err(|err| io_error(err.into_error()))?;
    file.sync_all().map_err(io_error)?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::image::{DirectoryEntry, EntryName, FileEntry, LinkEntry};

    fn name(name: &str) -> EntryName {
        EntryName::new(name.as_bytes()).unwrap()
    }

    fn file(path: &str, data: &[u8]) -> FsEntry {
        FsEntry::File(FileEntry::new(name(path), data.into(), None).unwrap())
    }

    fn dir(path: &str, count: usize) -> FsEntry {
        FsEntry::Directory(DirectoryEntry::new(name(path), count).unwrap())
    }

    fn link(path: &str, target: &str) -> FsEntry {
        FsEntry::Link(LinkEntry {
            name: name(path),
            target: name(target),
        })
    }

    #[test]
    fn test_encoded_len() {
        assert_eq!(encoded_len(&dir("a", 1)), 9 + 1 + 2);
        assert_eq!(encoded_len(&file("a/f.txt", b"hello")), 9 + 7 + 8 + 5);
        assert_eq!(encoded_len(&link("l", "/a/f.txt")), 9 + 1 + 1 + 8);
    }

    #[test]
    fn test_single_file_image() {
        let mut image = Image::new();
        image.add_entry(file("f", b"hi")).unwrap();
        let bytes = mkfs_dbffs(&image, Endian::Little).unwrap();

        #[rustfmt::skip]
        let expected: &[u8] = &[
            0x00, 0x50, 0xff, 0xdb,
            0x0f, 0x50, 0xff, 0xdb,
            0, 0, 0, 0,
            1, b'f',
            2, 0, 0, 0,
            0, 0, 0, 0,
            b'h', b'i',
        ];
        assert_eq!(&bytes[..], expected);
    }

    #[test]
    fn test_next_offsets() {
        let mut image = Image::new();
        image.add_entry(dir("a", 1)).unwrap();
        image.add_entry(file("a/f.txt", b"hello")).unwrap();
        image.add_entry(link("g", "/a/f.txt")).unwrap();

        for endian in [Endian::Little, Endian::Big] {
            let bytes = mkfs_dbffs(&image, endian).unwrap();
            let mut pos = 4;
            for entry in image.entries() {
                let len = encoded_len(entry);
                let next = endian.read_u32(bytes[pos + 4..pos + 8].try_into().unwrap());
                if pos + len == bytes.len() {
                    assert_eq!(next, 0);
                } else {
                    assert_eq!(next as usize, len - NEXT_FIELD_OFFSET);
                }
                pos += len;
            }
            assert_eq!(pos, bytes.len());
        }
    }

    #[test]
    fn test_empty_image() {
        let bytes = mkfs_dbffs(&Image::new(), Endian::Big).unwrap();
        assert_eq!(&bytes[..], [0xdb, 0xff, 0x50, 0x00]);
    }

    #[test]
    fn test_write_image_file() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("image.bin");
        let mut image = Image::new();
        image.add_entry(dir("d", 0)).unwrap();

        assert_eq!(write_image_file(&path, &image, Endian::Little).unwrap(), 1);
        assert_eq!(
            std::fs::read(&path).unwrap(),
            &mkfs_dbffs(&image, Endian::Little).unwrap()[..]
        );

        let missing = td.path().join("no/such/dir/image.bin");
        assert!(matches!(
            write_image_file(&missing, &image, Endian::Little),
            Err(WriteError::Io { .. })
        ));
    }
}
