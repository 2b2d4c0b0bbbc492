//! Reading a host directory tree into an [`Image`].
//!
//! The walk is physical: symlinks are never followed implicitly.  A link whose chain ends at a
//! directory is expanded in place, so the directory's contents appear under the link's own name.
//! A link whose chain ends at a regular file is kept as a link entry.

use std::{
    ffi::OsStr,
    fs::File,
    io::{self, Read},
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};

use log::{debug, warn};
use rustix::fs::{fstat, openat, readlinkat, statat, AtFlags, Dir, FileType, Mode, OFlags, CWD};
use thiserror::Error;

use crate::{
    compress::{compress, Compression, EncoderError},
    image::{DirectoryEntry, EntryName, FileEntry, FsEntry, Image, ImageError, LinkEntry},
    path::{normalize_os, resolve_in, strip_root, PathError},
    DEFAULT_MAX_DEPTH,
};

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Invalid path")]
    InvalidPath(#[from] PathError),
    #[error("{context} {path:?}")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Could not allocate {size} bytes for {path:?}")]
    Alloc { path: PathBuf, size: usize },
    #[error("Failed to compress {path:?}")]
    Encoder {
        path: PathBuf,
        #[source]
        source: EncoderError,
    },
    #[error("Maximum depth of {max_depth} exceeded at {path:?}")]
    DepthExceeded { path: PathBuf, max_depth: usize },
    #[error("Source root {0:?} is not a directory")]
    NotADirectory(PathBuf),
    #[error(transparent)]
    Image(#[from] ImageError),
}

/// Knobs for [`read_from_path()`].
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub compression: Compression,
    /// Bound on directory nesting plus symlink hops.
    pub max_depth: usize,
    /// Whether names starting with `.` are included.
    pub include_hidden: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            compression: Compression::default(),
            max_depth: DEFAULT_MAX_DEPTH,
            include_hidden: false,
        }
    }
}

fn io_error<'a, E: Into<io::Error>>(
    context: &'static str,
    path: &'a Path,
) -> impl FnOnce(E) -> BuildError + 'a {
    move |err| BuildError::Io {
        context,
        path: path.to_path_buf(),
        source: err.into(),
    }
}

fn stat_nofollow(path: &Path) -> Result<FileType, BuildError> {
    let buf = statat(CWD, path, AtFlags::SYMLINK_NOFOLLOW)
        .map_err(io_error("Could not stat", path))?;
    Ok(FileType::from_raw_mode(buf.st_mode))
}

fn read_link(path: &Path) -> Result<Vec<u8>, BuildError> {
    let target =
        readlinkat(CWD, path, Vec::new()).map_err(io_error("Could not read link", path))?;
    Ok(target.into_bytes())
}

/// `parent/child` in image space.  Names never carry a leading separator.
fn child_name(parent: Option<&[u8]>, child: &[u8]) -> Vec<u8> {
    match parent {
        Some(parent) => [parent, &b"/"[..], child].concat(),
        None => child.to_vec(),
    }
}

fn encoder_error(path: &Path) -> impl FnOnce(EncoderError) -> BuildError + '_ {
    move |source| match source {
        EncoderError::Alloc(size) => BuildError::Alloc {
            path: path.to_path_buf(),
            size,
        },
        source => BuildError::Encoder {
            path: path.to_path_buf(),
            source,
        },
    }
}

/// Builds the entry for a regular file: reads it whole and offers it to the compressor.
pub fn read_file_entry(
    path: &Path,
    name: &[u8],
    compression: &Compression,
) -> Result<FileEntry, BuildError> {
    let fd = openat(
        CWD,
        path,
        OFlags::RDONLY | OFlags::NOFOLLOW | OFlags::CLOEXEC,
        Mode::empty(),
    )
    .map_err(io_error("Could not open", path))?;
    let buf = fstat(&fd).map_err(io_error("Could not stat", path))?;

    let size = buf.st_size as usize;
    let mut data = Vec::new();
    data.try_reserve_exact(size).map_err(|_| BuildError::Alloc {
        path: path.to_path_buf(),
        size,
    })?;
    File::from(fd)
        .read_to_end(&mut data)
        .map_err(io_error("Could not read", path))?;

    let compressed = match compression.encoder().map_err(encoder_error(path))? {
        Some(mut encoder) => Some(compress(&mut encoder, &data).map_err(encoder_error(path))?),
        None => None,
    };

    let entry = FileEntry::new(EntryName::new(name)?, data.into_boxed_slice(), compressed)?;
    debug!(
        "{}: {} bytes, stored as {}",
        entry.name,
        entry.size(),
        match entry.csize() {
            0 => String::from("raw"),
            csize => format!("{csize} compressed bytes"),
        }
    );
    Ok(entry)
}

/// Builds the entry for a directory with `count` children.
pub fn read_directory_entry(name: &[u8], count: usize) -> Result<DirectoryEntry, BuildError> {
    Ok(DirectoryEntry::new(EntryName::new(name)?, count)?)
}

/// Builds a link entry.  `target` must already be an absolute path in image space; it is stored
/// normalized.
pub fn read_link_entry(name: &[u8], target: &[u8]) -> Result<LinkEntry, BuildError> {
    let target = normalize_os(OsStr::from_bytes(target))?;
    Ok(LinkEntry {
        name: EntryName::new(name)?,
        target: EntryName::new(target)?,
    })
}

enum LinkTarget {
    Directory(PathBuf),
    File,
    Other(FileType),
}

/// State of one build, threaded through the walk.
struct WalkContext<'a> {
    options: &'a BuildOptions,
    /// Canonical host path of the source root.
    root: PathBuf,
    image: Image,
}

impl WalkContext<'_> {
    fn add_entry(&mut self, entry: FsEntry) -> Result<(), BuildError> {
        Ok(self.image.add_entry(entry)?)
    }

    fn check_depth(&self, path: &Path, depth: usize) -> Result<(), BuildError> {
        if depth > self.options.max_depth {
            return Err(BuildError::DepthExceeded {
                path: path.to_path_buf(),
                max_depth: self.options.max_depth,
            });
        }
        Ok(())
    }

    fn list_directory(&self, path: &Path) -> Result<Vec<Vec<u8>>, BuildError> {
        let fd = openat(
            CWD,
            path,
            OFlags::RDONLY | OFlags::DIRECTORY | OFlags::CLOEXEC,
            Mode::empty(),
        )
        .map_err(io_error("Could not open directory", path))?;

        let mut names = vec![];
        for item in Dir::read_from(&fd).map_err(io_error("Could not read directory", path))? {
            let entry = item.map_err(io_error("Could not read directory", path))?;
            let name = entry.file_name().to_bytes();

            if name == b"." || name == b".." {
                continue;
            }
            if !self.options.include_hidden && name.starts_with(b".") {
                debug!("Skipping hidden {:?}", path.join(OsStr::from_bytes(name)));
                continue;
            }
            names.push(name.to_vec());
        }

        // readdir() order depends on the host filesystem; the image order must not.
        names.sort();
        Ok(names)
    }

    /// Walks the directory at `path`, recording it as `name` (`None` for the image root).
    fn walk_directory(
        &mut self,
        path: &Path,
        name: Option<&[u8]>,
        depth: usize,
    ) -> Result<(), BuildError> {
        self.check_depth(path, depth)?;

        let children = self.list_directory(path)?;
        // The directory precedes its children in the chain, so its count is filled in once they
        // have been visited.
        let index = self.image.len();
        if let Some(name) = name {
            let dir = read_directory_entry(name, children.len())?;
            debug!("Entering {} ({} listed)", dir.name, children.len());
            self.add_entry(FsEntry::Directory(dir))?;
        }

        let mut recorded = 0;
        for child in children {
            let child_path = path.join(OsStr::from_bytes(&child));
            if self.visit(&child_path, &child_name(name, &child), depth)? {
                recorded += 1;
            }
        }

        if name.is_some() {
            self.image.set_directory_entries(index, recorded)?;
        }
        Ok(())
    }

    /// Records the entry at `path`.  Returns false if it was skipped.
    fn visit(&mut self, path: &Path, name: &[u8], depth: usize) -> Result<bool, BuildError> {
        match stat_nofollow(path)? {
            FileType::RegularFile => {
                let file = read_file_entry(path, name, &self.options.compression)?;
                self.add_entry(FsEntry::File(file))?;
            }
            FileType::Directory => self.walk_directory(path, Some(name), depth + 1)?,
            FileType::Symlink => return self.visit_link(path, name, depth),
            other => {
                warn!("Skipping {path:?}: unsupported file type {other:?}");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Follows a chain of links starting at `path` to the first non-link.  Returns the number of
    /// hops taken along with the classification.
    fn resolve_link(&self, path: &Path, depth: usize) -> Result<(LinkTarget, usize), BuildError> {
        let mut current = path.to_path_buf();
        let mut hops = 0;
        loop {
            let target = read_link(&current)?;
            let parent = current.parent().unwrap_or(Path::new("/"));
            // An absolute target replaces the parent entirely.
            let next = parent.join(OsStr::from_bytes(&target));

            hops += 1;
            self.check_depth(&next, depth + hops)?;

            match stat_nofollow(&next)? {
                FileType::Symlink => current = next,
                FileType::Directory => return Ok((LinkTarget::Directory(next), hops)),
                FileType::RegularFile => return Ok((LinkTarget::File, hops)),
                other => return Ok((LinkTarget::Other(other), hops)),
            }
        }
    }

    /// Maps the raw target of the link at host `path` into image space.
    ///
    /// The target is resolved where the link really lives, which differs from its image location
    /// when the link sits inside an expanded linked directory.
    fn image_target(&self, path: &Path, target: &[u8]) -> Result<Vec<u8>, BuildError> {
        let parent = path.parent().unwrap_or(Path::new("/"));
        let parent = parent
            .canonicalize()
            .map_err(io_error("Could not resolve", parent))?;
        let host = resolve_in(parent.as_os_str().as_bytes(), target)?;
        Ok(strip_root(self.root.as_os_str().as_bytes(), &host)?)
    }

    fn visit_link(&mut self, path: &Path, name: &[u8], depth: usize) -> Result<bool, BuildError> {
        match self.resolve_link(path, depth)? {
            (LinkTarget::Directory(target), hops) => {
                debug!(
                    "Expanding linked directory {target:?} as {}",
                    String::from_utf8_lossy(name)
                );
                self.walk_directory(&target, Some(name), depth + hops)?;
            }
            (LinkTarget::File, _) => {
                // Only the first hop is recorded; further indirection stays in the image.
                let target = self.image_target(path, &read_link(path)?)?;
                let link = read_link_entry(name, &target)?;
                debug!("{} -> {}", link.name, link.target);
                self.add_entry(FsEntry::Link(link))?;
            }
            (LinkTarget::Other(kind), _) => {
                warn!("Skipping {path:?}: link to unsupported file type {kind:?}");
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Walks the tree below `root` and returns the resulting entry chain.
///
/// The root itself gets no entry.  Children are visited in byte order of their names, depth
/// first, with each directory recorded before its contents.
pub fn read_from_path(root: &Path, options: &BuildOptions) -> Result<Image, BuildError> {
    let root = root
        .canonicalize()
        .map_err(io_error("Could not resolve source root", root))?;
    if stat_nofollow(&root)? != FileType::Directory {
        return Err(BuildError::NotADirectory(root));
    }

    let mut context = WalkContext {
        options,
        root: root.clone(),
        image: Image::new(),
    };
    context.walk_directory(&root, None, 0)?;
    Ok(context.image)
}

#[cfg(test)]
mod tests {
    use std::{fs, os::unix::fs::symlink};

    use similar_asserts::assert_eq;

    use super::*;

    fn names(image: &Image) -> Vec<String> {
        image
            .entries()
            .iter()
            .map(|e| format!("{} {}", e.kind(), e.name()))
            .collect()
    }

    #[test]
    fn test_child_name() {
        assert_eq!(child_name(None, b"a"), b"a");
        assert_eq!(child_name(Some(b"a/b"), b"c"), b"a/b/c");
    }

    #[test]
    fn test_encoder_alloc_failure() {
        let path = Path::new("/src/f");
        assert!(matches!(
            encoder_error(path)(EncoderError::Alloc(4096)),
            BuildError::Alloc { size: 4096, .. }
        ));
        assert!(matches!(
            encoder_error(path)(EncoderError::Backend(io::Error::other("zstd"))),
            BuildError::Encoder { .. }
        ));
    }

    #[test]
    fn test_read_link_entry_normalizes() {
        let link = read_link_entry(b"l", b"/a/./b/../c").unwrap();
        assert_eq!(link.target.as_bytes(), b"/a/c");
        assert!(matches!(
            read_link_entry(b"l", b"/a/../../c"),
            Err(BuildError::InvalidPath(PathError::EscapesRoot(_)))
        ));
    }

    #[test]
    fn test_hidden_entries() {
        let td = tempfile::tempdir().unwrap();
        fs::write(td.path().join(".hidden"), b"x").unwrap();
        fs::write(td.path().join("shown"), b"y").unwrap();

        let image = read_from_path(td.path(), &BuildOptions::default()).unwrap();
        assert_eq!(names(&image), ["file shown"]);

        let options = BuildOptions {
            include_hidden: true,
            ..Default::default()
        };
        let image = read_from_path(td.path(), &options).unwrap();
        assert_eq!(names(&image), ["file .hidden", "file shown"]);
    }

    #[test]
    fn test_directory_depth_limit() {
        let td = tempfile::tempdir().unwrap();
        fs::create_dir_all(td.path().join("1/2/3")).unwrap();

        let options = BuildOptions {
            max_depth: 3,
            ..Default::default()
        };
        assert_eq!(read_from_path(td.path(), &options).unwrap().len(), 3);

        let options = BuildOptions {
            max_depth: 2,
            ..Default::default()
        };
        assert!(matches!(
            read_from_path(td.path(), &options),
            Err(BuildError::DepthExceeded { max_depth: 2, .. })
        ));
    }

    #[test]
    fn test_root_must_be_directory() {
        let td = tempfile::tempdir().unwrap();
        let file = td.path().join("file");
        fs::write(&file, b"").unwrap();
        assert!(matches!(
            read_from_path(&file, &BuildOptions::default()),
            Err(BuildError::NotADirectory(_))
        ));
        assert!(matches!(
            read_from_path(&td.path().join("missing"), &BuildOptions::default()),
            Err(BuildError::Io { .. })
        ));
    }

    #[test]
    fn test_absolute_link_outside_root() {
        let td = tempfile::tempdir().unwrap();
        let outside = tempfile::NamedTempFile::new().unwrap();
        symlink(outside.path(), td.path().join("l")).unwrap();

        assert!(matches!(
            read_from_path(td.path(), &BuildOptions::default()),
            Err(BuildError::InvalidPath(PathError::OutsideRoot(_)))
        ));
    }

    #[test]
    fn test_unsupported_children_not_counted() {
        let td = tempfile::tempdir().unwrap();
        fs::create_dir(td.path().join("d")).unwrap();
        fs::write(td.path().join("d/f"), b"f").unwrap();
        rustix::fs::mknodat(
            CWD,
            td.path().join("d/fifo"),
            FileType::Fifo,
            Mode::from_raw_mode(0o644),
            0,
        )
        .unwrap();
        symlink("fifo", td.path().join("d/l")).unwrap();

        let image = read_from_path(td.path(), &BuildOptions::default()).unwrap();
        assert_eq!(names(&image), ["directory d", "file d/f"]);
        let FsEntry::Directory(dir) = &image.entries()[0] else {
            panic!("expected a directory");
        };
        assert_eq!(dir.entries, 1);
    }

    #[test]
    fn test_dangling_link() {
        let td = tempfile::tempdir().unwrap();
        symlink("nowhere", td.path().join("l")).unwrap();
        assert!(matches!(
            read_from_path(td.path(), &BuildOptions::default()),
            Err(BuildError::Io { .. })
        ));
    }
}
