//! Lexical normalization of absolute paths.
//!
//! Symlink targets are stored in the image as paths in the image namespace, so they are resolved
//! purely textually: nothing here touches the host filesystem.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("Path {0:?} is not absolute")]
    NotAbsolute(String),
    #[error("Path {0:?} escapes the file system root")]
    EscapesRoot(String),
    #[error("Path {0:?} lies outside the source root")]
    OutsideRoot(String),
}

fn lossy(path: &[u8]) -> String {
    String::from_utf8_lossy(path).into_owned()
}

/// Collapses `.` and `..` segments of an absolute path, writing the result into `buf`.
///
/// `buf` is cleared first.  Repeated separators are merged and a trailing separator is dropped,
/// except for the root itself which normalizes to `/`.
pub fn normalize_into(path: &[u8], buf: &mut Vec<u8>) -> Result<(), PathError> {
    if path.first() != Some(&b'/') {
        return Err(PathError::NotAbsolute(lossy(path)));
    }

    buf.clear();
    for segment in path.split(|c| *c == b'/') {
        match segment {
            b"" | b"." => {}
            b".." => {
                // The write cursor may not move before the leading separator.
                let Some(last) = buf.iter().rposition(|c| *c == b'/') else {
                    return Err(PathError::EscapesRoot(lossy(path)));
                };
                buf.truncate(last);
            }
            name => {
                buf.push(b'/');
                buf.extend_from_slice(name);
            }
        }
    }

    if buf.is_empty() {
        buf.push(b'/');
    }
    Ok(())
}

/// Returns the shortest absolute path equivalent to `path`.
///
/// ```
/// use dbffs::path::normalize;
///
/// assert_eq!(normalize(b"/a/./b/../c").unwrap(), b"/a/c");
/// assert!(normalize(b"/a/../../b").is_err());
/// ```
pub fn normalize(path: &[u8]) -> Result<Vec<u8>, PathError> {
    let mut buf = Vec::with_capacity(path.len());
    normalize_into(path, &mut buf)?;
    Ok(buf)
}

/// Like [`normalize()`] but for `OsStr` inputs.
pub fn normalize_os(path: &OsStr) -> Result<Vec<u8>, PathError> {
    normalize(path.as_bytes())
}

/// Resolves a link target as seen from the absolute directory `base`.
///
/// Relative targets are appended to `base`; absolute targets are taken as they are.  Either way
/// the result is normalized.
pub fn resolve_in(base: &[u8], target: &[u8]) -> Result<Vec<u8>, PathError> {
    if target.first() == Some(&b'/') {
        return normalize(target);
    }
    let mut joined = Vec::with_capacity(base.len() + target.len() + 1);
    joined.extend_from_slice(base);
    joined.push(b'/');
    joined.extend_from_slice(target);
    normalize(&joined)
}

/// Re-roots a normalized absolute host path below `root` (also normalized) into image space.
pub fn strip_root(root: &[u8], path: &[u8]) -> Result<Vec<u8>, PathError> {
    if root == b"/" {
        return Ok(path.to_vec());
    }
    match path.strip_prefix(root) {
        Some(b"") => Ok(b"/".to_vec()),
        Some(rest) if rest.first() == Some(&b'/') => Ok(rest.to_vec()),
        _ => Err(PathError::OutsideRoot(lossy(path))),
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn norm(path: &str) -> Result<String, PathError> {
        normalize(path.as_bytes()).map(|p| String::from_utf8(p).unwrap())
    }

    #[test]
    fn test_normalize() {
        assert_eq!(norm("/a/b/c").unwrap(), "/a/b/c");
        assert_eq!(norm("/a/./b/../c").unwrap(), "/a/c");
        assert_eq!(norm("/").unwrap(), "/");
        assert_eq!(norm("/.").unwrap(), "/");
        assert_eq!(norm("/a/..").unwrap(), "/");
        assert_eq!(norm("//a///b/").unwrap(), "/a/b");
        assert_eq!(norm("/a/.hidden/..b").unwrap(), "/a/.hidden/..b");
        assert_eq!(norm("/a/b/../../c/./d").unwrap(), "/c/d");
    }

    #[test]
    fn test_normalize_errors() {
        assert_eq!(
            norm("/a/../../b").unwrap_err(),
            PathError::EscapesRoot("/a/../../b".into())
        );
        assert_eq!(norm("/..").unwrap_err(), PathError::EscapesRoot("/..".into()));
        assert_eq!(norm("a/b").unwrap_err(), PathError::NotAbsolute("a/b".into()));
        assert_eq!(norm("").unwrap_err(), PathError::NotAbsolute("".into()));
    }

    #[test]
    fn test_normalize_into_reuses_buffer() {
        let mut buf = b"leftover".to_vec();
        normalize_into(b"/x/y/../z", &mut buf).unwrap();
        assert_eq!(buf, b"/x/z");
    }

    #[test]
    fn test_resolve_in() {
        assert_eq!(resolve_in(b"/dir", b"file").unwrap(), b"/dir/file");
        assert_eq!(resolve_in(b"/dir/sub", b"../file").unwrap(), b"/dir/file");
        assert_eq!(resolve_in(b"/dir", b"/abs/file").unwrap(), b"/abs/file");
        assert_eq!(resolve_in(b"/", b"a").unwrap(), b"/a");
        assert!(matches!(
            resolve_in(b"/dir", b"../../x"),
            Err(PathError::EscapesRoot(_))
        ));
    }

    #[test]
    fn test_strip_root() {
        assert_eq!(strip_root(b"/src/root", b"/src/root/a/b").unwrap(), b"/a/b");
        assert_eq!(strip_root(b"/src/root", b"/src/root").unwrap(), b"/");
        assert_eq!(strip_root(b"/", b"/a").unwrap(), b"/a");
        assert!(matches!(
            strip_root(b"/src/root", b"/src/rootless/a"),
            Err(PathError::OutsideRoot(_))
        ));
        assert!(matches!(
            strip_root(b"/src/root", b"/etc/passwd"),
            Err(PathError::OutsideRoot(_))
        ));
    }
}
