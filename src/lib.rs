//! Builder and reader for DBFFS, a compact read-only filesystem image format for flash-resident
//! file storage on small embedded devices.
//!
//! An image is a forward-only chain of file, directory and link records.  Each record carries the
//! distance to the next one, so a reader scanning for a name can skip record bodies without
//! parsing them.

pub mod compress;
pub mod dbffs;
pub mod flash;
pub mod fs;
pub mod image;
pub mod path;

/// Version of the on-image format produced by this crate.
pub const DBFFS_VERSION: &str = "0.2.0";

/// Maximum number of entries a single image may hold.
pub const MAX_ENTRIES: usize = 65536;

/// Default bound on directory nesting and link resolution during a walk.
pub const DEFAULT_MAX_DEPTH: usize = 10;
