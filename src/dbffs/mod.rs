//! The DBFFS on-image format: record layout, serialization, parsing and dumping.

pub mod debug;
pub mod format;
pub mod reader;
pub mod writer;
