//! mkdbffs - Create DBFFS images from directories.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::LevelFilter;

use dbffs::{
    compress::{Compression, MIN_WINDOW_LOG},
    dbffs::{format::Endian, writer::write_image_file},
    fs::{read_from_path, BuildOptions},
    DBFFS_VERSION, DEFAULT_MAX_DEPTH,
};

/// Create a DBFFS image from a source directory.
///
/// Every regular file, directory and symlink below ROOT_DIR is recorded.  Symlinks to
/// directories are expanded in place; symlinks to files are kept as links.
#[derive(Parser, Debug)]
#[command(name = "mkdbffs", version, about)]
struct Args {
    /// Print progress and structural diagnostics.
    #[arg(short, long)]
    verbose: bool,

    /// Write integers big-endian instead of little-endian.
    #[arg(long)]
    big_endian: bool,

    /// Store all file contents uncompressed.
    #[arg(long)]
    no_compress: bool,

    /// zstd compression level.
    #[arg(long, default_value_t = 19)]
    compression_level: i32,

    /// log2 of the compression window; bounds the memory a decoder needs.
    #[arg(long, default_value_t = MIN_WINDOW_LOG)]
    window_log: u32,

    /// Maximum directory nesting plus symlink hops.
    #[arg(long, default_value_t = DEFAULT_MAX_DEPTH)]
    max_depth: usize,

    /// Include files and directories whose names start with `.`.
    #[arg(long)]
    include_hidden: bool,

    /// The directory to build the image from.
    root_dir: PathBuf,

    /// The image file to write.
    image_file: PathBuf,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .format_target(false)
        .parse_default_env()
        .init();

    println!("dbf file system image generation tool version {DBFFS_VERSION}");

    if !(MIN_WINDOW_LOG..=31).contains(&args.window_log) {
        bail!(
            "--window-log must be between {MIN_WINDOW_LOG} and 31, got {}",
            args.window_log
        );
    }

    let options = BuildOptions {
        compression: if args.no_compress {
            Compression::None
        } else {
            Compression::Zstd {
                level: args.compression_level,
                window_log: args.window_log,
            }
        },
        max_depth: args.max_depth,
        include_hidden: args.include_hidden,
    };
    let endian = if args.big_endian {
        Endian::Big
    } else {
        Endian::Little
    };

    let image = read_from_path(&args.root_dir, &options)
        .with_context(|| format!("Failed to read source directory {:?}", args.root_dir))?;
    let count = write_image_file(&args.image_file, &image, endian)
        .with_context(|| format!("Failed to write image {:?}", args.image_file))?;

    println!("{count} entries written");
    Ok(())
}
