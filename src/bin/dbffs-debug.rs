use std::{fs::File, io::Read, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

use dbffs::dbffs::{debug::debug_img, format::Endian};

/// Produce a detailed dump of an entire DBFFS image
///
/// Each entry is printed with its offset, header fields and payload, followed by statistics on
/// how the space is used.
#[derive(Parser)]
struct Args {
    /// The image was written big-endian
    #[arg(long)]
    big_endian: bool,

    /// The path to the image file to dump
    image: PathBuf,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut image =
        File::open(&args.image).with_context(|| format!("Opening {:?}", args.image))?;

    let mut data = vec![];
    image.read_to_end(&mut data).context("read_to_end() failed")?;

    let endian = if args.big_endian {
        Endian::Big
    } else {
        Endian::Little
    };
    debug_img(&mut std::io::stdout(), &data, endian)
}
