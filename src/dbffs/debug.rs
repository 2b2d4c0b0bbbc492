//! Human-readable dump of an image, one block per entry.
//!
//! Every byte of the image is accounted for in the output, so two dumps differ whenever the
//! images do.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};

use super::{
    format::Endian,
    reader::{EntryBody, Reader},
};

fn utf8_or_hex(data: &[u8]) -> String {
    if let Ok(string) = std::str::from_utf8(data) {
        format!("{:?}", string)
    } else {
        hex::encode(data)
    }
}

fn addto(map: &mut BTreeMap<&'static str, usize>, key: &'static str, count: usize) {
    *map.entry(key).or_default() += count;
}

/// Writes a dump of the image in `data` to `output`.
pub fn debug_img(output: &mut impl std::io::Write, data: &[u8], endian: Endian) -> Result<()> {
    let reader = Reader::open(data, endian)?;
    writeln!(output, "00000000 Image signature ({endian})")?;

    let mut space_stats = BTreeMap::new();
    addto(&mut space_stats, "signature", 4);
    let mut count = 0;
    let mut offset = 4;
    for entry in reader.entries() {
        let entry = entry?;
        let end = entry.next_offset().unwrap_or(data.len());
        let kind = match &entry.body {
            EntryBody::Directory { .. } => "directory",
            EntryBody::File { .. } => "file",
            EntryBody::Link { .. } => "link",
        };
        addto(&mut space_stats, kind, end - entry.offset);

        writeln!(output, "# Filename {}", utf8_or_hex(&entry.name))?;
        write!(output, "{:08x} {kind} next={:+x}", entry.offset, entry.next)?;
        match &entry.body {
            EntryBody::Directory { entries } => writeln!(output, " entries={entries}")?,
            EntryBody::File {
                size,
                csize,
                data_offset,
            } => {
                writeln!(output, " size={size} csize={csize}")?;
                let stored = (if *csize == 0 { *size } else { *csize }) as usize;
                writeln!(output, "{data_offset:08x} payload")?;
                let payload = data
                    .get(*data_offset..*data_offset + stored)
                    .ok_or_else(|| anyhow!("Payload of {} runs past the end", entry.name_lossy()))?;
                for (idx, chunk) in payload.chunks(32).enumerate() {
                    writeln!(output, "  {:+8x}  {}", idx * 32, hex::encode(chunk))?;
                }
            }
            EntryBody::Link { target } => writeln!(output, " -> {}", utf8_or_hex(target))?,
        }
        writeln!(output)?;

        count += 1;
        offset = end;
    }

    if offset < data.len() {
        writeln!(output, "{offset:08x} *** {} trailing bytes", data.len() - offset)?;
        addto(&mut space_stats, "trailing", data.len() - offset);
    }

    writeln!(output, "{count} entries, total size {}B:", data.len())?;
    for (key, value) in space_stats {
        writeln!(
            output,
            "  {key} = {value}B, {:.2}%",
            (100. * value as f64) / (data.len() as f64)
        )?;
    }

    Ok(())
}
