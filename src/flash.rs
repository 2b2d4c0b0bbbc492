//! Host-side model of the device's flash access path.
//!
//! On the device, flash can only be read in aligned 32-bit words.  [`WordFlash`] reproduces that
//! restriction so the reader can be exercised against the same constraints it faces on hardware.

use thiserror::Error;

/// Erased NOR flash reads back as all ones.
const ERASED: u8 = 0xff;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlashError {
    #[error("Read of {len} bytes at offset {offset:#x} exceeds the flash region ({size:#x} bytes)")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },
}

/// Byte-range reads from a flash region.
pub trait FlashRead {
    /// Fills all of `dest` starting at `offset` within the region.  Succeeds only if the whole
    /// range was read, returning its length.
    fn read(&self, dest: &mut [u8], offset: usize) -> Result<usize, FlashError>;

    /// Size of the region in bytes.
    fn size(&self) -> usize;
}

fn check_bounds(offset: usize, len: usize, size: usize) -> Result<(), FlashError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(FlashError::OutOfBounds { offset, len, size }),
    }
}

impl FlashRead for [u8] {
    fn read(&self, dest: &mut [u8], offset: usize) -> Result<usize, FlashError> {
        check_bounds(offset, dest.len(), self.len())?;
        dest.copy_from_slice(&self[offset..][..dest.len()]);
        Ok(dest.len())
    }

    fn size(&self) -> usize {
        self.len()
    }
}

impl<T: FlashRead + ?Sized> FlashRead for &T {
    fn read(&self, dest: &mut [u8], offset: usize) -> Result<usize, FlashError> {
        (**self).read(dest, offset)
    }

    fn size(&self) -> usize {
        (**self).size()
    }
}

/// A region of word-addressed flash starting at absolute address `base`.
#[derive(Debug)]
pub struct WordFlash {
    /// Little-endian words; the first one is at the aligned address at or below `base`.
    words: Box<[u32]>,
    base: usize,
    size: usize,
}

impl WordFlash {
    /// Lays `image` out in flash at address `base`.  Bytes around it in the first and last word
    /// read as erased.
    pub fn new(image: &[u8], base: usize) -> Self {
        let lead = base % 4;
        let mut bytes = vec![ERASED; lead];
        bytes.extend_from_slice(image);
        bytes.resize(bytes.len().next_multiple_of(4), ERASED);

        let words = bytes
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();

        Self {
            words,
            base,
            size: image.len(),
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    /// The only access the hardware offers: one aligned word.
    fn read_word(&self, addr: usize) -> u32 {
        debug_assert_eq!(addr % 4, 0);
        self.words[(addr - (self.base - self.base % 4)) / 4]
    }
}

impl FlashRead for WordFlash {
    fn read(&self, dest: &mut [u8], offset: usize) -> Result<usize, FlashError> {
        check_bounds(offset, dest.len(), self.size)?;

        let mut addr = self.base + offset;
        let mut done = 0;
        while done < dest.len() {
            let aligned = addr & !3;
            let word = self.read_word(aligned);
            let mut shift = addr - aligned;
            while shift < 4 && done < dest.len() {
                dest[done] = (word >> (8 * shift)) as u8;
                shift += 1;
                done += 1;
            }
            addr = aligned + 4;
        }
        Ok(done)
    }

    fn size(&self) -> usize {
        self.size
    }
}

/// Maps a JEDEC id (as returned by the flash chip's RDID command) to the chip size in bytes.
///
/// Only Winbond (0xEF) and GigaDevice (0xC8) parts are recognized; anything else yields 0.  The
/// capacity byte encodes the size as a power of two; one too large for `usize` also yields 0.
pub fn flash_size(jedec_id: u32) -> usize {
    match jedec_id & 0xff {
        0xef | 0xc8 => 1usize.checked_shl((jedec_id >> 16) & 0xff).unwrap_or(0),
        _ => 0,
    }
}
