//! Streaming compression of file payloads.
//!
//! The encoder follows a sink/poll/finish protocol: input is fed in with `sink()`, which may
//! consume less than it is offered, compressed bytes are drained with `poll()`, and `finish()`
//! flushes the end of the stream.  Output is staged in a small fixed buffer so the working set of
//! an encoder stays bounded no matter how large the file is.

use std::{cmp::min, io, ops::Range};

use log::trace;
use thiserror::Error;
use zstd::{
    stream::raw::{Encoder, InBuffer, Operation, OutBuffer},
    zstd_safe::CParameter,
};

/// Size of the staging buffer between the backend and `poll()`.
pub const STAGING_SIZE: usize = 256;

/// Smallest window the zstd format allows (1 KiB), which is also what a device decoder needs to
/// hold in RAM.
pub const MIN_WINDOW_LOG: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    Idle,
    Sinking,
    Polling,
    Finishing,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// The staging buffer has been drained.
    Empty,
    /// More output is waiting; poll again.
    More,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishStatus {
    Done,
    /// Output is pending; poll, then call `finish()` again.
    More,
}

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("Encoder in state {state:?} cannot {operation}")]
    UnexpectedState {
        state: EncoderState,
        operation: &'static str,
    },
    #[error("Compression backend failed")]
    Backend(#[source] io::Error),
    #[error("Could not reserve {0} bytes for compressed data")]
    Alloc(usize),
}

/// A byte-oriented compressor driven through sink/poll/finish.
pub trait StreamEncoder {
    /// Feeds input and returns how many bytes were consumed.  Zero means the output must be
    /// polled before more input is accepted.
    fn sink(&mut self, input: &[u8]) -> Result<usize, EncoderError>;

    /// Copies pending output into `output`, returning the number of bytes written.
    fn poll(&mut self, output: &mut [u8]) -> Result<(usize, PollStatus), EncoderError>;

    /// Signals the end of input.
    fn finish(&mut self) -> Result<FinishStatus, EncoderError>;
}

/// How file payloads are compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Zstd { level: i32, window_log: u32 },
}

impl Default for Compression {
    fn default() -> Self {
        Compression::Zstd {
            level: 19,
            window_log: MIN_WINDOW_LOG,
        }
    }
}

impl Compression {
    /// Creates a fresh encoder for one file, or `None` if compression is disabled.
    pub fn encoder(&self) -> Result<Option<ZstdStream>, EncoderError> {
        match *self {
            Compression::None => Ok(None),
            Compression::Zstd { level, window_log } => {
                Ok(Some(ZstdStream::new(level, window_log)?))
            }
        }
    }
}

/// [`StreamEncoder`] on top of the zstd streaming API.
pub struct ZstdStream {
    encoder: Encoder<'static>,
    staging: Box<[u8]>,
    staged: Range<usize>,
    state: EncoderState,
    frame_done: bool,
}

impl ZstdStream {
    pub fn new(level: i32, window_log: u32) -> Result<Self, EncoderError> {
        let mut encoder = Encoder::new(level).map_err(EncoderError::Backend)?;
        encoder
            .set_parameter(CParameter::WindowLog(window_log))
            .map_err(EncoderError::Backend)?;
        Ok(Self {
            encoder,
            staging: vec![0; STAGING_SIZE].into_boxed_slice(),
            staged: 0..0,
            state: EncoderState::Idle,
            frame_done: false,
        })
    }

    pub fn state(&self) -> EncoderState {
        self.state
    }

    fn unexpected<T>(&self, operation: &'static str) -> Result<T, EncoderError> {
        Err(EncoderError::UnexpectedState {
            state: self.state,
            operation,
        })
    }
}

impl StreamEncoder for ZstdStream {
    fn sink(&mut self, input: &[u8]) -> Result<usize, EncoderError> {
        match self.state {
            EncoderState::Idle | EncoderState::Sinking | EncoderState::Polling => {}
            _ => return self.unexpected("sink"),
        }
        self.state = EncoderState::Sinking;

        if !self.staged.is_empty() {
            return Ok(0);
        }

        let mut inbuf = InBuffer::around(input);
        let mut outbuf = OutBuffer::around(&mut self.staging[..]);
        self.encoder
            .run(&mut inbuf, &mut outbuf)
            .map_err(EncoderError::Backend)?;
        self.staged = 0..outbuf.pos();

        trace!("sink {} of {} staged {}", inbuf.pos(), input.len(), self.staged.len());
        Ok(inbuf.pos())
    }

    fn poll(&mut self, output: &mut [u8]) -> Result<(usize, PollStatus), EncoderError> {
        match self.state {
            EncoderState::Sinking | EncoderState::Polling => self.state = EncoderState::Polling,
            EncoderState::Finishing => {}
            _ => return self.unexpected("poll"),
        }

        let n = min(self.staged.len(), output.len());
        output[..n].copy_from_slice(&self.staging[self.staged.start..][..n]);
        self.staged.start += n;

        let status = match self.staged.is_empty() {
            true => PollStatus::Empty,
            false => PollStatus::More,
        };
        Ok((n, status))
    }

    fn finish(&mut self) -> Result<FinishStatus, EncoderError> {
        if self.state == EncoderState::Done {
            return self.unexpected("finish");
        }
        self.state = EncoderState::Finishing;

        if !self.staged.is_empty() {
            return Ok(FinishStatus::More);
        }

        if !self.frame_done {
            let mut outbuf = OutBuffer::around(&mut self.staging[..]);
            let remaining = self
                .encoder
                .finish(&mut outbuf, true)
                .map_err(EncoderError::Backend)?;
            self.staged = 0..outbuf.pos();
            self.frame_done = remaining == 0;

            if !self.staged.is_empty() || !self.frame_done {
                return Ok(FinishStatus::More);
            }
        }

        self.state = EncoderState::Done;
        Ok(FinishStatus::Done)
    }
}

fn drain(
    encoder: &mut impl StreamEncoder,
    chunk: &mut [u8],
    output: &mut Vec<u8>,
) -> Result<(), EncoderError> {
    loop {
        let (n, status) = encoder.poll(chunk)?;
        output.extend_from_slice(&chunk[..n]);
        if status == PollStatus::Empty {
            return Ok(());
        }
    }
}

/// Runs `raw` through `encoder` and returns the complete compressed stream.
///
/// Room for twice the input is reserved up front, which covers incompressible data.
pub fn compress(encoder: &mut impl StreamEncoder, raw: &[u8]) -> Result<Vec<u8>, EncoderError> {
    let reserve = raw.len().saturating_mul(2);
    let mut compressed = Vec::new();
    compressed
        .try_reserve_exact(reserve)
        .map_err(|_| EncoderError::Alloc(reserve))?;

    let mut chunk = [0u8; STAGING_SIZE];
    let mut sunk = 0;
    while sunk < raw.len() {
        sunk += encoder.sink(&raw[sunk..])?;
        drain(encoder, &mut chunk, &mut compressed)?;
    }

    while encoder.finish()? == FinishStatus::More {
        drain(encoder, &mut chunk, &mut compressed)?;
    }

    Ok(compressed)
}

/// Inverse of [`compress()`] for payloads produced by [`ZstdStream`].
pub fn decompress(compressed: &[u8]) -> io::Result<Vec<u8>> {
    zstd::stream::decode_all(compressed)
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn zstd() -> ZstdStream {
        ZstdStream::new(19, MIN_WINDOW_LOG).unwrap()
    }

    #[test]
    fn test_compress_roundtrip() {
        let raw: Vec<u8> = b"0123456789abcdef".repeat(1000);
        let compressed = compress(&mut zstd(), &raw).unwrap();
        assert!(compressed.len() < raw.len());
        assert_eq!(decompress(&compressed).unwrap(), raw);
    }

    #[test]
    fn test_compress_empty() {
        let mut encoder = zstd();
        let compressed = compress(&mut encoder, b"").unwrap();
        assert_eq!(encoder.state(), EncoderState::Done);
        assert_eq!(decompress(&compressed).unwrap(), b"");
    }

    #[test]
    fn test_sink_backpressure() {
        // Enough incompressible-ish input to overflow the staging buffer before finish.
        let raw: Vec<u8> = (0..100_000u32)
            .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8)
            .collect();
        let mut encoder = zstd();
        let mut sunk = 0;
        let mut refused = false;
        let mut chunk = [0u8; 16];
        let mut out = vec![];
        while sunk < raw.len() {
            let n = encoder.sink(&raw[sunk..]).unwrap();
            if n == 0 {
                refused = true;
            }
            sunk += n;
            // Only drain a little at a time so the encoder has to push back.
            let (n, _) = encoder.poll(&mut chunk).unwrap();
            out.extend_from_slice(&chunk[..n]);
        }
        drain(&mut encoder, &mut chunk, &mut out).unwrap();
        while encoder.finish().unwrap() == FinishStatus::More {
            drain(&mut encoder, &mut chunk, &mut out).unwrap();
        }
        assert!(refused);
        assert_eq!(decompress(&out).unwrap(), raw);
    }

    #[test]
    fn test_state_violations() {
        let mut encoder = zstd();
        assert!(matches!(
            encoder.poll(&mut [0; 4]),
            Err(EncoderError::UnexpectedState {
                state: EncoderState::Idle,
                ..
            })
        ));

        compress(&mut encoder, b"data").unwrap();
        assert!(matches!(
            encoder.sink(b"more"),
            Err(EncoderError::UnexpectedState {
                state: EncoderState::Done,
                operation: "sink"
            })
        ));
        assert!(matches!(
            encoder.finish(),
            Err(EncoderError::UnexpectedState { .. })
        ));
    }

    #[test]
    fn test_compression_config() {
        assert!(Compression::None.encoder().unwrap().is_none());
        assert!(Compression::default().encoder().unwrap().is_some());
    }
}
