//! zlib compression helpers plus a streaming inflater that finds where one
//! compressed payload ends inside a longer byte stream.

use std::io::Write;

use flate2::write::{ZlibDecoder, ZlibEncoder};
use flate2::{Compression, Decompress, FlushDecompress, Status};

use crate::utils::error::FramingError;

pub fn compress(data: &[u8]) -> Result<Vec<u8>, FramingError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>, FramingError> {
    let mut decoder = ZlibDecoder::new(Vec::new());
    decoder.write_all(data)?;
    Ok(decoder.finish()?)
}

/// Outcome of feeding bytes to a [`StreamInflater`].
#[derive(Debug, PartialEq, Eq)]
pub enum Inflated {
    /// All input consumed, the payload is not complete yet.
    NeedMore,
    /// A payload ended after `consumed` input bytes.
    Complete { consumed: usize, payload: Vec<u8> },
}

/// Incremental zlib decoder. zlib streams are self-terminating, so the end of
/// each payload is found without any extra length prefix.
pub struct StreamInflater {
    inner: Decompress,
    output: Vec<u8>,
}

impl Default for StreamInflater {
    fn default() -> Self {
        Self {
            inner: Decompress::new(true),
            output: Vec::new(),
        }
    }
}

impl StreamInflater {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.inner.reset(true);
        self.output.clear();
    }

    /// Bytes of the current payload consumed so far.
    pub fn consumed(&self) -> u64 {
        self.inner.total_in()
    }

    pub fn feed(&mut self, input: &[u8]) -> Result<Inflated, FramingError> {
        let mut consumed = 0usize;
        loop {
            if self.output.capacity() - self.output.len() < 1024 {
                self.output.reserve(4096);
            }
            let in_before = self.inner.total_in();
            let out_before = self.inner.total_out();

            let status = self
                .inner
                .decompress_vec(&input[consumed..], &mut self.output, FlushDecompress::None)
                .map_err(|e| FramingError::Compression(e.to_string()))?;

            consumed += (self.inner.total_in() - in_before) as usize;
            let progressed =
                self.inner.total_in() != in_before || self.inner.total_out() != out_before;

            match status {
                Status::StreamEnd => {
                    let payload = std::mem::take(&mut self.output);
                    self.reset();
                    return Ok(Inflated::Complete { consumed, payload });
                }
                Status::Ok | Status::BufError => {
                    let output_full = self.output.len() == self.output.capacity();
                    if !progressed || (consumed == input.len() && !output_full) {
                        return Ok(Inflated::NeedMore);
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for StreamInflater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamInflater")
            .field("total_in", &self.inner.total_in())
            .field("buffered", &self.output.len())
            .finish()
    }
}
