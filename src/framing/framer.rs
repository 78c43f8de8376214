use std::borrow::Cow;

use serde_json::Value;

use super::cipher::XorCipher;
use super::compression::{self, Inflated, StreamInflater};
use crate::utils::error::FramingError;

pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024;
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramerConfig {
    pub max_packet_size: usize,
    pub encryption_key: Option<String>,
    pub compression: bool,
    /// Extract brace-delimited JSON objects instead of passing bytes through.
    pub json_mode: bool,
    /// Upper bound on buffered, not yet framed, inbound bytes.
    pub max_buffer_size: usize,
}

impl Default for FramerConfig {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            encryption_key: None,
            compression: false,
            json_mode: true,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Json(Value),
    Raw(Vec<u8>),
}

/// Packetizer and reassembler for one serial line.
///
/// Inbound decoding is stateful, so each port owns its own framer.
///
/// Payload boundaries on the wire:
/// - with compression, the end of each zlib stream ends a payload, and the
///   cipher restarts at key offset 0 for the next one;
/// - without compression in JSON mode, bytes are buffered still encrypted;
///   each decoded JSON object ends a payload, and the byte after it is
///   decrypted from offset 0 again;
/// - without compression in raw mode, each read is decrypted on its own.
#[derive(Debug)]
pub struct SerialFramer {
    config: FramerConfig,
    cipher: Option<XorCipher>,
    buffer: Vec<u8>,
    inflater: StreamInflater,
}

impl SerialFramer {
    pub fn new(config: FramerConfig) -> Result<Self, FramingError> {
        if config.max_packet_size == 0 {
            return Err(FramingError::Capacity(
                "max packet size must be at least 1 byte".to_string(),
            ));
        }
        let cipher = config
            .encryption_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .map(XorCipher::new);
        Ok(Self {
            config,
            cipher,
            buffer: Vec::new(),
            inflater: StreamInflater::new(),
        })
    }

    pub fn config(&self) -> &FramerConfig {
        &self.config
    }

    /// Bytes waiting for a complete frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial inbound state, e.g. after the port reopened.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.inflater.reset();
    }

    /// Apply the outbound transforms (compress, then encrypt).
    pub fn seal(&self, payload: &[u8]) -> Result<Vec<u8>, FramingError> {
        let mut wire = if self.config.compression {
            compression::compress(payload)?
        } else {
            payload.to_vec()
        };
        if let Some(cipher) = &self.cipher {
            cipher.apply_in_place(&mut wire, 0);
        }
        Ok(wire)
    }

    /// Inverse of [`seal`](Self::seal) for one complete payload.
    pub fn open(&self, wire: &[u8]) -> Result<Vec<u8>, FramingError> {
        let plain = match &self.cipher {
            Some(cipher) => cipher.apply(wire, 0),
            None => wire.to_vec(),
        };
        if self.config.compression {
            compression::decompress(&plain)
        } else {
            Ok(plain)
        }
    }

    /// Seal `payload` and cut it into packets of at most `max_packet_size`.
    pub fn encode(&self, payload: &[u8]) -> Result<Vec<Vec<u8>>, FramingError> {
        let wire = self.seal(payload)?;
        Ok(split_packets(&wire, self.config.max_packet_size))
    }

    /// Push received bytes and return every frame completed by them.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Frame>, FramingError> {
        let mut frames = Vec::new();

        if self.config.compression {
            let mut rest = bytes;
            while !rest.is_empty() {
                let offset = self.inflater.consumed() as usize;
                let plain: Cow<'_, [u8]> = match &self.cipher {
                    Some(cipher) => Cow::Owned(cipher.apply(rest, offset)),
                    None => Cow::Borrowed(rest),
                };
                match self.inflater.feed(&plain) {
                    Ok(Inflated::NeedMore) => break,
                    Ok(Inflated::Complete { consumed, payload }) => {
                        rest = &rest[consumed..];
                        self.accept_payload(payload, &mut frames)?;
                    }
                    Err(e) => {
                        self.inflater.reset();
                        return Err(e);
                    }
                }
            }
        } else if self.config.json_mode {
            self.buffer.extend_from_slice(bytes);
            self.check_capacity()?;
            let values = match &self.cipher {
                Some(cipher) => extract_sealed_json_frames(&mut self.buffer, cipher),
                None => extract_json_frames(&mut self.buffer),
            };
            frames.extend(values.into_iter().map(Frame::Json));
        } else if !bytes.is_empty() {
            let data = match &self.cipher {
                Some(cipher) => cipher.apply(bytes, 0),
                None => bytes.to_vec(),
            };
            frames.push(Frame::Raw(data));
        }

        Ok(frames)
    }

    fn accept_payload(
        &mut self,
        payload: Vec<u8>,
        frames: &mut Vec<Frame>,
    ) -> Result<(), FramingError> {
        if !self.config.json_mode {
            frames.push(Frame::Raw(payload));
            return Ok(());
        }
        self.buffer.extend_from_slice(&payload);
        self.check_capacity()?;
        frames.extend(
            extract_json_frames(&mut self.buffer)
                .into_iter()
                .map(Frame::Json),
        );
        Ok(())
    }

    fn check_capacity(&mut self) -> Result<(), FramingError> {
        if self.buffer.len() > self.config.max_buffer_size {
            let len = self.buffer.len();
            self.buffer.clear();
            return Err(FramingError::Capacity(format!(
                "inbound buffer holds {len} bytes, limit is {}",
                self.config.max_buffer_size
            )));
        }
        Ok(())
    }
}

/// Split `data` into consecutive packets of at most `max` bytes. An empty
/// payload yields no packets.
pub fn split_packets(data: &[u8], max: usize) -> Vec<Vec<u8>> {
    data.chunks(max.max(1)).map(<[u8]>::to_vec).collect()
}

pub fn reassemble(packets: &[Vec<u8>]) -> Vec<u8> {
    packets.concat()
}

enum Scan {
    Wait,
    Discard,
    Emit { value: Value, end: usize },
    Skip { start: usize },
}

/// Pull JSON objects out of a plaintext `buffer`.
///
/// Takes the span from the first `{` to the *last* `}`. If it parses, the
/// object is emitted and everything up to that `}` is consumed. If it does
/// not, only the `{` byte is dropped and the scan repeats. Two objects that
/// arrive in one read therefore come out as the second one only.
pub fn extract_json_frames(buffer: &mut Vec<u8>) -> Vec<Value> {
    let mut frames = Vec::new();

    loop {
        let scan = match (
            buffer.iter().position(|&b| b == b'{'),
            buffer.iter().rposition(|&b| b == b'}'),
        ) {
            (None, _) => Scan::Discard,
            (Some(start), Some(end)) if end > start => {
                match serde_json::from_slice::<Value>(&buffer[start..=end]) {
                    Ok(value) => Scan::Emit { value, end },
                    Err(_) => Scan::Skip { start },
                }
            }
            _ => Scan::Wait,
        };

        match scan {
            Scan::Wait => break,
            Scan::Discard => {
                buffer.clear();
                break;
            }
            Scan::Emit { value, end } => {
                buffer.drain(..=end);
                frames.push(value);
            }
            Scan::Skip { start } => {
                buffer.remove(start);
            }
        }
    }

    frames
}

/// Pull JSON objects out of a `buffer` of XOR ciphertext made of sealed
/// payloads sent back to back, each one starting at key offset 0.
///
/// A payload can only start on a byte that decrypts to `{` at offset 0.
/// Bytes ahead of the first such byte are discarded. From there the first
/// complete JSON value is decoded and consumed, and the byte after it starts
/// the next payload. A start that does not decode is dropped and the next
/// candidate tried, so a truncated payload costs only itself.
pub fn extract_sealed_json_frames(buffer: &mut Vec<u8>, cipher: &XorCipher) -> Vec<Value> {
    let mut frames = Vec::new();
    let head = b'{' ^ cipher.key_byte(0);

    loop {
        let Some(start) = buffer.iter().position(|&b| b == head) else {
            buffer.clear();
            break;
        };
        buffer.drain(..start);

        let plain = cipher.apply(buffer, 0);
        let mut values = serde_json::Deserializer::from_slice(&plain).into_iter::<Value>();
        match values.next() {
            Some(Ok(value)) => {
                let end = values.byte_offset();
                buffer.drain(..end);
                frames.push(value);
            }
            Some(Err(e)) if e.is_eof() => break,
            _ => {
                buffer.remove(0);
            }
        }
    }

    frames
}
