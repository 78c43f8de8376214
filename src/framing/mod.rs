//! Serial framing
//!
//! Turns payloads into packets for a byte-oriented serial line and turns the
//! received byte stream back into JSON frames.
//!
//! Outbound: `payload -> compress? -> encrypt? -> split into packets`.
//! Inbound: `bytes -> decrypt? -> decompress? -> brace-delimited JSON`.
//!
//! Encryption is a repeating-key XOR against `SHA-256(user key)`; it hides
//! traffic from casual inspection only. Compression is zlib.

pub mod cipher;
pub mod compression;
pub mod framer;

pub use cipher::XorCipher;
pub use framer::{
    Frame, FramerConfig, SerialFramer, extract_json_frames, extract_sealed_json_frames, reassemble,
    split_packets,
};

#[cfg(test)]
mod tests;
