use sha2::{Digest, Sha256};

/// Repeating-key XOR with a 32-byte key derived as `SHA-256(user_key)`.
///
/// The operation is its own inverse. `offset` is the position of `data[0]`
/// within the payload, so a payload can be processed in pieces.
#[derive(Clone)]
pub struct XorCipher {
    key: [u8; 32],
}

impl XorCipher {
    pub fn new(user_key: &str) -> Self {
        let key: [u8; 32] = Sha256::digest(user_key.as_bytes()).into();
        Self { key }
    }

    /// Key byte applied at payload position `offset`.
    pub fn key_byte(&self, offset: usize) -> u8 {
        self.key[offset % self.key.len()]
    }

    pub fn apply_in_place(&self, data: &mut [u8], offset: usize) {
        for (i, byte) in data.iter_mut().enumerate() {
            *byte ^= self.key[(offset + i) % self.key.len()];
        }
    }

    pub fn apply(&self, data: &[u8], offset: usize) -> Vec<u8> {
        let mut out = data.to_vec();
        self.apply_in_place(&mut out, offset);
        out
    }
}

impl std::fmt::Debug for XorCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XorCipher").field("key", &"<redacted>").finish()
    }
}
