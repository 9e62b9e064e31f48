//! Byte-level traffic obfuscation
//!
//! Every byte crossing the physical connection is XORed with a single-byte
//! key. The transform is its own inverse, so the same call encodes and
//! decodes. This hides the framing from casual inspection; it is not
//! encryption.

/// Default key shared with the peer
pub const DEFAULT_KEY: u8 = 0x64;

/// Single-byte XOR transform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XorObfuscator {
    key: u8,
}

impl XorObfuscator {
    /// Create a transform with the given key
    pub fn new(key: u8) -> Self {
        Self { key }
    }

    /// Get the key
    pub fn key(&self) -> u8 {
        self.key
    }

    /// Apply the transform in place
    pub fn apply(&self, buf: &mut [u8]) {
        if self.key == 0 {
            return;
        }
        for byte in buf.iter_mut() {
            *byte ^= self.key;
        }
    }

    /// Apply the transform to a copy of `buf`
    pub fn apply_to_vec(&self, buf: &[u8]) -> Vec<u8> {
        let mut out = buf.to_vec();
        self.apply(&mut out);
        out
    }
}

impl Default for XorObfuscator {
    fn default() -> Self {
        Self::new(DEFAULT_KEY)
    }
}
