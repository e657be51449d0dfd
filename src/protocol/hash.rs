//! Content hashing for directive entries.
//!
//! Hashes are BLAKE3 over the uncompressed bytes, so a target can verify what it
//! is about to write regardless of the codec used on the wire.

use serde::{Serialize, Serializer};
use std::fmt;

/// Above this size hashing is spread over the rayon pool.
const PARALLEL_THRESHOLD: usize = 128 * 1024;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub const LEN: usize = 32;

    pub fn of(data: &[u8]) -> Self {
        let hash = if data.len() > PARALLEL_THRESHOLD {
            let mut hasher = blake3::Hasher::new();
            hasher.update_rayon(data);
            hasher.finalize()
        } else {
            blake3::hash(data)
        };
        Self(*hash.as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check `data` against this hash in constant time.
    pub fn verify(&self, data: &[u8]) -> bool {
        blake3::Hash::from_bytes(self.0) == blake3::Hash::from_bytes(Self::of(data).0)
    }

    pub fn to_hex(&self) -> String {
        blake3::Hash::from_bytes(self.0).to_hex().to_string()
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}
