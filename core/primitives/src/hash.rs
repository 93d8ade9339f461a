use sha3::{Digest, Keccak256};
use std::fmt;

/// 32-byte Keccak-256 digest.
///
/// Used for trie node references and state roots. Displays as 0x-prefixed
/// lowercase hex.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, serde::Serialize, serde::Deserialize)]
pub struct Hash256(pub [u8; 32]);

/// Keccak-256 of the RLP encoding of the empty string (`0x80`), i.e. the
/// root hash of an empty Merkle Patricia Trie.
pub const EMPTY_TRIE_ROOT: Hash256 = Hash256([
    0x56, 0xe8, 0x1f, 0x17, 0x1b, 0xcc, 0x55, 0xa6, 0xff, 0x83, 0x45, 0xe6, 0x92, 0xc0, 0xf8,
    0x6e, 0x5b, 0x48, 0xe0, 0x1b, 0x99, 0x6c, 0xad, 0xc0, 0x01, 0x62, 0x2f, 0xb5, 0xe3, 0x63,
    0xb4, 0x21,
]);

impl Hash256 {
    pub const LENGTH: usize = 32;

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut hash = [0u8; 32];
        hash.copy_from_slice(bytes);
        Self(hash)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Keccak-256 of `data`.
pub fn keccak256(data: impl AsRef<[u8]>) -> Hash256 {
    let mut hasher = Keccak256::new();
    hasher.update(data.as_ref());
    Hash256(hasher.finalize().into())
}
