//! Merkle reference computation: hex-prefix path encoding, branch and
//! two-piece RLP, and the inline-vs-hash node reference rule.
//!
//! A node reference is the node's RLP encoding when that is shorter than
//! 32 bytes, otherwise its Keccak-256 hash.  Inline references are embedded
//! raw into the parent's RLP (they are already RLP-formed); hashed ones are
//! embedded as 32-byte strings.

use crate::trie::nibbles::NibbleSlice;
use rlp::RlpStream;
use std::fmt;
use triedb_primitives::{keccak256, Hash256};

pub const HASH_LENGTH: usize = 32;

/// Reference to a child node: either its full RLP encoding (< 32 bytes) or
/// the Keccak-256 hash of that encoding.
#[derive(Clone, PartialEq, Eq)]
pub struct NodeRef {
    len: u8,
    is_hash: bool,
    bytes: [u8; HASH_LENGTH],
}

impl NodeRef {
    pub fn from_rlp(encoding: &[u8]) -> Self {
        if encoding.len() >= HASH_LENGTH {
            let mut bytes = [0u8; HASH_LENGTH];
            bytes.copy_from_slice(keccak256(encoding).as_bytes());
            Self { len: HASH_LENGTH as u8, is_hash: true, bytes }
        } else {
            let mut bytes = [0u8; HASH_LENGTH];
            bytes[..encoding.len()].copy_from_slice(encoding);
            Self { len: encoding.len() as u8, is_hash: false, bytes }
        }
    }

    /// Reconstructs a reference from its serialized parts; `is_hash` comes
    /// from the high bit of the on-disk length field.
    pub fn from_parts(bytes: &[u8], is_hash: bool) -> Self {
        assert!(bytes.len() <= HASH_LENGTH);
        assert!(!is_hash || bytes.len() == HASH_LENGTH);
        let mut buf = [0u8; HASH_LENGTH];
        buf[..bytes.len()].copy_from_slice(bytes);
        Self { len: bytes.len() as u8, is_hash, bytes: buf }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_hash(&self) -> bool {
        self.is_hash
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}0x{}", if self.is_hash { "#" } else { "" }, hex::encode(self.as_bytes()))
    }
}

/// Hex-prefix encoding of `path` (Ethereum's compact encoding): the first
/// byte's high nibble is `(leaf << 1) | (len & 1)`, an odd path's first
/// nibble rides in the low nibble of the first byte, and the remaining
/// nibbles pack two per byte.
pub fn compact_encode(path: NibbleSlice<'_>, leaf: bool) -> Vec<u8> {
    let odd = path.len() % 2 == 1;
    let flags = ((leaf as u8) << 1) | (odd as u8);
    let mut out = Vec::with_capacity(1 + path.len() / 2);
    let mut i = 0;
    if odd {
        out.push(flags << 4 | path.at(0));
        i = 1;
    } else {
        out.push(flags << 4);
    }
    while i < path.len() {
        out.push(path.at(i) << 4 | path.at(i + 1));
        i += 2;
    }
    out
}

fn append_ref(stream: &mut RlpStream, reference: &NodeRef) {
    if reference.is_hash() {
        stream.append(&reference.as_bytes().to_vec());
    } else {
        stream.append_raw(reference.as_bytes(), 1);
    }
}

/// 17-element branch RLP: 16 child references (absent branches encode as
/// the empty string) followed by the node's value (or the empty string).
pub fn encode_branch(children: &[Option<&NodeRef>; 16], value: Option<&[u8]>) -> Vec<u8> {
    let mut stream = RlpStream::new_list(17);
    for child in children {
        match child {
            Some(reference) => append_ref(&mut stream, reference),
            None => {
                stream.append_empty_data();
            }
        }
    }
    match value {
        Some(value) => {
            stream.append(&value.to_vec());
        }
        None => {
            stream.append_empty_data();
        }
    }
    stream.out().to_vec()
}

/// Two-piece RLP `(HP(path), payload)`: a leaf when the payload is the
/// node's value, an extension when it is the reference of the branch the
/// path leads to.
pub enum SecondPiece<'a> {
    Value(&'a [u8]),
    Ref(&'a NodeRef),
}

pub fn encode_two_piece(path: NibbleSlice<'_>, second: SecondPiece<'_>) -> Vec<u8> {
    let leaf = matches!(second, SecondPiece::Value(_));
    let mut stream = RlpStream::new_list(2);
    stream.append(&compact_encode(path, leaf));
    match second {
        SecondPiece::Value(value) => {
            stream.append(&value.to_vec());
        }
        SecondPiece::Ref(reference) => append_ref(&mut stream, reference),
    }
    stream.out().to_vec()
}

/// Canonical RLP of a node given its path, value, and per-branch child
/// references.
///
/// A node with children is a branch, wrapped in an extension two-piece
/// when its path fragment is non-empty; a node with only a value is a
/// leaf.  The node's value always sits at the branch point (the 17th
/// slot), which is also where nested subtrees hang.
pub fn encode_node_rlp(
    path: NibbleSlice<'_>,
    value: Option<&[u8]>,
    children: &[Option<&NodeRef>; 16],
) -> Vec<u8> {
    let child_count = children.iter().filter(|c| c.is_some()).count();
    if child_count == 0 {
        let value = value.expect("childless node must carry a value");
        return encode_two_piece(path, SecondPiece::Value(value));
    }
    let branch = encode_branch(children, value);
    if path.is_empty() {
        branch
    } else {
        let reference = NodeRef::from_rlp(&branch);
        encode_two_piece(path, SecondPiece::Ref(&reference))
    }
}

/// Root hash: always the Keccak-256 of the root encoding, even when the
/// encoding is short enough to inline elsewhere.
pub fn root_hash_of_rlp(encoding: &[u8]) -> Hash256 {
    keccak256(encoding)
}
