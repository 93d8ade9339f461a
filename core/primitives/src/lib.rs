pub mod hash;

pub use hash::{keccak256, Hash256, EMPTY_TRIE_ROOT};
