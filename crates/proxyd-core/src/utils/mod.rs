//! Parsing and hashing helpers used by the cache.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `block_param` | Block tag and hex quantity parsing |
//! | `json_hash` | Canonical JSON encoding and SHA-256 keys |

pub mod block_param;
pub mod json_hash;

pub use block_param::{BlockParameter, BlockRef, BlockTag, ParseError as BlockParseError};
pub use json_hash::{canonical_json, sha256_canonical};
