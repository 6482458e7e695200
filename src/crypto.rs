use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A content hash (32 bytes), SHA-256 over the canonical JSON encoding of a value.
///
/// Cryptographic signing is out of scope here — validator identity is an
/// opaque string bound to authentication by a layer above this crate; this
/// type is used purely for block/committee content addressing.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, PartialOrd, Ord)]
pub struct Hash(pub [u8; 32]);

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl From<[u8; 32]> for Hash {
    fn from(bytes: [u8; 32]) -> Self {
        Hash(bytes)
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Hash any serializable value via its canonical JSON encoding.
///
/// Used to derive block identity from content (parent hash, epoch, chain id,
/// payload) rather than assigning it externally — see DESIGN.md, Open
/// Question 1.
pub fn hash_data<T: Serialize>(data: &T) -> Hash {
    let serialized = serde_json::to_vec(data).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(serialized);
    Hash(hasher.finalize().into())
}
