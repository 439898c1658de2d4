//! Grain identities and the fixed routing hash
//!
//! An identity is the cluster-wide address of a grain: the grain type name
//! plus a key. The 32-bit FNV-1a hash over a stable byte encoding of the
//! identity is the primary routing key for both the directory ring and the
//! SQL hash columns; it must never change across releases.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// FNV-1a 32-bit offset basis
const FNV_OFFSET: u32 = 0x811c_9dc5;
/// FNV-1a 32-bit prime
const FNV_PRIME: u32 = 0x0100_0193;

/// Fixed, portable FNV-1a 32-bit hash.
///
/// Shared by the directory ring and the persistence hash columns; the
/// constant is part of the storage format.
pub fn fnv1a32(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET;
    for b in bytes {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// The key half of a grain identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GrainKey {
    /// A plain guid key
    Guid(Uuid),
    /// A string key (singletons use well-known strings)
    Text(String),
    /// A guid with a string suffix, e.g. `(character-id, season)`
    GuidCompound(Uuid, String),
}

impl GrainKey {
    /// Well-known key for singleton grains
    pub fn singleton() -> Self {
        GrainKey::Text("default".to_string())
    }

    /// The 128-bit key split into two 64-bit words for the SQL key columns.
    ///
    /// String keys carry their text in the extension column and zero words.
    pub fn words(&self) -> (i64, i64) {
        match self {
            GrainKey::Guid(id) | GrainKey::GuidCompound(id, _) => {
                let n = id.as_u128();
                ((n >> 64) as u64 as i64, (n as u64) as i64)
            }
            GrainKey::Text(_) => (0, 0),
        }
    }

    /// The string component stored in the key-extension column, if any
    pub fn extension(&self) -> Option<&str> {
        match self {
            GrainKey::Guid(_) => None,
            GrainKey::Text(s) => Some(s),
            GrainKey::GuidCompound(_, suffix) => Some(suffix),
        }
    }

    /// Stable numeric tag for the key kind, part of the storage format
    pub(crate) fn kind_tag(&self) -> u8 {
        match self {
            GrainKey::Guid(_) => 1,
            GrainKey::Text(_) => 2,
            GrainKey::GuidCompound(_, _) => 3,
        }
    }

    /// Rebuild a key from its stored parts (kind tag, key words, extension)
    pub(crate) fn from_parts(
        kind: u8,
        n0: i64,
        n1: i64,
        extension: Option<String>,
    ) -> crate::error::Result<Self> {
        let guid = || {
            let n = ((n0 as u64 as u128) << 64) | (n1 as u64 as u128);
            Uuid::from_u128(n)
        };
        match kind {
            1 => Ok(GrainKey::Guid(guid())),
            2 => Ok(GrainKey::Text(extension.unwrap_or_default())),
            3 => Ok(GrainKey::GuidCompound(
                guid(),
                extension.unwrap_or_default(),
            )),
            other => Err(crate::error::Error::Decode(format!(
                "unknown grain key kind {other}"
            ))),
        }
    }
}

impl fmt::Display for GrainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrainKey::Guid(id) => write!(f, "{id}"),
            GrainKey::Text(s) => write!(f, "{s}"),
            GrainKey::GuidCompound(id, suffix) => write!(f, "{id}+{suffix}"),
        }
    }
}

/// Cluster-wide grain address: `(type name, key)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GrainIdentity {
    /// Registered grain type name
    pub grain_type: String,
    /// Identity key
    pub key: GrainKey,
}

impl GrainIdentity {
    /// Address a grain by guid key
    pub fn guid(grain_type: impl Into<String>, id: Uuid) -> Self {
        Self {
            grain_type: grain_type.into(),
            key: GrainKey::Guid(id),
        }
    }

    /// Address a grain by string key
    pub fn text(grain_type: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            grain_type: grain_type.into(),
            key: GrainKey::Text(key.into()),
        }
    }

    /// Address a grain by compound key, e.g. a per-character-per-season grain
    pub fn compound(grain_type: impl Into<String>, id: Uuid, suffix: impl Into<String>) -> Self {
        Self {
            grain_type: grain_type.into(),
            key: GrainKey::GuidCompound(id, suffix.into()),
        }
    }

    /// The singleton instance of a grain type
    pub fn singleton(grain_type: impl Into<String>) -> Self {
        Self {
            grain_type: grain_type.into(),
            key: GrainKey::singleton(),
        }
    }

    /// Routing hash over the stable identity encoding.
    ///
    /// Collisions are legal; they are resolved by comparing the full
    /// identity tuple wherever the hash is used as an index.
    pub fn routing_hash(&self) -> u32 {
        let mut bytes = Vec::with_capacity(self.grain_type.len() + 24);
        bytes.extend_from_slice(self.grain_type.as_bytes());
        bytes.push(0);
        bytes.push(self.key.kind_tag());
        match &self.key {
            GrainKey::Guid(id) => bytes.extend_from_slice(id.as_bytes()),
            GrainKey::Text(s) => bytes.extend_from_slice(s.as_bytes()),
            GrainKey::GuidCompound(id, suffix) => {
                bytes.extend_from_slice(id.as_bytes());
                bytes.extend_from_slice(suffix.as_bytes());
            }
        }
        fnv1a32(&bytes)
    }
}

impl fmt::Display for GrainIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.grain_type, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a32_matches_reference_vectors() {
        // Published FNV-1a test vectors
        assert_eq!(fnv1a32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a32(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a32(b"foobar"), 0xbf9c_f968);
    }

    #[test]
    fn routing_hash_is_stable_and_type_scoped() {
        let id = Uuid::from_u128(0x1234_5678_9abc_def0_1122_3344_5566_7788);
        let a = GrainIdentity::guid("inventory", id);
        let b = GrainIdentity::guid("inventory", id);
        let c = GrainIdentity::guid("character", id);

        assert_eq!(a.routing_hash(), b.routing_hash());
        assert_ne!(a.routing_hash(), c.routing_hash());
    }

    #[test]
    fn compound_key_carries_suffix_in_extension() {
        let id = Uuid::new_v4();
        let identity = GrainIdentity::compound("inventory", id, "season-7");

        assert_eq!(identity.key.extension(), Some("season-7"));
        let (n0, n1) = identity.key.words();
        let n = ((n0 as u64 as u128) << 64) | (n1 as u64 as u128);
        assert_eq!(n, id.as_u128());
    }

    #[test]
    fn text_key_uses_extension_only() {
        let identity = GrainIdentity::singleton("rate-limit-config");
        assert_eq!(identity.key.words(), (0, 0));
        assert_eq!(identity.key.extension(), Some("default"));
    }

    #[test]
    fn suffix_distinguishes_seasons() {
        let id = Uuid::new_v4();
        let a = GrainIdentity::compound("inventory", id, "season-7");
        let b = GrainIdentity::compound("inventory", id, "season-8");
        assert_ne!(a.routing_hash(), b.routing_hash());
        assert_ne!(a, b);
    }
}
