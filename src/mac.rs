//! MAC: the 32-byte keyed hash used throughout the repository as both
//! content address and integrity tag (spec §3 "MAC").
//!
//! We use BLAKE3 in keyed mode. The key is derived once per repository
//! from the repository secret (see `crypto::kdf`) and never leaves the
//! process in plaintext form.

use std::convert::TryFrom;
use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Mac(pub [u8; 32]);

impl Mac {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Mac(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex-encoded short id, as used for the `PREFIX[:PATH]` snapshot
    /// reference syntax (spec §6) and in log messages (spec §7).
    pub fn short_hex(&self) -> String {
        hex_encode(&self.0[..4])
    }

    pub fn to_hex(&self) -> String {
        hex_encode(&self.0)
    }

    pub fn from_hex(s: &str) -> anyhow::Result<Self> {
        if s.len() != 64 {
            anyhow::bail!("mac hex string must be 64 chars, got {}", s.len());
        }
        let mut out = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let byte_str = std::str::from_utf8(chunk)?;
            out[i] = u8::from_str_radix(byte_str, 16)?;
        }
        Ok(Mac(out))
    }
}

impl TryFrom<&[u8]> for Mac {
    type Error = anyhow::Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() != 32 {
            anyhow::bail!("MAC must be 32 bytes, got {}", value.len());
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(value);
        Ok(Mac(out))
    }
}

impl fmt::Debug for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mac({})", self.short_hex())
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl serde::Serialize for Mac {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for Mac {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Mac::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Keyed MAC computation. `key` is the repository's derived MAC key
/// (32 bytes); plaintext content is hashed with BLAKE3 in keyed mode so
/// the address space is not forgeable without the repository secret.
pub fn compute_mac(key: &[u8; 32], data: &[u8]) -> Mac {
    let hash = blake3::keyed_hash(key, data);
    Mac(*hash.as_bytes())
}

/// Random (non-content-derived) MAC, used for state delta ids, lock ids
/// and maintenance-run ids (spec §4.4, §4.10, §4.11).
pub fn random_mac() -> Mac {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    Mac(bytes)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let mac = random_mac();
        let hex = mac.to_hex();
        let back = Mac::from_hex(&hex).unwrap();
        assert_eq!(mac, back);
    }

    #[test]
    fn mac_is_deterministic() {
        let key = [7u8; 32];
        let a = compute_mac(&key, b"hello dummy");
        let b = compute_mac(&key, b"hello dummy");
        assert_eq!(a, b);
        let c = compute_mac(&key, b"hello foo");
        assert_ne!(a, c);
    }
}
