//! Content fingerprints for cheap equality checks.
//!
//! A [`Fingerprint`] is the first 128 bits of the BLAKE3 digest of a
//! document's text. The version store compares fingerprints instead of
//! full contents when deciding whether a client's view is stale, so a
//! collision is treated as impossible.
//!
//! On the wire a fingerprint travels as 32 lowercase hex characters in
//! the `hash` field of `content` frames.

use std::fmt;

use data_encoding::{HEXLOWER, HEXLOWER_PERMISSIVE};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Digest width in bytes.
const FINGERPRINT_LEN: usize = 16;

/// 128-bit content digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    /// Fingerprint of `content`.
    pub fn of(content: &str) -> Self {
        let digest = blake3::hash(content.as_bytes());
        let mut bytes = [0u8; FINGERPRINT_LEN];
        bytes.copy_from_slice(&digest.as_bytes()[..FINGERPRINT_LEN]);
        Self(bytes)
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    /// Lowercase hex rendering used on the wire.
    pub fn to_hex(&self) -> String {
        HEXLOWER.encode(&self.0)
    }

    /// Parse the hex rendering produced by [`Fingerprint::to_hex`].
    ///
    /// Upper-case digits are accepted.
    pub fn from_hex(s: &str) -> Result<Self, FingerprintError> {
        let input = s.as_bytes();
        match HEXLOWER_PERMISSIVE.decode_len(input.len()) {
            Ok(FINGERPRINT_LEN) => {}
            _ => return Err(FingerprintError::Length(input.len())),
        }
        let mut bytes = [0u8; FINGERPRINT_LEN];
        HEXLOWER_PERMISSIVE
            .decode_mut(input, &mut bytes)
            .map_err(|partial| FingerprintError::Decode(partial.error))?;
        Ok(Self(bytes))
    }
}

/// Shorthand for [`Fingerprint::of`].
pub fn fingerprint(content: &str) -> Fingerprint {
    Fingerprint::of(content)
}

/// Errors parsing a hex fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FingerprintError {
    #[error("fingerprint must be 32 hex characters, got {0}")]
    Length(usize),
    #[error("invalid hex fingerprint: {0}")]
    Decode(data_encoding::DecodeError),
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Fingerprint::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
