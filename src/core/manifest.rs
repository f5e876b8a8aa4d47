//! Provenance manifest model
//!
//! A manifest is an immutable byte blob: the canonical encoding of its
//! assertions, issuer reference, signature and creation time. Its identity is
//! the SHA-256 of those canonical bytes ([`ContentHash`]).
//!
//! Canonical encoding rules:
//! - JSON with object keys in lexicographic order at every depth
//! - no insignificant whitespace
//! - signature as lowercase hex
//! - creation time as RFC 3339 UTC with second precision

use crate::error::{ProvenanceError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// SHA-256 identity of a manifest's canonical bytes
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Length of the hex form
    pub const HEX_LEN: usize = 64;

    /// Hash arbitrary bytes
    ///
    /// # Examples
    ///
    /// ```
    /// use manifest_survival::ContentHash;
    ///
    /// let h = ContentHash::of(b"abc");
    /// assert_eq!(
    ///     h.to_hex(),
    ///     "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    /// );
    /// ```
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        ContentHash(hasher.finalize().into())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        ContentHash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse the 64-character lowercase hex form
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != Self::HEX_LEN || !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(ProvenanceError::InvalidHash(s.to_string()));
        }
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out).map_err(|_| ProvenanceError::InvalidHash(s.to_string()))?;
        Ok(ContentHash(out))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// True when `bytes` hash to this value
    pub fn matches(&self, bytes: &[u8]) -> bool {
        ContentHash::of(bytes) == *self
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = ProvenanceError;

    fn from_str(s: &str) -> Result<Self> {
        ContentHash::from_hex(s)
    }
}

impl Serialize for ContentHash {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ContentHash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// One typed claim inside a manifest
///
/// The payload is opaque to this crate beyond byte identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assertion {
    /// Assertion kind, e.g. `"c2pa.actions"` or `"stds.exif"`
    pub kind: String,
    pub payload: serde_json::Value,
}

impl Assertion {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Assertion {
            kind: kind.into(),
            payload,
        }
    }
}

/// Signed provenance manifest
///
/// Built and signed upstream; this crate only needs to encode it canonically
/// so that the same logical manifest always produces the same [`ContentHash`].
///
/// # Examples
///
/// ```
/// use manifest_survival::{Assertion, Manifest};
/// use serde_json::json;
///
/// let manifest = Manifest::new("did:web:issuer.example")
///     .with_assertion(Assertion::new("c2pa.actions", json!({"action": "created"})))
///     .with_signature(vec![0xde, 0xad]);
///
/// let bytes = manifest.to_canonical_bytes().unwrap();
/// let parsed = Manifest::from_bytes(&bytes).unwrap();
/// assert_eq!(parsed.content_hash().unwrap(), manifest.content_hash().unwrap());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub assertions: Vec<Assertion>,

    /// Issuer reference (DID, certificate subject, or key id)
    pub issuer: String,

    /// Signature over the unsigned manifest, produced by the external signer
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,

    #[serde(with = "rfc3339_seconds")]
    pub created_at: DateTime<Utc>,
}

impl Manifest {
    /// Media type used when serving manifest bytes
    pub const MEDIA_TYPE: &'static str = "application/c2pa+json";

    pub fn new(issuer: impl Into<String>) -> Self {
        Manifest {
            assertions: Vec::new(),
            issuer: issuer.into(),
            signature: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_assertion(mut self, assertion: Assertion) -> Self {
        self.assertions.push(assertion);
        self
    }

    pub fn with_signature(mut self, signature: Vec<u8>) -> Self {
        self.signature = signature;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Canonical bytes: sorted keys, compact, deterministic
    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>> {
        // serde_json::Value maps are BTreeMaps, so the round trip sorts keys
        let value = serde_json::to_value(self)?;
        Ok(serde_json::to_vec(&value)?)
    }

    /// Signing input: the canonical encoding with an empty signature
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.signature.clear();
        unsigned.to_canonical_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| ProvenanceError::MalformedManifest(e.to_string()))
    }

    pub fn content_hash(&self) -> Result<ContentHash> {
        Ok(ContentHash::of(&self.to_canonical_bytes()?))
    }

    /// True when `bytes` are already in canonical form
    pub fn is_canonical(bytes: &[u8]) -> bool {
        match Manifest::from_bytes(bytes).and_then(|m| m.to_canonical_bytes()) {
            Ok(canonical) => canonical == bytes,
            Err(_) => false,
        }
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

mod rfc3339_seconds {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(time: &DateTime<Utc>, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&time.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
