//! Strong entity tags
//!
//! Only strong validators are issued or honored. A weak (`W/`) tag in a
//! request never matches, so a conditional request can only be answered with
//! 304 when the bytes are identical.

use crate::core::manifest::ContentHash;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityTag {
    opaque: String,
}

impl EntityTag {
    /// Tag for a manifest: its content hash
    pub fn for_manifest(hash: &ContentHash) -> Self {
        EntityTag {
            opaque: hash.to_hex(),
        }
    }

    /// Tag for an arbitrary response body: SHA-256 of the bytes
    pub fn for_body(body: &[u8]) -> Self {
        Self::for_manifest(&ContentHash::of(body))
    }

    /// Parse a single strong tag such as `"abc"`
    ///
    /// Weak tags and unquoted values are rejected.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.starts_with("W/") {
            return None;
        }
        let inner = value.strip_prefix('"')?.strip_suffix('"')?;
        if inner.contains('"') {
            return None;
        }
        Some(EntityTag {
            opaque: inner.to_string(),
        })
    }

    pub fn opaque(&self) -> &str {
        &self.opaque
    }

    /// Quoted header form
    pub fn header_value(&self) -> String {
        format!("\"{}\"", self.opaque)
    }

    /// Evaluate an `If-None-Match` header with strong comparison
    ///
    /// # Examples
    ///
    /// ```
    /// use manifest_survival::EntityTag;
    ///
    /// let tag = EntityTag::parse("\"v1\"").unwrap();
    /// assert!(tag.matches_if_none_match("\"v0\", \"v1\""));
    /// assert!(tag.matches_if_none_match("*"));
    /// assert!(!tag.matches_if_none_match("W/\"v1\""));
    /// ```
    pub fn matches_if_none_match(&self, header: &str) -> bool {
        let header = header.trim();
        if header == "*" {
            return true;
        }
        header
            .split(',')
            .filter_map(EntityTag::parse)
            .any(|candidate| candidate == *self)
    }
}

impl fmt::Display for EntityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self.opaque)
    }
}
