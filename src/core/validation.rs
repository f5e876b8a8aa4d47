//! Validation for manifest references
//!
//! A manifest reference is the canonical URL of a manifest. The URL always
//! encodes the manifest's content hash in its final path segment, so that a
//! fetched body can be checked against the location it was fetched from:
//!
//! ```text
//! https://manifests.example.com/manifests/<64 lowercase hex>
//! ```
//!
//! References arrive as bare URLs (EXIF strings, discovery pointers) or as an
//! HTTP `Link` header value: `<url>; rel="c2pa-manifest"`.

use crate::core::manifest::ContentHash;
use crate::error::{ProvenanceError, Result};
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// Path segment preceding the hash
pub const MANIFEST_PATH: &str = "manifests";

/// `rel` value that marks a manifest link
pub const LINK_REL: &str = "c2pa-manifest";

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(https?://[A-Za-z0-9.\-]+(?::[0-9]{1,5})?(?:/[A-Za-z0-9._~\-]+)*)/manifests/([0-9a-f]{64})")
            .expect("static reference pattern")
    })
}

fn link_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"<([^>]+)>\s*((?:;\s*[A-Za-z\-]+\s*=\s*(?:"[^"]*"|[^;,\s]+)\s*)*)"#)
            .expect("static link pattern")
    })
}

/// Canonical location of a manifest
///
/// # Examples
///
/// ```
/// use manifest_survival::{ContentHash, ManifestReference};
///
/// let hash = ContentHash::of(b"manifest");
/// let reference = ManifestReference::new("https://cdn.example.com", hash).unwrap();
/// assert_eq!(
///     reference.url(),
///     format!("https://cdn.example.com/manifests/{}", hash)
/// );
///
/// let parsed = ManifestReference::parse(&reference.url()).unwrap();
/// assert_eq!(parsed, reference);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ManifestReference {
    base: String,
    hash: ContentHash,
}

impl ManifestReference {
    /// Build a reference from a base URL and a hash
    ///
    /// Trailing slashes on `base` are ignored.
    pub fn new(base: impl AsRef<str>, hash: ContentHash) -> Result<Self> {
        let base = normalize_base(base.as_ref())?;
        Ok(ManifestReference { base, hash })
    }

    /// Parse a bare canonical URL
    pub fn parse(url: &str) -> Result<Self> {
        let trimmed = url.trim();
        let caps = reference_pattern()
            .captures(trimmed)
            .filter(|c| c.get(0).map(|m| m.start() == 0 && m.end() == trimmed.len()) == Some(true))
            .ok_or_else(|| ProvenanceError::InvalidReference(url.to_string()))?;

        let base = normalize_base(&caps[1])?;
        let hash = ContentHash::from_hex(&caps[2])?;
        Ok(ManifestReference { base, hash })
    }

    /// Parse an HTTP `Link` header value, picking the `rel="c2pa-manifest"` entry
    pub fn parse_link_header(value: &str) -> Result<Self> {
        for caps in link_pattern().captures_iter(value) {
            let params = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            let is_manifest = params.split(';').any(|p| {
                let mut kv = p.splitn(2, '=');
                let key = kv.next().unwrap_or("").trim();
                let val = kv.next().unwrap_or("").trim().trim_matches('"');
                key.eq_ignore_ascii_case("rel")
                    && val.split_whitespace().any(|r| r.eq_ignore_ascii_case(LINK_REL))
            });
            if is_manifest {
                return ManifestReference::parse(&caps[1]);
            }
        }
        Err(ProvenanceError::InvalidReference(format!(
            "no rel=\"{}\" entry in Link header: {}",
            LINK_REL, value
        )))
    }

    /// Accept either a bare URL or a `Link` header value
    pub fn parse_any(value: &str) -> Result<Self> {
        if value.trim_start().starts_with('<') {
            ManifestReference::parse_link_header(value)
        } else {
            ManifestReference::parse(value)
        }
    }

    /// Find the first canonical URL embedded anywhere in free text
    ///
    /// Used for EXIF strings that may wrap the URL in other text.
    pub fn find_in(text: &str) -> Option<Self> {
        let caps = reference_pattern().captures(text)?;
        let base = normalize_base(&caps[1]).ok()?;
        let hash = ContentHash::from_hex(&caps[2]).ok()?;
        Some(ManifestReference { base, hash })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn hash(&self) -> ContentHash {
        self.hash
    }

    pub fn url(&self) -> String {
        format!("{}/{}/{}", self.base, MANIFEST_PATH, self.hash)
    }

    /// Render as a `Link` header value
    pub fn link_header(&self) -> String {
        format!("<{}>; rel=\"{}\"", self.url(), LINK_REL)
    }

    /// True when the reference lives under `base`
    pub fn is_under(&self, base: &str) -> bool {
        normalize_base(base).map(|b| b == self.base).unwrap_or(false)
    }
}

impl fmt::Display for ManifestReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

/// Validate and normalize a canonical base URL
///
/// # Rules
/// - `http://` or `https://` scheme
/// - host of letters, digits, dots and hyphens, optional port
/// - optional path prefix of unreserved characters
/// - no query or fragment
/// - scheme and host lowercased, trailing slashes removed
pub fn normalize_base(base: &str) -> Result<String> {
    let trimmed = base.trim().trim_end_matches('/');
    let (scheme, rest) = trimmed
        .split_once("://")
        .ok_or_else(|| ProvenanceError::InvalidReference(format!("missing scheme: {}", base)))?;

    let scheme = scheme.to_ascii_lowercase();
    if scheme != "http" && scheme != "https" {
        return Err(ProvenanceError::InvalidReference(format!(
            "unsupported scheme '{}'",
            scheme
        )));
    }

    if rest.is_empty() || rest.contains(['?', '#', '@', ' ']) {
        return Err(ProvenanceError::InvalidReference(format!(
            "base must be scheme://host[:port][/path]: {}",
            base
        )));
    }

    let (host, path) = match rest.find('/') {
        Some(idx) => rest.split_at(idx),
        None => (rest, ""),
    };

    if host.is_empty()
        || !host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == ':')
    {
        return Err(ProvenanceError::InvalidReference(format!("invalid host '{}'", host)));
    }

    Ok(format!("{}://{}{}", scheme, host.to_ascii_lowercase(), path))
}
