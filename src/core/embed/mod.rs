//! Format embedders
//!
//! Each carrier format is a pure function `(carrier, manifest) -> bytes` that
//! only adds container-native metadata and never touches pixel data.
//! Embedding is fail-closed: whenever a format cannot complete without
//! risking corruption, the original carrier is returned unmodified with
//! `fallback_used = true`. The remote manifest stays authoritative, so a
//! degraded embed never fails the sign operation.

pub(crate) mod jpeg;
pub(crate) mod png;
pub(crate) mod webp;

pub use png::PNG_CHUNK_TYPE;
pub use webp::XMP_NAMESPACE;

use crate::config::EmbedConfig;
use crate::core::validation::ManifestReference;
use crate::error::ProvenanceError;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

/// Supported carrier containers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CarrierFormat {
    Jpeg,
    Png,
    WebP,
}

impl CarrierFormat {
    /// Sniff the container from its leading magic bytes
    pub fn detect(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(CarrierFormat::Jpeg)
        } else if bytes.starts_with(png::PNG_SIGNATURE) {
            Some(CarrierFormat::Png)
        } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
            Some(CarrierFormat::WebP)
        } else {
            None
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(CarrierFormat::Jpeg),
            "png" => Some(CarrierFormat::Png),
            "webp" => Some(CarrierFormat::WebP),
            _ => None,
        }
    }

    pub fn media_type(&self) -> &'static str {
        match self {
            CarrierFormat::Jpeg => "image/jpeg",
            CarrierFormat::Png => "image/png",
            CarrierFormat::WebP => "image/webp",
        }
    }
}

impl fmt::Display for CarrierFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CarrierFormat::Jpeg => "jpeg",
            CarrierFormat::Png => "png",
            CarrierFormat::WebP => "webp",
        })
    }
}

/// Outcome of one embed call; returned to the caller, never persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingResult {
    pub carrier_format: CarrierFormat,
    /// Bytes of metadata inserted into the carrier
    pub bytes_written: usize,
    /// True when the carrier was returned unmodified
    pub fallback_used: bool,
    pub warnings: Vec<String>,
}

/// Carrier bytes plus the result describing them
#[derive(Debug, Clone)]
pub struct Embedded {
    pub bytes: Vec<u8>,
    pub result: EmbeddingResult,
}

/// What a format embedder produced on success
#[derive(Debug)]
pub(crate) struct FormatOutput {
    pub bytes: Vec<u8>,
    pub bytes_written: usize,
    pub warnings: Vec<String>,
}

/// Why a format embedder declined to modify the carrier
#[derive(Debug)]
pub(crate) struct Degrade(pub String);

impl Degrade {
    pub fn new(reason: impl Into<String>) -> Self {
        Degrade(reason.into())
    }
}

/// Embeds manifests according to configured size budgets
#[derive(Debug, Clone, Default)]
pub struct Embedder {
    config: EmbedConfig,
}

impl Embedder {
    pub fn new(config: EmbedConfig) -> Self {
        Embedder { config }
    }

    pub fn config(&self) -> &EmbedConfig {
        &self.config
    }

    /// Embed `manifest` into `carrier`
    pub fn embed(&self, carrier: &[u8], manifest: &[u8], format: CarrierFormat) -> Embedded {
        self.embed_with_reference(carrier, manifest, format, None)
    }

    /// Embed `manifest`, also writing `reference` into EXIF when the carrier has none
    ///
    /// # Examples
    ///
    /// ```
    /// use manifest_survival::{CarrierFormat, Embedder};
    ///
    /// // Not a JPEG: the carrier comes back untouched
    /// let out = Embedder::default().embed(b"not an image", b"{}", CarrierFormat::Jpeg);
    /// assert!(out.result.fallback_used);
    /// assert_eq!(out.bytes, b"not an image");
    /// ```
    pub fn embed_with_reference(
        &self,
        carrier: &[u8],
        manifest: &[u8],
        format: CarrierFormat,
        reference: Option<&ManifestReference>,
    ) -> Embedded {
        let reference_url = reference
            .filter(|_| self.config.write_exif_reference)
            .map(|r| r.url());

        let outcome = match CarrierFormat::detect(carrier) {
            _ if manifest.is_empty() => Err(Degrade::new("manifest is empty; nothing to embed")),
            Some(detected) if detected != format => Err(Degrade::new(format!(
                "carrier looks like {} but {} was requested",
                detected, format
            ))),
            _ => match format {
                CarrierFormat::Jpeg => {
                    jpeg::embed(carrier, manifest, &self.config, reference_url.as_deref())
                }
                CarrierFormat::Png => {
                    png::embed(carrier, manifest, &self.config, reference_url.as_deref())
                }
                CarrierFormat::WebP => {
                    webp::embed(carrier, manifest, &self.config, reference_url.as_deref())
                }
            },
        };

        match outcome {
            Ok(output) => {
                debug!(
                    "Embedded {} manifest bytes into {} carrier ({} bytes written)",
                    manifest.len(),
                    format,
                    output.bytes_written
                );
                Embedded {
                    bytes: output.bytes,
                    result: EmbeddingResult {
                        carrier_format: format,
                        bytes_written: output.bytes_written,
                        fallback_used: false,
                        warnings: output.warnings,
                    },
                }
            }
            Err(Degrade(reason)) => {
                warn!("Embedding into {} degraded to remote-only: {}", format, reason);
                Embedded {
                    bytes: carrier.to_vec(),
                    result: EmbeddingResult {
                        carrier_format: format,
                        bytes_written: 0,
                        fallback_used: true,
                        warnings: vec![ProvenanceError::EmbeddingDegraded(reason).to_string()],
                    },
                }
            }
        }
    }
}

/// Embed with default budgets
pub fn embed(carrier: &[u8], manifest: &[u8], format: CarrierFormat) -> Embedded {
    Embedder::default().embed(carrier, manifest, format)
}
