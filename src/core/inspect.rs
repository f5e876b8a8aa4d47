//! Read-only view of what an asset carries
//!
//! Inspection reports what extraction found without deciding authenticity.
//! An embedded manifest is parsed for its summary; a reference only names
//! where the manifest lives until a remote verification fills in the rest.

use crate::core::extract::{Confidence, ExtractionMethod, ExtractionResult, RecoveredPayload};
use crate::core::manifest::{ContentHash, Manifest};
use crate::core::resolver::VerificationReport;
use crate::core::validation::ManifestReference;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManifestSummary {
    pub issuer: String,
    pub created_at: DateTime<Utc>,
    /// Assertion kinds in manifest order
    pub assertions: Vec<String>,
    pub signed: bool,
}

impl ManifestSummary {
    pub fn of(manifest: &Manifest) -> Self {
        ManifestSummary {
            issuer: manifest.issuer.clone(),
            created_at: manifest.created_at,
            assertions: manifest.assertions.iter().map(|a| a.kind.clone()).collect(),
            signed: !manifest.signature.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Inspection {
    pub confidence: Confidence,
    pub method: Option<ExtractionMethod>,
    pub manifest_hash: Option<ContentHash>,
    /// Canonical URL of the manifest
    pub reference: Option<String>,
    pub summary: Option<ManifestSummary>,
    #[serde(skip)]
    pub manifest: Option<Manifest>,
    pub diagnostics: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<VerificationReport>,
}

impl Inspection {
    pub fn from_extraction(result: &ExtractionResult, canonical_base: &str) -> Self {
        let mut inspection = Inspection {
            confidence: result.confidence(),
            method: result.method(),
            manifest_hash: None,
            reference: None,
            summary: None,
            manifest: None,
            diagnostics: result.diagnostics(),
            remote: None,
        };

        match result.payload() {
            Some(RecoveredPayload::Manifest { hash, bytes }) => {
                inspection.manifest_hash = Some(*hash);
                inspection.reference = ManifestReference::new(canonical_base, *hash)
                    .ok()
                    .map(|r| r.url());
                match Manifest::from_bytes(bytes) {
                    Ok(manifest) => {
                        inspection.summary = Some(ManifestSummary::of(&manifest));
                        inspection.manifest = Some(manifest);
                    }
                    Err(e) => inspection.diagnostics.push(e.to_string()),
                }
            }
            Some(RecoveredPayload::Reference(reference)) => {
                inspection.manifest_hash = Some(reference.hash());
                inspection.reference = Some(reference.url());
            }
            Some(RecoveredPayload::Fragment {
                claimed_hash,
                complete,
                ..
            }) => {
                inspection.diagnostics.push(format!(
                    "fragment claims {} (complete: {}); not trusted",
                    claimed_hash, complete
                ));
            }
            None => {}
        }
        inspection
    }

    /// Attach a remote verification, filling the summary when nothing was embedded
    pub fn with_remote(mut self, report: VerificationReport) -> Self {
        if self.summary.is_none() {
            if let Some(manifest) = &report.manifest {
                self.summary = Some(ManifestSummary::of(manifest));
                self.manifest = Some(manifest.clone());
            }
        }
        if self.reference.is_none() {
            self.reference = report.reference.clone();
        }
        self.remote = Some(report);
        self
    }
}
