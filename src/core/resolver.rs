//! Verification resolver
//!
//! Composes location, cache-aware fetch, hash alignment and the external
//! signature check into one verdict. The resolver never writes and never
//! returns a raw error: every failure becomes a status plus diagnostics.
//! Dropping the `verify` future at any await point abandons the work.

use crate::core::cache::CachingFetcher;
use crate::core::extract::{ExtractionMethod, Extractor, RecoveredPayload};
use crate::core::manifest::{ContentHash, Manifest};
use crate::core::validation::{normalize_base, ManifestReference};
use crate::error::{ProvenanceError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Fetches manifest bytes for a reference
#[async_trait]
pub trait ManifestFetcher: Send + Sync {
    /// `Ok(None)` means the manifest authoritatively does not exist
    async fn fetch_manifest(&self, reference: &ManifestReference) -> Result<Option<Arc<[u8]>>>;

    /// Forget any local copy of `reference`; called after its bytes failed the hash check
    fn discard(&self, _reference: &ManifestReference) {}
}

#[async_trait]
impl ManifestFetcher for CachingFetcher {
    async fn fetch_manifest(&self, reference: &ManifestReference) -> Result<Option<Arc<[u8]>>> {
        self.fetch(&reference.url()).await
    }

    fn discard(&self, reference: &ManifestReference) {
        self.invalidate(&reference.url());
    }
}

/// The opaque signing collaborator
#[async_trait]
pub trait SignatureVerifier: Send + Sync {
    /// `Ok(false)` for a bad signature; `Err` when verification could not run
    async fn verify_signature(&self, manifest: &Manifest) -> Result<bool>;
}

/// What to verify: asset bytes, an out-of-band reference, or both
#[derive(Debug, Clone, Default)]
pub struct AssetRef {
    pub bytes: Option<Vec<u8>>,
    /// Canonical URL or `Link` header value
    pub link: Option<String>,
}

impl AssetRef {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        AssetRef {
            bytes: Some(bytes.into()),
            link: None,
        }
    }

    pub fn from_link(link: impl Into<String>) -> Self {
        AssetRef {
            bytes: None,
            link: Some(link.into()),
        }
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    /// Stable key for caching verification responses of this asset
    pub fn cache_key(&self) -> String {
        let mut material = Vec::new();
        if let Some(link) = &self.link {
            material.extend_from_slice(link.trim().as_bytes());
        }
        material.push(0);
        if let Some(bytes) = &self.bytes {
            material.extend_from_slice(ContentHash::of(bytes).as_bytes());
        }
        ContentHash::of(&material).to_hex()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Verified,
    HashMismatch,
    NotFound,
    Unavailable,
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VerificationStatus::Verified => "verified",
            VerificationStatus::HashMismatch => "hash_mismatch",
            VerificationStatus::NotFound => "not_found",
            VerificationStatus::Unavailable => "unavailable",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", content = "detail", rename_all = "snake_case")]
pub enum SignatureCheck {
    Valid,
    Invalid(String),
    /// No verifier configured, or no manifest to check
    Skipped,
    /// The verifier itself failed
    Error(String),
}

/// How the manifest was located
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocatedBy {
    Explicit,
    Embedded(ExtractionMethod),
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub status: VerificationStatus,
    pub reference: Option<String>,
    pub located_by: Option<LocatedBy>,
    #[serde(skip)]
    pub manifest: Option<Manifest>,
    pub manifest_hash: Option<ContentHash>,
    pub signature: SignatureCheck,
    pub diagnostics: Vec<String>,
}

impl VerificationReport {
    fn new(status: VerificationStatus) -> Self {
        VerificationReport {
            status,
            reference: None,
            located_by: None,
            manifest: None,
            manifest_hash: None,
            signature: SignatureCheck::Skipped,
            diagnostics: Vec::new(),
        }
    }

    /// Located, hash-aligned, and carrying a valid signature
    pub fn is_authentic(&self) -> bool {
        self.status == VerificationStatus::Verified && self.signature == SignatureCheck::Valid
    }
}

pub struct Resolver {
    fetcher: Arc<dyn ManifestFetcher>,
    verifier: Option<Arc<dyn SignatureVerifier>>,
    extractor: Extractor,
    canonical_base: String,
    fetch_timeout: Duration,
}

impl Resolver {
    pub fn new(
        fetcher: Arc<dyn ManifestFetcher>,
        canonical_base: &str,
        fetch_timeout: Duration,
    ) -> Result<Self> {
        Ok(Resolver {
            fetcher,
            verifier: None,
            extractor: Extractor::default(),
            canonical_base: normalize_base(canonical_base)?,
            fetch_timeout,
        })
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_extractor(mut self, extractor: Extractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn canonical_base(&self) -> &str {
        &self.canonical_base
    }

    fn locate(&self, asset: &AssetRef, diagnostics: &mut Vec<String>) -> Option<(ManifestReference, LocatedBy)> {
        if let Some(link) = &asset.link {
            match ManifestReference::parse_any(link) {
                Ok(reference) if reference.is_under(&self.canonical_base) => {
                    return Some((reference, LocatedBy::Explicit));
                }
                Ok(reference) => diagnostics.push(format!(
                    "explicit reference {} is outside {}",
                    reference, self.canonical_base
                )),
                Err(e) => diagnostics.push(format!("explicit reference rejected: {}", e)),
            }
        }

        let bytes = asset.bytes.as_ref()?;
        let extraction = self.extractor.extract(bytes);
        diagnostics.extend(extraction.diagnostics());

        let method = extraction.method()?;
        match extraction.payload()? {
            RecoveredPayload::Manifest { hash, .. } => {
                let reference = ManifestReference::new(&self.canonical_base, *hash).ok()?;
                Some((reference, LocatedBy::Embedded(method)))
            }
            RecoveredPayload::Reference(reference) if reference.is_under(&self.canonical_base) => {
                Some((reference.clone(), LocatedBy::Embedded(method)))
            }
            RecoveredPayload::Reference(reference) => {
                diagnostics.push(format!(
                    "embedded reference {} is outside {}",
                    reference, self.canonical_base
                ));
                None
            }
            RecoveredPayload::Fragment { claimed_hash, .. } => {
                diagnostics.push(format!(
                    "only a low-confidence fragment claiming {} was found; not used to locate",
                    claimed_hash
                ));
                None
            }
        }
    }

    /// Produce a verdict for `asset`
    pub async fn verify(&self, asset: &AssetRef) -> VerificationReport {
        let mut diagnostics = Vec::new();
        let Some((reference, located_by)) = self.locate(asset, &mut diagnostics) else {
            let mut report = VerificationReport::new(VerificationStatus::NotFound);
            report.diagnostics = diagnostics;
            return report;
        };

        let mut report = VerificationReport::new(VerificationStatus::Unavailable);
        report.reference = Some(reference.url());
        report.located_by = Some(located_by);

        let fetched = tokio::time::timeout(self.fetch_timeout, self.fetcher.fetch_manifest(&reference)).await;
        let bytes = match fetched {
            Err(_) => {
                diagnostics.push(ProvenanceError::FetchTimeout(self.fetch_timeout).to_string());
                report.diagnostics = diagnostics;
                return report;
            }
            Ok(Err(e)) => {
                diagnostics.push(format!("fetch failed: {}", e));
                report.diagnostics = diagnostics;
                return report;
            }
            Ok(Ok(None)) => {
                diagnostics.push(format!("no manifest at {}", reference));
                report.status = VerificationStatus::NotFound;
                report.diagnostics = diagnostics;
                return report;
            }
            Ok(Ok(Some(bytes))) => bytes,
        };

        let actual = ContentHash::of(&bytes);
        if actual != reference.hash() {
            let mismatch = ProvenanceError::HashMismatch {
                expected: reference.hash().to_hex(),
                actual: actual.to_hex(),
            };
            info!("Rejecting manifest from {}: {}", reference, mismatch);
            self.fetcher.discard(&reference);
            diagnostics.push(mismatch.to_string());
            report.status = VerificationStatus::HashMismatch;
            report.diagnostics = diagnostics;
            return report;
        }

        report.status = VerificationStatus::Verified;
        report.manifest_hash = Some(actual);

        match Manifest::from_bytes(&bytes) {
            Ok(manifest) => {
                report.signature = match &self.verifier {
                    None => SignatureCheck::Skipped,
                    Some(verifier) => match verifier.verify_signature(&manifest).await {
                        Ok(true) => SignatureCheck::Valid,
                        Ok(false) => SignatureCheck::Invalid("signature does not verify".to_string()),
                        Err(e) => {
                            diagnostics.push(format!("signature verifier failed: {}", e));
                            report.status = VerificationStatus::Unavailable;
                            SignatureCheck::Error(e.to_string())
                        }
                    },
                };
                report.manifest = Some(manifest);
            }
            Err(e) => {
                diagnostics.push(e.to_string());
                report.signature = SignatureCheck::Invalid(e.to_string());
            }
        }

        debug!(
            "Verified {} via {:?}: {} / {:?}",
            reference, located_by, report.status, report.signature
        );
        report.diagnostics = diagnostics;
        report
    }

    /// Verify several assets with at most `concurrency` in flight
    ///
    /// Reports come back in input order. Each asset gets its own fetch
    /// timeout; one slow asset never fails the batch.
    pub async fn verify_many(
        self: &Arc<Self>,
        assets: Vec<AssetRef>,
        concurrency: usize,
    ) -> Vec<VerificationReport> {
        let permits = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let total = assets.len();
        for (index, asset) in assets.into_iter().enumerate() {
            let resolver = Arc::clone(self);
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                (index, resolver.verify(&asset).await)
            });
        }

        let mut reports: Vec<Option<VerificationReport>> = vec![None; total];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, report)) => reports[index] = Some(report),
                Err(e) => warn!("Verification task failed: {}", e),
            }
        }
        reports
            .into_iter()
            .map(|report| {
                report.unwrap_or_else(|| {
                    let mut report = VerificationReport::new(VerificationStatus::Unavailable);
                    report.diagnostics.push("verification task failed".to_string());
                    report
                })
            })
            .collect()
    }
}
