//! Sign path: store, purge, embed
//!
//! The manifest is written to the store before anything is embedded, so an
//! asset leaving this pipeline always has a resolvable remote manifest even
//! when embedding degrades.

use crate::core::cache::{purge_tags_for, PurgeEvent, PurgeScheduler};
use crate::core::embed::{CarrierFormat, Embedded, Embedder};
use crate::core::manifest::{ContentHash, Manifest};
use crate::core::store::{ManifestStore, PutReceipt};
use crate::core::validation::{normalize_base, ManifestReference};
use crate::error::Result;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Everything a caller needs after signing one asset
#[derive(Debug)]
pub struct SignOutcome {
    pub receipt: PutReceipt,
    pub reference: ManifestReference,
    pub embedded: Embedded,
    /// Background purge; await it only in tests or tools
    pub purge: Option<JoinHandle<PurgeEvent>>,
}

impl SignOutcome {
    pub fn hash(&self) -> ContentHash {
        self.receipt.hash
    }

    /// `Link` header to send alongside the asset
    pub fn link_header(&self) -> String {
        self.reference.link_header()
    }
}

pub struct SignPipeline {
    store: Arc<ManifestStore>,
    purges: PurgeScheduler,
    embedder: Embedder,
    canonical_base: String,
}

impl SignPipeline {
    pub fn new(
        store: Arc<ManifestStore>,
        purges: PurgeScheduler,
        embedder: Embedder,
        canonical_base: &str,
    ) -> Result<Self> {
        Ok(SignPipeline {
            store,
            purges,
            embedder,
            canonical_base: normalize_base(canonical_base)?,
        })
    }

    /// Store `manifest_bytes` and schedule the purge; no embedding
    pub async fn publish(
        &self,
        manifest_bytes: &[u8],
        supersedes: Option<&ContentHash>,
    ) -> Result<(PutReceipt, ManifestReference, Option<JoinHandle<PurgeEvent>>)> {
        let receipt = self.store.put(manifest_bytes).await?;
        let reference = ManifestReference::new(&self.canonical_base, receipt.hash)?;
        let event = PurgeEvent::new(
            reference.url(),
            purge_tags_for(&receipt.hash, supersedes),
            receipt.hash,
        );
        let purge = self.purges.schedule(event);
        Ok((receipt, reference, purge))
    }

    /// Publish the manifest, then embed it into `carrier`
    ///
    /// Only a store failure is an error. A degraded embed is reported through
    /// `embedded.result.fallback_used`.
    pub async fn sign_bytes(
        &self,
        carrier: &[u8],
        manifest_bytes: &[u8],
        format: CarrierFormat,
        supersedes: Option<&ContentHash>,
    ) -> Result<SignOutcome> {
        let (receipt, reference, purge) = self.publish(manifest_bytes, supersedes).await?;
        let embedded =
            self.embedder
                .embed_with_reference(carrier, manifest_bytes, format, Some(&reference));

        info!(
            "Signed {} asset with manifest {} (embedded: {}, {} warning(s))",
            format,
            receipt.hash,
            !embedded.result.fallback_used,
            embedded.result.warnings.len()
        );
        Ok(SignOutcome {
            receipt,
            reference,
            embedded,
            purge,
        })
    }

    pub async fn sign(
        &self,
        carrier: &[u8],
        manifest: &Manifest,
        format: CarrierFormat,
        supersedes: Option<&ContentHash>,
    ) -> Result<SignOutcome> {
        let bytes = manifest.to_canonical_bytes()?;
        self.sign_bytes(carrier, &bytes, format, supersedes).await
    }
}
