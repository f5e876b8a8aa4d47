//! # manifest-survival - Keeping provenance manifests attached to images
//!
//! Images lose their metadata on the way through CDNs, optimizers and
//! re-encoders. This crate keeps a signed provenance manifest discoverable
//! anyway:
//!
//! - **Embedding** into JPEG (APP11), PNG (`pvNc` chunks) and WebP (XMP), fail-closed
//! - **Extraction** by native parse, EXIF reference or heuristic scan, with
//!   explicit confidence
//! - **Content-addressed storage** (SHA-256 keys) across memory, filesystem and
//!   a durable backend
//! - **Cache consistency**: strong ETags, bounded stale serving and purge on write
//! - **Verification** that never trusts a manifest whose hash disagrees with
//!   its reference
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use manifest_survival::{AssetRef, CarrierFormat, Manifest, Provenance, Result};
//!
//! # async fn run(jpeg: Vec<u8>) -> Result<()> {
//! let provenance = Provenance::builder().build()?;
//!
//! // Store the manifest, purge stale CDN copies, embed into the image
//! let manifest = Manifest::new("did:web:newsroom.example");
//! let signed = provenance.sign(&jpeg, &manifest, CarrierFormat::Jpeg).await?;
//! println!("Link: {}", signed.link_header());
//!
//! // Later, possibly after the image was stripped by a CDN
//! let report = provenance.verify(&AssetRef::from_bytes(signed.embedded.bytes)).await;
//! println!("{}", report.status);
//! # Ok(())
//! # }
//! ```
//!
//! ## Custom wiring
//!
//! ```rust,no_run
//! use manifest_survival::{Config, ProvenanceBuilder, Result};
//!
//! # fn main() -> Result<()> {
//! let provenance = ProvenanceBuilder::new()
//!     .config(Config::load("provenance.toml")?)
//!     .build()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;

pub use crate::config::Config;
pub use crate::core::{
    cache::{
        CachePolicy, CacheRole, CacheStats, CachingFetcher, CdnPurger, CircuitState, EntityTag, EntryProbe,
        Freshness, ManifestOrigin, PurgeEvent, PurgeFanout, PurgeScheduler, Response,
        RetryingUpstream, Upstream, VerificationProbe, VerificationResponder,
    },
    embed::{embed, CarrierFormat, Embedded, Embedder, EmbeddingResult},
    extract::{
        extract, Confidence, ExtractionAttempt, ExtractionMethod, ExtractionResult, Extractor,
        RecoveredPayload,
    },
    inspect::{Inspection, ManifestSummary},
    manifest::{Assertion, ContentHash, Manifest},
    pipeline::{SignOutcome, SignPipeline},
    resolver::{
        AssetRef, LocatedBy, ManifestFetcher, Resolver, SignatureCheck, SignatureVerifier,
        VerificationReport, VerificationStatus,
    },
    store::{FsTier, ManifestBackend, ManifestStore, MemoryBackend, PutOutcome, PutReceipt},
    telemetry::{AtomicMetrics, CacheEvent, Clock, ManualClock, MetricsSink, MetricsSnapshot},
    validation::ManifestReference,
};
pub use crate::error::{ProvenanceError, Result};

use crate::core::telemetry::SystemClock;
use std::sync::Arc;
use tracing::{debug, info};

/// All components wired together
///
/// Manifests written through [`Provenance::sign`] land in the store first;
/// the built-in [`ManifestOrigin`] serves them and the resolver's caching
/// client reads them back, unless an external upstream (a real CDN edge) is
/// supplied.
pub struct Provenance {
    config: Config,
    embedder: Embedder,
    extractor: Extractor,
    store: Arc<ManifestStore>,
    origin: Arc<ManifestOrigin>,
    upstream: Arc<RetryingUpstream>,
    client: CachingFetcher,
    resolver: Arc<Resolver>,
    verification: Arc<VerificationResponder>,
    pipeline: SignPipeline,
    metrics: Arc<AtomicMetrics>,
}

impl Provenance {
    pub fn builder() -> ProvenanceBuilder {
        ProvenanceBuilder::new()
    }

    /// Defaults with an in-memory backend
    pub fn in_memory() -> Result<Self> {
        ProvenanceBuilder::new().build()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn embed(&self, carrier: &[u8], manifest: &[u8], format: CarrierFormat) -> Embedded {
        self.embedder.embed(carrier, manifest, format)
    }

    pub fn extract(&self, asset: &[u8]) -> ExtractionResult {
        self.extractor.extract(asset)
    }

    /// Store, purge and embed
    pub async fn sign(
        &self,
        carrier: &[u8],
        manifest: &Manifest,
        format: CarrierFormat,
    ) -> Result<SignOutcome> {
        self.pipeline.sign(carrier, manifest, format, None).await
    }

    /// Like [`Provenance::sign`] for manifest bytes produced elsewhere
    pub async fn sign_bytes(
        &self,
        carrier: &[u8],
        manifest: &[u8],
        format: CarrierFormat,
    ) -> Result<SignOutcome> {
        self.pipeline.sign_bytes(carrier, manifest, format, None).await
    }

    /// Sign an asset that previously carried `previous`
    ///
    /// Old embedded frames are replaced and cached verdicts for `previous`
    /// are purged.
    pub async fn resign(
        &self,
        carrier: &[u8],
        manifest: &Manifest,
        format: CarrierFormat,
        previous: &ContentHash,
    ) -> Result<SignOutcome> {
        self.pipeline
            .sign(carrier, manifest, format, Some(previous))
            .await
    }

    /// Store raw manifest bytes and schedule the purge
    pub async fn put_manifest(&self, bytes: &[u8]) -> Result<PutReceipt> {
        let (receipt, reference, _purge) = self.pipeline.publish(bytes, None).await?;
        debug!("Published {}", reference);
        Ok(receipt)
    }

    pub async fn get_manifest(&self, hash: &ContentHash) -> Result<Option<Arc<[u8]>>> {
        self.store.get(hash).await
    }

    /// Origin response for one manifest
    pub async fn serve_manifest(&self, hash: &ContentHash, if_none_match: Option<&str>) -> Response {
        self.origin.serve(hash, if_none_match).await
    }

    pub async fn verify(&self, asset: &AssetRef) -> VerificationReport {
        self.resolver.verify(asset).await
    }

    /// Verify a batch, reports in input order
    pub async fn verify_many(&self, assets: Vec<AssetRef>, concurrency: usize) -> Vec<VerificationReport> {
        self.resolver.verify_many(assets, concurrency).await
    }

    /// What an asset carries; with `remote`, also resolves and verifies it
    pub async fn inspect(&self, asset: &[u8], remote: bool) -> Inspection {
        let result = self.extractor.extract(asset);
        let inspection = Inspection::from_extraction(&result, &self.config.resolver.canonical_base);
        if !remote {
            return inspection;
        }
        let report = self.verify(&AssetRef::from_bytes(asset)).await;
        inspection.with_remote(report)
    }

    /// Verification response with caching headers and stale-if-error
    pub async fn respond_verification(
        &self,
        asset: &AssetRef,
        if_none_match: Option<&str>,
    ) -> Response {
        self.verification.respond(asset, if_none_match).await
    }

    pub fn reference_for(&self, hash: &ContentHash) -> Result<ManifestReference> {
        ManifestReference::new(&self.config.resolver.canonical_base, *hash)
    }

    /// Caching-client state for a manifest
    pub fn probe_manifest(&self, hash: &ContentHash) -> Option<EntryProbe> {
        let reference = self.reference_for(hash).ok()?;
        self.client.probe(&reference.url())
    }

    /// Remembered verification response for a key from [`AssetRef::cache_key`]
    pub fn probe_verification(&self, key: &str) -> Option<VerificationProbe> {
        self.verification.probe(key)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn cache_stats(&self) -> Result<CacheStats> {
        let metrics = self.metrics.snapshot();
        Ok(CacheStats {
            store_hit_rate: metrics.store_hit_rate(),
            metrics,
            stored_manifests: self.store.list("").await?.len(),
            memory_tier_entries: self.store.memory_tier().len(),
            client_entries: self.client.len(),
            verification_entries: self.verification.len(),
            circuit: self.upstream.state(),
        })
    }

    pub fn store(&self) -> &Arc<ManifestStore> {
        &self.store
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }
}

/// Builder for [`Provenance`]
pub struct ProvenanceBuilder {
    config: Config,
    store: Option<Arc<ManifestStore>>,
    backend: Option<Arc<dyn ManifestBackend>>,
    upstream: Option<Arc<dyn Upstream>>,
    purgers: Vec<Arc<dyn CdnPurger>>,
    verifier: Option<Arc<dyn SignatureVerifier>>,
    clock: Option<Arc<dyn Clock>>,
}

impl ProvenanceBuilder {
    pub fn new() -> Self {
        ProvenanceBuilder {
            config: Config::default(),
            store: None,
            backend: None,
            upstream: None,
            purgers: Vec::new(),
            verifier: None,
            clock: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Durable backend; defaults to [`MemoryBackend`]
    pub fn backend(mut self, backend: Arc<dyn ManifestBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Share an existing store, e.g. with an origin behind an external edge
    ///
    /// Takes precedence over [`ProvenanceBuilder::backend`].
    pub fn store(mut self, store: Arc<ManifestStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Where the resolver fetches manifests; defaults to the built-in origin
    pub fn upstream(mut self, upstream: Arc<dyn Upstream>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    /// Add a CDN to purge on every write
    pub fn purger(mut self, purger: Arc<dyn CdnPurger>) -> Self {
        self.purgers.push(purger);
        self
    }

    pub fn signature_verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<Provenance> {
        let config = self.config;
        config.validate()?;

        let metrics = Arc::new(AtomicMetrics::new());
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = match self.store {
            Some(store) => store,
            None => {
                let backend = self
                    .backend
                    .unwrap_or_else(|| Arc::new(MemoryBackend::new()));
                Arc::new(ManifestStore::new(&config.store, backend).with_metrics(metrics.clone()))
            }
        };
        let origin = Arc::new(
            ManifestOrigin::new(store.clone(), &config.cache.manifest).with_metrics(metrics.clone()),
        );
        let upstream: Arc<dyn Upstream> = match self.upstream {
            Some(upstream) => upstream,
            None => origin.clone(),
        };
        let upstream = Arc::new(
            RetryingUpstream::new(upstream, &config.resolver)
                .with_clock(clock.clone())
                .with_metrics(metrics.clone()),
        );
        let client = CachingFetcher::new(upstream.clone(), config.cache.client_capacity)
            .with_clock(clock.clone())
            .with_metrics(metrics.clone());

        let embedder = Embedder::new(config.embed.clone());
        let extractor = Extractor::new(config.extract.clone());

        let mut resolver = Resolver::new(
            Arc::new(client.clone()),
            &config.resolver.canonical_base,
            config.resolver.fetch_timeout(),
        )?
        .with_extractor(extractor.clone());
        if let Some(verifier) = self.verifier {
            resolver = resolver.with_verifier(verifier);
        }
        let resolver = Arc::new(resolver);

        let verification = Arc::new(
            VerificationResponder::new(
                resolver.clone(),
                &config.cache.verification,
                config.cache.client_capacity,
            )
            .with_clock(clock)
            .with_metrics(metrics.clone()),
        );

        let mut fanout = PurgeFanout::new()
            .with(Arc::new(client.clone()))
            .with(verification.clone());
        for purger in self.purgers {
            fanout = fanout.with(purger);
        }
        let purges =
            PurgeScheduler::new(Arc::new(fanout), config.purge.clone()).with_metrics(metrics.clone());
        let pipeline = SignPipeline::new(
            store.clone(),
            purges,
            embedder.clone(),
            &config.resolver.canonical_base,
        )?;

        info!(
            "Provenance ready (base: {}, fs tier: {})",
            config.resolver.canonical_base,
            config.store.fs_root.is_some()
        );

        Ok(Provenance {
            config,
            embedder,
            extractor,
            store,
            origin,
            upstream,
            client,
            resolver,
            verification,
            pipeline,
            metrics,
        })
    }
}

impl Default for ProvenanceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_rejects_invalid_config() {
        let mut config = Config::default();
        config.purge.max_attempts = 0;
        assert!(ProvenanceBuilder::new().config(config).build().is_err());
    }

    #[tokio::test]
    async fn test_put_then_verify_by_link() {
        let provenance = Provenance::in_memory().unwrap();
        let bytes = Manifest::new("issuer").to_canonical_bytes().unwrap();
        let receipt = provenance.put_manifest(&bytes).await.unwrap();
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }

        let link = provenance.reference_for(&receipt.hash).unwrap().link_header();
        let report = provenance.verify(&AssetRef::from_link(link)).await;
        assert_eq!(report.status, VerificationStatus::Verified);
        assert_eq!(report.signature, SignatureCheck::Skipped);
        assert!(provenance.probe_manifest(&receipt.hash).is_some());
    }
}
