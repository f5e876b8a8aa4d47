//! Verification responses
//!
//! Verdicts are cacheable for longer than manifests and carry
//! `stale-if-error`. The responder remembers the last good response per
//! asset so that, when the resolver reports the backend unavailable, it can
//! keep answering for a bounded time instead of failing outright.

use super::etag::EntityTag;
use super::policy::CachePolicy;
use super::purge::{verify_tag, CdnPurger};
use super::{
    Response, HEADER_AGE, HEADER_CACHE_CONTROL, HEADER_CACHE_TAG, HEADER_CONTENT_TYPE, HEADER_ETAG,
};
use crate::config::VerificationCacheConfig;
use crate::core::resolver::{AssetRef, Resolver, VerificationReport, VerificationStatus};
use crate::core::telemetry::{CacheEvent, Clock, MetricsSink, NoopMetrics, SystemClock};
use crate::core::validation::ManifestReference;
use crate::error::Result;
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

struct LastGood {
    response: Response,
    stored_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationProbe {
    pub key: String,
    pub validator: Option<EntityTag>,
    pub age: Duration,
    pub fresh_for: Duration,
    /// Still usable as a fallback when the backend fails
    pub within_stale_if_error: bool,
    pub tags: Vec<String>,
}

pub struct VerificationResponder {
    resolver: Arc<Resolver>,
    policy: CachePolicy,
    last_good: Mutex<LruCache<String, LastGood>>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
}

impl VerificationResponder {
    pub fn new(resolver: Arc<Resolver>, config: &VerificationCacheConfig, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        VerificationResponder {
            resolver,
            policy: CachePolicy::verification(config),
            last_good: Mutex::new(LruCache::new(capacity)),
            clock: Arc::new(SystemClock),
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    fn stale_if_error(&self) -> Duration {
        self.policy.stale_if_error.unwrap_or(Duration::ZERO)
    }

    /// Verify `asset` and render the response
    pub async fn respond(&self, asset: &AssetRef, if_none_match: Option<&str>) -> Response {
        let key = asset.cache_key();
        let report = self.resolver.verify(asset).await;

        let response = match report.status {
            VerificationStatus::Unavailable => match self.fallback(&key) {
                Some(stale) => {
                    warn!("Serving stale verification for {}: backend unavailable", key);
                    self.metrics.record(CacheEvent::StaleServed);
                    stale
                }
                None => self.negative(503, &report),
            },
            VerificationStatus::NotFound => self.negative(404, &report),
            VerificationStatus::HashMismatch => {
                self.last_good.lock().pop(&key);
                self.negative(409, &report)
            }
            VerificationStatus::Verified => {
                match self.render(&report) {
                    Ok(response) => {
                        self.last_good.lock().put(
                            key,
                            LastGood {
                                response: response.clone(),
                                stored_at: self.clock.now(),
                            },
                        );
                        response
                    }
                    Err(e) => {
                        warn!("Failed to render verification report: {}", e);
                        self.negative(500, &report)
                    }
                }
            }
        };

        if response.status == 200 {
            if let (Some(etag), Some(inm)) = (response.etag(), if_none_match) {
                if etag.matches_if_none_match(inm) {
                    self.metrics.record(CacheEvent::NotModified);
                    return response.not_modified();
                }
            }
        }
        response
    }

    fn render(&self, report: &VerificationReport) -> Result<Response> {
        let body = serde_json::to_vec(report)?;
        let etag = EntityTag::for_body(&body);
        let tag = report
            .manifest_hash
            .or_else(|| {
                report
                    .reference
                    .as_deref()
                    .and_then(|r| ManifestReference::parse(r).ok())
                    .map(|r| r.hash())
            })
            .map(|h| verify_tag(&h));

        let mut response = Response::new(200)
            .with_header(HEADER_ETAG, etag.header_value())
            .with_header(HEADER_CACHE_CONTROL, self.policy.header_value())
            .with_header(HEADER_CONTENT_TYPE, "application/json");
        if let Some(tag) = tag {
            response = response.with_header(HEADER_CACHE_TAG, tag);
        }
        Ok(response.with_body(body))
    }

    fn negative(&self, status: u16, report: &VerificationReport) -> Response {
        self.metrics.record(CacheEvent::NegativeServed);
        let body = serde_json::to_vec(report).unwrap_or_default();
        Response::new(status)
            .with_header(HEADER_CACHE_CONTROL, CachePolicy::negative().header_value())
            .with_header(HEADER_CONTENT_TYPE, "application/json")
            .with_body(body)
    }

    fn fallback(&self, key: &str) -> Option<Response> {
        let now = self.clock.now();
        let mut last_good = self.last_good.lock();
        let entry = last_good.get(key)?;
        let age = now.saturating_duration_since(entry.stored_at);
        if age >= self.policy.max_age + self.stale_if_error() {
            return None;
        }
        Some(
            entry
                .response
                .clone()
                .with_header(HEADER_AGE, age.as_secs().to_string()),
        )
    }

    /// Remembered verification responses
    pub fn len(&self) -> usize {
        self.last_good.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_good.lock().is_empty()
    }

    /// Debug view of the remembered response for a cache key
    pub fn probe(&self, key: &str) -> Option<VerificationProbe> {
        let now = self.clock.now();
        let last_good = self.last_good.lock();
        let entry = last_good.peek(key)?;
        let age = now.saturating_duration_since(entry.stored_at);
        Some(VerificationProbe {
            key: key.to_string(),
            validator: entry.response.etag(),
            age,
            fresh_for: self.policy.max_age.saturating_sub(age),
            within_stale_if_error: age < self.policy.max_age + self.stale_if_error(),
            tags: entry.response.cache_tags(),
        })
    }
}

#[async_trait]
impl CdnPurger for VerificationResponder {
    async fn purge_urls(&self, _urls: &[String]) -> Result<()> {
        Ok(())
    }

    /// Forget remembered verdicts for the purged manifests
    async fn purge_tags(&self, tags: &[String]) -> Result<()> {
        let mut last_good = self.last_good.lock();
        let doomed: Vec<String> = last_good
            .iter()
            .filter(|(_, e)| e.response.cache_tags().iter().any(|t| tags.contains(t)))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            last_good.pop(&key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::manifest::{ContentHash, Manifest};
    use crate::core::resolver::ManifestFetcher;
    use crate::core::telemetry::ManualClock;
    use crate::error::ProvenanceError;
    use std::sync::atomic::{AtomicBool, Ordering};

    const BASE: &str = "https://manifests.example.com";

    /// Serves one manifest until switched off
    struct Switchable {
        bytes: Vec<u8>,
        down: AtomicBool,
    }

    #[async_trait]
    impl ManifestFetcher for Switchable {
        async fn fetch_manifest(&self, _r: &ManifestReference) -> Result<Option<Arc<[u8]>>> {
            if self.down.load(Ordering::SeqCst) {
                return Err(ProvenanceError::Backend("storage offline".to_string()));
            }
            Ok(Some(Arc::from(self.bytes.as_slice())))
        }
    }

    fn setup() -> (VerificationResponder, Arc<Switchable>, Arc<ManualClock>, AssetRef) {
        let bytes = Manifest::new("issuer").to_canonical_bytes().unwrap();
        let hash = ContentHash::of(&bytes);
        let fetcher = Arc::new(Switchable {
            bytes,
            down: AtomicBool::new(false),
        });
        let resolver = Resolver::new(fetcher.clone(), BASE, Duration::from_secs(1)).unwrap();
        let clock = Arc::new(ManualClock::new());
        let responder =
            VerificationResponder::new(Arc::new(resolver), &VerificationCacheConfig::default(), 16)
                .with_clock(clock.clone());
        let asset = AssetRef::from_link(format!("{}/manifests/{}", BASE, hash));
        (responder, fetcher, clock, asset)
    }

    #[tokio::test]
    async fn test_verified_response_headers() {
        let (responder, _, _, asset) = setup();
        let response = responder.respond(&asset, None).await;
        assert_eq!(response.status, 200);
        assert_eq!(
            response.header(HEADER_CACHE_CONTROL),
            Some("public, max-age=300, s-maxage=3600, stale-if-error=30")
        );
        assert!(response.cache_tags()[0].starts_with("verify:"));

        let inm = response.etag().unwrap().header_value();
        let again = responder.respond(&asset, Some(&inm)).await;
        assert_eq!(again.status, 304);
        assert!(again.body.is_empty());
    }

    #[tokio::test]
    async fn test_stale_if_error_is_bounded() {
        let (responder, fetcher, clock, asset) = setup();
        let good = responder.respond(&asset, None).await;
        fetcher.down.store(true, Ordering::SeqCst);

        clock.advance(Duration::from_secs(320));
        let stale = responder.respond(&asset, None).await;
        assert_eq!(stale.status, 200);
        assert_eq!(stale.body, good.body);
        assert_eq!(stale.header(HEADER_AGE), Some("320"));

        clock.advance(Duration::from_secs(20));
        let failed = responder.respond(&asset, None).await;
        assert_eq!(failed.status, 503);
        assert!(!failed.cache_policy().is_storable());
    }

    #[tokio::test]
    async fn test_purge_forgets_last_good() {
        let (responder, fetcher, _, asset) = setup();
        let good = responder.respond(&asset, None).await;
        let key = asset.cache_key();
        assert!(responder.probe(&key).unwrap().within_stale_if_error);

        responder.purge_tags(&good.cache_tags()).await.unwrap();
        assert!(responder.probe(&key).is_none());

        fetcher.down.store(true, Ordering::SeqCst);
        assert_eq!(responder.respond(&asset, None).await.status, 503);
    }
}
