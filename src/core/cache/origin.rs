//! Origin responder for `<base>/manifests/<hex>`

use super::client::Upstream;
use super::etag::EntityTag;
use super::policy::CachePolicy;
use super::purge::manifest_tag;
use super::{Response, HEADER_CACHE_CONTROL, HEADER_CACHE_TAG, HEADER_CONTENT_TYPE, HEADER_ETAG};
use crate::config::ManifestCacheConfig;
use crate::core::manifest::{ContentHash, Manifest};
use crate::core::store::ManifestStore;
use crate::core::telemetry::{CacheEvent, MetricsSink, NoopMetrics};
use crate::core::validation::MANIFEST_PATH;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

pub struct ManifestOrigin {
    store: Arc<ManifestStore>,
    policy: CachePolicy,
    metrics: Arc<dyn MetricsSink>,
}

impl ManifestOrigin {
    pub fn new(store: Arc<ManifestStore>, config: &ManifestCacheConfig) -> Self {
        ManifestOrigin {
            store,
            policy: CachePolicy::manifest(config),
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    fn negative(&self, status: u16) -> Response {
        self.metrics.record(CacheEvent::NegativeServed);
        Response::new(status).with_header(HEADER_CACHE_CONTROL, CachePolicy::negative().header_value())
    }

    /// Serve one manifest, honoring `If-None-Match`
    pub async fn serve(&self, hash: &ContentHash, if_none_match: Option<&str>) -> Response {
        let bytes = match self.store.get(hash).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return self.negative(404),
            Err(e) => {
                warn!("Origin failed to read manifest {}: {}", hash, e);
                return self.negative(503);
            }
        };

        let etag = EntityTag::for_manifest(hash);
        let response = Response::new(200)
            .with_header(HEADER_ETAG, etag.header_value())
            .with_header(HEADER_CACHE_CONTROL, self.policy.header_value())
            .with_header(HEADER_CACHE_TAG, manifest_tag(hash))
            .with_header(HEADER_CONTENT_TYPE, Manifest::MEDIA_TYPE);

        if if_none_match.is_some_and(|h| etag.matches_if_none_match(h)) {
            self.metrics.record(CacheEvent::NotModified);
            return response.not_modified();
        }
        response.with_body(bytes.to_vec())
    }

    /// Route a request path or full URL ending in `/manifests/<hex>`
    pub async fn handle(&self, path: &str, if_none_match: Option<&str>) -> Response {
        let hash = path
            .trim_end_matches('/')
            .rsplit_once('/')
            .filter(|(prefix, _)| prefix.ends_with(MANIFEST_PATH))
            .and_then(|(_, hex)| ContentHash::from_hex(hex).ok());
        match hash {
            Some(hash) => self.serve(&hash, if_none_match).await,
            None => self.negative(404),
        }
    }
}

#[async_trait]
impl Upstream for ManifestOrigin {
    async fn fetch(&self, url: &str, if_none_match: Option<&str>) -> Result<Response> {
        Ok(self.handle(url, if_none_match).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::telemetry::AtomicMetrics;

    async fn origin_with(bytes: &[u8]) -> (ManifestOrigin, ContentHash, Arc<AtomicMetrics>) {
        let store = Arc::new(ManifestStore::in_memory());
        let hash = store.put(bytes).await.unwrap().hash;
        let metrics = Arc::new(AtomicMetrics::new());
        let origin = ManifestOrigin::new(store, &ManifestCacheConfig::default())
            .with_metrics(metrics.clone());
        (origin, hash, metrics)
    }

    #[tokio::test]
    async fn test_serves_with_validator_and_tags() {
        let (origin, hash, _) = origin_with(b"{\"a\":1}").await;
        let response = origin.handle(&format!("/manifests/{}", hash), None).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"{\"a\":1}");
        assert_eq!(response.etag(), Some(EntityTag::for_manifest(&hash)));
        assert_eq!(response.cache_tags(), vec![format!("manifest:{}", hash)]);
        assert_eq!(response.header("Content-Type"), Some("application/c2pa+json"));
    }

    #[tokio::test]
    async fn test_conditional_304_has_empty_body() {
        let (origin, hash, metrics) = origin_with(b"m").await;
        let inm = EntityTag::for_manifest(&hash).header_value();
        let response = origin.serve(&hash, Some(&inm)).await;
        assert_eq!(response.status, 304);
        assert!(response.body.is_empty());
        assert!(response.etag().is_some());
        assert_eq!(metrics.count(CacheEvent::NotModified), 1);

        let weak = format!("W/{}", inm);
        assert_eq!(origin.serve(&hash, Some(&weak)).await.status, 200);
    }

    #[tokio::test]
    async fn test_missing_is_negative() {
        let (origin, _, metrics) = origin_with(b"m").await;
        let response = origin.serve(&ContentHash::of(b"other"), None).await;
        assert_eq!(response.status, 404);
        assert!(!response.cache_policy().is_storable());
        assert_eq!(
            response.header(HEADER_CACHE_CONTROL),
            Some("no-cache, max-age=0, s-maxage=0, must-revalidate")
        );
        assert_eq!(origin.handle("/elsewhere/abc", None).await.status, 404);
        assert_eq!(metrics.count(CacheEvent::NegativeServed), 2);
    }
}
