//! Cache consistency and CDN invalidation
//!
//! - [`ManifestOrigin`] renders manifest responses with validators, policy and tags
//! - [`CachingFetcher`] is the resolver's cache-aware client
//! - [`VerificationResponder`] renders verification responses with stale-if-error
//! - [`PurgeScheduler`] invalidates CDN copies after every store write
//! - [`RetryingUpstream`] retries transient fetch failures behind a circuit breaker

mod client;
mod etag;
mod origin;
mod policy;
mod purge;
mod retry;
mod verification;

pub use client::{CacheEntry, CachingFetcher, EntryProbe, Upstream};
pub use etag::EntityTag;
pub use origin::ManifestOrigin;
pub use policy::{freshness, CachePolicy, CacheRole, Freshness};
pub use purge::{
    manifest_tag, purge_tags_for, verify_tag, CdnPurger, PurgeEvent, PurgeFanout, PurgeScheduler,
};
pub use retry::{CircuitState, RetryingUpstream};
pub use verification::{VerificationProbe, VerificationResponder};

use crate::core::telemetry::MetricsSnapshot;
use serde::Serialize;
use std::collections::BTreeMap;

pub const HEADER_CACHE_CONTROL: &str = "cache-control";
pub const HEADER_ETAG: &str = "etag";
pub const HEADER_CONTENT_TYPE: &str = "content-type";
/// Space-separated purge tags, as read by tag-aware CDNs
pub const HEADER_CACHE_TAG: &str = "cache-tag";
pub const HEADER_LINK: &str = "link";
/// Seconds since a remembered response was produced
pub const HEADER_AGE: &str = "age";

/// Counters plus occupancy of every cache layer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub metrics: MetricsSnapshot,
    /// Percentage of store reads answered by a tier
    pub store_hit_rate: f64,
    pub stored_manifests: usize,
    pub memory_tier_entries: usize,
    pub client_entries: usize,
    pub verification_entries: usize,
    pub circuit: CircuitState,
}

/// Minimal HTTP response as produced by the origin and responders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    /// Lowercase header names
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Response {
            status,
            headers: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn etag(&self) -> Option<EntityTag> {
        self.header(HEADER_ETAG).and_then(EntityTag::parse)
    }

    pub fn cache_policy(&self) -> CachePolicy {
        self.header(HEADER_CACHE_CONTROL)
            .map(CachePolicy::parse)
            .unwrap_or_default()
    }

    pub fn cache_tags(&self) -> Vec<String> {
        self.header(HEADER_CACHE_TAG)
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// 304 derived from this response: same validator and policy, empty body
    pub fn not_modified(&self) -> Response {
        let mut response = Response::new(304);
        for name in [HEADER_ETAG, HEADER_CACHE_CONTROL, HEADER_CACHE_TAG] {
            if let Some(value) = self.headers.get(name) {
                response.headers.insert(name.to_string(), value.clone());
            }
        }
        response
    }
}
