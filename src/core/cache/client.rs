//! Cache-aware manifest client
//!
//! Honors the freshness contract the origin publishes:
//!
//! - fresh entries are served locally
//! - stale entries inside the stale-while-revalidate window are served while
//!   exactly one background revalidation runs
//! - past the window the entry is revalidated before anything is returned
//! - negative responses are never remembered
//! - purges drop entries immediately, by URL or by tag

use super::etag::EntityTag;
use super::policy::{freshness, CachePolicy, CacheRole, Freshness};
use super::purge::CdnPurger;
use super::Response;
use crate::core::telemetry::{CacheEvent, Clock, MetricsSink, NoopMetrics, SystemClock};
use crate::error::{ProvenanceError, Result};
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Where the client fetches from: a CDN edge, or the origin directly
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn fetch(&self, url: &str, if_none_match: Option<&str>) -> Result<Response>;
}

/// Freshness bookkeeping for one cached manifest
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub validator: EntityTag,
    pub body: Arc<[u8]>,
    /// From `max-age`
    pub freshness_lifetime: Duration,
    /// From `s-maxage`
    pub shared_freshness_lifetime: Duration,
    /// From `stale-while-revalidate`
    pub stale_window: Duration,
    pub last_fetch: Instant,
    pub tags: Vec<String>,
    revalidating: bool,
}

impl CacheEntry {
    fn from_response(body: Arc<[u8]>, validator: EntityTag, response: &Response, now: Instant) -> Self {
        let policy = response.cache_policy();
        let mut entry = CacheEntry {
            validator,
            body,
            freshness_lifetime: Duration::ZERO,
            shared_freshness_lifetime: Duration::ZERO,
            stale_window: Duration::ZERO,
            last_fetch: now,
            tags: response.cache_tags(),
            revalidating: false,
        };
        entry.apply(&policy);
        entry
    }

    fn apply(&mut self, policy: &CachePolicy) {
        self.freshness_lifetime = policy.lifetime(CacheRole::Private);
        self.shared_freshness_lifetime = policy.lifetime(CacheRole::Shared);
        self.stale_window = policy.stale_while_revalidate.unwrap_or(Duration::ZERO);
    }

    pub fn lifetime(&self, role: CacheRole) -> Duration {
        match role {
            CacheRole::Private => self.freshness_lifetime,
            CacheRole::Shared => self.shared_freshness_lifetime,
        }
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_fetch)
    }

    pub fn freshness(&self, now: Instant, role: CacheRole) -> Freshness {
        freshness(self.age(now), self.lifetime(role), self.stale_window)
    }
}

/// Debug view of one entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryProbe {
    pub url: String,
    pub validator: EntityTag,
    pub age: Duration,
    /// Zero once stale
    pub fresh_for: Duration,
    pub freshness: Freshness,
    pub revalidating: bool,
    pub tags: Vec<String>,
}

enum Decision {
    Fresh(Arc<[u8]>),
    Stale {
        body: Arc<[u8]>,
        validator: EntityTag,
        spawn: bool,
    },
    Revalidate(Option<EntityTag>),
}

#[derive(Clone)]
pub struct CachingFetcher {
    upstream: Arc<dyn Upstream>,
    entries: Arc<Mutex<LruCache<String, CacheEntry>>>,
    /// Bumped by every purge; responses fetched under an older value are not stored
    generation: Arc<AtomicU64>,
    role: CacheRole,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
}

impl CachingFetcher {
    pub fn new(upstream: Arc<dyn Upstream>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        CachingFetcher {
            upstream,
            entries: Arc::new(Mutex::new(LruCache::new(capacity))),
            generation: Arc::new(AtomicU64::new(0)),
            role: CacheRole::default(),
            clock: Arc::new(SystemClock),
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_role(mut self, role: CacheRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Fetch `url`, serving from cache where the contract allows
    ///
    /// `Ok(None)` is an authoritative "does not exist".
    pub async fn fetch(&self, url: &str) -> Result<Option<Arc<[u8]>>> {
        let now = self.clock.now();
        let decision = {
            let mut entries = self.entries.lock();
            match entries.get_mut(url) {
                Some(entry) => match entry.freshness(now, self.role) {
                    Freshness::Fresh => Decision::Fresh(entry.body.clone()),
                    Freshness::Stale => {
                        let spawn = !entry.revalidating;
                        entry.revalidating = true;
                        Decision::Stale {
                            body: entry.body.clone(),
                            validator: entry.validator.clone(),
                            spawn,
                        }
                    }
                    Freshness::Expired => Decision::Revalidate(Some(entry.validator.clone())),
                },
                None => Decision::Revalidate(None),
            }
        };

        match decision {
            Decision::Fresh(body) => {
                self.metrics.record(CacheEvent::FreshHit);
                Ok(Some(body))
            }
            Decision::Stale {
                body,
                validator,
                spawn,
            } => {
                self.metrics.record(CacheEvent::StaleServed);
                if spawn {
                    self.spawn_revalidation(url.to_string(), validator).await;
                }
                Ok(Some(body))
            }
            Decision::Revalidate(validator) => self.revalidate(url, validator).await,
        }
    }

    async fn spawn_revalidation(&self, url: String, validator: EntityTag) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let this = self.clone();
                handle.spawn(async move {
                    if let Err(e) = this.revalidate(&url, Some(validator)).await {
                        warn!("Background revalidation of {} failed: {}", url, e);
                    }
                });
            }
            Err(_) => {
                if let Err(e) = self.revalidate(&url, Some(validator)).await {
                    warn!("Revalidation of {} failed: {}", url, e);
                }
            }
        }
    }

    async fn revalidate(&self, url: &str, validator: Option<EntityTag>) -> Result<Option<Arc<[u8]>>> {
        let generation = self.generation.load(Ordering::Acquire);
        let condition = validator.map(|v| v.header_value());
        let response = match self.upstream.fetch(url, condition.as_deref()).await {
            Ok(response) => response,
            Err(e) => {
                self.clear_revalidating(url);
                return Err(e);
            }
        };

        if response.status == 304 {
            let now = self.clock.now();
            {
                let mut entries = self.entries.lock();
                if let Some(entry) = entries.get_mut(url) {
                    entry.last_fetch = now;
                    entry.revalidating = false;
                    if response.header(super::HEADER_CACHE_CONTROL).is_some() {
                        entry.apply(&response.cache_policy());
                    }
                    debug!("Revalidated {} (304)", url);
                    return Ok(Some(entry.body.clone()));
                }
            }
            // Purged while the request was in flight
            let full = self.upstream.fetch(url, None).await?;
            return self.accept(url, full, generation);
        }
        self.accept(url, response, generation)
    }

    fn accept(&self, url: &str, response: Response, generation: u64) -> Result<Option<Arc<[u8]>>> {
        match response.status {
            200 => {
                let policy = response.cache_policy();
                let body: Arc<[u8]> = Arc::from(response.body.as_slice());
                match response.etag() {
                    Some(validator) if policy.is_storable() => {
                        let entry =
                            CacheEntry::from_response(body.clone(), validator, &response, self.clock.now());
                        let mut entries = self.entries.lock();
                        // Checked under the lock that purges also take
                        if self.generation.load(Ordering::Acquire) == generation {
                            entries.put(url.to_string(), entry);
                        } else {
                            debug!("Not caching {}: purged while in flight", url);
                            entries.pop(url);
                        }
                    }
                    _ => {
                        self.entries.lock().pop(url);
                    }
                }
                Ok(Some(body))
            }
            404 | 410 => {
                self.entries.lock().pop(url);
                Ok(None)
            }
            status => {
                self.clear_revalidating(url);
                Err(ProvenanceError::Backend(format!(
                    "upstream returned {} for {}",
                    status, url
                )))
            }
        }
    }

    fn clear_revalidating(&self, url: &str) {
        if let Some(entry) = self.entries.lock().peek_mut(url) {
            entry.revalidating = false;
        }
    }

    pub fn invalidate(&self, url: &str) -> bool {
        let mut entries = self.entries.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        entries.pop(url).is_some()
    }

    /// Drop every entry carrying any of `tags`; returns how many were dropped
    pub fn invalidate_tags(&self, tags: &[String]) -> usize {
        let mut entries = self.entries.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.tags.iter().any(|t| tags.contains(t)))
            .map(|(k, _)| k.clone())
            .collect();
        for url in &doomed {
            entries.pop(url);
        }
        doomed.len()
    }

    pub fn probe(&self, url: &str) -> Option<EntryProbe> {
        let now = self.clock.now();
        let entries = self.entries.lock();
        let entry = entries.peek(url)?;
        let age = entry.age(now);
        Some(EntryProbe {
            url: url.to_string(),
            validator: entry.validator.clone(),
            age,
            fresh_for: entry.lifetime(self.role).saturating_sub(age),
            freshness: entry.freshness(now, self.role),
            revalidating: entry.revalidating,
            tags: entry.tags.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl CdnPurger for CachingFetcher {
    async fn purge_urls(&self, urls: &[String]) -> Result<()> {
        for url in urls {
            self.invalidate(url);
        }
        Ok(())
    }

    async fn purge_tags(&self, tags: &[String]) -> Result<()> {
        self.invalidate_tags(tags);
        Ok(())
    }
}
