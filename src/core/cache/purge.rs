//! Purge on write
//!
//! Every store write schedules a purge of the manifest's canonical URL and
//! its cache tags. Purges run on a background task with bounded exponential
//! backoff and never block or fail the write. Exhausting the retry budget
//! raises an operator alert; edges still converge when `s-maxage` expires.

use crate::config::PurgeConfig;
use crate::core::manifest::ContentHash;
use crate::core::telemetry::{CacheEvent, MetricsSink, NoopMetrics};
use crate::error::{ProvenanceError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Purge outcomes kept for inspection
const HISTORY_LIMIT: usize = 256;

/// CDN invalidation API
#[async_trait]
pub trait CdnPurger: Send + Sync {
    async fn purge_urls(&self, urls: &[String]) -> Result<()>;

    async fn purge_tags(&self, tags: &[String]) -> Result<()>;
}

/// Sends every purge to each purger in turn; the first failure fails the call
#[derive(Default, Clone)]
pub struct PurgeFanout {
    targets: Vec<Arc<dyn CdnPurger>>,
}

impl PurgeFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, purger: Arc<dyn CdnPurger>) -> Self {
        self.targets.push(purger);
        self
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[async_trait]
impl CdnPurger for PurgeFanout {
    async fn purge_urls(&self, urls: &[String]) -> Result<()> {
        for target in &self.targets {
            target.purge_urls(urls).await?;
        }
        Ok(())
    }

    async fn purge_tags(&self, tags: &[String]) -> Result<()> {
        for target in &self.targets {
            target.purge_tags(tags).await?;
        }
        Ok(())
    }
}

pub fn manifest_tag(hash: &ContentHash) -> String {
    format!("manifest:{}", hash)
}

pub fn verify_tag(hash: &ContentHash) -> String {
    format!("verify:{}", hash)
}

/// Tags invalidated by writing `hash`, superseding `previous` if given
pub fn purge_tags_for(hash: &ContentHash, previous: Option<&ContentHash>) -> Vec<String> {
    let mut tags = vec![manifest_tag(hash), verify_tag(hash)];
    if let Some(previous) = previous.filter(|p| *p != hash) {
        tags.push(verify_tag(previous));
    }
    tags
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeEvent {
    pub target_url: String,
    pub tags: Vec<String>,
    /// Manifest whose write caused the purge
    pub triggered_by: ContentHash,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub succeeded: bool,
}

impl PurgeEvent {
    pub fn new(target_url: impl Into<String>, tags: Vec<String>, triggered_by: ContentHash) -> Self {
        PurgeEvent {
            target_url: target_url.into(),
            tags,
            triggered_by,
            attempts: 0,
            last_error: None,
            succeeded: false,
        }
    }
}

#[derive(Clone)]
pub struct PurgeScheduler {
    purger: Arc<dyn CdnPurger>,
    config: PurgeConfig,
    metrics: Arc<dyn MetricsSink>,
    history: Arc<Mutex<VecDeque<PurgeEvent>>>,
}

impl PurgeScheduler {
    pub fn new(purger: Arc<dyn CdnPurger>, config: PurgeConfig) -> Self {
        PurgeScheduler {
            purger,
            config,
            metrics: Arc::new(NoopMetrics),
            history: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Start purging in the background
    ///
    /// Returns `None` when called outside a tokio runtime; the purge is then
    /// dropped with a warning.
    pub fn schedule(&self, event: PurgeEvent) -> Option<JoinHandle<PurgeEvent>> {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(
                    "No async runtime; purge for {} not scheduled",
                    event.target_url
                );
                return None;
            }
        };
        let scheduler = self.clone();
        Some(handle.spawn(async move { scheduler.run(event).await }))
    }

    /// Run the retry loop to completion
    pub async fn run(&self, mut event: PurgeEvent) -> PurgeEvent {
        let urls = vec![event.target_url.clone()];

        while event.attempts < self.config.max_attempts {
            event.attempts += 1;
            let attempt = async {
                self.purger.purge_urls(&urls).await?;
                self.purger.purge_tags(&event.tags).await
            };
            let outcome = match tokio::time::timeout(self.config.attempt_timeout(), attempt).await {
                Ok(result) => result,
                Err(_) => Err(ProvenanceError::Backend(format!(
                    "purge attempt timed out after {:?}",
                    self.config.attempt_timeout()
                ))),
            };

            match outcome {
                Ok(()) => {
                    event.succeeded = true;
                    event.last_error = None;
                    self.metrics.record(CacheEvent::PurgeSucceeded);
                    debug!(
                        "Purged {} (+{} tags) after {} attempt(s)",
                        event.target_url,
                        event.tags.len(),
                        event.attempts
                    );
                    break;
                }
                Err(e) => {
                    event.last_error = Some(e.to_string());
                    if event.attempts < self.config.max_attempts {
                        self.metrics.record(CacheEvent::PurgeRetried);
                        let delay = self.backoff(event.attempts);
                        debug!(
                            "Purge attempt {} for {} failed ({}); retrying in {:?}",
                            event.attempts, event.target_url, e, delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        if !event.succeeded {
            self.metrics.record(CacheEvent::PurgeExhausted);
            let deferred = ProvenanceError::PurgeDeferred {
                target: event.target_url.clone(),
                attempts: event.attempts,
                reason: event.last_error.clone().unwrap_or_default(),
            };
            error!("ALERT {}; edges converge on s-maxage expiry", deferred);
        }

        let mut history = self.history.lock();
        if history.len() == HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(event.clone());
        event
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self
            .config
            .base_delay()
            .saturating_mul(1u32 << exp)
            .min(self.config.max_delay());
        if !self.config.jitter || delay.is_zero() {
            return delay;
        }
        // Equal jitter: half fixed, half random
        let half = delay / 2;
        let spread = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(spread)
    }

    /// Most recent purge outcomes, oldest first
    pub fn history(&self) -> Vec<PurgeEvent> {
        self.history.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::telemetry::AtomicMetrics;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl CdnPurger for Flaky {
        async fn purge_urls(&self, _urls: &[String]) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(ProvenanceError::Backend("edge unavailable".to_string()));
            }
            Ok(())
        }

        async fn purge_tags(&self, _tags: &[String]) -> Result<()> {
            Ok(())
        }
    }

    fn flaky(failures: u32) -> Arc<Flaky> {
        Arc::new(Flaky {
            failures_left: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        })
    }

    fn fast_config() -> PurgeConfig {
        PurgeConfig {
            max_attempts: 3,
            base_delay_ms: 10,
            max_delay_ms: 40,
            jitter: false,
            attempt_timeout_ms: 100,
        }
    }

    #[test]
    fn test_tags() {
        let new = ContentHash::of(b"new");
        let old = ContentHash::of(b"old");
        assert_eq!(purge_tags_for(&new, None).len(), 2);
        let tags = purge_tags_for(&new, Some(&old));
        assert_eq!(tags[2], format!("verify:{}", old));
        assert_eq!(purge_tags_for(&new, Some(&new)).len(), 2);
    }

    #[test]
    fn test_backoff_is_bounded() {
        let scheduler = PurgeScheduler::new(flaky(0), fast_config());
        assert_eq!(scheduler.backoff(1), Duration::from_millis(10));
        assert_eq!(scheduler.backoff(2), Duration::from_millis(20));
        assert_eq!(scheduler.backoff(3), Duration::from_millis(40));
        assert_eq!(scheduler.backoff(30), Duration::from_millis(40));

        let jittered = PurgeScheduler::new(
            flaky(0),
            PurgeConfig {
                jitter: true,
                ..fast_config()
            },
        );
        for attempt in 1..6 {
            let d = jittered.backoff(attempt);
            assert!(d <= Duration::from_millis(40));
            assert!(d >= scheduler.backoff(attempt) / 2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds() {
        let purger = flaky(2);
        let metrics = Arc::new(AtomicMetrics::new());
        let scheduler =
            PurgeScheduler::new(purger.clone(), fast_config()).with_metrics(metrics.clone());

        let event = PurgeEvent::new("https://m.example.com/manifests/x", vec![], ContentHash::of(b"x"));
        let done = scheduler.schedule(event).unwrap().await.unwrap();
        assert!(done.succeeded);
        assert_eq!(done.attempts, 3);
        assert_eq!(purger.calls.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.count(CacheEvent::PurgeRetried), 2);
        assert_eq!(metrics.count(CacheEvent::PurgeSucceeded), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_is_recorded() {
        let metrics = Arc::new(AtomicMetrics::new());
        let scheduler = PurgeScheduler::new(flaky(10), fast_config()).with_metrics(metrics.clone());
        let event = PurgeEvent::new("u", vec!["manifest:x".to_string()], ContentHash::of(b"x"));

        let done = scheduler.run(event).await;
        assert!(!done.succeeded);
        assert_eq!(done.attempts, 3);
        assert_eq!(done.last_error.as_deref(), Some("Storage backend error: edge unavailable"));
        assert_eq!(metrics.count(CacheEvent::PurgeExhausted), 1);
        assert_eq!(scheduler.history().len(), 1);
    }

    #[test]
    fn test_schedule_without_runtime() {
        let scheduler = PurgeScheduler::new(flaky(0), fast_config());
        let event = PurgeEvent::new("u", vec![], ContentHash::of(b"x"));
        assert!(scheduler.schedule(event).is_none());
    }
}
