//! Retry and circuit breaking for manifest fetches
//!
//! Transient upstream failures (transport errors, 408, 429 and 5xx gateway
//! statuses) are retried with full-jitter exponential backoff. A fetch that
//! still fails after its retries counts once against the breaker; enough of
//! them in a row open the circuit and later fetches fail fast until the
//! cooldown elapses. After the cooldown a single failure reopens it and a
//! single success closes it.
//!
//! The resolver's fetch timeout wraps the whole sequence, so retries never
//! extend how long a verification can take.

use super::client::Upstream;
use super::Response;
use crate::config::ResolverConfig;
use crate::core::telemetry::{CacheEvent, Clock, MetricsSink, NoopMetrics, SystemClock};
use crate::error::{ProvenanceError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Statuses worth another attempt
const TRANSIENT_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    /// Rejecting fetches until the cooldown elapses
    Open,
    /// Cooldown elapsed; the next outcome decides
    HalfOpen,
}

#[derive(Debug, Default)]
struct Breaker {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// [`Upstream`] wrapper adding bounded retries and a circuit breaker
pub struct RetryingUpstream {
    inner: Arc<dyn Upstream>,
    retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
    threshold: u32,
    cooldown: Duration,
    breaker: Mutex<Breaker>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
}

impl RetryingUpstream {
    pub fn new(inner: Arc<dyn Upstream>, config: &ResolverConfig) -> Self {
        RetryingUpstream {
            inner,
            retries: config.fetch_retries,
            base_delay: config.retry_base_delay(),
            max_delay: config.retry_max_delay(),
            jitter: true,
            threshold: config.breaker_threshold,
            cooldown: config.breaker_cooldown(),
            breaker: Mutex::new(Breaker::default()),
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

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let millis = rand::thread_rng().gen_range(0..=delay.as_millis() as u64);
        Duration::from_millis(millis)
    }

    pub fn state(&self) -> CircuitState {
        let breaker = self.breaker.lock();
        match breaker.open_until {
            Some(until) if self.clock.now() < until => CircuitState::Open,
            Some(_) => CircuitState::HalfOpen,
            None => CircuitState::Closed,
        }
    }

    fn admit(&self) -> Result<()> {
        let breaker = self.breaker.lock();
        let now = self.clock.now();
        match breaker.open_until {
            Some(until) if now < until => {
                self.metrics.record(CacheEvent::CircuitRejected);
                Err(ProvenanceError::CircuitOpen(until - now))
            }
            _ => Ok(()),
        }
    }

    fn record_success(&self) {
        let mut breaker = self.breaker.lock();
        if breaker.open_until.take().is_some() {
            info!("Upstream circuit closed after a successful trial fetch");
        }
        breaker.consecutive_failures = 0;
    }

    fn record_failure(&self) {
        if self.threshold == 0 {
            return;
        }
        let mut breaker = self.breaker.lock();
        breaker.consecutive_failures = breaker.consecutive_failures.saturating_add(1);
        if breaker.consecutive_failures >= self.threshold {
            breaker.open_until = Some(self.clock.now() + self.cooldown);
            self.metrics.record(CacheEvent::CircuitOpened);
            warn!(
                "Upstream circuit open for {:?} after {} failed fetches",
                self.cooldown, breaker.consecutive_failures
            );
        }
    }

    fn is_transient(outcome: &Result<Response>) -> bool {
        match outcome {
            Ok(response) => TRANSIENT_STATUSES.contains(&response.status),
            Err(_) => true,
        }
    }
}

#[async_trait]
impl Upstream for RetryingUpstream {
    async fn fetch(&self, url: &str, if_none_match: Option<&str>) -> Result<Response> {
        self.admit()?;
        let mut attempt = 0;
        loop {
            let outcome = self.inner.fetch(url, if_none_match).await;
            if !Self::is_transient(&outcome) {
                self.record_success();
                return outcome;
            }
            if attempt >= self.retries {
                self.record_failure();
                return outcome;
            }
            attempt += 1;
            let delay = self.backoff(attempt);
            match &outcome {
                Ok(response) => debug!(
                    "Fetch of {} returned {}; retry {} in {:?}",
                    url, response.status, attempt, delay
                ),
                Err(e) => debug!("Fetch of {} failed: {}; retry {} in {:?}", url, e, attempt, delay),
            }
            self.metrics.record(CacheEvent::UpstreamRetried);
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::telemetry::{AtomicMetrics, ManualClock};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Plays back scripted statuses, then answers 200; status 0 is a transport error
    struct Scripted {
        script: Mutex<VecDeque<u16>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(script: &[u16]) -> Arc<Self> {
            Arc::new(Scripted {
                script: Mutex::new(script.iter().copied().collect()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Upstream for Scripted {
        async fn fetch(&self, _url: &str, _if_none_match: Option<&str>) -> Result<Response> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script.lock().pop_front().unwrap_or(200) {
                0 => Err(ProvenanceError::Backend("connection reset".to_string())),
                status => Ok(Response::new(status)),
            }
        }
    }

    fn config(retries: u32, threshold: u32) -> ResolverConfig {
        ResolverConfig {
            fetch_retries: retries,
            breaker_threshold: threshold,
            breaker_cooldown_ms: 10_000,
            ..ResolverConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let inner = Scripted::new(&[0, 503]);
        let metrics = Arc::new(AtomicMetrics::new());
        let upstream = RetryingUpstream::new(inner.clone(), &config(2, 5)).with_metrics(metrics.clone());

        let response = upstream.fetch("u", None).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(inner.calls(), 3);
        assert_eq!(metrics.count(CacheEvent::UpstreamRetried), 2);
        assert_eq!(upstream.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_authoritative_answers_are_not_retried() {
        let inner = Scripted::new(&[404]);
        let upstream = RetryingUpstream::new(inner.clone(), &config(2, 5));
        assert_eq!(upstream.fetch("u", None).await.unwrap().status, 404);
        assert_eq!(inner.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_return_last_outcome() {
        let inner = Scripted::new(&[0, 0, 502]);
        let upstream = RetryingUpstream::new(inner.clone(), &config(2, 5));
        assert_eq!(upstream.fetch("u", None).await.unwrap().status, 502);
        assert_eq!(inner.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_and_recovers() {
        let inner = Scripted::new(&[0, 0, 503]);
        let clock = Arc::new(ManualClock::new());
        let metrics = Arc::new(AtomicMetrics::new());
        let upstream = RetryingUpstream::new(inner.clone(), &config(0, 2))
            .with_clock(clock.clone())
            .with_metrics(metrics.clone());

        assert!(upstream.fetch("u", None).await.is_err());
        assert_eq!(upstream.state(), CircuitState::Closed);
        assert!(upstream.fetch("u", None).await.is_err());
        assert_eq!(upstream.state(), CircuitState::Open);
        assert_eq!(metrics.count(CacheEvent::CircuitOpened), 1);

        // Open: rejected without reaching upstream
        let err = upstream.fetch("u", None).await.unwrap_err();
        assert!(matches!(err, ProvenanceError::CircuitOpen(_)));
        assert!(err.is_operational());
        assert_eq!(inner.calls(), 2);
        assert_eq!(metrics.count(CacheEvent::CircuitRejected), 1);

        // Half-open: one failed trial reopens
        clock.advance(Duration::from_secs(10));
        assert_eq!(upstream.state(), CircuitState::HalfOpen);
        assert_eq!(upstream.fetch("u", None).await.unwrap().status, 503);
        assert_eq!(upstream.state(), CircuitState::Open);

        // One successful trial closes
        clock.advance(Duration::from_secs(10));
        assert_eq!(upstream.fetch("u", None).await.unwrap().status, 200);
        assert_eq!(upstream.state(), CircuitState::Closed);
        assert_eq!(inner.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_threshold_never_opens() {
        let inner = Scripted::new(&[0; 8]);
        let upstream = RetryingUpstream::new(inner.clone(), &config(0, 0));
        for _ in 0..8 {
            assert!(upstream.fetch("u", None).await.is_err());
        }
        assert_eq!(upstream.state(), CircuitState::Closed);
        assert_eq!(inner.calls(), 8);
    }

    #[test]
    fn test_backoff_is_bounded() {
        let upstream = RetryingUpstream::new(Scripted::new(&[]), &ResolverConfig::default())
            .with_jitter(false);
        assert_eq!(upstream.backoff(1), Duration::from_millis(50));
        assert_eq!(upstream.backoff(2), Duration::from_millis(100));
        assert_eq!(upstream.backoff(3), Duration::from_millis(200));
        assert_eq!(upstream.backoff(40), Duration::from_millis(200));

        let jittered = RetryingUpstream::new(Scripted::new(&[]), &ResolverConfig::default());
        for attempt in 1..6 {
            assert!(jittered.backoff(attempt) <= upstream.backoff(attempt));
        }
    }
}
