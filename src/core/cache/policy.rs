//! Cache-Control policies and freshness arithmetic
//!
//! | Response | Cache-Control |
//! |---|---|
//! | manifest | `public, max-age=30, s-maxage=300, stale-while-revalidate=60` |
//! | verification | `public, max-age=300, s-maxage=3600, stale-if-error=30` |
//! | negative | `no-cache, max-age=0, s-maxage=0, must-revalidate` |
//!
//! Values shown are the defaults. `stale-while-revalidate` bounds how long a
//! stale manifest may be served; past it a cache must revalidate before use.

use crate::config::{ManifestCacheConfig, VerificationCacheConfig};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CachePolicy {
    pub public: bool,
    pub no_cache: bool,
    pub no_store: bool,
    pub must_revalidate: bool,
    pub max_age: Duration,
    pub s_maxage: Option<Duration>,
    pub stale_while_revalidate: Option<Duration>,
    pub stale_if_error: Option<Duration>,
}

impl CachePolicy {
    pub fn manifest(config: &ManifestCacheConfig) -> Self {
        CachePolicy {
            public: true,
            max_age: Duration::from_secs(config.max_age_secs),
            s_maxage: Some(Duration::from_secs(config.s_maxage_secs)),
            stale_while_revalidate: Some(Duration::from_secs(config.stale_while_revalidate_secs)),
            ..CachePolicy::default()
        }
    }

    pub fn verification(config: &VerificationCacheConfig) -> Self {
        CachePolicy {
            public: true,
            max_age: Duration::from_secs(config.max_age_secs),
            s_maxage: Some(Duration::from_secs(config.s_maxage_secs)),
            stale_if_error: Some(Duration::from_secs(config.stale_if_error_secs)),
            ..CachePolicy::default()
        }
    }

    /// Zero freshness for 404s and errors
    pub fn negative() -> Self {
        CachePolicy {
            no_cache: true,
            must_revalidate: true,
            s_maxage: Some(Duration::ZERO),
            ..CachePolicy::default()
        }
    }

    pub fn header_value(&self) -> String {
        let mut parts = Vec::new();
        if self.public {
            parts.push("public".to_string());
        }
        if self.no_store {
            parts.push("no-store".to_string());
        }
        if self.no_cache {
            parts.push("no-cache".to_string());
        }
        parts.push(format!("max-age={}", self.max_age.as_secs()));
        if let Some(s) = self.s_maxage {
            parts.push(format!("s-maxage={}", s.as_secs()));
        }
        if let Some(swr) = self.stale_while_revalidate {
            parts.push(format!("stale-while-revalidate={}", swr.as_secs()));
        }
        if let Some(sie) = self.stale_if_error {
            parts.push(format!("stale-if-error={}", sie.as_secs()));
        }
        if self.must_revalidate {
            parts.push("must-revalidate".to_string());
        }
        parts.join(", ")
    }

    /// Parse a Cache-Control header; unknown directives are ignored
    pub fn parse(header: &str) -> Self {
        let mut policy = CachePolicy::default();
        for directive in header.split(',') {
            let mut kv = directive.trim().splitn(2, '=');
            let name = kv.next().unwrap_or("").trim().to_ascii_lowercase();
            let secs = kv
                .next()
                .and_then(|v| v.trim().trim_matches('"').parse::<u64>().ok())
                .map(Duration::from_secs);
            match name.as_str() {
                "public" => policy.public = true,
                "no-cache" => policy.no_cache = true,
                "no-store" => policy.no_store = true,
                "must-revalidate" => policy.must_revalidate = true,
                "max-age" => policy.max_age = secs.unwrap_or(Duration::ZERO),
                "s-maxage" => policy.s_maxage = secs,
                "stale-while-revalidate" => policy.stale_while_revalidate = secs,
                "stale-if-error" => policy.stale_if_error = secs,
                _ => {}
            }
        }
        policy
    }

    /// Freshness lifetime for a private or shared cache
    pub fn lifetime(&self, role: CacheRole) -> Duration {
        match role {
            CacheRole::Private => self.max_age,
            CacheRole::Shared => self.s_maxage.unwrap_or(self.max_age),
        }
    }

    /// Whether a cache may keep the response at all
    pub fn is_storable(&self) -> bool {
        !self.no_store
            && !self.no_cache
            && (!self.max_age.is_zero()
                || self.s_maxage.is_some_and(|s| !s.is_zero())
                || self.stale_while_revalidate.is_some_and(|s| !s.is_zero()))
    }
}

/// Which freshness directive a cache honors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheRole {
    /// Uses `max-age`
    #[default]
    Private,
    /// Uses `s-maxage`, falling back to `max-age`
    Shared,
}

/// Where an entry's age falls relative to its contract
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    /// Past its lifetime but inside the bounded stale window
    Stale,
    /// Past the stale window; must not be served without revalidation
    Expired,
}

pub fn freshness(age: Duration, lifetime: Duration, stale_window: Duration) -> Freshness {
    if age < lifetime {
        Freshness::Fresh
    } else if age < lifetime + stale_window {
        Freshness::Stale
    } else {
        Freshness::Expired
    }
}
