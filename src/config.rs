//! Runtime configuration
//!
//! Loaded from TOML. Every section has production defaults, so an empty file
//! is a valid configuration:
//!
//! ```toml
//! [resolver]
//! canonical_base = "https://manifests.example.com"
//! fetch_timeout_ms = 800
//!
//! [cache.manifest]
//! max_age_secs = 30
//! s_maxage_secs = 300
//! stale_while_revalidate_secs = 60
//! ```

use crate::core::validation::normalize_base;
use crate::error::{ProvenanceError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest data payload of one JPEG marker segment (length field minus itself)
pub const JPEG_MAX_SEGMENT_DATA: usize = 65_533;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub embed: EmbedConfig,
    pub extract: ExtractConfig,
    pub store: StoreConfig,
    pub cache: CacheConfig,
    pub purge: PurgeConfig,
    pub resolver: ResolverConfig,
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(text).map_err(|e| ProvenanceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        let embed = &self.embed;
        if embed.jpeg_segment_bytes == 0 || embed.jpeg_segment_bytes > JPEG_MAX_SEGMENT_DATA {
            return Err(ProvenanceError::Config(format!(
                "embed.jpeg_segment_bytes must be 1..={}, got {}",
                JPEG_MAX_SEGMENT_DATA, embed.jpeg_segment_bytes
            )));
        }
        if embed.png_chunk_bytes == 0 || embed.png_chunk_bytes > i32::MAX as usize {
            return Err(ProvenanceError::Config(format!(
                "embed.png_chunk_bytes must be 1..=2^31-1, got {}",
                embed.png_chunk_bytes
            )));
        }

        if self.store.memory_capacity == 0 {
            return Err(ProvenanceError::Config(
                "store.memory_capacity must be greater than 0".to_string(),
            ));
        }

        let manifest = &self.cache.manifest;
        if manifest.max_age_secs > manifest.s_maxage_secs {
            return Err(ProvenanceError::Config(format!(
                "cache.manifest.max_age_secs ({}) exceeds s_maxage_secs ({})",
                manifest.max_age_secs, manifest.s_maxage_secs
            )));
        }
        let verification = &self.cache.verification;
        if verification.max_age_secs > verification.s_maxage_secs {
            return Err(ProvenanceError::Config(format!(
                "cache.verification.max_age_secs ({}) exceeds s_maxage_secs ({})",
                verification.max_age_secs, verification.s_maxage_secs
            )));
        }
        if verification.stale_if_error_secs >= manifest.stale_while_revalidate_secs {
            return Err(ProvenanceError::Config(format!(
                "cache.verification.stale_if_error_secs ({}) must be shorter than \
                 cache.manifest.stale_while_revalidate_secs ({})",
                verification.stale_if_error_secs, manifest.stale_while_revalidate_secs
            )));
        }
        if self.cache.client_capacity == 0 {
            return Err(ProvenanceError::Config(
                "cache.client_capacity must be greater than 0".to_string(),
            ));
        }

        if self.purge.max_attempts == 0 {
            return Err(ProvenanceError::Config(
                "purge.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.purge.base_delay_ms > self.purge.max_delay_ms {
            return Err(ProvenanceError::Config(format!(
                "purge.base_delay_ms ({}) exceeds max_delay_ms ({})",
                self.purge.base_delay_ms, self.purge.max_delay_ms
            )));
        }

        normalize_base(&self.resolver.canonical_base)?;
        if self.resolver.fetch_timeout_ms == 0 {
            return Err(ProvenanceError::Config(
                "resolver.fetch_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.resolver.retry_base_delay_ms > self.resolver.retry_max_delay_ms {
            return Err(ProvenanceError::Config(format!(
                "resolver.retry_base_delay_ms ({}) exceeds retry_max_delay_ms ({})",
                self.resolver.retry_base_delay_ms, self.resolver.retry_max_delay_ms
            )));
        }
        if self.resolver.retry_max_delay_ms >= self.resolver.fetch_timeout_ms {
            return Err(ProvenanceError::Config(format!(
                "resolver.retry_max_delay_ms ({}) must be shorter than fetch_timeout_ms ({})",
                self.resolver.retry_max_delay_ms, self.resolver.fetch_timeout_ms
            )));
        }
        Ok(())
    }
}

/// Size budgets for embedded manifests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedConfig {
    /// Data bytes per APP11 segment
    pub jpeg_segment_bytes: usize,
    /// Total framed bytes allowed in a JPEG before falling back
    pub jpeg_max_total_bytes: usize,
    /// Data bytes per `pvNc` chunk
    pub png_chunk_bytes: usize,
    pub png_max_total_bytes: usize,
    /// Size of the XMP packet allowed in a WebP
    pub webp_max_total_bytes: usize,
    /// Add an EXIF block naming the manifest URL when none exists
    pub write_exif_reference: bool,
}

impl Default for EmbedConfig {
    fn default() -> Self {
        EmbedConfig {
            jpeg_segment_bytes: JPEG_MAX_SEGMENT_DATA,
            jpeg_max_total_bytes: 256 * 1024,
            png_chunk_bytes: 64 * 1024,
            png_max_total_bytes: 256 * 1024,
            webp_max_total_bytes: 256 * 1024,
            write_exif_reference: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    /// Run extraction methods on scoped threads
    pub parallel: bool,
    /// Heuristic scanning stops after this many bytes
    pub max_scan_bytes: usize,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        ExtractConfig {
            parallel: true,
            max_scan_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Entries held by the in-process tier
    pub memory_capacity: usize,
    /// Root of the filesystem tier; disabled when unset
    pub fs_root: Option<PathBuf>,
    /// Key prefix used in the durable backend
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            memory_capacity: 1024,
            fs_root: None,
            key_prefix: "manifests/".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub manifest: ManifestCacheConfig,
    pub verification: VerificationCacheConfig,
    /// Entries tracked by the caching client
    pub client_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            manifest: ManifestCacheConfig::default(),
            verification: VerificationCacheConfig::default(),
            client_capacity: 4096,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestCacheConfig {
    pub max_age_secs: u64,
    pub s_maxage_secs: u64,
    pub stale_while_revalidate_secs: u64,
}

impl Default for ManifestCacheConfig {
    fn default() -> Self {
        ManifestCacheConfig {
            max_age_secs: 30,
            s_maxage_secs: 300,
            stale_while_revalidate_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationCacheConfig {
    pub max_age_secs: u64,
    pub s_maxage_secs: u64,
    pub stale_if_error_secs: u64,
}

impl Default for VerificationCacheConfig {
    fn default() -> Self {
        VerificationCacheConfig {
            max_age_secs: 300,
            s_maxage_secs: 3600,
            stale_if_error_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PurgeConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
    /// Per-attempt deadline for a CDN purge call
    pub attempt_timeout_ms: u64,
}

impl PurgeConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

impl Default for PurgeConfig {
    fn default() -> Self {
        PurgeConfig {
            max_attempts: 5,
            base_delay_ms: 250,
            max_delay_ms: 5_000,
            jitter: true,
            attempt_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Origin under which every canonical manifest URL lives
    pub canonical_base: String,
    /// Hard bound on one manifest fetch, retries included
    pub fetch_timeout_ms: u64,
    /// Extra attempts after a transient upstream failure
    pub fetch_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Consecutive failed fetches that open the circuit; 0 disables it
    pub breaker_threshold: u32,
    /// How long an open circuit rejects fetches before allowing a trial
    pub breaker_cooldown_ms: u64,
}

impl ResolverConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_millis(self.breaker_cooldown_ms)
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            canonical_base: "https://manifests.example.com".to_string(),
            fetch_timeout_ms: 800,
            fetch_retries: 2,
            retry_base_delay_ms: 50,
            retry_max_delay_ms: 200,
            breaker_threshold: 5,
            breaker_cooldown_ms: 30_000,
        }
    }
}
