//! Shared fixtures: synthetic carriers and a simulated CDN edge

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use manifest_survival::core::cache::HEADER_CACHE_TAG;
use manifest_survival::{
    Assertion, CacheRole, CdnPurger, Clock, Manifest, ProvenanceError, Response, Result, Upstream,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub const BASE: &str = "https://manifests.example.com";

/// Deterministic filler that never contains 0xFF, so JPEG scans need no stuffing
fn filler(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i as u32).wrapping_mul(31).wrapping_add(seed as u32) % 0xFF) as u8)
        .collect()
}

fn push_jpeg_segment(out: &mut Vec<u8>, marker: u8, data: &[u8]) {
    out.extend_from_slice(&[0xFF, marker]);
    out.extend_from_slice(&((data.len() + 2) as u16).to_be_bytes());
    out.extend_from_slice(data);
}

/// Baseline JPEG skeleton with a SOF0 header for `width` x `height`
pub fn jpeg(width: u16, height: u16, scan_len: usize) -> Vec<u8> {
    let mut out = vec![0xFF, 0xD8];
    push_jpeg_segment(&mut out, 0xE0, b"JFIF\0\x01\x01\0\0\x48\0\x48\0\0");
    push_jpeg_segment(&mut out, 0xDB, &filler(65, 1));

    let mut sof = vec![8];
    sof.extend_from_slice(&height.to_be_bytes());
    sof.extend_from_slice(&width.to_be_bytes());
    sof.extend_from_slice(&[3, 1, 0x22, 0, 2, 0x11, 1, 3, 0x11, 1]);
    push_jpeg_segment(&mut out, 0xC0, &sof);

    push_jpeg_segment(&mut out, 0xDA, &[3, 1, 0, 2, 0x11, 3, 0x11, 0, 0x3F, 0]);
    out.extend_from_slice(&filler(scan_len, 7));
    out.extend_from_slice(&[0xFF, 0xD9]);
    out
}

pub fn jpeg_1080p() -> Vec<u8> {
    jpeg(1920, 1080, 4096)
}

fn push_png_chunk(out: &mut Vec<u8>, kind: &[u8; 4], data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(kind);
    out.extend_from_slice(data);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(kind);
    hasher.update(data);
    out.extend_from_slice(&hasher.finalize().to_be_bytes());
}

/// RGB PNG with one IDAT of `idat_len` bytes
pub fn png(width: u32, height: u32, idat_len: usize) -> Vec<u8> {
    let mut out = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    let mut ihdr = Vec::new();
    ihdr.extend_from_slice(&width.to_be_bytes());
    ihdr.extend_from_slice(&height.to_be_bytes());
    ihdr.extend_from_slice(&[8, 2, 0, 0, 0]);
    push_png_chunk(&mut out, b"IHDR", &ihdr);
    push_png_chunk(&mut out, b"IDAT", &filler(idat_len, 3));
    push_png_chunk(&mut out, b"IEND", &[]);
    out
}

fn riff(chunks: &[(&[u8; 4], Vec<u8>)]) -> Vec<u8> {
    let mut body = b"WEBP".to_vec();
    for (fourcc, data) in chunks {
        body.extend_from_slice(*fourcc);
        body.extend_from_slice(&(data.len() as u32).to_le_bytes());
        body.extend_from_slice(data);
        if data.len() % 2 == 1 {
            body.push(0);
        }
    }
    let mut out = b"RIFF".to_vec();
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    out
}

/// Simple lossless WebP
pub fn webp_lossless(width: u32, height: u32) -> Vec<u8> {
    let bits = (width - 1) | ((height - 1) << 14);
    let mut data = vec![0x2F];
    data.extend_from_slice(&bits.to_le_bytes());
    data.extend_from_slice(&filler(64, 5));
    riff(&[(b"VP8L", data)])
}

/// Simple lossy WebP
pub fn webp_lossy(width: u16, height: u16) -> Vec<u8> {
    let mut data = vec![0x10, 0x02, 0x00, 0x9D, 0x01, 0x2A];
    data.extend_from_slice(&width.to_le_bytes());
    data.extend_from_slice(&height.to_le_bytes());
    data.extend_from_slice(&filler(128, 9));
    riff(&[(b"VP8 ", data)])
}

/// Deterministic manifest with `assertions` padded assertions, roughly 100 bytes each
pub fn manifest(issuer: &str, assertions: usize) -> Manifest {
    let created_at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    let base = Manifest::new(issuer).with_created_at(created_at);
    (0..assertions).fold(base, |m, i| {
        m.with_assertion(Assertion::new(
            "c2pa.actions",
            serde_json::json!({ "action": "edited", "step": i, "note": "x".repeat(48) }),
        ))
    })
}

/// Shared cache in front of an origin
///
/// Honors `s-maxage`, answers conditional requests, and can be taken down or
/// made to reject purges.
pub struct SimulatedEdge {
    origin: Mutex<Option<Arc<dyn Upstream>>>,
    clock: Arc<dyn Clock>,
    cached: Mutex<HashMap<String, (Response, Instant)>>,
    down: AtomicBool,
    fetch_failures: AtomicU32,
    purge_failures: AtomicU32,
    pub origin_fetches: AtomicUsize,
    pub purged_tags: Mutex<Vec<String>>,
}

impl SimulatedEdge {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        SimulatedEdge {
            origin: Mutex::new(None),
            clock,
            cached: Mutex::new(HashMap::new()),
            down: AtomicBool::new(false),
            fetch_failures: AtomicU32::new(0),
            purge_failures: AtomicU32::new(0),
            origin_fetches: AtomicUsize::new(0),
            purged_tags: Mutex::new(Vec::new()),
        }
    }

    pub fn attach(&self, origin: Arc<dyn Upstream>) {
        *self.origin.lock() = Some(origin);
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Answer the next `n` fetches with 503
    pub fn fail_fetches(&self, n: u32) {
        self.fetch_failures.store(n, Ordering::SeqCst);
    }

    /// Reject the next `n` purge calls
    pub fn fail_purges(&self, n: u32) {
        self.purge_failures.store(n, Ordering::SeqCst);
    }

    pub fn is_cached(&self, url: &str) -> bool {
        self.cached.lock().contains_key(url)
    }

    fn answer(response: &Response, if_none_match: Option<&str>) -> Response {
        match (response.etag(), if_none_match) {
            (Some(etag), Some(inm)) if response.status == 200 && etag.matches_if_none_match(inm) => {
                response.not_modified()
            }
            _ => response.clone(),
        }
    }
}

#[async_trait]
impl Upstream for SimulatedEdge {
    async fn fetch(&self, url: &str, if_none_match: Option<&str>) -> Result<Response> {
        if self.down.load(Ordering::SeqCst) {
            return Err(ProvenanceError::Backend("edge unreachable".to_string()));
        }
        let left = self.fetch_failures.load(Ordering::SeqCst);
        if left > 0 {
            self.fetch_failures.store(left - 1, Ordering::SeqCst);
            return Ok(Response::new(503));
        }
        let now = self.clock.now();
        let hit = {
            let cached = self.cached.lock();
            cached
                .get(url)
                .filter(|(response, stored_at)| {
                    let lifetime = response.cache_policy().lifetime(CacheRole::Shared);
                    now.saturating_duration_since(*stored_at) < lifetime
                })
                .map(|(response, _)| Self::answer(response, if_none_match))
        };
        if let Some(response) = hit {
            return Ok(response);
        }

        let origin = { self.origin.lock().clone() }
            .ok_or_else(|| ProvenanceError::Backend("edge has no origin".to_string()))?;
        self.origin_fetches.fetch_add(1, Ordering::SeqCst);
        let response = origin.fetch(url, None).await?;
        if response.status == 200 && response.cache_policy().is_storable() {
            self.cached
                .lock()
                .insert(url.to_string(), (response.clone(), now));
        } else {
            self.cached.lock().remove(url);
        }
        Ok(Self::answer(&response, if_none_match))
    }
}

#[async_trait]
impl CdnPurger for SimulatedEdge {
    async fn purge_urls(&self, urls: &[String]) -> Result<()> {
        let left = self.purge_failures.load(Ordering::SeqCst);
        if left > 0 {
            self.purge_failures.store(left - 1, Ordering::SeqCst);
            return Err(ProvenanceError::Backend("purge API returned 500".to_string()));
        }
        let mut cached = self.cached.lock();
        for url in urls {
            cached.remove(url);
        }
        Ok(())
    }

    async fn purge_tags(&self, tags: &[String]) -> Result<()> {
        self.purged_tags.lock().extend(tags.iter().cloned());
        self.cached.lock().retain(|_, (response, _)| {
            response
                .header(HEADER_CACHE_TAG)
                .map(|v| !v.split_whitespace().any(|t| tags.iter().any(|g| g == t)))
                .unwrap_or(true)
        });
        Ok(())
    }
}

/// Drop JPEG segments with the given markers, as metadata-stripping optimizers do
pub fn strip_jpeg(bytes: &[u8], markers: &[u8]) -> Vec<u8> {
    let mut out = bytes[..2].to_vec();
    let mut pos = 2;
    while pos + 4 <= bytes.len() {
        let marker = bytes[pos + 1];
        let len = u16::from_be_bytes([bytes[pos + 2], bytes[pos + 3]]) as usize;
        let end = pos + 2 + len;
        if marker == 0xDA {
            out.extend_from_slice(&bytes[pos..]);
            return out;
        }
        if !markers.contains(&marker) {
            out.extend_from_slice(&bytes[pos..end]);
        }
        pos = end;
    }
    out
}

/// Drop PNG chunks of the given types
pub fn strip_png(bytes: &[u8], kinds: &[[u8; 4]]) -> Vec<u8> {
    let mut out = bytes[..8].to_vec();
    let mut pos = 8;
    while pos + 12 <= bytes.len() {
        let len = u32::from_be_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]])
            as usize;
        let end = pos + 12 + len;
        let kind = [bytes[pos + 4], bytes[pos + 5], bytes[pos + 6], bytes[pos + 7]];
        if !kinds.contains(&kind) {
            out.extend_from_slice(&bytes[pos..end]);
        }
        pos = end;
    }
    out
}

/// JPEG whose APP1 already holds a camera EXIF block
pub fn jpeg_with_camera_exif() -> Vec<u8> {
    let plain = jpeg_1080p();
    let mut out = plain[..2].to_vec();
    let mut exif = b"Exif\0\0".to_vec();
    exif.extend_from_slice(b"II*\0\x08\0\0\0\0\0\0\0\0\0");
    push_jpeg_segment(&mut out, 0xE1, &exif);
    out.extend_from_slice(&plain[2..]);
    out
}
