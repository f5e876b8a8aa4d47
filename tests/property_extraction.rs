//! Property-based tests for embed/extract invariants
//!
//! Uses proptest to check that extraction is exact when it claims high
//! confidence, whatever the manifest, budget or damage

mod common;

use common::*;
use manifest_survival::config::EmbedConfig;
use manifest_survival::core::frame::FRAME_HEADER_LEN;
use manifest_survival::{extract, CarrierFormat, Confidence, Embedder, RecoveredPayload};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_jpeg_any_segment_size_roundtrips(
        manifest in proptest::collection::vec(any::<u8>(), 1..8192),
        segment in (FRAME_HEADER_LEN + 1)..4096usize,
    ) {
        let embedder = Embedder::new(EmbedConfig {
            jpeg_segment_bytes: segment,
            jpeg_max_total_bytes: usize::MAX,
            ..EmbedConfig::default()
        });
        let out = embedder.embed(&jpeg(320, 240, 256), &manifest, CarrierFormat::Jpeg);
        prop_assert!(!out.result.fallback_used);

        let result = extract(&out.bytes);
        prop_assert_eq!(result.confidence(), Confidence::High);
        let (_, bytes) = result.require_manifest().unwrap();
        prop_assert_eq!(bytes, manifest.as_slice());
    }

    #[test]
    fn prop_png_any_chunk_size_roundtrips(
        manifest in proptest::collection::vec(any::<u8>(), 1..8192),
        chunk in (FRAME_HEADER_LEN + 1)..4096usize,
    ) {
        let embedder = Embedder::new(EmbedConfig {
            png_chunk_bytes: chunk,
            ..EmbedConfig::default()
        });
        let out = embedder.embed(&png(8, 8, 64), &manifest, CarrierFormat::Png);
        prop_assert!(!out.result.fallback_used);

        let result = extract(&out.bytes);
        let (_, bytes) = result.require_manifest().unwrap();
        prop_assert_eq!(bytes, manifest.as_slice());
    }

    #[test]
    fn prop_truncation_never_yields_wrong_manifest(
        manifest in proptest::collection::vec(any::<u8>(), 1..2048),
        cut in 0.0f64..1.0,
    ) {
        let out = Embedder::default().embed(&jpeg_1080p(), &manifest, CarrierFormat::Jpeg);
        let end = (out.bytes.len() as f64 * cut) as usize;
        let result = extract(&out.bytes[..end]);

        match result.payload() {
            Some(RecoveredPayload::Manifest { bytes, .. }) => prop_assert_eq!(bytes, &manifest),
            Some(RecoveredPayload::Fragment { bytes, complete: true, .. }) => {
                prop_assert_eq!(bytes, &manifest)
            }
            _ => {}
        }
    }

    #[test]
    fn prop_arbitrary_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..4096)) {
        let result = extract(&bytes);
        prop_assert_eq!(result.attempts().len(), 3);
        prop_assert!(result.confidence() <= Confidence::Low || result.locating_hash().is_some());
    }
}
