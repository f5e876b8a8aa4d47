//! End-to-end verification scenarios

mod common;

use async_trait::async_trait;
use common::*;
use manifest_survival::{
    AssetRef, CarrierFormat, Confidence, ExtractionMethod, LocatedBy, Manifest, Provenance,
    ProvenanceError, Response, Result, SignatureCheck, SignatureVerifier, Upstream,
    VerificationStatus,
};
use std::sync::Arc;
use std::time::Duration;

struct Verdict(Option<bool>);

#[async_trait]
impl SignatureVerifier for Verdict {
    async fn verify_signature(&self, _manifest: &Manifest) -> Result<bool> {
        self.0
            .ok_or_else(|| ProvenanceError::Backend("trust list unavailable".to_string()))
    }
}

fn with_verifier(verdict: Option<bool>) -> Provenance {
    Provenance::builder()
        .signature_verifier(Arc::new(Verdict(verdict)))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_clean_jpeg_verifies_from_embedded_frames() {
    let provenance = with_verifier(Some(true));
    let signed = provenance
        .sign(&jpeg_1080p(), &manifest("did:web:newsroom.example", 12), CarrierFormat::Jpeg)
        .await
        .unwrap();
    assert!(!signed.embedded.result.fallback_used);

    let report = provenance
        .verify(&AssetRef::from_bytes(signed.embedded.bytes.clone()))
        .await;
    assert_eq!(report.status, VerificationStatus::Verified);
    assert_eq!(report.located_by, Some(LocatedBy::Embedded(ExtractionMethod::Native)));
    assert_eq!(report.signature, SignatureCheck::Valid);
    assert_eq!(report.manifest_hash, Some(signed.hash()));
    assert_eq!(report.reference, Some(signed.reference.url()));
    assert!(report.is_authentic());
    assert_eq!(
        report.manifest.unwrap().issuer,
        "did:web:newsroom.example"
    );
}

#[tokio::test]
async fn test_oversized_png_falls_back_to_remote_verification() {
    let provenance = with_verifier(Some(true));
    let carrier = png(1024, 768, 4096);
    let big = manifest("did:web:newsroom.example", 3000);

    let signed = provenance
        .sign(&carrier, &big, CarrierFormat::Png)
        .await
        .unwrap();
    assert!(signed.embedded.result.fallback_used);
    assert_eq!(signed.embedded.bytes, carrier);
    assert!(signed.embedded.result.warnings[0].contains("remote-only"));

    // The manifest was stored even though embedding degraded
    assert!(provenance.get_manifest(&signed.hash()).await.unwrap().is_some());

    let bare = provenance.verify(&AssetRef::from_bytes(carrier.clone())).await;
    assert_eq!(bare.status, VerificationStatus::NotFound);

    let linked = provenance
        .verify(&AssetRef::from_bytes(carrier).with_link(signed.link_header()))
        .await;
    assert_eq!(linked.status, VerificationStatus::Verified);
    assert_eq!(linked.located_by, Some(LocatedBy::Explicit));
    assert!(linked.is_authentic());
}

#[tokio::test]
async fn test_hostile_strip_needs_out_of_band_reference() {
    let provenance = with_verifier(Some(true));
    let signed = provenance
        .sign(&jpeg_1080p(), &manifest("did:web:newsroom.example", 4), CarrierFormat::Jpeg)
        .await
        .unwrap();

    // Drop APP11 frames and the APP1 reference
    let stripped = strip_jpeg(&signed.embedded.bytes, &[0xEB, 0xE1]);
    assert_eq!(provenance.extract(&stripped).confidence(), Confidence::None);

    let report = provenance.verify(&AssetRef::from_bytes(stripped.clone())).await;
    assert_eq!(report.status, VerificationStatus::NotFound);
    assert!(!report.diagnostics.is_empty());

    let report = provenance
        .verify(&AssetRef::from_bytes(stripped).with_link(signed.link_header()))
        .await;
    assert_eq!(report.status, VerificationStatus::Verified);
    assert_eq!(report.located_by, Some(LocatedBy::Explicit));
}

#[tokio::test]
async fn test_exif_reference_locates_after_frame_strip() {
    let provenance = Provenance::in_memory().unwrap();
    let signed = provenance
        .sign(&jpeg_1080p(), &manifest("did:web:newsroom.example", 4), CarrierFormat::Jpeg)
        .await
        .unwrap();

    let stripped = strip_jpeg(&signed.embedded.bytes, &[0xEB]);
    let report = provenance.verify(&AssetRef::from_bytes(stripped)).await;
    assert_eq!(report.status, VerificationStatus::Verified);
    assert_eq!(
        report.located_by,
        Some(LocatedBy::Embedded(ExtractionMethod::ExifReference))
    );
    assert_eq!(report.signature, SignatureCheck::Skipped);
    assert!(!report.is_authentic());
}

#[tokio::test]
async fn test_heuristic_fragment_never_locates() {
    let provenance = Provenance::in_memory().unwrap();
    let signed = provenance
        .sign(&png(64, 64, 512), &manifest("did:web:newsroom.example", 2), CarrierFormat::Png)
        .await
        .unwrap();

    // Break the final chunk CRC so container parsing fails but frames remain
    let mut damaged = signed.embedded.bytes.clone();
    let last = damaged.len() - 1;
    damaged[last] ^= 0xFF;

    let extraction = provenance.extract(&damaged);
    assert_eq!(extraction.confidence(), Confidence::Low);
    assert_eq!(extraction.method(), Some(ExtractionMethod::Heuristic));
    assert!(extraction.locating_hash().is_none());

    let report = provenance.verify(&AssetRef::from_bytes(damaged)).await;
    assert_eq!(report.status, VerificationStatus::NotFound);
    assert!(report.diagnostics.iter().any(|d| d.contains("fragment")));
}

#[tokio::test]
async fn test_reference_outside_canonical_base_is_ignored() {
    let provenance = Provenance::in_memory().unwrap();
    let bytes = manifest("did:web:newsroom.example", 1).to_canonical_bytes().unwrap();
    let receipt = provenance.put_manifest(&bytes).await.unwrap();

    let foreign = format!("https://evil.example/manifests/{}", receipt.hash);
    let report = provenance.verify(&AssetRef::from_link(foreign)).await;
    assert_eq!(report.status, VerificationStatus::NotFound);
    assert!(report.diagnostics.iter().any(|d| d.contains("outside")));
}

#[tokio::test]
async fn test_signature_outcomes() {
    let bytes = manifest("did:web:newsroom.example", 1).to_canonical_bytes().unwrap();

    let rejecting = with_verifier(Some(false));
    let receipt = rejecting.put_manifest(&bytes).await.unwrap();
    let link = rejecting.reference_for(&receipt.hash).unwrap().link_header();
    let report = rejecting.verify(&AssetRef::from_link(link)).await;
    assert_eq!(report.status, VerificationStatus::Verified);
    assert!(matches!(report.signature, SignatureCheck::Invalid(_)));
    assert!(!report.is_authentic());

    let broken = with_verifier(None);
    let receipt = broken.put_manifest(&bytes).await.unwrap();
    let link = broken.reference_for(&receipt.hash).unwrap().link_header();
    let report = broken.verify(&AssetRef::from_link(link)).await;
    assert_eq!(report.status, VerificationStatus::Unavailable);
    assert!(matches!(report.signature, SignatureCheck::Error(_)));
}

#[tokio::test]
async fn test_malformed_but_aligned_manifest_is_verified_with_invalid_signature() {
    let provenance = with_verifier(Some(true));
    let receipt = provenance.put_manifest(b"not json at all").await.unwrap();
    let link = provenance.reference_for(&receipt.hash).unwrap().link_header();

    let report = provenance.verify(&AssetRef::from_link(link)).await;
    assert_eq!(report.status, VerificationStatus::Verified);
    assert!(matches!(report.signature, SignatureCheck::Invalid(_)));
    assert!(report.manifest.is_none());
    assert!(!report.is_authentic());
}

struct Hanging;

#[async_trait]
impl Upstream for Hanging {
    async fn fetch(&self, _url: &str, _if_none_match: Option<&str>) -> Result<Response> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Response::new(404))
    }
}

#[tokio::test(start_paused = true)]
async fn test_slow_upstream_times_out_as_unavailable() {
    let provenance = Provenance::builder()
        .upstream(Arc::new(Hanging))
        .build()
        .unwrap();
    let bytes = manifest("did:web:newsroom.example", 1).to_canonical_bytes().unwrap();
    let receipt = provenance.put_manifest(&bytes).await.unwrap();
    let link = provenance.reference_for(&receipt.hash).unwrap().link_header();

    let report = provenance.verify(&AssetRef::from_link(link)).await;
    assert_eq!(report.status, VerificationStatus::Unavailable);
    assert!(report.diagnostics.iter().any(|d| d.contains("timed out")));
}

#[tokio::test]
async fn test_batch_verification_keeps_input_order() {
    let provenance = with_verifier(Some(true));
    let first = provenance
        .sign(&jpeg_1080p(), &manifest("did:web:first.example", 2), CarrierFormat::Jpeg)
        .await
        .unwrap();
    let second = provenance
        .sign(&png(64, 64, 512), &manifest("did:web:second.example", 2), CarrierFormat::Png)
        .await
        .unwrap();
    let unknown = provenance
        .reference_for(&manifest("did:web:nobody.example", 1).content_hash().unwrap())
        .unwrap()
        .link_header();

    let assets = vec![
        AssetRef::from_bytes(second.embedded.bytes.clone()),
        AssetRef::from_link(unknown),
        AssetRef::from_bytes(b"no image here".to_vec()),
        AssetRef::from_bytes(first.embedded.bytes.clone()),
    ];
    let reports = provenance.verify_many(assets, 2).await;
    let statuses: Vec<_> = reports.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![
            VerificationStatus::Verified,
            VerificationStatus::NotFound,
            VerificationStatus::NotFound,
            VerificationStatus::Verified,
        ]
    );
    assert_eq!(reports[0].manifest_hash, Some(second.hash()));
    assert_eq!(reports[3].manifest_hash, Some(first.hash()));

    // Zero concurrency still makes progress
    let reports = provenance
        .verify_many(vec![AssetRef::from_link(first.link_header())], 0)
        .await;
    assert_eq!(reports[0].status, VerificationStatus::Verified);
    assert!(provenance.verify_many(Vec::new(), 4).await.is_empty());
}

#[tokio::test]
async fn test_inspection_summarizes_embedded_and_remote_manifests() {
    let provenance = with_verifier(Some(true));
    let signed = provenance
        .sign(&jpeg_1080p(), &manifest("did:web:newsroom.example", 3), CarrierFormat::Jpeg)
        .await
        .unwrap();

    let local = provenance.inspect(&signed.embedded.bytes, false).await;
    assert_eq!(local.confidence, Confidence::High);
    assert_eq!(local.method, Some(ExtractionMethod::Native));
    assert_eq!(local.manifest_hash, Some(signed.hash()));
    assert_eq!(local.reference, Some(signed.reference.url()));
    let summary = local.summary.unwrap();
    assert_eq!(summary.issuer, "did:web:newsroom.example");
    assert_eq!(summary.assertions.len(), 3);
    assert!(local.remote.is_none());

    // Frames stripped: only the EXIF pointer is left locally
    let stripped = strip_jpeg(&signed.embedded.bytes, &[0xEB]);
    let pointer = provenance.inspect(&stripped, false).await;
    assert_eq!(pointer.confidence, Confidence::Medium);
    assert_eq!(pointer.manifest_hash, Some(signed.hash()));
    assert!(pointer.summary.is_none());

    let remote = provenance.inspect(&stripped, true).await;
    assert_eq!(
        remote.summary.as_ref().map(|s| s.issuer.as_str()),
        Some("did:web:newsroom.example")
    );
    let report = remote.remote.as_ref().unwrap();
    assert_eq!(report.status, VerificationStatus::Verified);
    assert!(report.is_authentic());

    let json = serde_json::to_value(&remote).unwrap();
    assert_eq!(json["method"], "exif_reference");
    assert_eq!(json["remote"]["status"], "verified");
}
