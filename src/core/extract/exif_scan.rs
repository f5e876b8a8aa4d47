//! EXIF reference scan
//!
//! Looks through every EXIF block the container carries for a string holding
//! a canonical manifest URL. WebP files written by this crate also carry the
//! URL as an XMP attribute, which is checked after EXIF.

use super::RecoveredPayload;
use crate::core::embed::{jpeg, png, webp, CarrierFormat};
use crate::core::exif::{scan_strings, JPEG_EXIF_PREFIX};
use crate::core::validation::ManifestReference;

fn exif_blocks(bytes: &[u8], format: CarrierFormat) -> Result<Vec<&[u8]>, String> {
    let blocks = match format {
        CarrierFormat::Jpeg => {
            let layout = jpeg::parse(bytes).map_err(|e| format!("JPEG: {}", e))?;
            layout
                .segments
                .iter()
                .filter(|s| s.marker == jpeg::APP1)
                .map(|s| layout.data(bytes, s))
                .filter_map(|data| data.strip_prefix(JPEG_EXIF_PREFIX.as_slice()))
                .collect()
        }
        CarrierFormat::Png => {
            let layout = png::parse(bytes).map_err(|e| format!("PNG: {}", e))?;
            layout
                .chunks
                .iter()
                .filter(|c| c.kind == png::EXIF_CHUNK_TYPE)
                .map(|c| &bytes[c.data_start..c.data_end])
                .collect()
        }
        CarrierFormat::WebP => {
            let chunks = webp::parse(bytes).map_err(|e| format!("WebP: {}", e))?;
            chunks
                .iter()
                .filter(|c| &c.fourcc == b"EXIF")
                .map(|c| {
                    // Some writers keep the JPEG-style prefix
                    let data = &bytes[c.data_start..c.data_end];
                    data.strip_prefix(JPEG_EXIF_PREFIX.as_slice()).unwrap_or(data)
                })
                .collect()
        }
    };
    Ok(blocks)
}

fn xmp_reference(bytes: &[u8]) -> Option<ManifestReference> {
    let chunks = webp::parse(bytes).ok()?;
    chunks
        .iter()
        .filter(|c| &c.fourcc == b"XMP ")
        .filter_map(|c| webp::read_xmp(&bytes[c.data_start..c.data_end]).reference)
        .find_map(|url| ManifestReference::parse(&url).ok())
}

pub(super) fn extract(bytes: &[u8]) -> Result<Option<RecoveredPayload>, String> {
    let format = CarrierFormat::detect(bytes).ok_or_else(|| "unrecognized container".to_string())?;
    let blocks = exif_blocks(bytes, format)?;

    let mut scan_errors = Vec::new();
    for block in &blocks {
        match scan_strings(block) {
            Ok(strings) => {
                if let Some(reference) = strings
                    .iter()
                    .find_map(|s| ManifestReference::find_in(&s.value))
                {
                    return Ok(Some(RecoveredPayload::Reference(reference)));
                }
            }
            Err(e) => scan_errors.push(e.to_string()),
        }
    }

    if format == CarrierFormat::WebP {
        if let Some(reference) = xmp_reference(bytes) {
            return Ok(Some(RecoveredPayload::Reference(reference)));
        }
    }

    match (blocks.is_empty(), scan_errors.is_empty()) {
        (true, _) => Err("no EXIF block".to_string()),
        (false, false) => Err(format!("EXIF unreadable: {}", scan_errors.join("; "))),
        (false, true) => Ok(None),
    }
}
