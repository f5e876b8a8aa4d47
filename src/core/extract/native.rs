//! Native container parse: reassemble frames from their carrier locations

use super::RecoveredPayload;
use crate::core::embed::{jpeg, png, webp, CarrierFormat, PNG_CHUNK_TYPE};
use crate::core::frame::{decode_exact, is_frame, Reassembler};

pub(super) fn extract(bytes: &[u8]) -> Result<Option<RecoveredPayload>, String> {
    let format = CarrierFormat::detect(bytes).ok_or_else(|| "unrecognized container".to_string())?;
    let mut reassembler = Reassembler::new();

    match format {
        CarrierFormat::Jpeg => {
            let layout = jpeg::parse(bytes).map_err(|e| format!("JPEG: {}", e))?;
            for segment in layout.segments.iter().filter(|s| s.marker == jpeg::APP11) {
                let data = layout.data(bytes, segment);
                if is_frame(data) {
                    reassembler.push(decode_exact(data).map_err(|e| e.to_string())?);
                }
            }
        }
        CarrierFormat::Png => {
            let layout = png::parse(bytes).map_err(|e| format!("PNG: {}", e))?;
            for chunk in layout.chunks.iter().filter(|c| c.kind == PNG_CHUNK_TYPE) {
                let frame = decode_exact(&bytes[chunk.data_start..chunk.data_end])
                    .map_err(|e| e.to_string())?;
                reassembler.push(frame);
            }
        }
        CarrierFormat::WebP => {
            let chunks = webp::parse(bytes).map_err(|e| format!("WebP: {}", e))?;
            for chunk in chunks.iter().filter(|c| &c.fourcc == b"XMP ") {
                let attrs = webp::read_xmp(&bytes[chunk.data_start..chunk.data_end]);
                for encoded in &attrs.frames {
                    let raw = webp::decode_frame(encoded)
                        .ok_or_else(|| "XMP frame is not valid base64".to_string())?;
                    reassembler.push(decode_exact(&raw).map_err(|e| e.to_string())?);
                }
            }
        }
    }

    if reassembler.is_empty() {
        return Ok(None);
    }
    let (hash, manifest) = reassembler.finish().map_err(|e| e.to_string())?;
    Ok(Some(RecoveredPayload::Manifest {
        hash,
        bytes: manifest,
    }))
}
