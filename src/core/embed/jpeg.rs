//! JPEG carrier: frames in APP11 segments right after SOI

use super::{Degrade, FormatOutput};
use crate::config::{EmbedConfig, JPEG_MAX_SEGMENT_DATA};
use crate::core::exif::{build_description_tiff, JPEG_EXIF_PREFIX};
use crate::core::frame::{encode_frames, framed_len, is_frame};

pub const SOI: u8 = 0xD8;
pub const EOI: u8 = 0xD9;
pub const SOS: u8 = 0xDA;
pub const APP1: u8 = 0xE1;
pub const APP11: u8 = 0xEB;

/// One marker segment before the scan data
#[derive(Debug, Clone, Copy)]
pub(crate) struct Segment {
    pub marker: u8,
    /// Offset of the 0xFF marker byte
    pub start: usize,
    /// Offset one past the segment
    pub end: usize,
    /// Offset of the segment data (after the length field)
    pub data_start: usize,
}

/// Parsed layout: header segments plus the offset where scan data begins
#[derive(Debug)]
pub(crate) struct Layout {
    pub segments: Vec<Segment>,
    pub tail_start: usize,
}

impl Layout {
    pub fn data<'a>(&self, bytes: &'a [u8], segment: &Segment) -> &'a [u8] {
        &bytes[segment.data_start..segment.end]
    }

    pub fn has_exif(&self, bytes: &[u8]) -> bool {
        self.segments
            .iter()
            .any(|s| s.marker == APP1 && self.data(bytes, s).starts_with(JPEG_EXIF_PREFIX))
    }
}

/// Walk marker segments from SOI up to SOS
pub(crate) fn parse(bytes: &[u8]) -> Result<Layout, &'static str> {
    if bytes.len() < 4 || bytes[0] != 0xFF || bytes[1] != SOI {
        return Err("missing SOI marker");
    }

    let mut segments = Vec::new();
    let mut pos = 2;
    loop {
        if pos >= bytes.len() {
            return Err("truncated before start of scan");
        }
        if bytes[pos] != 0xFF {
            return Err("expected marker");
        }
        let start = pos;
        // Fill bytes
        while pos < bytes.len() && bytes[pos] == 0xFF {
            pos += 1;
        }
        let Some(&marker) = bytes.get(pos) else {
            return Err("truncated marker");
        };
        pos += 1;

        match marker {
            0x01 | 0xD0..=0xD7 => continue,
            EOI => {
                return Ok(Layout {
                    segments,
                    tail_start: start,
                })
            }
            0x00 | SOI => return Err("unexpected marker"),
            _ => {}
        }

        let len_bytes = bytes.get(pos..pos + 2).ok_or("truncated segment length")?;
        let length = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
        if length < 2 {
            return Err("segment length below 2");
        }
        let end = pos + length;
        if end > bytes.len() {
            return Err("segment overruns file");
        }
        segments.push(Segment {
            marker,
            start,
            end,
            data_start: pos + 2,
        });
        pos = end;

        if marker == SOS {
            return Ok(Layout {
                segments,
                tail_start: pos,
            });
        }
    }
}

fn push_segment(out: &mut Vec<u8>, marker: u8, data: &[u8]) -> usize {
    out.push(0xFF);
    out.push(marker);
    out.extend_from_slice(&((data.len() + 2) as u16).to_be_bytes());
    out.extend_from_slice(data);
    data.len() + 4
}

pub(crate) fn embed(
    carrier: &[u8],
    manifest: &[u8],
    config: &EmbedConfig,
    reference_url: Option<&str>,
) -> Result<FormatOutput, Degrade> {
    let layout = parse(carrier).map_err(|e| Degrade::new(format!("malformed JPEG: {}", e)))?;

    let segment_bytes = config.jpeg_segment_bytes.min(JPEG_MAX_SEGMENT_DATA);
    let total = framed_len(manifest.len(), segment_bytes)
        .ok_or_else(|| Degrade::new("JPEG segment budget smaller than a frame header"))?;
    if total > config.jpeg_max_total_bytes {
        return Err(Degrade::new(format!(
            "manifest needs {} bytes of APP11 frames, budget is {}",
            total, config.jpeg_max_total_bytes
        )));
    }
    let frames = encode_frames(manifest, segment_bytes).map_err(|e| Degrade::new(e.to_string()))?;

    let mut warnings = Vec::new();
    let exif = match reference_url {
        Some(_) if layout.has_exif(carrier) => {
            warnings.push("carrier already has EXIF; manifest reference not written".to_string());
            None
        }
        Some(url) => {
            let mut data = JPEG_EXIF_PREFIX.to_vec();
            data.extend_from_slice(&build_description_tiff(url));
            if data.len() > JPEG_MAX_SEGMENT_DATA {
                warnings.push("manifest reference too long for an APP1 segment".to_string());
                None
            } else {
                Some(data)
            }
        }
        None => None,
    };

    let mut out = Vec::with_capacity(carrier.len() + total + 64);
    out.extend_from_slice(&[0xFF, SOI]);
    let mut written = 0;
    for frame in &frames {
        written += push_segment(&mut out, APP11, frame);
    }
    if let Some(data) = &exif {
        written += push_segment(&mut out, APP1, data);
    }

    let mut superseded = 0;
    for segment in &layout.segments {
        if segment.marker == APP11 && is_frame(layout.data(carrier, segment)) {
            superseded += 1;
            continue;
        }
        out.extend_from_slice(&carrier[segment.start..segment.end]);
    }
    out.extend_from_slice(&carrier[layout.tail_start..]);

    if superseded > 0 {
        warnings.push(format!(
            "replaced {} APP11 frame(s) from a previous manifest",
            superseded
        ));
    }

    Ok(FormatOutput {
        bytes: out,
        bytes_written: written,
        warnings,
    })
}
