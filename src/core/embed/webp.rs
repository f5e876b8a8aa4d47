//! WebP carrier: base64 frames inside the RIFF `XMP ` chunk
//!
//! Simple files (`VP8 ` / `VP8L`) are promoted to the extended layout so the
//! metadata chunks are legal. Canvas size comes from the bitstream header.

use super::{Degrade, FormatOutput};
use crate::config::EmbedConfig;
use crate::core::exif::build_description_tiff;
use crate::core::frame::{encode_frames, FRAME_HEADER_LEN};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use regex::Regex;
use std::sync::OnceLock;

/// XMP namespace for the manifest attributes
pub const XMP_NAMESPACE: &str = "https://ns.provenance.dev/pvnc/1.0/";

pub const VP8X_FLAG_XMP: u8 = 0x04;
pub const VP8X_FLAG_EXIF: u8 = 0x08;
pub const VP8X_FLAG_ALPHA: u8 = 0x10;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Chunk {
    pub fourcc: [u8; 4],
    pub start: usize,
    pub data_start: usize,
    pub data_end: usize,
    /// One past the padding byte, if any
    pub end: usize,
}

/// Walk the RIFF chunk list
///
/// A RIFF size larger than the buffer is an error; trailing bytes past the
/// declared size are ignored.
pub(crate) fn parse(bytes: &[u8]) -> Result<Vec<Chunk>, String> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WEBP" {
        return Err("missing RIFF/WEBP header".to_string());
    }
    let riff_size = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    let riff_end = riff_size
        .checked_add(8)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| format!("RIFF size {} overruns file of {} bytes", riff_size, bytes.len()))?;

    let mut chunks = Vec::new();
    let mut pos = 12;
    while pos + 8 <= riff_end {
        let mut fourcc = [0u8; 4];
        fourcc.copy_from_slice(&bytes[pos..pos + 4]);
        let size =
            u32::from_le_bytes([bytes[pos + 4], bytes[pos + 5], bytes[pos + 6], bytes[pos + 7]])
                as usize;
        let data_start = pos + 8;
        let data_end = data_start + size;
        if data_end > riff_end {
            return Err(format!(
                "chunk {} overruns RIFF payload",
                String::from_utf8_lossy(&fourcc)
            ));
        }
        let end = (data_end + (size & 1)).min(riff_end);
        chunks.push(Chunk {
            fourcc,
            start: pos,
            data_start,
            data_end,
            end,
        });
        pos = end;
    }
    if chunks.is_empty() {
        return Err("no chunks".to_string());
    }
    Ok(chunks)
}

fn push_chunk(out: &mut Vec<u8>, fourcc: &[u8; 4], data: &[u8]) -> usize {
    out.extend_from_slice(fourcc);
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
    if data.len() % 2 == 1 {
        out.push(0);
    }
    8 + data.len() + (data.len() & 1)
}

/// Canvas width, height and alpha presence of a simple-format bitstream
fn canvas_of(fourcc: &[u8; 4], data: &[u8]) -> Option<(u32, u32, bool)> {
    match fourcc {
        b"VP8 " => {
            // 3-byte frame tag, start code 9d 01 2a, then 14-bit dimensions
            if data.len() < 10 || data[3..6] != [0x9d, 0x01, 0x2a] {
                return None;
            }
            let w = u16::from_le_bytes([data[6], data[7]]) & 0x3fff;
            let h = u16::from_le_bytes([data[8], data[9]]) & 0x3fff;
            Some((w as u32, h as u32, false))
        }
        b"VP8L" => {
            if data.len() < 5 || data[0] != 0x2f {
                return None;
            }
            let bits = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
            let w = (bits & 0x3fff) + 1;
            let h = ((bits >> 14) & 0x3fff) + 1;
            let alpha = (bits >> 28) & 1 == 1;
            Some((w, h, alpha))
        }
        _ => None,
    }
}

fn vp8x_payload(flags: u8, width: u32, height: u32) -> [u8; 10] {
    let w = (width - 1).to_le_bytes();
    let h = (height - 1).to_le_bytes();
    [flags, 0, 0, 0, w[0], w[1], w[2], h[0], h[1], h[2]]
}

fn frames_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"pvnc:frames\s*=\s*"([A-Za-z0-9+/=\s]*)""#).expect("static regex")
    })
}

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"pvnc:reference\s*=\s*"([^"]*)""#).expect("static regex"))
}

/// Manifest attributes recovered from an XMP packet
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct XmpAttributes {
    /// Base64 frames, undecoded
    pub frames: Vec<String>,
    pub reference: Option<String>,
}

/// True when the packet was written by this embedder
pub(crate) fn is_own_packet(xmp: &[u8]) -> bool {
    let text = String::from_utf8_lossy(xmp);
    text.contains(XMP_NAMESPACE)
}

pub(crate) fn read_xmp(xmp: &[u8]) -> XmpAttributes {
    let text = String::from_utf8_lossy(xmp);
    let frames = frames_pattern()
        .captures(&text)
        .map(|c| c[1].split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();
    let reference = reference_pattern()
        .captures(&text)
        .map(|c| c[1].trim().to_string());
    XmpAttributes { frames, reference }
}

pub(crate) fn decode_frame(encoded: &str) -> Option<Vec<u8>> {
    STANDARD.decode(encoded).ok()
}

fn build_xmp(frames: &[Vec<u8>], reference_url: Option<&str>) -> Vec<u8> {
    let encoded: Vec<String> = frames.iter().map(|f| STANDARD.encode(f)).collect();
    let reference = reference_url
        .map(|url| format!(" pvnc:reference=\"{}\"", url))
        .unwrap_or_default();
    format!(
        "<?xpacket begin=\"\u{feff}\" id=\"W5M0MpCehiHzreSzNTczkc9d\"?>\
         <x:xmpmeta xmlns:x=\"adobe:ns:meta/\">\
         <rdf:RDF xmlns:rdf=\"http://www.w3.org/1999/02/22-rdf-syntax-ns#\">\
         <rdf:Description rdf:about=\"\" xmlns:pvnc=\"{}\" pvnc:frames=\"{}\"{}/>\
         </rdf:RDF></x:xmpmeta><?xpacket end=\"w\"?>",
        XMP_NAMESPACE,
        encoded.join(" "),
        reference
    )
    .into_bytes()
}

pub(crate) fn embed(
    carrier: &[u8],
    manifest: &[u8],
    config: &EmbedConfig,
    reference_url: Option<&str>,
) -> Result<FormatOutput, Degrade> {
    let chunks = parse(carrier).map_err(|e| Degrade::new(format!("malformed WebP: {}", e)))?;
    let first = chunks[0];

    let mut flags;
    let promoted = match &first.fourcc {
        b"VP8X" => {
            if first.data_end - first.data_start < 10 {
                return Err(Degrade::new("VP8X chunk shorter than 10 bytes"));
            }
            flags = carrier[first.data_start];
            None
        }
        b"VP8 " | b"VP8L" => {
            let (w, h, alpha) = canvas_of(&first.fourcc, &carrier[first.data_start..first.data_end])
                .ok_or_else(|| Degrade::new("unreadable VP8/VP8L bitstream header"))?;
            if w == 0 || h == 0 {
                return Err(Degrade::new("zero canvas dimension"));
            }
            flags = if alpha { VP8X_FLAG_ALPHA } else { 0 };
            Some((w, h))
        }
        other => {
            return Err(Degrade::new(format!(
                "unsupported WebP sub-format {}",
                String::from_utf8_lossy(other)
            )))
        }
    };

    if let Some(xmp) = chunks.iter().find(|c| &c.fourcc == b"XMP ") {
        if !is_own_packet(&carrier[xmp.data_start..xmp.data_end]) {
            return Err(Degrade::new("carrier already has a foreign XMP packet"));
        }
    }

    let frames = encode_frames(manifest, FRAME_HEADER_LEN + manifest.len().max(1))
        .map_err(|e| Degrade::new(e.to_string()))?;
    let packet = build_xmp(&frames, reference_url);
    if packet.len() > config.webp_max_total_bytes {
        return Err(Degrade::new(format!(
            "XMP packet of {} bytes exceeds budget of {}",
            packet.len(),
            config.webp_max_total_bytes
        )));
    }

    let mut warnings = Vec::new();
    let has_exif = chunks.iter().any(|c| &c.fourcc == b"EXIF");
    let exif = match reference_url {
        Some(_) if has_exif => {
            warnings.push("carrier already has EXIF; manifest reference not written".to_string());
            None
        }
        Some(url) => Some(build_description_tiff(url)),
        None => None,
    };

    flags |= VP8X_FLAG_XMP;
    if exif.is_some() {
        flags |= VP8X_FLAG_EXIF;
    }

    let mut body = Vec::with_capacity(carrier.len() + packet.len() + 64);
    body.extend_from_slice(b"WEBP");
    let mut written = 0;
    let mut superseded = false;

    match promoted {
        Some((w, h)) => {
            written += push_chunk(&mut body, b"VP8X", &vp8x_payload(flags, w, h));
        }
        None => {
            body.extend_from_slice(&carrier[first.start..first.data_start]);
            body.push(flags);
            body.extend_from_slice(&carrier[first.data_start + 1..first.end]);
        }
    }
    let rest = if promoted.is_some() { &chunks[..] } else { &chunks[1..] };
    for chunk in rest {
        if &chunk.fourcc == b"XMP " {
            superseded = true;
            continue;
        }
        body.extend_from_slice(&carrier[chunk.start..chunk.end]);
        // Odd-sized final chunk whose padding byte was missing from the source
        if chunk.end == chunk.data_end && (chunk.data_end - chunk.data_start) % 2 == 1 {
            body.push(0);
        }
    }
    if let Some(tiff) = &exif {
        written += push_chunk(&mut body, b"EXIF", tiff);
    }
    written += push_chunk(&mut body, b"XMP ", &packet);

    if superseded {
        warnings.push("replaced XMP frames from a previous manifest".to_string());
    }

    let riff_size = u32::try_from(body.len())
        .map_err(|_| Degrade::new("WebP would exceed the 4 GiB RIFF limit"))?;
    let mut out = Vec::with_capacity(body.len() + 8);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&riff_size.to_le_bytes());
    out.extend_from_slice(&body);

    Ok(FormatOutput {
        bytes: out,
        bytes_written: written,
        warnings,
    })
}
