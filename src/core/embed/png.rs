//! PNG carrier: frames in private `pvNc` chunks before the first IDAT
//!
//! `pvNc` is ancillary, private and safe-to-copy, so conforming editors that
//! do not understand it are allowed to carry it through unchanged.

use super::{Degrade, FormatOutput};
use crate::config::EmbedConfig;
use crate::core::exif::build_description_tiff;
use crate::core::frame::{encode_frames, framed_len, is_frame};

pub const PNG_SIGNATURE: &[u8; 8] = b"\x89PNG\r\n\x1a\n";
pub const PNG_CHUNK_TYPE: [u8; 4] = *b"pvNc";
pub const EXIF_CHUNK_TYPE: [u8; 4] = *b"eXIf";

/// One chunk; offsets index into the source buffer
#[derive(Debug, Clone, Copy)]
pub(crate) struct Chunk {
    pub kind: [u8; 4],
    pub start: usize,
    pub data_start: usize,
    pub data_end: usize,
    /// One past the CRC
    pub end: usize,
}

#[derive(Debug)]
pub(crate) struct Layout {
    pub chunks: Vec<Chunk>,
    /// Bytes after IEND, kept verbatim
    pub trailer_start: usize,
}

pub(crate) fn chunk_crc(kind: &[u8; 4], data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(kind);
    hasher.update(data);
    hasher.finalize()
}

/// Walk every chunk through IEND, verifying each CRC
pub(crate) fn parse(bytes: &[u8]) -> Result<Layout, String> {
    if !bytes.starts_with(PNG_SIGNATURE) {
        return Err("missing PNG signature".to_string());
    }
    let mut chunks = Vec::new();
    let mut pos = PNG_SIGNATURE.len();

    loop {
        let header = bytes
            .get(pos..pos + 8)
            .ok_or_else(|| "truncated chunk header".to_string())?;
        let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if length > i32::MAX as usize {
            return Err(format!("chunk length {} exceeds 2^31-1", length));
        }
        let mut kind = [0u8; 4];
        kind.copy_from_slice(&header[4..8]);

        let data_start = pos + 8;
        let data_end = data_start + length;
        let end = data_end + 4;
        let crc_bytes = bytes
            .get(data_end..end)
            .ok_or_else(|| format!("chunk {} overruns file", String::from_utf8_lossy(&kind)))?;
        let stored = u32::from_be_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        if stored != chunk_crc(&kind, &bytes[data_start..data_end]) {
            return Err(format!("CRC mismatch in {} chunk", String::from_utf8_lossy(&kind)));
        }

        if chunks.is_empty() && &kind != b"IHDR" {
            return Err("first chunk is not IHDR".to_string());
        }
        chunks.push(Chunk {
            kind,
            start: pos,
            data_start,
            data_end,
            end,
        });
        pos = end;

        if &kind == b"IEND" {
            return Ok(Layout {
                chunks,
                trailer_start: pos,
            });
        }
    }
}

pub(crate) fn push_chunk(out: &mut Vec<u8>, kind: &[u8; 4], data: &[u8]) -> usize {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(kind);
    out.extend_from_slice(data);
    out.extend_from_slice(&chunk_crc(kind, data).to_be_bytes());
    data.len() + 12
}

pub(crate) fn embed(
    carrier: &[u8],
    manifest: &[u8],
    config: &EmbedConfig,
    reference_url: Option<&str>,
) -> Result<FormatOutput, Degrade> {
    let layout = parse(carrier).map_err(|e| Degrade::new(format!("malformed PNG: {}", e)))?;
    let first_idat = layout
        .chunks
        .iter()
        .position(|c| &c.kind == b"IDAT")
        .ok_or_else(|| Degrade::new("PNG has no IDAT chunk"))?;

    let total = framed_len(manifest.len(), config.png_chunk_bytes)
        .ok_or_else(|| Degrade::new("PNG chunk budget smaller than a frame header"))?;
    if total > config.png_max_total_bytes {
        return Err(Degrade::new(format!(
            "manifest needs {} bytes of pvNc frames, budget is {}",
            total, config.png_max_total_bytes
        )));
    }
    let frames =
        encode_frames(manifest, config.png_chunk_bytes).map_err(|e| Degrade::new(e.to_string()))?;

    let mut warnings = Vec::new();
    let has_exif = layout.chunks.iter().any(|c| c.kind == EXIF_CHUNK_TYPE);
    let exif = match reference_url {
        Some(_) if has_exif => {
            warnings.push("carrier already has EXIF; manifest reference not written".to_string());
            None
        }
        Some(url) => Some(build_description_tiff(url)),
        None => None,
    };

    let mut out = Vec::with_capacity(carrier.len() + total + frames.len() * 12 + 64);
    out.extend_from_slice(PNG_SIGNATURE);
    let mut written = 0;
    let mut superseded = 0;

    for (index, chunk) in layout.chunks.iter().enumerate() {
        if index == first_idat {
            if let Some(tiff) = &exif {
                written += push_chunk(&mut out, &EXIF_CHUNK_TYPE, tiff);
            }
            for frame in &frames {
                written += push_chunk(&mut out, &PNG_CHUNK_TYPE, frame);
            }
        }
        if chunk.kind == PNG_CHUNK_TYPE && is_frame(&carrier[chunk.data_start..chunk.data_end]) {
            superseded += 1;
            continue;
        }
        out.extend_from_slice(&carrier[chunk.start..chunk.end]);
    }
    out.extend_from_slice(&carrier[layout.trailer_start..]);

    if superseded > 0 {
        warnings.push(format!(
            "replaced {} pvNc frame(s) from a previous manifest",
            superseded
        ));
    }

    Ok(FormatOutput {
        bytes: out,
        bytes_written: written,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::frame::FRAME_HEADER_LEN;

    fn tiny_png() -> Vec<u8> {
        let mut p = PNG_SIGNATURE.to_vec();
        let mut ihdr = Vec::new();
        ihdr.extend_from_slice(&1u32.to_be_bytes());
        ihdr.extend_from_slice(&1u32.to_be_bytes());
        ihdr.extend_from_slice(&[8, 0, 0, 0, 0]);
        push_chunk(&mut p, b"IHDR", &ihdr);
        push_chunk(&mut p, b"IDAT", &[0x78, 0x9c, 0x63, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01]);
        push_chunk(&mut p, b"IEND", &[]);
        p
    }

    fn kinds(bytes: &[u8]) -> Vec<[u8; 4]> {
        parse(bytes).unwrap().chunks.iter().map(|c| c.kind).collect()
    }

    #[test]
    fn test_frames_precede_idat() {
        let out = embed(&tiny_png(), b"manifest", &EmbedConfig::default(), None).unwrap();
        assert_eq!(kinds(&out.bytes), vec![*b"IHDR", PNG_CHUNK_TYPE, *b"IDAT", *b"IEND"]);
        assert_eq!(out.bytes_written, 12 + FRAME_HEADER_LEN + 8);
    }

    #[test]
    fn test_split_by_chunk_size() {
        let config = EmbedConfig {
            png_chunk_bytes: FRAME_HEADER_LEN + 4,
            ..EmbedConfig::default()
        };
        let out = embed(&tiny_png(), b"0123456789", &config, None).unwrap();
        let n = kinds(&out.bytes).iter().filter(|k| **k == PNG_CHUNK_TYPE).count();
        assert_eq!(n, 3);
    }

    #[test]
    fn test_crc_corruption_rejected() {
        let mut png = tiny_png();
        // Flip a bit inside IHDR data
        png[17] ^= 0x01;
        assert!(parse(&png).unwrap_err().contains("CRC"));
        assert!(embed(&png, b"m", &EmbedConfig::default(), None).is_err());
    }

    #[test]
    fn test_oversized_degrades() {
        let config = EmbedConfig {
            png_max_total_bytes: 1024,
            ..EmbedConfig::default()
        };
        assert!(embed(&tiny_png(), &[1u8; 4096], &config, None).is_err());
    }

    #[test]
    fn test_exif_reference_and_resign() {
        let config = EmbedConfig::default();
        let url = Some("https://m.example.com/manifests/ab");
        let first = embed(&tiny_png(), b"one", &config, url).unwrap();
        assert_eq!(
            kinds(&first.bytes),
            vec![*b"IHDR", EXIF_CHUNK_TYPE, PNG_CHUNK_TYPE, *b"IDAT", *b"IEND"]
        );

        let second = embed(&first.bytes, b"two", &config, url).unwrap();
        assert_eq!(kinds(&second.bytes).len(), 5);
        assert_eq!(second.warnings.len(), 2);
    }
}
