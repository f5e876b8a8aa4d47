//! Minimal EXIF (TIFF) support
//!
//! Writes a one-entry IFD0 holding a manifest reference in `ImageDescription`,
//! and scans arbitrary EXIF blocks for string values. The scanner is
//! bounds-checked throughout and treats every offset as untrusted.

use std::collections::HashSet;
use thiserror::Error;

/// Prefix of an EXIF payload inside a JPEG APP1 segment
pub const JPEG_EXIF_PREFIX: &[u8; 6] = b"Exif\0\0";

pub const TAG_IMAGE_DESCRIPTION: u16 = 0x010E;
pub const TAG_EXIF_IFD: u16 = 0x8769;
pub const TAG_USER_COMMENT: u16 = 0x9286;

const TYPE_ASCII: u16 = 2;
const TYPE_LONG: u16 = 4;
const TYPE_UNDEFINED: u16 = 7;

const MAX_IFDS: usize = 8;
const MAX_ENTRIES: usize = 512;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExifError {
    #[error("TIFF header truncated")]
    Truncated,

    #[error("unknown byte order marker")]
    BadByteOrder,

    #[error("TIFF magic is not 42")]
    BadMagic,

    #[error("IFD offset {0} out of bounds")]
    BadOffset(u32),
}

/// Where a string value was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfdKind {
    Primary,
    Exif,
    Thumbnail,
}

/// A string-typed EXIF value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExifString {
    pub ifd: IfdKind,
    pub tag: u16,
    pub value: String,
}

/// Build a big-endian TIFF block whose IFD0 holds `description`
///
/// # Layout
///
/// ```text
/// 0   "MM" 0x002A, IFD0 offset = 8
/// 8   entry count = 1
/// 10  ImageDescription, ASCII, count, value offset = 26
/// 22  next IFD = 0
/// 26  description bytes + NUL
/// ```
pub fn build_description_tiff(description: &str) -> Vec<u8> {
    let mut value = description.as_bytes().to_vec();
    value.push(0);

    let mut tiff = Vec::with_capacity(26 + value.len());
    tiff.extend_from_slice(b"MM");
    tiff.extend_from_slice(&42u16.to_be_bytes());
    tiff.extend_from_slice(&8u32.to_be_bytes());
    tiff.extend_from_slice(&1u16.to_be_bytes());
    tiff.extend_from_slice(&TAG_IMAGE_DESCRIPTION.to_be_bytes());
    tiff.extend_from_slice(&TYPE_ASCII.to_be_bytes());
    tiff.extend_from_slice(&(value.len() as u32).to_be_bytes());
    if value.len() <= 4 {
        let mut inline = [0u8; 4];
        inline[..value.len()].copy_from_slice(&value);
        tiff.extend_from_slice(&inline);
        tiff.extend_from_slice(&0u32.to_be_bytes());
    } else {
        tiff.extend_from_slice(&26u32.to_be_bytes());
        tiff.extend_from_slice(&0u32.to_be_bytes());
        tiff.extend_from_slice(&value);
    }
    tiff
}

#[derive(Clone, Copy)]
enum ByteOrder {
    Little,
    Big,
}

struct Reader<'a> {
    data: &'a [u8],
    order: ByteOrder,
}

impl<'a> Reader<'a> {
    fn u16_at(&self, offset: usize) -> Option<u16> {
        let b = self.data.get(offset..offset.checked_add(2)?)?;
        Some(match self.order {
            ByteOrder::Little => u16::from_le_bytes([b[0], b[1]]),
            ByteOrder::Big => u16::from_be_bytes([b[0], b[1]]),
        })
    }

    fn u32_at(&self, offset: usize) -> Option<u32> {
        let b = self.data.get(offset..offset.checked_add(4)?)?;
        Some(match self.order {
            ByteOrder::Little => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            ByteOrder::Big => u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
        })
    }
}

/// Collect every ASCII and UNDEFINED value from IFD0, the Exif IFD and IFD1
pub fn scan_strings(tiff: &[u8]) -> Result<Vec<ExifString>, ExifError> {
    if tiff.len() < 8 {
        return Err(ExifError::Truncated);
    }
    let order = match &tiff[0..2] {
        b"II" => ByteOrder::Little,
        b"MM" => ByteOrder::Big,
        _ => return Err(ExifError::BadByteOrder),
    };
    let reader = Reader { data: tiff, order };
    if reader.u16_at(2) != Some(42) {
        return Err(ExifError::BadMagic);
    }
    let first = reader.u32_at(4).ok_or(ExifError::Truncated)?;
    if first as usize >= tiff.len() {
        return Err(ExifError::BadOffset(first));
    }

    let mut out = Vec::new();
    let mut visited = HashSet::new();
    let mut queue = vec![(first, IfdKind::Primary)];

    while let Some((offset, kind)) = queue.pop() {
        if visited.len() >= MAX_IFDS || !visited.insert(offset) {
            continue;
        }
        let Some(next) = scan_ifd(&reader, offset as usize, kind, &mut out, &mut queue) else {
            continue;
        };
        if next != 0 && kind == IfdKind::Primary {
            queue.push((next, IfdKind::Thumbnail));
        }
    }
    Ok(out)
}

fn scan_ifd(
    reader: &Reader<'_>,
    offset: usize,
    kind: IfdKind,
    out: &mut Vec<ExifString>,
    queue: &mut Vec<(u32, IfdKind)>,
) -> Option<u32> {
    let count = (reader.u16_at(offset)? as usize).min(MAX_ENTRIES);

    for i in 0..count {
        let entry = offset + 2 + i * 12;
        let (Some(tag), Some(typ), Some(n)) = (
            reader.u16_at(entry),
            reader.u16_at(entry + 2),
            reader.u32_at(entry + 4),
        ) else {
            break;
        };
        let n = n as usize;

        match typ {
            TYPE_LONG if tag == TAG_EXIF_IFD && n == 1 => {
                if let Some(sub) = reader.u32_at(entry + 8) {
                    queue.push((sub, IfdKind::Exif));
                }
            }
            TYPE_ASCII | TYPE_UNDEFINED => {
                let raw = if n <= 4 {
                    reader.data.get(entry + 8..entry + 8 + n)
                } else {
                    reader
                        .u32_at(entry + 8)
                        .and_then(|at| reader.data.get(at as usize..(at as usize).checked_add(n)?))
                };
                if let Some(raw) = raw {
                    let value = decode_string(tag, raw);
                    if !value.is_empty() {
                        out.push(ExifString { ifd: kind, tag, value });
                    }
                }
            }
            _ => {}
        }
    }

    reader.u32_at(offset + 2 + count * 12)
}

fn decode_string(tag: u16, raw: &[u8]) -> String {
    // UserComment carries an 8-byte character code prefix
    let body = if tag == TAG_USER_COMMENT && raw.len() >= 8 {
        &raw[8..]
    } else {
        raw
    };
    let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
    String::from_utf8_lossy(&body[..end]).trim().to_string()
}
