//! Embedded manifest frames
//!
//! Every container format carries manifest bytes as a sequence of
//! self-describing frames. The header names the manifest hash and the frame's
//! position, so frames can be reassembled and verified without trusting the
//! container around them.
//!
//! # Layout
//!
//! ```text
//! Offset  Size  Field
//! 0       4     magic "PVNC"
//! 4       1     version (1)
//! 5       2     sequence index, u16 BE, 0-based
//! 7       2     total frames, u16 BE
//! 9       32    SHA-256 of the complete manifest
//! 41      4     payload length, u32 BE
//! 45      n     payload
//! ```

use crate::core::manifest::ContentHash;
use std::collections::BTreeMap;
use thiserror::Error;

pub const FRAME_MAGIC: [u8; 4] = *b"PVNC";
pub const FRAME_VERSION: u8 = 1;
pub const FRAME_HEADER_LEN: usize = 45;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: {0} bytes")]
    Truncated(usize),

    #[error("bad frame magic")]
    BadMagic,

    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u8),

    #[error("frame {sequence} out of range (total {total})")]
    BadSequence { sequence: u16, total: u16 },

    #[error("frame declares {declared} payload bytes, {available} present")]
    LengthMismatch { declared: usize, available: usize },

    #[error("frame budget {0} bytes leaves no room for payload")]
    BudgetTooSmall(usize),

    #[error("manifest needs {0} frames, more than a u16 index allows")]
    TooManyFrames(usize),

    #[error("frames for {hash} incomplete: {present} of {total}")]
    Incomplete {
        hash: ContentHash,
        present: usize,
        total: u16,
    },

    #[error("conflicting frames for {hash} at index {sequence}")]
    Conflict { hash: ContentHash, sequence: u16 },

    #[error("reassembled bytes do not hash to {0}")]
    HashMismatch(ContentHash),

    #[error("{0} different manifests embedded")]
    Ambiguous(usize),

    #[error("no frames")]
    Empty,
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub sequence: u16,
    pub total: u16,
    pub hash: ContentHash,
    pub length: usize,
}

impl FrameHeader {
    fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < FRAME_HEADER_LEN {
            return Err(FrameError::Truncated(bytes.len()));
        }
        if bytes[0..4] != FRAME_MAGIC {
            return Err(FrameError::BadMagic);
        }
        if bytes[4] != FRAME_VERSION {
            return Err(FrameError::UnsupportedVersion(bytes[4]));
        }
        let sequence = u16::from_be_bytes([bytes[5], bytes[6]]);
        let total = u16::from_be_bytes([bytes[7], bytes[8]]);
        if total == 0 || sequence >= total {
            return Err(FrameError::BadSequence { sequence, total });
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes[9..41]);
        let length = u32::from_be_bytes([bytes[41], bytes[42], bytes[43], bytes[44]]) as usize;

        Ok(FrameHeader {
            sequence,
            total,
            hash: ContentHash::from_bytes(hash),
            length,
        })
    }
}

/// A decoded frame that owns its payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

/// Split `manifest` into frames no larger than `max_frame_len` each
pub fn encode_frames(manifest: &[u8], max_frame_len: usize) -> Result<Vec<Vec<u8>>, FrameError> {
    if max_frame_len <= FRAME_HEADER_LEN {
        return Err(FrameError::BudgetTooSmall(max_frame_len));
    }
    let per_frame = max_frame_len - FRAME_HEADER_LEN;
    let count = manifest.len().div_ceil(per_frame).max(1);
    if count > u16::MAX as usize {
        return Err(FrameError::TooManyFrames(count));
    }

    let hash = ContentHash::of(manifest);
    let mut frames = Vec::with_capacity(count);
    for sequence in 0..count {
        let start = sequence * per_frame;
        let end = (start + per_frame).min(manifest.len());
        let payload = &manifest[start..end];

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.extend_from_slice(&FRAME_MAGIC);
        frame.push(FRAME_VERSION);
        frame.extend_from_slice(&(sequence as u16).to_be_bytes());
        frame.extend_from_slice(&(count as u16).to_be_bytes());
        frame.extend_from_slice(hash.as_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(payload);
        frames.push(frame);
    }
    Ok(frames)
}

/// Total bytes `encode_frames` would produce, without encoding
pub fn framed_len(manifest_len: usize, max_frame_len: usize) -> Option<usize> {
    if max_frame_len <= FRAME_HEADER_LEN {
        return None;
    }
    let per_frame = max_frame_len - FRAME_HEADER_LEN;
    let count = manifest_len.div_ceil(per_frame).max(1);
    Some(manifest_len + count * FRAME_HEADER_LEN)
}

/// True when `bytes` start with a frame header
pub fn is_frame(bytes: &[u8]) -> bool {
    bytes.len() >= FRAME_HEADER_LEN && bytes[0..4] == FRAME_MAGIC
}

/// Decode a frame that must fill `bytes` exactly
pub fn decode_exact(bytes: &[u8]) -> Result<Frame, FrameError> {
    let header = FrameHeader::decode(bytes)?;
    let available = bytes.len() - FRAME_HEADER_LEN;
    if available != header.length {
        return Err(FrameError::LengthMismatch {
            declared: header.length,
            available,
        });
    }
    Ok(Frame {
        header,
        payload: bytes[FRAME_HEADER_LEN..].to_vec(),
    })
}

/// Decode a frame leniently, keeping whatever payload bytes survive
///
/// Returns the frame and whether the payload was cut short.
pub fn decode_lenient(bytes: &[u8]) -> Result<(Frame, bool), FrameError> {
    let header = FrameHeader::decode(bytes)?;
    let available = bytes.len() - FRAME_HEADER_LEN;
    let take = header.length.min(available);
    Ok((
        Frame {
            header,
            payload: bytes[FRAME_HEADER_LEN..FRAME_HEADER_LEN + take].to_vec(),
        },
        take < header.length,
    ))
}

/// Collects frames and rebuilds the manifest they describe
#[derive(Debug, Default)]
pub struct Reassembler {
    groups: BTreeMap<ContentHash, (u16, BTreeMap<u16, Vec<u8>>)>,
    conflicts: Vec<(ContentHash, u16)>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: Frame) {
        let FrameHeader {
            sequence,
            total,
            hash,
            ..
        } = frame.header;
        let (group_total, parts) = self
            .groups
            .entry(hash)
            .or_insert_with(|| (total, BTreeMap::new()));

        if *group_total != total {
            self.conflicts.push((hash, sequence));
            return;
        }
        match parts.get(&sequence) {
            Some(existing) if *existing != frame.payload => self.conflicts.push((hash, sequence)),
            Some(_) => {}
            None => {
                parts.insert(sequence, frame.payload);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Rebuild the single embedded manifest and verify its hash
    pub fn finish(self) -> Result<(ContentHash, Vec<u8>), FrameError> {
        if let Some((hash, sequence)) = self.conflicts.first() {
            return Err(FrameError::Conflict {
                hash: *hash,
                sequence: *sequence,
            });
        }
        if self.groups.len() > 1 {
            return Err(FrameError::Ambiguous(self.groups.len()));
        }
        let (hash, (total, parts)) = self.groups.into_iter().next().ok_or(FrameError::Empty)?;

        if parts.len() != total as usize {
            return Err(FrameError::Incomplete {
                hash,
                present: parts.len(),
                total,
            });
        }

        let bytes: Vec<u8> = parts.into_values().flatten().collect();
        if !hash.matches(&bytes) {
            return Err(FrameError::HashMismatch(hash));
        }
        Ok((hash, bytes))
    }
}
