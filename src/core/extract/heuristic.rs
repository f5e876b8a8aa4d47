//! Heuristic byte scan
//!
//! Ignores container structure entirely and searches the raw bytes for frame
//! headers, both binary and base64 inside XMP text. This survives containers
//! that were re-wrapped or truncated, but whatever it finds is only ever a
//! fragment.

use super::RecoveredPayload;
use crate::core::frame::{decode_lenient, Frame, FRAME_HEADER_LEN, FRAME_MAGIC};
use crate::core::manifest::ContentHash;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use regex::bytes::Regex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

fn xmp_frames_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"pvnc:frames\s*=\s*"([A-Za-z0-9+/=\s]*)"?"#).expect("static regex")
    })
}

#[derive(Default)]
struct Group {
    total: u16,
    parts: BTreeMap<u16, Vec<u8>>,
    truncated: bool,
}

impl Group {
    fn payload_len(&self) -> usize {
        self.parts.values().map(Vec::len).sum()
    }
}

#[derive(Default)]
struct Groups(BTreeMap<ContentHash, Group>);

impl Groups {
    fn add(&mut self, frame: Frame, truncated: bool) {
        let group = self.0.entry(frame.header.hash).or_insert_with(|| Group {
            total: frame.header.total,
            ..Group::default()
        });
        group.truncated |= truncated;
        group
            .parts
            .entry(frame.header.sequence)
            .or_insert(frame.payload);
    }

    /// The group with the most recovered bytes
    fn into_best(self) -> Option<RecoveredPayload> {
        let (claimed_hash, group) = self.0.into_iter().max_by_key(|(_, g)| g.payload_len())?;
        let present = group.parts.len();
        let bytes: Vec<u8> = group.parts.into_values().flatten().collect();
        let complete =
            !group.truncated && present == group.total as usize && claimed_hash.matches(&bytes);
        Some(RecoveredPayload::Fragment {
            claimed_hash,
            bytes,
            complete,
        })
    }
}

const CANCELLED: &str = "cancelled: a high-confidence result was already found";

pub(super) fn extract(
    bytes: &[u8],
    max_scan_bytes: usize,
    cancel: &AtomicBool,
) -> Result<Option<RecoveredPayload>, String> {
    let window = &bytes[..bytes.len().min(max_scan_bytes)];
    let mut groups = Groups::default();

    let mut pos = 0;
    while let Some(offset) = window[pos..].windows(FRAME_MAGIC.len()).position(|w| w == FRAME_MAGIC) {
        if cancel.load(Ordering::Relaxed) {
            return Err(CANCELLED.to_string());
        }
        let at = pos + offset;
        match decode_lenient(&window[at..]) {
            Ok((frame, truncated)) => {
                pos = at + FRAME_HEADER_LEN + frame.payload.len();
                groups.add(frame, truncated);
            }
            Err(_) => pos = at + 1,
        }
    }

    for caps in xmp_frames_pattern().captures_iter(window) {
        if cancel.load(Ordering::Relaxed) {
            return Err(CANCELLED.to_string());
        }
        let Some(list) = caps.get(1) else { continue };
        for token in list.as_bytes().split(|b| b.is_ascii_whitespace()) {
            if token.is_empty() {
                continue;
            }
            if let Ok(raw) = STANDARD.decode(token) {
                if let Ok((frame, truncated)) = decode_lenient(&raw) {
                    groups.add(frame, truncated);
                }
            }
        }
    }

    Ok(groups.into_best())
}
