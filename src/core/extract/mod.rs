//! Format extractors
//!
//! Three independent, stateless methods look for a manifest in asset bytes:
//!
//! | Method | Source | Confidence |
//! |---|---|---|
//! | [`ExtractionMethod::Native`] | APP11 / `pvNc` / WebP XMP frames, hash-verified | high |
//! | [`ExtractionMethod::ExifReference`] | canonical URL in an EXIF string | medium |
//! | [`ExtractionMethod::Heuristic`] | raw scan for frame magic | low |
//!
//! Results are reduced to the highest-confidence attempt with a payload, ties
//! broken by the order above. Failures become diagnostics, never errors.

mod exif_scan;
mod heuristic;
mod native;

use crate::config::ExtractConfig;
use crate::core::manifest::ContentHash;
use crate::core::validation::ManifestReference;
use crate::error::{ProvenanceError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    None,
    Low,
    Medium,
    High,
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Confidence::None => "none",
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        })
    }
}

/// Extraction methods in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    Native,
    ExifReference,
    Heuristic,
}

impl ExtractionMethod {
    pub const ALL: [ExtractionMethod; 3] = [
        ExtractionMethod::Native,
        ExtractionMethod::ExifReference,
        ExtractionMethod::Heuristic,
    ];

    /// Lower runs first and wins ties
    pub fn priority(&self) -> u8 {
        match self {
            ExtractionMethod::Native => 0,
            ExtractionMethod::ExifReference => 1,
            ExtractionMethod::Heuristic => 2,
        }
    }

    /// Confidence this method reports when it finds something
    pub fn ceiling(&self) -> Confidence {
        match self {
            ExtractionMethod::Native => Confidence::High,
            ExtractionMethod::ExifReference => Confidence::Medium,
            ExtractionMethod::Heuristic => Confidence::Low,
        }
    }

    fn run(&self, bytes: &[u8], config: &ExtractConfig, cancel: &AtomicBool) -> ExtractionAttempt {
        if cancel.load(Ordering::Acquire) {
            return ExtractionAttempt::skipped(*self);
        }
        let outcome = match self {
            ExtractionMethod::Native => native::extract(bytes),
            ExtractionMethod::ExifReference => exif_scan::extract(bytes),
            ExtractionMethod::Heuristic => heuristic::extract(bytes, config.max_scan_bytes, cancel),
        };
        match outcome {
            Ok(Some(payload)) => ExtractionAttempt {
                method: *self,
                confidence: self.ceiling(),
                payload: Some(payload),
                error: None,
            },
            Ok(None) => ExtractionAttempt::failed(*self, "nothing found"),
            Err(reason) => ExtractionAttempt::failed(*self, reason),
        }
    }
}

impl fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExtractionMethod::Native => "native",
            ExtractionMethod::ExifReference => "exif_reference",
            ExtractionMethod::Heuristic => "heuristic",
        })
    }
}

/// What an extraction method recovered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveredPayload {
    /// Complete manifest bytes whose hash was verified against the frames
    Manifest { hash: ContentHash, bytes: Vec<u8> },
    /// Pointer to the remote manifest
    Reference(ManifestReference),
    /// Frame payload bytes found by scanning; never trusted as a manifest
    Fragment {
        claimed_hash: ContentHash,
        bytes: Vec<u8>,
        /// Every frame present and the bytes hash to `claimed_hash`
        complete: bool,
    },
}

impl RecoveredPayload {
    /// Hash of the manifest this payload points at, if trustworthy enough to locate with
    pub fn locating_hash(&self) -> Option<ContentHash> {
        match self {
            RecoveredPayload::Manifest { hash, .. } => Some(*hash),
            RecoveredPayload::Reference(reference) => Some(reference.hash()),
            RecoveredPayload::Fragment { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionAttempt {
    pub method: ExtractionMethod,
    pub confidence: Confidence,
    pub payload: Option<RecoveredPayload>,
    pub error: Option<String>,
}

impl ExtractionAttempt {
    fn failed(method: ExtractionMethod, reason: impl Into<String>) -> Self {
        ExtractionAttempt {
            method,
            confidence: Confidence::None,
            payload: None,
            error: Some(reason.into()),
        }
    }

    fn skipped(method: ExtractionMethod) -> Self {
        Self::failed(method, "skipped: a high-confidence result was already found")
    }
}

/// Reduced outcome plus every attempt, in method order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionResult {
    best: Option<usize>,
    attempts: Vec<ExtractionAttempt>,
}

impl ExtractionResult {
    fn reduce(mut attempts: Vec<ExtractionAttempt>) -> Self {
        attempts.sort_by_key(|a| a.method.priority());
        let best = attempts
            .iter()
            .enumerate()
            .filter(|(_, a)| a.payload.is_some())
            // max_by_key keeps the last maximum, so compare reversed priority
            .max_by_key(|(_, a)| (a.confidence, std::cmp::Reverse(a.method.priority())))
            .map(|(i, _)| i);
        ExtractionResult { best, attempts }
    }

    pub fn best(&self) -> Option<&ExtractionAttempt> {
        self.best.map(|i| &self.attempts[i])
    }

    pub fn confidence(&self) -> Confidence {
        self.best().map(|a| a.confidence).unwrap_or(Confidence::None)
    }

    pub fn method(&self) -> Option<ExtractionMethod> {
        self.best().map(|a| a.method)
    }

    pub fn payload(&self) -> Option<&RecoveredPayload> {
        self.best().and_then(|a| a.payload.as_ref())
    }

    pub fn attempts(&self) -> &[ExtractionAttempt] {
        &self.attempts
    }

    /// Manifest hash usable to locate the remote manifest
    ///
    /// Heuristic fragments never qualify.
    pub fn locating_hash(&self) -> Option<ContentHash> {
        self.payload().and_then(RecoveredPayload::locating_hash)
    }

    /// Verified embedded manifest bytes, or the reason there are none
    pub fn require_manifest(&self) -> Result<(ContentHash, &[u8])> {
        match self.payload() {
            Some(RecoveredPayload::Manifest { hash, bytes }) => Ok((*hash, bytes.as_slice())),
            Some(_) => Err(ProvenanceError::ExtractionPartial(self.confidence())),
            None => Err(ProvenanceError::ExtractionNotFound),
        }
    }

    /// One line per attempt
    pub fn diagnostics(&self) -> Vec<String> {
        self.attempts
            .iter()
            .map(|a| match &a.error {
                Some(e) => format!("{}: {} ({})", a.method, a.confidence, e),
                None => format!("{}: {}", a.method, a.confidence),
            })
            .collect()
    }
}

/// Runs extraction methods and reduces their attempts
#[derive(Debug, Clone, Default)]
pub struct Extractor {
    config: ExtractConfig,
}

impl Extractor {
    pub fn new(config: ExtractConfig) -> Self {
        Extractor { config }
    }

    /// Extract with every method
    ///
    /// # Examples
    ///
    /// ```
    /// use manifest_survival::{extract, Confidence};
    ///
    /// let result = extract(b"plain bytes, no metadata");
    /// assert_eq!(result.confidence(), Confidence::None);
    /// assert_eq!(result.attempts().len(), 3);
    /// ```
    pub fn extract(&self, bytes: &[u8]) -> ExtractionResult {
        let attempts = if self.config.parallel {
            self.run_parallel(bytes)
        } else {
            self.run_sequential(bytes)
        };
        let result = ExtractionResult::reduce(attempts);
        debug!(
            "Extraction finished: confidence={} method={:?}",
            result.confidence(),
            result.method()
        );
        result
    }

    fn run_sequential(&self, bytes: &[u8]) -> Vec<ExtractionAttempt> {
        let cancel = AtomicBool::new(false);
        let mut attempts = Vec::with_capacity(ExtractionMethod::ALL.len());
        for method in ExtractionMethod::ALL {
            let attempt = method.run(bytes, &self.config, &cancel);
            if attempt.confidence == Confidence::High {
                cancel.store(true, Ordering::Release);
            }
            attempts.push(attempt);
        }
        attempts
    }

    fn run_parallel(&self, bytes: &[u8]) -> Vec<ExtractionAttempt> {
        self.run_parallel_with(bytes, |method, bytes, config, cancel| {
            method.run(bytes, config, cancel)
        })
    }

    /// Run `run` for every method on its own scoped thread
    ///
    /// A method that panics is reported as a failed attempt; it is never
    /// retried on the calling thread.
    fn run_parallel_with<F>(&self, bytes: &[u8], run: F) -> Vec<ExtractionAttempt>
    where
        F: Fn(ExtractionMethod, &[u8], &ExtractConfig, &AtomicBool) -> ExtractionAttempt + Sync,
    {
        let cancel = AtomicBool::new(false);
        let (tx, rx) = crossbeam::channel::bounded(ExtractionMethod::ALL.len());

        let scoped = crossbeam::thread::scope(|scope| {
            let handles: Vec<_> = ExtractionMethod::ALL
                .into_iter()
                .map(|method| {
                    let tx = tx.clone();
                    let cancel = &cancel;
                    let config = &self.config;
                    let run = &run;
                    let handle = scope.spawn(move |_| {
                        let attempt = run(method, bytes, config, cancel);
                        // Receiver outlives every sender inside the scope
                        let _ = tx.send(attempt);
                    });
                    (method, handle)
                })
                .collect();
            drop(tx);

            let mut attempts = Vec::with_capacity(ExtractionMethod::ALL.len());
            for attempt in rx.iter() {
                if attempt.confidence == Confidence::High {
                    cancel.store(true, Ordering::Release);
                }
                attempts.push(attempt);
            }

            for (method, handle) in handles {
                if handle.join().is_err() {
                    warn!("Extraction method {} panicked", method);
                    attempts.push(ExtractionAttempt::failed(method, "method panicked"));
                }
            }
            attempts
        });

        // Every thread is joined above, so the scope itself cannot fail
        scoped.unwrap_or_else(|_| {
            ExtractionMethod::ALL
                .into_iter()
                .map(|method| ExtractionAttempt::failed(method, "method panicked"))
                .collect()
        })
    }
}

/// Extract with default settings
pub fn extract(bytes: &[u8]) -> ExtractionResult {
    Extractor::default().extract(bytes)
}
