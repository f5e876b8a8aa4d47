use crate::core::extract::Confidence;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProvenanceError {
    #[error("Embedding degraded to remote-only: {0}")]
    EmbeddingDegraded(String),

    #[error("No embedded manifest found")]
    ExtractionNotFound,

    #[error("Only a partial manifest was recovered (confidence: {0})")]
    ExtractionPartial(Confidence),

    #[error("Store integrity violation: key {hash} already holds different bytes")]
    StoreIntegrityViolation { hash: String },

    #[error("Hash mismatch: reference expects {expected}, content hashes to {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Purge deferred for {target} after {attempts} attempt(s): {reason}")]
    PurgeDeferred {
        target: String,
        attempts: u32,
        reason: String,
    },

    #[error("Manifest fetch timed out after {0:?}")]
    FetchTimeout(std::time::Duration),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Upstream circuit open; next attempt allowed in {0:?}")]
    CircuitOpen(std::time::Duration),

    #[error("Invalid manifest reference: {0}")]
    InvalidReference(String),

    #[error("Invalid content hash: {0} (expected 64 lowercase hex characters)")]
    InvalidHash(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Malformed manifest: {0}")]
    MalformedManifest(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ProvenanceError {
    /// True for failures caused by infrastructure rather than by content.
    pub fn is_operational(&self) -> bool {
        matches!(
            self,
            ProvenanceError::FetchTimeout(_)
                | ProvenanceError::Backend(_)
                | ProvenanceError::CircuitOpen(_)
                | ProvenanceError::PurgeDeferred { .. }
                | ProvenanceError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ProvenanceError>;
