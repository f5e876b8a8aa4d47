//! Survival core: embedding, extraction, storage, caching and verification

pub mod cache;
pub mod embed;
pub mod exif;
pub mod extract;
pub mod frame;
pub mod inspect;
pub mod manifest;
pub mod pipeline;
pub mod resolver;
pub mod store;
pub mod telemetry;
pub mod validation;
