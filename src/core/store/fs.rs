//! Filesystem tier
//!
//! Layout is a two-level fan-out keyed by the first hex byte:
//!
//! ```text
//! <root>/3a/3a7bd3e2360a3d29eea436fcfb7e44c735d117c42d1c1835420b6b9942dd4f1b
//! ```
//!
//! Writes go to a uniquely named temp file in the same directory and are
//! renamed into place, so readers never observe a partial file.

use crate::core::manifest::ContentHash;
use rand::Rng;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;

#[derive(Debug, Clone)]
pub struct FsTier {
    root: PathBuf,
}

impl FsTier {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsTier { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, hash: &ContentHash) -> PathBuf {
        let hex = hash.to_hex();
        self.root.join(&hex[..2]).join(hex)
    }

    /// Read the stored bytes; a missing file is `Ok(None)`
    pub async fn read(&self, hash: &ContentHash) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(hash)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn write(&self, hash: &ContentHash, bytes: &[u8]) -> io::Result<()> {
        let path = self.path_for(hash);
        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir).await?;

        let suffix: u64 = rand::thread_rng().gen();
        let tmp = dir.join(format!(".{}.{:016x}.tmp", hash, suffix));
        fs::write(&tmp, bytes).await?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e);
        }
        Ok(())
    }

    pub async fn remove(&self, hash: &ContentHash) -> io::Result<()> {
        match fs::remove_file(self.path_for(hash)).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}
