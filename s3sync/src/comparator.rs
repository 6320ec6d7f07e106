//! Node equality and content fingerprints

use std::path::Path;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncReadExt;
use md5::{Digest, Md5};

use crate::error::{Result, SyncError};
use crate::node::Node;

/// Outcome of comparing a source node with the destination node of the same name
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ComparisonResult {
    /// Nothing to transfer
    Identical,
    /// One side is a directory marker and the other is not
    TypeMismatch,
    DifferentSize,
    /// Sizes match but fingerprints differ or are unavailable
    DifferentContent,
    /// Fingerprinting is off and the source timestamp is later
    SourceNewer,
}

impl ComparisonResult {
    pub fn is_identical(&self) -> bool {
        matches!(self, Self::Identical)
    }
}

/// Applies the equality rule: sizes match and either fingerprints match,
/// or fingerprinting is disabled and the source is not newer.
#[derive(Debug, Clone, Copy)]
pub struct NodeComparator {
    fingerprinting: bool,
}

impl Default for NodeComparator {
    fn default() -> Self {
        Self::new(true)
    }
}

impl NodeComparator {
    pub fn new(fingerprinting: bool) -> Self {
        Self { fingerprinting }
    }

    pub async fn compare(&self, source: &Node, destination: &Node) -> ComparisonResult {
        match (source.is_directory_marker(), destination.is_directory_marker()) {
            (true, true) => return ComparisonResult::Identical,
            (true, false) | (false, true) => return ComparisonResult::TypeMismatch,
            (false, false) => {}
        }

        if source.size() != destination.size() {
            return ComparisonResult::DifferentSize;
        }

        if self.fingerprinting {
            match (source.fingerprint().await, destination.fingerprint().await) {
                (Some(a), Some(b)) if a == b => ComparisonResult::Identical,
                _ => ComparisonResult::DifferentContent,
            }
        } else if source.modified() <= destination.modified() {
            ComparisonResult::Identical
        } else {
            ComparisonResult::SourceNewer
        }
    }
}

/// Hex MD5 of a file's contents, in one streaming pass
pub async fn fingerprint_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).await.map_err(|e| {
        SyncError::hash_error(path, format!("Failed to open file: {}", e))
    })?;

    let mut hasher = Md5::new();
    let mut buffer = vec![0; 8192];

    loop {
        let bytes_read = file.read(&mut buffer).await.map_err(|e| {
            SyncError::hash_error(path, format!("Failed to read file: {}", e))
        })?;

        if bytes_read == 0 {
            break;
        }

        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}
