//! File identity snapshots for change detection

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::Path;
use std::time::UNIX_EPOCH;

/// Identity of a file at one point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIdentity {
    /// Modification time, nanoseconds since the Unix epoch
    pub modified_ns: u64,
    /// File size in bytes
    pub size: u64,
    /// SHA-256 of the content
    pub hash: String,
}

impl FileIdentity {
    /// Snapshot a file, hashing its content
    pub fn capture(path: &Path) -> io::Result<Self> {
        let (modified_ns, size) = stat(path)?;
        Ok(Self {
            modified_ns,
            size,
            hash: hash_file(path)?,
        })
    }

    /// Check whether the file at `path` still has this identity
    ///
    /// Equal timestamp and size are trusted without reading the file. A changed
    /// timestamp with the same size falls back to comparing content, so a file
    /// that was only touched is not reported as changed.
    pub fn matches(&self, path: &Path) -> io::Result<bool> {
        let (modified_ns, size) = stat(path)?;

        if modified_ns == self.modified_ns && size == self.size {
            return Ok(true);
        }

        if size != self.size {
            return Ok(false);
        }

        Ok(hash_file(path)? == self.hash)
    }
}

/// Modification time (ns) and size of a file
fn stat(path: &Path) -> io::Result<(u64, u64)> {
    let metadata = fs::metadata(path)?;
    let modified = metadata
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    Ok((modified, metadata.len()))
}

/// Compute SHA-256 hash of file content
pub fn hash_file(path: &Path) -> io::Result<String> {
    let content = fs::read(path)?;
    Ok(hash_bytes(&content))
}

/// Compute SHA-256 hash of a byte string
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_capture_and_match_unchanged() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ata.h");
        fs::write(&path, "#define ATA 1\n").unwrap();

        let identity = FileIdentity::capture(&path).unwrap();
        assert_eq!(identity.size, 14);
        assert!(identity.matches(&path).unwrap());
    }

    #[test]
    fn test_detects_modified_content() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ata.h");
        fs::write(&path, "original").unwrap();
        let identity = FileIdentity::capture(&path).unwrap();

        thread::sleep(Duration::from_millis(10));
        fs::write(&path, "modified").unwrap();

        assert!(!identity.matches(&path).unwrap());
    }

    #[test]
    fn test_touch_without_change_matches() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ata.h");
        fs::write(&path, "content").unwrap();
        let identity = FileIdentity::capture(&path).unwrap();

        thread::sleep(Duration::from_millis(10));
        fs::write(&path, "content").unwrap();

        assert!(identity.matches(&path).unwrap());
    }

    #[test]
    fn test_missing_file_is_error() {
        let temp_dir = TempDir::new().unwrap();
        assert!(FileIdentity::capture(&temp_dir.path().join("gone.h")).is_err());
    }

    #[test]
    fn test_hash_bytes_stable() {
        assert_eq!(hash_bytes(b"cc -c"), hash_bytes(b"cc -c"));
        assert_ne!(hash_bytes(b"cc -c"), hash_bytes(b"cc -O2 -c"));
    }
}
