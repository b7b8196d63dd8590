//! Persisted dependency index
//!
//! Each (deps directory, module) pair owns one JSON index file holding one
//! [`DependencyRecord`] per compiled source. Reading an index never fails a
//! build: a missing file is an empty index, an unreadable or corrupted one is
//! logged and treated as empty, which forces a full rebuild of that module.

pub mod metadata;

pub use metadata::{hash_bytes, hash_file, FileIdentity};

use crate::error::{BuildError, BuildResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

/// Index format version; other versions are discarded
pub const INDEX_VERSION: u32 = 1;

/// Directory (inside a deps directory) holding index files
pub const INDEX_DIR: &str = ".clair-deps";

/// A declared dependency as seen at the last compile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedDependency {
    pub path: PathBuf,
    pub identity: FileIdentity,
}

/// What the last compile of one source file saw
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRecord {
    pub source: FileIdentity,
    pub deps: Vec<RecordedDependency>,
    /// Hash of the compile command line
    pub command: String,
    pub success: bool,
}

/// Outcome of the last produce step of one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRecord {
    /// Hash of the produce and post-link command lines
    pub command: String,
    pub success: bool,
}

/// All records of one module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyIndex {
    pub version: u32,
    pub records: BTreeMap<PathBuf, DependencyRecord>,
    /// Keyed by qualified target name
    #[serde(default)]
    pub products: BTreeMap<String, ProductRecord>,
}

impl Default for DependencyIndex {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            records: BTreeMap::new(),
            products: BTreeMap::new(),
        }
    }
}

impl DependencyIndex {
    /// Location of a module's index file under a deps directory
    pub fn path_for(deps_dir: &Path, module: &str) -> PathBuf {
        deps_dir.join(INDEX_DIR).join(format!("{module}.json"))
    }

    /// Read an index, reporting corruption as an error
    ///
    /// `Ok(None)` means no index exists yet.
    pub fn try_load(path: &Path) -> BuildResult<Option<Self>> {
        let content = match fs::read(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(BuildError::DependencyIndexCorrupt {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })
            }
        };

        let index: Self =
            serde_json::from_slice(&content).map_err(|e| BuildError::DependencyIndexCorrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        if index.version != INDEX_VERSION {
            return Err(BuildError::DependencyIndexCorrupt {
                path: path.to_path_buf(),
                reason: format!("unsupported index version {}", index.version),
            });
        }

        Ok(Some(index))
    }

    /// Read an index, falling back to an empty one
    pub fn load(path: &Path) -> Self {
        match Self::try_load(path) {
            Ok(index) => index.unwrap_or_default(),
            Err(e) => {
                log::warn!("{e}; rebuilding everything it tracked");
                Self::default()
            }
        }
    }

    /// Write the index, replacing the previous file atomically
    pub fn save(&self, path: &Path) -> BuildResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| BuildError::io(parent, e))?;
        }

        let content = serde_json::to_vec_pretty(self).map_err(|e| {
            BuildError::io(path, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(|e| BuildError::io(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| BuildError::io(path, e))?;
        Ok(())
    }

    pub fn get(&self, source: &Path) -> Option<&DependencyRecord> {
        self.records.get(source)
    }

    pub fn insert(&mut self, source: PathBuf, record: DependencyRecord) {
        self.records.insert(source, record);
    }

    pub fn product(&self, target: &str) -> Option<&ProductRecord> {
        self.products.get(target)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Lazily loaded indices of one build, keyed by index path relative to the root
///
/// Owned by the scheduling thread only, so every write to a given index file is
/// serialized.
#[derive(Debug)]
pub struct IndexStore {
    root: PathBuf,
    indices: HashMap<PathBuf, (DependencyIndex, bool)>,
}

impl IndexStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            indices: HashMap::new(),
        }
    }

    /// Index at `path` (relative to the root), loading it on first use
    pub fn index(&mut self, path: &Path) -> &DependencyIndex {
        &self.entry(path).0
    }

    /// Store a record and mark the index dirty
    pub fn record(&mut self, path: &Path, source: PathBuf, record: DependencyRecord) {
        let entry = self.entry(path);
        entry.0.insert(source, record);
        entry.1 = true;
    }

    /// Store the outcome of a produce step and mark the index dirty
    pub fn record_product(&mut self, path: &Path, target: &str, record: ProductRecord) {
        let entry = self.entry(path);
        entry.0.products.insert(target.to_string(), record);
        entry.1 = true;
    }

    /// Drop a target's produce record so its next build produces again
    pub fn forget_product(&mut self, path: &Path, target: &str) {
        let entry = self.entry(path);
        if entry.0.products.remove(target).is_some() {
            entry.1 = true;
        }
    }

    /// Write one index if it changed
    pub fn flush(&mut self, path: &Path) -> BuildResult<()> {
        let root = self.root.clone();
        if let Some((index, dirty)) = self.indices.get_mut(path) {
            if *dirty {
                index.save(&root.join(path))?;
                *dirty = false;
            }
        }
        Ok(())
    }

    /// Write every changed index; failures are logged and the first is returned
    pub fn flush_all(&mut self) -> BuildResult<()> {
        let mut paths: Vec<PathBuf> = self
            .indices
            .iter()
            .filter(|(_, (_, dirty))| *dirty)
            .map(|(path, _)| path.clone())
            .collect();
        paths.sort();

        let mut first_error = None;
        for path in paths {
            if let Err(e) = self.flush(&path) {
                log::error!("failed to write dependency index: {e}");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn entry(&mut self, path: &Path) -> &mut (DependencyIndex, bool) {
        let root = &self.root;
        self.indices
            .entry(path.to_path_buf())
            .or_insert_with(|| (DependencyIndex::load(&root.join(path)), false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn identity(tag: &str) -> FileIdentity {
        FileIdentity {
            modified_ns: 1,
            size: tag.len() as u64,
            hash: hash_bytes(tag.as_bytes()),
        }
    }

    fn record() -> DependencyRecord {
        DependencyRecord {
            source: identity("ata.c"),
            deps: vec![RecordedDependency {
                path: PathBuf::from("include/kernel/driver/ata.h"),
                identity: identity("ata.h"),
            }],
            command: hash_bytes(b"gcc -c"),
            success: true,
        }
    }

    #[test]
    fn test_path_for_module() {
        assert_eq!(
            DependencyIndex::path_for(Path::new("include"), "libc"),
            PathBuf::from("include/.clair-deps/libc.json")
        );
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = DependencyIndex::path_for(temp_dir.path(), "kernel");

        let mut index = DependencyIndex::default();
        index.insert(PathBuf::from("kernel/driver/ata.c"), record());
        index.save(&path).unwrap();

        let loaded = DependencyIndex::try_load(&path).unwrap().unwrap();
        assert_eq!(loaded, index);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_missing_index_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("none.json");
        assert!(DependencyIndex::try_load(&path).unwrap().is_none());
        assert!(DependencyIndex::load(&path).is_empty());
    }

    #[test]
    fn test_corrupt_index_recovered_as_empty() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bad.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            DependencyIndex::try_load(&path),
            Err(BuildError::DependencyIndexCorrupt { .. })
        ));
        assert!(DependencyIndex::load(&path).is_empty());
    }

    #[test]
    fn test_foreign_version_discarded() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("old.json");
        fs::write(&path, r#"{"version": 99, "records": {}}"#).unwrap();

        assert!(DependencyIndex::try_load(&path).is_err());
        assert!(DependencyIndex::load(&path).is_empty());
    }

    #[test]
    fn test_store_flushes_only_dirty() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = IndexStore::new(temp_dir.path());
        let clean = PathBuf::from("include/.clair-deps/lib.json");
        let dirty = PathBuf::from("include/.clair-deps/libc.json");

        assert!(store.index(&clean).is_empty());
        store.record(&dirty, PathBuf::from("libc/stdio.c"), record());
        store.flush_all().unwrap();

        assert!(!temp_dir.path().join(&clean).exists());
        let saved = DependencyIndex::load(&temp_dir.path().join(&dirty));
        assert_eq!(saved.len(), 1);
        assert!(saved.get(Path::new("libc/stdio.c")).unwrap().success);
    }

    #[test]
    fn test_product_records_persist_and_forget() {
        let temp_dir = TempDir::new().unwrap();
        let path = PathBuf::from("bin/.clair-deps/bin.json");
        let mut store = IndexStore::new(temp_dir.path());

        let product = ProductRecord {
            command: hash_bytes(b"gcc -o build/bin/cat"),
            success: false,
        };
        store.record_product(&path, "bin/cat", product.clone());
        store.flush_all().unwrap();
        let saved = DependencyIndex::load(&temp_dir.path().join(&path));
        assert_eq!(saved.product("bin/cat"), Some(&product));

        store.forget_product(&path, "bin/cat");
        store.flush_all().unwrap();
        let saved = DependencyIndex::load(&temp_dir.path().join(&path));
        assert!(saved.product("bin/cat").is_none());
    }

    #[test]
    fn test_index_without_products_still_loads() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("lib.json");
        fs::write(&path, r#"{"version": 1, "records": {}}"#).unwrap();

        let index = DependencyIndex::try_load(&path).unwrap().unwrap();
        assert!(index.products.is_empty());
    }
}
