//! Object storage for merge artifacts, composites and quicklooks.
//!
//! The pipeline only needs byte-level put/get/delete plus a prefix listing,
//! so the store is a small sync trait; workers call it from blocking tasks.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{CubeError, Result};

pub trait ObjectStore: Send + Sync {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;
    fn get(&self, key: &str) -> Result<Vec<u8>>;
    fn exists(&self, key: &str) -> Result<bool>;
    fn delete_prefix(&self, prefix: &str) -> Result<usize>;
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Key of a merge artifact: `merges/<cube>/<tile>/<period>/<scene>_<band>.tif`.
pub fn merge_key(cube: &str, tile: &str, period: &str, scene: &str, band: &str) -> String {
    format!("merges/{cube}/{tile}/{period}/{scene}_{band}.tif")
}

/// Key of a composite band: `cubes/<cube>/<tile>/<period>/<band>.tif`.
pub fn composite_key(cube: &str, tile: &str, period: &str, band: &str) -> String {
    format!("cubes/{cube}/{tile}/{period}/{band}.tif")
}

/// Key of a quicklook: `items/<cube>/<tile>/<period>/quicklook.png`.
pub fn quicklook_key(cube: &str, tile: &str, period: &str) -> String {
    format!("items/{cube}/{tile}/{period}/quicklook.png")
}

/// Filesystem-backed store rooted at `<root>/<bucket>/`.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>, bucket: &str) -> Self {
        Self { root: root.into().join(bucket) }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        if key.split('/').any(|seg| seg == "..") || key.starts_with('/') {
            return Err(CubeError::Validation(format!("bad object key '{key}'")));
        }
        Ok(self.root.join(key))
    }
}

impl ObjectStore for FsObjectStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| CubeError::Transient(e.to_string()))?;
        }
        // Write-then-rename keeps readers from observing partial artifacts.
        let tmp = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp).map_err(|e| CubeError::Transient(e.to_string()))?;
        file.write_all(bytes)
            .map_err(|e| CubeError::Transient(e.to_string()))?;
        fs::rename(&tmp, &path).map_err(|e| CubeError::Transient(e.to_string()))?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(key)?;
        fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CubeError::NotFound(format!("object '{key}'"))
            } else {
                CubeError::Transient(e.to_string())
            }
        })
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.resolve(key)?.exists())
    }

    fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let path = self.resolve(prefix)?;
        if !path.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        if path.is_dir() {
            removed += count_files(&path);
            fs::remove_dir_all(&path).map_err(|e| CubeError::Transient(e.to_string()))?;
        } else {
            fs::remove_file(&path).map_err(|e| CubeError::Transient(e.to_string()))?;
            removed = 1;
        }
        Ok(removed)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let base = self.resolve(prefix)?;
        let mut keys = Vec::new();
        if base.exists() {
            walk(&base, &self.root, &mut keys);
        }
        keys.sort();
        Ok(keys)
    }
}

fn count_files(dir: &Path) -> usize {
    let mut n = 0;
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let p = entry.path();
            if p.is_dir() {
                n += count_files(&p);
            } else {
                n += 1;
            }
        }
    }
    n
}

fn walk(dir: &Path, root: &Path, out: &mut Vec<String>) {
    if dir.is_file() {
        if let Ok(rel) = dir.strip_prefix(root) {
            out.push(rel.to_string_lossy().replace('\\', "/"));
        }
        return;
    }
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            walk(&entry.path(), root, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path(), "bdc-cubes");

        let key = merge_key("mc_10", "003003", "2019-01-01_2019-01-31", "S2A_1", "B04");
        store.put(&key, b"tif bytes").unwrap();
        assert!(store.exists(&key).unwrap());
        assert_eq!(store.get(&key).unwrap(), b"tif bytes");

        let listed = store.list("merges/mc_10/003003").unwrap();
        assert_eq!(listed, vec![key.clone()]);

        assert_eq!(store.delete_prefix("merges/mc_10/003003").unwrap(), 1);
        assert!(!store.exists(&key).unwrap());
        assert!(matches!(store.get(&key), Err(CubeError::NotFound(_))));
    }

    #[test]
    fn rejects_traversal_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path(), "b");
        assert!(store.put("../outside.tif", b"x").is_err());
        assert!(store.get("/etc/passwd").is_err());
    }
}
