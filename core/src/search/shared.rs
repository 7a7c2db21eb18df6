// Index of files this node offers to the mesh

use super::protocol::{SearchFilter, SharedFile};
use crate::store::{StorageBackend, StorageError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

const SHARED_PREFIX: &[u8] = b"shared:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SharedEntry {
    size: u64,
    hash: Option<String>,
}

pub struct SharedFileIndex {
    db: Arc<dyn StorageBackend>,
    files: RwLock<BTreeMap<String, SharedEntry>>,
}

impl SharedFileIndex {
    /// Open the index, loading any previously shared paths
    pub fn open(db: Arc<dyn StorageBackend>) -> Result<Self, StorageError> {
        let mut files = BTreeMap::new();
        for (key, value) in db.scan_prefix(SHARED_PREFIX)? {
            let path = String::from_utf8_lossy(&key[SHARED_PREFIX.len()..]).into_owned();
            match bincode::deserialize::<SharedEntry>(&value) {
                Ok(entry) => {
                    files.insert(path, entry);
                }
                Err(e) => debug!("Skipping unreadable shared entry {}: {}", path, e),
            }
        }
        Ok(Self {
            db,
            files: RwLock::new(files),
        })
    }

    /// Share a file on disk, recording its size and SHA-256
    pub fn share_path(&self, path: &Path) -> std::io::Result<()> {
        let mut file = std::fs::File::open(path)?;
        let size = file.metadata()?.len();
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let hash = hex::encode(hasher.finalize());
        self.share(&path.to_string_lossy(), size, Some(hash))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    }

    pub fn share(&self, path: &str, size: u64, hash: Option<String>) -> Result<(), StorageError> {
        let entry = SharedEntry { size, hash };
        let bytes =
            bincode::serialize(&entry).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.db.put(&key(path), &bytes)?;
        self.db.flush()?;
        self.files.write().insert(path.to_string(), entry);
        Ok(())
    }

    pub fn unshare(&self, path: &str) -> Result<bool, StorageError> {
        let removed = self.files.write().remove(path).is_some();
        if removed {
            self.db.remove(&key(path))?;
            self.db.flush()?;
        }
        Ok(removed)
    }

    pub fn paths(&self) -> Vec<String> {
        self.files.read().keys().cloned().collect()
    }

    /// Case-insensitive substring match on the path, then the filter
    pub fn search(&self, query: &str, filter: &SearchFilter) -> Vec<SharedFile> {
        let needle = query.to_lowercase();
        let types = normalize_types(&filter.types);
        self.files
            .read()
            .iter()
            .filter(|(path, _)| path.to_lowercase().contains(&needle))
            .filter_map(|(path, entry)| {
                let name = file_name(path);
                if !matches_type(name, &types) {
                    return None;
                }
                if filter.min_size.map_or(false, |min| entry.size < min) {
                    return None;
                }
                if filter.max_size.map_or(false, |max| entry.size > max) {
                    return None;
                }
                Some(SharedFile {
                    name: name.to_string(),
                    size: entry.size,
                    hash: entry.hash.clone(),
                })
            })
            .collect()
    }

    /// Resolve a file name from a search result back to its shared path
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        self.files
            .read()
            .keys()
            .find(|path| path.as_str() == name || file_name(path) == name)
            .map(PathBuf::from)
    }
}

fn key(path: &str) -> Vec<u8> {
    let mut key = SHARED_PREFIX.to_vec();
    key.extend_from_slice(path.as_bytes());
    key
}

fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

fn normalize_types(types: &[String]) -> Vec<String> {
    types
        .iter()
        .map(|t| t.trim().trim_start_matches('.').to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

fn matches_type(name: &str, types: &[String]) -> bool {
    if types.is_empty() {
        return true;
    }
    match name.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() => types.contains(&ext.to_lowercase()),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStorage, SledStorage};
    use std::io::Write;

    fn index() -> SharedFileIndex {
        let index = SharedFileIndex::open(Arc::new(MemoryStorage::new())).unwrap();
        index.share("/media/Holiday Video.MP4", 5_000, None).unwrap();
        index.share("/media/notes.txt", 10, Some("ab".into())).unwrap();
        index.share("/media/video_cut", 50, None).unwrap();
        index
    }

    #[test]
    fn test_search_is_case_insensitive() {
        let results = index().search("video", &SearchFilter::default());
        let names: Vec<_> = results.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["Holiday Video.MP4", "video_cut"]);
    }

    #[test]
    fn test_filters_apply() {
        let index = index();
        let by_type = SearchFilter {
            types: vec![".mp4".into()],
            ..Default::default()
        };
        assert_eq!(index.search("video", &by_type).len(), 1);

        let small = SearchFilter {
            max_size: Some(100),
            ..Default::default()
        };
        let results = index.search("", &small);
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|f| f.size <= 100));

        let large = SearchFilter {
            min_size: Some(1_000),
            ..Default::default()
        };
        assert_eq!(index.search("", &large)[0].name, "Holiday Video.MP4");
    }

    #[test]
    fn test_resolve_and_unshare() {
        let index = index();
        assert_eq!(
            index.resolve("notes.txt"),
            Some(PathBuf::from("/media/notes.txt"))
        );
        assert!(index.unshare("/media/notes.txt").unwrap());
        assert_eq!(index.resolve("notes.txt"), None);
        assert!(!index.unshare("/media/notes.txt").unwrap());
    }

    #[test]
    fn test_share_path_hashes_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("song.ogg");
        std::fs::File::create(&file_path)
            .unwrap()
            .write_all(b"abc")
            .unwrap();
        let db_path = dir.path().join("db");

        {
            let db = Arc::new(SledStorage::open(db_path.to_str().unwrap()).unwrap());
            let index = SharedFileIndex::open(db).unwrap();
            index.share_path(&file_path).unwrap();
        }

        let db = Arc::new(SledStorage::open(db_path.to_str().unwrap()).unwrap());
        let index = SharedFileIndex::open(db).unwrap();
        let results = index.search("song", &SearchFilter::default());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].size, 3);
        assert_eq!(
            results[0].hash.as_deref(),
            Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
    }
}
