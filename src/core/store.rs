use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// Ids starting with this marker name stored blobs; anything else is inline content.
pub const STORED_ID_PREFIX: &str = "img_";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid content id: {id}")]
    InvalidId { id: String },

    #[error("Content not found: {id}")]
    NotFound { id: String },

    #[error("Store lock poisoned")]
    Poisoned,
}

/// Byte-level content store keyed by opaque ids.
///
/// Implementations serialize their own mutations; callers may share a store
/// across threads for reads while a single pipeline writes.
pub trait ContentStore: Send + Sync {
    fn get(&self, id: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn put(&self, id: &str, bytes: &[u8]) -> Result<String, StoreError>;

    fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// All stored ids, in ascending order.
    fn ids(&self) -> Result<Vec<String>, StoreError>;

    fn size(&self, id: &str) -> Result<Option<u64>, StoreError> {
        Ok(self.get(id)?.map(|bytes| bytes.len() as u64))
    }
}

/// `img_<unix millis>_<8 hex>`. `salt` separates identical content saved in the same millisecond.
pub fn generate_id(bytes: &[u8], timestamp_ms: i64, salt: u64) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(bytes);
    hasher.update(&timestamp_ms.to_le_bytes());
    hasher.update(&salt.to_le_bytes());
    let digest = hasher.finalize().to_hex();
    format!("{}{}_{}", STORED_ID_PREFIX, timestamp_ms, &digest.as_str()[..8])
}

/// Creation time embedded in a generated id.
pub fn timestamp_from_id(id: &str) -> Option<i64> {
    id.strip_prefix(STORED_ID_PREFIX)?
        .split('_')
        .next()?
        .parse()
        .ok()
}

fn validate_id(id: &str) -> Result<(), StoreError> {
    let valid = id.starts_with(STORED_ID_PREFIX)
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidId { id: id.to_string() })
    }
}

#[derive(Default)]
pub struct MemoryStore {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().map(|blobs| blobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ContentStore for MemoryStore {
    fn get(&self, id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let blobs = self.blobs.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(blobs.get(id).cloned())
    }

    fn put(&self, id: &str, bytes: &[u8]) -> Result<String, StoreError> {
        validate_id(id)?;
        let mut blobs = self.blobs.lock().map_err(|_| StoreError::Poisoned)?;
        blobs.insert(id.to_string(), bytes.to_vec());
        Ok(id.to_string())
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut blobs = self.blobs.lock().map_err(|_| StoreError::Poisoned)?;
        blobs
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    fn ids(&self) -> Result<Vec<String>, StoreError> {
        let blobs = self.blobs.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(blobs.keys().cloned().collect())
    }
}

/// One file per blob under `root`, named by id.
pub struct DirStore {
    root: PathBuf,
    writer: Mutex<()>,
}

impl DirStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            writer: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        validate_id(id)?;
        Ok(self.root.join(id))
    }
}

impl ContentStore for DirStore {
    fn get(&self, id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.blob_path(id)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, id: &str, bytes: &[u8]) -> Result<String, StoreError> {
        let path = self.blob_path(id)?;
        let _guard = self.writer.lock().map_err(|_| StoreError::Poisoned)?;

        // Write beside the target, then rename so readers never see a partial blob.
        let tmp = self.root.join(format!(".{}.tmp", id));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        log::debug!("Stored {} ({} bytes)", id, bytes.len());
        Ok(id.to_string())
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        let path = self.blob_path(id)?;
        let _guard = self.writer.lock().map_err(|_| StoreError::Poisoned)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StoreError::NotFound { id: id.to_string() })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if validate_id(name).is_ok() {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn size(&self, id: &str) -> Result<Option<u64>, StoreError> {
        let path = self.blob_path(id)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
