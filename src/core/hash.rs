use crate::core::store::{ContentStore, StoreError};
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Content not found: {id}")]
    Missing { id: String },
}

#[derive(Debug, Clone, Copy)]
pub struct HashOptions {
    /// Bytes taken from the head, the middle and the tail.
    pub sample_len: usize,
    /// Hex characters kept from the SHA-256 digest.
    pub hex_len: usize,
}

impl Default for HashOptions {
    fn default() -> Self {
        Self {
            sample_len: 500,
            hex_len: 32,
        }
    }
}

/// SHA-256 over head + middle + tail samples plus the total length.
///
/// Blobs shorter than the samples hash the overlapping ranges as-is, so two
/// identical blobs always collide and a length change always separates them.
pub fn content_hash(bytes: &[u8], options: HashOptions) -> String {
    let len = bytes.len();
    let sample = options.sample_len;
    let half = sample / 2;
    let mid = len / 2;

    let head = &bytes[..sample.min(len)];
    let middle = &bytes[mid.saturating_sub(half)..(mid + half).min(len)];
    let tail = &bytes[len.saturating_sub(sample)..];

    let mut hasher = Sha256::new();
    hasher.update(head);
    hasher.update(middle);
    hasher.update(tail);
    hasher.update(len.to_string().as_bytes());

    let mut hex = format!("{:x}", hasher.finalize());
    hex.truncate(options.hex_len);
    hex
}

/// Id → content hash for one maintenance pass.
///
/// Owned by the caller and dropped with the pass; nothing here is global.
#[derive(Debug, Default)]
pub struct HashCache {
    entries: HashMap<String, String>,
    hits: usize,
    misses: usize,
}

impl HashCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, id: &str) -> Option<&str> {
        match self.entries.get(id) {
            Some(hash) => {
                self.hits += 1;
                Some(hash.as_str())
            }
            None => None,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn insert(&mut self, id: impl Into<String>, hash: impl Into<String>) {
        self.misses += 1;
        self.entries.insert(id.into(), hash.into());
    }

    pub fn invalidate(&mut self, id: &str) {
        self.entries.remove(id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn misses(&self) -> usize {
        self.misses
    }
}

/// Hash stored blobs, reusing `cache` and filling it for misses.
pub struct HashService<'a> {
    store: &'a dyn ContentStore,
    options: HashOptions,
}

impl<'a> HashService<'a> {
    pub fn new(store: &'a dyn ContentStore, options: HashOptions) -> Self {
        Self { store, options }
    }

    pub fn compute_content_hash(
        &self,
        id: &str,
        cache: &mut HashCache,
    ) -> Result<String, HashError> {
        if let Some(hash) = cache.get(id) {
            return Ok(hash.to_string());
        }
        let hash = self.hash_uncached(id)?;
        cache.insert(id, hash.clone());
        Ok(hash)
    }

    /// Hash many ids. Misses are computed in parallel; only reads run concurrently.
    /// Results keep the order of `ids`.
    pub fn compute_content_hashes_batch(
        &self,
        ids: &[String],
        cache: &mut HashCache,
    ) -> Vec<(String, Result<String, HashError>)> {
        let mut computed: HashMap<String, Result<String, HashError>> = ids
            .par_iter()
            .filter(|id| !cache.contains(id))
            .map(|id| (id.clone(), self.hash_uncached(id)))
            .collect();

        ids.iter()
            .map(|id| {
                let result = match computed.remove(id) {
                    Some(Ok(hash)) => {
                        cache.insert(id.clone(), hash.clone());
                        Ok(hash)
                    }
                    Some(Err(e)) => Err(e),
                    None => match cache.get(id) {
                        Some(hash) => Ok(hash.to_string()),
                        // Only reachable for an id listed twice whose first read failed.
                        None => Err(HashError::Missing { id: id.clone() }),
                    },
                };
                (id.clone(), result)
            })
            .collect()
    }

    /// Whether two stored blobs hash the same.
    pub fn verify_identical_content(
        &self,
        first: &str,
        second: &str,
        cache: &mut HashCache,
    ) -> Result<bool, HashError> {
        let a = self.compute_content_hash(first, cache)?;
        let b = self.compute_content_hash(second, cache)?;
        Ok(a == b)
    }

    fn hash_uncached(&self, id: &str) -> Result<String, HashError> {
        let bytes = self
            .store
            .get(id)?
            .ok_or_else(|| HashError::Missing { id: id.to_string() })?;
        Ok(content_hash(&bytes, self.options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::MemoryStore;

    #[test]
    fn test_content_hash_format() {
        let hash = content_hash(b"Hello, World!", HashOptions::default());
        assert_eq!(hash.len(), 32);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, content_hash(b"Hello, World!", HashOptions::default()));
    }

    #[test]
    fn test_length_is_part_of_the_hash() {
        // Same head, middle and tail samples; only the length differs.
        let short = vec![7u8; 2000];
        let long = vec![7u8; 2001];
        assert_ne!(
            content_hash(&short, HashOptions::default()),
            content_hash(&long, HashOptions::default())
        );
    }

    #[test]
    fn test_unsampled_bytes_do_not_change_the_hash() {
        let mut a = vec![1u8; 10_000];
        let b = a.clone();
        // Between the head and middle samples.
        a[1500] = 99;
        assert_eq!(
            content_hash(&a, HashOptions::default()),
            content_hash(&b, HashOptions::default())
        );
        // Inside the middle sample.
        a[5000] = 99;
        assert_ne!(
            content_hash(&a, HashOptions::default()),
            content_hash(&b, HashOptions::default())
        );
    }

    #[test]
    fn test_empty_content() {
        let hash = content_hash(b"", HashOptions::default());
        assert_eq!(hash.len(), 32);
    }

    #[test]
    fn test_cache_prevents_recomputation() {
        let store = MemoryStore::new();
        store.put("img_1_aaaa", b"Content A").unwrap();
        let service = HashService::new(&store, HashOptions::default());
        let mut cache = HashCache::new();

        let first = service.compute_content_hash("img_1_aaaa", &mut cache).unwrap();
        // A changed blob is not re-read while the pass's cache holds it.
        store.put("img_1_aaaa", b"Content B").unwrap();
        let second = service.compute_content_hash("img_1_aaaa", &mut cache).unwrap();

        assert_eq!(first, second);
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.hits(), 1);

        cache.invalidate("img_1_aaaa");
        let third = service.compute_content_hash("img_1_aaaa", &mut cache).unwrap();
        assert_ne!(first, third);
    }

    #[test]
    fn test_batch_hashing() {
        let store = MemoryStore::new();
        store.put("img_1_aaaa", b"Content 1").unwrap();
        store.put("img_2_bbbb", b"Content 2").unwrap();
        store.put("img_3_cccc", b"Content 1").unwrap();
        let service = HashService::new(&store, HashOptions::default());
        let mut cache = HashCache::new();

        let ids = vec![
            "img_1_aaaa".to_string(),
            "img_2_bbbb".to_string(),
            "img_3_cccc".to_string(),
            "img_4_dddd".to_string(),
        ];
        let results = service.compute_content_hashes_batch(&ids, &mut cache);

        assert_eq!(results.len(), 4);
        assert_eq!(results[0].0, "img_1_aaaa");
        let h1 = results[0].1.as_ref().unwrap();
        let h2 = results[1].1.as_ref().unwrap();
        let h3 = results[2].1.as_ref().unwrap();
        assert_ne!(h1, h2);
        assert_eq!(h1, h3);
        assert!(matches!(results[3].1, Err(HashError::Missing { .. })));
        assert_eq!(cache.len(), 3);

        assert!(service
            .verify_identical_content("img_1_aaaa", "img_3_cccc", &mut cache)
            .unwrap());
    }
}
