//! Storage-level duplicate detection and cleanup.
//!
//! A maintenance pass hashes every stored blob with the sampled content hash,
//! groups equal hashes, and classifies each group. Groups whose copies were
//! created almost simultaneously look like an import or save bug rather than a
//! user reusing a photo; those are "suspicious" and are only ever deleted after
//! explicit confirmation.

use crate::core::hash::{HashCache, HashOptions, HashService};
use crate::core::store::{timestamp_from_id, ContentStore, StoreError};
use crate::models::PointEntity;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Copy)]
pub struct DedupOptions {
    pub hash: HashOptions,
    pub suspicious_window_ms: i64,
    pub suspicious_min_members: usize,
}

impl Default for DedupOptions {
    fn default() -> Self {
        Self {
            hash: HashOptions::default(),
            suspicious_window_ms: 1000,
            suspicious_min_members: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Safe,
    Suspicious,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub verdict: Verdict,
    pub reason: String,
}

/// Suspicious when every timestamp is identical, or when at least
/// `suspicious_min_members` copies fall within `suspicious_window_ms`.
/// Members with no recoverable timestamp make the group suspicious.
pub fn classify(timestamps: &[Option<i64>], options: &DedupOptions) -> Classification {
    let count = timestamps.len();
    if count < 2 {
        return Classification {
            verdict: Verdict::Safe,
            reason: "single copy".to_string(),
        };
    }

    let unknown = timestamps.iter().filter(|t| t.is_none()).count();
    if unknown > 0 {
        return Classification {
            verdict: Verdict::Suspicious,
            reason: format!("creation time unknown for {} of {} copies", unknown, count),
        };
    }

    let known = timestamps.iter().flatten();
    let min = known.clone().min().copied().unwrap_or_default();
    let max = known.max().copied().unwrap_or_default();
    let span = max - min;

    if span == 0 {
        Classification {
            verdict: Verdict::Suspicious,
            reason: format!("all {} copies share the same creation time", count),
        }
    } else if span < options.suspicious_window_ms && count >= options.suspicious_min_members {
        Classification {
            verdict: Verdict::Suspicious,
            reason: format!("{} copies created within {}ms", count, span),
        }
    } else {
        Classification {
            verdict: Verdict::Safe,
            reason: format!("{} copies created {}ms apart", count, span),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupMember {
    pub id: String,
    pub timestamp: Option<i64>,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateGroup {
    pub hash: String,
    /// Oldest first; the first member is the one kept.
    pub members: Vec<GroupMember>,
    pub classification: Classification,
}

impl DuplicateGroup {
    pub fn keep(&self) -> &GroupMember {
        &self.members[0]
    }

    pub fn redundant(&self) -> &[GroupMember] {
        &self.members[1..]
    }

    pub fn is_suspicious(&self) -> bool {
        self.classification.verdict == Verdict::Suspicious
    }

    pub fn reclaimable_bytes(&self) -> u64 {
        self.redundant().iter().map(|m| m.size).sum()
    }
}

#[derive(Debug, Default, Serialize)]
pub struct ScanReport {
    pub scanned: usize,
    pub groups: Vec<DuplicateGroup>,
    /// Ids whose content could not be read; excluded from grouping.
    pub unreadable: Vec<String>,
}

impl ScanReport {
    pub fn safe_groups(&self) -> impl Iterator<Item = &DuplicateGroup> {
        self.groups.iter().filter(|g| !g.is_suspicious())
    }

    pub fn suspicious_groups(&self) -> impl Iterator<Item = &DuplicateGroup> {
        self.groups.iter().filter(|g| g.is_suspicious())
    }
}

/// Hash every stored blob and group exact duplicates.
///
/// `cache` belongs to the caller and lives for one pass. Read failures are
/// logged and the blob is left out; only failing to list the store is an error.
pub fn find_duplicate_groups(
    store: &dyn ContentStore,
    cache: &mut HashCache,
    options: &DedupOptions,
) -> Result<ScanReport, StoreError> {
    let ids = store.ids()?;
    let service = HashService::new(store, options.hash);

    let mut by_hash: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut unreadable = Vec::new();
    for (id, result) in service.compute_content_hashes_batch(&ids, cache) {
        match result {
            Ok(hash) => by_hash.entry(hash).or_default().push(id),
            Err(e) => {
                log::warn!("Skipping {} during duplicate scan: {}", id, e);
                unreadable.push(id);
            }
        }
    }

    let mut groups: Vec<DuplicateGroup> = by_hash
        .into_iter()
        .filter(|(_, ids)| ids.len() > 1)
        .map(|(hash, ids)| build_group(store, hash, ids, options))
        .collect();
    groups.sort_by(|a, b| a.keep().id.cmp(&b.keep().id));

    log::info!(
        "Scanned {} blobs: {} duplicate groups ({} suspicious)",
        ids.len(),
        groups.len(),
        groups.iter().filter(|g| g.is_suspicious()).count()
    );

    Ok(ScanReport {
        scanned: ids.len(),
        groups,
        unreadable,
    })
}

fn build_group(
    store: &dyn ContentStore,
    hash: String,
    ids: Vec<String>,
    options: &DedupOptions,
) -> DuplicateGroup {
    let mut members: Vec<GroupMember> = ids
        .into_iter()
        .map(|id| {
            let size = store.size(&id).ok().flatten().unwrap_or(0);
            GroupMember {
                timestamp: timestamp_from_id(&id),
                id,
                size,
            }
        })
        .collect();
    // Stable: members without a timestamp keep extraction order after the rest.
    members.sort_by_key(|m| (m.timestamp.is_none(), m.timestamp));

    let timestamps: Vec<Option<i64>> = members.iter().map(|m| m.timestamp).collect();
    let classification = classify(&timestamps, options);
    DuplicateGroup {
        hash,
        members,
        classification,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeletionFailure {
    pub id: String,
    pub error: String,
}

#[derive(Debug, Default, Serialize)]
pub struct CleanupReport {
    pub groups_cleaned: usize,
    pub groups_skipped: usize,
    pub attempted: usize,
    pub removed: usize,
    pub bytes_reclaimed: u64,
    pub failures: Vec<DeletionFailure>,
    /// Removed id → kept id, for [`relink_entities`].
    pub remap: BTreeMap<String, String>,
}

/// Delete the redundant members of every safe group. Suspicious groups are skipped.
pub fn cleanup_duplicates(store: &dyn ContentStore, groups: &[DuplicateGroup]) -> CleanupReport {
    cleanup_duplicates_with(store, groups, |_| false)
}

/// Like [`cleanup_duplicates`], asking `confirm_suspicious` about each suspicious group.
///
/// Deletion is irreversible. Each deletion succeeds or fails on its own; a
/// failure is recorded and the remaining members are still processed.
pub fn cleanup_duplicates_with<F>(
    store: &dyn ContentStore,
    groups: &[DuplicateGroup],
    mut confirm_suspicious: F,
) -> CleanupReport
where
    F: FnMut(&DuplicateGroup) -> bool,
{
    let mut report = CleanupReport::default();

    for group in groups {
        if group.is_suspicious() && !confirm_suspicious(group) {
            log::info!(
                "Skipping suspicious group {}: {}",
                group.hash,
                group.classification.reason
            );
            report.groups_skipped += 1;
            continue;
        }

        let kept = &group.keep().id;
        for member in group.redundant() {
            report.attempted += 1;
            match store.delete(&member.id) {
                Ok(()) => {
                    log::debug!("Removed {} (duplicate of {})", member.id, kept);
                    report.removed += 1;
                    report.bytes_reclaimed += member.size;
                    report.remap.insert(member.id.clone(), kept.clone());
                }
                Err(e) => {
                    log::warn!("Failed to remove {}: {}", member.id, e);
                    report.failures.push(DeletionFailure {
                        id: member.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        report.groups_cleaned += 1;
    }

    log::info!(
        "Cleanup removed {}/{} blobs, reclaimed {} bytes",
        report.removed,
        report.attempted,
        report.bytes_reclaimed
    );
    report
}

/// Point references at removed blobs to the kept copy. Returns the number of
/// references rewritten; an entity never ends up listing the same id twice.
pub fn relink_entities(entities: &mut [PointEntity], remap: &BTreeMap<String, String>) -> usize {
    let mut rewritten = 0;
    for entity in entities.iter_mut() {
        if !entity.images.iter().any(|r| remap.contains_key(r)) {
            continue;
        }
        let mut seen = HashSet::new();
        let mut images = Vec::with_capacity(entity.images.len());
        for raw in entity.images.drain(..) {
            let target = match remap.get(&raw) {
                Some(kept) => {
                    rewritten += 1;
                    kept.clone()
                }
                None => raw,
            };
            if seen.insert(target.clone()) {
                images.push(target);
            }
        }
        entity.images = images;
    }
    rewritten
}

/// Stored ids no entity references.
pub fn find_orphans(
    store: &dyn ContentStore,
    entities: &[PointEntity],
) -> Result<Vec<String>, StoreError> {
    let referenced: HashSet<&str> = entities
        .iter()
        .flat_map(|e| e.content_refs().filter_map(|r| r.stored_id()))
        .collect();
    Ok(store
        .ids()?
        .into_iter()
        .filter(|id| !referenced.contains(id.as_str()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::MemoryStore;
    use crate::models::Coordinate;

    fn opts() -> DedupOptions {
        DedupOptions::default()
    }

    #[test]
    fn test_three_copies_within_500ms_suspicious() {
        let c = classify(&[Some(1_000), Some(1_200), Some(1_500)], &opts());
        assert_eq!(c.verdict, Verdict::Suspicious);
    }

    #[test]
    fn test_three_copies_spread_2000ms_safe() {
        let c = classify(&[Some(1_000), Some(2_000), Some(3_000)], &opts());
        assert_eq!(c.verdict, Verdict::Safe);
    }

    #[test]
    fn test_two_close_copies_are_safe() {
        let c = classify(&[Some(1_000), Some(1_400)], &opts());
        assert_eq!(c.verdict, Verdict::Safe);
    }

    #[test]
    fn test_identical_timestamps_suspicious_for_pairs() {
        let c = classify(&[Some(5), Some(5)], &opts());
        assert_eq!(c.verdict, Verdict::Suspicious);
        assert!(c.reason.contains("same creation time"));
    }

    #[test]
    fn test_window_is_exclusive() {
        let c = classify(&[Some(0), Some(500), Some(1_000)], &opts());
        assert_eq!(c.verdict, Verdict::Safe);
        let c = classify(&[Some(0), Some(500), Some(999)], &opts());
        assert_eq!(c.verdict, Verdict::Suspicious);
    }

    #[test]
    fn test_unknown_timestamp_suspicious() {
        let c = classify(&[Some(0), None], &opts());
        assert_eq!(c.verdict, Verdict::Suspicious);
    }

    fn seeded_store() -> MemoryStore {
        let store = MemoryStore::new();
        // Safe: same photo saved days apart.
        store.put("img_1000_aaaa0001", b"sunset").unwrap();
        store.put("img_900000000_aaaa0002", b"sunset").unwrap();
        // Suspicious: three saves within one burst.
        store.put("img_5000_bbbb0001", b"harbour").unwrap();
        store.put("img_5100_bbbb0002", b"harbour").unwrap();
        store.put("img_5200_bbbb0003", b"harbour").unwrap();
        // Unique.
        store.put("img_7000_cccc0001", b"mountain").unwrap();
        store
    }

    #[test]
    fn test_scan_groups_and_orders_members() {
        let store = seeded_store();
        let mut cache = HashCache::new();
        let report = find_duplicate_groups(&store, &mut cache, &opts()).unwrap();

        assert_eq!(report.scanned, 6);
        assert_eq!(report.groups.len(), 2);
        assert!(report.unreadable.is_empty());

        let safe: Vec<_> = report.safe_groups().collect();
        assert_eq!(safe.len(), 1);
        assert_eq!(safe[0].keep().id, "img_1000_aaaa0001");
        assert_eq!(safe[0].reclaimable_bytes(), 6);

        let suspicious: Vec<_> = report.suspicious_groups().collect();
        assert_eq!(suspicious.len(), 1);
        assert_eq!(suspicious[0].members.len(), 3);
        assert_eq!(suspicious[0].keep().id, "img_5000_bbbb0001");
    }

    #[test]
    fn test_cleanup_skips_suspicious_by_default() {
        let store = seeded_store();
        let mut cache = HashCache::new();
        let report = find_duplicate_groups(&store, &mut cache, &opts()).unwrap();

        let cleanup = cleanup_duplicates(&store, &report.groups);
        assert_eq!(cleanup.groups_cleaned, 1);
        assert_eq!(cleanup.groups_skipped, 1);
        assert_eq!(cleanup.attempted, 1);
        assert_eq!(cleanup.removed, 1);
        assert_eq!(cleanup.bytes_reclaimed, 6);
        assert_eq!(
            cleanup.remap.get("img_900000000_aaaa0002").map(String::as_str),
            Some("img_1000_aaaa0001")
        );
        assert_eq!(store.len(), 5);
    }

    #[test]
    fn test_confirmed_suspicious_group_is_cleaned() {
        let store = seeded_store();
        let mut cache = HashCache::new();
        let report = find_duplicate_groups(&store, &mut cache, &opts()).unwrap();

        let mut asked = 0;
        let cleanup = cleanup_duplicates_with(&store, &report.groups, |_| {
            asked += 1;
            true
        });
        assert_eq!(asked, 1);
        assert_eq!(cleanup.removed, 3);
        assert_eq!(store.ids().unwrap().len(), 3);
    }

    struct FlakyStore {
        inner: MemoryStore,
        fail_delete: &'static str,
        fail_read: &'static str,
    }

    impl ContentStore for FlakyStore {
        fn get(&self, id: &str) -> Result<Option<Vec<u8>>, StoreError> {
            if id == self.fail_read {
                return Err(StoreError::Io(std::io::Error::other("disk read error")));
            }
            self.inner.get(id)
        }
        fn put(&self, id: &str, bytes: &[u8]) -> Result<String, StoreError> {
            self.inner.put(id, bytes)
        }
        fn delete(&self, id: &str) -> Result<(), StoreError> {
            if id == self.fail_delete {
                return Err(StoreError::Io(std::io::Error::other("device busy")));
            }
            self.inner.delete(id)
        }
        fn ids(&self) -> Result<Vec<String>, StoreError> {
            self.inner.ids()
        }
    }

    #[test]
    fn test_deletion_failure_does_not_abort_group() {
        let inner = MemoryStore::new();
        inner.put("img_1000_a", b"copy").unwrap();
        inner.put("img_5000_b", b"copy").unwrap();
        inner.put("img_9000_c", b"copy").unwrap();
        inner.put("img_9500_d", b"other").unwrap();
        let store = FlakyStore {
            inner,
            fail_delete: "img_5000_b",
            fail_read: "img_9500_d",
        };

        let mut cache = HashCache::new();
        let report = find_duplicate_groups(&store, &mut cache, &opts()).unwrap();
        assert_eq!(report.unreadable, vec!["img_9500_d"]);
        assert_eq!(report.groups.len(), 1);

        let cleanup = cleanup_duplicates(&store, &report.groups);
        assert_eq!(cleanup.attempted, 2);
        assert_eq!(cleanup.removed, 1);
        assert_eq!(cleanup.failures.len(), 1);
        assert_eq!(cleanup.failures[0].id, "img_5000_b");
        assert!(store.inner.get("img_9000_c").unwrap().is_none());
        assert!(!cleanup.remap.contains_key("img_5000_b"));
    }

    #[test]
    fn test_relink_and_orphans() {
        let store = MemoryStore::new();
        store.put("img_1_keep", b"x").unwrap();
        store.put("img_2_lost", b"y").unwrap();

        let mut a = PointEntity::new("a", Coordinate::new(1.0, 1.0));
        a.images = vec!["img_1_keep".into(), "img_9_gone".into()];
        let mut b = PointEntity::new("b", Coordinate::new(2.0, 2.0));
        b.images = vec!["data:image/png;base64,AAAA".into(), "img_9_gone".into()];
        let mut entities = vec![a, b];

        let mut remap = BTreeMap::new();
        remap.insert("img_9_gone".to_string(), "img_1_keep".to_string());
        assert_eq!(relink_entities(&mut entities, &remap), 2);
        assert_eq!(entities[0].images, vec!["img_1_keep"]);
        assert_eq!(
            entities[1].images,
            vec!["data:image/png;base64,AAAA", "img_1_keep"]
        );

        assert_eq!(find_orphans(&store, &entities).unwrap(), vec!["img_2_lost"]);
    }
}
