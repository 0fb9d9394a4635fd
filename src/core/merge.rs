use crate::config::MergePolicy;
use crate::models::PointEntity;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

pub const DEFAULT_NOTE_TOLERANCE: f64 = 0.0001;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub local_only: usize,
    pub remote_only: usize,
    pub conflicts: usize,
    /// Conflicts resolved in favour of the remote copy.
    pub remote_won: usize,
}

/// Combine two independently edited collections keyed by entity id.
pub fn merge_entity_sets(
    local: &[PointEntity],
    remote: &[PointEntity],
    policy: MergePolicy,
) -> Vec<PointEntity> {
    merge_entity_sets_with_stats(local, remote, policy).0
}

/// Local entities come first in their own order, then remote-only ones in
/// remote order. A repeated id within one side keeps its first occurrence.
pub fn merge_entity_sets_with_stats(
    local: &[PointEntity],
    remote: &[PointEntity],
    policy: MergePolicy,
) -> (Vec<PointEntity>, MergeStats) {
    let mut remote_by_id: HashMap<&str, &PointEntity> = HashMap::with_capacity(remote.len());
    for entity in remote {
        remote_by_id.entry(entity.id.as_str()).or_insert(entity);
    }

    let mut stats = MergeStats::default();
    let mut seen: HashSet<&str> = HashSet::with_capacity(local.len() + remote.len());
    let mut merged = Vec::with_capacity(local.len() + remote.len());

    for ours in local {
        if !seen.insert(ours.id.as_str()) {
            log::debug!("Ignoring repeated local id {}", ours.id);
            continue;
        }
        match remote_by_id.get(ours.id.as_str()) {
            Some(theirs) => {
                stats.conflicts += 1;
                if remote_wins(ours, theirs, policy) {
                    stats.remote_won += 1;
                    merged.push((*theirs).clone());
                } else {
                    merged.push(ours.clone());
                }
            }
            None => {
                stats.local_only += 1;
                merged.push(ours.clone());
            }
        }
    }

    for theirs in remote {
        if seen.insert(theirs.id.as_str()) {
            stats.remote_only += 1;
            merged.push(theirs.clone());
        }
    }

    log::info!(
        "Merged {} local and {} remote entities: {} conflicts ({} taken from remote)",
        local.len(),
        remote.len(),
        stats.conflicts,
        stats.remote_won
    );
    (merged, stats)
}

fn remote_wins(ours: &PointEntity, theirs: &PointEntity, policy: MergePolicy) -> bool {
    match policy {
        MergePolicy::LocalWins => false,
        MergePolicy::NewerVersion => {
            (theirs.version, theirs.updated_at) > (ours.version, ours.updated_at)
        }
    }
}

/// Same place (each axis strictly within `tolerance`) and same trimmed text.
pub fn is_duplicate_note(a: &PointEntity, b: &PointEntity, tolerance: f64) -> bool {
    (a.lat - b.lat).abs() < tolerance
        && (a.lng - b.lng).abs() < tolerance
        && a.text.trim() == b.text.trim()
}

#[derive(Debug, Default)]
pub struct NoteImport {
    pub entities: Vec<PointEntity>,
    pub added: usize,
    pub skipped: usize,
    /// Incoming notes given a fresh id because theirs was taken.
    pub renamed: usize,
}

/// Append `incoming` to `existing`, dropping notes that duplicate an existing one.
pub fn import_notes(
    existing: Vec<PointEntity>,
    incoming: Vec<PointEntity>,
    tolerance: f64,
) -> NoteImport {
    let mut ids: HashSet<String> = existing.iter().map(|e| e.id.clone()).collect();
    let mut result = NoteImport {
        entities: existing,
        ..NoteImport::default()
    };
    let baseline = result.entities.len();

    for mut note in incoming {
        let duplicate = result.entities[..baseline]
            .iter()
            .any(|e| is_duplicate_note(e, &note, tolerance));
        if duplicate {
            log::debug!("Skipping duplicate note {}", note.id);
            result.skipped += 1;
            continue;
        }

        if ids.contains(&note.id) {
            let fresh = unique_id(&note.id, &ids);
            log::debug!("Note id {} already taken, importing as {}", note.id, fresh);
            note.id = fresh;
            result.renamed += 1;
        }
        ids.insert(note.id.clone());
        result.entities.push(note);
        result.added += 1;
    }

    log::info!(
        "Imported {} notes, skipped {} duplicates",
        result.added,
        result.skipped
    );
    result
}

fn unique_id(base: &str, taken: &HashSet<String>) -> String {
    (2..)
        .map(|n| format!("{}-{}", base, n))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or_else(|| base.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Coordinate;

    fn note(id: &str, lat: f64, lng: f64, text: &str) -> PointEntity {
        let mut entity = PointEntity::new(id, Coordinate::new(lat, lng));
        entity.text = text.to_string();
        entity
    }

    fn ids(entities: &[PointEntity]) -> Vec<&str> {
        entities.iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn test_merge_with_itself_is_identity() {
        let x = vec![note("a", 1.0, 1.0, "one"), note("b", 2.0, 2.0, "two")];
        assert_eq!(merge_entity_sets(&x, &x, MergePolicy::LocalWins), x);
        assert_eq!(merge_entity_sets(&x, &x, MergePolicy::NewerVersion), x);
    }

    #[test]
    fn test_local_wins_regardless_of_version() {
        let local = vec![note("a", 1.0, 1.0, "local edit"), note("b", 2.0, 2.0, "b")];
        let mut newer = note("a", 1.0, 1.0, "remote edit");
        newer.version = 7;
        newer.updated_at = 9_999;
        let remote = vec![note("c", 3.0, 3.0, "c"), newer];

        let (merged, stats) = merge_entity_sets_with_stats(&local, &remote, MergePolicy::LocalWins);
        assert_eq!(ids(&merged), vec!["a", "b", "c"]);
        assert_eq!(merged[0].text, "local edit");
        assert_eq!(
            stats,
            MergeStats {
                local_only: 1,
                remote_only: 1,
                conflicts: 1,
                remote_won: 0,
            }
        );
    }

    #[test]
    fn test_newer_version_policy() {
        let mut ours = note("a", 1.0, 1.0, "ours");
        ours.version = 2;
        ours.updated_at = 500;

        let mut theirs = note("a", 1.0, 1.0, "theirs");
        theirs.version = 3;
        theirs.updated_at = 100;
        let merged = merge_entity_sets(&[ours.clone()], &[theirs.clone()], MergePolicy::NewerVersion);
        assert_eq!(merged[0].text, "theirs");

        // Same version: later update wins.
        theirs.version = 2;
        theirs.updated_at = 600;
        let merged = merge_entity_sets(&[ours.clone()], &[theirs.clone()], MergePolicy::NewerVersion);
        assert_eq!(merged[0].text, "theirs");

        // Full tie keeps local.
        theirs.updated_at = 500;
        let merged = merge_entity_sets(&[ours], &[theirs], MergePolicy::NewerVersion);
        assert_eq!(merged[0].text, "ours");
    }

    #[test]
    fn test_repeated_ids_keep_first() {
        let local = vec![note("a", 1.0, 1.0, "first"), note("a", 1.0, 1.0, "second")];
        let merged = merge_entity_sets(&local, &[], MergePolicy::LocalWins);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].text, "first");
    }

    #[test]
    fn test_duplicate_note_rules() {
        let a = note("a", 40.0, -73.0, "Coffee here");
        assert!(is_duplicate_note(&a, &note("b", 40.00005, -73.00005, "  Coffee here\n"), 0.0001));
        assert!(!is_duplicate_note(&a, &note("b", 40.0002, -73.0, "Coffee here"), 0.0001));
        assert!(!is_duplicate_note(&a, &note("b", 40.0, -73.0, "coffee here"), 0.0001));
    }

    #[test]
    fn test_import_notes_drops_duplicates_and_renames_collisions() {
        let existing = vec![note("n1", 40.0, -73.0, "Coffee"), note("n2", 41.0, -74.0, "Bakery")];
        let incoming = vec![
            note("x", 40.00001, -73.00001, "Coffee "),
            note("n2", 10.0, 10.0, "Different place"),
            note("y", 12.0, 12.0, "New"),
        ];

        let result = import_notes(existing, incoming, DEFAULT_NOTE_TOLERANCE);
        assert_eq!(result.added, 2);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.renamed, 1);
        assert_eq!(ids(&result.entities), vec!["n1", "n2", "n2-2", "y"]);
    }
}
