//! Sequential bulk import with import-time duplicate warnings.
//!
//! Each item is processed to completion (location, capture time, conversion,
//! fingerprint, duplicate scan, commit) before the next starts, so the scan
//! always sees every item committed earlier in the same run.

use crate::core::convert::{ConversionChain, ConversionError};
use crate::core::exif::{capture_time, CoordinateExtractor, MetadataSource};
use crate::core::fingerprint::{
    fallback, fingerprint_image, DuplicateMatch, Fingerprint, FingerprintIndex, PerceptualHasher,
};
use crate::core::store::{generate_id, ContentStore, StoreError};
use crate::models::{ContentRef, Coordinate, PointEntity};
use chrono::{DateTime, Utc};
use image_hasher::ImageHash;
use serde::Serialize;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("No location found in {name}")]
    MissingCoordinate { name: String },
}

#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    /// Drop flagged items instead of committing them.
    pub skip_duplicates: bool,
    /// Fail items with no usable location.
    pub require_coordinate: bool,
    /// Location for items that carry none; checked before `require_coordinate`.
    pub fallback_coordinate: Option<Coordinate>,
    /// Enables the `Similar` tier.
    pub perceptual_tolerance: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ImportItem {
    pub name: String,
    pub bytes: Vec<u8>,
    /// Overrides anything found in the photo's metadata.
    pub coordinate: Option<Coordinate>,
}

impl ImportItem {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
            coordinate: None,
        }
    }

    pub fn with_coordinate(mut self, coordinate: Coordinate) -> Self {
        self.coordinate = Some(coordinate);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportOutcome {
    pub name: String,
    /// `None` when the item was dropped as a duplicate.
    pub stored_id: Option<String>,
    pub mime: &'static str,
    pub coordinate: Option<Coordinate>,
    pub location_source: Option<&'static str>,
    pub taken_at: Option<DateTime<Utc>>,
    pub fingerprint: String,
    pub duplicate: Option<DuplicateMatch>,
}

impl ImportOutcome {
    pub fn is_duplicate(&self) -> bool {
        self.duplicate.is_some()
    }

    pub fn is_committed(&self) -> bool {
        self.stored_id.is_some()
    }

    /// A new point for this photo, if it was stored and has a location.
    pub fn to_entity(&self, entity_id: impl Into<String>, now_ms: i64) -> Option<PointEntity> {
        let stored_id = self.stored_id.clone()?;
        let coordinate = self.coordinate?;
        let mut entity = PointEntity::new(entity_id, coordinate);
        entity.images.push(stored_id);
        entity.created_at = self.taken_at.map(|t| t.timestamp_millis()).unwrap_or(now_ms);
        entity.updated_at = now_ms;
        Some(entity)
    }
}

#[derive(Debug)]
pub struct ImportFailure {
    pub name: String,
    pub error: ImportError,
}

#[derive(Debug, Default)]
pub struct ImportReport {
    pub outcomes: Vec<ImportOutcome>,
    pub failures: Vec<ImportFailure>,
}

impl ImportReport {
    pub fn committed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_committed()).count()
    }

    pub fn flagged(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_duplicate()).count()
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub struct ImportPipeline<'a> {
    store: &'a dyn ContentStore,
    extractor: CoordinateExtractor,
    converter: ConversionChain,
    index: FingerprintIndex,
    /// Stored content no entity references; matched on pixels only.
    unplaced: FingerprintIndex,
    indexed_ids: HashSet<String>,
    perceptual: Option<PerceptualHasher>,
    options: ImportOptions,
    sequence: u64,
    clock: fn() -> i64,
}

impl<'a> ImportPipeline<'a> {
    pub fn new(
        store: &'a dyn ContentStore,
        extractor: CoordinateExtractor,
        converter: ConversionChain,
        options: ImportOptions,
    ) -> Self {
        let perceptual = options.perceptual_tolerance.map(|_| PerceptualHasher::new());
        Self {
            store,
            extractor,
            converter,
            index: FingerprintIndex::new(),
            unplaced: FingerprintIndex::new(),
            indexed_ids: HashSet::new(),
            perceptual,
            options,
            sequence: 0,
            clock: now_millis,
        }
    }

    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    pub fn indexed(&self) -> usize {
        self.index.len() + self.unplaced.len()
    }

    /// Fingerprint the content already attached to `entities`.
    ///
    /// Unreadable or missing content is logged and skipped; it simply cannot
    /// be matched. Returns the number of items indexed.
    pub fn seed_index(&mut self, entities: &[PointEntity]) -> usize {
        let before = self.index.len();
        for entity in entities {
            let geo = Some(entity.coordinate()).filter(Coordinate::is_usable);
            for content in entity.content_refs() {
                let bytes = match content.resolve(self.store) {
                    Ok(Some(bytes)) => bytes,
                    Ok(None) => {
                        log::debug!("Entity {} references missing content", entity.id);
                        continue;
                    }
                    Err(e) => {
                        log::warn!("Skipping content of entity {}: {}", entity.id, e);
                        continue;
                    }
                };
                let (fp, perceptual) = self.fingerprint_bytes(&bytes, geo);
                let id = match content {
                    ContentRef::Stored(id) => {
                        self.indexed_ids.insert(id.to_string());
                        id.to_string()
                    }
                    ContentRef::Inline(_) => entity.id.clone(),
                };
                self.index.insert(id, fp, perceptual);
            }
        }
        let added = self.index.len() - before;
        log::info!("Indexed {} existing images for duplicate checks", added);
        added
    }

    /// Fingerprint stored content that [`seed_index`](Self::seed_index) did not reach.
    ///
    /// Such content has no known location, so it only matches new items on
    /// pixels. Call after `seed_index`. Unreadable blobs are logged and skipped.
    pub fn seed_store(&mut self) -> Result<usize, StoreError> {
        let mut added = 0;
        for id in self.store.ids()? {
            if self.indexed_ids.contains(&id) {
                continue;
            }
            let bytes = match self.store.get(&id) {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(e) => {
                    log::warn!("Skipping stored content {}: {}", id, e);
                    continue;
                }
            };
            let (fp, perceptual) = self.fingerprint_bytes(&bytes, None);
            self.unplaced.insert(id.clone(), fp, perceptual);
            self.indexed_ids.insert(id);
            added += 1;
        }
        if added > 0 {
            log::info!("Indexed {} unreferenced stored images", added);
        }
        Ok(added)
    }

    fn fingerprint_bytes(
        &self,
        bytes: &[u8],
        geo: Option<Coordinate>,
    ) -> (Fingerprint, Option<ImageHash>) {
        match image::load_from_memory(bytes) {
            Ok(image) => (
                fingerprint_image(&image, geo),
                self.perceptual.as_ref().map(|h| h.hash(&image)),
            ),
            Err(e) => {
                log::warn!("Fingerprint decode failed, falling back to geo only: {}", e);
                (fallback(geo), None)
            }
        }
    }

    pub fn import_item(&mut self, item: ImportItem) -> Result<ImportOutcome, ImportError> {
        let source = MetadataSource::new(&item.bytes);

        let (coordinate, location_source) = match item.coordinate.filter(Coordinate::is_usable) {
            Some(coordinate) => (Some(coordinate), Some("explicit")),
            None => match self.extractor.extract(&source) {
                Some(found) => (Some(found.coordinate), Some(found.strategy)),
                None => match self.options.fallback_coordinate.filter(Coordinate::is_usable) {
                    Some(coordinate) => (Some(coordinate), Some("fallback")),
                    None => (None, None),
                },
            },
        };
        if coordinate.is_none() && self.options.require_coordinate {
            return Err(ImportError::MissingCoordinate { name: item.name });
        }
        let taken_at = capture_time(&source);

        let converted = self.converter.convert(&item.bytes)?;
        // Fingerprint what gets stored so later passes over the store agree.
        let (fp, perceptual) = self.fingerprint_bytes(&converted.bytes, coordinate);

        let duplicate = self
            .index
            .find_match(&fp, perceptual.as_ref(), self.options.perceptual_tolerance)
            .or_else(|| {
                self.unplaced.find_match(
                    &fp.without_geo(),
                    perceptual.as_ref(),
                    self.options.perceptual_tolerance,
                )
            });
        if let Some(found) = &duplicate {
            log::info!(
                "{} looks like a duplicate of {} ({:?})",
                item.name,
                found.existing_id,
                found.kind
            );
        }

        let stored_id = if duplicate.is_some() && self.options.skip_duplicates {
            None
        } else {
            let id = generate_id(&converted.bytes, (self.clock)(), self.sequence);
            self.sequence += 1;
            let id = self.store.put(&id, &converted.bytes)?;
            self.index.insert(id.clone(), fp.clone(), perceptual);
            self.indexed_ids.insert(id.clone());
            Some(id)
        };

        Ok(ImportOutcome {
            name: item.name,
            stored_id,
            mime: converted.mime,
            coordinate,
            location_source,
            taken_at,
            fingerprint: fp.to_string(),
            duplicate,
        })
    }

    /// Import items one after another. A failing item is recorded and the batch continues.
    pub fn import_all(&mut self, items: impl IntoIterator<Item = ImportItem>) -> ImportReport {
        let mut report = ImportReport::default();
        for item in items {
            let name = item.name.clone();
            match self.import_item(item) {
                Ok(outcome) => report.outcomes.push(outcome),
                Err(error) => {
                    log::warn!("Failed to import {}: {}", name, error);
                    report.failures.push(ImportFailure { name, error });
                }
            }
        }
        log::info!(
            "Imported {} items ({} flagged as duplicates, {} failed)",
            report.committed(),
            report.flagged(),
            report.failures.len()
        );
        report
    }
}
