//! Perceptual fingerprints used to warn about duplicate photos at import time.
//!
//! A fingerprint is the photo's GPS position (six decimals) plus the colour of
//! three corner pixels: top-left, bottom-left and bottom-right. It is cheap,
//! survives re-encoding that keeps corners intact, and is deliberately separate
//! from the storage content hash in [`crate::core::hash`].

use crate::models::Coordinate;
use image::{DynamicImage, GenericImageView};
use image_hasher::{HashAlg, Hasher, HasherConfig, ImageHash};
use serde::Serialize;
use std::fmt;

const NO_GPS: &str = "no_gps";
const UNKNOWN: &str = "unknown";

/// Geo component, formatted as `"{lat:.6}_{lng:.6}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct GeoKey(String);

impl GeoKey {
    /// `None` unless both coordinates are finite.
    pub fn from_coordinate(coordinate: Option<Coordinate>) -> Option<Self> {
        let coordinate = coordinate.filter(Coordinate::is_finite)?;
        Some(Self(format!("{:.6}_{:.6}", coordinate.lat, coordinate.lng)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

pub type Rgb = [u8; 3];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Fingerprint {
    /// Decoded: geo (if any) and the three sampled corners.
    Sampled { geo: Option<GeoKey>, corners: [Rgb; 3] },
    /// Decode failed but the photo carried GPS.
    GeoOnly(GeoKey),
    /// Decode failed and there is no GPS.
    Unknown,
}

impl Fingerprint {
    pub fn geo(&self) -> Option<&GeoKey> {
        match self {
            Fingerprint::Sampled { geo, .. } => geo.as_ref(),
            Fingerprint::GeoOnly(geo) => Some(geo),
            Fingerprint::Unknown => None,
        }
    }

    /// Full-string equality. `Unknown` never matches anything.
    pub fn is_identical(&self, other: &Fingerprint) -> bool {
        !matches!(self, Fingerprint::Unknown) && self == other
    }

    /// Weaker second-pass match: both carry GPS and the geo components agree.
    pub fn same_location(&self, other: &Fingerprint) -> bool {
        match (self.geo(), other.geo()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// The pixel component alone, for comparing against content of unknown location.
    pub fn without_geo(&self) -> Fingerprint {
        match self {
            Fingerprint::Sampled { corners, .. } => Fingerprint::Sampled {
                geo: None,
                corners: *corners,
            },
            Fingerprint::GeoOnly(_) | Fingerprint::Unknown => Fingerprint::Unknown,
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fingerprint::Sampled { geo, corners } => {
                let geo = geo.as_ref().map(GeoKey::as_str).unwrap_or(NO_GPS);
                write!(f, "{}", geo)?;
                for [r, g, b] in corners {
                    write!(f, "_{},{},{}", r, g, b)?;
                }
                Ok(())
            }
            Fingerprint::GeoOnly(geo) => f.write_str(geo.as_str()),
            Fingerprint::Unknown => f.write_str(UNKNOWN),
        }
    }
}

/// Decode `bytes` and fingerprint them. Decode failures fall back to the geo
/// component alone, or `Unknown`.
pub fn fingerprint(bytes: &[u8], geo: Option<Coordinate>) -> Fingerprint {
    match image::load_from_memory(bytes) {
        Ok(image) => fingerprint_image(&image, geo),
        Err(e) => {
            log::warn!("Fingerprint decode failed, falling back to geo only: {}", e);
            fallback(geo)
        }
    }
}

/// Fingerprint for content that could not be decoded.
pub fn fallback(geo: Option<Coordinate>) -> Fingerprint {
    match GeoKey::from_coordinate(geo) {
        Some(key) => Fingerprint::GeoOnly(key),
        None => Fingerprint::Unknown,
    }
}

pub fn fingerprint_image(image: &DynamicImage, geo: Option<Coordinate>) -> Fingerprint {
    let (width, height) = image.dimensions();
    let corners = [
        sample(image, 0, 0),
        sample(image, 0, height.saturating_sub(1)),
        sample(image, width.saturating_sub(1), height.saturating_sub(1)),
    ];
    Fingerprint::Sampled {
        geo: GeoKey::from_coordinate(geo),
        corners,
    }
}

fn sample(image: &DynamicImage, x: u32, y: u32) -> Rgb {
    if !image.in_bounds(x, y) {
        return [0, 0, 0];
    }
    let [r, g, b, _] = image.get_pixel(x, y).0;
    [r, g, b]
}

/// Mean-hash for the optional `Similar` tier.
pub struct PerceptualHasher {
    hasher: Hasher,
}

impl PerceptualHasher {
    pub fn new() -> Self {
        Self {
            hasher: HasherConfig::new().hash_alg(HashAlg::Mean).to_hasher(),
        }
    }

    pub fn hash(&self, image: &DynamicImage) -> ImageHash {
        self.hasher.hash_image(image)
    }
}

impl Default for PerceptualHasher {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MatchKind {
    /// Full fingerprint equality.
    Exact,
    /// Same GPS component only.
    SameLocation,
    /// Mean-hash within tolerance.
    Similar,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateMatch {
    pub existing_id: String,
    pub kind: MatchKind,
}

struct IndexEntry {
    id: String,
    fingerprint: Fingerprint,
    perceptual: Option<ImageHash>,
}

/// Fingerprints of content already known, searched tier by tier.
#[derive(Default)]
pub struct FingerprintIndex {
    entries: Vec<IndexEntry>,
}

impl FingerprintIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        id: impl Into<String>,
        fingerprint: Fingerprint,
        perceptual: Option<ImageHash>,
    ) {
        self.entries.push(IndexEntry {
            id: id.into(),
            fingerprint,
            perceptual,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First exact match wins; otherwise the first same-location match;
    /// otherwise, if `tolerance` is set, the closest perceptual match within it.
    pub fn find_match(
        &self,
        fingerprint: &Fingerprint,
        perceptual: Option<&ImageHash>,
        tolerance: Option<u32>,
    ) -> Option<DuplicateMatch> {
        let found = |entry: &IndexEntry, kind| DuplicateMatch {
            existing_id: entry.id.clone(),
            kind,
        };

        if let Some(entry) = self
            .entries
            .iter()
            .find(|e| e.fingerprint.is_identical(fingerprint))
        {
            return Some(found(entry, MatchKind::Exact));
        }

        if let Some(entry) = self
            .entries
            .iter()
            .find(|e| e.fingerprint.same_location(fingerprint))
        {
            return Some(found(entry, MatchKind::SameLocation));
        }

        let (tolerance, perceptual) = (tolerance?, perceptual?);
        self.entries
            .iter()
            .filter_map(|e| {
                let distance = e.perceptual.as_ref()?.dist(perceptual);
                (distance <= tolerance).then_some((distance, e))
            })
            .min_by_key(|(distance, _)| *distance)
            .map(|(_, entry)| found(entry, MatchKind::Similar))
    }
}
