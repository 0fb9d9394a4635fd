use crate::core::store::{ContentStore, StoreError, STORED_ID_PREFIX};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Malformed inline content: {message}")]
    MalformedInline { message: String },

    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Geographic (lat/lng) or image-space (y/x) coordinate pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_finite(&self) -> bool {
        self.lat.is_finite() && self.lng.is_finite()
    }

    /// Finite and not the (0, 0) placeholder some cameras write when they have no fix.
    pub fn is_usable(&self) -> bool {
        self.is_finite() && !(self.lat == 0.0 && self.lng == 0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScreenPoint {
    pub x: f64,
    pub y: f64,
}

impl ScreenPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance_to(&self, other: &ScreenPoint) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// A pinned note: the unit the map clusters and the importers create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointEntity {
    pub id: String,
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub favorite: bool,
    /// Content references, see [`ContentRef`].
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub text: String,
    /// Unix millis.
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default)]
    pub version: u32,
}

impl PointEntity {
    pub fn new(id: impl Into<String>, coordinate: Coordinate) -> Self {
        Self {
            id: id.into(),
            lat: coordinate.lat,
            lng: coordinate.lng,
            favorite: false,
            images: Vec::new(),
            text: String::new(),
            created_at: 0,
            updated_at: 0,
            version: 1,
        }
    }

    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.lat, self.lng)
    }

    pub fn has_valid_coordinate(&self) -> bool {
        self.coordinate().is_finite()
    }

    pub fn content_refs(&self) -> impl Iterator<Item = ContentRef<'_>> {
        self.images.iter().map(|raw| ContentRef::parse(raw))
    }
}

/// Either an id into the content store or an inline `data:` URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentRef<'a> {
    Stored(&'a str),
    Inline(&'a str),
}

impl<'a> ContentRef<'a> {
    pub fn parse(raw: &'a str) -> Self {
        if raw.starts_with(STORED_ID_PREFIX) {
            ContentRef::Stored(raw)
        } else {
            ContentRef::Inline(raw)
        }
    }

    pub fn stored_id(&self) -> Option<&'a str> {
        match self {
            ContentRef::Stored(id) => Some(id),
            ContentRef::Inline(_) => None,
        }
    }

    /// Raw bytes behind this reference. `Ok(None)` means the store has no such id.
    pub fn resolve(&self, store: &dyn ContentStore) -> Result<Option<Vec<u8>>, ContentError> {
        match self {
            ContentRef::Stored(id) => Ok(store.get(id)?),
            ContentRef::Inline(raw) => decode_data_url(raw).map(Some),
        }
    }
}

/// Decode `data:<mime>;base64,<payload>`. A bare base64 string is accepted too.
pub fn decode_data_url(raw: &str) -> Result<Vec<u8>, ContentError> {
    let payload = match raw.strip_prefix("data:") {
        Some(rest) => {
            let (header, payload) =
                rest.split_once(',')
                    .ok_or_else(|| ContentError::MalformedInline {
                        message: "missing ',' after data URL header".to_string(),
                    })?;
            if !header.ends_with(";base64") {
                return Err(ContentError::MalformedInline {
                    message: format!("unsupported data URL encoding: {}", header),
                });
            }
            payload
        }
        None => raw,
    };
    Ok(STANDARD.decode(payload.trim())?)
}

pub fn encode_data_url(mime: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", mime, STANDARD.encode(bytes))
}
