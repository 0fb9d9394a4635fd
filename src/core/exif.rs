use crate::models::Coordinate;
use chrono::{DateTime, Utc};
use exif::{Exif, In, Reader, Tag, Value};
use regex::bytes::Regex;
use std::io::Cursor;

/// Parsed once per photo and handed to every strategy.
pub struct MetadataSource<'a> {
    pub bytes: &'a [u8],
    pub exif: Option<Exif>,
}

impl<'a> MetadataSource<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        // No EXIF (PNG, screenshots, stripped uploads) is normal, not an error.
        let exif = Reader::new()
            .read_from_container(&mut Cursor::new(bytes))
            .ok();
        Self { bytes, exif }
    }
}

/// One way of finding a photo's location.
pub trait CoordinateStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn extract(&self, source: &MetadataSource<'_>) -> Option<Coordinate>;
}

/// Standard GPS IFD: `GPSLatitude`/`GPSLongitude` rationals with hemisphere refs.
///
/// Accepts degree-only and degree-minute layouts as well as full DMS triples.
pub struct GpsIfdStrategy;

impl CoordinateStrategy for GpsIfdStrategy {
    fn name(&self) -> &'static str {
        "exif-gps"
    }

    fn extract(&self, source: &MetadataSource<'_>) -> Option<Coordinate> {
        let exif = source.exif.as_ref()?;
        let lat = gps_component(exif, Tag::GPSLatitude, Tag::GPSLatitudeRef, 'S')?;
        let lng = gps_component(exif, Tag::GPSLongitude, Tag::GPSLongitudeRef, 'W')?;
        Some(Coordinate::new(lat, lng))
    }
}

fn gps_component(exif: &Exif, value_tag: Tag, ref_tag: Tag, negative: char) -> Option<f64> {
    let field = exif.get_field(value_tag, In::PRIMARY)?;
    let magnitude = match &field.value {
        Value::Rational(parts) => {
            let parts: Vec<f64> = parts.iter().map(|r| r.to_f64()).collect();
            dms_to_decimal(&parts)?
        }
        Value::SRational(parts) => {
            let parts: Vec<f64> = parts.iter().map(|r| r.to_f64()).collect();
            dms_to_decimal(&parts)?
        }
        _ => return None,
    };

    let hemisphere = exif
        .get_field(ref_tag, In::PRIMARY)
        .and_then(|f| field_to_string(&f.value))
        .and_then(|s| s.trim().chars().next());

    Some(match hemisphere {
        Some(c) if c.eq_ignore_ascii_case(&negative) => -magnitude.abs(),
        _ => magnitude,
    })
}

/// `[deg]`, `[deg, min]` or `[deg, min, sec]` → decimal degrees.
pub fn dms_to_decimal(parts: &[f64]) -> Option<f64> {
    if parts.is_empty() || parts.len() > 3 || parts.iter().any(|p| !p.is_finite()) {
        return None;
    }
    let value: f64 = parts
        .iter()
        .zip([1.0, 60.0, 3600.0])
        .map(|(part, divisor)| part / divisor)
        .sum();
    Some(value)
}

/// XMP packets: `exif:GPSLatitude="40,0.006N"` (Adobe layout) or
/// `drone-dji:GpsLatitude="+40.0001"` (decimal, used by drones).
pub struct XmpStrategy {
    pattern: Regex,
}

const XMP_GPS_PATTERN: &str =
    r#"(?:exif|drone-dji):G[Pp][Ss](Latitude|Longitude)(?:="([^"]*)"|>([^<]*)<)"#;

impl XmpStrategy {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(XMP_GPS_PATTERN)?,
        })
    }
}

impl CoordinateStrategy for XmpStrategy {
    fn name(&self) -> &'static str {
        "xmp"
    }

    fn extract(&self, source: &MetadataSource<'_>) -> Option<Coordinate> {
        let mut lat = None;
        let mut lng = None;

        for caps in self.pattern.captures_iter(source.bytes) {
            let axis = caps.get(1)?.as_bytes();
            let raw = caps.get(2).or_else(|| caps.get(3))?.as_bytes();
            let Some(value) = std::str::from_utf8(raw).ok().and_then(parse_xmp_degrees) else {
                continue;
            };
            match axis {
                b"Latitude" if lat.is_none() => lat = Some(value),
                b"Longitude" if lng.is_none() => lng = Some(value),
                _ => {}
            }
            if lat.is_some() && lng.is_some() {
                break;
            }
        }

        Some(Coordinate::new(lat?, lng?))
    }
}

/// `"40,0.006N"`, `"40,0,21.6N"` or `"+40.0001"`.
pub fn parse_xmp_degrees(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    let last = raw.chars().last()?;
    if matches!(last.to_ascii_uppercase(), 'N' | 'S' | 'E' | 'W') {
        let body = &raw[..raw.len() - last.len_utf8()];
        let parts: Option<Vec<f64>> = body.split(',').map(|p| p.trim().parse().ok()).collect();
        let magnitude = dms_to_decimal(&parts?)?;
        return Some(if matches!(last.to_ascii_uppercase(), 'S' | 'W') {
            -magnitude
        } else {
            magnitude
        });
    }
    raw.trim_start_matches('+').parse().ok().filter(|v: &f64| v.is_finite())
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtractedCoordinate {
    pub coordinate: Coordinate,
    pub strategy: &'static str,
}

/// Tries strategies in order until one yields a finite, non-zero, in-range pair.
pub struct CoordinateExtractor {
    strategies: Vec<Box<dyn CoordinateStrategy>>,
}

impl CoordinateExtractor {
    pub fn empty() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    pub fn with_strategy(mut self, strategy: impl CoordinateStrategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub fn extract(&self, source: &MetadataSource<'_>) -> Option<ExtractedCoordinate> {
        for strategy in &self.strategies {
            match strategy.extract(source) {
                Some(coordinate) if is_plausible(coordinate) => {
                    log::debug!(
                        "Location {:.6},{:.6} from {}",
                        coordinate.lat,
                        coordinate.lng,
                        strategy.name()
                    );
                    return Some(ExtractedCoordinate {
                        coordinate,
                        strategy: strategy.name(),
                    });
                }
                Some(coordinate) => log::debug!(
                    "Discarding implausible location {:?} from {}",
                    coordinate,
                    strategy.name()
                ),
                None => {}
            }
        }
        None
    }
}

impl Default for CoordinateExtractor {
    fn default() -> Self {
        let extractor = Self::empty().with_strategy(GpsIfdStrategy);
        match XmpStrategy::new() {
            Ok(xmp) => extractor.with_strategy(xmp),
            Err(e) => {
                log::warn!("XMP location strategy unavailable: {}", e);
                extractor
            }
        }
    }
}

fn is_plausible(coordinate: Coordinate) -> bool {
    coordinate.is_usable() && coordinate.lat.abs() <= 90.0 && coordinate.lng.abs() <= 180.0
}

/// Capture time: `DateTimeOriginal`, else `DateTime`.
pub fn capture_time(source: &MetadataSource<'_>) -> Option<DateTime<Utc>> {
    let exif = source.exif.as_ref()?;
    let field = exif
        .get_field(Tag::DateTimeOriginal, In::PRIMARY)
        .or_else(|| exif.get_field(Tag::DateTime, In::PRIMARY))?;
    parse_exif_datetime(&field_to_string(&field.value)?)
}

fn field_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Ascii(vec) => vec.first().map(|ascii_val| {
            String::from_utf8_lossy(ascii_val)
                .trim_end_matches('\0')
                .to_string()
        }),
        Value::Undefined(data, _) => Some(
            String::from_utf8_lossy(data)
                .trim_end_matches('\0')
                .to_string(),
        ),
        _ => None,
    }
}

/// EXIF datetime format: "YYYY:MM:DD HH:MM:SS", treated as UTC.
pub fn parse_exif_datetime(datetime_str: &str) -> Option<DateTime<Utc>> {
    match chrono::NaiveDateTime::parse_from_str(datetime_str.trim(), "%Y:%m:%d %H:%M:%S") {
        Ok(dt) => Some(dt.and_utc()),
        Err(_) => {
            log::warn!("Failed to parse EXIF datetime: {}", datetime_str);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exif::experimental::Writer;
    use exif::{Field, Rational};

    fn rationals(values: &[(u32, u32)]) -> Value {
        Value::Rational(values.iter().map(|&(num, denom)| Rational { num, denom }).collect())
    }

    fn ascii(s: &str) -> Value {
        Value::Ascii(vec![s.as_bytes().to_vec()])
    }

    fn tiff_with(fields: &[Field]) -> Vec<u8> {
        let mut writer = Writer::new();
        for field in fields {
            writer.push_field(field);
        }
        let mut out = Cursor::new(Vec::new());
        writer.write(&mut out, false).unwrap();
        out.into_inner()
    }

    fn field(tag: Tag, value: Value) -> Field {
        Field {
            tag,
            ifd_num: In::PRIMARY,
            value,
        }
    }

    #[test]
    fn test_gps_ifd_with_hemisphere_refs() {
        let bytes = tiff_with(&[
            field(Tag::GPSLatitude, rationals(&[(40, 1), (0, 1), (36, 100)])),
            field(Tag::GPSLatitudeRef, ascii("N")),
            field(Tag::GPSLongitude, rationals(&[(73, 1), (0, 1), (36, 100)])),
            field(Tag::GPSLongitudeRef, ascii("W")),
            field(Tag::DateTimeOriginal, ascii("2023:12:25 14:30:45")),
        ]);
        let source = MetadataSource::new(&bytes);

        let extracted = CoordinateExtractor::default().extract(&source).unwrap();
        assert_eq!(extracted.strategy, "exif-gps");
        assert!((extracted.coordinate.lat - 40.0001).abs() < 1e-9);
        assert!((extracted.coordinate.lng + 73.0001).abs() < 1e-9);

        let taken = capture_time(&source).unwrap();
        assert_eq!(taken.to_rfc3339(), "2023-12-25T14:30:45+00:00");
    }

    #[test]
    fn test_falls_back_to_xmp() {
        let bytes = br#"<x:xmpmeta><rdf:Description drone-dji:GpsLatitude="+22.5431" drone-dji:GpsLongitude="-113.9500" /></x:xmpmeta>"#;
        let source = MetadataSource::new(bytes);
        assert!(source.exif.is_none());

        let extracted = CoordinateExtractor::default().extract(&source).unwrap();
        assert_eq!(extracted.strategy, "xmp");
        assert_eq!(extracted.coordinate, Coordinate::new(22.5431, -113.95));
    }

    #[test]
    fn test_xmp_element_layout() {
        let bytes = b"<exif:GPSLatitude>51,30.5N</exif:GPSLatitude><exif:GPSLongitude>0,7.5W</exif:GPSLongitude>";
        let coordinate = XmpStrategy::new()
            .unwrap()
            .extract(&MetadataSource::new(bytes))
            .unwrap();
        assert!((coordinate.lat - (51.0 + 30.5 / 60.0)).abs() < 1e-9);
        assert!((coordinate.lng + 0.125).abs() < 1e-9);
    }

    #[test]
    fn test_null_island_rejected() {
        let bytes = br#"exif:GPSLatitude="0,0N" exif:GPSLongitude="0,0E""#;
        assert!(CoordinateExtractor::default()
            .extract(&MetadataSource::new(bytes))
            .is_none());
    }

    #[test]
    fn test_custom_strategy_extends_chain() {
        struct Fixed;
        impl CoordinateStrategy for Fixed {
            fn name(&self) -> &'static str {
                "fixed"
            }
            fn extract(&self, _: &MetadataSource<'_>) -> Option<Coordinate> {
                Some(Coordinate::new(1.0, 2.0))
            }
        }

        let extractor = CoordinateExtractor::default().with_strategy(Fixed);
        assert_eq!(extractor.strategy_names(), vec!["exif-gps", "xmp", "fixed"]);
        let extracted = extractor.extract(&MetadataSource::new(b"no metadata")).unwrap();
        assert_eq!(extracted.strategy, "fixed");
    }

    #[test]
    fn test_default_extractor_order() {
        assert!(XmpStrategy::new().is_ok());
        assert_eq!(
            CoordinateExtractor::default().strategy_names(),
            vec!["exif-gps", "xmp"]
        );
    }

    #[test]
    fn test_dms_layouts() {
        assert_eq!(dms_to_decimal(&[12.5]), Some(12.5));
        assert_eq!(dms_to_decimal(&[12.0, 30.0]), Some(12.5));
        assert!((dms_to_decimal(&[12.0, 30.0, 36.0]).unwrap() - 12.51).abs() < 1e-12);
        assert_eq!(dms_to_decimal(&[]), None);
        assert_eq!(dms_to_decimal(&[f64::NAN]), None);
    }

    #[test]
    fn test_parse_xmp_degrees() {
        assert_eq!(parse_xmp_degrees("+40.5"), Some(40.5));
        assert_eq!(parse_xmp_degrees("-3.25"), Some(-3.25));
        assert_eq!(parse_xmp_degrees("10,30S"), Some(-10.5));
        assert_eq!(parse_xmp_degrees("garbage"), None);
    }

    #[test]
    fn test_parse_exif_datetime() {
        use chrono::{Datelike, Timelike};

        let parsed = parse_exif_datetime("2023:12:25 14:30:45").unwrap();
        assert_eq!(parsed.year(), 2023);
        assert_eq!(parsed.month(), 12);
        assert_eq!(parsed.day(), 25);
        assert_eq!(parsed.hour(), 14);
        assert_eq!(parsed.minute(), 30);
        assert_eq!(parsed.second(), 45);
        assert!(parse_exif_datetime("yesterday").is_none());
    }
}
