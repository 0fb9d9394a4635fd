//! Screen-space clustering of map pins.
//!
//! Clusters are recomputed from scratch for every view transform and never
//! stored. Grouping is seed-relative: each cluster absorbs the unvisited points
//! within the threshold of its seed only, so membership is not transitive.

use crate::models::{Coordinate, PointEntity, ScreenPoint};
use serde::Serialize;
use std::cmp::Ordering;
use std::f64::consts::PI;

pub const DEFAULT_THRESHOLD_PX: f64 = 40.0;
pub const DEFAULT_LAT_EPSILON: f64 = 1e-4;

/// Maps a coordinate to a pixel position under the current view transform.
pub trait Projector {
    fn project(&self, coordinate: Coordinate) -> Option<ScreenPoint>;

    /// `false` until the view has been laid out.
    fn is_ready(&self) -> bool {
        true
    }
}

impl<F> Projector for F
where
    F: Fn(Coordinate) -> Option<ScreenPoint>,
{
    fn project(&self, coordinate: Coordinate) -> Option<ScreenPoint> {
        self(coordinate)
    }
}

/// Spherical Web Mercator with 256px tiles, centred on `center` in a viewport.
#[derive(Debug, Clone, Copy)]
pub struct WebMercator {
    pub center: Coordinate,
    pub zoom: f64,
    pub width: f64,
    pub height: f64,
}

impl WebMercator {
    const TILE_SIZE: f64 = 256.0;
    const MAX_LAT: f64 = 85.051_128_779_806_59;

    pub fn new(center: Coordinate, zoom: f64, width: f64, height: f64) -> Self {
        Self {
            center,
            zoom,
            width,
            height,
        }
    }

    fn world_pixel(&self, coordinate: Coordinate) -> (f64, f64) {
        let scale = Self::TILE_SIZE * 2f64.powf(self.zoom);
        let lat = coordinate.lat.clamp(-Self::MAX_LAT, Self::MAX_LAT).to_radians();
        let x = (coordinate.lng + 180.0) / 360.0 * scale;
        let y = (1.0 - (lat.tan() + 1.0 / lat.cos()).ln() / PI) / 2.0 * scale;
        (x, y)
    }
}

impl Projector for WebMercator {
    fn project(&self, coordinate: Coordinate) -> Option<ScreenPoint> {
        if !coordinate.is_finite() {
            return None;
        }
        let (cx, cy) = self.world_pixel(self.center);
        let (x, y) = self.world_pixel(coordinate);
        let point = ScreenPoint::new(x - cx + self.width / 2.0, y - cy + self.height / 2.0);
        (point.x.is_finite() && point.y.is_finite()).then_some(point)
    }

    fn is_ready(&self) -> bool {
        self.width > 0.0 && self.height > 0.0 && self.zoom.is_finite() && self.center.is_finite()
    }
}

/// Flat projection for custom image canvases: `lat` is the image row, `lng` the column.
#[derive(Debug, Clone, Copy)]
pub struct ImageCanvas {
    pub scale: f64,
    pub offset: ScreenPoint,
}

impl ImageCanvas {
    pub fn new(scale: f64, offset: ScreenPoint) -> Self {
        Self { scale, offset }
    }
}

impl Projector for ImageCanvas {
    fn project(&self, coordinate: Coordinate) -> Option<ScreenPoint> {
        if !coordinate.is_finite() {
            return None;
        }
        Some(ScreenPoint::new(
            coordinate.lng * self.scale + self.offset.x,
            coordinate.lat * self.scale + self.offset.y,
        ))
    }

    fn is_ready(&self) -> bool {
        self.scale.is_finite() && self.scale > 0.0
    }
}

/// Reading order: favorites first, then latitude ascending (values within
/// `lat_epsilon` tie), then longitude ascending, then id.
pub fn reading_order(a: &PointEntity, b: &PointEntity, lat_epsilon: f64) -> Ordering {
    b.favorite
        .cmp(&a.favorite)
        .then_with(|| {
            if (a.lat - b.lat).abs() <= lat_epsilon {
                Ordering::Equal
            } else {
                a.lat.total_cmp(&b.lat)
            }
        })
        .then_with(|| a.lng.total_cmp(&b.lng))
        .then_with(|| a.id.cmp(&b.id))
}

/// Stable insertion sort by [`reading_order`].
///
/// The epsilon tie makes the order non-transitive, which `slice::sort_by` may
/// reject; insertion sort only needs pairwise answers.
pub fn sort_reading_order(points: &mut [&PointEntity], lat_epsilon: f64) {
    for i in 1..points.len() {
        let mut j = i;
        while j > 0 && reading_order(points[j - 1], points[j], lat_epsilon) == Ordering::Greater {
            points.swap(j - 1, j);
            j -= 1;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Cluster<'a> {
    /// Members in reading order; the first is the representative.
    pub members: Vec<&'a PointEntity>,
    /// Screen position of the representative, if it could be projected.
    pub anchor: Option<ScreenPoint>,
}

impl<'a> Cluster<'a> {
    pub fn representative(&self) -> &'a PointEntity {
        self.members[0]
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ClusterOptions {
    pub threshold_px: f64,
    pub lat_epsilon: f64,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            threshold_px: DEFAULT_THRESHOLD_PX,
            lat_epsilon: DEFAULT_LAT_EPSILON,
        }
    }
}

/// Group points whose projections lie within `threshold_px` of a cluster seed.
///
/// Points without finite coordinates are skipped. Every other point lands in
/// exactly one cluster. An unready projector yields no clusters; callers retry
/// once the view is laid out. A pair where either side fails to project is
/// never merged.
pub fn compute_clusters<'a, P>(
    points: &'a [PointEntity],
    projector: &P,
    options: ClusterOptions,
) -> Vec<Cluster<'a>>
where
    P: Projector + ?Sized,
{
    if !projector.is_ready() {
        log::debug!("Projection unavailable, deferring clustering");
        return Vec::new();
    }

    let mut sorted: Vec<&PointEntity> = points.iter().filter(|p| p.has_valid_coordinate()).collect();
    sort_reading_order(&mut sorted, options.lat_epsilon);

    // One projection per point per pass; the view cannot move mid-computation.
    let positions: Vec<Option<ScreenPoint>> = sorted
        .iter()
        .map(|p| projector.project(p.coordinate()))
        .collect();

    let mut visited = vec![false; sorted.len()];
    let mut clusters = Vec::new();

    for seed in 0..sorted.len() {
        if visited[seed] {
            continue;
        }
        visited[seed] = true;
        let mut members = vec![sorted[seed]];

        if let Some(seed_pos) = positions[seed] {
            for candidate in (seed + 1)..sorted.len() {
                if visited[candidate] {
                    continue;
                }
                let within = positions[candidate]
                    .map(|pos| seed_pos.distance_to(&pos) < options.threshold_px)
                    .unwrap_or(false);
                if within {
                    visited[candidate] = true;
                    members.push(sorted[candidate]);
                }
            }
        }

        // Representative is the reading-order first member.
        sort_reading_order(&mut members, options.lat_epsilon);
        let anchor = projector.project(members[0].coordinate());
        clusters.push(Cluster { members, anchor });
    }

    log::debug!(
        "Clustered {} points into {} clusters",
        sorted.len(),
        clusters.len()
    );
    clusters
}
