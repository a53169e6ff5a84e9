//! Covering geohash ranges for circle and bounding-box queries.
//!
//! A circle is covered by hashing nine sample points (center, the four edge
//! midpoints and the four corners of its bounding box) at a bit depth where
//! one cell is at least as large as the radius, then widening each hash to
//! the prefix range of that depth. Consecutive sample points are at most one
//! cell apart, so every cell the circle touches is hit by some sample.

use geo::{Distance, Haversine, Point};
use tracing::debug;

use crate::cells::{
    BASE32, BITS_PER_CHAR, DEFAULT_PRECISION, base32_index, geohash, validate_coordinate,
};
use crate::error::{IndexError, Result};

pub const MIN_RADIUS_M: f64 = 200.0;
pub const MAX_RADIUS_M: f64 = 10_000.0;

const METERS_PER_DEGREE_LATITUDE: f64 = 110_574.0;
const EARTH_MERIDIONAL_CIRCUMFERENCE: f64 = 40_007_860.0;
const EARTH_EQ_RADIUS: f64 = 6_378_137.0;
const E2: f64 = 0.006_694_478_197_99;
const EPSILON: f64 = 1e-12;

/// Sample offsets are computed on the ellipsoid while query distances are
/// haversine on a sphere, and the cell-size estimate uses a mean meridian
/// length. Both sides get this margin to absorb the < 0.6% mismatch.
const COVER_MARGIN: f64 = 1.01;

/// A validated query region.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QueryRegion {
    Circle { lat: f64, lng: f64, radius_m: f64 },
    BBox { sw_lng: f64, sw_lat: f64, ne_lng: f64, ne_lat: f64 },
}

impl QueryRegion {
    pub fn circle(lat: f64, lng: f64, radius_m: f64) -> Result<Self> {
        validate_coordinate(lat, lng).map_err(|_| {
            IndexError::InvalidQuery(format!("center ({}, {}) out of range", lat, lng))
        })?;
        if !radius_m.is_finite() || radius_m <= 0.0 {
            return Err(IndexError::InvalidQuery(format!(
                "radius must be a positive number of meters, got {}",
                radius_m
            )));
        }
        Ok(QueryRegion::Circle { lat, lng, radius_m })
    }

    /// `swX, swY, neX, neY[, swZ, neZ]` in lng/lat order. Elevations are accepted and ignored.
    pub fn bbox(values: &[f64]) -> Result<Self> {
        if values.len() != 4 && values.len() != 6 {
            return Err(IndexError::InvalidQuery(format!(
                "bbox needs 4 or 6 numbers, got {}",
                values.len()
            )));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(IndexError::InvalidQuery("bbox values must be finite".to_string()));
        }
        let (sw_lng, sw_lat, ne_lng, ne_lat) = (values[0], values[1], values[2], values[3]);
        for (lat, lng) in [(sw_lat, sw_lng), (ne_lat, ne_lng)] {
            validate_coordinate(lat, lng).map_err(|_| {
                IndexError::InvalidQuery(format!("bbox corner ({}, {}) out of range", lng, lat))
            })?;
        }
        if sw_lat > ne_lat || sw_lng > ne_lng {
            return Err(IndexError::InvalidQuery(
                "bbox south-west corner must not lie north or east of the north-east corner"
                    .to_string(),
            ));
        }
        Ok(QueryRegion::BBox { sw_lng, sw_lat, ne_lng, ne_lat })
    }

    /// Parse a comma separated bbox parameter.
    pub fn parse_bbox(raw: &str) -> Result<Self> {
        let values = raw
            .split(',')
            .map(|part| {
                let part = part.trim();
                part.parse::<f64>().map_err(|_| {
                    IndexError::InvalidQuery(format!("bbox value '{}' is not a number", part))
                })
            })
            .collect::<Result<Vec<f64>>>()?;
        Self::bbox(&values)
    }

    /// Build a region from raw request parameters: either `lat`/`lng`/`radius` or `bbox`.
    pub fn from_params(
        lat: Option<f64>,
        lng: Option<f64>,
        radius_m: Option<f64>,
        bbox: Option<&str>,
    ) -> Result<Self> {
        match (lat, lng, radius_m, bbox) {
            (None, None, None, Some(raw)) => Self::parse_bbox(raw),
            (Some(lat), Some(lng), Some(radius), None) => Self::circle(lat, lng, radius),
            (_, _, _, Some(_)) => Err(IndexError::InvalidQuery(
                "bbox cannot be combined with lat/lng/radius".to_string(),
            )),
            _ => Err(IndexError::InvalidQuery(
                "either lat, lng and radius or bbox is required".to_string(),
            )),
        }
    }

    /// Center and radius in meters. A box becomes its midpoint and half its
    /// haversine diagonal, so wide boxes are over-covered.
    pub fn center_radius(&self) -> (f64, f64, f64) {
        match *self {
            QueryRegion::Circle { lat, lng, radius_m } => (lat, lng, radius_m),
            QueryRegion::BBox { sw_lng, sw_lat, ne_lng, ne_lat } => {
                let diagonal =
                    Haversine::distance(Point::new(sw_lng, sw_lat), Point::new(ne_lng, ne_lat));
                ((sw_lat + ne_lat) / 2.0, (sw_lng + ne_lng) / 2.0, diagonal / 2.0)
            }
        }
    }
}

/// Radius bounds applied before planning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangePlanner {
    pub precision: usize,
    pub min_radius_m: f64,
    pub max_radius_m: f64,
}

impl Default for RangePlanner {
    fn default() -> Self {
        Self {
            precision: DEFAULT_PRECISION,
            min_radius_m: MIN_RADIUS_M,
            max_radius_m: MAX_RADIUS_M,
        }
    }
}

impl RangePlanner {
    pub fn clamp_radius(&self, radius_m: f64) -> f64 {
        radius_m.clamp(self.min_radius_m, self.max_radius_m)
    }

    pub fn plan(&self, region: &QueryRegion) -> Result<Vec<(String, String)>> {
        let (lat, lng, radius) = region.center_radius();
        self.covering_ranges(lat, lng, radius)
    }

    /// Geohash ranges `[start, end]` that together contain every stored cell
    /// intersecting the circle. The radius is clamped first.
    pub fn covering_ranges(
        &self,
        lat: f64,
        lng: f64,
        radius_m: f64,
    ) -> Result<Vec<(String, String)>> {
        validate_coordinate(lat, lng)?;
        let reach = self.clamp_radius(radius_m) * COVER_MARGIN;

        let max_bits = self.precision * BITS_PER_CHAR;
        let bits = bounding_box_bits(lat, reach * COVER_MARGIN).clamp(1, max_bits);
        let hash_len = bits.div_ceil(BITS_PER_CHAR);

        let mut ranges: Vec<(String, String)> = Vec::with_capacity(9);
        for (p_lat, p_lng) in bounding_box_samples(lat, lng, reach) {
            let hash = geohash(p_lat, p_lng, hash_len)?;
            let range = prefix_range(&hash, bits)?;
            if !ranges.contains(&range) {
                ranges.push(range);
            }
        }
        debug!(lat, lng, radius_m, bits, ranges = ranges.len(), "planned covering ranges");
        Ok(ranges)
    }
}

/// Widen `hash` to the range of all hashes sharing its first `bits` bits.
fn prefix_range(hash: &str, bits: usize) -> Result<(String, String)> {
    let precision = bits.div_ceil(BITS_PER_CHAR);
    if hash.len() < precision {
        return Ok((hash.to_string(), format!("{}~", hash)));
    }
    let prefix = &hash[..precision];
    let (base, last) = prefix.split_at(precision - 1);
    let last_value = last
        .chars()
        .next()
        .and_then(base32_index)
        .ok_or_else(|| IndexError::InvalidGeohash(hash.to_string()))?;

    let significant_bits = bits - base.len() * BITS_PER_CHAR;
    let unused_bits = BITS_PER_CHAR - significant_bits;
    let start_value = (last_value >> unused_bits) << unused_bits;
    let end_value = start_value + (1 << unused_bits);

    let start = format!("{}{}", base, BASE32[start_value] as char);
    let end = if end_value > 31 {
        format!("{}~", base)
    } else {
        format!("{}{}", base, BASE32[end_value] as char)
    };
    Ok((start, end))
}

fn latitude_bits_for_resolution(resolution: f64) -> f64 {
    (EARTH_MERIDIONAL_CIRCUMFERENCE / 2.0 / resolution).log2()
}

fn meters_to_longitude_degrees(distance: f64, latitude: f64) -> f64 {
    let radians = latitude.to_radians();
    let num = radians.cos() * EARTH_EQ_RADIUS * std::f64::consts::PI / 180.0;
    let denom = 1.0 / (1.0 - E2 * radians.sin() * radians.sin()).sqrt();
    let delta_deg = num * denom;
    if delta_deg < EPSILON {
        if distance > 0.0 { 360.0 } else { 0.0 }
    } else {
        (distance / delta_deg).min(360.0)
    }
}

fn longitude_bits_for_resolution(resolution: f64, latitude: f64) -> f64 {
    let degs = meters_to_longitude_degrees(resolution, latitude);
    if degs.abs() > 0.000_001 {
        (360.0 / degs).log2().max(1.0)
    } else {
        1.0
    }
}

/// Bits of geohash precision whose cells are at least `size` meters in both directions.
fn bounding_box_bits(lat: f64, size: f64) -> usize {
    let lat_delta = size / METERS_PER_DEGREE_LATITUDE;
    let north = (lat + lat_delta).min(90.0);
    let south = (lat - lat_delta).max(-90.0);
    let bits_lat = latitude_bits_for_resolution(size).floor() * 2.0;
    let bits_long_north = longitude_bits_for_resolution(size, north).floor() * 2.0 - 1.0;
    let bits_long_south = longitude_bits_for_resolution(size, south).floor() * 2.0 - 1.0;
    bits_lat.min(bits_long_north).min(bits_long_south).max(1.0) as usize
}

fn wrap_longitude(lng: f64) -> f64 {
    if (-180.0..=180.0).contains(&lng) {
        return lng;
    }
    let adjusted = lng + 180.0;
    if adjusted > 0.0 {
        adjusted % 360.0 - 180.0
    } else {
        180.0 - (-adjusted % 360.0)
    }
}

fn bounding_box_samples(lat: f64, lng: f64, radius: f64) -> [(f64, f64); 9] {
    let lat_degrees = radius / METERS_PER_DEGREE_LATITUDE;
    let north = (lat + lat_degrees).min(90.0);
    let south = (lat - lat_degrees).max(-90.0);
    let long_degs = meters_to_longitude_degrees(radius, north)
        .max(meters_to_longitude_degrees(radius, south));
    let west = wrap_longitude(lng - long_degs);
    let east = wrap_longitude(lng + long_degs);
    [
        (lat, lng),
        (lat, west),
        (lat, east),
        (north, lng),
        (north, west),
        (north, east),
        (south, lng),
        (south, west),
        (south, east),
    ]
}
