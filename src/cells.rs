//! Geohash cell assignment for WGS84 points.

use geohash::{Coord, Rect};

use crate::error::{IndexError, Result};

/// Index precision in characters (~1.2 km x 0.6 km cells).
pub const DEFAULT_PRECISION: usize = 6;

pub const BITS_PER_CHAR: usize = 5;

pub const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

pub fn validate_coordinate(lat: f64, lng: f64) -> Result<()> {
    if !lat.is_finite() || !lng.is_finite() || lat.abs() > 90.0 || lng.abs() > 180.0 {
        return Err(IndexError::InvalidCoordinate { lat, lng });
    }
    Ok(())
}

/// Geohash of a WGS84 point at `precision` characters.
pub fn geohash(lat: f64, lng: f64, precision: usize) -> Result<String> {
    validate_coordinate(lat, lng)?;
    geohash::encode(Coord { x: lng, y: lat }, precision)
        .map_err(|_| IndexError::InvalidCoordinate { lat, lng })
}

/// Bounding box (x = lng, y = lat) of the cell a hash names.
pub fn decode_bbox(hash: &str) -> Result<Rect<f64>> {
    geohash::decode_bbox(hash).map_err(|_| IndexError::InvalidGeohash(hash.to_string()))
}

pub fn base32_index(c: char) -> Option<usize> {
    BASE32.iter().position(|&b| b as char == c)
}
