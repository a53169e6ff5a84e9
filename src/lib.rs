//! Geohash cluster index for fire-department map features.
//!
//! Point features (hydrants, risk and danger objects, ponds, suction points)
//! are bucketed into fixed-precision geohash cells, merged across imports,
//! persisted in bounded batches and served back as GeoJSON for circle and
//! bounding-box queries.

pub mod assemble;
pub mod batch;
pub mod cells;
pub mod cluster;
pub mod config;
pub mod error;
pub mod planner;
pub mod projection;
pub mod rebuild;
pub mod record;
pub mod render;
pub mod source;
pub mod store;

pub use error::{IndexError, Result};
