use gdal::spatial_ref::{AxisMappingStrategy, CoordTransform, SpatialRef};
use std::collections::HashMap;

use crate::error::{IndexError, Result};

pub const DEFAULT_SYSTEM: &str = "EPSG:31256";

const WGS84_DEFINITION: &str = "+proj=longlat +datum=WGS84 +no_defs";

/// Bessel ellipsoid with the MGI shift to WGS84 (position vector, arc-seconds, ppm).
const MGI_DATUM: &str =
    "+ellps=bessel +towgs84=577.326,90.129,463.919,5.137,1.474,5.297,2.4232 +units=m +no_defs";

/// Named planar reference systems, resolved to proj4 definitions.
#[derive(Debug, Clone)]
pub struct ProjectionRegistry {
    definitions: HashMap<String, String>,
}

impl Default for ProjectionRegistry {
    fn default() -> Self {
        let mut definitions = HashMap::new();
        // MGI / Austria Gauss-Krüger West, Central, East
        for (code, lon_0) in [
            ("EPSG:31254", "10.33333333333333"),
            ("EPSG:31255", "13.33333333333333"),
            ("EPSG:31256", "16.33333333333333"),
        ] {
            definitions.insert(
                code.to_string(),
                format!(
                    "+proj=tmerc +lat_0=0 +lon_0={} +k=1 +x_0=0 +y_0=-5000000 {}",
                    lon_0, MGI_DATUM
                ),
            );
        }
        Self { definitions }
    }
}

impl ProjectionRegistry {
    /// Register (or replace) a named system by its proj4 definition.
    pub fn register(&mut self, name: &str, proj4: &str) {
        self.definitions.insert(normalize(name), proj4.to_string());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.definitions.contains_key(&normalize(name))
    }

    pub fn systems(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(String::as_str)
    }

    /// Resolve a system into a reusable transform to WGS84.
    pub fn projector(&self, system: &str) -> Result<Projector> {
        let definition = self
            .definitions
            .get(&normalize(system))
            .ok_or_else(|| IndexError::UnknownProjection(system.to_string()))?;
        let fail = |e: gdal::errors::GdalError| IndexError::Projection {
            system: system.to_string(),
            message: e.to_string(),
        };

        let mut source = SpatialRef::from_proj4(definition).map_err(fail)?;
        source.set_axis_mapping_strategy(AxisMappingStrategy::TraditionalGisOrder);
        let mut target = SpatialRef::from_proj4(WGS84_DEFINITION).map_err(fail)?;
        target.set_axis_mapping_strategy(AxisMappingStrategy::TraditionalGisOrder);

        let transform = CoordTransform::new(&source, &target).map_err(fail)?;
        Ok(Projector {
            system: system.to_string(),
            transform,
        })
    }

    /// Convert easting `x` / northing `y` in `system` to WGS84 `(lat, lng)`.
    pub fn convert(&self, x: f64, y: f64, system: &str) -> Result<(f64, f64)> {
        self.projector(system)?.convert(x, y)
    }
}

/// A resolved transform from one planar system to WGS84.
pub struct Projector {
    system: String,
    transform: CoordTransform,
}

impl Projector {
    pub fn convert(&self, x: f64, y: f64) -> Result<(f64, f64)> {
        if !x.is_finite() || !y.is_finite() {
            return Err(IndexError::Projection {
                system: self.system.clone(),
                message: format!("non-finite input ({}, {})", x, y),
            });
        }
        let mut xs = [x];
        let mut ys = [y];
        let mut zs = [0.0];
        self.transform
            .transform_coords(&mut xs, &mut ys, &mut zs)
            .map_err(|e| IndexError::Projection {
                system: self.system.clone(),
                message: e.to_string(),
            })?;
        // Traditional GIS order: x = longitude, y = latitude.
        Ok((ys[0], xs[0]))
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_ascii_uppercase()
}
