//! Loading category source collections and normalising them into point records.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::cells::validate_coordinate;
use crate::error::{IndexError, Result};
use crate::projection::{ProjectionRegistry, Projector};
use crate::record::{Category, PointRecord};

/// A record as delivered by an import job: WGS84 or survey-grid coordinates.
#[derive(Debug, Clone, Deserialize)]
pub struct RawRecord {
    pub id: RawId,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lng: Option<f64>,
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default)]
    pub y: Option<f64>,
    /// Survey system of `x`/`y`; the configured default when absent.
    #[serde(default)]
    pub system: Option<String>,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawId {
    Text(String),
    Number(serde_json::Number),
}

impl RawId {
    fn into_string(self) -> String {
        match self {
            RawId::Text(s) => s,
            RawId::Number(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub imported: usize,
    pub skipped: usize,
}

/// Parse a JSON array of raw records. Items are checked individually by
/// [`normalize`], so one malformed record does not reject the array.
pub fn parse_collection(json: &str) -> Result<Vec<Value>> {
    serde_json::from_str(json)
        .map_err(|e| IndexError::Source(format!("invalid collection JSON: {}", e)))
}

/// Load a raw collection from a local path or an http(s) URL. URL responses
/// are cached under `cache_dir` and refetched once older than `max_age`.
pub fn load_collection(
    location: &str,
    cache_dir: &Path,
    max_age: Duration,
) -> Result<Vec<Value>> {
    let body = if location.starts_with("http://") || location.starts_with("https://") {
        let cache_path = cache_dir.join(cache_file_name(location));
        fetch_cached(location, &cache_path, max_age)?
    } else {
        std::fs::read_to_string(location)
            .map_err(|e| IndexError::Source(format!("failed to read {}: {}", location, e)))?
    };
    parse_collection(&body)
}

fn cache_file_name(url: &str) -> String {
    let name: String = url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
        .collect();
    format!("{}.json", name)
}

fn cache_is_fresh(cache_path: &Path, max_age: Duration) -> bool {
    std::fs::metadata(cache_path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age < max_age)
}

/// Fetch a URL, using the cached file while it is younger than `max_age`.
fn fetch_cached(url: &str, cache_path: &Path, max_age: Duration) -> Result<String> {
    if cache_is_fresh(cache_path, max_age) {
        debug!(url, path = %cache_path.display(), "serving source from cache");
        return std::fs::read_to_string(cache_path)
            .map_err(|e| IndexError::Source(format!("failed to read cache file: {}", e)));
    }
    info!(url, "fetching source collection");
    let source_err =
        |e: reqwest::Error| IndexError::Source(format!("failed to fetch {}: {}", url, e));

    let client = reqwest::blocking::Client::builder()
        .user_agent("firemap-index/0.1 (cluster index import)")
        .build()
        .map_err(source_err)?;
    let body = client
        .get(url)
        .send()
        .and_then(|r| r.error_for_status())
        .and_then(|r| r.text())
        .map_err(source_err)?;

    if let Some(parent) = cache_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| IndexError::Source(format!("failed to create cache dir: {}", e)))?;
    }
    std::fs::write(cache_path, &body)
        .map_err(|e| IndexError::Source(format!("failed to write cache file: {}", e)))?;
    Ok(body)
}

/// Turn raw records into WGS84 point records. Malformed records, unknown
/// systems, failed projections and out-of-range coordinates are skipped and
/// logged.
pub fn normalize(
    category: Category,
    raw: Vec<Value>,
    registry: &ProjectionRegistry,
    default_system: &str,
) -> (Vec<PointRecord>, ImportReport) {
    let mut projectors: HashMap<String, Projector> = HashMap::new();
    let mut records = Vec::with_capacity(raw.len());
    let mut report = ImportReport::default();

    for (index, value) in raw.into_iter().enumerate() {
        let item: RawRecord = match serde_json::from_value(value) {
            Ok(item) => item,
            Err(e) => {
                warn!(%category, index, error = %e, "skipping malformed record");
                report.skipped += 1;
                continue;
            }
        };
        let id = item.id.into_string();
        let position = match (item.lat, item.lng, item.x, item.y) {
            (Some(lat), Some(lng), _, _) => Ok((lat, lng)),
            (_, _, Some(x), Some(y)) => {
                let system = item.system.as_deref().unwrap_or(default_system);
                project(&mut projectors, registry, system, x, y)
            }
            _ => Err(IndexError::Source("record has neither lat/lng nor x/y".to_string())),
        }
        .and_then(|(lat, lng)| validate_coordinate(lat, lng).map(|_| (lat, lng)));

        match position {
            Ok((lat, lng)) => {
                records.push(PointRecord {
                    id,
                    lat,
                    lng,
                    attributes: item.attributes,
                });
                report.imported += 1;
            }
            Err(e) => {
                warn!(%category, id = %id, error = %e, "skipping record");
                report.skipped += 1;
            }
        }
    }

    info!(
        %category,
        imported = report.imported,
        skipped = report.skipped,
        "normalized source collection"
    );
    (records, report)
}

fn project(
    projectors: &mut HashMap<String, Projector>,
    registry: &ProjectionRegistry,
    system: &str,
    x: f64,
    y: f64,
) -> Result<(f64, f64)> {
    if !projectors.contains_key(system) {
        projectors.insert(system.to_string(), registry.projector(system)?);
    }
    match projectors.get(system) {
        Some(projector) => projector.convert(x, y),
        None => Err(IndexError::UnknownProjection(system.to_string())),
    }
}

/// Memoises normalised collections per category for a bounded time.
/// Owned by the caller, so separate runs never share entries.
pub struct SourceCache {
    ttl: Duration,
    entries: Mutex<HashMap<Category, (Instant, Arc<Vec<PointRecord>>)>>,
}

impl SourceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Cached records for `category`, or the result of `load` when missing or expired.
    pub fn get_or_load<F>(&self, category: Category, load: F) -> Result<Arc<Vec<PointRecord>>>
    where
        F: FnOnce() -> Result<Vec<PointRecord>>,
    {
        if let Some(records) = self.fresh(category) {
            return Ok(records);
        }
        let records = Arc::new(load()?);
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(category, (Instant::now(), Arc::clone(&records)));
        }
        Ok(records)
    }

    fn fresh(&self, category: Category) -> Option<Arc<Vec<PointRecord>>> {
        let entries = self.entries.lock().ok()?;
        let (loaded_at, records) = entries.get(&category)?;
        (loaded_at.elapsed() < self.ttl).then(|| Arc::clone(records))
    }

    pub fn invalidate(&self, category: Category) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(&category);
        }
    }
}
