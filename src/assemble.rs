use geojson::{Feature, FeatureCollection, Geometry, JsonObject, Value};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use crate::error::{IndexError, Result};
use crate::record::{Category, GeohashCluster, PointRecord};
use crate::render::renderer_for;
use crate::store::DocumentStore;

/// Fetch every cluster inside `ranges` and render its records as one flat
/// GeoJSON FeatureCollection.
pub fn assemble(
    store: &dyn DocumentStore,
    collection: &str,
    ranges: &[(String, String)],
) -> Result<FeatureCollection> {
    let mut clusters: BTreeMap<String, GeohashCluster> = BTreeMap::new();
    for (start, end) in ranges {
        let docs = store.query_range(collection, start, end)?;
        debug!(start = %start, end = %end, clusters = docs.len(), "scanned range");
        for (key, doc) in docs {
            if clusters.contains_key(&key) {
                continue;
            }
            let cluster: GeohashCluster = serde_json::from_value(doc)
                .map_err(|source| IndexError::MalformedCluster { key: key.clone(), source })?;
            clusters.insert(key, cluster);
        }
    }
    Ok(to_feature_collection(clusters.values()))
}

/// Flatten clusters per category (ids deduplicated within a category) and
/// render each record.
pub fn to_feature_collection<'a>(
    clusters: impl Iterator<Item = &'a GeohashCluster> + Clone,
) -> FeatureCollection {
    let mut features = Vec::new();
    for category in Category::ALL {
        let mut seen = HashSet::new();
        for record in clusters.clone().flat_map(|c| c.records(category)) {
            if seen.insert(record.id.as_str()) {
                features.push(record_to_feature(category, record));
            }
        }
    }

    FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    }
}

fn record_to_feature(category: Category, record: &PointRecord) -> Feature {
    let renderer = renderer_for(category);

    let mut coords = vec![record.lng, record.lat];
    if let Some(elevation) = record.elevation() {
        coords.push(elevation);
    }

    let mut properties: JsonObject = record.attributes.clone();
    properties.insert("id".to_string(), record.id.clone().into());
    properties.insert("category".to_string(), category.key().into());
    properties.insert("title".to_string(), renderer.title(record).into());
    properties.insert("description".to_string(), renderer.description(record).into());
    properties.insert(
        "icon".to_string(),
        serde_json::to_value(renderer.icon(record)).unwrap_or_default(),
    );

    Feature {
        bbox: None,
        geometry: Some(Geometry::new(Value::Point(coords))),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    }
}
