use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{IndexError, Result};

/// Feature category. The serialized name doubles as the key of the
/// category array inside a cluster document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Hydrant,
    RiskObject,
    DangerObject,
    Pond,
    SuctionPoint,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Hydrant,
        Category::RiskObject,
        Category::DangerObject,
        Category::Pond,
        Category::SuctionPoint,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Category::Hydrant => "hydrant",
            Category::RiskObject => "risk_object",
            Category::DangerObject => "danger_object",
            Category::Pond => "pond",
            Category::SuctionPoint => "suction_point",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Category::ALL
            .into_iter()
            .find(|c| c.key() == normalized)
            .ok_or_else(|| format!("unknown category '{}'", s))
    }
}

/// A single point feature of one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointRecord {
    pub id: String,
    pub lat: f64,
    pub lng: f64,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl PointRecord {
    pub fn new(id: impl Into<String>, lat: f64, lng: f64) -> Self {
        Self {
            id: id.into(),
            lat,
            lng,
            attributes: Map::new(),
        }
    }

    pub fn with_attr(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    /// Attribute rendered as display text; `None` when absent, null or empty.
    pub fn text(&self, key: &str) -> Option<String> {
        match self.attributes.get(key)? {
            Value::Null => None,
            Value::String(s) if s.trim().is_empty() => None,
            Value::String(s) => Some(s.trim().to_string()),
            Value::Bool(b) => Some(if *b { "ja" } else { "nein" }.to_string()),
            other => Some(other.to_string()),
        }
    }

    /// Truthy attribute: `true`, non-zero numbers, or strings like "ja"/"yes"/"true"/"1".
    pub fn flag(&self, key: &str) -> bool {
        match self.attributes.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
            Some(Value::String(s)) => matches!(
                s.trim().to_ascii_lowercase().as_str(),
                "ja" | "yes" | "true" | "1" | "j" | "y"
            ),
            _ => false,
        }
    }

    pub fn elevation(&self) -> Option<f64> {
        self.attributes.get("elevation").and_then(Value::as_f64)
    }
}

/// All point records of one geohash cell, grouped by category.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeohashCluster {
    pub geohash: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hydrant: Vec<PointRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub risk_object: Vec<PointRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub danger_object: Vec<PointRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pond: Vec<PointRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suction_point: Vec<PointRecord>,
}

impl GeohashCluster {
    pub fn new(geohash: impl Into<String>) -> Self {
        Self {
            geohash: geohash.into(),
            ..Default::default()
        }
    }

    pub fn records(&self, category: Category) -> &[PointRecord] {
        match category {
            Category::Hydrant => &self.hydrant,
            Category::RiskObject => &self.risk_object,
            Category::DangerObject => &self.danger_object,
            Category::Pond => &self.pond,
            Category::SuctionPoint => &self.suction_point,
        }
    }

    pub fn records_mut(&mut self, category: Category) -> &mut Vec<PointRecord> {
        match category {
            Category::Hydrant => &mut self.hydrant,
            Category::RiskObject => &mut self.risk_object,
            Category::DangerObject => &mut self.danger_object,
            Category::Pond => &mut self.pond,
            Category::SuctionPoint => &mut self.suction_point,
        }
    }

    /// Partial document carrying only the geohash key and one category array.
    /// Written with merge semantics so the other categories stay untouched.
    pub fn category_document(&self, category: Category) -> Result<Value> {
        let records = serde_json::to_value(self.records(category)).map_err(|source| {
            IndexError::EncodeCluster {
                key: self.geohash.clone(),
                source,
            }
        })?;
        let mut doc = Map::new();
        doc.insert("geohash".to_string(), Value::String(self.geohash.clone()));
        doc.insert(category.key().to_string(), records);
        Ok(Value::Object(doc))
    }
}

/// The whole index: every cluster keyed by its geohash.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterMap {
    clusters: BTreeMap<String, GeohashCluster>,
}

impl ClusterMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn get(&self, geohash: &str) -> Option<&GeohashCluster> {
        self.clusters.get(geohash)
    }

    pub fn insert(&mut self, cluster: GeohashCluster) {
        self.clusters.insert(cluster.geohash.clone(), cluster);
    }

    pub fn entry(&mut self, geohash: &str) -> &mut GeohashCluster {
        self.clusters
            .entry(geohash.to_string())
            .or_insert_with(|| GeohashCluster::new(geohash))
    }

    pub fn iter(&self) -> impl Iterator<Item = &GeohashCluster> {
        self.clusters.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut GeohashCluster> {
        self.clusters.values_mut()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.clusters.keys()
    }

    /// Snapshot of one category across all clusters, used to detect changed cells.
    pub fn category_snapshot(&self, category: Category) -> BTreeMap<String, Vec<PointRecord>> {
        self.clusters
            .iter()
            .map(|(k, c)| (k.clone(), c.records(category).to_vec()))
            .collect()
    }
}

impl FromIterator<GeohashCluster> for ClusterMap {
    fn from_iter<I: IntoIterator<Item = GeohashCluster>>(iter: I) -> Self {
        let mut map = ClusterMap::new();
        for cluster in iter {
            map.insert(cluster);
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn category_parses_kebab_and_snake() {
        assert_eq!("risk-object".parse::<Category>().unwrap(), Category::RiskObject);
        assert_eq!("suction_point".parse::<Category>().unwrap(), Category::SuctionPoint);
        assert_eq!("Hydrant".parse::<Category>().unwrap(), Category::Hydrant);
        assert!("tank".parse::<Category>().is_err());
    }

    #[test]
    fn cluster_document_roundtrips_missing_categories() {
        let doc = json!({
            "geohash": "u2edk5",
            "hydrant": [{"id": "h1", "lat": 48.0, "lng": 16.9, "leistung": 1000}]
        });
        let cluster: GeohashCluster = serde_json::from_value(doc).unwrap();
        assert_eq!(cluster.hydrant.len(), 1);
        assert!(cluster.pond.is_empty());
        assert_eq!(cluster.hydrant[0].attributes["leistung"], json!(1000));

        let out = serde_json::to_value(&cluster).unwrap();
        assert!(out.get("pond").is_none());
        assert_eq!(out["hydrant"][0]["leistung"], json!(1000));
    }

    #[test]
    fn category_document_only_carries_one_category() {
        let mut cluster = GeohashCluster::new("u2edk5");
        cluster.hydrant.push(PointRecord::new("h1", 48.0, 16.9));
        cluster.pond.push(PointRecord::new("p1", 48.0, 16.9));

        let doc = cluster.category_document(Category::Hydrant).unwrap();
        assert_eq!(doc["geohash"], json!("u2edk5"));
        assert_eq!(doc["hydrant"].as_array().unwrap().len(), 1);
        assert!(doc.get("pond").is_none());

        // an emptied category is written as an explicit empty array
        let doc = cluster.category_document(Category::SuctionPoint).unwrap();
        assert_eq!(doc["suction_point"], json!([]));
    }

    #[test]
    fn record_text_and_flag() {
        let record = PointRecord::new("h1", 48.0, 16.9)
            .with_attr("fuellhydrant", "Ja")
            .with_attr("leistung", 1000)
            .with_attr("ortschaft", "  ");
        assert!(record.flag("fuellhydrant"));
        assert_eq!(record.text("leistung").as_deref(), Some("1000"));
        assert_eq!(record.text("ortschaft"), None);
        assert!(!record.flag("missing"));
    }
}
