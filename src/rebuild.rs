//! Rebuild and query entry points tying the pipeline stages together.

use geojson::FeatureCollection;
use indicatif::ProgressBar;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::info;

use crate::assemble::assemble;
use crate::batch::{BatchReport, write_batches};
use crate::cells::DEFAULT_PRECISION;
use crate::cluster::{ClusterBuilder, MergePolicy, MergeStats};
use crate::error::{IndexError, Result};
use crate::planner::{MAX_RADIUS_M, MIN_RADIUS_M, QueryRegion, RangePlanner};
use crate::record::{Category, ClusterMap, GeohashCluster, PointRecord};
use crate::store::{DocumentStore, MAX_BATCH_WRITES};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RebuildMode {
    /// Upsert incoming records; stale entries survive.
    #[default]
    Incremental,
    /// Recompute the category's membership in every cell.
    Reconcile,
}

/// Settings shared by rebuilds and queries. `precision` drives both the
/// cluster keys and the query ranges.
#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub collection: String,
    pub precision: usize,
    pub batch_size: usize,
    pub policy: MergePolicy,
    pub min_radius_m: f64,
    pub max_radius_m: f64,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            collection: "clusters".to_string(),
            precision: DEFAULT_PRECISION,
            batch_size: MAX_BATCH_WRITES,
            policy: MergePolicy::default(),
            min_radius_m: MIN_RADIUS_M,
            max_radius_m: MAX_RADIUS_M,
        }
    }
}

impl IndexOptions {
    pub fn builder(&self) -> ClusterBuilder {
        ClusterBuilder::new(self.precision, self.policy)
    }

    pub fn planner(&self) -> RangePlanner {
        RangePlanner {
            precision: self.precision,
            min_radius_m: self.min_radius_m,
            max_radius_m: self.max_radius_m,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildReport {
    pub records: usize,
    pub clusters: usize,
    pub merge: MergeStats,
    pub batches: BatchReport,
}

/// Load the stored cluster map.
pub fn load_cluster_map(store: &dyn DocumentStore, collection: &str) -> Result<ClusterMap> {
    store
        .scan(collection)?
        .into_iter()
        .map(|(key, doc)| {
            serde_json::from_value::<GeohashCluster>(doc)
                .map_err(|source| IndexError::MalformedCluster { key, source })
        })
        .collect()
}

/// Partial documents (geohash plus the `category` array) for every cluster
/// `stats` marks as changed.
pub fn changed_documents(
    map: &ClusterMap,
    stats: &MergeStats,
    category: Category,
) -> Result<BTreeMap<String, Value>> {
    stats
        .changed
        .iter()
        .filter_map(|key| map.get(key))
        .map(|cluster| Ok((cluster.geohash.clone(), cluster.category_document(category)?)))
        .collect()
}

/// Rebuild one category: load the stored map, merge or reconcile `records`
/// into it and merge-write the changed clusters. Only the geohash key and the
/// rebuilt category array are written, so rebuilds of different categories
/// do not overwrite each other.
pub fn rebuild_category(
    store: &dyn DocumentStore,
    options: &IndexOptions,
    category: Category,
    records: &[PointRecord],
    mode: RebuildMode,
    progress: Option<&ProgressBar>,
) -> Result<RebuildReport> {
    let mut map = load_cluster_map(store, &options.collection)?;
    info!(
        %category,
        ?mode,
        stored_clusters = map.len(),
        incoming = records.len(),
        "rebuilding category"
    );

    let builder = options.builder();
    let merge = match mode {
        RebuildMode::Incremental => builder.merge(&mut map, category, records)?,
        RebuildMode::Reconcile => builder.reconcile(&mut map, category, records)?,
    };

    let documents = changed_documents(&map, &merge, category)?;
    let batches = write_batches(
        store,
        &options.collection,
        &documents,
        true,
        options.batch_size,
        progress,
    )?;

    info!(
        %category,
        changed = merge.changed.len(),
        batches = batches.batches,
        writes = batches.writes,
        "rebuild complete"
    );
    Ok(RebuildReport {
        records: records.len(),
        clusters: map.len(),
        merge,
        batches,
    })
}

/// Answer a circle or bounding-box query.
pub fn query(
    store: &dyn DocumentStore,
    options: &IndexOptions,
    region: &QueryRegion,
) -> Result<FeatureCollection> {
    let ranges = options.planner().plan(region)?;
    let collection = assemble(store, &options.collection, &ranges)?;
    info!(ranges = ranges.len(), features = collection.features.len(), "query answered");
    Ok(collection)
}
