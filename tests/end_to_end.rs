use geojson::FeatureCollection;
use serde_json::Value;

use firemap_index::batch::write_batches;
use firemap_index::cells::geohash;
use firemap_index::cluster::ClusterBuilder;
use firemap_index::planner::QueryRegion;
use firemap_index::projection::{DEFAULT_SYSTEM, ProjectionRegistry};
use firemap_index::rebuild::{
    IndexOptions, RebuildMode, changed_documents, load_cluster_map, query, rebuild_category,
};
use firemap_index::record::{Category, PointRecord};
use firemap_index::render;
use firemap_index::source::{normalize, parse_collection};
use firemap_index::store::{DocumentStore, FileStore, MemoryStore};

fn main_square_hydrant() -> PointRecord {
    PointRecord::new("h-1", 48.0, 16.9)
        .with_attr("name", "Hydrant Hauptplatz")
        .with_attr("typ", "Überflurhydrant")
        .with_attr("leistung", 1000)
        .with_attr("dimension", 100)
}

fn ids(fc: &FeatureCollection) -> Vec<String> {
    let mut ids: Vec<String> = fc
        .features
        .iter()
        .filter_map(|f| f.property("id").and_then(Value::as_str).map(str::to_string))
        .collect();
    ids.sort();
    ids
}

fn seeded_store() -> MemoryStore {
    let store = MemoryStore::new();
    let options = IndexOptions::default();
    let hydrants = vec![
        main_square_hydrant(),
        // roughly 2.2 km north
        PointRecord::new("h-2", 48.02, 16.9).with_attr("name", "Hydrant Kirchengasse"),
    ];
    rebuild_category(&store, &options, Category::Hydrant, &hydrants, RebuildMode::Incremental, None)
        .unwrap();
    rebuild_category(
        &store,
        &options,
        Category::Pond,
        &[PointRecord::new("t-1", 48.0005, 16.9005).with_attr("name", "Löschteich Au")],
        RebuildMode::Incremental,
        None,
    )
    .unwrap();
    store
}

#[test]
fn radius_query_returns_rendered_hydrant() {
    let store = MemoryStore::new();
    let options = IndexOptions::default();
    rebuild_category(
        &store,
        &options,
        Category::Hydrant,
        &[main_square_hydrant()],
        RebuildMode::Incremental,
        None,
    )
    .unwrap();

    let region = QueryRegion::circle(48.0, 16.9, 500.0).unwrap();
    let fc = query(&store, &options, &region).unwrap();
    assert_eq!(fc.features.len(), 1);

    let feature = &fc.features[0];
    assert_eq!(feature.property("title").and_then(Value::as_str), Some("Hydrant Hauptplatz"));
    assert_eq!(feature.property("category").and_then(Value::as_str), Some("hydrant"));
    let icon = feature.property("icon").unwrap();
    assert_eq!(icon["iconUrl"], render::HYDRANT_ICON);
    let description = feature.property("description").and_then(Value::as_str).unwrap();
    assert!(description.contains("1000 l/min"));
    assert!(description.contains("100 mm"));

    let json = serde_json::to_value(&fc).unwrap();
    assert_eq!(json["features"][0]["geometry"]["coordinates"], serde_json::json!([16.9, 48.0]));
}

#[test]
fn bbox_matches_equivalent_circle() {
    let store = seeded_store();
    let options = IndexOptions::default();

    let bbox = QueryRegion::parse_bbox("16.89,47.99,16.91,48.01").unwrap();
    let (lat, lng, radius) = bbox.center_radius();
    let circle = QueryRegion::circle(lat, lng, radius).unwrap();

    let from_bbox = query(&store, &options, &bbox).unwrap();
    let from_circle = query(&store, &options, &circle).unwrap();
    assert_eq!(ids(&from_bbox), ids(&from_circle));
    let found = ids(&from_bbox);
    assert!(found.contains(&"h-1".to_string()));
    assert!(found.contains(&"t-1".to_string()));
}

#[test]
fn radius_is_clamped_on_both_ends() {
    let store = seeded_store();
    let options = IndexOptions::default();
    let at = |radius: f64| {
        let region = QueryRegion::circle(48.0, 16.9, radius).unwrap();
        ids(&query(&store, &options, &region).unwrap())
    };

    assert_eq!(at(50.0), at(200.0));
    assert_eq!(at(50000.0), at(10000.0));
    assert!(at(10000.0).contains(&"h-2".to_string()));
}

#[test]
fn interleaved_rebuilds_of_different_categories_commute() {
    let store = MemoryStore::new();
    let options = IndexOptions::default();
    let builder = ClusterBuilder::default();

    let mut hydrant_view = load_cluster_map(&store, &options.collection).unwrap();
    let mut pond_view = load_cluster_map(&store, &options.collection).unwrap();

    let hydrant_stats = builder
        .merge(&mut hydrant_view, Category::Hydrant, &[PointRecord::new("h-1", 48.0, 16.9)])
        .unwrap();
    let pond_stats = builder
        .merge(&mut pond_view, Category::Pond, &[PointRecord::new("t-1", 48.0, 16.9)])
        .unwrap();

    let hydrant_docs =
        changed_documents(&hydrant_view, &hydrant_stats, Category::Hydrant).unwrap();
    let pond_docs = changed_documents(&pond_view, &pond_stats, Category::Pond).unwrap();
    write_batches(&store, &options.collection, &hydrant_docs, true, 400, None).unwrap();
    write_batches(&store, &options.collection, &pond_docs, true, 400, None).unwrap();

    let cell = geohash(48.0, 16.9, 6).unwrap();
    let doc = store.get(&options.collection, &cell).unwrap().unwrap();
    assert_eq!(doc["hydrant"][0]["id"], "h-1");
    assert_eq!(doc["pond"][0]["id"], "t-1");
}

#[test]
fn interleaved_rebuilds_of_one_category_lose_an_update() {
    let store = MemoryStore::new();
    let options = IndexOptions::default();
    let builder = ClusterBuilder::default();

    let mut first = load_cluster_map(&store, &options.collection).unwrap();
    let mut second = load_cluster_map(&store, &options.collection).unwrap();
    let h1 = [PointRecord::new("h-1", 48.0, 16.9)];
    let h2 = [PointRecord::new("h-2", 48.0, 16.9)];
    let a = builder.merge(&mut first, Category::Hydrant, &h1).unwrap();
    let b = builder.merge(&mut second, Category::Hydrant, &h2).unwrap();

    for (view, stats) in [(&first, &a), (&second, &b)] {
        let docs = changed_documents(view, stats, Category::Hydrant).unwrap();
        write_batches(&store, &options.collection, &docs, true, 400, None).unwrap();
    }

    let region = QueryRegion::circle(48.0, 16.9, 200.0).unwrap();
    assert_eq!(ids(&query(&store, &options, &region).unwrap()), vec!["h-2"]);

    // a sequential rebuild afterwards restores the lost record
    rebuild_category(&store, &options, Category::Hydrant, &h1, RebuildMode::Incremental, None)
        .unwrap();
    assert_eq!(ids(&query(&store, &options, &region).unwrap()), vec!["h-1", "h-2"]);
}

#[test]
fn survey_grid_import_through_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let options = IndexOptions::default();
    let raw = parse_collection(
        r#"[{"id": 7, "x": 42300.0, "y": 318000.0, "name": "Saugstelle Marchufer"}]"#,
    )
    .unwrap();
    let registry = ProjectionRegistry::default();
    let (records, report) = normalize(Category::SuctionPoint, raw, &registry, DEFAULT_SYSTEM);
    assert_eq!(report.imported, 1);

    {
        let store = FileStore::open(dir.path()).unwrap();
        let mode = RebuildMode::Reconcile;
        rebuild_category(&store, &options, Category::SuctionPoint, &records, mode, None).unwrap();
    }

    let reopened = FileStore::open(dir.path()).unwrap();
    let region = QueryRegion::circle(48.0, 16.9, 500.0).unwrap();
    let fc = query(&reopened, &options, &region).unwrap();
    assert_eq!(fc.features.len(), 1);
    let feature = &fc.features[0];
    assert_eq!(feature.property("id").and_then(Value::as_str), Some("7"));
    assert_eq!(feature.property("icon").unwrap()["iconUrl"], render::SUCTION_POINT_ICON);
}
