//! Merges category records into the geohash cluster map.

use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::debug;

use crate::cells::{DEFAULT_PRECISION, geohash};
use crate::error::{IndexError, Result};
use crate::record::{Category, ClusterMap, PointRecord};

/// What happens when an incoming record shares its id with a stored one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MergePolicy {
    /// The incoming record replaces the stored one.
    #[default]
    LastWriterWins,
    /// Differing content for the same id is a [`IndexError::MergeConflict`].
    Strict,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub inserted: usize,
    pub updated: usize,
    pub duplicates_dropped: usize,
    /// Entries dropped by reconciliation because the source no longer has them in that cell.
    pub removed: usize,
    /// Clusters whose array for the merged category differs from before.
    pub changed: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct ClusterBuilder {
    precision: usize,
    policy: MergePolicy,
}

impl Default for ClusterBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_PRECISION, MergePolicy::default())
    }
}

impl ClusterBuilder {
    pub fn new(precision: usize, policy: MergePolicy) -> Self {
        Self { precision, policy }
    }

    /// Keep only the first occurrence of each id in every cluster's `category`
    /// array. Returns the number of dropped duplicates.
    pub fn dedup_category(map: &mut ClusterMap, category: Category) -> usize {
        let mut dropped = 0;
        for cluster in map.iter_mut() {
            let records = cluster.records_mut(category);
            let before = records.len();
            let mut seen = HashSet::new();
            records.retain(|r| seen.insert(r.id.clone()));
            dropped += before - records.len();
        }
        dropped
    }

    fn assign(&self, records: &[PointRecord]) -> Result<Vec<(String, PointRecord)>> {
        records
            .par_iter()
            .map(|r| Ok((geohash(r.lat, r.lng, self.precision)?, r.clone())))
            .collect()
    }

    /// Incremental merge: dedup, then upsert every incoming record by id
    /// into the cluster of its cell. Other categories are left alone.
    pub fn merge(
        &self,
        map: &mut ClusterMap,
        category: Category,
        records: &[PointRecord],
    ) -> Result<MergeStats> {
        let assigned = self.assign(records)?;
        let before = map.category_snapshot(category);

        let mut stats = MergeStats {
            duplicates_dropped: Self::dedup_category(map, category),
            ..Default::default()
        };

        for (hash, record) in assigned {
            let cluster = map.entry(&hash);
            let entries = cluster.records_mut(category);
            match entries.iter_mut().find(|r| r.id == record.id) {
                Some(existing) => {
                    if *existing == record {
                        continue;
                    }
                    if self.policy == MergePolicy::Strict {
                        return Err(IndexError::MergeConflict {
                            category,
                            geohash: hash,
                            id: record.id,
                        });
                    }
                    *existing = record;
                    stats.updated += 1;
                }
                None => {
                    entries.push(record);
                    stats.inserted += 1;
                }
            }
        }

        stats.changed = changed_cells(&before, map, category);
        debug!(
            %category,
            inserted = stats.inserted,
            updated = stats.updated,
            dropped = stats.duplicates_dropped,
            changed = stats.changed.len(),
            "merged category"
        );
        Ok(stats)
    }

    /// Full reconciliation: recompute `category` membership of every cell from
    /// `records` alone, dropping stale entries left behind by deletions or moves.
    pub fn reconcile(
        &self,
        map: &mut ClusterMap,
        category: Category,
        records: &[PointRecord],
    ) -> Result<MergeStats> {
        let assigned = self.assign(records)?;
        let before = map.category_snapshot(category);

        let mut fresh: BTreeMap<String, Vec<PointRecord>> = BTreeMap::new();
        let mut stats = MergeStats::default();
        for (hash, record) in assigned {
            let entries = fresh.entry(hash.clone()).or_default();
            match entries.iter_mut().find(|r| r.id == record.id) {
                Some(existing) if *existing == record => {}
                Some(_) if self.policy == MergePolicy::Strict => {
                    return Err(IndexError::MergeConflict {
                        category,
                        geohash: hash,
                        id: record.id,
                    });
                }
                Some(existing) => {
                    *existing = record;
                    stats.duplicates_dropped += 1;
                }
                None => entries.push(record),
            }
        }

        for cluster in map.iter_mut() {
            let entries = fresh.remove(&cluster.geohash).unwrap_or_default();
            *cluster.records_mut(category) = entries;
        }
        for (hash, entries) in fresh {
            *map.entry(&hash).records_mut(category) = entries;
        }

        for cluster in map.iter() {
            let old = before.get(&cluster.geohash).map(Vec::as_slice).unwrap_or_default();
            for record in cluster.records(category) {
                match old.iter().find(|r| r.id == record.id) {
                    Some(prev) if prev == record => {}
                    Some(_) => stats.updated += 1,
                    None => stats.inserted += 1,
                }
            }
            stats.removed += old
                .iter()
                .filter(|r| !cluster.records(category).iter().any(|n| n.id == r.id))
                .count();
        }
        stats.changed = changed_cells(&before, map, category);
        let total: usize = map.iter().map(|c| c.records(category).len()).sum();

        debug!(%category, total, changed = stats.changed.len(), "reconciled category");
        Ok(stats)
    }
}

fn changed_cells(
    before: &BTreeMap<String, Vec<PointRecord>>,
    map: &ClusterMap,
    category: Category,
) -> BTreeSet<String> {
    map.iter()
        .filter(|c| {
            before
                .get(&c.geohash)
                .is_none_or(|old| old.as_slice() != c.records(category))
        })
        .map(|c| c.geohash.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::GeohashCluster;

    fn hydrant(id: &str, lat: f64, lng: f64, leistung: i64) -> PointRecord {
        PointRecord::new(id, lat, lng).with_attr("leistung", leistung)
    }

    fn assert_no_duplicate_ids(map: &ClusterMap) {
        for cluster in map.iter() {
            for category in Category::ALL {
                let mut seen = HashSet::new();
                for r in cluster.records(category) {
                    assert!(seen.insert(&r.id), "duplicate {} in {}", r.id, cluster.geohash);
                }
            }
        }
    }

    #[test]
    fn merge_into_empty_map() {
        let builder = ClusterBuilder::default();
        let mut map = ClusterMap::new();
        let input = vec![
            hydrant("h1", 48.0, 16.9, 1000),
            hydrant("h2", 48.0001, 16.9001, 800),
            hydrant("h3", 47.5, 16.0, 600),
        ];
        let stats = builder.merge(&mut map, Category::Hydrant, &input).unwrap();

        assert_eq!(stats.inserted, 3);
        assert_eq!(map.len(), 2);
        assert_eq!(stats.changed.len(), 2);
        let cell = geohash(48.0, 16.9, 6).unwrap();
        assert_eq!(map.get(&cell).unwrap().hydrant.len(), 2);
    }

    #[test]
    fn merge_is_idempotent() {
        let builder = ClusterBuilder::default();
        let input = vec![hydrant("h1", 48.0, 16.9, 1000), hydrant("h2", 47.9, 16.8, 900)];

        let mut once = ClusterMap::new();
        builder.merge(&mut once, Category::Hydrant, &input).unwrap();
        let mut twice = once.clone();
        let stats = builder.merge(&mut twice, Category::Hydrant, &input).unwrap();

        assert_eq!(once, twice);
        assert!(stats.changed.is_empty());
        assert_eq!(stats.inserted + stats.updated, 0);
    }

    #[test]
    fn incoming_record_overwrites_by_id() {
        let builder = ClusterBuilder::default();
        let mut map = ClusterMap::new();
        builder
            .merge(&mut map, Category::Hydrant, &[hydrant("h1", 48.0, 16.9, 1000)])
            .unwrap();
        let stats = builder
            .merge(&mut map, Category::Hydrant, &[hydrant("h1", 48.0, 16.9, 1200)])
            .unwrap();

        assert_eq!(stats.updated, 1);
        let cell = geohash(48.0, 16.9, 6).unwrap();
        let records = &map.get(&cell).unwrap().hydrant;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].attributes["leistung"], 1200);
    }

    #[test]
    fn other_categories_untouched() {
        let builder = ClusterBuilder::default();
        let mut map = ClusterMap::new();
        let pond = PointRecord::new("t1", 48.0, 16.9).with_attr("fassungsvermoegen", 120);
        builder.merge(&mut map, Category::Pond, &[pond.clone()]).unwrap();
        builder
            .merge(&mut map, Category::Hydrant, &[hydrant("h1", 48.0, 16.9, 1000)])
            .unwrap();

        let cell = geohash(48.0, 16.9, 6).unwrap();
        let cluster = map.get(&cell).unwrap();
        assert_eq!(cluster.pond, vec![pond]);
        assert_eq!(cluster.hydrant.len(), 1);
    }

    #[test]
    fn existing_duplicates_collapse_first_wins() {
        let cell = geohash(48.0, 16.9, 6).unwrap();
        let mut cluster = GeohashCluster::new(cell.clone());
        cluster.hydrant = vec![
            hydrant("h1", 48.0, 16.9, 1),
            hydrant("h1", 48.0, 16.9, 2),
            hydrant("h2", 48.0, 16.9, 3),
        ];
        cluster.pond = vec![PointRecord::new("p", 48.0, 16.9), PointRecord::new("p", 48.0, 16.9)];
        let mut map: ClusterMap = [cluster].into_iter().collect();

        let stats = ClusterBuilder::default()
            .merge(&mut map, Category::Hydrant, &[])
            .unwrap();

        assert_eq!(stats.duplicates_dropped, 1);
        let cluster = map.get(&cell).unwrap();
        assert_eq!(cluster.hydrant.len(), 2);
        assert_eq!(cluster.hydrant[0].attributes["leistung"], 1);
        // only the rebuilt category is deduplicated
        assert_eq!(cluster.pond.len(), 2);
        assert!(stats.changed.contains(&cell));
    }

    #[test]
    fn strict_policy_reports_conflicts() {
        let strict = ClusterBuilder::new(6, MergePolicy::Strict);
        let mut map = ClusterMap::new();
        strict
            .merge(&mut map, Category::Hydrant, &[hydrant("h1", 48.0, 16.9, 1000)])
            .unwrap();
        // identical content is not a conflict
        strict
            .merge(&mut map, Category::Hydrant, &[hydrant("h1", 48.0, 16.9, 1000)])
            .unwrap();
        let err = strict
            .merge(&mut map, Category::Hydrant, &[hydrant("h1", 48.0, 16.9, 900)])
            .unwrap_err();
        assert!(matches!(err, IndexError::MergeConflict { ref id, .. } if id == "h1"));
    }

    #[test]
    fn reconcile_with_conflicting_incoming_records() {
        let incoming = [
            hydrant("h1", 48.0, 16.9, 1000),
            hydrant("h1", 48.0, 16.9, 900),
        ];
        let mut map = ClusterMap::new();
        ClusterBuilder::default()
            .merge(&mut map, Category::Hydrant, &[hydrant("h0", 48.0, 16.9, 1)])
            .unwrap();
        let before = map.clone();

        let err = ClusterBuilder::new(6, MergePolicy::Strict)
            .reconcile(&mut map, Category::Hydrant, &incoming)
            .unwrap_err();
        assert!(matches!(err, IndexError::MergeConflict { ref id, .. } if id == "h1"));
        assert_eq!(map, before);

        // identical repeats are not a conflict
        let same = [hydrant("h1", 48.0, 16.9, 1000), hydrant("h1", 48.0, 16.9, 1000)];
        ClusterBuilder::new(6, MergePolicy::Strict)
            .reconcile(&mut map.clone(), Category::Hydrant, &same)
            .unwrap();

        // last writer wins keeps the later record
        let stats = ClusterBuilder::default()
            .reconcile(&mut map, Category::Hydrant, &incoming)
            .unwrap();
        assert_eq!(stats.duplicates_dropped, 1);
        let cell = geohash(48.0, 16.9, 6).unwrap();
        let records = &map.get(&cell).unwrap().hydrant;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].attributes["leistung"], 900);
    }

    #[test]
    fn moved_feature_leaves_stale_copy_until_reconciled() {
        let builder = ClusterBuilder::default();
        let mut map = ClusterMap::new();
        builder
            .merge(&mut map, Category::Hydrant, &[hydrant("h1", 48.0, 16.9, 1000)])
            .unwrap();
        let moved = [hydrant("h1", 47.5, 16.0, 1000)];
        builder.merge(&mut map, Category::Hydrant, &moved).unwrap();

        let old_cell = geohash(48.0, 16.9, 6).unwrap();
        let new_cell = geohash(47.5, 16.0, 6).unwrap();
        assert_eq!(map.get(&old_cell).unwrap().hydrant.len(), 1);
        assert_eq!(map.get(&new_cell).unwrap().hydrant.len(), 1);

        let stats = builder.reconcile(&mut map, Category::Hydrant, &moved).unwrap();
        assert!(map.get(&old_cell).unwrap().hydrant.is_empty());
        assert_eq!(map.get(&new_cell).unwrap().hydrant.len(), 1);
        assert_eq!(stats.changed, BTreeSet::from([old_cell]));
        assert_eq!(stats.removed, 1);
        assert_eq!(stats.inserted, 0);
        assert_no_duplicate_ids(&map);
    }

    #[test]
    fn reconcile_removes_deleted_and_keeps_other_categories() {
        let builder = ClusterBuilder::default();
        let mut map = ClusterMap::new();
        builder
            .merge(
                &mut map,
                Category::Hydrant,
                &[hydrant("h1", 48.0, 16.9, 1), hydrant("h2", 48.0, 16.9, 2)],
            )
            .unwrap();
        builder
            .merge(&mut map, Category::SuctionPoint, &[PointRecord::new("s1", 48.0, 16.9)])
            .unwrap();

        builder
            .reconcile(&mut map, Category::Hydrant, &[hydrant("h2", 48.0, 16.9, 2)])
            .unwrap();
        let cell = geohash(48.0, 16.9, 6).unwrap();
        let cluster = map.get(&cell).unwrap();
        assert_eq!(cluster.hydrant.len(), 1);
        assert_eq!(cluster.hydrant[0].id, "h2");
        assert_eq!(cluster.suction_point.len(), 1);

        let again = builder
            .reconcile(&mut map, Category::Hydrant, &[hydrant("h2", 48.0, 16.9, 2)])
            .unwrap();
        assert!(again.changed.is_empty());
    }

    #[test]
    fn invalid_coordinates_fail_the_merge() {
        let mut map = ClusterMap::new();
        let err = ClusterBuilder::default()
            .merge(&mut map, Category::Pond, &[PointRecord::new("p", 95.0, 16.9)])
            .unwrap_err();
        assert!(err.is_validation());
        assert!(map.is_empty());
    }
}
