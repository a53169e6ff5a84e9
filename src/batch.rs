use indicatif::ProgressBar;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::{IndexError, Result};
use crate::store::{DocumentStore, MAX_BATCH_WRITES, Write};

/// Outcome of a completed [`write_batches`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub batches: usize,
    pub writes: usize,
}

/// Write `records` to `collection` in sequential batches of at most
/// `batch_size` (clamped to `1..=MAX_BATCH_WRITES`) writes.
///
/// A failed batch stops the run; earlier batches stay committed and the
/// error reports how far the run got. Re-running with the same input is safe
/// when `merge` is set.
pub fn write_batches(
    store: &dyn DocumentStore,
    collection: &str,
    records: &BTreeMap<String, Value>,
    merge: bool,
    batch_size: usize,
    progress: Option<&ProgressBar>,
) -> Result<BatchReport> {
    let batch_size = batch_size.clamp(1, MAX_BATCH_WRITES);
    let entries: Vec<(&String, &Value)> = records.iter().collect();
    let mut report = BatchReport::default();

    if let Some(pb) = progress {
        pb.set_length(entries.len().div_ceil(batch_size) as u64);
    }

    for (index, chunk) in entries.chunks(batch_size).enumerate() {
        let writes: Vec<Write> = chunk
            .iter()
            .map(|(key, doc)| Write {
                key: (*key).clone(),
                document: (*doc).clone(),
                merge,
            })
            .collect();

        store
            .batch_write(collection, writes)
            .map_err(|source| IndexError::Batch {
                failed_batch: index,
                committed_batches: report.batches,
                committed_writes: report.writes,
                source,
            })?;

        report.batches += 1;
        report.writes += chunk.len();
        debug!(collection, batch = index, writes = chunk.len(), "committed batch");
        if let Some(pb) = progress {
            pb.inc(1);
        }
    }

    Ok(report)
}
