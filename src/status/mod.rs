// Module: Status
// Read-only view of partition checkpoints for the `status` command. Never
// writes: it can run while workers are busy.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fmt;
use std::fs;
use std::ops::Range;
use std::path::Path;

use crate::checkpoint::CheckpointStore;
use crate::partition::Partition;

#[derive(Debug, Clone, PartialEq)]
pub struct PartitionStatus {
    pub id: String,
    /// Known only when the data set could be loaded.
    pub range: Option<Range<usize>>,
    pub completed: usize,
    pub failed: usize,
    pub last_completed: Option<usize>,
    pub next_index: Option<usize>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl PartitionStatus {
    /// Finished records over the partition size.
    pub fn percent(&self) -> Option<f64> {
        let range = self.range.as_ref()?;
        if range.is_empty() {
            return Some(100.0);
        }
        let done = (self.completed + self.failed).min(range.len());
        Some(done as f64 / range.len() as f64 * 100.0)
    }

    pub fn is_finished(&self) -> bool {
        matches!((&self.range, self.next_index), (Some(range), Some(next)) if next >= range.end)
    }
}

impl fmt::Display for PartitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<10} ok={:<6} erro={:<5}", self.id, self.completed, self.failed)?;
        if let Some(range) = &self.range {
            write!(f, " [{}, {})", range.start, range.end)?;
        }
        if let Some(percent) = self.percent() {
            write!(f, " {:>5.1}%", percent)?;
        }
        if let Some(last) = self.last_completed {
            write!(f, " último={}", last)?;
        }
        match (self.is_finished(), self.next_index) {
            (true, _) => write!(f, " concluída")?,
            (false, Some(next)) => write!(f, " próximo={}", next)?,
            (false, None) => {}
        }
        if let Some(at) = self.updated_at {
            write!(f, " atualizado={}", at.to_rfc3339())?;
        }
        Ok(())
    }
}

/// Partition ids that have a checkpoint in `dir`.
pub fn discover(dir: &Path) -> Result<Vec<String>> {
    let mut ids: Vec<String> = fs::read_dir(dir)
        .with_context(|| format!("Failed to list output dir {:?}", dir))?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            name.strip_prefix("progress_")
                .and_then(|rest| rest.strip_suffix(".json"))
                .map(str::to_string)
        })
        .collect();
    ids.sort();
    Ok(ids)
}

/// Status of one partition; `total` is the data set size when known.
pub fn partition_status(dir: &Path, partition: &Partition, total: Option<usize>) -> Result<PartitionStatus> {
    let has_file = CheckpointStore::path_for(dir, &partition.id).exists();
    let store = CheckpointStore::load(dir, &partition.id)?;
    let checkpoint = store.checkpoint();
    let range = total.map(|t| partition.bounded(t));
    let next_index = range
        .as_ref()
        .map(|r| store.resume_index(r.start).min(r.end))
        .or_else(|| checkpoint.last_completed_index.map(|i| i + 1));

    Ok(PartitionStatus {
        id: partition.id.clone(),
        range,
        completed: checkpoint.completed.len(),
        failed: checkpoint.failed.len(),
        last_completed: checkpoint.last_completed_index,
        next_index,
        updated_at: has_file.then_some(checkpoint.updated_at),
    })
}

/// Status for the given partitions, or for every checkpoint found in `dir`.
pub fn collect(dir: &Path, partitions: &[Partition], total: Option<usize>) -> Result<Vec<PartitionStatus>> {
    if !partitions.is_empty() {
        return partitions
            .iter()
            .map(|p| partition_status(dir, p, total))
            .collect();
    }
    discover(dir)?
        .into_iter()
        .map(|id| partition_status(dir, &Partition::new(id, 0, None), None))
        .collect()
}
