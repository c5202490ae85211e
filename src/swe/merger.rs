//! Combining per-repository task shards into one dataset.
//!
//! The first record seen for an instance id wins. Shards are read in a
//! deterministic order, so merging the same inputs twice gives the same file.
//! Next to the dataset go its `medium` and `high` tier subsets
//! (`tasks.medium.jsonl` holds every task of tier medium or better).

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use super::store::{read_jsonl, write_jsonl_atomic};
use super::{InstanceTier, TaskRecord};
use crate::error::{DataIntegrityError, StoreError};

/// Finished shards end in `.jsonl`; `.jsonl.partial` files are still being written.
const SHARD_EXTENSION: &str = "jsonl";

/// A record dropped because its instance id was already taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Duplicate {
    pub instance_id: String,
    pub shard: PathBuf,
}

/// A line that did not parse as a task record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MalformedLine {
    pub shard: PathBuf,
    pub line: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MergeReport {
    pub tasks: Vec<TaskRecord>,
    pub duplicates: Vec<Duplicate>,
    pub malformed: Vec<MalformedLine>,
}

/// Merge `shards` in the given order, keeping the first record per instance id.
pub fn merge_shards(shards: &[PathBuf]) -> Result<MergeReport, StoreError> {
    let mut report = MergeReport::default();
    let mut seen = HashSet::new();

    for shard in shards {
        let read = read_jsonl::<TaskRecord>(shard)?;
        report
            .malformed
            .extend(read.malformed_lines.into_iter().map(|line| MalformedLine {
                shard: shard.clone(),
                line,
            }));

        for task in read.records {
            if seen.insert(task.instance_id.clone()) {
                report.tasks.push(task);
            } else {
                let collision = DataIntegrityError::DuplicateInstance(task.instance_id.clone());
                tracing::warn!(shard = %shard.display(), error = %collision, "Dropping duplicate task");
                report.duplicates.push(Duplicate {
                    instance_id: task.instance_id,
                    shard: shard.clone(),
                });
            }
        }
    }

    Ok(report)
}

/// Expand inputs into shard files: directories contribute their finished
/// shards sorted by file name, files are taken as given.
pub fn collect_shards(inputs: &[PathBuf]) -> Result<Vec<PathBuf>, StoreError> {
    let mut shards = Vec::new();
    for input in inputs {
        if input.is_dir() {
            shards.extend(list_shard_dir(input)?);
        } else {
            shards.push(input.clone());
        }
    }
    Ok(shards)
}

fn list_shard_dir(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let entries = fs::read_dir(dir).map_err(|e| StoreError::io(dir, e))?;
    let mut shards = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| StoreError::io(dir, e))?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == SHARD_EXTENSION) {
            shards.push(path);
        }
    }
    shards.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(shards)
}

/// Path of the subset of `output` holding tasks of `tier` or better:
/// `tasks.jsonl` becomes `tasks.medium.jsonl`.
pub fn tier_output_path(output: &Path, tier: InstanceTier) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match output.extension() {
        Some(ext) => format!("{}.{}.{}", stem, tier, ext.to_string_lossy()),
        None => format!("{}.{}", stem, tier),
    };
    output.with_file_name(name)
}

/// Merge stage: shard inputs in, one atomically written dataset out.
pub struct TaskMerger {
    inputs: Vec<PathBuf>,
    output: PathBuf,
}

impl TaskMerger {
    pub fn new(inputs: Vec<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            inputs,
            output: output.into(),
        }
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn run(&self) -> Result<MergeReport, StoreError> {
        let shards = collect_shards(&self.inputs)?;
        let report = merge_shards(&shards)?;
        write_jsonl_atomic(&self.output, &report.tasks)?;
        for tier in [InstanceTier::Medium, InstanceTier::High] {
            let subset: Vec<&TaskRecord> =
                report.tasks.iter().filter(|t| t.tier >= tier).collect();
            write_jsonl_atomic(&tier_output_path(&self.output, tier), &subset)?;
        }
        tracing::info!(
            shards = shards.len(),
            tasks = report.tasks.len(),
            duplicates = report.duplicates.len(),
            malformed = report.malformed.len(),
            output = %self.output.display(),
            "Merged task shards"
        );
        Ok(report)
    }
}
