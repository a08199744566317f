//! Merge phase: per-job scratch datasets folded into the final shards
//!
//! Scratch layout for output `name` on branch `b`:
//! ```text
//! {root}/{project}/b_temp/{name}_000/{name}_000_{shard}.jsonl.gz
//! {root}/{project}/b_temp/{name}_001/...
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use glob::Pattern;
use rayon::prelude::*;
use shardline_store::{ChkFile, DatasetDesc, ShardDigest, ShardId, WriteMode};

use crate::error::Result;
use crate::logging::TaskLog;

type StoreResult<T> = shardline_store::Result<T>;

/// Scratch dataset for one job of the stage writing `output`.
pub fn temp_dataset(output: &DatasetDesc, job_id: usize) -> DatasetDesc {
    DatasetDesc::new(
        output.location.temp(),
        &format!("{}_{job_id:03}", output.name),
        output.chunk_count,
        &output.record_type,
    )
}

/// True if `dir_name` is `{name}_` followed by a job number.
fn is_temp_name(name: &str, dir_name: &str) -> bool {
    dir_name
        .strip_prefix(name)
        .and_then(|rest| rest.strip_prefix('_'))
        .is_some_and(|job| job.len() >= 3 && job.bytes().all(|b| b.is_ascii_digit()))
}

/// Scratch datasets of `output` currently on disk, sorted by name.
pub fn temp_datasets(output: &DatasetDesc) -> StoreResult<Vec<DatasetDesc>> {
    let temp_loc = output.location.temp();
    let temp_dir = temp_loc.branch_dir();
    if !temp_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in fs::read_dir(&temp_dir)? {
        let entry = entry?;
        let dir_name = entry.file_name().to_string_lossy().into_owned();
        if entry.path().is_dir() && is_temp_name(&output.name, &dir_name) {
            found.push(DatasetDesc::new(
                temp_loc.clone(),
                &dir_name,
                output.chunk_count,
                &output.record_type,
            ));
        }
    }
    found.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(found)
}

/// Fragments of every shard across all scratch datasets, grouped by shard.
///
/// The scratch tree is listed once; each group is in lexicographic path
/// order. Shards without fragments map to an empty list.
pub fn fragments(output: &DatasetDesc) -> StoreResult<BTreeMap<ShardId, Vec<PathBuf>>> {
    let mut groups: BTreeMap<ShardId, Vec<PathBuf>> = output
        .chunk_count
        .shard_ids()
        .map(|shard| (shard, Vec::new()))
        .collect();
    let shard_names: HashMap<String, ShardId> = groups
        .keys()
        .map(|shard| (shard.to_string(), shard.clone()))
        .collect();

    let temp_dir = output.location.temp().branch_dir();
    let name = Pattern::escape(&output.name);
    let pattern = format!(
        "{}/{name}_[0-9][0-9][0-9]*/{name}_*.jsonl.gz",
        Pattern::escape(&temp_dir.to_string_lossy()),
    );
    for entry in glob::glob(&pattern)? {
        let path = entry.map_err(|e| e.into_error())?;
        let shard = fragment_shard(&output.name, &path).and_then(|s| shard_names.get(s));
        if let Some(paths) = shard.and_then(|shard| groups.get_mut(shard)) {
            paths.push(path);
        }
    }
    for paths in groups.values_mut() {
        paths.sort();
    }
    Ok(groups)
}

/// Shard id suffix of a scratch fragment of output `name`.
///
/// `None` for glob matches from outputs whose name extends this one.
fn fragment_shard<'a>(name: &str, path: &'a Path) -> Option<&'a str> {
    let dir_name = path.parent()?.file_name()?.to_str()?;
    if !is_temp_name(name, dir_name) {
        return None;
    }
    path.file_name()?
        .to_str()?
        .strip_prefix(dir_name)?
        .strip_prefix('_')?
        .strip_suffix(".jsonl.gz")
}

/// Concatenate `fragments` into the output shard.
fn merge_shard(
    output: &DatasetDesc,
    shard: &ShardId,
    fragments: &[PathBuf],
) -> StoreResult<ShardDigest> {
    let mut writer = output.chunk(shard).open_write(WriteMode::Truncate)?;
    for fragment in fragments {
        writer.absorb(fragment)?;
    }
    writer.close()
}

/// Build every output shard from the scratch fragments, one writer per
/// shard, in parallel on the current rayon pool.
///
/// Returns digests in shard-id order.
pub fn merge_fragments(output: &DatasetDesc) -> StoreResult<Vec<ShardDigest>> {
    let groups: Vec<(ShardId, Vec<PathBuf>)> = fragments(output)?.into_iter().collect();
    groups
        .par_iter()
        .map(|(shard, paths)| merge_shard(output, shard, paths))
        .collect()
}

/// Delete every scratch dataset of `output`, then the `_temp` branch
/// directory if nothing else lives there. Returns how many were removed.
pub fn remove_temp_datasets(output: &DatasetDesc) -> StoreResult<usize> {
    let temps = temp_datasets(output)?;
    for temp in &temps {
        // Possibly written with another chunk count or without a DefFile
        fs::remove_dir_all(temp.dir())?;
    }
    let temp_dir = output.location.temp().branch_dir();
    if temp_dir.is_dir() && fs::read_dir(&temp_dir)?.next().is_none() {
        fs::remove_dir(&temp_dir)?;
    }
    Ok(temps.len())
}

/// Remove scratch datasets left behind by an earlier crashed run.
pub fn clean_stale(output: &DatasetDesc, log: &TaskLog) -> Result<()> {
    let stale = temp_datasets(output)?;
    if !stale.is_empty() {
        log.warn(format_args!(
            "removing {} stale scratch datasets from an earlier run",
            stale.len()
        ));
        remove_temp_datasets(output)?;
    }
    Ok(())
}

/// Full merge phase: fold fragments, drop scratch data, write the ChkFile.
pub fn finalise(output: &DatasetDesc, log: &TaskLog) -> Result<Vec<ShardDigest>> {
    let digests = merge_fragments(output)?;
    let removed = remove_temp_datasets(output)?;
    ChkFile::make(output, &digests)?;
    log.debug(format_args!(
        "merged {} scratch datasets into {} shards",
        removed,
        digests.len()
    ));
    Ok(digests)
}
