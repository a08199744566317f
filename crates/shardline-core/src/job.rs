//! Jobs (one shard's worth of work) and the reports workers hand back

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use shardline_store::{ChunkStore, DatasetDesc, ShardDigest, ShardId};

use crate::error::{Error, Result};

/// Unit of work handed to one worker: the same shard of every input plus
/// the datasets each job materializes whole.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: usize,
    pub total_jobs: usize,
    pub shard: ShardId,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    pub input_chunks: Vec<ChunkStore>,
    #[serde(default)]
    pub loaded_input_chunks: Vec<DatasetDesc>,
}

/// Per-job counters, passed unmodified into finalisation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResults {
    pub records_read: usize,
    pub records_written: usize,
    /// Records whose `run` failed and were skipped.
    pub failed_records: usize,
    /// Output shard digest (tasks that write their output shard directly).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<ShardDigest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: usize,
    pub success: bool,
    pub results: JobResults,
}

impl JobReport {
    pub fn ok(job_id: usize, results: JobResults) -> Self {
        Self {
            job_id,
            success: true,
            results,
        }
    }
}

/// One job per shard of the inputs, in shard-id order.
///
/// Every input must share the first input's chunk count.
pub fn plan_jobs(
    task: &str,
    inputs: &[DatasetDesc],
    loaded: &[DatasetDesc],
    parameters: &BTreeMap<String, serde_json::Value>,
) -> Result<Vec<Job>> {
    let Some(first) = inputs.first() else {
        return Ok(Vec::new());
    };
    let chunk_count = first.chunk_count;
    for input in &inputs[1..] {
        if input.chunk_count != chunk_count {
            return Err(Error::ChunkCountMismatch {
                task: task.to_string(),
                input: input.label(),
                expected: chunk_count.count(),
                found: input.chunk_count.count(),
            });
        }
    }

    let total_jobs = chunk_count.count() as usize;
    let jobs = chunk_count
        .shard_ids()
        .enumerate()
        .map(|(id, shard)| Job {
            id,
            total_jobs,
            input_chunks: inputs.iter().map(|d| d.chunk(&shard)).collect(),
            shard,
            parameters: parameters.clone(),
            loaded_input_chunks: loaded.to_vec(),
        })
        .collect();
    Ok(jobs)
}

/// Summed counters over a set of reports.
pub fn totals(reports: &[JobReport]) -> JobResults {
    reports.iter().fold(JobResults::default(), |mut acc, r| {
        acc.records_read += r.results.records_read;
        acc.records_written += r.results.records_written;
        acc.failed_records += r.results.failed_records;
        acc
    })
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use shardline_store::{ChunkCount, Location};

    use super::*;

    fn desc(name: &str, chunk_count: ChunkCount) -> DatasetDesc {
        DatasetDesc::new(Location::new(Path::new("/data"), "p", "main"), name, chunk_count, "Item")
    }

    #[test]
    fn one_job_per_shard() {
        let inputs = [desc("a", ChunkCount::C16), desc("b", ChunkCount::C16)];
        let jobs = plan_jobs("t", &inputs, &[], &BTreeMap::new()).unwrap();
        assert_eq!(jobs.len(), 16);
        for (i, job) in jobs.iter().enumerate() {
            assert_eq!(job.id, i);
            assert_eq!(job.total_jobs, 16);
            assert_eq!(job.input_chunks.len(), 2);
            assert!(job.input_chunks.iter().all(|c| c.shard() == &job.shard));
        }
        assert_eq!(jobs[10].shard.as_str(), "a");
        assert!(jobs[0].input_chunks[1].path().ends_with("b/b_0.jsonl.gz"));
    }

    #[test]
    fn mismatched_chunk_counts() {
        let inputs = [desc("a", ChunkCount::C16), desc("b", ChunkCount::C256)];
        let err = plan_jobs("t", &inputs, &[], &BTreeMap::new()).unwrap_err();
        assert!(matches!(
            err,
            Error::ChunkCountMismatch {
                expected: 16,
                found: 256,
                ..
            }
        ));
    }

    #[test]
    fn jobs_carry_parameters_and_loaded_inputs() {
        let mut params = BTreeMap::new();
        params.insert("threshold".to_string(), serde_json::json!(0.5));
        let jobs = plan_jobs(
            "t",
            &[desc("a", ChunkCount::C16)],
            &[desc("lookup", ChunkCount::C16)],
            &params,
        )
        .unwrap();
        assert_eq!(jobs[3].parameters["threshold"], serde_json::json!(0.5));
        assert_eq!(jobs[3].loaded_input_chunks[0].name, "lookup");
    }

    #[test]
    fn job_is_serializable() {
        let jobs = plan_jobs("t", &[desc("a", ChunkCount::C16)], &[], &BTreeMap::new()).unwrap();
        let json = serde_json::to_string(&jobs[0]).unwrap();
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back.shard, jobs[0].shard);
        assert_eq!(back.input_chunks, jobs[0].input_chunks);
    }

    #[test]
    fn totals_sum_reports() {
        let reports = vec![
            JobReport::ok(
                0,
                JobResults {
                    records_read: 3,
                    records_written: 2,
                    failed_records: 1,
                    digest: None,
                },
            ),
            JobReport::ok(
                1,
                JobResults {
                    records_read: 4,
                    records_written: 4,
                    failed_records: 0,
                    digest: None,
                },
            ),
        ];
        let t = totals(&reports);
        assert_eq!((t.records_read, t.records_written, t.failed_records), (7, 6, 1));
    }
}
