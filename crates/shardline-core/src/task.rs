//! Task family: the user-facing traits a pipeline stage is built from
//!
//! - [`Source`]: no inputs, one worker, one output record per item
//! - [`SimpleTask`]: shard-aligned inputs, exactly one output per input row,
//!   written straight into the job's output shard
//! - [`Task`]: shard-aligned inputs, any number of outputs per row, written
//!   to a per-job scratch dataset and merged by shard at the end

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::OnceLock;

use serde::Serialize;
use serde_json::Value;
use shardline_store::{Dataset, DatasetDesc, Identity, Record, ShardId};

use crate::deferred::WorkerContext;
use crate::error::Result;
use crate::job::Job;
use crate::logging::TaskLog;

/// Lifecycle of one stage. `Failed` is reachable from every other state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskState {
    Constructed,
    JobsPlanned,
    Executing,
    Finalising,
    Done,
    Failed,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Constructed => "constructed",
            Self::JobsPlanned => "jobs planned",
            Self::Executing => "executing",
            Self::Finalising => "finalising",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Ordered tuple of input records, one per input dataset.
///
/// Implemented for tuples of one to four [`Record`] types.
pub trait InputTuple: Sized + Send + 'static {
    /// `TYPE_NAME` of each position.
    fn type_names() -> Vec<&'static str>;

    /// Decode one zipped row; on failure returns the offending position.
    fn decode(values: Vec<Value>) -> std::result::Result<Self, (usize, serde_json::Error)>;

    fn identities(&self) -> Vec<Identity>;
}

macro_rules! input_tuple {
    ($($idx:tt $name:ident),+) => {
        impl<$($name: Record),+> InputTuple for ($($name,)+) {
            fn type_names() -> Vec<&'static str> {
                vec![$($name::TYPE_NAME),+]
            }

            fn decode(values: Vec<Value>) -> std::result::Result<Self, (usize, serde_json::Error)> {
                let mut values = values.into_iter();
                Ok(($(
                    $name::from_data(values.next().unwrap_or(Value::Null)).map_err(|e| ($idx, e))?,
                )+))
            }

            fn identities(&self) -> Vec<Identity> {
                vec![$(self.$idx.identity()),+]
            }
        }
    };
}

input_tuple!(0 A);
input_tuple!(0 A, 1 B);
input_tuple!(0 A, 1 B, 2 C);
input_tuple!(0 A, 1 B, 2 C, 3 D);

/// A loaded input: every record of a small dataset, materialized per job.
struct LoadedInput {
    record_type: String,
    rows: Vec<Value>,
    typed: OnceLock<Box<dyn Any + Send + Sync>>,
}

/// What user code sees while a job runs.
pub struct JobContext {
    log: TaskLog,
    job_id: usize,
    total_jobs: usize,
    shard: Option<ShardId>,
    parameters: BTreeMap<String, Value>,
    loaded: HashMap<String, LoadedInput>,
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut loaded: Vec<_> = self.loaded.keys().collect();
        loaded.sort();
        f.debug_struct("JobContext")
            .field("log", &self.log)
            .field("job_id", &self.job_id)
            .field("total_jobs", &self.total_jobs)
            .field("shard", &self.shard)
            .field("loaded", &loaded)
            .finish_non_exhaustive()
    }
}

impl JobContext {
    /// Context for a source run (one job, no shard, nothing loaded).
    pub(crate) fn for_source(log: TaskLog) -> Self {
        Self {
            log: log.for_job(0),
            job_id: 0,
            total_jobs: 1,
            shard: None,
            parameters: BTreeMap::new(),
            loaded: HashMap::new(),
        }
    }

    /// Context for a sharded job; reads every loaded input in full.
    pub(crate) fn for_job(log: &TaskLog, job: &Job) -> Result<Self> {
        let mut loaded = HashMap::with_capacity(job.loaded_input_chunks.len());
        for desc in &job.loaded_input_chunks {
            loaded.insert(desc.name.clone(), materialize(desc)?);
        }
        Ok(Self {
            log: log.for_job(job.id),
            job_id: job.id,
            total_jobs: job.total_jobs,
            shard: Some(job.shard.clone()),
            parameters: job.parameters.clone(),
            loaded,
        })
    }

    pub fn log(&self) -> &TaskLog {
        &self.log
    }

    pub fn job_id(&self) -> usize {
        self.job_id
    }

    pub fn total_jobs(&self) -> usize {
        self.total_jobs
    }

    /// Shard this job covers (`None` for sources).
    pub fn shard(&self) -> Option<&ShardId> {
        self.shard.as_ref()
    }

    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }

    /// Every record of the loaded input `name`, decoded on first access.
    pub fn loaded<R: Record>(&self, name: &str) -> Result<&[R]> {
        let input = self
            .loaded
            .get(name)
            .ok_or_else(|| shardline_store::Error::DoesNotExist(format!("loaded input {name}")))?;
        if input.record_type != R::TYPE_NAME {
            return Err(shardline_store::Error::TypeMismatch {
                expected: input.record_type.clone(),
                found: R::TYPE_NAME.to_string(),
            }
            .into());
        }
        if input.typed.get().is_none() {
            let rows = input
                .rows
                .iter()
                .map(|v| R::from_data(v.clone()))
                .collect::<serde_json::Result<Vec<R>>>()
                .map_err(shardline_store::Error::from)?;
            let _ = input.typed.set(Box::new(rows));
        }
        let rows = input
            .typed
            .get()
            .and_then(|b| b.downcast_ref::<Vec<R>>())
            .ok_or_else(|| shardline_store::Error::TypeMismatch {
                expected: input.record_type.clone(),
                found: R::TYPE_NAME.to_string(),
            })?;
        Ok(rows)
    }
}

fn materialize(desc: &DatasetDesc) -> Result<LoadedInput> {
    let mut rows = Vec::new();
    for chunk in desc.chunks() {
        if !chunk.exists() {
            return Err(shardline_store::Error::DoesNotExist(format!(
                "{} shard {}",
                desc.label(),
                chunk.shard()
            ))
            .into());
        }
        for value in chunk.open_read()? {
            rows.push(value?);
        }
    }
    Ok(LoadedInput {
        record_type: desc.record_type.clone(),
        rows,
        typed: OnceLock::new(),
    })
}

/// Zero-input stage producing one record per item of a lazy sequence.
pub trait Source: 'static {
    type Item;
    type Output: Record;

    fn output(&self) -> &Dataset<Self::Output>;

    /// Hand over the item sequence. Called exactly once per run; `None`
    /// fails the stage with `SourceNotIterable`.
    fn items(&mut self) -> Option<Box<dyn Iterator<Item = Self::Item>>>;

    fn run(&self, item: Self::Item, ctx: &JobContext) -> anyhow::Result<Self::Output>;

    /// Build deferred members. Called once, right before the run.
    fn resolve(&mut self, _ctx: &WorkerContext) -> Result<()> {
        Ok(())
    }
}

/// One output record per zipped input row.
///
/// The output shares the inputs' chunk count; each job writes its own
/// output shard directly.
pub trait SimpleTask: Clone + Send + Sync + 'static {
    type Inputs: InputTuple;
    type Output: Record;

    /// Streamed inputs, positionally matching `Inputs`.
    fn inputs(&self) -> Vec<DatasetDesc>;

    /// Inputs every job reads in full (see [`JobContext::loaded`]).
    fn loaded(&self) -> Vec<DatasetDesc> {
        Vec::new()
    }

    fn output(&self) -> &Dataset<Self::Output>;

    /// Skip the identity check across zipped inputs.
    fn force(&self) -> bool {
        false
    }

    /// Worker threads for this stage (default: the pipeline's).
    fn workers(&self) -> Option<usize> {
        None
    }

    /// Values copied into every job.
    fn parameters(&self) -> BTreeMap<String, Value> {
        BTreeMap::new()
    }

    /// Build deferred members. Called in the worker on a fresh clone of
    /// the task, right before each job.
    fn resolve(&mut self, _ctx: &WorkerContext) -> Result<()> {
        Ok(())
    }

    fn run(&self, inputs: Self::Inputs, ctx: &JobContext) -> anyhow::Result<Self::Output>;
}

/// Zero, one or many output records per zipped input row.
///
/// An `Err` from `run` is logged and counted, and the job moves on, unless
/// `debug` is set (on the task or the pipeline) in which case the job
/// fails with `RecordFailed`.
pub trait Task: Clone + Send + Sync + 'static {
    type Inputs: InputTuple;
    type Output: Record;

    fn inputs(&self) -> Vec<DatasetDesc>;

    fn loaded(&self) -> Vec<DatasetDesc> {
        Vec::new()
    }

    fn output(&self) -> &Dataset<Self::Output>;

    fn force(&self) -> bool {
        false
    }

    fn debug(&self) -> bool {
        false
    }

    fn workers(&self) -> Option<usize> {
        None
    }

    fn parameters(&self) -> BTreeMap<String, Value> {
        BTreeMap::new()
    }

    fn resolve(&mut self, _ctx: &WorkerContext) -> Result<()> {
        Ok(())
    }

    fn run(&self, inputs: Self::Inputs, ctx: &JobContext) -> anyhow::Result<Vec<Self::Output>>;
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use shardline_store::{ChunkCount, Location, Mode};

    use super::*;
    use crate::error::Error;
    use crate::job::plan_jobs;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Word {
        id: i64,
        text: String,
    }

    impl Record for Word {
        const TYPE_NAME: &'static str = "Word";

        fn identity(&self) -> Identity {
            (self.id,).into()
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Count {
        id: i64,
        n: u32,
    }

    impl Record for Count {
        const TYPE_NAME: &'static str = "Count";

        fn identity(&self) -> Identity {
            (self.id,).into()
        }
    }

    #[test]
    fn tuple_type_names_and_identities() {
        assert_eq!(<(Word, Count)>::type_names(), vec!["Word", "Count"]);
        let row = (
            Word {
                id: 1,
                text: "a".into(),
            },
            Count { id: 2, n: 0 },
        );
        let ids = row.identities();
        assert_eq!(ids[0].to_string(), "(1,)");
        assert_eq!(ids[1].to_string(), "(2,)");
    }

    #[test]
    fn tuple_decode_reports_position() {
        let values = vec![
            serde_json::json!({"id": 1, "text": "a"}),
            serde_json::json!({"id": "bad"}),
        ];
        let err = <(Word, Count)>::decode(values).unwrap_err();
        assert_eq!(err.0, 1);

        let ok = <(Word,)>::decode(vec![serde_json::json!({"id": 3, "text": "x"})]).unwrap();
        assert_eq!(ok.0.id, 3);
    }

    #[test]
    fn state_display() {
        assert_eq!(TaskState::JobsPlanned.to_string(), "jobs planned");
        assert_eq!(TaskState::Failed.to_string(), "failed");
    }

    #[test]
    fn loaded_inputs_are_typed() {
        let dir = tempfile::tempdir().unwrap();
        let loc = Location::new(dir.path(), "p", "main");
        let lookup = Dataset::<Word>::new(&loc, "lookup", ChunkCount::C16);
        lookup.init(Mode::Write).unwrap();
        let mut w = lookup.open_writer().unwrap();
        for id in 0..5 {
            w.append(&Word {
                id,
                text: id.to_string(),
            })
            .unwrap();
        }
        w.finish().unwrap();

        let input = DatasetDesc::new(loc.clone(), "in", ChunkCount::C16, "Count");
        let jobs = plan_jobs("t", &[input], &[lookup.desc().clone()], &BTreeMap::new()).unwrap();
        let ctx = JobContext::for_job(&TaskLog::new("t"), &jobs[2]).unwrap();
        assert_eq!(ctx.job_id(), 2);
        assert_eq!(ctx.shard().map(|s| s.as_str()), Some("2"));

        let words = ctx.loaded::<Word>("lookup").unwrap();
        assert_eq!(words.len(), 5);
        // Cached after first decode
        assert_eq!(ctx.loaded::<Word>("lookup").unwrap().len(), 5);
        assert!(ctx.loaded::<Count>("lookup").is_err());
        assert!(ctx.loaded::<Word>("missing").is_err());
    }

    #[test]
    fn missing_loaded_shard_fails_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let loc = Location::new(dir.path(), "p", "main");
        let lookup = Dataset::<Word>::new(&loc, "lookup", ChunkCount::C16);
        lookup.init(Mode::Write).unwrap();
        let mut w = lookup.open_writer().unwrap();
        w.append(&Word {
            id: 1,
            text: "one".into(),
        })
        .unwrap();
        w.finish().unwrap();
        let gone = lookup.desc().chunks().remove(5);
        std::fs::remove_file(gone.path()).unwrap();

        let input = DatasetDesc::new(loc.clone(), "in", ChunkCount::C16, "Count");
        let jobs = plan_jobs("t", &[input], &[lookup.desc().clone()], &BTreeMap::new()).unwrap();
        match JobContext::for_job(&TaskLog::new("t"), &jobs[0]) {
            Err(Error::Store(shardline_store::Error::DoesNotExist(what))) => {
                assert!(what.contains("lookup"));
                assert!(what.ends_with("shard 5"));
            }
            other => panic!("unexpected {:?}", other.map(|c| c.job_id())),
        }
    }

    #[test]
    fn source_context_has_no_shard() {
        let ctx = JobContext::for_source(TaskLog::new("src"));
        assert!(ctx.shard().is_none());
        assert_eq!(ctx.total_jobs(), 1);
        assert!(ctx.parameter("x").is_none());
    }
}
