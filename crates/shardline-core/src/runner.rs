//! Stage execution: input checks, job dispatch on a rayon pool, and the
//! per-kind job bodies

use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use indicatif::ProgressBar;
use serde::Serialize;
use shardline_store::{
    ChkFile, ChunkReader, Dataset, DatasetDesc, Mode, ShardDigest, WriteMode,
};

use crate::config::PipelineConfig;
use crate::deferred::{Registry, WorkerContext};
use crate::error::{Error, Result};
use crate::job::{Job, JobReport, JobResults, plan_jobs, totals};
use crate::logging::TaskLog;
use crate::merge;
use crate::progress::{ProgressContext, fmt_num};
use crate::task::{InputTuple, JobContext, SimpleTask, Source, Task, TaskState};
use crate::work_queue::WorkQueue;

/// Log a source's progress every this many records.
const SOURCE_LOG_INTERVAL: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StageKind {
    Source,
    SimpleTask,
    Task,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Source => "source",
            Self::SimpleTask => "simple",
            Self::Task => "task",
        })
    }
}

/// Shared by every stage of one pipeline run.
pub(crate) struct StageEnv<'a> {
    pub config: &'a PipelineConfig,
    pub registry: &'a Arc<Registry>,
    pub progress: &'a ProgressContext,
}

/// State machine of one stage run; every transition is logged.
pub(crate) struct StageRun {
    log: TaskLog,
    state: TaskState,
}

impl StageRun {
    pub fn new(log: TaskLog) -> Self {
        Self {
            log,
            state: TaskState::Constructed,
        }
    }

    pub fn advance(&mut self, next: TaskState) {
        self.log.debug(format_args!("{} -> {next}", self.state));
        self.state = next;
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn log(&self) -> &TaskLog {
        &self.log
    }
}

pub(crate) struct StageOutcome {
    pub jobs: usize,
    pub totals: JobResults,
}

/// Object-safe view of a Source, SimpleTask or Task.
pub(crate) trait Stage {
    fn kind(&self) -> StageKind;

    /// Output descriptor, with every input recorded as a dependency.
    fn output(&self) -> &DatasetDesc;

    /// Streamed and loaded inputs.
    fn inputs(&self) -> Vec<DatasetDesc>;

    fn execute(&mut self, env: &StageEnv<'_>, run: &mut StageRun) -> Result<StageOutcome>;
}

fn output_with_lineage(output: &DatasetDesc, inputs: &[DatasetDesc]) -> DatasetDesc {
    let mut output = output.clone();
    for input in inputs {
        output.add_dependency(input);
    }
    output
}

/// Inputs must match the declared tuple positionally and be readable.
fn check_inputs<I: InputTuple>(inputs: &[DatasetDesc], loaded: &[DatasetDesc]) -> Result<()> {
    let expected = I::type_names();
    let found: Vec<&str> = inputs.iter().map(|d| d.record_type.as_str()).collect();
    if found != expected {
        return Err(shardline_store::Error::TypeMismatch {
            expected: format!("({})", expected.join(", ")),
            found: format!("({})", found.join(", ")),
        }
        .into());
    }
    for desc in inputs.iter().chain(loaded) {
        desc.init(Mode::Read)?;
    }
    Ok(())
}

/// Output of a shard-aligned stage must share the inputs' chunk count.
fn check_output_width(task: &str, inputs: &[DatasetDesc], output: &DatasetDesc) -> Result<()> {
    match inputs.first() {
        Some(first) if first.chunk_count != output.chunk_count => Err(Error::ChunkCountMismatch {
            task: task.to_string(),
            input: output.label(),
            expected: first.chunk_count.count(),
            found: output.chunk_count.count(),
        }),
        _ => Ok(()),
    }
}

/// Rows of one job: the job's shard of every input, read in lockstep.
struct ZippedRows<I> {
    readers: Vec<ChunkReader>,
    force: bool,
    task: String,
    job: Job,
    done: bool,
    _marker: PhantomData<fn() -> I>,
}

fn zip_inputs<I: InputTuple>(task: &str, job: &Job, force: bool) -> Result<ZippedRows<I>> {
    let readers = job
        .input_chunks
        .iter()
        .map(|chunk| chunk.open_read())
        .collect::<shardline_store::Result<Vec<_>>>()?;
    Ok(ZippedRows {
        readers,
        force,
        task: task.to_string(),
        job: job.clone(),
        done: false,
        _marker: PhantomData,
    })
}

impl<I> ZippedRows<I> {
    fn conflict(&mut self, found: String) -> Error {
        self.done = true;
        Error::IdentityConflict {
            task: self.task.clone(),
            job: self.job.id,
            shard: self.job.shard.to_string(),
            found,
        }
    }
}

impl<I: InputTuple> Iterator for ZippedRows<I> {
    type Item = Result<I>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut values = Vec::with_capacity(self.readers.len());
        let mut exhausted = 0;
        for reader in &mut self.readers {
            match reader.next() {
                Some(Ok(v)) => values.push(v),
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
                None => exhausted += 1,
            }
        }
        if exhausted == self.readers.len() {
            self.done = true;
            return None;
        }
        if exhausted > 0 {
            // Forced zips stop at the shortest input
            if self.force {
                self.done = true;
                return None;
            }
            let found = format!("{exhausted} of {} inputs ended early", self.readers.len());
            return Some(Err(self.conflict(found)));
        }

        let row = match I::decode(values) {
            Ok(row) => row,
            Err((idx, source)) => {
                self.done = true;
                return Some(Err(shardline_store::Error::Decode {
                    path: self.readers[idx].path().to_path_buf(),
                    source,
                }
                .into()));
            }
        };
        if !self.force {
            let ids = row.identities();
            if ids.iter().any(|id| id != &ids[0]) {
                let found = ids
                    .iter()
                    .map(|id| id.to_string())
                    .collect::<Vec<_>>()
                    .join(" vs ");
                return Some(Err(self.conflict(found)));
            }
        }
        Some(Ok(row))
    }
}

fn build_pool(workers: usize) -> Result<rayon::ThreadPool> {
    Ok(rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("shardline-worker-{i}"))
        .build()?)
}

/// Run every job on `workers` pool threads pulling from a shared queue.
///
/// The first fatal error stops further claims; jobs already running finish
/// and their reports are dropped. Reports come back in job-id order.
fn dispatch<F>(
    pool: &rayon::ThreadPool,
    workers: usize,
    jobs: Vec<Job>,
    bar: &ProgressBar,
    log: &TaskLog,
    execute: F,
) -> Result<Vec<JobReport>>
where
    F: Fn(&Job, usize) -> Result<JobReport> + Sync,
{
    let queue = WorkQueue::new(jobs);
    let reports = Mutex::new(Vec::with_capacity(queue.total()));
    let failure: Mutex<Option<Error>> = Mutex::new(None);
    let threads = workers.min(queue.total()).max(1);

    {
        let (queue, reports, failure, execute) = (&queue, &reports, &failure, &execute);
        pool.scope(|s| {
            for worker in 0..threads {
                s.spawn(move |_| {
                    while let Some(job) = queue.next() {
                        match execute(job, worker) {
                            Ok(report) => reports
                                .lock()
                                .expect("worker thread panicked")
                                .push(report),
                            Err(e) => {
                                queue.abort();
                                log.error(format_args!("job {:03} failed: {e}", job.id));
                                let mut slot = failure.lock().expect("worker thread panicked");
                                if slot.is_none() {
                                    *slot = Some(e);
                                }
                            }
                        }
                        bar.inc(1);
                    }
                });
            }
        });
    }

    if let Some(e) = failure.into_inner().expect("worker thread panicked") {
        return Err(e);
    }
    let mut reports = reports.into_inner().expect("worker thread panicked");
    reports.sort_by_key(|r| r.job_id);
    Ok(reports)
}

// =============================================================================
// Source
// =============================================================================

pub(crate) struct SourceStage<S> {
    task: S,
    output: DatasetDesc,
}

impl<S: Source> SourceStage<S> {
    pub fn new(task: S) -> Self {
        let output = task.output().desc().clone();
        Self { task, output }
    }
}

impl<S: Source> Stage for SourceStage<S> {
    fn kind(&self) -> StageKind {
        StageKind::Source
    }

    fn output(&self) -> &DatasetDesc {
        &self.output
    }

    fn inputs(&self) -> Vec<DatasetDesc> {
        Vec::new()
    }

    fn execute(&mut self, env: &StageEnv<'_>, run: &mut StageRun) -> Result<StageOutcome> {
        let log = run.log().clone();
        let name = self.output.name.clone();

        self.task
            .resolve(&WorkerContext::new(Arc::clone(env.registry), 0, 0))?;
        let items = self
            .task
            .items()
            .ok_or_else(|| Error::SourceNotIterable(self.output.label()))?;
        self.output.init(Mode::Write)?;
        run.advance(TaskState::JobsPlanned);

        run.advance(TaskState::Executing);
        let bar = env.progress.phase_line(&name, "reading items");
        let ctx = JobContext::for_source(log.clone());
        let mut writer = Dataset::<S::Output>::from_desc(self.output.clone())?.open_writer()?;
        let mut results = JobResults::default();
        for item in items {
            results.records_read += 1;
            let record = self
                .task
                .run(item, &ctx)
                .map_err(|e| Error::run(log.task(), e))?;
            writer.append(&record)?;
            results.records_written += 1;
            if results.records_written % SOURCE_LOG_INTERVAL == 0 {
                bar.set_message(format!("{} records", fmt_num(results.records_written)));
                log.debug(format_args!("{} records", fmt_num(results.records_written)));
            }
        }

        run.advance(TaskState::Finalising);
        bar.set_message("writing checksums");
        writer.finish()?;
        bar.finish_and_clear();
        Ok(StageOutcome {
            jobs: 1,
            totals: results,
        })
    }
}

// =============================================================================
// SimpleTask
// =============================================================================

pub(crate) struct SimpleStage<T> {
    task: T,
    output: DatasetDesc,
}

impl<T: SimpleTask> SimpleStage<T> {
    pub fn new(task: T) -> Self {
        let deps: Vec<DatasetDesc> = task.inputs().into_iter().chain(task.loaded()).collect();
        let output = output_with_lineage(task.output().desc(), &deps);
        Self { task, output }
    }
}

fn simple_job<T: SimpleTask>(
    template: &T,
    output: &DatasetDesc,
    job: &Job,
    worker: usize,
    registry: &Arc<Registry>,
    log: &TaskLog,
) -> Result<JobReport> {
    let mut task = template.clone();
    task.resolve(&WorkerContext::new(Arc::clone(registry), job.id, worker))?;
    let ctx = JobContext::for_job(log, job)?;

    let mut writer = output.chunk(&job.shard).open_write(WriteMode::Truncate)?;
    let mut results = JobResults::default();
    for row in zip_inputs::<T::Inputs>(log.task(), job, task.force())? {
        let inputs = row?;
        results.records_read += 1;
        let record = task
            .run(inputs, &ctx)
            .map_err(|e| Error::run(log.task(), e))?;
        writer.append(&record)?;
        results.records_written += 1;
    }
    results.digest = Some(writer.close()?);
    ctx.log()
        .debug(format_args!("{} records", fmt_num(results.records_written)));
    Ok(JobReport::ok(job.id, results))
}

impl<T: SimpleTask> Stage for SimpleStage<T> {
    fn kind(&self) -> StageKind {
        StageKind::SimpleTask
    }

    fn output(&self) -> &DatasetDesc {
        &self.output
    }

    fn inputs(&self) -> Vec<DatasetDesc> {
        self.task.inputs().into_iter().chain(self.task.loaded()).collect()
    }

    fn execute(&mut self, env: &StageEnv<'_>, run: &mut StageRun) -> Result<StageOutcome> {
        let log = run.log().clone();
        let inputs = self.task.inputs();
        let loaded = self.task.loaded();
        check_inputs::<T::Inputs>(&inputs, &loaded)?;
        check_output_width(log.task(), &inputs, &self.output)?;
        let jobs = plan_jobs(log.task(), &inputs, &loaded, &self.task.parameters())?;
        self.output.init(Mode::Write)?;
        run.advance(TaskState::JobsPlanned);

        let total = jobs.len();
        let workers = env.config.workers_for(self.task.workers());
        let pool = build_pool(workers)?;
        log.debug(format_args!("{total} jobs on {workers} workers"));
        run.advance(TaskState::Executing);
        let bar = env.progress.job_bar(log.task(), total);
        let (task, output) = (&self.task, &self.output);
        let reports = dispatch(&pool, workers, jobs, &bar, &log, |job, worker| {
            simple_job(task, output, job, worker, env.registry, &log)
        })?;
        bar.finish_and_clear();

        run.advance(TaskState::Finalising);
        let digests: Vec<ShardDigest> = reports
            .iter()
            .filter_map(|r| r.results.digest.clone())
            .collect();
        ChkFile::make(&self.output, &digests)?;
        Ok(StageOutcome {
            jobs: total,
            totals: totals(&reports),
        })
    }
}

// =============================================================================
// Task
// =============================================================================

pub(crate) struct MapStage<T> {
    task: T,
    output: DatasetDesc,
}

impl<T: Task> MapStage<T> {
    pub fn new(task: T) -> Self {
        let deps: Vec<DatasetDesc> = task.inputs().into_iter().chain(task.loaded()).collect();
        let output = output_with_lineage(task.output().desc(), &deps);
        Self { task, output }
    }
}

fn map_job<T: Task>(
    template: &T,
    output: &DatasetDesc,
    job: &Job,
    worker: usize,
    registry: &Arc<Registry>,
    log: &TaskLog,
    debug: bool,
) -> Result<JobReport> {
    let mut task = template.clone();
    task.resolve(&WorkerContext::new(Arc::clone(registry), job.id, worker))?;
    let ctx = JobContext::for_job(log, job)?;

    let scratch = Dataset::<T::Output>::from_desc(merge::temp_dataset(output, job.id))?;
    scratch.init(Mode::Write)?;
    let mut writer = scratch.open_sparse_writer()?;
    let mut results = JobResults::default();
    for row in zip_inputs::<T::Inputs>(log.task(), job, task.force())? {
        let inputs = row?;
        results.records_read += 1;
        let identity = inputs.identities().swap_remove(0);
        match task.run(inputs, &ctx) {
            Ok(records) => {
                for record in &records {
                    writer.append(record)?;
                }
                results.records_written += records.len();
            }
            Err(source) if debug => {
                return Err(Error::RecordFailed {
                    task: log.task().to_string(),
                    job: job.id,
                    identity: identity.to_string(),
                    source,
                });
            }
            Err(e) => {
                results.failed_records += 1;
                ctx.log().warn(format_args!("record {identity} failed: {e:#}"));
            }
        }
    }
    writer.close()?;
    ctx.log().debug(format_args!(
        "{} in, {} out, {} failed",
        fmt_num(results.records_read),
        fmt_num(results.records_written),
        results.failed_records
    ));
    Ok(JobReport::ok(job.id, results))
}

impl<T: Task> Stage for MapStage<T> {
    fn kind(&self) -> StageKind {
        StageKind::Task
    }

    fn output(&self) -> &DatasetDesc {
        &self.output
    }

    fn inputs(&self) -> Vec<DatasetDesc> {
        self.task.inputs().into_iter().chain(self.task.loaded()).collect()
    }

    fn execute(&mut self, env: &StageEnv<'_>, run: &mut StageRun) -> Result<StageOutcome> {
        let log = run.log().clone();
        let inputs = self.task.inputs();
        let loaded = self.task.loaded();
        check_inputs::<T::Inputs>(&inputs, &loaded)?;
        merge::clean_stale(&self.output, &log)?;
        let jobs = plan_jobs(log.task(), &inputs, &loaded, &self.task.parameters())?;
        self.output.init(Mode::Write)?;
        run.advance(TaskState::JobsPlanned);

        let total = jobs.len();
        let workers = env.config.workers_for(self.task.workers());
        let debug = env.config.debug || self.task.debug();
        let pool = build_pool(workers)?;
        log.debug(format_args!("{total} jobs on {workers} workers"));
        run.advance(TaskState::Executing);
        let bar = env.progress.job_bar(log.task(), total);
        let (task, output) = (&self.task, &self.output);
        let reports = dispatch(&pool, workers, jobs, &bar, &log, |job, worker| {
            map_job(task, output, job, worker, env.registry, &log, debug)
        })?;
        bar.finish_and_clear();

        run.advance(TaskState::Finalising);
        let merge_line = env.progress.phase_line(log.task(), "merging shards");
        pool.install(|| merge::finalise(&self.output, &log))?;
        merge_line.finish_and_clear();

        let totals = totals(&reports);
        if totals.failed_records > 0 {
            log.warn(format_args!(
                "{} records failed and were skipped",
                fmt_num(totals.failed_records)
            ));
        }
        Ok(StageOutcome { jobs: total, totals })
    }
}
