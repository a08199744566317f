//! Pipeline: ordered stages run one after another, each on its own pool
//!
//! ```text
//! Pipeline::run
//! ├── pre-flight: outputs absent + unique, inputs exist or produced earlier
//! └── per stage (strictly sequential)
//!     ├── plan jobs (one per input shard)
//!     ├── dispatch to rayon pool via WorkQueue  ── barrier
//!     └── finalise (ChkFile; Task: merge scratch shards first)
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use comfy_table::{Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};
use shardline_store::DatasetDesc;

use crate::config::PipelineConfig;
use crate::deferred::Registry;
use crate::error::{Error, Result};
use crate::logging::TaskLog;
use crate::progress::{ProgressContext, SharedProgress, fmt_num};
use crate::runner::{MapStage, SimpleStage, SourceStage, Stage, StageEnv, StageKind, StageRun};
use crate::task::{SimpleTask, Source, Task, TaskState};

/// Outcome of one stage.
#[derive(Debug, Clone)]
pub struct StageSummary {
    pub name: String,
    pub kind: StageKind,
    pub state: TaskState,
    pub jobs: usize,
    pub records_read: usize,
    pub records_written: usize,
    pub failed_records: usize,
    pub elapsed: Duration,
}

impl StageSummary {
    fn pending(name: String, kind: StageKind) -> Self {
        Self {
            name,
            kind,
            state: TaskState::Constructed,
            jobs: 0,
            records_read: 0,
            records_written: 0,
            failed_records: 0,
            elapsed: Duration::ZERO,
        }
    }

    /// Log stage completion (non-TTY mode).
    pub fn log(&self) {
        log::info!(
            "{} ({}): {} | {} jobs, {} read, {} written, {} failed [{:.1}s]",
            self.name,
            self.kind,
            self.state,
            fmt_num(self.jobs),
            fmt_num(self.records_read),
            fmt_num(self.records_written),
            fmt_num(self.failed_records),
            self.elapsed.as_secs_f64()
        );
    }
}

/// Per-stage outcomes of a pipeline run, in declared order.
#[derive(Debug, Clone, Default)]
pub struct PipelineSummary {
    pub stages: Vec<StageSummary>,
    pub elapsed: Duration,
}

impl PipelineSummary {
    pub fn succeeded(&self) -> bool {
        self.stages.iter().all(|s| s.state == TaskState::Done)
    }

    pub fn failed_records(&self) -> usize {
        self.stages.iter().map(|s| s.failed_records).sum()
    }

    pub fn log(&self) {
        for stage in &self.stages {
            stage.log();
        }
        log::info!(
            "pipeline: {} stages in {:.1}s",
            self.stages.len(),
            self.elapsed.as_secs_f64()
        );
    }

    /// Format summary table as a string.
    pub fn format_table(&self) -> String {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_header(vec![
                Cell::new("Stage")
                    .fg(Color::Cyan)
                    .add_attribute(comfy_table::Attribute::Bold),
                Cell::new("Kind").fg(Color::Cyan),
                Cell::new("State").fg(Color::Cyan),
                Cell::new("Jobs").fg(Color::Cyan),
                Cell::new("Read").fg(Color::Cyan),
                Cell::new("Written").fg(Color::Cyan),
                Cell::new("Failed").fg(Color::Cyan),
                Cell::new("Time").fg(Color::Cyan),
            ]);
        for s in &self.stages {
            let state = match s.state {
                TaskState::Done => Cell::new(s.state).fg(Color::Green),
                TaskState::Failed => Cell::new(s.state).fg(Color::Red),
                _ => Cell::new(s.state).fg(Color::DarkGrey),
            };
            let failed = if s.failed_records > 0 {
                Cell::new(fmt_num(s.failed_records)).fg(Color::Yellow)
            } else {
                Cell::new("0")
            };
            table.add_row(vec![
                Cell::new(&s.name),
                Cell::new(s.kind),
                state,
                Cell::new(fmt_num(s.jobs)),
                Cell::new(fmt_num(s.records_read)),
                Cell::new(fmt_num(s.records_written)),
                failed,
                Cell::new(format!("{:.1}s", s.elapsed.as_secs_f64())),
            ]);
        }
        table.to_string()
    }
}

/// Ordered list of stages plus the shared run configuration.
pub struct Pipeline {
    config: PipelineConfig,
    registry: Arc<Registry>,
    progress: Option<SharedProgress>,
    stages: Vec<Box<dyn Stage>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stages: Vec<String> = self.stages.iter().map(|s| s.output().label()).collect();
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("stages", &stages)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            registry: Arc::new(Registry::new()),
            progress: None,
            stages: Vec::new(),
        }
    }

    /// Constructors available to deferred task members.
    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Draw bars on an existing context (share it with the log bridge).
    pub fn with_progress(mut self, progress: SharedProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn source<S: Source>(mut self, source: S) -> Self {
        self.stages.push(Box::new(SourceStage::new(source)));
        self
    }

    pub fn simple<T: SimpleTask>(mut self, task: T) -> Self {
        self.stages.push(Box::new(SimpleStage::new(task)));
        self
    }

    pub fn task<T: Task>(mut self, task: T) -> Self {
        self.stages.push(Box::new(MapStage::new(task)));
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Checks run for the whole pipeline before any stage starts.
    pub fn check(&self) -> Result<()> {
        let outputs: Vec<&DatasetDesc> = self.stages.iter().map(|s| s.output()).collect();

        for (i, output) in outputs.iter().enumerate() {
            if let Some(first) = outputs[..i].iter().position(|o| o.same_dataset(output)) {
                return Err(Error::DuplicateOutput {
                    first,
                    second: i,
                    output: output.label(),
                });
            }
            if output.exists() {
                return Err(shardline_store::Error::AlreadyExists(output.label()).into());
            }
        }

        for (i, stage) in self.stages.iter().enumerate() {
            for input in stage.inputs() {
                let produced_earlier = outputs[..i].iter().any(|o| o.same_dataset(&input));
                if !produced_earlier && !input.is_complete() {
                    return Err(shardline_store::Error::DoesNotExist(input.label()).into());
                }
            }
        }
        Ok(())
    }

    /// Run every stage in order. The first fatal error aborts the run.
    pub fn run(mut self) -> Result<PipelineSummary> {
        self.check()?;

        let progress = match self.progress.take() {
            Some(p) => p,
            None if self.config.progress => Arc::new(ProgressContext::new()),
            None => Arc::new(ProgressContext::hidden()),
        };
        let env = StageEnv {
            config: &self.config,
            registry: &self.registry,
            progress: &progress,
        };

        let started = Instant::now();
        let mut summary = PipelineSummary {
            stages: self
                .stages
                .iter()
                .map(|s| StageSummary::pending(s.output().name.clone(), s.kind()))
                .collect(),
            elapsed: Duration::ZERO,
        };

        for (i, stage) in self.stages.iter_mut().enumerate() {
            let log = TaskLog::new(stage.output().name.clone());
            log.info(format_args!("starting {} stage", stage.kind()));
            let mut run = StageRun::new(log.clone());
            let stage_started = Instant::now();
            let outcome = stage.execute(&env, &mut run);
            let entry = &mut summary.stages[i];
            entry.elapsed = stage_started.elapsed();

            match outcome {
                Ok(outcome) => {
                    run.advance(TaskState::Done);
                    entry.state = run.state();
                    entry.jobs = outcome.jobs;
                    entry.records_read = outcome.totals.records_read;
                    entry.records_written = outcome.totals.records_written;
                    entry.failed_records = outcome.totals.failed_records;
                    if !progress.is_tty() {
                        entry.log();
                    }
                }
                Err(e) => {
                    run.advance(TaskState::Failed);
                    entry.state = run.state();
                    log.error(format_args!("stage failed: {e}"));
                    summary.elapsed = started.elapsed();
                    report(&summary, &progress);
                    return Err(e);
                }
            }
        }

        summary.elapsed = started.elapsed();
        report(&summary, &progress);
        Ok(summary)
    }
}

fn report(summary: &PipelineSummary, progress: &ProgressContext) {
    if progress.is_tty() {
        progress.println(summary.format_table());
    } else {
        log::info!(
            "pipeline: {} of {} stages done in {:.1}s",
            summary
                .stages
                .iter()
                .filter(|s| s.state == TaskState::Done)
                .count(),
            summary.stages.len(),
            summary.elapsed.as_secs_f64()
        );
    }
}
