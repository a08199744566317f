//! shardline-core: task execution engine over sharded datasets
//!
//! Stages turn input datasets into one output dataset. Each stage plans
//! one job per input shard, runs the jobs on a rayon pool and then
//! finalises the output (writing its ChkFile, merging per-job scratch
//! datasets first where needed). A [`Pipeline`] runs stages in order.

pub mod config;
pub mod deferred;
pub mod error;
pub mod job;
pub mod logging;
pub mod merge;
pub mod pipeline;
pub mod progress;
mod runner;
pub mod task;
pub mod work_queue;

pub use config::PipelineConfig;
pub use deferred::{Args, ConstructionPlan, Deferred, PlanArg, Registry, WorkerContext};
pub use error::{Error, Result};
pub use job::{Job, JobReport, JobResults};
pub use logging::{IndicatifLogger, TaskLog, init_logging};
pub use pipeline::{Pipeline, PipelineSummary, StageSummary};
pub use progress::{ProgressContext, SharedProgress, fmt_num};
pub use runner::StageKind;
pub use task::{InputTuple, JobContext, SimpleTask, Source, Task, TaskState};
