//! Error type for task execution and pipeline orchestration

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Fatal failure of a stage or pipeline run.
///
/// Nothing here is retried. Per-record `Task::run` errors never become an
/// `Error` unless the task runs in debug mode.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] shardline_store::Error),

    /// Zipped input records disagree on identity and `force` is not set.
    #[error("{task}: job {job} shard {shard}: identities differ across inputs: {found}")]
    IdentityConflict {
        task: String,
        job: usize,
        shard: String,
        found: String,
    },

    /// A source handed over no item sequence (or handed it over twice).
    #[error("{0}: source did not provide an item sequence")]
    SourceNotIterable(String),

    #[error("{task}: input {input} has {found} chunks, expected {expected}")]
    ChunkCountMismatch {
        task: String,
        input: String,
        expected: u32,
        found: u32,
    },

    /// Per-record failure escalated because the task runs in debug mode.
    #[error("{task}: job {job}: record {identity} failed: {source:#}")]
    RecordFailed {
        task: String,
        job: usize,
        identity: String,
        #[source]
        source: anyhow::Error,
    },

    /// Fatal error returned by user task code.
    #[error("{task}: {source:#}")]
    Run {
        task: String,
        #[source]
        source: anyhow::Error,
    },

    /// A plain plan argument has no JSON representation.
    #[error("{constructor} argument {index}: {source}")]
    PlanArgument {
        constructor: String,
        index: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("no constructor registered under {0:?}")]
    UnknownConstructor(String),

    #[error("deferred {context}: expected {expected}")]
    DeferredType {
        context: String,
        expected: &'static str,
    },

    /// A deferred member was used before the worker resolved it.
    #[error("deferred {0} used before it was resolved")]
    Unresolved(String),

    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("stages {first} and {second} both write {output}")]
    DuplicateOutput {
        first: usize,
        second: usize,
        output: String,
    },
}

impl Error {
    pub(crate) fn run(task: &str, source: anyhow::Error) -> Self {
        Self::Run {
            task: task.to_string(),
            source,
        }
    }
}
