use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::bail;
use serde::{Deserialize, Serialize};
use shardline_core::{
    Args, ConstructionPlan, Deferred, Error, JobContext, Pipeline, PipelineConfig, Registry,
    SimpleTask, Source, Task, TaskState, WorkerContext,
};
use shardline_store::{ChunkCount, Dataset, DatasetDesc, DefFile, Identity, Location, Mode, Record};

// =============================================================================
// Records
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
struct DataClass1 {
    id: i64,
    value: i64,
}

impl Record for DataClass1 {
    const TYPE_NAME: &'static str = "DataClass1";

    fn identity(&self) -> Identity {
        (self.id,).into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
struct Token {
    doc: i64,
    pos: i64,
    text: String,
}

impl Record for Token {
    const TYPE_NAME: &'static str = "Token";

    fn identity(&self) -> Identity {
        (self.doc, self.pos).into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
struct Label {
    id: i64,
    label: String,
}

impl Record for Label {
    const TYPE_NAME: &'static str = "Label";

    fn identity(&self) -> Identity {
        (self.id,).into()
    }
}

// =============================================================================
// Stages
// =============================================================================

struct Numbers {
    output: Dataset<DataClass1>,
    items: Option<Vec<i64>>,
}

impl Source for Numbers {
    type Item = i64;
    type Output = DataClass1;

    fn output(&self) -> &Dataset<DataClass1> {
        &self.output
    }

    fn items(&mut self) -> Option<Box<dyn Iterator<Item = i64>>> {
        let items = self.items.take()?;
        Some(Box::new(items.into_iter()))
    }

    fn run(&self, k: i64, _ctx: &JobContext) -> anyhow::Result<DataClass1> {
        Ok(DataClass1 { id: k, value: k })
    }
}

#[derive(Clone)]
struct Join {
    left: Dataset<DataClass1>,
    right: Dataset<DataClass1>,
    output: Dataset<DataClass1>,
    force: bool,
}

impl SimpleTask for Join {
    type Inputs = (DataClass1, DataClass1);
    type Output = DataClass1;

    fn inputs(&self) -> Vec<DatasetDesc> {
        vec![self.left.desc().clone(), self.right.desc().clone()]
    }

    fn output(&self) -> &Dataset<DataClass1> {
        &self.output
    }

    fn force(&self) -> bool {
        self.force
    }

    fn run(&self, (a, b): (DataClass1, DataClass1), _ctx: &JobContext) -> anyhow::Result<DataClass1> {
        Ok(DataClass1 {
            id: a.id,
            value: a.value + b.value,
        })
    }
}

/// Pairs positionally but mints a new identity from both sides.
#[derive(Clone)]
struct Rekey {
    left: Dataset<DataClass1>,
    right: Dataset<DataClass1>,
    output: Dataset<DataClass1>,
}

impl SimpleTask for Rekey {
    type Inputs = (DataClass1, DataClass1);
    type Output = DataClass1;

    fn inputs(&self) -> Vec<DatasetDesc> {
        vec![self.left.desc().clone(), self.right.desc().clone()]
    }

    fn output(&self) -> &Dataset<DataClass1> {
        &self.output
    }

    fn force(&self) -> bool {
        true
    }

    fn run(&self, (a, b): (DataClass1, DataClass1), _ctx: &JobContext) -> anyhow::Result<DataClass1> {
        Ok(DataClass1 {
            id: a.id * 1000 + b.id,
            value: a.value,
        })
    }
}

/// Fans each record out into `value % 3 + 1` tokens; ids ending in 7 fail.
#[derive(Clone)]
struct Tokenize {
    input: Dataset<DataClass1>,
    output: Dataset<Token>,
    debug: bool,
}

impl Task for Tokenize {
    type Inputs = (DataClass1,);
    type Output = Token;

    fn inputs(&self) -> Vec<DatasetDesc> {
        vec![self.input.desc().clone()]
    }

    fn output(&self) -> &Dataset<Token> {
        &self.output
    }

    fn debug(&self) -> bool {
        self.debug
    }

    fn workers(&self) -> Option<usize> {
        Some(4)
    }

    fn run(&self, (rec,): (DataClass1,), _ctx: &JobContext) -> anyhow::Result<Vec<Token>> {
        if rec.id % 10 == 7 {
            bail!("unlucky record {}", rec.id);
        }
        Ok((0..rec.value % 3 + 1)
            .map(|pos| Token {
                doc: rec.id,
                pos,
                text: format!("{}-{pos}", rec.id),
            })
            .collect())
    }
}

struct Scaler {
    factor: i64,
}

/// Multiplies values by a factor built inside the worker.
#[derive(Clone)]
struct Scale {
    input: Dataset<DataClass1>,
    output: Dataset<DataClass1>,
    scaler: Deferred<Scaler>,
}

impl SimpleTask for Scale {
    type Inputs = (DataClass1,);
    type Output = DataClass1;

    fn inputs(&self) -> Vec<DatasetDesc> {
        vec![self.input.desc().clone()]
    }

    fn output(&self) -> &Dataset<DataClass1> {
        &self.output
    }

    fn resolve(&mut self, ctx: &WorkerContext) -> shardline_core::Result<()> {
        self.scaler.resolve(ctx.registry())?;
        Ok(())
    }

    fn run(&self, (rec,): (DataClass1,), _ctx: &JobContext) -> anyhow::Result<DataClass1> {
        let factor = self.scaler.get()?.factor;
        Ok(DataClass1 {
            id: rec.id,
            value: rec.value * factor,
        })
    }
}

/// Attaches a label from a fully loaded lookup dataset.
#[derive(Clone)]
struct Annotate {
    input: Dataset<DataClass1>,
    labels: Dataset<Label>,
    output: Dataset<Label>,
}

impl SimpleTask for Annotate {
    type Inputs = (DataClass1,);
    type Output = Label;

    fn inputs(&self) -> Vec<DatasetDesc> {
        vec![self.input.desc().clone()]
    }

    fn loaded(&self) -> Vec<DatasetDesc> {
        vec![self.labels.desc().clone()]
    }

    fn output(&self) -> &Dataset<Label> {
        &self.output
    }

    fn run(&self, (rec,): (DataClass1,), ctx: &JobContext) -> anyhow::Result<Label> {
        let labels = ctx.loaded::<Label>(self.labels.name())?;
        let label = labels
            .iter()
            .find(|l| l.id == rec.value % 2)
            .map(|l| l.label.clone())
            .unwrap_or_default();
        Ok(Label { id: rec.id, label })
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn location(root: &Path) -> Location {
    Location::new(root, "proj", "main")
}

fn config() -> PipelineConfig {
    PipelineConfig {
        workers: 2,
        debug: false,
        progress: false,
    }
}

fn write_dataset(
    loc: &Location,
    name: &str,
    ids: impl IntoIterator<Item = i64>,
) -> Dataset<DataClass1> {
    let ds = Dataset::<DataClass1>::new(loc, name, ChunkCount::C16);
    ds.init(Mode::Write).unwrap();
    let mut w = ds.open_writer().unwrap();
    for k in ids {
        w.append(&DataClass1 { id: k, value: k }).unwrap();
    }
    w.finish().unwrap();
    ds
}

fn read_all<R: Record + Ord>(ds: &Dataset<R>) -> BTreeSet<R> {
    ds.open_reader()
        .unwrap()
        .collect::<shardline_store::Result<_>>()
        .unwrap()
}

fn hundred() -> BTreeSet<DataClass1> {
    (0..100).map(|k| DataClass1 { id: k, value: k }).collect()
}

// =============================================================================
// Source
// =============================================================================

#[test]
fn source_writes_durable_dataset() {
    let dir = tempfile::tempdir().unwrap();
    let output = Dataset::new(&location(dir.path()), "numbers", ChunkCount::C16);
    let summary = Pipeline::new(config())
        .source(Numbers {
            output: output.clone(),
            items: Some((0..100).collect()),
        })
        .run()
        .unwrap();

    assert_eq!(read_all(&output), hundred());
    assert!(output.is_complete());
    output.verify().unwrap();
    assert_eq!(summary.stages[0].state, TaskState::Done);
    assert_eq!(summary.stages[0].records_written, 100);
}

#[test]
fn source_without_items_fails() {
    let dir = tempfile::tempdir().unwrap();
    let output = Dataset::<DataClass1>::new(&location(dir.path()), "numbers", ChunkCount::C16);
    let err = Pipeline::new(config())
        .source(Numbers {
            output: output.clone(),
            items: None,
        })
        .run()
        .unwrap_err();
    assert!(matches!(err, Error::SourceNotIterable(_)));
    // Nothing was created
    assert!(!output.exists());
}

// =============================================================================
// SimpleTask
// =============================================================================

#[test]
fn simple_task_joins_aligned_inputs() {
    let dir = tempfile::tempdir().unwrap();
    let loc = location(dir.path());
    let left = write_dataset(&loc, "left", 0..100);
    let right = write_dataset(&loc, "right", 0..100);
    let output = Dataset::new(&loc, "joined", ChunkCount::C16);

    Pipeline::new(config())
        .simple(Join {
            left,
            right,
            output: output.clone(),
            force: false,
        })
        .run()
        .unwrap();

    let expected: BTreeSet<_> = (0..100).map(|k| DataClass1 { id: k, value: 2 * k }).collect();
    assert_eq!(read_all(&output), expected);
    output.verify().unwrap();
}

#[test]
fn reversed_inputs_conflict_without_force() {
    let dir = tempfile::tempdir().unwrap();
    let loc = location(dir.path());
    let left = write_dataset(&loc, "left", 0..100);
    let right = write_dataset(&loc, "right", (0..100).rev());
    let output = Dataset::<DataClass1>::new(&loc, "joined", ChunkCount::C16);

    let err = Pipeline::new(config())
        .simple(Join {
            left,
            right,
            output: output.clone(),
            force: false,
        })
        .run()
        .unwrap_err();
    assert!(matches!(err, Error::IdentityConflict { .. }), "{err}");
    assert!(!output.is_complete());
}

#[test]
fn reversed_inputs_pair_positionally_with_force() {
    let dir = tempfile::tempdir().unwrap();
    let loc = location(dir.path());
    let left = write_dataset(&loc, "left", 0..100);
    let right = write_dataset(&loc, "right", (0..100).rev());
    let output = Dataset::<DataClass1>::new(&loc, "joined", ChunkCount::C16);

    Pipeline::new(config())
        .simple(Join {
            left,
            right,
            output: output.clone(),
            force: true,
        })
        .run()
        .unwrap();
    let ids: BTreeSet<i64> = read_all(&output).into_iter().map(|r| r.id).collect();
    assert_eq!(ids, (0..100).collect());
}

#[test]
fn forced_output_routed_to_another_shard_fails() {
    let dir = tempfile::tempdir().unwrap();
    let loc = location(dir.path());
    let left = write_dataset(&loc, "left", 0..100);
    let right = write_dataset(&loc, "right", (0..100).rev());
    let output = Dataset::<DataClass1>::new(&loc, "rekeyed", ChunkCount::C16);

    let err = Pipeline::new(config())
        .simple(Rekey {
            left,
            right,
            output: output.clone(),
        })
        .run()
        .unwrap_err();
    assert!(
        matches!(
            err,
            Error::Store(shardline_store::Error::ShardRouting { .. })
        ),
        "{err}"
    );
    assert!(!output.is_complete());
}

#[test]
fn mismatched_chunk_counts_fail() {
    let dir = tempfile::tempdir().unwrap();
    let loc = location(dir.path());
    let left = write_dataset(&loc, "left", 0..10);
    let right = Dataset::<DataClass1>::new(&loc, "right", ChunkCount::C256);
    right.init(Mode::Write).unwrap();
    right.open_writer().unwrap().finish().unwrap();

    let err = Pipeline::new(config())
        .simple(Join {
            left,
            right,
            output: Dataset::new(&loc, "joined", ChunkCount::C16),
            force: false,
        })
        .run()
        .unwrap_err();
    assert!(matches!(err, Error::ChunkCountMismatch { .. }));
}

#[test]
fn deferred_members_resolve_inside_workers() {
    let dir = tempfile::tempdir().unwrap();
    let loc = location(dir.path());
    let input = write_dataset(&loc, "numbers", 0..50);
    let output = Dataset::new(&loc, "scaled", ChunkCount::C16);

    let built = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&built);
    let mut registry = Registry::new();
    registry.register("scaler", move |args: &mut Args| {
        let on_worker = std::thread::current()
            .name()
            .is_some_and(|n| n.starts_with("shardline-worker"));
        if !on_worker {
            bail!("scaler built outside a worker");
        }
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Scaler {
            factor: args.value(0)?,
        })
    });

    let task = Scale {
        input,
        output: output.clone(),
        scaler: Deferred::new(ConstructionPlan::new("scaler").arg(3).unwrap()),
    };
    Pipeline::new(config())
        .with_registry(registry)
        .simple(task)
        .run()
        .unwrap();

    let expected: BTreeSet<_> = (0..50).map(|k| DataClass1 { id: k, value: 3 * k }).collect();
    assert_eq!(read_all(&output), expected);
    // One build per job
    assert_eq!(built.load(Ordering::SeqCst), 16);
}

#[test]
fn unknown_constructor_fails_the_stage() {
    let dir = tempfile::tempdir().unwrap();
    let loc = location(dir.path());
    let input = write_dataset(&loc, "numbers", 0..10);
    let err = Pipeline::new(config())
        .simple(Scale {
            input,
            output: Dataset::new(&loc, "scaled", ChunkCount::C16),
            scaler: Deferred::new(ConstructionPlan::new("scaler")),
        })
        .run()
        .unwrap_err();
    assert!(matches!(err, Error::UnknownConstructor(_)));
}

#[test]
fn loaded_inputs_are_available_to_every_job() {
    let dir = tempfile::tempdir().unwrap();
    let loc = location(dir.path());
    let input = write_dataset(&loc, "numbers", 0..40);
    let labels = Dataset::<Label>::new(&loc, "labels", ChunkCount::C16);
    labels.init(Mode::Write).unwrap();
    let mut w = labels.open_writer().unwrap();
    for (id, label) in [(0, "even"), (1, "odd")] {
        w.append(&Label {
            id,
            label: label.to_string(),
        })
        .unwrap();
    }
    w.finish().unwrap();
    let output = Dataset::new(&loc, "annotated", ChunkCount::C16);

    Pipeline::new(config())
        .simple(Annotate {
            input,
            labels,
            output: output.clone(),
        })
        .run()
        .unwrap();

    let rows = read_all(&output);
    assert_eq!(rows.len(), 40);
    assert!(rows.iter().all(|l| l.label == if l.id % 2 == 0 { "even" } else { "odd" }));

    // Both the streamed and the loaded input are recorded as lineage
    let def = DefFile::read_from(&output.desc().def_path()).unwrap();
    let deps: BTreeSet<_> = def
        .dependencies
        .iter()
        .map(|d| d.definition.name.as_str())
        .collect();
    assert_eq!(deps, BTreeSet::from(["labels", "numbers"]));
}

// =============================================================================
// Task
// =============================================================================

fn expected_tokens() -> BTreeSet<Token> {
    (0..100)
        .filter(|k| k % 10 != 7)
        .flat_map(|k| {
            (0..k % 3 + 1).map(move |pos| Token {
                doc: k,
                pos,
                text: format!("{k}-{pos}"),
            })
        })
        .collect()
}

#[test]
fn task_merges_worker_output() {
    let dir = tempfile::tempdir().unwrap();
    let loc = location(dir.path());
    let input = write_dataset(&loc, "numbers", 0..100);
    let output = Dataset::new(&loc, "tokens", ChunkCount::C256);

    let summary = Pipeline::new(config())
        .task(Tokenize {
            input,
            output: output.clone(),
            debug: false,
        })
        .run()
        .unwrap();

    assert!(output.is_complete());
    output.verify().unwrap();
    assert_eq!(read_all(&output), expected_tokens());
    assert!(!loc.temp().branch_dir().exists());

    let stage = &summary.stages[0];
    assert_eq!(stage.jobs, 16);
    assert_eq!(stage.records_read, 100);
    assert_eq!(stage.failed_records, 10);
    assert_eq!(stage.records_written, expected_tokens().len());
    assert_eq!(summary.failed_records(), 10);
}

#[test]
fn task_output_is_reproducible() {
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    for root in [a.path(), b.path()] {
        let loc = location(root);
        let input = write_dataset(&loc, "numbers", 0..100);
        Pipeline::new(config())
            .task(Tokenize {
                input,
                output: Dataset::new(&loc, "tokens", ChunkCount::C16),
                debug: false,
            })
            .run()
            .unwrap();
    }
    let chk = |root: &Path| {
        let ds = Dataset::<Token>::new(&location(root), "tokens", ChunkCount::C16);
        std::fs::read(ds.desc().chk_path()).unwrap()
    };
    // Shard digests (and the DefFile digest, which carries a timestamp)
    let a_chk: serde_json::Value = serde_json::from_slice(&chk(a.path())).unwrap();
    let b_chk: serde_json::Value = serde_json::from_slice(&chk(b.path())).unwrap();
    for (file, digest) in a_chk.as_object().unwrap() {
        if file.ends_with(".jsonl.gz") {
            assert_eq!(&b_chk[file], digest, "{file}");
        }
    }
}

#[test]
fn debug_mode_escalates_record_failures() {
    let dir = tempfile::tempdir().unwrap();
    let loc = location(dir.path());
    let input = write_dataset(&loc, "numbers", 0..100);
    let output = Dataset::<Token>::new(&loc, "tokens", ChunkCount::C16);

    let err = Pipeline::new(config())
        .task(Tokenize {
            input,
            output: output.clone(),
            debug: true,
        })
        .run()
        .unwrap_err();
    match err {
        Error::RecordFailed { identity, source, .. } => {
            assert!(identity.ends_with("7,)"), "{identity}");
            assert!(source.to_string().starts_with("unlucky record"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(!output.is_complete());
}

#[test]
fn stale_scratch_data_is_cleaned_before_planning() {
    let dir = tempfile::tempdir().unwrap();
    let loc = location(dir.path());
    let input = write_dataset(&loc, "numbers", 0..100);
    let output = Dataset::<Token>::new(&loc, "tokens", ChunkCount::C16);

    // Leftover from a crashed run: would double-count records if merged
    let stale = Dataset::<Token>::new(&loc.temp(), "tokens_099", ChunkCount::C16);
    stale.init(Mode::Write).unwrap();
    let mut w = stale.open_sparse_writer().unwrap();
    w.append(&Token {
        doc: 1000,
        pos: 0,
        text: "stale".into(),
    })
    .unwrap();
    w.close().unwrap();

    Pipeline::new(config())
        .task(Tokenize {
            input,
            output: output.clone(),
            debug: false,
        })
        .run()
        .unwrap();
    assert_eq!(read_all(&output), expected_tokens());
}

// =============================================================================
// Pipeline
// =============================================================================

#[test]
fn chained_stages_see_earlier_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let loc = location(dir.path());
    let numbers = Dataset::new(&loc, "numbers", ChunkCount::C16);
    let tokens = Dataset::new(&loc, "tokens", ChunkCount::C16);

    let summary = Pipeline::new(config())
        .source(Numbers {
            output: numbers.clone(),
            items: Some((0..100).collect()),
        })
        .task(Tokenize {
            input: numbers.clone(),
            output: tokens.clone(),
            debug: false,
        })
        .run()
        .unwrap();

    assert!(summary.succeeded());
    assert_eq!(summary.stages.len(), 2);
    assert_eq!(read_all(&tokens), expected_tokens());
    assert!(tokens.stale_dependencies().unwrap().is_empty());

    let def = DefFile::read_from(&tokens.desc().def_path()).unwrap();
    assert_eq!(def.dependencies.len(), 1);
    assert_eq!(def.dependencies[0].definition.name, "numbers");
}

#[test]
fn existing_output_fails_before_any_work() {
    let dir = tempfile::tempdir().unwrap();
    let loc = location(dir.path());
    let numbers = Dataset::new(&loc, "numbers", ChunkCount::C16);
    let existing = write_dataset(&loc, "tokens", 0..3);
    let tokens = Dataset::<Token>::new(&loc, "tokens", ChunkCount::C16);

    let err = Pipeline::new(config())
        .source(Numbers {
            output: numbers.clone(),
            items: Some((0..10).collect()),
        })
        .task(Tokenize {
            input: numbers.clone(),
            output: tokens,
            debug: false,
        })
        .run()
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Store(shardline_store::Error::AlreadyExists(_))
    ));
    // Pre-flight runs before the first stage
    assert!(!numbers.exists());
    existing.verify().unwrap();
}

#[test]
fn duplicate_outputs_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let loc = location(dir.path());
    let numbers = Dataset::new(&loc, "numbers", ChunkCount::C16);
    let err = Pipeline::new(config())
        .source(Numbers {
            output: numbers.clone(),
            items: Some(vec![1]),
        })
        .source(Numbers {
            output: numbers.clone(),
            items: Some(vec![2]),
        })
        .run()
        .unwrap_err();
    assert!(matches!(
        err,
        Error::DuplicateOutput {
            first: 0,
            second: 1,
            ..
        }
    ));
}

#[test]
fn missing_input_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let loc = location(dir.path());
    let err = Pipeline::new(config())
        .task(Tokenize {
            input: Dataset::new(&loc, "nowhere", ChunkCount::C16),
            output: Dataset::new(&loc, "tokens", ChunkCount::C16),
            debug: false,
        })
        .run()
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Store(shardline_store::Error::DoesNotExist(_))
    ));
}
