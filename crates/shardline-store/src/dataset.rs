//! Datasets: named, typed collections of records split over a fixed number
//! of shards
//!
//! Directory layout:
//! ```text
//! {root}/{project}/{branch}/{name}/
//! ├── {name}.def                 # identity + lineage (written at creation)
//! ├── {name}.chk                 # per-shard SHA1 (written when complete)
//! ├── {name}_0.jsonl.gz
//! ├── ...
//! └── {name}_f.jsonl.gz
//! ```

use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::chunk::{ChunkStore, ChunkWriter, Records, ShardDigest, WriteMode};
use crate::error::{Error, Result};
use crate::manifest::{ChkFile, DefFile, RepoInfo};
use crate::record::{ChunkCount, Record, ShardId};

/// Suffix of the branch directory holding per-job scratch datasets.
pub const TEMP_BRANCH_SUFFIX: &str = "_temp";

/// How a dataset is initialised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
}

/// Where datasets of one project branch live, plus the provenance stamped
/// into their DefFiles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub root: PathBuf,
    pub project: String,
    pub branch: String,
    #[serde(default)]
    pub repo: RepoInfo,
}

impl Location {
    pub fn new(root: &Path, project: &str, branch: &str) -> Self {
        Self {
            root: root.to_path_buf(),
            project: project.to_string(),
            branch: branch.to_string(),
            repo: RepoInfo::default(),
        }
    }

    pub fn with_repo(mut self, repo: RepoInfo) -> Self {
        self.repo = repo;
        self
    }

    /// `{root}/{project}/{branch}`
    pub fn branch_dir(&self) -> PathBuf {
        self.root.join(&self.project).join(&self.branch)
    }

    /// Sibling location for scratch datasets (`{branch}_temp`).
    pub fn temp(&self) -> Self {
        Self {
            branch: format!("{}{TEMP_BRANCH_SUFFIX}", self.branch),
            ..self.clone()
        }
    }
}

/// Untyped dataset descriptor: everything needed to locate, check and
/// verify a dataset without knowing its record type statically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetDesc {
    pub location: Location,
    pub name: String,
    pub chunk_count: ChunkCount,
    pub record_type: String,
    /// Lineage edges recorded into the DefFile at creation.
    #[serde(default)]
    pub dependencies: Vec<DatasetDesc>,
}

impl DatasetDesc {
    pub fn new(location: Location, name: &str, chunk_count: ChunkCount, record_type: &str) -> Self {
        Self {
            location,
            name: name.to_string(),
            chunk_count,
            record_type: record_type.to_string(),
            dependencies: Vec::new(),
        }
    }

    /// Descriptor of an existing dataset, taken from its DefFile.
    ///
    /// Lineage stays in the DefFile; `dependencies` is left empty.
    pub fn load(location: &Location, name: &str) -> Result<Self> {
        let probe = Self::new(location.clone(), name, ChunkCount::C16, "");
        let def = probe.read_def()?;
        Ok(Self::new(
            location.clone(),
            name,
            def.chunk_count,
            &def.record_type,
        ))
    }

    /// `project/branch/name`
    pub fn label(&self) -> String {
        format!(
            "{}/{}/{}",
            self.location.project, self.location.branch, self.name
        )
    }

    /// Record a lineage edge; adding the same dataset twice is a no-op.
    pub fn add_dependency(&mut self, other: &DatasetDesc) {
        if !self.dependencies.iter().any(|d| d.same_dataset(other)) {
            let mut edge = other.clone();
            // The dependency's own DefFile carries its lineage
            edge.dependencies.clear();
            self.dependencies.push(edge);
        }
    }

    /// True if both descriptors name the same on-disk dataset.
    pub fn same_dataset(&self, other: &DatasetDesc) -> bool {
        self.dir() == other.dir()
    }

    pub fn dir(&self) -> PathBuf {
        self.location.branch_dir().join(&self.name)
    }

    pub fn def_file_name(&self) -> String {
        format!("{}.def", self.name)
    }

    pub fn def_path(&self) -> PathBuf {
        self.dir().join(self.def_file_name())
    }

    pub fn chk_path(&self) -> PathBuf {
        self.dir().join(format!("{}.chk", self.name))
    }

    pub fn shard_file_name(&self, shard: &ShardId) -> String {
        format!("{}_{shard}.jsonl.gz", self.name)
    }

    pub fn chunk(&self, shard: &ShardId) -> ChunkStore {
        ChunkStore::new(
            shard.clone(),
            self.dir().join(self.shard_file_name(shard)),
            &self.record_type,
            self.chunk_count,
        )
    }

    /// Every shard, in shard-id order.
    pub fn chunks(&self) -> Vec<ChunkStore> {
        self.chunk_count
            .shard_ids()
            .map(|shard| self.chunk(&shard))
            .collect()
    }

    /// DefFile present.
    pub fn exists(&self) -> bool {
        self.def_path().is_file()
    }

    /// ChkFile present: every shard was fully written.
    pub fn is_complete(&self) -> bool {
        self.chk_path().is_file()
    }

    pub fn read_def(&self) -> Result<DefFile> {
        if !self.exists() {
            return Err(Error::DoesNotExist(self.label()));
        }
        DefFile::read_from(&self.def_path())
    }

    /// Create (`Write`) or check (`Read`) the dataset on disk.
    ///
    /// Write fails with `AlreadyExists` if a DefFile is present and
    /// otherwise creates the directory and DefFile. Read fails with
    /// `DoesNotExist` if absent and `DefMismatch` if the structural fields
    /// on disk differ from this descriptor.
    pub fn init(&self, mode: Mode) -> Result<()> {
        match mode {
            Mode::Write => {
                if self.exists() {
                    return Err(Error::AlreadyExists(self.label()));
                }
                fs::create_dir_all(self.dir())?;
                DefFile::make(self)?.write_new(&self.def_path())?;
                log::debug!("{}: created", self.label());
                Ok(())
            }
            Mode::Read => {
                let def = self.read_def()?;
                self.check_def(&def)
            }
        }
    }

    fn check_def(&self, def: &DefFile) -> Result<()> {
        let checks: [(&'static str, String, String); 5] = [
            ("record_type", self.record_type.clone(), def.record_type.clone()),
            (
                "chunk_count",
                self.chunk_count.to_string(),
                def.chunk_count.to_string(),
            ),
            ("name", self.name.clone(), def.name.clone()),
            ("project", self.location.project.clone(), def.project.clone()),
            ("branch", self.location.branch.clone(), def.branch.clone()),
        ];
        for (field, expected, found) in checks {
            if expected != found {
                return Err(Error::DefMismatch {
                    dataset: self.label(),
                    field,
                    expected,
                    found,
                });
            }
        }
        Ok(())
    }

    /// Recompute every shard digest against the ChkFile.
    pub fn verify(&self) -> Result<()> {
        ChkFile::verify(self)
    }

    /// Remove shard files and both manifests, then the directory.
    ///
    /// Fails with `DefMismatch` before touching anything if the DefFile on
    /// disk describes a different dataset (for example another chunk
    /// count). Otherwise best effort: files that vanish concurrently are
    /// ignored and a directory holding foreign files is left in place.
    pub fn delete(&self) -> Result<()> {
        let dir = self.dir();
        if !dir.is_dir() {
            return Err(Error::DoesNotExist(self.label()));
        }
        if self.exists() {
            self.check_def(&DefFile::read_from(&self.def_path())?)?;
        }
        for chunk in self.chunks() {
            remove_if_present(chunk.path())?;
            let mut tmp = chunk.path().as_os_str().to_owned();
            tmp.push(".tmp");
            remove_if_present(Path::new(&tmp))?;
        }
        remove_if_present(&self.chk_path())?;
        remove_if_present(&self.def_path())?;
        if let Err(e) = fs::remove_dir(&dir) {
            log::warn!("{}: directory not removed: {e}", self.label());
        }
        log::debug!("{}: deleted", self.label());
        Ok(())
    }

    /// Dependencies whose ChkFile changed (or vanished) since this dataset
    /// recorded them. Dependencies are looked up under this dataset's root.
    pub fn stale_dependencies(&self) -> Result<Vec<String>> {
        let def = self.read_def()?;
        let mut stale = Vec::new();
        for dep in &def.dependencies {
            let d = &dep.definition;
            let location = Location::new(&self.location.root, &d.project, &d.branch);
            let desc = DatasetDesc::new(location, &d.name, d.chunk_count, &d.record_type);
            let current = if desc.is_complete() {
                Some(ChkFile::digest(&desc)?)
            } else {
                None
            };
            if current.as_deref() != Some(dep.chk_digest.as_str()) {
                stale.push(d.label());
            }
        }
        Ok(stale)
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// All datasets (directories holding a `{name}.def`) under a location,
/// sorted by name.
pub fn list_datasets(location: &Location) -> Result<Vec<DatasetDesc>> {
    let branch_dir = location.branch_dir();
    if !branch_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in fs::read_dir(&branch_dir)? {
        let entry = entry?;
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        match DatasetDesc::load(location, &name) {
            Ok(desc) => found.push(desc),
            Err(Error::DoesNotExist(_)) => {}
            Err(e) => log::warn!("skipping {name}: {e}"),
        }
    }
    found.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(found)
}

/// Typed handle on a dataset of `R` records.
pub struct Dataset<R> {
    desc: DatasetDesc,
    _marker: PhantomData<fn() -> R>,
}

impl<R> Clone for Dataset<R> {
    fn clone(&self) -> Self {
        Self {
            desc: self.desc.clone(),
            _marker: PhantomData,
        }
    }
}

impl<R> std::fmt::Debug for Dataset<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("desc", &self.desc)
            .finish_non_exhaustive()
    }
}

impl<R: Record> Dataset<R> {
    pub fn new(location: &Location, name: &str, chunk_count: ChunkCount) -> Self {
        Self {
            desc: DatasetDesc::new(location.clone(), name, chunk_count, R::TYPE_NAME),
            _marker: PhantomData,
        }
    }

    /// Typed view of an untyped descriptor.
    pub fn from_desc(desc: DatasetDesc) -> Result<Self> {
        if desc.record_type != R::TYPE_NAME {
            return Err(Error::TypeMismatch {
                expected: desc.record_type,
                found: R::TYPE_NAME.to_string(),
            });
        }
        Ok(Self {
            desc,
            _marker: PhantomData,
        })
    }

    pub fn desc(&self) -> &DatasetDesc {
        &self.desc
    }

    pub fn name(&self) -> &str {
        &self.desc.name
    }

    pub fn chunk_count(&self) -> ChunkCount {
        self.desc.chunk_count
    }

    /// Record a lineage edge (builder form).
    pub fn depends_on(mut self, other: &DatasetDesc) -> Self {
        self.add_dependency(other);
        self
    }

    /// Record a lineage edge, consumed when the DefFile is written.
    pub fn add_dependency(&mut self, other: &DatasetDesc) {
        self.desc.add_dependency(other);
    }

    pub fn shard_for(&self, record: &R) -> ShardId {
        self.desc.chunk_count.shard_for(&record.identity())
    }

    pub fn init(&self, mode: Mode) -> Result<()> {
        self.desc.init(mode)
    }

    pub fn exists(&self) -> bool {
        self.desc.exists()
    }

    pub fn is_complete(&self) -> bool {
        self.desc.is_complete()
    }

    pub fn verify(&self) -> Result<()> {
        self.desc.verify()
    }

    pub fn delete(&self) -> Result<()> {
        self.desc.delete()
    }

    pub fn stale_dependencies(&self) -> Result<Vec<String>> {
        self.desc.stale_dependencies()
    }

    /// Read every record, shard by shard in shard-id order.
    pub fn open_reader(&self) -> Result<DatasetReader<R>> {
        if !self.exists() {
            return Err(Error::DoesNotExist(self.desc.label()));
        }
        Ok(DatasetReader {
            pending: self.desc.chunks().into_iter(),
            current: None,
        })
    }

    /// Writer over every shard; `close` leaves all shard files on disk.
    pub fn open_writer(&self) -> Result<DatasetWriter<R>> {
        DatasetWriter::new(self.desc.clone(), false)
    }

    /// Writer that only creates shard files it actually receives records
    /// for. Used for per-job scratch datasets.
    pub fn open_sparse_writer(&self) -> Result<DatasetWriter<R>> {
        DatasetWriter::new(self.desc.clone(), true)
    }
}

/// Lazily opens each shard in turn; dropping it closes the open shard.
pub struct DatasetReader<R> {
    pending: std::vec::IntoIter<ChunkStore>,
    current: Option<Records<R>>,
}

impl<R: Record> Iterator for DatasetReader<R> {
    type Item = Result<R>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(records) = self.current.as_mut() {
                if let Some(item) = records.next() {
                    return Some(item);
                }
                self.current = None;
            }
            let chunk = self.pending.next()?;
            match chunk.open_read() {
                Ok(reader) => self.current = Some(reader.records()),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Routes appended records to their shard writers.
///
/// Shard files are opened on first use; `close` materializes any shard
/// that received nothing (unless sparse) so a dataset always has exactly
/// `chunk_count` shard files.
pub struct DatasetWriter<R> {
    desc: DatasetDesc,
    writers: Vec<Option<ChunkWriter>>,
    sparse: bool,
    _marker: PhantomData<fn(R)>,
}

impl<R> std::fmt::Debug for DatasetWriter<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasetWriter")
            .field("dataset", &self.desc.label())
            .field("open_shards", &self.writers.iter().flatten().count())
            .finish_non_exhaustive()
    }
}

impl<R: Record> DatasetWriter<R> {
    fn new(desc: DatasetDesc, sparse: bool) -> Result<Self> {
        if !desc.exists() {
            return Err(Error::DoesNotExist(desc.label()));
        }
        let n = desc.chunk_count.count() as usize;
        Ok(Self {
            desc,
            writers: (0..n).map(|_| None).collect(),
            sparse,
            _marker: PhantomData,
        })
    }

    pub fn desc(&self) -> &DatasetDesc {
        &self.desc
    }

    pub fn append(&mut self, record: &R) -> Result<()> {
        let shard = self.desc.chunk_count.shard_for(&record.identity());
        self.writer_for(&shard)?.append(record)
    }

    fn writer_for(&mut self, shard: &ShardId) -> Result<&mut ChunkWriter> {
        let idx = self
            .desc
            .chunk_count
            .index_of(shard)
            .ok_or_else(|| Error::InvalidChunkCount(self.desc.chunk_count.count()))?;
        let slot = &mut self.writers[idx];
        let writer = match slot.take() {
            Some(w) => w,
            None => self.desc.chunk(shard).open_write(WriteMode::Truncate)?,
        };
        Ok(slot.insert(writer))
    }

    /// Close every shard and return their digests in shard-id order.
    pub fn close(self) -> Result<Vec<ShardDigest>> {
        let mut digests = Vec::with_capacity(self.writers.len());
        for (shard, writer) in self.desc.chunk_count.shard_ids().zip(self.writers) {
            match writer {
                Some(w) => digests.push(w.close()?),
                None if !self.sparse => {
                    let w = self.desc.chunk(&shard).open_write(WriteMode::Truncate)?;
                    digests.push(w.close()?);
                }
                None => {}
            }
        }
        Ok(digests)
    }

    /// Close every shard and write the ChkFile, making the dataset durable.
    pub fn finish(self) -> Result<ChkFile> {
        let desc = self.desc.clone();
        let digests = self.close()?;
        ChkFile::make(&desc, &digests)
    }
}
