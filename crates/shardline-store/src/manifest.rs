//! Dataset manifests: the DefFile (identity + lineage) and the ChkFile
//! (per-shard checksums)

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chunk::ShardDigest;
use crate::dataset::DatasetDesc;
use crate::error::{Error, Result};
use crate::hash;
use crate::record::ChunkCount;

/// Version-control provenance embedded verbatim into every DefFile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoInfo {
    pub branch: String,
    pub commit_hash: String,
    pub commit_message: String,
    pub committer_name: String,
    pub committer_email: String,
}

/// One lineage edge: the dependency's own DefFile plus the digest of its
/// ChkFile at the time this dataset was created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    pub definition: DefFile,
    pub chk_digest: String,
}

/// Identity and lineage descriptor, written once when a dataset is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefFile {
    pub record_type: String,
    pub project: String,
    pub branch: String,
    pub name: String,
    pub chunk_count: ChunkCount,
    pub creation_time: DateTime<Utc>,
    pub dependencies: Vec<Dependency>,
    pub repo_info: RepoInfo,
}

impl DefFile {
    /// Build the DefFile for `desc`, snapshotting every dependency's
    /// DefFile and ChkFile digest.
    ///
    /// Dependencies must be durable (ChkFile present).
    pub fn make(desc: &DatasetDesc) -> Result<Self> {
        let mut dependencies = Vec::with_capacity(desc.dependencies.len());
        for dep in &desc.dependencies {
            let definition = dep.read_def()?;
            if !dep.is_complete() {
                return Err(Error::DoesNotExist(format!(
                    "{} (no checksum file, dependency not finished)",
                    dep.label()
                )));
            }
            let chk_digest = ChkFile::digest(dep)?;
            dependencies.push(Dependency {
                definition,
                chk_digest,
            });
        }

        Ok(Self {
            record_type: desc.record_type.clone(),
            project: desc.location.project.clone(),
            branch: desc.location.branch.clone(),
            name: desc.name.clone(),
            chunk_count: desc.chunk_count,
            creation_time: Utc::now(),
            dependencies,
            repo_info: desc.location.repo.clone(),
        })
    }

    /// Write to `path`, refusing to replace an existing file.
    pub fn write_new(&self, path: &Path) -> Result<()> {
        let json = to_sorted_pretty(self)?;
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(Error::AlreadyExists(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(json.as_bytes())?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// `project/branch/name` of the described dataset.
    pub fn label(&self) -> String {
        format!("{}/{}/{}", self.project, self.branch, self.name)
    }

    /// Visit the transitive lineage depth-first; `depth` starts at 1 for
    /// direct dependencies.
    pub fn walk_lineage(&self, mut visit: impl FnMut(usize, &Dependency)) {
        fn walk(def: &DefFile, depth: usize, visit: &mut dyn FnMut(usize, &Dependency)) {
            for dep in &def.dependencies {
                visit(depth, dep);
                walk(&dep.definition, depth + 1, visit);
            }
        }
        walk(self, 1, &mut visit);
    }
}

/// Shard file name → SHA1 hex, plus the DefFile's own digest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChkFile {
    pub files: BTreeMap<String, String>,
}

/// Verification result for a single manifest entry.
#[derive(Debug, Clone)]
pub struct VerifyResult {
    pub file: String,
    pub expected: String,
    pub actual: String,
    pub ok: bool,
}

impl ChkFile {
    /// Record the digests of a fully written dataset and write the ChkFile.
    pub fn make(desc: &DatasetDesc, digests: &[ShardDigest]) -> Result<Self> {
        let mut files: BTreeMap<String, String> = digests
            .iter()
            .map(|d| (d.file.clone(), d.digest.clone()))
            .collect();
        files.insert(desc.def_file_name(), hash::hash_file(&desc.def_path())?);

        let chk = Self { files };
        fs::write(desc.chk_path(), to_sorted_pretty(&chk)?)?;
        log::debug!("{}: wrote checksums for {} shards", desc.label(), digests.len());
        Ok(chk)
    }

    pub fn read(desc: &DatasetDesc) -> Result<Self> {
        let path = desc.chk_path();
        if !path.is_file() {
            return Err(Error::DoesNotExist(format!(
                "{} (no checksum file)",
                desc.label()
            )));
        }
        Ok(serde_json::from_str(&fs::read_to_string(&path)?)?)
    }

    /// SHA1 of the ChkFile's serialized bytes (what dependents record).
    pub fn digest(desc: &DatasetDesc) -> Result<String> {
        Ok(hash::hash_file(&desc.chk_path())?)
    }

    /// Recompute every digest and fail on the first mismatch.
    ///
    /// Reads every shard in full.
    pub fn verify(desc: &DatasetDesc) -> Result<()> {
        for r in Self::verify_report(desc)? {
            if !r.ok {
                return Err(Error::ChecksumMismatch {
                    dataset: desc.label(),
                    file: r.file,
                    expected: r.expected,
                    actual: r.actual,
                });
            }
        }
        Ok(())
    }

    /// Recompute every digest and report each entry.
    pub fn verify_report(desc: &DatasetDesc) -> Result<Vec<VerifyResult>> {
        let chk = Self::read(desc)?;
        let def_name = desc.def_file_name();
        let dir = desc.dir();

        let mut results = Vec::with_capacity(chk.files.len());
        for (file, expected) in &chk.files {
            let path = dir.join(file);
            let actual = if !path.is_file() {
                "MISSING".to_string()
            } else if *file == def_name {
                hash::hash_file(&path).unwrap_or_else(|e| format!("error: {e}"))
            } else {
                hash::hash_gzip_file(&path).unwrap_or_else(|e| format!("error: {e}"))
            };
            results.push(VerifyResult {
                file: file.clone(),
                ok: actual == *expected,
                expected: expected.clone(),
                actual,
            });
        }
        Ok(results)
    }
}

/// Pretty JSON with object keys in sorted order.
///
/// Round-trips through `serde_json::Value`, whose map is ordered by key.
fn to_sorted_pretty<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(&serde_json::to_value(value)?)?)
}
