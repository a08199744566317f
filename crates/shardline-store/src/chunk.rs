//! Per-shard storage: one gzip-compressed JSON-lines file per shard

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::hash;
use crate::record::{ChunkCount, Record, ShardId};

/// Fixed so identical input always produces identical bytes.
const GZIP_LEVEL: u32 = 6;

/// Buffer size for file I/O around the gzip codec.
const IO_BUF_CAPACITY: usize = 64 * 1024;

/// How a shard is opened for writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Start a fresh file (written to `.tmp`, renamed on close).
    Truncate,
    /// Continue an existing file with a new gzip member. The checksum is
    /// seeded with the existing content so it covers the whole shard.
    Append,
}

/// Digest of one shard, produced when its writer is closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardDigest {
    pub shard: ShardId,
    /// Shard file name (the ChkFile key).
    pub file: String,
    /// SHA1 hex of the decompressed content.
    pub digest: String,
    /// Lines written since open.
    pub records: usize,
}

/// Location and typing of one shard file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkStore {
    shard: ShardId,
    path: PathBuf,
    record_type: String,
    chunk_count: ChunkCount,
}

impl ChunkStore {
    pub fn new(shard: ShardId, path: PathBuf, record_type: &str, chunk_count: ChunkCount) -> Self {
        Self {
            shard,
            path,
            record_type: record_type.to_string(),
            chunk_count,
        }
    }

    pub fn shard(&self) -> &ShardId {
        &self.shard
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_type(&self) -> &str {
        &self.record_type
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Open for lazy line-by-line reading.
    pub fn open_read(&self) -> Result<ChunkReader> {
        ChunkReader::open(&self.path)
    }

    /// Open for appending records.
    pub fn open_write(&self, mode: WriteMode) -> Result<ChunkWriter> {
        ChunkWriter::open(self, mode)
    }
}

/// Lazy reader over one shard, yielding each line parsed as JSON.
///
/// Not restartable: open the store again to re-read.
pub struct ChunkReader {
    path: PathBuf,
    lines: io::Lines<BufReader<MultiGzDecoder<BufReader<File>>>>,
}

impl std::fmt::Debug for ChunkReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkReader")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl ChunkReader {
    fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let decoder = MultiGzDecoder::new(BufReader::with_capacity(IO_BUF_CAPACITY, file));
        Ok(Self {
            path: path.to_path_buf(),
            lines: BufReader::new(decoder).lines(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Decode every line into `R`.
    pub fn records<R: Record>(self) -> Records<R> {
        Records {
            inner: self,
            _marker: PhantomData,
        }
    }
}

impl Iterator for ChunkReader {
    type Item = Result<serde_json::Value>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(e.into())),
            };
            if line.is_empty() {
                continue;
            }
            return Some(serde_json::from_str(&line).map_err(|source| Error::Decode {
                path: self.path.clone(),
                source,
            }));
        }
    }
}

/// Typed view over a [`ChunkReader`].
pub struct Records<R> {
    inner: ChunkReader,
    _marker: PhantomData<fn() -> R>,
}

impl<R: Record> Iterator for Records<R> {
    type Item = Result<R>;

    fn next(&mut self) -> Option<Self::Item> {
        let value = match self.inner.next()? {
            Ok(v) => v,
            Err(e) => return Some(Err(e)),
        };
        Some(R::from_data(value).map_err(|source| Error::Decode {
            path: self.inner.path.clone(),
            source,
        }))
    }
}

/// Append-only writer for one shard with a running SHA1 over the
/// uncompressed bytes.
///
/// `close` consumes the writer; a closed shard must be re-opened.
pub struct ChunkWriter {
    shard: ShardId,
    record_type: String,
    chunk_count: ChunkCount,
    encoder: GzEncoder<BufWriter<File>>,
    hasher: Sha1,
    tmp_path: Option<PathBuf>,
    final_path: PathBuf,
    records: usize,
}

impl std::fmt::Debug for ChunkWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkWriter")
            .field("shard", &self.shard)
            .field("final_path", &self.final_path)
            .field("records", &self.records)
            .finish_non_exhaustive()
    }
}

impl ChunkWriter {
    fn open(store: &ChunkStore, mode: WriteMode) -> Result<Self> {
        let final_path = store.path.clone();
        let mut hasher = Sha1::new();

        let (file, tmp_path) = match mode {
            WriteMode::Append if final_path.exists() => {
                hash::feed_gzip_file(&mut hasher, &final_path)?;
                let file = OpenOptions::new().append(true).open(&final_path)?;
                (file, None)
            }
            WriteMode::Append => (File::create(&final_path)?, None),
            WriteMode::Truncate => {
                let tmp_path = tmp_path_for(&final_path);
                // Clean up stale tmp file
                if tmp_path.exists() {
                    fs::remove_file(&tmp_path)?;
                }
                (File::create(&tmp_path)?, Some(tmp_path))
            }
        };

        let encoder = GzEncoder::new(
            BufWriter::with_capacity(IO_BUF_CAPACITY, file),
            Compression::new(GZIP_LEVEL),
        );

        Ok(Self {
            shard: store.shard.clone(),
            record_type: store.record_type.clone(),
            chunk_count: store.chunk_count,
            encoder,
            hasher,
            tmp_path,
            final_path,
            records: 0,
        })
    }

    pub fn shard(&self) -> &ShardId {
        &self.shard
    }

    /// Lines written since open.
    pub fn records(&self) -> usize {
        self.records
    }

    /// Serialize and append a record.
    ///
    /// Rejects records of another type and records whose identity routes
    /// to a different shard; either would silently corrupt the dataset.
    pub fn append<R: Record>(&mut self, record: &R) -> Result<()> {
        if R::TYPE_NAME != self.record_type {
            return Err(Error::TypeMismatch {
                expected: self.record_type.clone(),
                found: R::TYPE_NAME.to_string(),
            });
        }
        let identity = record.identity();
        let expected = self.chunk_count.shard_for(&identity);
        if expected != self.shard {
            return Err(Error::ShardRouting {
                identity: identity.to_string(),
                expected: expected.to_string(),
                shard: self.shard.to_string(),
            });
        }
        let line = serde_json::to_string(&record.to_data()?)?;
        self.write(&line)
    }

    /// Append one pre-serialized line (without trailing newline).
    pub fn write(&mut self, line: &str) -> Result<()> {
        if line.contains('\n') {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "raw line contains a newline",
            )));
        }
        self.write_bytes(line.as_bytes())?;
        self.write_bytes(b"\n")?;
        self.records += 1;
        Ok(())
    }

    /// Stream the decompressed content of another shard file into this one.
    ///
    /// Returns the number of records absorbed.
    pub fn absorb(&mut self, fragment: &Path) -> Result<usize> {
        let file = File::open(fragment)?;
        let mut decoder = MultiGzDecoder::new(BufReader::with_capacity(IO_BUF_CAPACITY, file));
        let mut buf = vec![0u8; IO_BUF_CAPACITY];
        let mut lines = 0usize;
        loop {
            let n = decoder.read(&mut buf)?;
            if n == 0 {
                break;
            }
            lines += buf[..n].iter().filter(|b| **b == b'\n').count();
            self.write_bytes(&buf[..n])?;
        }
        self.records += lines;
        Ok(lines)
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.encoder.write_all(bytes)?;
        self.hasher.update(bytes);
        Ok(())
    }

    /// Finish the gzip member, move the file into place and return the
    /// shard digest.
    pub fn close(self) -> Result<ShardDigest> {
        let writer = self.encoder.finish()?;
        writer.into_inner().map_err(|e| e.into_error())?;
        if let Some(tmp) = &self.tmp_path {
            fs::rename(tmp, &self.final_path)?;
        }
        let file = self
            .final_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(ShardDigest {
            shard: self.shard,
            file,
            digest: hash::finish(self.hasher),
            records: self.records,
        })
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}
