//! shardline-store: sharded, checksummed record datasets
//!
//! A dataset is a directory of `chunk_count` gzip JSON-lines shards plus
//! two manifests: a DefFile (identity and lineage, written at creation)
//! and a ChkFile (per-shard SHA1, written once every shard is complete).
//! Records are routed to shards by the SHA1 of their identity.

pub mod chunk;
pub mod dataset;
pub mod error;
pub mod hash;
pub mod manifest;
pub mod record;

pub use chunk::{ChunkReader, ChunkStore, ChunkWriter, Records, ShardDigest, WriteMode};
pub use dataset::{
    Dataset, DatasetDesc, DatasetReader, DatasetWriter, Location, Mode, TEMP_BRANCH_SUFFIX,
    list_datasets,
};
pub use error::{Error, Result};
pub use hash::{hash_bytes, hash_file, hash_gzip_file, short_hash};
pub use manifest::{ChkFile, DefFile, Dependency, RepoInfo, VerifyResult};
pub use record::{ChunkCount, Identity, Record, Scalar, ShardId};
