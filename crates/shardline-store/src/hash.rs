//! SHA1 hashing utilities for shard routing and manifests

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use flate2::read::MultiGzDecoder;
use sha1::{Digest, Sha1};

/// Read buffer for streaming digests.
const HASH_BUF_CAPACITY: usize = 64 * 1024;

/// Hash raw bytes, returning lowercase hex.
pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

/// Hash a file's raw bytes (used for the DefFile and ChkFile themselves).
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut hasher = Sha1::new();
    let mut reader = BufReader::with_capacity(HASH_BUF_CAPACITY, File::open(path)?);
    io::copy(&mut reader, &mut HashWriter(&mut hasher))?;
    Ok(hex::encode(hasher.finalize()))
}

/// Hash the decompressed content of a (possibly multi-member) gzip file.
///
/// This is the digest a shard's ChkFile entry records.
pub fn hash_gzip_file(path: &Path) -> io::Result<String> {
    let mut hasher = Sha1::new();
    feed_gzip_file(&mut hasher, path)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Stream the decompressed content of a gzip file into `hasher`.
///
/// Returns the number of decompressed bytes fed.
pub fn feed_gzip_file(hasher: &mut Sha1, path: &Path) -> io::Result<u64> {
    let file = File::open(path)?;
    let mut decoder = MultiGzDecoder::new(BufReader::with_capacity(HASH_BUF_CAPACITY, file));
    let mut buf = vec![0u8; HASH_BUF_CAPACITY];
    let mut total = 0u64;
    loop {
        let n = decoder.read(&mut buf)?;
        if n == 0 {
            return Ok(total);
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
}

/// Finalize a running hasher into lowercase hex.
pub fn finish(hasher: Sha1) -> String {
    hex::encode(hasher.finalize())
}

/// Return the first 8 characters of a digest (or commit id).
pub fn short_hash(digest: &str) -> &str {
    match digest.char_indices().nth(8) {
        Some((idx, _)) => &digest[..idx],
        None => digest,
    }
}

/// Adapter so `io::copy` can drive a hasher.
struct HashWriter<'a>(&'a mut Sha1);

impl Write for HashWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
