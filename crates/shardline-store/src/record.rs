//! Record capability, identities and shard routing

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hash;

/// One scalar field of an identity tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Str(s) => write_quoted(f, s),
        }
    }
}

/// Quote a string the way a tuple repr does: single quotes unless the
/// string contains a single quote and no double quote.
fn write_quoted(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    let quote = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };
    write!(f, "{quote}")?;
    for c in s.chars() {
        match c {
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\r' => f.write_str("\\r")?,
            '\t' => f.write_str("\\t")?,
            c if c == quote => write!(f, "\\{c}")?,
            c => write!(f, "{c}")?,
        }
    }
    write!(f, "{quote}")
}

macro_rules! scalar_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for Scalar {
            fn from(v: $t) -> Self {
                Self::Int(i64::from(v))
            }
        })*
    };
}

scalar_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

/// Ordered tuple of scalar fields naming a record within its dataset.
///
/// Its string form (`(1,)`, `(1, 'a')`) is what gets hashed for shard
/// routing, so it must never change between releases.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity(pub Vec<Scalar>);

impl Identity {
    pub fn new(fields: Vec<Scalar>) -> Self {
        Self(fields)
    }

    pub fn fields(&self) -> &[Scalar] {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, field) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{field}")?;
        }
        if self.0.len() == 1 {
            f.write_str(",")?;
        }
        f.write_str(")")
    }
}

macro_rules! identity_from_tuple {
    ($($name:ident),+) => {
        impl<$($name: Into<Scalar>),+> From<($($name,)+)> for Identity {
            #[allow(non_snake_case)]
            fn from(($($name,)+): ($($name,)+)) -> Self {
                Self(vec![$($name.into()),+])
            }
        }
    };
}

identity_from_tuple!(A);
identity_from_tuple!(A, B);
identity_from_tuple!(A, B, C);
identity_from_tuple!(A, B, C, D);

/// Capability every stored value provides: a stable identity and a JSON
/// serialization pair.
///
/// `to_data`/`from_data` default to serde; override them when the stored
/// form differs from the in-memory one. `from_data(to_data(x))` must
/// equal `x`.
pub trait Record: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable type name persisted in the DefFile.
    const TYPE_NAME: &'static str;

    fn identity(&self) -> Identity;

    fn to_data(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }

    fn from_data(data: serde_json::Value) -> serde_json::Result<Self> {
        serde_json::from_value(data)
    }
}

/// Shard fan-out of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum ChunkCount {
    C16,
    C256,
    C4096,
}

impl ChunkCount {
    /// Number of hex digits of the identity hash used as shard id.
    pub fn prefix_len(self) -> usize {
        match self {
            Self::C16 => 1,
            Self::C256 => 2,
            Self::C4096 => 3,
        }
    }

    pub fn count(self) -> u32 {
        match self {
            Self::C16 => 16,
            Self::C256 => 256,
            Self::C4096 => 4096,
        }
    }

    /// Route an identity to its shard.
    pub fn shard_for(self, identity: &Identity) -> ShardId {
        let digest = hash::hash_bytes(identity.to_string().as_bytes());
        ShardId(digest[..self.prefix_len()].to_string())
    }

    /// All shard ids in ascending order.
    pub fn shard_ids(self) -> impl Iterator<Item = ShardId> {
        let width = self.prefix_len();
        (0..self.count()).map(move |i| ShardId(format!("{i:0width$x}")))
    }

    /// Position of a shard id in [`shard_ids`](Self::shard_ids) order.
    pub fn index_of(self, shard: &ShardId) -> Option<usize> {
        if shard.0.len() != self.prefix_len() {
            return None;
        }
        usize::from_str_radix(&shard.0, 16).ok()
    }
}

impl TryFrom<u32> for ChunkCount {
    type Error = Error;

    fn try_from(n: u32) -> Result<Self> {
        match n {
            16 => Ok(Self::C16),
            256 => Ok(Self::C256),
            4096 => Ok(Self::C4096),
            other => Err(Error::InvalidChunkCount(other)),
        }
    }
}

impl From<ChunkCount> for u32 {
    fn from(c: ChunkCount) -> u32 {
        c.count()
    }
}

impl fmt::Display for ChunkCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.count())
    }
}

/// Zero-padded lowercase hex shard id (`"a"`, `"0f"`, `"3e1"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(String);

impl ShardId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
