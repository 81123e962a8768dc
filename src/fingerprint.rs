//! The fingerprint index: fingerprint → (path, offset) (spec.md §3, §4.4).
//!
//! Two interchangeable backends are implemented behind the
//! `FingerprintIndex` trait, matching spec.md's "direct-addressed
//! in-process table" and "external key-value store" alternatives.
//! Neither backend's `get` result is ever trusted without the pipeline's
//! mandatory verification read (spec.md §4.4, §9 "Fingerprint
//! collisions").

use crc::{Crc, CRC_32_ISCSI};
use dashmap::DashMap;

use crate::config::RedisAddr;

/// CRC-32/ISCSI is the Castagnoli polynomial, i.e. CRC32-C (spec.md §3).
const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Computes the fingerprint of a full block.
pub fn fingerprint_block(block: &[u8]) -> u32 {
    CRC32C.checksum(block)
}

/// A claim that a block with some fingerprint was previously observed at
/// `(path, offset)`. May be stale; see spec.md §3.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub path: String,
    pub offset: u64,
}

/// Backend-agnostic fingerprint → location mapping. `set` is last-write-
/// wins on a colliding key (spec.md §4.4); no ordering is promised across
/// concurrent callers (spec.md §5).
pub trait FingerprintIndex: Send + Sync {
    fn get(&self, fp: u32) -> Option<IndexEntry>;
    fn set(&self, fp: u32, entry: IndexEntry);
}

/// The direct-addressed backend, realized as a dense concurrent hash map
/// rather than a pre-allocated `2^32`-slot array (spec.md §9 sanctions
/// this substitution explicitly; DESIGN.md Open Question table).
#[derive(Default)]
pub struct InProcessIndex {
    table: DashMap<u32, IndexEntry>,
}

impl InProcessIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FingerprintIndex for InProcessIndex {
    fn get(&self, fp: u32) -> Option<IndexEntry> {
        self.table.get(&fp).map(|entry| entry.clone())
    }

    fn set(&self, fp: u32, entry: IndexEntry) {
        self.table.insert(fp, entry);
    }
}

/// The external key-value backend. Fingerprints are encoded as their
/// decimal string; values are `path\noffset` so the path itself may
/// contain any byte except a newline (paths containing newlines are
/// vanishingly rare on POSIX filesystems and, per spec.md's stale-entry
/// tolerance, a malformed value simply degrades to a lookup miss).
#[cfg(feature = "redis-index")]
pub struct RedisIndex {
    client: redis::Client,
}

#[cfg(feature = "redis-index")]
impl RedisIndex {
    /// Connects at shim load. An unreachable store is fatal (spec.md §5,
    /// "SHOULD apply a short connect timeout at shim load time and fail
    /// fatally if unreachable").
    pub fn connect(addr: &RedisAddr) -> Result<Self, crate::error::FatalError> {
        use std::time::Duration;

        let url = match addr {
            RedisAddr::Tcp { host, port } => format!("redis://{host}:{port}"),
            RedisAddr::Unix { path } => format!("redis+unix://{path}"),
        };

        let client =
            redis::Client::open(url.as_str()).map_err(crate::error::FatalError::IndexUnreachable)?;
        let mut conn = client
            .get_connection_with_timeout(Duration::from_secs(1))
            .map_err(crate::error::FatalError::IndexUnreachable)?;
        redis::cmd("PING")
            .query::<String>(&mut conn)
            .map_err(crate::error::FatalError::IndexUnreachable)?;

        Ok(Self { client })
    }

    fn connection(&self) -> Option<redis::Connection> {
        self.client.get_connection().ok()
    }
}

#[cfg(feature = "redis-index")]
impl FingerprintIndex for RedisIndex {
    fn get(&self, fp: u32) -> Option<IndexEntry> {
        use redis::Commands;

        let mut conn = self.connection()?;
        let value: String = conn.get(fp.to_string()).ok()?;
        let (path, offset) = value.split_once('\n')?;
        let offset = offset.parse::<u64>().ok()?;
        Some(IndexEntry {
            path: path.to_string(),
            offset,
        })
    }

    fn set(&self, fp: u32, entry: IndexEntry) {
        use redis::Commands;

        let Some(mut conn) = self.connection() else {
            tracing::warn!(
                target: "writededuper",
                message = "redis index set failed: no connection",
                fingerprint = fp,
            );
            return;
        };
        let value = format!("{}\n{}", entry.path, entry.offset);
        if let Err(error) = conn.set::<_, _, ()>(fp.to_string(), value) {
            tracing::warn!(
                target: "writededuper",
                message = "redis index set failed",
                fingerprint = fp,
                %error,
            );
        }
    }
}
