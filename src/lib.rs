//! ReefDB: a Redis-flavored storage core.
//!
//! The engine is a log-structured merge-tree: writes hit a write-ahead log
//! and an in-memory skiplist, spill to sorted table files, and compact in
//! the background. On top of it, type codecs encode Redis strings, hashes,
//! and sorted sets onto the ordered byte keyspace, preserving Redis
//! semantics for lookups, range scans, scores, and TTLs.
//!
//! ```no_run
//! use reefdb::{Options, RedisDb};
//!
//! # fn main() -> reefdb::Result<()> {
//! let db = RedisDb::open("./data", Options::default().create_if_missing(true))?;
//! db.set(b"greeting", b"hello")?;
//! db.zadd(b"board", &[(42.0, b"player-one".to_vec())])?;
//! assert_eq!(db.get(b"greeting")?, Some(b"hello".to_vec()));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod flock;
pub mod redis;
pub mod scheduler;
pub mod storage;
pub mod tmpfs;

pub use config::{Compression, Options, SchedulerConfig, WriteOptions};
pub use error::{Error, Result};
pub use redis::{Aggregate, RedisDb};
pub use scheduler::Scheduler;
pub use storage::{Db, DbStats, Snapshot, WriteBatch};
