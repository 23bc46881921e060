//! The LSM storage engine.
//!
//! Writes land in a memtable backed by a write-ahead log, spill to sorted
//! table files at level 0, and migrate down through disjoint levels as
//! background compaction merges them. The manifest records every change to
//! the file set, so the manifest plus the live table files fully determine
//! state on recovery.
//!
//! Version, VersionSet, Builder, and Compaction cooperate through
//! crate-private interfaces; the public surface is [`Db`], [`WriteBatch`],
//! [`Snapshot`], and the scan iterator.

pub mod batch;
pub(crate) mod block;
pub(crate) mod compaction;
pub mod db;
pub(crate) mod dbformat;
pub(crate) mod filter;
pub(crate) mod iterator;
pub(crate) mod memtable;
pub mod snapshot;
pub(crate) mod table;
pub(crate) mod table_cache;
pub(crate) mod version;
pub(crate) mod version_edit;
pub(crate) mod wal;

pub use batch::WriteBatch;
pub use db::{CompactionTask, Db, DbStats, FlushTask, ScanIter};
pub use snapshot::Snapshot;
