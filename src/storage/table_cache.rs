//! Cache of open table files.
//!
//! Opening a table parses its footer and index and loads its filter, so the
//! handles are worth keeping around. The cache is sharded 16 ways by file
//! number to keep lock hold times short; each shard runs an LRU bounded by
//! its slice of `max_open_files`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use super::dbformat::table_file_name;
use super::table::{Table, TableCursor};
use crate::config::Options;
use crate::error::Result;

const SHARDS: usize = 16;

pub struct TableCache {
    dir: PathBuf,
    shards: Vec<Mutex<Shard>>,
}

struct Shard {
    capacity: usize,
    entries: HashMap<u64, CacheEntry>,
    ticks: u64,
}

struct CacheEntry {
    table: Arc<Table>,
    last_used: u64,
}

impl TableCache {
    pub fn new(dir: PathBuf, options: &Options) -> Self {
        let capacity = (options.max_open_files / SHARDS).max(1);
        let shards = (0..SHARDS)
            .map(|_| {
                Mutex::new(Shard {
                    capacity,
                    entries: HashMap::new(),
                    ticks: 0,
                })
            })
            .collect();
        Self { dir, shards }
    }

    fn shard(&self, file_number: u64) -> &Mutex<Shard> {
        // File numbers are dense, so the low bits spread evenly.
        &self.shards[(file_number as usize) % SHARDS]
    }

    /// Returns the open table for a file, opening and caching it on miss.
    pub fn get_table(&self, file_number: u64) -> Result<Arc<Table>> {
        let mut shard = self.shard(file_number).lock()?;
        shard.ticks += 1;
        let tick = shard.ticks;

        if let Some(entry) = shard.entries.get_mut(&file_number) {
            entry.last_used = tick;
            return Ok(Arc::clone(&entry.table));
        }

        let table = Arc::new(Table::open(&table_file_name(&self.dir, file_number))?);

        if shard.entries.len() >= shard.capacity {
            // Evict the least recently used entry; open readers keep their
            // Arc alive until they finish.
            if let Some(&victim) = shard
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(number, _)| number)
            {
                shard.entries.remove(&victim);
            }
        }

        shard.entries.insert(
            file_number,
            CacheEntry {
                table: Arc::clone(&table),
                last_used: tick,
            },
        );
        Ok(table)
    }

    /// Point lookup: finds the first entry >= target in the given file.
    pub fn get(&self, file_number: u64, target: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.get_table(file_number)?.get(target)
    }

    /// Cursor over the given file's entries.
    pub fn cursor(&self, file_number: u64) -> Result<TableCursor> {
        Ok(self.get_table(file_number)?.cursor())
    }

    /// Drops the cached handle when a file is deleted.
    pub fn evict(&self, file_number: u64) {
        if let Ok(mut shard) = self.shard(file_number).lock() {
            shard.entries.remove(&file_number);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::dbformat::{InternalKey, ValueKind};
    use crate::storage::table::TableBuilder;
    use crate::tmpfs::TempDir;

    fn ikey(user_key: &[u8], sequence: u64) -> Vec<u8> {
        InternalKey::new(user_key.to_vec(), sequence, ValueKind::Put).encode()
    }

    fn write_table(dir: &std::path::Path, number: u64, keys: &[&[u8]]) {
        let options = Options::default();
        let mut builder =
            TableBuilder::create(&table_file_name(dir, number), &options).expect("create");
        for key in keys {
            builder.add(&ikey(key, 1), b"value").expect("add");
        }
        builder.finish().expect("finish");
    }

    #[test]
    fn test_open_and_lookup_through_cache() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        write_table(dir.path(), 1, &[b"a", b"b", b"c"]);

        let cache = TableCache::new(dir.path().to_path_buf(), &Options::default());

        let found = cache.get(1, &ikey(b"b", 10)).unwrap();
        let (key, value) = found.expect("Key not found");
        assert_eq!(InternalKey::decode(&key).unwrap().user_key(), b"b");
        assert_eq!(value, b"value");

        // Second lookup hits the cached handle.
        assert!(cache.get(1, &ikey(b"c", 10)).unwrap().is_some());
    }

    #[test]
    fn test_missing_file_errors() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let cache = TableCache::new(dir.path().to_path_buf(), &Options::default());
        assert!(cache.get(42, &ikey(b"a", 1)).is_err());
    }

    #[test]
    fn test_eviction_bounded_by_capacity() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        // Capacity of 1 per shard: files 0 and 16 share shard 0.
        let options = Options::default().max_open_files(16);
        for number in [0u64, 16, 32] {
            write_table(dir.path(), number, &[b"k"]);
        }

        let cache = TableCache::new(dir.path().to_path_buf(), &options);
        for number in [0u64, 16, 32] {
            assert!(cache.get(number, &ikey(b"k", 1)).unwrap().is_some());
        }

        let shard = cache.shards[0].lock().unwrap();
        assert_eq!(shard.entries.len(), 1, "shard must hold only the newest");
        assert!(shard.entries.contains_key(&32));
    }

    #[test]
    fn test_evict_removes_entry() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        write_table(dir.path(), 1, &[b"a"]);

        let cache = TableCache::new(dir.path().to_path_buf(), &Options::default());
        assert!(cache.get(1, &ikey(b"a", 1)).unwrap().is_some());

        cache.evict(1);
        let shard = cache.shards[1 % SHARDS].lock().unwrap();
        assert!(shard.entries.is_empty());
    }
}
