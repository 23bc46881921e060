//! Database orchestration: the write path, reads, flushes, compactions,
//! and open/recovery.
//!
//! # Write Path
//!
//! Writers never touch the WAL directly. Each `write()` sends its batch
//! plus an acknowledgement channel to a dedicated writer task that owns
//! the WAL and the active-memtable handle. The writer drains everything
//! queued behind the leader before flushing, so one fsync covers the whole
//! group; acks carry the per-batch result. This keeps the single-writer
//! discipline without condition-variable choreography on the commit path.
//!
//! # Read Path
//!
//! A read pins `(sequence, version)` at entry: memtable, then immutable
//! memtable, then the current version's levels. It sees exactly the writes
//! with sequence <= the pinned sequence.
//!
//! # Background Work
//!
//! At most one flush and one compaction run at a time. Either reports
//! failures into a sticky background error; subsequent writes fail fast
//! with it until the database is reopened.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{mpsc, Arc, Condvar, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use super::batch::WriteBatch;
use super::compaction;
use super::dbformat::{
    current_file_name, lock_file_name, log_file_name, parse_file_name, table_file_name, FileType,
    LookupKey, NUM_LEVELS,
};
use super::iterator::{Cursor, MergeCursor, UserIterator};
use super::memtable::{MemCursor, MemLookup, MemTable};
use super::snapshot::{Snapshot, SnapshotList};
use super::table::TableBuilder;
use super::table_cache::TableCache;
use super::version::{LevelCursor, Version, VersionLookup, VersionSet};
use super::version_edit::VersionEdit;
use super::wal::{LogReader, LogWriter};
use crate::config::{Options, WriteOptions};
use crate::errinput;
use crate::error::Result;
use crate::flock::FileLock;
use crate::scheduler::{BackgroundTask, Context};
use crate::Error;

/// Group commit stops growing past this many bytes per WAL flush.
const MAX_GROUP_BYTES: usize = 1 << 20;

enum WriteRequest {
    Batch {
        batch: WriteBatch,
        sync: bool,
        ack: mpsc::SyncSender<Result<u64>>,
    },
    /// Freeze the active memtable so a flush can pick it up.
    Rotate { ack: mpsc::SyncSender<Result<u64>> },
}

/// State shared between the facade, the writer task, and background work.
pub(crate) struct Shared {
    pub(crate) dir: PathBuf,
    pub(crate) options: Options,

    pub(crate) mem: RwLock<Arc<MemTable>>,
    pub(crate) imm: Mutex<Option<Arc<MemTable>>>,
    imm_cv: Condvar,

    pub(crate) current: RwLock<Arc<Version>>,
    pub(crate) versions: Mutex<VersionSet>,
    pub(crate) cache: Arc<TableCache>,
    pub(crate) snapshots: Arc<SnapshotList>,

    pub(crate) last_sequence: AtomicU64,
    /// Number of the WAL the writer task is currently appending to.
    log_number: AtomicU64,

    bg_error: Mutex<Option<Error>>,
    pending_outputs: Mutex<HashSet<u64>>,
    flush_running: AtomicBool,
    compaction_running: AtomicBool,
    shutdown: AtomicBool,
}

pub struct Db {
    shared: Arc<Shared>,
    writer_tx: Option<mpsc::Sender<WriteRequest>>,
    writer_handle: Option<thread::JoinHandle<()>>,
    _lock: FileLock,
}

/// Point-in-time counters for monitoring and tests.
#[derive(Debug, Clone)]
pub struct DbStats {
    pub memtable_size: usize,
    pub immutable_pending: bool,
    pub files_per_level: [usize; NUM_LEVELS],
    pub bytes_per_level: [u64; NUM_LEVELS],
    pub last_sequence: u64,
}

impl Db {
    /// Opens (and if configured, creates) the database at `dir`.
    pub fn open(dir: impl AsRef<Path>, options: Options) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let exists = current_file_name(&dir).exists();
        if exists && options.error_if_exists {
            return errinput!("database already exists: {}", dir.display());
        }
        if !exists && !options.create_if_missing {
            return errinput!("database does not exist: {}", dir.display());
        }
        fs::create_dir_all(&dir)?;

        let lock = FileLock::lock(lock_file_name(&dir))
            .map_err(|e| Error::Io(format!("cannot lock {}: {e}", dir.display())))?;

        let cache = Arc::new(TableCache::new(dir.clone(), &options));
        let mut versions = VersionSet::new(dir.clone(), options.clone(), Arc::clone(&cache));

        let mut last_sequence = 0;
        let mem = Arc::new(MemTable::new());
        let mut edit = VersionEdit::new();

        if exists {
            last_sequence = versions.recover()?;
            let replayed = Self::replay_logs(&dir, &mut versions, &mem, &mut last_sequence)?;
            if replayed > 0 {
                tracing::info!(entries = replayed, "Recovered entries from write-ahead logs");
            }
        }

        // Anything replayed from old logs gets flushed right away, so the
        // new log number recorded below makes those logs obsolete without
        // losing data.
        if !mem.is_empty() {
            let number = versions.new_file_number();
            let (smallest, largest) = mem.key_range().expect("memtable is non-empty");
            let mut builder = TableBuilder::create(&table_file_name(&dir, number), &options)?;
            for (key, value) in mem.iter() {
                builder.add(&key.encode(), &value)?;
            }
            let file_size = builder.finish()?;
            let level = versions.current().pick_level_for_memtable_output(
                &options,
                smallest.user_key(),
                largest.user_key(),
            );
            edit.add_file(level, number, file_size, smallest, largest);
            tracing::info!(table = number, level, bytes = file_size, "Flushed recovered entries");
        }

        let log_number = versions.new_file_number();
        let wal = LogWriter::create(&log_file_name(&dir, log_number))?;
        edit.log_number = Some(log_number);
        versions.log_and_apply(&mut edit, last_sequence)?;
        let current = versions.current();

        let shared = Arc::new(Shared {
            dir,
            options,
            mem: RwLock::new(mem),
            imm: Mutex::new(None),
            imm_cv: Condvar::new(),
            current: RwLock::new(current),
            versions: Mutex::new(versions),
            cache,
            snapshots: Arc::new(SnapshotList::default()),
            last_sequence: AtomicU64::new(last_sequence),
            log_number: AtomicU64::new(log_number),
            bg_error: Mutex::new(None),
            pending_outputs: Mutex::new(HashSet::new()),
            flush_running: AtomicBool::new(false),
            compaction_running: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        });

        remove_obsolete_files(&shared)?;

        let (writer_tx, writer_rx) = mpsc::channel();
        let writer_shared = Arc::clone(&shared);
        let writer_handle = thread::Builder::new()
            .name("reefdb-writer".to_string())
            .spawn(move || writer_loop(writer_shared, writer_rx, wal))
            .map_err(|e| Error::Io(e.to_string()))?;

        tracing::info!(last_sequence, "Database opened");
        Ok(Self {
            shared,
            writer_tx: Some(writer_tx),
            writer_handle: Some(writer_handle),
            _lock: lock,
        })
    }

    fn replay_logs(
        dir: &Path,
        versions: &mut VersionSet,
        mem: &MemTable,
        last_sequence: &mut u64,
    ) -> Result<u64> {
        let mut log_numbers: Vec<u64> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some((FileType::Log, number)) = parse_file_name(name) {
                    if number >= versions.log_number {
                        log_numbers.push(number);
                    }
                }
            }
        }
        log_numbers.sort_unstable();

        let mut replayed = 0u64;
        for number in log_numbers {
            versions.mark_file_number_used(number);
            let mut reader = LogReader::open(&log_file_name(dir, number))?;
            while let Some(record) = reader
                .read_record()
                .map_err(|e| Error::Corruption(format!("log {:06}: {e}", number)))?
            {
                let batch = WriteBatch::from_contents(record)?;
                batch.apply_to(mem)?;
                let tail = batch.sequence() + batch.count() as u64 - 1;
                if tail > *last_sequence {
                    *last_sequence = tail;
                }
                replayed += batch.count() as u64;
            }
        }
        Ok(replayed)
    }

    /// Serializes a batch through the writer task and waits for the ack.
    pub fn write(&self, batch: WriteBatch, options: &WriteOptions) -> Result<u64> {
        if batch.is_empty() {
            return Ok(self.shared.last_sequence.load(AtomicOrdering::SeqCst));
        }
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        self.writer_tx
            .as_ref()
            .expect("writer lives as long as the db")
            .send(WriteRequest::Batch {
                batch,
                sync: options.sync,
                ack: ack_tx,
            })
            .map_err(|_| Error::Shutdown)?;
        ack_rx.recv().map_err(|_| Error::Shutdown)?
    }

    pub fn put(&self, key: &[u8], value: &[u8], options: &WriteOptions) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(batch, options).map(|_| ())
    }

    pub fn delete(&self, key: &[u8], options: &WriteOptions) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(batch, options).map(|_| ())
    }

    /// Reads the newest visible value at the current last sequence.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get_at(key, self.shared.last_sequence.load(AtomicOrdering::SeqCst))
    }

    /// Reads as of a snapshot.
    pub fn get_snapshot(&self, key: &[u8], snapshot: &Snapshot) -> Result<Option<Vec<u8>>> {
        self.get_at(key, snapshot.sequence())
    }

    /// Reads as of an explicit sequence number.
    pub fn get_at(&self, key: &[u8], sequence: u64) -> Result<Option<Vec<u8>>> {
        let lookup = LookupKey::new(key, sequence);

        let mem = self.shared.mem.read()?.clone();
        match mem.get(&lookup)? {
            MemLookup::Found(value) => return Ok(Some(value)),
            MemLookup::Deleted => return Ok(None),
            MemLookup::Missing => {}
        }

        let imm = self.shared.imm.lock()?.clone();
        if let Some(imm) = imm {
            match imm.get(&lookup)? {
                MemLookup::Found(value) => return Ok(Some(value)),
                MemLookup::Deleted => return Ok(None),
                MemLookup::Missing => {}
            }
        }

        let version = self.shared.current.read()?.clone();
        let (result, stats) = version.get(&self.shared.cache, &lookup)?;
        match result {
            VersionLookup::Found(value) => Ok(Some(value)),
            VersionLookup::Deleted => Ok(None),
            VersionLookup::Missing => {
                // A miss charges the first file the search had to read.
                if let Some(stats) = stats {
                    version.update_stats(stats);
                }
                Ok(None)
            }
        }
    }

    /// Registers a snapshot at the current last sequence.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(
            self.shared.last_sequence.load(AtomicOrdering::SeqCst),
            Arc::clone(&self.shared.snapshots),
        )
    }

    pub fn last_sequence(&self) -> u64 {
        self.shared.last_sequence.load(AtomicOrdering::SeqCst)
    }

    /// Forward scan over user keys starting at `start`, as of `sequence`.
    pub fn scan_at(&self, start: &[u8], sequence: u64) -> Result<ScanIter> {
        let mem = self.shared.mem.read()?.clone();
        let imm = self.shared.imm.lock()?.clone();
        let version = self.shared.current.read()?.clone();

        let mut children: Vec<Box<dyn Cursor>> = Vec::new();
        children.push(Box::new(MemCursor::new(&mem)));
        if let Some(imm) = &imm {
            children.push(Box::new(MemCursor::new(imm)));
        }
        for file in &version.files[0] {
            children.push(Box::new(self.shared.cache.cursor(file.number)?));
        }
        for level in 1..NUM_LEVELS {
            if !version.files[level].is_empty() {
                children.push(Box::new(LevelCursor::new(
                    Arc::clone(&self.shared.cache),
                    version.files[level].clone(),
                )));
            }
        }

        let inner = UserIterator::new(MergeCursor::new(children), start, sequence)?;
        Ok(ScanIter {
            inner,
            _version: version,
        })
    }

    pub fn scan(&self, start: &[u8]) -> Result<ScanIter> {
        self.scan_at(start, self.last_sequence())
    }

    /// Freezes the active memtable so the next flush picks it up. Blocks
    /// while a previous freeze is still unflushed.
    pub fn rotate_memtable(&self) -> Result<()> {
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        self.writer_tx
            .as_ref()
            .expect("writer lives as long as the db")
            .send(WriteRequest::Rotate { ack: ack_tx })
            .map_err(|_| Error::Shutdown)?;
        ack_rx.recv().map_err(|_| Error::Shutdown)?.map(|_| ())
    }

    /// Flushes the frozen memtable to a table file, if one is pending.
    pub fn flush_memtable(&self) -> Result<bool> {
        flush_memtable(&self.shared)
    }

    /// Runs one compaction if one is needed. Returns false when there was
    /// nothing to do.
    pub fn compact_once(&self) -> Result<bool> {
        compact_once(&self.shared)
    }

    pub fn needs_flush(&self) -> bool {
        self.shared
            .imm
            .lock()
            .map(|imm| imm.is_some())
            .unwrap_or(false)
            && !self.shared.flush_running.load(AtomicOrdering::SeqCst)
    }

    pub fn needs_compaction(&self) -> bool {
        self.shared
            .current
            .read()
            .map(|v| v.needs_compaction())
            .unwrap_or(false)
    }

    /// Background task handles for a scheduler.
    pub fn background_tasks(&self) -> (Arc<FlushTask>, Arc<CompactionTask>) {
        (
            Arc::new(FlushTask {
                shared: Arc::clone(&self.shared),
                interval: self.shared.options.scheduler.flush_interval,
            }),
            Arc::new(CompactionTask {
                shared: Arc::clone(&self.shared),
                interval: self.shared.options.scheduler.compaction_interval,
            }),
        )
    }

    pub fn stats(&self) -> Result<DbStats> {
        let version = self.shared.current.read()?.clone();
        let mut files_per_level = [0usize; NUM_LEVELS];
        let mut bytes_per_level = [0u64; NUM_LEVELS];
        for level in 0..NUM_LEVELS {
            files_per_level[level] = version.files[level].len();
            bytes_per_level[level] = version.files[level].iter().map(|f| f.file_size).sum();
        }
        Ok(DbStats {
            memtable_size: self.shared.mem.read()?.approximate_size(),
            immutable_pending: self.shared.imm.lock()?.is_some(),
            files_per_level,
            bytes_per_level,
            last_sequence: self.last_sequence(),
        })
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, AtomicOrdering::SeqCst);
        self.shared.imm_cv.notify_all();
        drop(self.writer_tx.take());
        if let Some(handle) = self.writer_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Scan handle: the iterator plus the version pin that keeps the files it
/// reads alive.
pub struct ScanIter {
    inner: UserIterator,
    _version: Arc<Version>,
}

impl Iterator for ScanIter {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

// ---- Writer task ----

fn writer_loop(shared: Arc<Shared>, rx: mpsc::Receiver<WriteRequest>, mut wal: LogWriter) {
    while let Ok(first) = rx.recv() {
        match first {
            WriteRequest::Rotate { ack } => {
                let result = force_rotate(&shared, &mut wal)
                    .map(|_| shared.last_sequence.load(AtomicOrdering::SeqCst));
                let _ = ack.send(result);
            }
            WriteRequest::Batch { batch, sync, ack } => {
                let mut group = vec![(batch, sync, ack)];
                let mut group_bytes = group[0].0.approximate_size();
                // Group commit: everything queued behind the leader shares
                // one WAL flush.
                while group_bytes < MAX_GROUP_BYTES {
                    match rx.try_recv() {
                        Ok(WriteRequest::Batch { batch, sync, ack }) => {
                            group_bytes += batch.approximate_size();
                            group.push((batch, sync, ack));
                        }
                        Ok(WriteRequest::Rotate { ack }) => {
                            // Commit the group first, then rotate.
                            let commit = commit_group(&shared, &mut wal, &mut group);
                            ack_group(&shared, group, commit);
                            let result = force_rotate(&shared, &mut wal)
                                .map(|_| shared.last_sequence.load(AtomicOrdering::SeqCst));
                            let _ = ack.send(result);
                            group = Vec::new();
                            break;
                        }
                        Err(_) => break,
                    }
                }
                if !group.is_empty() {
                    let commit = commit_group(&shared, &mut wal, &mut group);
                    ack_group(&shared, group, commit);
                }
            }
        }
    }
    let _ = wal.sync();
}

type GroupEntry = (WriteBatch, bool, mpsc::SyncSender<Result<u64>>);

fn ack_group(shared: &Shared, group: Vec<GroupEntry>, result: Result<u64>) {
    if let Err(e) = &result {
        if matches!(e, Error::Io(_) | Error::Corruption(_)) {
            set_background_error(shared, e.clone());
        }
    }
    for (_, _, ack) in group {
        let _ = ack.send(result.clone());
    }
}

fn commit_group(shared: &Shared, wal: &mut LogWriter, group: &mut [GroupEntry]) -> Result<u64> {
    if let Some(e) = shared.bg_error.lock()?.clone() {
        return Err(e);
    }

    make_room(shared, wal)?;

    let mut sequence = shared.last_sequence.load(AtomicOrdering::SeqCst);
    let mut want_sync = false;
    for (batch, sync, _) in group.iter_mut() {
        batch.set_sequence(sequence + 1);
        sequence += batch.count() as u64;
        want_sync |= *sync;
        wal.add_record(batch.contents())?;
    }
    if want_sync {
        wal.sync()?;
    } else {
        wal.flush()?;
    }

    let mem = shared.mem.read()?.clone();
    for (batch, _, _) in group.iter() {
        batch.apply_to(&mem)?;
    }
    // Publishing the sequence makes the whole group visible at once.
    shared.last_sequence.store(sequence, AtomicOrdering::SeqCst);
    Ok(sequence)
}

/// Blocks until the active memtable has room, rotating it out when full.
fn make_room(shared: &Shared, wal: &mut LogWriter) -> Result<()> {
    loop {
        let mem_size = shared.mem.read()?.approximate_size();
        if mem_size < shared.options.write_buffer_size {
            return Ok(());
        }
        rotate(shared, wal)?;
    }
}

/// Rotates regardless of size (used by explicit freezes); no-op when the
/// active memtable is empty.
fn force_rotate(shared: &Shared, wal: &mut LogWriter) -> Result<()> {
    if shared.mem.read()?.is_empty() {
        return Ok(());
    }
    rotate(shared, wal)
}

fn rotate(shared: &Shared, wal: &mut LogWriter) -> Result<()> {
    // Wait for the previous frozen memtable to be flushed.
    {
        let mut imm = shared.imm.lock()?;
        while imm.is_some() {
            if shared.shutdown.load(AtomicOrdering::SeqCst) {
                return Err(Error::Shutdown);
            }
            tracing::warn!("Write stalled waiting for memtable flush");
            let (guard, _) = shared.imm_cv.wait_timeout(imm, Duration::from_millis(100))?;
            imm = guard;
        }
    }

    let new_log_number = shared.versions.lock()?.new_file_number();
    wal.sync()?;
    let new_wal = LogWriter::create(&log_file_name(&shared.dir, new_log_number))?;
    *wal = new_wal;
    shared.log_number.store(new_log_number, AtomicOrdering::SeqCst);

    // Expose the frozen table before swapping in the empty one, so readers
    // between the two steps see the data twice rather than not at all.
    let old_mem = shared.mem.read()?.clone();
    *shared.imm.lock()? = Some(old_mem);
    *shared.mem.write()? = Arc::new(MemTable::new());

    tracing::info!(log_number = new_log_number, "Rotated memtable and write-ahead log");
    Ok(())
}

// ---- Background work ----

fn set_background_error(shared: &Shared, error: Error) {
    let mut bg_error = shared.bg_error.lock().unwrap();
    if bg_error.is_none() {
        tracing::error!(error = %error, "Background error; writes are now failing fast");
        *bg_error = Some(error);
    }
}

/// Writes the frozen memtable to a table file and records it in a new
/// version. The output may land below level 0 when that causes no overlap.
pub(crate) fn flush_memtable(shared: &Shared) -> Result<bool> {
    if shared.shutdown.load(AtomicOrdering::SeqCst) {
        return Err(Error::Shutdown);
    }
    if shared
        .flush_running
        .compare_exchange(false, true, AtomicOrdering::SeqCst, AtomicOrdering::SeqCst)
        .is_err()
    {
        return Ok(false);
    }

    let result = (|| -> Result<bool> {
        let imm = match shared.imm.lock()?.clone() {
            Some(imm) => imm,
            None => return Ok(false),
        };

        let (smallest, largest) = imm
            .key_range()
            .expect("frozen memtables are never empty");

        let number = {
            let mut versions = shared.versions.lock()?;
            versions.new_file_number()
        };
        shared.pending_outputs.lock()?.insert(number);

        let path = table_file_name(&shared.dir, number);
        let mut builder = TableBuilder::create(&path, &shared.options)?;
        for (key, value) in imm.iter() {
            builder.add(&key.encode(), &value)?;
        }
        let file_size = builder.finish()?;

        let new_version = {
            let mut versions = shared.versions.lock()?;
            let level = versions.current().pick_level_for_memtable_output(
                &shared.options,
                smallest.user_key(),
                largest.user_key(),
            );
            let mut edit = VersionEdit::new();
            // Logs older than the active one only covered this memtable.
            edit.log_number = Some(shared.log_number.load(AtomicOrdering::SeqCst));
            edit.add_file(level, number, file_size, smallest, largest);
            let version = versions.log_and_apply(
                &mut edit,
                shared.last_sequence.load(AtomicOrdering::SeqCst),
            )?;
            tracing::info!(
                table = number,
                level = level,
                entries = imm.len(),
                bytes = file_size,
                "Flushed memtable to table file"
            );
            version
        };
        *shared.current.write()? = new_version;

        *shared.imm.lock()? = None;
        shared.imm_cv.notify_all();
        shared.pending_outputs.lock()?.remove(&number);

        remove_obsolete_files(shared)?;
        Ok(true)
    })();

    shared.flush_running.store(false, AtomicOrdering::SeqCst);
    if let Err(e) = &result {
        if !matches!(e, Error::Shutdown) {
            set_background_error(shared, e.clone());
        }
    }
    result
}

/// Picks and runs one compaction: a trivial move when possible, otherwise
/// a full merge into level+1.
pub(crate) fn compact_once(shared: &Shared) -> Result<bool> {
    if shared.shutdown.load(AtomicOrdering::SeqCst) {
        return Err(Error::Shutdown);
    }
    if shared
        .compaction_running
        .compare_exchange(false, true, AtomicOrdering::SeqCst, AtomicOrdering::SeqCst)
        .is_err()
    {
        return Ok(false);
    }

    let result = (|| -> Result<bool> {
        let mut picked = match shared.versions.lock()?.pick_compaction() {
            Some(picked) => picked,
            None => return Ok(false),
        };
        let level = picked.level();

        if picked.is_trivial_move(&shared.options) {
            let file = Arc::clone(&picked.inputs[0][0]);
            picked.edit.delete_file(level, file.number);
            picked.edit.add_file(
                level + 1,
                file.number,
                file.file_size,
                file.smallest.clone(),
                file.largest.clone(),
            );
            let mut edit = std::mem::take(&mut picked.edit);
            let new_version = shared.versions.lock()?.log_and_apply(
                &mut edit,
                shared.last_sequence.load(AtomicOrdering::SeqCst),
            )?;
            *shared.current.write()? = new_version;
            tracing::info!(
                table = file.number,
                from_level = level,
                to_level = level + 1,
                "Trivial move"
            );
            return Ok(true);
        }

        let smallest_snapshot = shared
            .snapshots
            .smallest(shared.last_sequence.load(AtomicOrdering::SeqCst));

        let outputs = compaction::execute(
            &shared.dir,
            &shared.options,
            &shared.cache,
            &mut picked,
            smallest_snapshot,
            &mut || shared.versions.lock().unwrap().new_file_number(),
            &shared.pending_outputs,
            &shared.shutdown,
        )?;

        picked.add_input_deletions();
        for output in &outputs {
            picked.edit.add_file(
                level + 1,
                output.number,
                output.file_size,
                output.smallest.clone(),
                output.largest.clone(),
            );
        }

        let mut edit = std::mem::take(&mut picked.edit);
        let new_version = shared.versions.lock()?.log_and_apply(
            &mut edit,
            shared.last_sequence.load(AtomicOrdering::SeqCst),
        )?;
        *shared.current.write()? = new_version;

        {
            let mut pending = shared.pending_outputs.lock()?;
            for output in &outputs {
                pending.remove(&output.number);
            }
        }

        tracing::info!(
            level = level,
            inputs_low = picked.num_input_files(0),
            inputs_high = picked.num_input_files(1),
            outputs = outputs.len(),
            "Compaction finished"
        );

        remove_obsolete_files(shared)?;
        Ok(true)
    })();

    shared.compaction_running.store(false, AtomicOrdering::SeqCst);
    if let Err(e) = &result {
        if !matches!(e, Error::Shutdown) {
            set_background_error(shared, e.clone());
        }
    }
    result
}

/// Deletes files no live version references: old logs, replaced manifests,
/// and compacted-away tables. Pending compaction outputs are protected.
pub(crate) fn remove_obsolete_files(shared: &Shared) -> Result<()> {
    let (mut live, log_number, manifest_number) = {
        let versions = shared.versions.lock()?;
        (versions.live_files(), versions.log_number, versions.manifest_file_number)
    };
    live.extend(shared.pending_outputs.lock()?.iter().copied());

    for entry in fs::read_dir(&shared.dir)? {
        let entry = entry?;
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(_) => continue,
        };
        let keep = match parse_file_name(&name) {
            Some((FileType::Log, number)) => number >= log_number,
            Some((FileType::Table, number)) => live.contains(&number),
            Some((FileType::Manifest, number)) => number >= manifest_number,
            Some((FileType::Current, _)) | Some((FileType::Lock, _)) => true,
            // Unknown files (including leftover temp files) are kept out of
            // caution, except our own rename temps.
            None => !name.ends_with(".dbtmp"),
        };
        if !keep {
            if let Some((FileType::Table, number)) = parse_file_name(&name) {
                shared.cache.evict(number);
            }
            tracing::info!(file = %name, "Deleting obsolete file");
            let _ = fs::remove_file(entry.path());
        }
    }
    Ok(())
}

// ---- Scheduler tasks ----

/// Periodic flush of the frozen memtable.
pub struct FlushTask {
    shared: Arc<Shared>,
    interval: Duration,
}

#[async_trait::async_trait]
impl BackgroundTask for FlushTask {
    fn name(&self) -> &'static str {
        "memtable-flush"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        match flush_memtable(&self.shared) {
            Ok(_) => Ok(()),
            Err(Error::Shutdown) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Periodic compaction when the version wants one.
pub struct CompactionTask {
    shared: Arc<Shared>,
    interval: Duration,
}

#[async_trait::async_trait]
impl BackgroundTask for CompactionTask {
    fn name(&self) -> &'static str {
        "compaction"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        if !self.shared.current.read()?.needs_compaction() {
            return Ok(());
        }
        match compact_once(&self.shared) {
            Ok(_) => Ok(()),
            Err(Error::Shutdown) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
