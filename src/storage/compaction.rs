//! Compaction: merging level L inputs with their level L+1 overlap into
//! fresh level L+1 tables.
//!
//! The merge streams entries in internal-key order and drops what no
//! reader can observe: entries shadowed by a newer entry at or below the
//! smallest live snapshot, and tombstones that have reached the base level
//! for their key. Output files are cut at `max_file_size` and also
//! whenever the accumulated grandparent (level L+2) overlap grows past its
//! limit, so a future compaction of L+1 never has to rewrite too much of
//! L+2 at once.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use super::dbformat::{
    internal_compare, table_file_name, InternalKey, ValueKind, MAX_SEQUENCE, NUM_LEVELS,
};
use super::iterator::{Cursor, MergeCursor};
use super::table::TableBuilder;
use super::table_cache::TableCache;
use super::version::{
    max_grandparent_overlap_bytes, total_file_size, FileMetaData, LevelCursor, Version,
};
use super::version_edit::VersionEdit;
use crate::config::Options;
use crate::error::Result;
use crate::Error;

/// A picked compaction: inputs at level and level+1, the grandparent file
/// list, and the edit under construction.
pub struct Compaction {
    pub(crate) level: usize,
    pub(crate) input_version: Arc<Version>,
    pub(crate) edit: VersionEdit,
    pub(crate) inputs: [Vec<Arc<FileMetaData>>; 2],
    pub(crate) grandparents: Vec<Arc<FileMetaData>>,

    // State for should_stop_before.
    grandparent_index: usize,
    seen_key: bool,
    overlapped_bytes: u64,

    // Per-level scan positions for is_base_level_for_key. Valid because
    // compaction consumes user keys in ascending order.
    level_ptrs: [usize; NUM_LEVELS],
}

impl Compaction {
    pub(crate) fn new(_options: &Options, level: usize, input_version: Arc<Version>) -> Self {
        Self {
            level,
            input_version,
            edit: VersionEdit::new(),
            inputs: [Vec::new(), Vec::new()],
            grandparents: Vec::new(),
            grandparent_index: 0,
            seen_key: false,
            overlapped_bytes: 0,
            level_ptrs: [0; NUM_LEVELS],
        }
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn num_input_files(&self, which: usize) -> usize {
        self.inputs[which].len()
    }

    /// A single input file with no level+1 overlap and bounded grandparent
    /// overlap just changes level; no rewrite needed.
    pub fn is_trivial_move(&self, options: &Options) -> bool {
        self.inputs[0].len() == 1
            && self.inputs[1].is_empty()
            && total_file_size(&self.grandparents) <= max_grandparent_overlap_bytes(options)
    }

    /// Records every input file as deleted in the edit.
    pub fn add_input_deletions(&mut self) {
        for which in 0..2 {
            for file in &self.inputs[which] {
                self.edit.delete_file(self.level + which, file.number);
            }
        }
    }

    /// True if no level below the compaction output (level+2 and deeper)
    /// contains the user key, so a tombstone for it can be dropped.
    pub fn is_base_level_for_key(&mut self, user_key: &[u8]) -> bool {
        for level in self.level + 2..NUM_LEVELS {
            let files = &self.input_version.files[level];
            let ptr = &mut self.level_ptrs[level];
            while *ptr < files.len() {
                let file = &files[*ptr];
                if user_key <= file.largest.user_key() {
                    if user_key >= file.smallest.user_key() {
                        return false;
                    }
                    break;
                }
                *ptr += 1;
            }
        }
        true
    }

    /// True if the current output file should be closed before writing
    /// this key, to cap how much of level+2 one output file can overlap.
    pub fn should_stop_before(&mut self, internal_key: &[u8], options: &Options) -> bool {
        while self.grandparent_index < self.grandparents.len()
            && internal_compare(
                internal_key,
                &self.grandparents[self.grandparent_index].largest.encode(),
            ) == std::cmp::Ordering::Greater
        {
            if self.seen_key {
                self.overlapped_bytes += self.grandparents[self.grandparent_index].file_size;
            }
            self.grandparent_index += 1;
        }
        self.seen_key = true;

        if self.overlapped_bytes > max_grandparent_overlap_bytes(options) {
            self.overlapped_bytes = 0;
            true
        } else {
            false
        }
    }

    /// Merging cursor over all input files. Level-0 inputs overlap and get
    /// one cursor per file; the other side is a disjoint run.
    pub fn input_cursor(&self, cache: &Arc<TableCache>) -> Result<MergeCursor> {
        let mut children: Vec<Box<dyn Cursor>> = Vec::new();
        if self.level == 0 {
            for file in &self.inputs[0] {
                children.push(Box::new(cache.cursor(file.number)?));
            }
        } else {
            children.push(Box::new(LevelCursor::new(
                Arc::clone(cache),
                self.inputs[0].clone(),
            )));
        }
        if !self.inputs[1].is_empty() {
            children.push(Box::new(LevelCursor::new(
                Arc::clone(cache),
                self.inputs[1].clone(),
            )));
        }
        Ok(MergeCursor::new(children))
    }
}

/// A table file produced by a compaction.
pub(crate) struct OutputFile {
    pub number: u64,
    pub file_size: u64,
    pub smallest: InternalKey,
    pub largest: InternalKey,
}

struct OutputState {
    number: u64,
    builder: TableBuilder,
    smallest: InternalKey,
    largest: InternalKey,
}

/// Runs the merge and writes the output tables. Cancellation via the
/// shutdown flag discards outputs; the caller deletes the files of any
/// numbers left registered in pending_outputs.
#[allow(clippy::too_many_arguments)]
pub(crate) fn execute(
    dir: &Path,
    options: &Options,
    cache: &Arc<TableCache>,
    compaction: &mut Compaction,
    smallest_snapshot: u64,
    new_file_number: &mut dyn FnMut() -> u64,
    pending_outputs: &Mutex<std::collections::HashSet<u64>>,
    shutdown: &AtomicBool,
) -> Result<Vec<OutputFile>> {
    let mut cursor = compaction.input_cursor(cache)?;
    cursor.seek_to_first()?;

    let mut outputs: Vec<OutputFile> = Vec::new();
    let mut output: Option<OutputState> = None;
    let mut last_user_key: Option<Vec<u8>> = None;
    let mut last_sequence_for_key = MAX_SEQUENCE;

    let mut finish_output = |output: &mut Option<OutputState>,
                             outputs: &mut Vec<OutputFile>|
     -> Result<()> {
        if let Some(mut state) = output.take() {
            let file_size = state.builder.finish()?;
            outputs.push(OutputFile {
                number: state.number,
                file_size,
                smallest: state.smallest,
                largest: state.largest,
            });
        }
        Ok(())
    };

    let result = (|| -> Result<()> {
        while cursor.valid() {
            if shutdown.load(AtomicOrdering::SeqCst) {
                return Err(Error::Shutdown);
            }

            let key = cursor.key().to_vec();
            if output.is_some() && compaction.should_stop_before(&key, options) {
                finish_output(&mut output, &mut outputs)?;
            }

            let ikey = InternalKey::decode(&key)?;
            if last_user_key.as_deref() != Some(ikey.user_key()) {
                last_user_key = Some(ikey.user_key().to_vec());
                last_sequence_for_key = MAX_SEQUENCE;
            }

            let mut drop_entry = false;
            if last_sequence_for_key <= smallest_snapshot {
                // A newer entry for this user key is already visible at or
                // below every snapshot; nothing can observe this one.
                drop_entry = true;
            } else if ikey.kind()? == ValueKind::Delete
                && ikey.sequence() <= smallest_snapshot
                && compaction.is_base_level_for_key(ikey.user_key())
            {
                // The tombstone has nothing left to shadow below it.
                drop_entry = true;
            }
            last_sequence_for_key = ikey.sequence();

            if !drop_entry {
                if output.is_none() {
                    let number = new_file_number();
                    pending_outputs.lock()?.insert(number);
                    let builder = TableBuilder::create(&table_file_name(dir, number), options)?;
                    output = Some(OutputState {
                        number,
                        builder,
                        smallest: ikey.clone(),
                        largest: ikey.clone(),
                    });
                }
                let state = output.as_mut().expect("output opened above");
                state.builder.add(&key, cursor.value())?;
                state.largest = ikey;

                if state.builder.estimated_size() >= options.max_file_size {
                    finish_output(&mut output, &mut outputs)?;
                }
            }

            cursor.next()?;
        }

        finish_output(&mut output, &mut outputs)
    })();

    match result {
        Ok(()) => Ok(outputs),
        Err(e) => {
            // Abort: discard any outputs written so far. The next
            // compaction retries from the same inputs.
            let mut pending = pending_outputs.lock()?;
            for file in &outputs {
                pending.remove(&file.number);
                let _ = std::fs::remove_file(table_file_name(dir, file.number));
            }
            if let Some(state) = output {
                pending.remove(&state.number);
                let _ = std::fs::remove_file(table_file_name(dir, state.number));
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::table::Table;
    use crate::tmpfs::TempDir;
    use std::collections::HashSet;

    fn ikey(user_key: &[u8], sequence: u64, kind: ValueKind) -> InternalKey {
        InternalKey::new(user_key.to_vec(), sequence, kind)
    }

    fn meta(number: u64, size: u64, smallest: &[u8], largest: &[u8]) -> Arc<FileMetaData> {
        Arc::new(FileMetaData::new(
            number,
            size,
            ikey(smallest, 1, ValueKind::Put),
            ikey(largest, 1, ValueKind::Put),
        ))
    }

    #[test]
    fn test_trivial_move_conditions() {
        let options = Options::default();
        let version = Arc::new(Version::empty());

        let mut c = Compaction::new(&options, 1, Arc::clone(&version));
        c.inputs[0] = vec![meta(1, 100, b"a", b"c")];
        assert!(c.is_trivial_move(&options));

        // A level+1 overlap forces a rewrite.
        c.inputs[1] = vec![meta(2, 100, b"b", b"d")];
        assert!(!c.is_trivial_move(&options));

        // Too much grandparent overlap blocks the move too.
        let mut c = Compaction::new(&options, 1, version);
        c.inputs[0] = vec![meta(1, 100, b"a", b"c")];
        c.grandparents = vec![meta(3, max_grandparent_overlap_bytes(&options) + 1, b"a", b"z")];
        assert!(!c.is_trivial_move(&options));
    }

    #[test]
    fn test_is_base_level_for_key() {
        let options = Options::default();
        let mut version = Version::empty();
        version.files[3] = vec![meta(1, 100, b"d", b"f"), meta(2, 100, b"m", b"p")];

        let mut c = Compaction::new(&options, 1, Arc::new(version));
        assert!(c.is_base_level_for_key(b"a"));
        assert!(!c.is_base_level_for_key(b"e"));
        assert!(c.is_base_level_for_key(b"g"));
        assert!(!c.is_base_level_for_key(b"n"));
        assert!(c.is_base_level_for_key(b"z"));
    }

    #[test]
    fn test_should_stop_before_caps_grandparent_overlap() {
        let options = Options::default();
        let limit = max_grandparent_overlap_bytes(&options);

        let mut c = Compaction::new(&options, 1, Arc::new(Version::empty()));
        // Three grandparent files, each large enough that crossing two
        // exceeds the limit.
        c.grandparents = vec![
            meta(1, limit / 2 + 1, b"b", b"c"),
            meta(2, limit / 2 + 1, b"e", b"f"),
            meta(3, limit / 2 + 1, b"h", b"i"),
        ];

        let key = |k: &[u8]| ikey(k, 1, ValueKind::Put).encode();

        assert!(!c.should_stop_before(&key(b"a"), &options));
        assert!(!c.should_stop_before(&key(b"d"), &options));
        // Crossing the second grandparent pushes the accumulated overlap
        // past the limit.
        assert!(c.should_stop_before(&key(b"j"), &options));
        // The counter resets after a stop.
        assert!(!c.should_stop_before(&key(b"k"), &options));
    }

    fn write_table(dir: &std::path::Path, number: u64, entries: &[(Vec<u8>, Vec<u8>)]) -> Arc<FileMetaData> {
        let options = Options::default();
        let mut builder = TableBuilder::create(&table_file_name(dir, number), &options).unwrap();
        for (key, value) in entries {
            builder.add(key, value).unwrap();
        }
        let size = builder.finish().unwrap();
        Arc::new(FileMetaData::new(
            number,
            size,
            InternalKey::decode(&entries.first().unwrap().0).unwrap(),
            InternalKey::decode(&entries.last().unwrap().0).unwrap(),
        ))
    }

    #[test]
    fn test_execute_merges_and_drops_shadowed_entries() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let options = Options::default();
        let cache = Arc::new(TableCache::new(dir.path().to_path_buf(), &options));

        // Level-0 file: newer versions, including a tombstone for "b".
        let f0 = write_table(
            dir.path(),
            1,
            &[
                (ikey(b"a", 10, ValueKind::Put).encode(), b"a-new".to_vec()),
                (ikey(b"b", 11, ValueKind::Delete).encode(), Vec::new()),
            ],
        );
        // Level-1 file: older versions of the same keys plus "c".
        let f1 = write_table(
            dir.path(),
            2,
            &[
                (ikey(b"a", 2, ValueKind::Put).encode(), b"a-old".to_vec()),
                (ikey(b"b", 3, ValueKind::Put).encode(), b"b-old".to_vec()),
                (ikey(b"c", 4, ValueKind::Put).encode(), b"c-val".to_vec()),
            ],
        );

        let mut version = Version::empty();
        version.files[0] = vec![Arc::clone(&f0)];
        version.files[1] = vec![Arc::clone(&f1)];

        let mut compaction = Compaction::new(&options, 0, Arc::new(version));
        compaction.inputs[0] = vec![f0];
        compaction.inputs[1] = vec![f1];

        // No live snapshot older than any entry here.
        let mut next_number = 100u64;
        let pending = Mutex::new(HashSet::new());
        let outputs = execute(
            dir.path(),
            &options,
            &cache,
            &mut compaction,
            100,
            &mut || {
                next_number += 1;
                next_number
            },
            &pending,
            &AtomicBool::new(false),
        )?;

        assert_eq!(outputs.len(), 1);
        let table = Arc::new(Table::open(&table_file_name(dir.path(), outputs[0].number))?);
        let mut cursor = table.cursor();
        cursor.seek_to_first()?;

        let mut seen = Vec::new();
        while cursor.valid() {
            let key = InternalKey::decode(cursor.key())?;
            seen.push((
                key.user_key().to_vec(),
                key.sequence(),
                key.kind()?,
                cursor.value().to_vec(),
            ));
            cursor.next()?;
        }

        // Old "a" and old "b" are shadowed; the "b" tombstone has reached
        // its base level and disappears with them.
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), 10, ValueKind::Put, b"a-new".to_vec()),
                (b"c".to_vec(), 4, ValueKind::Put, b"c-val".to_vec()),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_execute_keeps_entries_pinned_by_snapshot() -> Result<()> {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let options = Options::default();
        let cache = Arc::new(TableCache::new(dir.path().to_path_buf(), &options));

        let f0 = write_table(
            dir.path(),
            1,
            &[
                (ikey(b"k", 9, ValueKind::Put).encode(), b"new".to_vec()),
                (ikey(b"k", 3, ValueKind::Put).encode(), b"old".to_vec()),
            ],
        );

        let mut version = Version::empty();
        version.files[0] = vec![Arc::clone(&f0)];

        let mut compaction = Compaction::new(&options, 0, Arc::new(version));
        compaction.inputs[0] = vec![f0];

        // A snapshot at 5 still needs the sequence-3 entry.
        let mut next_number = 100u64;
        let pending = Mutex::new(HashSet::new());
        let outputs = execute(
            dir.path(),
            &options,
            &cache,
            &mut compaction,
            5,
            &mut || {
                next_number += 1;
                next_number
            },
            &pending,
            &AtomicBool::new(false),
        )?;

        let table = Arc::new(Table::open(&table_file_name(dir.path(), outputs[0].number))?);
        let mut cursor = table.cursor();
        cursor.seek_to_first()?;
        let mut sequences = Vec::new();
        while cursor.valid() {
            sequences.push(InternalKey::decode(cursor.key())?.sequence());
            cursor.next()?;
        }
        assert_eq!(sequences, vec![9, 3], "snapshot pins the old version");
        Ok(())
    }
}
