//! Versions: immutable snapshots of "which files live at which level".
//!
//! A [`Version`] is a per-level list of table files. Readers pin the
//! current version by cloning its `Arc` and keep reading it while flushes
//! and compactions install successors; a table file is deleted only when no
//! live version references it.
//!
//! [`VersionSet`] owns the current version and the manifest log. Applying a
//! [`VersionEdit`] goes through a [`Builder`] that merges the edit's
//! added/deleted file sets into the base version, preserving smallest-key
//! ordering per level, then the edit is appended to the manifest and the
//! new version installed.
//!
//! Level 0 files may overlap each other and are ordered newest first;
//! levels >= 1 are sorted by smallest key and pairwise disjoint in user-key
//! space.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, Weak};

use super::dbformat::{
    self, current_file_name, internal_compare, manifest_file_name, InternalKey, LookupKey,
    ValueKind, MAX_SEQUENCE, NUM_LEVELS,
};
use super::iterator::Cursor;
use super::table::TableCursor;
use super::table_cache::TableCache;
use super::version_edit::VersionEdit;
use super::wal::{LogReader, LogWriter};
use crate::config::Options;
use crate::errcorrupt;
use crate::error::Result;
use crate::Error;

/// Level-0 file count at which the compaction score reaches 1.0.
const L0_TRIGGER: f64 = 4.0;

/// Memtable flushes may be placed below level 0, but never deeper than this.
const MAX_MEM_COMPACT_LEVEL: usize = 2;

/// Target byte size for level L >= 1: 10^L megabytes.
pub(crate) fn max_bytes_for_level(level: usize) -> f64 {
    let mut result = 1024.0 * 1024.0;
    for _ in 0..level {
        result *= 10.0;
    }
    result
}

/// A compaction at level L may overlap at most this much data at L+2.
pub(crate) fn max_grandparent_overlap_bytes(options: &Options) -> u64 {
    10 * options.max_file_size
}

/// Cap on the total size of expanded compaction inputs.
pub(crate) fn expanded_compaction_byte_size_limit(options: &Options) -> u64 {
    25 * options.max_file_size
}

pub struct FileMetaData {
    pub number: u64,
    pub file_size: u64,
    pub smallest: InternalKey,
    pub largest: InternalKey,
    /// Seeks that missed in this file before it becomes a compaction
    /// candidate. Proportional to file size: one seek costs roughly the
    /// same as compacting 16KB of data.
    pub allowed_seeks: AtomicI64,
}

impl FileMetaData {
    pub fn new(number: u64, file_size: u64, smallest: InternalKey, largest: InternalKey) -> Self {
        let allowed_seeks = ((file_size / 16384) as i64).max(100);
        Self {
            number,
            file_size,
            smallest,
            largest,
            allowed_seeks: AtomicI64::new(allowed_seeks),
        }
    }
}

pub(crate) fn total_file_size(files: &[Arc<FileMetaData>]) -> u64 {
    files.iter().map(|f| f.file_size).sum()
}

/// Index of the first file whose largest key is >= target, assuming files
/// sorted by smallest key and disjoint (levels >= 1).
pub(crate) fn find_file(files: &[Arc<FileMetaData>], target: &[u8]) -> usize {
    files.partition_point(|f| internal_compare(&f.largest.encode(), target) == std::cmp::Ordering::Less)
}

/// Result of probing a version for a key.
#[derive(Debug, Clone, PartialEq)]
pub enum VersionLookup {
    Found(Vec<u8>),
    Deleted,
    Missing,
}

/// The first file a get actually read; charged on a miss.
pub struct SeekStats {
    pub file: Arc<FileMetaData>,
    pub level: usize,
}

pub struct Version {
    pub files: [Vec<Arc<FileMetaData>>; NUM_LEVELS],

    /// File whose allowed_seeks ran out, if any.
    seek_compact: Mutex<Option<(Arc<FileMetaData>, usize)>>,

    /// Level most in need of size compaction and its score; score >= 1
    /// means compaction is needed. Set by finalize().
    pub compaction_score: f64,
    pub compaction_level: usize,
}

impl Version {
    pub fn empty() -> Self {
        Self {
            files: Default::default(),
            seek_compact: Mutex::new(None),
            compaction_score: 0.0,
            compaction_level: 0,
        }
    }

    /// Computes the compaction score: level 0 by file count, deeper levels
    /// by total bytes against the level's target size.
    fn finalize(&mut self) {
        let mut best_level = 0;
        let mut best_score = self.files[0].len() as f64 / L0_TRIGGER;

        for level in 1..NUM_LEVELS - 1 {
            let score = total_file_size(&self.files[level]) as f64 / max_bytes_for_level(level);
            if score > best_score {
                best_score = score;
                best_level = level;
            }
        }

        self.compaction_score = best_score;
        self.compaction_level = best_level;
    }

    pub fn needs_compaction(&self) -> bool {
        self.compaction_score >= 1.0 || self.seek_compact.lock().unwrap().is_some()
    }

    pub(crate) fn seek_compaction(&self) -> Option<(Arc<FileMetaData>, usize)> {
        self.seek_compact.lock().unwrap().clone()
    }

    /// Searches the version for the lookup key: level 0 newest-first, then
    /// one candidate file per deeper level.
    pub fn get(
        &self,
        cache: &TableCache,
        lookup: &LookupKey,
    ) -> Result<(VersionLookup, Option<SeekStats>)> {
        let target = lookup.encode();
        let user_key = lookup.user_key();
        let mut stats: Option<SeekStats> = None;
        let mut files_read = 0usize;

        let mut probe = |file: &Arc<FileMetaData>,
                         level: usize,
                         stats: &mut Option<SeekStats>,
                         files_read: &mut usize|
         -> Result<Option<VersionLookup>> {
            *files_read += 1;
            if *files_read == 1 {
                *stats = Some(SeekStats {
                    file: Arc::clone(file),
                    level,
                });
            }
            match cache.get(file.number, &target)? {
                Some((found_key, value)) => {
                    let found = InternalKey::decode(&found_key)?;
                    if found.user_key() == user_key {
                        return Ok(Some(match found.kind()? {
                            ValueKind::Put => VersionLookup::Found(value),
                            ValueKind::Delete => VersionLookup::Deleted,
                        }));
                    }
                    Ok(None)
                }
                None => Ok(None),
            }
        };

        // Level 0 files may overlap; probe every file containing the user
        // key, newest first.
        for file in &self.files[0] {
            if user_key >= file.smallest.user_key() && user_key <= file.largest.user_key() {
                if let Some(result) = probe(file, 0, &mut stats, &mut files_read)? {
                    return Ok((result, stats));
                }
            }
        }

        // Deeper levels are disjoint: at most one candidate per level.
        for level in 1..NUM_LEVELS {
            let files = &self.files[level];
            if files.is_empty() {
                continue;
            }
            let index = find_file(files, &target);
            if index >= files.len() {
                continue;
            }
            let file = &files[index];
            if user_key < file.smallest.user_key() {
                continue;
            }
            if let Some(result) = probe(file, level, &mut stats, &mut files_read)? {
                return Ok((result, stats));
            }
        }

        Ok((VersionLookup::Missing, stats))
    }

    /// Charges a missed seek against the first file it read. Returns true
    /// when the file just became a compaction candidate. Bottom-level
    /// files are exempt; there is nowhere to compact them into.
    pub fn update_stats(&self, stats: SeekStats) -> bool {
        if stats.level + 1 >= NUM_LEVELS {
            return false;
        }
        let remaining = stats.file.allowed_seeks.fetch_sub(1, AtomicOrdering::Relaxed) - 1;
        if remaining <= 0 {
            let mut seek_compact = self.seek_compact.lock().unwrap();
            if seek_compact.is_none() {
                *seek_compact = Some((stats.file, stats.level));
                return true;
            }
        }
        false
    }

    /// True if any file at the level overlaps [smallest, largest] in user
    /// key space.
    pub fn overlap_in_level(&self, level: usize, smallest: &[u8], largest: &[u8]) -> bool {
        let files = &self.files[level];
        if level == 0 {
            return files
                .iter()
                .any(|f| largest >= f.smallest.user_key() && smallest <= f.largest.user_key());
        }
        // Disjoint files: binary search the first file that could overlap.
        let target = InternalKey::new(smallest.to_vec(), MAX_SEQUENCE, ValueKind::Put).encode();
        let index = find_file(files, &target);
        index < files.len() && largest >= files[index].smallest.user_key()
    }

    /// Files at the level overlapping [begin, end] in user key space. At
    /// level 0 the range re-expands whenever an included file widens it,
    /// because level-0 files overlap each other.
    pub fn overlapping_inputs(
        &self,
        level: usize,
        begin: &[u8],
        end: &[u8],
    ) -> Vec<Arc<FileMetaData>> {
        let mut begin = begin.to_vec();
        let mut end = end.to_vec();
        let mut inputs: Vec<Arc<FileMetaData>> = Vec::new();

        'restart: loop {
            inputs.clear();
            for file in &self.files[level] {
                if file.largest.user_key() < begin.as_slice()
                    || file.smallest.user_key() > end.as_slice()
                {
                    continue;
                }
                if level == 0 {
                    if file.smallest.user_key() < begin.as_slice() {
                        begin = file.smallest.user_key().to_vec();
                        continue 'restart;
                    }
                    if file.largest.user_key() > end.as_slice() {
                        end = file.largest.user_key().to_vec();
                        continue 'restart;
                    }
                }
                inputs.push(Arc::clone(file));
            }
            return inputs;
        }
    }

    /// Level at which a memtable flush covering [smallest, largest] should
    /// land: 0 if it overlaps level 0, otherwise pushed down while the next
    /// level stays clear and the grandparent overlap stays small.
    pub fn pick_level_for_memtable_output(
        &self,
        options: &Options,
        smallest: &[u8],
        largest: &[u8],
    ) -> usize {
        let mut level = 0;
        if self.overlap_in_level(0, smallest, largest) {
            return level;
        }
        while level < MAX_MEM_COMPACT_LEVEL {
            if self.overlap_in_level(level + 1, smallest, largest) {
                break;
            }
            if level + 2 < NUM_LEVELS {
                let grandparents = self.overlapping_inputs(level + 2, smallest, largest);
                if total_file_size(&grandparents) > max_grandparent_overlap_bytes(options) {
                    break;
                }
            }
            level += 1;
        }
        level
    }

    /// Smallest and largest user keys over a file set.
    pub(crate) fn key_range(files: &[Arc<FileMetaData>]) -> Option<(Vec<u8>, Vec<u8>)> {
        let mut smallest: Option<&[u8]> = None;
        let mut largest: Option<&[u8]> = None;
        for file in files {
            let s = file.smallest.user_key();
            let l = file.largest.user_key();
            if smallest.map_or(true, |cur| s < cur) {
                smallest = Some(s);
            }
            if largest.map_or(true, |cur| l > cur) {
                largest = Some(l);
            }
        }
        Some((smallest?.to_vec(), largest?.to_vec()))
    }
}

/// Cursor over a disjoint, sorted file list (one level >= 1): the file list
/// plays the role of an index block over per-table cursors.
pub struct LevelCursor {
    cache: Arc<TableCache>,
    files: Vec<Arc<FileMetaData>>,
    index: usize,
    table: Option<TableCursor>,
}

impl LevelCursor {
    pub fn new(cache: Arc<TableCache>, files: Vec<Arc<FileMetaData>>) -> Self {
        let index = files.len();
        Self {
            cache,
            files,
            index,
            table: None,
        }
    }

    fn load_table(&mut self) -> Result<()> {
        if self.index >= self.files.len() {
            self.table = None;
            return Ok(());
        }
        self.table = Some(self.cache.cursor(self.files[self.index].number)?);
        Ok(())
    }

    fn skip_exhausted(&mut self) -> Result<()> {
        while self.table.as_ref().map_or(false, |t| !t.valid()) {
            self.index += 1;
            self.load_table()?;
            if let Some(table) = &mut self.table {
                table.seek_to_first()?;
            }
        }
        Ok(())
    }
}

impl Cursor for LevelCursor {
    fn valid(&self) -> bool {
        self.table.as_ref().map_or(false, |t| t.valid())
    }

    fn seek_to_first(&mut self) -> Result<()> {
        self.index = 0;
        self.load_table()?;
        if let Some(table) = &mut self.table {
            table.seek_to_first()?;
        }
        self.skip_exhausted()
    }

    fn seek(&mut self, target: &[u8]) -> Result<()> {
        self.index = find_file(&self.files, target);
        self.load_table()?;
        if let Some(table) = &mut self.table {
            table.seek(target)?;
        }
        self.skip_exhausted()
    }

    fn next(&mut self) -> Result<()> {
        if let Some(table) = &mut self.table {
            table.next()?;
        }
        self.skip_exhausted()
    }

    fn key(&self) -> &[u8] {
        self.table.as_ref().expect("cursor not valid").key()
    }

    fn value(&self) -> &[u8] {
        self.table.as_ref().expect("cursor not valid").value()
    }
}

/// Merges version edits into a base version, preserving per-level ordering:
/// level 0 newest file first, deeper levels by smallest key.
pub struct Builder {
    deleted: [HashSet<u64>; NUM_LEVELS],
    added: [Vec<Arc<FileMetaData>>; NUM_LEVELS],
}

impl Builder {
    pub fn new() -> Self {
        Self {
            deleted: Default::default(),
            added: Default::default(),
        }
    }

    pub fn apply(&mut self, edit: &VersionEdit) {
        for (level, number) in &edit.deleted_files {
            self.deleted[*level].insert(*number);
        }
        for (level, file) in &edit.new_files {
            self.deleted[*level].remove(&file.number);
            self.added[*level].push(Arc::new(FileMetaData::new(
                file.number,
                file.file_size,
                file.smallest.clone(),
                file.largest.clone(),
            )));
        }
    }

    pub fn save(self, base: &Version) -> Version {
        let mut version = Version::empty();
        for level in 0..NUM_LEVELS {
            let mut files: Vec<Arc<FileMetaData>> = base.files[level]
                .iter()
                .filter(|f| !self.deleted[level].contains(&f.number))
                .cloned()
                .collect();
            files.extend(self.added[level].iter().cloned());

            if level == 0 {
                files.sort_by(|a, b| b.number.cmp(&a.number));
            } else {
                files.sort_by(|a, b| a.smallest.cmp(&b.smallest));
            }
            version.files[level] = files;
        }
        version.finalize();
        version
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the current version, the file-number counters, and the manifest.
pub struct VersionSet {
    dir: PathBuf,
    options: Options,
    cache: Arc<TableCache>,

    current: Arc<Version>,
    /// Weak handles to every version that may still be pinned by a reader;
    /// live-file computation walks these.
    live_versions: Vec<Weak<Version>>,

    pub next_file_number: u64,
    pub manifest_file_number: u64,
    pub log_number: u64,
    pub prev_log_number: u64,

    /// Per-level key where the next size compaction should resume.
    compact_pointer: [Option<InternalKey>; NUM_LEVELS],

    manifest: Option<LogWriter>,
}

impl VersionSet {
    pub fn new(dir: PathBuf, options: Options, cache: Arc<TableCache>) -> Self {
        Self {
            dir,
            options,
            cache,
            current: Arc::new(Version::empty()),
            live_versions: Vec::new(),
            next_file_number: 2,
            manifest_file_number: 1,
            log_number: 0,
            prev_log_number: 0,
            compact_pointer: Default::default(),
            manifest: None,
        }
    }

    pub fn current(&self) -> Arc<Version> {
        Arc::clone(&self.current)
    }

    pub fn cache(&self) -> Arc<TableCache> {
        Arc::clone(&self.cache)
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn new_file_number(&mut self) -> u64 {
        let number = self.next_file_number;
        self.next_file_number += 1;
        number
    }

    pub fn mark_file_number_used(&mut self, number: u64) {
        if self.next_file_number <= number {
            self.next_file_number = number + 1;
        }
    }

    /// Replays the manifest named by CURRENT. Returns the last sequence
    /// recorded in the manifest. Corruption here is fatal to open.
    pub fn recover(&mut self) -> Result<u64> {
        let current_path = current_file_name(&self.dir);
        let name = fs::read_to_string(&current_path)
            .map_err(|e| Error::Corruption(format!("cannot read CURRENT: {e}")))?;
        let name = name.trim_end();
        if name.is_empty() {
            return errcorrupt!("CURRENT is empty");
        }

        let mut reader = LogReader::open(&self.dir.join(name))?;
        let mut builder = Builder::new();
        let mut log_number = None;
        let mut prev_log_number = None;
        let mut next_file_number = None;
        let mut last_sequence = None;

        while let Some(record) = reader
            .read_record()
            .map_err(|e| Error::Corruption(format!("manifest {name}: {e}")))?
        {
            let edit = VersionEdit::decode(&record)?;
            builder.apply(&edit);
            for (level, key) in &edit.compact_pointers {
                self.compact_pointer[*level] = Some(key.clone());
            }
            if edit.log_number.is_some() {
                log_number = edit.log_number;
            }
            if edit.prev_log_number.is_some() {
                prev_log_number = edit.prev_log_number;
            }
            if edit.next_file_number.is_some() {
                next_file_number = edit.next_file_number;
            }
            if edit.last_sequence.is_some() {
                last_sequence = edit.last_sequence;
            }
        }

        let next_file_number =
            next_file_number.ok_or_else(|| Error::Corruption("manifest lacks next file number".into()))?;
        self.log_number = log_number.unwrap_or(0);
        self.prev_log_number = prev_log_number.unwrap_or(0);
        self.next_file_number = next_file_number;
        self.mark_file_number_used(self.log_number);
        self.mark_file_number_used(self.prev_log_number);

        let version = builder.save(&Version::empty());
        for level in 0..NUM_LEVELS {
            for file in &version.files[level] {
                self.mark_file_number_used(file.number);
            }
        }
        self.install(version);

        // A fresh manifest is written on the next log_and_apply.
        self.manifest_file_number = self.new_file_number();
        Ok(last_sequence.unwrap_or(0))
    }

    /// Applies the edit to the current version, persists it to the
    /// manifest (creating the manifest and CURRENT on first use), and
    /// installs the result.
    pub fn log_and_apply(&mut self, edit: &mut VersionEdit, last_sequence: u64) -> Result<Arc<Version>> {
        if edit.log_number.is_none() {
            edit.log_number = Some(self.log_number);
        }
        edit.prev_log_number = Some(self.prev_log_number);
        edit.next_file_number = Some(self.next_file_number);
        edit.last_sequence = Some(last_sequence);

        let mut builder = Builder::new();
        builder.apply(edit);
        let version = builder.save(&self.current);

        for (level, key) in &edit.compact_pointers {
            self.compact_pointer[*level] = Some(key.clone());
        }

        let is_new_manifest = self.manifest.is_none();
        if is_new_manifest {
            let path = manifest_file_name(&self.dir, self.manifest_file_number);
            let mut manifest = LogWriter::create(&path)?;
            // Seed the fresh manifest with a snapshot of the current state
            // so it is self-contained.
            let snapshot = self.snapshot_edit();
            manifest.add_record(&snapshot.encode())?;
            self.manifest = Some(manifest);
        }

        let manifest = self.manifest.as_mut().expect("manifest must exist");
        manifest.add_record(&edit.encode())?;
        manifest.sync()?;

        if is_new_manifest {
            self.set_current_file()?;
        }

        self.log_number = edit.log_number.unwrap();
        self.install(version);
        Ok(Arc::clone(&self.current))
    }

    /// Full-state edit used to seed a fresh manifest.
    fn snapshot_edit(&self) -> VersionEdit {
        let mut edit = VersionEdit::new();
        edit.comparator = Some("reefdb.InternalKeyComparator".to_string());
        for (level, key) in self.compact_pointer.iter().enumerate() {
            if let Some(key) = key {
                edit.set_compact_pointer(level, key.clone());
            }
        }
        for level in 0..NUM_LEVELS {
            for file in &self.current.files[level] {
                edit.add_file(
                    level,
                    file.number,
                    file.file_size,
                    file.smallest.clone(),
                    file.largest.clone(),
                );
            }
        }
        edit
    }

    /// Points CURRENT at the active manifest via write-temp-then-rename.
    fn set_current_file(&self) -> Result<()> {
        let manifest_name = format!("MANIFEST-{:06}", self.manifest_file_number);
        let temp_path = self.dir.join(format!("{:06}.dbtmp", self.manifest_file_number));
        {
            let mut temp = fs::File::create(&temp_path)?;
            writeln!(temp, "{manifest_name}")?;
            temp.sync_all()?;
        }
        fs::rename(&temp_path, current_file_name(&self.dir))?;
        Ok(())
    }

    fn install(&mut self, version: Version) {
        let version = Arc::new(version);
        self.live_versions.retain(|weak| weak.strong_count() > 0);
        self.live_versions.push(Arc::downgrade(&version));
        self.current = version;
    }

    /// Table files referenced by any version still pinned in memory.
    pub fn live_files(&self) -> HashSet<u64> {
        let mut live = HashSet::new();
        for weak in &self.live_versions {
            if let Some(version) = weak.upgrade() {
                for level in 0..NUM_LEVELS {
                    for file in &version.files[level] {
                        live.insert(file.number);
                    }
                }
            }
        }
        for level in 0..NUM_LEVELS {
            for file in &self.current.files[level] {
                live.insert(file.number);
            }
        }
        live
    }

    pub fn needs_compaction(&self) -> bool {
        self.current.needs_compaction()
    }

    /// Picks the level and seed inputs for the next compaction: size first
    /// (score >= 1), then seek-triggered.
    pub fn pick_compaction(&mut self) -> Option<super::compaction::Compaction> {
        let current = self.current();
        let size_compaction = current.compaction_score >= 1.0;

        let (level, mut inputs) = if size_compaction {
            let level = current.compaction_level;
            // Resume after the last compacted key at this level, wrapping
            // to the first file when none is larger.
            let pointer = self.compact_pointer[level].as_ref().map(|k| k.encode());
            let seed = current.files[level]
                .iter()
                .find(|f| {
                    pointer.as_ref().map_or(true, |p| {
                        internal_compare(&f.largest.encode(), p) == std::cmp::Ordering::Greater
                    })
                })
                .or_else(|| current.files[level].first())?;
            (level, vec![Arc::clone(seed)])
        } else {
            let (file, level) = current.seek_compaction()?;
            (level, vec![file])
        };

        // Level-0 inputs must include every overlapping level-0 file.
        if level == 0 {
            if let Some((begin, end)) = Version::key_range(&inputs) {
                inputs = current.overlapping_inputs(0, &begin, &end);
            }
        }

        let mut compaction =
            super::compaction::Compaction::new(&self.options, level, Arc::clone(&current));
        compaction.inputs[0] = inputs;
        self.setup_other_inputs(&mut compaction);
        Some(compaction)
    }

    /// Completes a compaction's input set: overlapping files at level+1,
    /// an attempt to grow level-L inputs without widening level+1, and the
    /// grandparent file list for the stop-before rule.
    fn setup_other_inputs(&mut self, c: &mut super::compaction::Compaction) {
        let current = &c.input_version;
        let level = c.level;

        let (smallest, largest) =
            Version::key_range(&c.inputs[0]).expect("compaction inputs are never empty");
        c.inputs[1] = current.overlapping_inputs(level + 1, &smallest, &largest);

        let (mut all_smallest, mut all_largest) = (smallest.clone(), largest.clone());
        if let Some((s, l)) = Version::key_range(&c.inputs[1]) {
            all_smallest = all_smallest.min(s);
            all_largest = all_largest.max(l);
        }

        // Try to grow the level-L side while the level+1 side stays fixed
        // and the total stays under the expansion limit.
        if !c.inputs[1].is_empty() {
            let expanded0 = current.overlapping_inputs(level, &all_smallest, &all_largest);
            let inputs1_size = total_file_size(&c.inputs[1]);
            let expanded0_size = total_file_size(&expanded0);
            if expanded0.len() > c.inputs[0].len()
                && inputs1_size + expanded0_size < expanded_compaction_byte_size_limit(&self.options)
            {
                if let Some((new_smallest, new_largest)) = Version::key_range(&expanded0) {
                    let expanded1 =
                        current.overlapping_inputs(level + 1, &new_smallest, &new_largest);
                    if expanded1.len() == c.inputs[1].len() {
                        tracing::info!(
                            level = level,
                            files_before = c.inputs[0].len(),
                            files_after = expanded0.len(),
                            "Expanding compaction inputs"
                        );
                        c.inputs[0] = expanded0;
                        all_smallest = new_smallest;
                        all_largest = new_largest;
                    }
                }
            }
        }

        if level + 2 < NUM_LEVELS {
            c.grandparents = current.overlapping_inputs(level + 2, &all_smallest, &all_largest);
        }

        // The next size compaction at this level resumes past this range.
        let pointer = c
            .inputs[0]
            .iter()
            .map(|f| f.largest.clone())
            .max()
            .expect("compaction inputs are never empty");
        self.compact_pointer[level] = Some(pointer.clone());
        c.edit.set_compact_pointer(level, pointer);
    }
}
