//! Version edits: the delta records appended to the manifest.
//!
//! An edit describes one atomic change to the file set: files added and
//! deleted per level, counter updates, and per-level compaction pointers.
//! Replaying the manifest's edits in order reconstructs the current
//! version.
//!
//! # Record Format
//!
//! A tagged sequence of fields, each a varint tag followed by the field
//! payload. Unknown tags are corruption; fields may appear in any order and
//! repeat where that makes sense (compact pointers, deleted files, new
//! files).
//!
//! ```text
//! tag 1: comparator        (length-prefixed string)
//! tag 2: log_number        (varint)
//! tag 3: next_file_number  (varint)
//! tag 4: last_sequence     (varint)
//! tag 5: compact_pointer   (level varint, internal key length-prefixed)
//! tag 6: deleted_file      (level varint, file number varint)
//! tag 7: new_file          (level, number, file_size, smallest, largest)
//! tag 9: prev_log_number   (varint)
//! ```

use super::dbformat::{
    get_length_prefixed, get_varint64, put_length_prefixed, put_varint64, InternalKey, NUM_LEVELS,
};
use crate::errcorrupt;
use crate::error::Result;

const TAG_COMPARATOR: u64 = 1;
const TAG_LOG_NUMBER: u64 = 2;
const TAG_NEXT_FILE_NUMBER: u64 = 3;
const TAG_LAST_SEQUENCE: u64 = 4;
const TAG_COMPACT_POINTER: u64 = 5;
const TAG_DELETED_FILE: u64 = 6;
const TAG_NEW_FILE: u64 = 7;
const TAG_PREV_LOG_NUMBER: u64 = 9;

/// A file added to a level by an edit.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFile {
    pub number: u64,
    pub file_size: u64,
    pub smallest: InternalKey,
    pub largest: InternalKey,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VersionEdit {
    pub comparator: Option<String>,
    pub log_number: Option<u64>,
    pub prev_log_number: Option<u64>,
    pub next_file_number: Option<u64>,
    pub last_sequence: Option<u64>,
    pub compact_pointers: Vec<(usize, InternalKey)>,
    pub deleted_files: Vec<(usize, u64)>,
    pub new_files: Vec<(usize, NewFile)>,
}

impl VersionEdit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(
        &mut self,
        level: usize,
        number: u64,
        file_size: u64,
        smallest: InternalKey,
        largest: InternalKey,
    ) {
        self.new_files.push((
            level,
            NewFile {
                number,
                file_size,
                smallest,
                largest,
            },
        ));
    }

    pub fn delete_file(&mut self, level: usize, number: u64) {
        self.deleted_files.push((level, number));
    }

    pub fn set_compact_pointer(&mut self, level: usize, key: InternalKey) {
        self.compact_pointers.push((level, key));
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();

        if let Some(comparator) = &self.comparator {
            put_varint64(&mut buf, TAG_COMPARATOR);
            put_length_prefixed(&mut buf, comparator.as_bytes());
        }
        if let Some(log_number) = self.log_number {
            put_varint64(&mut buf, TAG_LOG_NUMBER);
            put_varint64(&mut buf, log_number);
        }
        if let Some(prev) = self.prev_log_number {
            put_varint64(&mut buf, TAG_PREV_LOG_NUMBER);
            put_varint64(&mut buf, prev);
        }
        if let Some(next) = self.next_file_number {
            put_varint64(&mut buf, TAG_NEXT_FILE_NUMBER);
            put_varint64(&mut buf, next);
        }
        if let Some(sequence) = self.last_sequence {
            put_varint64(&mut buf, TAG_LAST_SEQUENCE);
            put_varint64(&mut buf, sequence);
        }
        for (level, key) in &self.compact_pointers {
            put_varint64(&mut buf, TAG_COMPACT_POINTER);
            put_varint64(&mut buf, *level as u64);
            put_length_prefixed(&mut buf, &key.encode());
        }
        for (level, number) in &self.deleted_files {
            put_varint64(&mut buf, TAG_DELETED_FILE);
            put_varint64(&mut buf, *level as u64);
            put_varint64(&mut buf, *number);
        }
        for (level, file) in &self.new_files {
            put_varint64(&mut buf, TAG_NEW_FILE);
            put_varint64(&mut buf, *level as u64);
            put_varint64(&mut buf, file.number);
            put_varint64(&mut buf, file.file_size);
            put_length_prefixed(&mut buf, &file.smallest.encode());
            put_length_prefixed(&mut buf, &file.largest.encode());
        }

        buf
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        let mut edit = VersionEdit::new();

        while !buf.is_empty() {
            let (tag, n) = get_varint64(buf)?;
            buf = &buf[n..];

            match tag {
                TAG_COMPARATOR => {
                    let (name, n) = get_length_prefixed(buf)?;
                    buf = &buf[n..];
                    edit.comparator = Some(
                        String::from_utf8(name.to_vec())
                            .map_err(|_| crate::Error::Corruption("comparator name".into()))?,
                    );
                }
                TAG_LOG_NUMBER => {
                    let (value, n) = get_varint64(buf)?;
                    buf = &buf[n..];
                    edit.log_number = Some(value);
                }
                TAG_PREV_LOG_NUMBER => {
                    let (value, n) = get_varint64(buf)?;
                    buf = &buf[n..];
                    edit.prev_log_number = Some(value);
                }
                TAG_NEXT_FILE_NUMBER => {
                    let (value, n) = get_varint64(buf)?;
                    buf = &buf[n..];
                    edit.next_file_number = Some(value);
                }
                TAG_LAST_SEQUENCE => {
                    let (value, n) = get_varint64(buf)?;
                    buf = &buf[n..];
                    edit.last_sequence = Some(value);
                }
                TAG_COMPACT_POINTER => {
                    let (level, n) = decode_level(buf)?;
                    buf = &buf[n..];
                    let (key, n) = get_length_prefixed(buf)?;
                    buf = &buf[n..];
                    edit.compact_pointers.push((level, InternalKey::decode(key)?));
                }
                TAG_DELETED_FILE => {
                    let (level, n) = decode_level(buf)?;
                    buf = &buf[n..];
                    let (number, n) = get_varint64(buf)?;
                    buf = &buf[n..];
                    edit.deleted_files.push((level, number));
                }
                TAG_NEW_FILE => {
                    let (level, n) = decode_level(buf)?;
                    buf = &buf[n..];
                    let (number, n) = get_varint64(buf)?;
                    buf = &buf[n..];
                    let (file_size, n) = get_varint64(buf)?;
                    buf = &buf[n..];
                    let (smallest, n) = get_length_prefixed(buf)?;
                    buf = &buf[n..];
                    let smallest = InternalKey::decode(smallest)?;
                    let (largest, n) = get_length_prefixed(buf)?;
                    buf = &buf[n..];
                    let largest = InternalKey::decode(largest)?;
                    edit.new_files.push((
                        level,
                        NewFile {
                            number,
                            file_size,
                            smallest,
                            largest,
                        },
                    ));
                }
                other => return errcorrupt!("unknown version edit tag: {other}"),
            }
        }

        Ok(edit)
    }
}

fn decode_level(buf: &[u8]) -> Result<(usize, usize)> {
    let (level, n) = get_varint64(buf)?;
    if level as usize >= NUM_LEVELS {
        return errcorrupt!("level out of range: {level}");
    }
    Ok((level as usize, n))
}
