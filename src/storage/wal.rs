//! Write-ahead log: an append-only record log over fixed 32 KiB blocks.
//!
//! The same record format backs the data log (replayed into a memtable on
//! open) and the manifest (replayed into a version on open).
//!
//! # File Format
//!
//! The file is a sequence of 32 KiB physical blocks. A record never spans a
//! block header: records that do not fit in the remaining block space are
//! fragmented, and a block tail smaller than a header is zero-filled.
//!
//! ```text
//! +-------------+------------+---------+-----------------+
//! |checksum:u32 | length:u16 | type:u8 | payload         |
//! +-------------+------------+---------+-----------------+
//! |   4 bytes   |  2 bytes   | 1 byte  | variable length |
//! +-------------+------------+---------+-----------------+
//! ```
//!
//! - type is Full, First, Middle, or Last, describing the fragment's place
//!   in its logical record
//! - checksum is CRC-32/iSCSI over type and payload
//! - multi-byte integers are little-endian
//!
//! # Recovery
//!
//! Replay stops cleanly at a truncated tail (the bytes a crash cut off were
//! never acknowledged). A checksum mismatch is corruption and aborts the
//! replay with a diagnostic.

use byteorder::{ByteOrder, LittleEndian};
use crc::{Crc, CRC_32_ISCSI};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::errcorrupt;
use crate::error::Result;
use crate::Error;

pub const BLOCK_SIZE: usize = 32 * 1024;
pub const RECORD_HEADER_SIZE: usize = 7;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const FULL: u8 = 1;
const FIRST: u8 = 2;
const MIDDLE: u8 = 3;
const LAST: u8 = 4;

/// Appends records to a log file. A single writer owns the file; group
/// commit batches several records between `sync` calls.
pub struct LogWriter {
    writer: BufWriter<File>,
    file: File,
    path: PathBuf,
    block_offset: usize,
}

impl LogWriter {
    /// Creates a new log file, truncating any existing file at the path.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file.try_clone()?),
            file,
            path: path.to_path_buf(),
            block_offset: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one logical record, fragmenting across blocks as needed.
    pub fn add_record(&mut self, payload: &[u8]) -> Result<()> {
        let mut left = payload;
        let mut begin = true;

        loop {
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < RECORD_HEADER_SIZE {
                // Zero-fill the tail; readers skip it.
                if leftover > 0 {
                    const ZEROES: [u8; RECORD_HEADER_SIZE] = [0; RECORD_HEADER_SIZE];
                    self.writer.write_all(&ZEROES[..leftover])?;
                }
                self.block_offset = 0;
            }

            let available = BLOCK_SIZE - self.block_offset - RECORD_HEADER_SIZE;
            let fragment_len = left.len().min(available);
            let end = fragment_len == left.len();

            let record_type = match (begin, end) {
                (true, true) => FULL,
                (true, false) => FIRST,
                (false, true) => LAST,
                (false, false) => MIDDLE,
            };

            self.emit_record(record_type, &left[..fragment_len])?;
            left = &left[fragment_len..];
            begin = false;
            if end {
                return Ok(());
            }
        }
    }

    fn emit_record(&mut self, record_type: u8, fragment: &[u8]) -> Result<()> {
        let mut digest = CRC32.digest();
        digest.update(&[record_type]);
        digest.update(fragment);

        let mut header = [0u8; RECORD_HEADER_SIZE];
        LittleEndian::write_u32(&mut header[0..4], digest.finalize());
        LittleEndian::write_u16(&mut header[4..6], fragment.len() as u16);
        header[6] = record_type;

        self.writer.write_all(&header)?;
        self.writer.write_all(fragment)?;
        self.block_offset += RECORD_HEADER_SIZE + fragment.len();
        Ok(())
    }

    /// Pushes buffered records to the OS without fsync.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flushes and fsyncs the file.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

/// Reads logical records back from a log file.
pub struct LogReader {
    reader: File,
    block: Vec<u8>,
    block_len: usize,
    block_pos: usize,
    eof: bool,
}

impl LogReader {
    pub fn open(path: &Path) -> Result<Self> {
        let reader = File::open(path)?;
        Ok(Self {
            reader,
            block: vec![0u8; BLOCK_SIZE],
            block_len: 0,
            block_pos: 0,
            eof: false,
        })
    }

    /// Reads the next logical record. Returns Ok(None) at a clean end of
    /// log, which includes a tail truncated by a crash.
    pub fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        let mut assembled: Option<Vec<u8>> = None;

        loop {
            let fragment = match self.read_fragment()? {
                Some(f) => f,
                None => {
                    // A dangling First/Middle fragment means the Last
                    // fragment was cut off by a crash; drop the partial
                    // record like the truncated tail it is.
                    return Ok(None);
                }
            };

            match fragment.0 {
                FULL => {
                    if assembled.is_some() {
                        return errcorrupt!("full record inside fragmented record");
                    }
                    return Ok(Some(fragment.1));
                }
                FIRST => {
                    if assembled.is_some() {
                        return errcorrupt!("first fragment inside fragmented record");
                    }
                    assembled = Some(fragment.1);
                }
                MIDDLE => match assembled.as_mut() {
                    Some(buf) => buf.extend_from_slice(&fragment.1),
                    None => return errcorrupt!("middle fragment without first"),
                },
                LAST => match assembled.take() {
                    Some(mut buf) => {
                        buf.extend_from_slice(&fragment.1);
                        return Ok(Some(buf));
                    }
                    None => return errcorrupt!("last fragment without first"),
                },
                other => return errcorrupt!("invalid record type: {other}"),
            }
        }
    }

    /// Reads the next physical fragment, refilling the block buffer as
    /// needed. Returns Ok(None) at end of file or a truncated tail.
    fn read_fragment(&mut self) -> Result<Option<(u8, Vec<u8>)>> {
        loop {
            if self.block_len - self.block_pos < RECORD_HEADER_SIZE {
                // Remainder is block padding; move to the next block.
                if !self.refill_block()? {
                    return Ok(None);
                }
                continue;
            }

            let header = &self.block[self.block_pos..self.block_pos + RECORD_HEADER_SIZE];
            let stored_crc = LittleEndian::read_u32(&header[0..4]);
            let length = LittleEndian::read_u16(&header[4..6]) as usize;
            let record_type = header[6];

            if record_type == 0 && length == 0 {
                // Zero-filled block tail.
                if !self.refill_block()? {
                    return Ok(None);
                }
                continue;
            }

            let data_start = self.block_pos + RECORD_HEADER_SIZE;
            if data_start + length > self.block_len {
                // The fragment body was cut off mid-write.
                return Ok(None);
            }

            let payload = &self.block[data_start..data_start + length];
            let mut digest = CRC32.digest();
            digest.update(&[record_type]);
            digest.update(payload);
            if digest.finalize() != stored_crc {
                return Err(Error::Corruption(format!(
                    "log record checksum mismatch at block offset {}",
                    self.block_pos
                )));
            }

            let payload = payload.to_vec();
            self.block_pos = data_start + length;
            return Ok(Some((record_type, payload)));
        }
    }

    /// Loads the next physical block. Returns false at end of file.
    fn refill_block(&mut self) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }
        let mut filled = 0;
        while filled < BLOCK_SIZE {
            let n = self.reader.read(&mut self.block[filled..])?;
            if n == 0 {
                self.eof = true;
                break;
            }
            filled += n;
        }
        self.block_len = filled;
        self.block_pos = 0;
        Ok(filled > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::NamedTempFile;
    use std::io::{Seek, SeekFrom, Write};

    fn roundtrip(records: &[Vec<u8>]) -> Vec<Vec<u8>> {
        let temp = NamedTempFile::new().expect("Failed to create temp file");
        {
            let mut writer = LogWriter::create(temp.path()).expect("Failed to create writer");
            for record in records {
                writer.add_record(record).expect("Failed to append");
            }
            writer.sync().expect("Failed to sync");
        }

        let mut reader = LogReader::open(temp.path()).expect("Failed to open reader");
        let mut out = Vec::new();
        while let Some(record) = reader.read_record().expect("Failed to read") {
            out.push(record);
        }
        out
    }

    #[test]
    fn test_append_and_replay() {
        let records = vec![b"one".to_vec(), b"two".to_vec(), Vec::new(), b"three".to_vec()];
        assert_eq!(roundtrip(&records), records);
    }

    #[test]
    fn test_record_spanning_blocks() {
        // Large enough to need First/Middle/Last fragments.
        let big = vec![0xabu8; BLOCK_SIZE * 3 + 1234];
        let records = vec![b"before".to_vec(), big.clone(), b"after".to_vec()];
        let replayed = roundtrip(&records);
        assert_eq!(replayed.len(), 3);
        assert_eq!(replayed[1].len(), big.len());
        assert_eq!(replayed, records);
    }

    #[test]
    fn test_block_boundary_padding() {
        // Records sized so a header would not fit in the block tail.
        let near_block = vec![7u8; BLOCK_SIZE - RECORD_HEADER_SIZE - 3];
        let records = vec![near_block, b"next-block".to_vec()];
        assert_eq!(roundtrip(&records), records);
    }

    #[test]
    fn test_truncated_tail_is_clean_end() {
        let temp = NamedTempFile::new().expect("Failed to create temp file");
        {
            let mut writer = LogWriter::create(temp.path()).expect("Failed to create writer");
            writer.add_record(b"kept").expect("Failed to append");
            writer.add_record(b"truncated-away").expect("Failed to append");
            writer.sync().expect("Failed to sync");
        }

        // Cut the file mid-way through the second record's body.
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(temp.path())
            .unwrap();
        let len = file.metadata().unwrap().len();
        file.set_len(len - 5).unwrap();

        let mut reader = LogReader::open(temp.path()).expect("Failed to open reader");
        assert_eq!(reader.read_record().unwrap(), Some(b"kept".to_vec()));
        assert_eq!(reader.read_record().unwrap(), None);
    }

    #[test]
    fn test_checksum_mismatch_is_corruption() {
        let temp = NamedTempFile::new().expect("Failed to create temp file");
        {
            let mut writer = LogWriter::create(temp.path()).expect("Failed to create writer");
            writer.add_record(b"record-one").expect("Failed to append");
            writer.add_record(b"record-two").expect("Failed to append");
            writer.sync().expect("Failed to sync");
        }

        // Flip payload bytes of the first record without touching length.
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(temp.path())
            .unwrap();
        file.seek(SeekFrom::Start(RECORD_HEADER_SIZE as u64)).unwrap();
        file.write_all(b"XX").unwrap();
        file.sync_all().unwrap();

        let mut reader = LogReader::open(temp.path()).expect("Failed to open reader");
        match reader.read_record() {
            Err(Error::Corruption(msg)) => assert!(msg.contains("checksum")),
            other => panic!("Expected corruption, got: {:?}", other),
        }
    }

    #[test]
    fn test_empty_log() {
        let temp = NamedTempFile::new().expect("Failed to create temp file");
        {
            let mut writer = LogWriter::create(temp.path()).expect("Failed to create writer");
            writer.sync().expect("Failed to sync");
        }
        let mut reader = LogReader::open(temp.path()).expect("Failed to open reader");
        assert_eq!(reader.read_record().unwrap(), None);
    }
}
