//! Immutable sorted table files.
//!
//! # File Layout
//!
//! ```text
//! +---------------------+
//! | data block 1        |
//! +---------------------+
//! | ...                 |
//! +---------------------+
//! | data block N        |
//! +---------------------+
//! | filter block        |  (optional bloom filter over user keys)
//! +---------------------+
//! | meta-index block    |  (filter name -> handle)
//! +---------------------+
//! | index block         |  (last key of block -> handle)
//! +---------------------+
//! | footer (48 bytes)   |
//! +---------------------+
//! ```
//!
//! Every block on disk is followed by a 5-byte trailer:
//! `crc32c(u32 LE) || compression_type(u8)`, the checksum covering the
//! stored block contents and the compression byte. The footer holds varint
//! handles for the meta-index and index blocks, zero-padded to 40 bytes,
//! then the table magic.
//!
//! The index block maps the last key of each data block to its handle, so a
//! seek binary-searches the index, loads one data block, and scans a
//! restart run.

use byteorder::{ByteOrder, LittleEndian};
use crc::{Crc, CRC_32_ISCSI};
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::block::{Block, BlockBuilder, BlockCursor};
use super::dbformat::{
    extract_user_key, get_varint64, internal_compare, put_varint64,
};
use super::filter::BloomFilter;
use super::iterator::Cursor;
use crate::config::{Compression, Options};
use crate::errcorrupt;
use crate::error::Result;
use crate::Error;

pub const TABLE_MAGIC: u64 = 0xdb4775248b80fb57;
pub const FOOTER_SIZE: usize = 48;
const BLOCK_TRAILER_SIZE: usize = 5;
const FILTER_NAME: &[u8] = b"filter.bloom";

const COMPRESSION_NONE: u8 = 0;
const COMPRESSION_SNAPPY: u8 = 1;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Location of a block within the table file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        put_varint64(buf, self.offset);
        put_varint64(buf, self.size);
    }

    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let (offset, n) = get_varint64(buf)?;
        let (size, m) = get_varint64(&buf[n..])?;
        Ok((Self { offset, size }, n + m))
    }
}

struct Footer {
    metaindex: BlockHandle,
    index: BlockHandle,
}

impl Footer {
    fn encode(&self) -> [u8; FOOTER_SIZE] {
        let mut handles = Vec::with_capacity(FOOTER_SIZE);
        self.metaindex.encode_to(&mut handles);
        self.index.encode_to(&mut handles);
        handles.resize(FOOTER_SIZE - 8, 0);

        let mut buf = [0u8; FOOTER_SIZE];
        buf[..FOOTER_SIZE - 8].copy_from_slice(&handles);
        LittleEndian::write_u64(&mut buf[FOOTER_SIZE - 8..], TABLE_MAGIC);
        buf
    }

    fn decode(buf: &[u8; FOOTER_SIZE]) -> Result<Self> {
        let magic = LittleEndian::read_u64(&buf[FOOTER_SIZE - 8..]);
        if magic != TABLE_MAGIC {
            return errcorrupt!("bad table magic: {:#x}", magic);
        }
        let (metaindex, n) = BlockHandle::decode(&buf[..FOOTER_SIZE - 8])?;
        let (index, _) = BlockHandle::decode(&buf[n..FOOTER_SIZE - 8])?;
        Ok(Self { metaindex, index })
    }
}

/// Builds a table file from entries added in internal-key order.
pub struct TableBuilder {
    writer: BufWriter<File>,
    file: File,
    block_size: usize,
    restart_interval: usize,
    compression: Compression,
    filter_bits: Option<u32>,

    data_block: BlockBuilder,
    index_entries: Vec<(Vec<u8>, BlockHandle)>,
    filter_keys: Vec<Vec<u8>>,
    offset: u64,
    num_entries: u64,
    finished: bool,
}

impl TableBuilder {
    pub fn create(path: &Path, options: &Options) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file.try_clone()?),
            file,
            block_size: options.block_size,
            restart_interval: options.block_restart_interval,
            compression: options.compression,
            filter_bits: options.filter_bits_per_key,
            data_block: BlockBuilder::new(options.block_restart_interval),
            index_entries: Vec::new(),
            filter_keys: Vec::new(),
            offset: 0,
            num_entries: 0,
            finished: false,
        })
    }

    /// Appends an entry. Keys are encoded internal keys in strictly
    /// increasing order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.finished {
            return Err(Error::ReadOnly);
        }
        if self.filter_bits.is_some() {
            self.filter_keys.push(extract_user_key(key).to_vec());
        }
        self.data_block.add(key, value);
        self.num_entries += 1;

        if self.data_block.size_estimate() >= self.block_size {
            self.flush_data_block()?;
        }
        Ok(())
    }

    fn flush_data_block(&mut self) -> Result<()> {
        if self.data_block.is_empty() {
            return Ok(());
        }
        let last_key = self.data_block.last_key().to_vec();
        let block = std::mem::replace(
            &mut self.data_block,
            BlockBuilder::new(self.restart_interval),
        );
        let handle = self.write_block(&block.finish(), self.compression)?;
        self.index_entries.push((last_key, handle));
        Ok(())
    }

    fn write_block(&mut self, contents: &[u8], compression: Compression) -> Result<BlockHandle> {
        let (stored, ctype): (std::borrow::Cow<[u8]>, u8) = match compression {
            Compression::None => (contents.into(), COMPRESSION_NONE),
            Compression::Snappy => {
                let compressed = snap::raw::Encoder::new()
                    .compress_vec(contents)
                    .map_err(|e| Error::Io(e.to_string()))?;
                // Keep the raw bytes when compression does not pay for itself.
                if compressed.len() < contents.len() {
                    (compressed.into(), COMPRESSION_SNAPPY)
                } else {
                    (contents.into(), COMPRESSION_NONE)
                }
            }
        };

        let mut digest = CRC32.digest();
        digest.update(&stored);
        digest.update(&[ctype]);
        let mut trailer = [0u8; BLOCK_TRAILER_SIZE];
        LittleEndian::write_u32(&mut trailer[..4], digest.finalize());
        trailer[4] = ctype;

        let handle = BlockHandle {
            offset: self.offset,
            size: stored.len() as u64,
        };
        self.writer.write_all(&stored)?;
        self.writer.write_all(&trailer)?;
        self.offset += stored.len() as u64 + BLOCK_TRAILER_SIZE as u64;
        Ok(handle)
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Current on-disk size plus the pending data block.
    pub fn estimated_size(&self) -> u64 {
        self.offset + self.data_block.size_estimate() as u64
    }

    /// Writes the filter, meta-index, index, and footer; syncs the file;
    /// returns the final file size.
    pub fn finish(&mut self) -> Result<u64> {
        if self.finished {
            return Err(Error::ReadOnly);
        }
        self.flush_data_block()?;
        self.finished = true;

        // Filter and meta-index blocks are stored uncompressed.
        let mut metaindex = BlockBuilder::new(self.restart_interval);
        if let Some(bits) = self.filter_bits {
            let filter = BloomFilter::build(&self.filter_keys, bits);
            let handle = self.write_block(&filter.encode(), Compression::None)?;
            let mut encoded = Vec::new();
            handle.encode_to(&mut encoded);
            metaindex.add(FILTER_NAME, &encoded);
        }
        let metaindex_handle = self.write_block(&metaindex.finish(), Compression::None)?;

        let mut index = BlockBuilder::new(1);
        for (last_key, handle) in std::mem::take(&mut self.index_entries) {
            let mut encoded = Vec::new();
            handle.encode_to(&mut encoded);
            index.add(&last_key, &encoded);
        }
        let index_handle = self.write_block(&index.finish(), Compression::None)?;

        let footer = Footer {
            metaindex: metaindex_handle,
            index: index_handle,
        };
        self.writer.write_all(&footer.encode())?;
        self.offset += FOOTER_SIZE as u64;

        self.writer.flush()?;
        self.file.sync_all()?;
        Ok(self.offset)
    }
}

/// An open table: footer and index parsed, filter loaded.
pub struct Table {
    file: Mutex<File>,
    index: Arc<Block>,
    filter: Option<BloomFilter>,
}

impl Table {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_size = file.metadata()?.len();
        if file_size < FOOTER_SIZE as u64 {
            return errcorrupt!("table file too short: {} bytes", file_size);
        }

        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let mut footer_buf = [0u8; FOOTER_SIZE];
        file.read_exact(&mut footer_buf)?;
        let footer = Footer::decode(&footer_buf)?;

        let index = Arc::new(Block::new(read_block(&mut file, footer.index)?)?);

        // The filter is optional; a missing or unreadable meta entry only
        // costs the filter's read savings.
        let mut filter = None;
        let metaindex = Arc::new(Block::new(read_block(&mut file, footer.metaindex)?)?);
        let mut cursor = metaindex.cursor(bytewise_compare);
        cursor.seek_to_first()?;
        while cursor.valid() {
            if cursor.key() == FILTER_NAME {
                let (handle, _) = BlockHandle::decode(cursor.value())?;
                filter = BloomFilter::decode(&read_block(&mut file, handle)?);
            }
            cursor.next()?;
        }

        Ok(Self {
            file: Mutex::new(file),
            index,
            filter,
        })
    }

    /// Finds the first entry >= target. Returns the entry's encoded
    /// internal key and value; the caller decides whether the user key
    /// actually matches.
    pub fn get(&self, target: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if let Some(filter) = &self.filter {
            if !filter.may_contain(extract_user_key(target)) {
                return Ok(None);
            }
        }

        let mut index_cursor = self.index.cursor(internal_compare);
        index_cursor.seek(target)?;
        if !index_cursor.valid() {
            return Ok(None);
        }

        let (handle, _) = BlockHandle::decode(index_cursor.value())?;
        let block = Arc::new(Block::new(self.read_block_at(handle)?)?);
        let mut cursor = block.cursor(internal_compare);
        cursor.seek(target)?;
        if cursor.valid() {
            Ok(Some((cursor.key().to_vec(), cursor.value().to_vec())))
        } else {
            Ok(None)
        }
    }

    fn read_block_at(&self, handle: BlockHandle) -> Result<Vec<u8>> {
        let mut file = self.file.lock()?;
        read_block(&mut file, handle)
    }

    /// Cursor over all entries in the table.
    pub fn cursor(self: &Arc<Self>) -> TableCursor {
        TableCursor {
            table: Arc::clone(self),
            index: self.index.cursor(internal_compare),
            data: None,
        }
    }
}

fn bytewise_compare(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
    a.cmp(b)
}

/// Reads a block's contents, verifying the trailer checksum and
/// decompressing as needed.
fn read_block(file: &mut File, handle: BlockHandle) -> Result<Vec<u8>> {
    let total = handle.size as usize + BLOCK_TRAILER_SIZE;
    let mut buf = vec![0u8; total];
    file.seek(SeekFrom::Start(handle.offset))?;
    file.read_exact(&mut buf)?;

    let contents = &buf[..handle.size as usize];
    let trailer = &buf[handle.size as usize..];
    let stored_crc = LittleEndian::read_u32(&trailer[..4]);
    let ctype = trailer[4];

    let mut digest = CRC32.digest();
    digest.update(contents);
    digest.update(&[ctype]);
    if digest.finalize() != stored_crc {
        return errcorrupt!("block checksum mismatch at offset {}", handle.offset);
    }

    match ctype {
        COMPRESSION_NONE => Ok(contents.to_vec()),
        COMPRESSION_SNAPPY => snap::raw::Decoder::new()
            .decompress_vec(contents)
            .map_err(|e| Error::Corruption(format!("snappy decompress failed: {e}"))),
        other => errcorrupt!("unknown block compression: {other}"),
    }
}

/// Two-level cursor: the index block positions a data-block cursor.
pub struct TableCursor {
    table: Arc<Table>,
    index: BlockCursor,
    data: Option<BlockCursor>,
}

impl TableCursor {
    fn load_data_block(&mut self) -> Result<()> {
        if !self.index.valid() {
            self.data = None;
            return Ok(());
        }
        let (handle, _) = BlockHandle::decode(self.index.value())?;
        let block = Arc::new(Block::new(self.table.read_block_at(handle)?)?);
        self.data = Some(block.cursor(internal_compare));
        Ok(())
    }

    /// Steps the index forward until the data cursor is valid or the index
    /// is exhausted.
    fn skip_empty_blocks(&mut self) -> Result<()> {
        while self.data.as_ref().map_or(false, |d| !d.valid()) {
            self.index.next()?;
            self.load_data_block()?;
            if let Some(data) = &mut self.data {
                data.seek_to_first()?;
            }
        }
        Ok(())
    }
}

impl Cursor for TableCursor {
    fn valid(&self) -> bool {
        self.data.as_ref().map_or(false, |d| d.valid())
    }

    fn seek_to_first(&mut self) -> Result<()> {
        self.index.seek_to_first()?;
        self.load_data_block()?;
        if let Some(data) = &mut self.data {
            data.seek_to_first()?;
        }
        self.skip_empty_blocks()
    }

    fn seek(&mut self, target: &[u8]) -> Result<()> {
        self.index.seek(target)?;
        self.load_data_block()?;
        if let Some(data) = &mut self.data {
            data.seek(target)?;
        }
        self.skip_empty_blocks()
    }

    fn next(&mut self) -> Result<()> {
        if let Some(data) = &mut self.data {
            data.next()?;
        }
        self.skip_empty_blocks()
    }

    fn key(&self) -> &[u8] {
        self.data.as_ref().expect("cursor not valid").key()
    }

    fn value(&self) -> &[u8] {
        self.data.as_ref().expect("cursor not valid").value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::dbformat::{InternalKey, ValueKind};
    use crate::tmpfs::NamedTempFile;

    fn ikey(user_key: &[u8], sequence: u64) -> Vec<u8> {
        InternalKey::new(user_key.to_vec(), sequence, ValueKind::Put).encode()
    }

    fn build_table(
        entries: &[(Vec<u8>, Vec<u8>)],
        options: &Options,
    ) -> (NamedTempFile, Arc<Table>) {
        let temp = NamedTempFile::new().expect("Failed to create temp file");
        let mut builder = TableBuilder::create(temp.path(), options).expect("Failed to create");
        for (key, value) in entries {
            builder.add(key, value).expect("Failed to add");
        }
        builder.finish().expect("Failed to finish");
        let table = Arc::new(Table::open(temp.path()).expect("Failed to open"));
        (temp, table)
    }

    fn sample_entries(n: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
        (0..n)
            .map(|i| {
                (
                    ikey(format!("key_{:05}", i).as_bytes(), 1),
                    format!("value_{:05}", i).into_bytes(),
                )
            })
            .collect()
    }

    #[test]
    fn test_write_and_read_back() {
        let entries = sample_entries(500);
        // Small blocks so the table has many of them.
        let options = Options::default().block_size(256);
        let (_temp, table) = build_table(&entries, &options);

        for (key, value) in &entries {
            let (found_key, found_value) = table
                .get(key)
                .expect("Error during read")
                .expect("Key not found");
            assert_eq!(&found_key, key);
            assert_eq!(&found_value, value);
        }
    }

    #[test]
    fn test_get_missing_key() {
        let entries = sample_entries(100);
        let options = Options::default().block_size(256);
        let (_temp, table) = build_table(&entries, &options);

        // Seek lands on the next larger key; the user key differs.
        let result = table.get(&ikey(b"key_00050_missing", 1)).unwrap();
        if let Some((found_key, _)) = result {
            assert_ne!(extract_user_key(&found_key), b"key_00050_missing");
        }

        // Past the last key there is nothing to land on.
        assert!(table.get(&ikey(b"zzz", 1)).unwrap().is_none());
    }

    #[test]
    fn test_cursor_full_scan() {
        let entries = sample_entries(300);
        let options = Options::default().block_size(128);
        let (_temp, table) = build_table(&entries, &options);

        let mut cursor = table.cursor();
        cursor.seek_to_first().unwrap();
        let mut count = 0;
        while cursor.valid() {
            assert_eq!(cursor.key(), entries[count].0.as_slice());
            assert_eq!(cursor.value(), entries[count].1.as_slice());
            cursor.next().unwrap();
            count += 1;
        }
        assert_eq!(count, entries.len());
    }

    #[test]
    fn test_cursor_seek() {
        let entries = sample_entries(200);
        let options = Options::default().block_size(128);
        let (_temp, table) = build_table(&entries, &options);

        let mut cursor = table.cursor();
        cursor.seek(&entries[117].0).unwrap();
        assert!(cursor.valid());
        assert_eq!(cursor.key(), entries[117].0.as_slice());

        // Seek to a key between entries lands on the next one.
        cursor.seek(&ikey(b"key_00117x", 1)).unwrap();
        assert!(cursor.valid());
        assert_eq!(cursor.key(), entries[118].0.as_slice());
    }

    #[test]
    fn test_compression_none_roundtrip() {
        let entries = sample_entries(200);
        let options = Options::default()
            .block_size(256)
            .compression(Compression::None);
        let (_temp, table) = build_table(&entries, &options);

        for (key, value) in entries.iter().step_by(17) {
            let (_, found) = table.get(key).unwrap().expect("Key not found");
            assert_eq!(&found, value);
        }
    }

    #[test]
    fn test_no_filter_roundtrip() {
        let entries = sample_entries(100);
        let options = Options::default()
            .block_size(256)
            .filter_bits_per_key(None);
        let (_temp, table) = build_table(&entries, &options);
        assert!(table.filter.is_none());

        for (key, value) in entries.iter().step_by(11) {
            let (_, found) = table.get(key).unwrap().expect("Key not found");
            assert_eq!(&found, value);
        }
    }

    #[test]
    fn test_corrupt_magic_rejected() {
        let entries = sample_entries(10);
        let temp = NamedTempFile::new().expect("Failed to create temp file");
        let options = Options::default();
        let mut builder = TableBuilder::create(temp.path(), &options).unwrap();
        for (key, value) in &entries {
            builder.add(key, value).unwrap();
        }
        builder.finish().unwrap();

        // Stomp the magic number at the end of the footer.
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(temp.path())
            .unwrap();
        let len = file.metadata().unwrap().len();
        use std::os::unix::fs::FileExt;
        file.write_at(&[0xff; 8], len - 8).unwrap();

        match Table::open(temp.path()) {
            Err(Error::Corruption(msg)) => assert!(msg.contains("magic")),
            other => panic!("Expected corruption, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_corrupt_block_checksum_rejected() {
        let entries = sample_entries(50);
        let temp = NamedTempFile::new().expect("Failed to create temp file");
        let options = Options::default().compression(Compression::None);
        let mut builder = TableBuilder::create(temp.path(), &options).unwrap();
        for (key, value) in &entries {
            builder.add(key, value).unwrap();
        }
        builder.finish().unwrap();

        // Flip a byte at the start of the first data block.
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(temp.path())
            .unwrap();
        use std::os::unix::fs::FileExt;
        file.write_at(&[0xff], 2).unwrap();

        let table = Table::open(temp.path()).expect("index/footer are intact");
        match table.get(&entries[0].0) {
            Err(Error::Corruption(msg)) => assert!(msg.contains("checksum")),
            other => panic!("Expected corruption, got {:?}", other.map(|_| ())),
        }
    }
}
