use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use super::config::SegmentConfig;
use super::index::{Index, ENTRY_WIDTH};
use super::store::Store;
use crate::common::{Error, Result};
use crate::storage::{Codec, Record};

pub const STORE_SUFFIX: &str = "store";
pub const INDEX_SUFFIX: &str = "index";

/// One store file and its index, covering offsets
/// `base_offset..next_offset`.
pub struct Segment<C> {
    store: Arc<Store>,
    index: Index,
    base_offset: u64,
    next_offset: u64,
    config: SegmentConfig,
    codec: C,
}

impl<C: Codec> Segment<C> {
    /// Opens (or creates) `<base_offset>.store` and `<base_offset>.index`
    /// in `dir`, picking `next_offset` up from the last index entry.
    pub fn new(dir: &Path, base_offset: u64, config: SegmentConfig, codec: C) -> Result<Self> {
        let store_path = dir.join(format!("{}.{}", base_offset, STORE_SUFFIX));
        let store_file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&store_path)?;
        let store = Store::new(store_path, store_file)?;

        let index_path = dir.join(format!("{}.{}", base_offset, INDEX_SUFFIX));
        let index_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&index_path)?;
        let index = Index::new(index_path, index_file, config.max_index_bytes)?;

        let dropped = index.trim_past(store.size())?;
        if dropped > 0 {
            warn!(base_offset, dropped, "index-entries-past-store-end");
        }

        let next_offset = match index.read_last() {
            Ok((off, _)) => base_offset + off as u64 + 1,
            Err(Error::Eof) => base_offset,
            Err(err) => return Err(err),
        };
        debug!(base_offset, next_offset, "segment-opened");

        Ok(Segment {
            store: Arc::new(store),
            index,
            base_offset,
            next_offset,
            config,
            codec,
        })
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    /// Offset the next append will get.
    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    pub fn contains(&self, off: u64) -> bool {
        self.base_offset <= off && off < self.next_offset
    }

    pub(crate) fn store(&self) -> Arc<Store> {
        Arc::clone(&self.store)
    }

    /// Stamps `record` with the next offset and writes it.
    pub fn append(&mut self, mut record: Record) -> Result<u64> {
        let cur = self.next_offset;
        let relative = u32::try_from(cur - self.base_offset).map_err(|_| Error::IndexFull)?;
        record.offset = cur;

        let bytes = self.codec.encode(&record)?;
        let (_, pos) = self.store.append(&bytes)?;
        self.index.write(relative, pos)?;

        self.next_offset += 1;
        Ok(cur)
    }

    pub fn read(&self, off: u64) -> Result<Record> {
        if off < self.base_offset {
            return Err(Error::OutOfRange(off));
        }
        let relative = u32::try_from(off - self.base_offset).map_err(|_| Error::OutOfRange(off))?;
        let (_, pos) = self.index.read(relative)?;
        let bytes = self.store.read(pos)?;

        let mut record = self.codec.decode(&bytes)?;
        // The index decides which offset this is, not the payload.
        record.offset = off;
        Ok(record)
    }

    /// Whether the store reached its limit or the index has no room for
    /// another entry.
    pub fn is_maxed(&self) -> bool {
        self.store.size() >= self.config.max_store_bytes
            || self.index.size() + ENTRY_WIDTH > self.config.max_index_bytes
    }

    /// Closes the segment and deletes both of its files.
    pub fn remove(self) -> Result<()> {
        let index_path = self.index.name().to_path_buf();
        let store_path = self.store.name().to_path_buf();
        self.close()?;
        fs::remove_file(index_path)?;
        fs::remove_file(store_path)?;
        Ok(())
    }

    /// Closes the index, then the store.
    pub fn close(self) -> Result<()> {
        self.index.close()?;
        self.store.close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BincodeCodec;

    fn config() -> SegmentConfig {
        SegmentConfig {
            max_store_bytes: 1024,
            max_index_bytes: ENTRY_WIDTH * 3,
            initial_offset: 0,
        }
    }

    #[test]
    fn test_append_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut segment = Segment::new(dir.path(), 16, config(), BincodeCodec).unwrap();
        assert_eq!(segment.base_offset(), 16);
        assert_eq!(segment.next_offset(), 16);
        assert!(!segment.is_maxed());

        for i in 0..3u64 {
            let off = segment.append(Record::new(format!("record-{}", i))).unwrap();
            assert_eq!(off, 16 + i);

            let got = segment.read(off).unwrap();
            assert_eq!(got.value, format!("record-{}", i).into_bytes());
            assert_eq!(got.offset, off);
        }
        assert!(segment.contains(18));
        assert!(!segment.contains(19));

        // Index capacity reached.
        assert!(segment.is_maxed());
        assert_eq!(
            segment.append(Record::new("overflow")),
            Err(Error::IndexFull)
        );
        assert_eq!(segment.read(19), Err(Error::Eof));
        assert_eq!(segment.read(15), Err(Error::OutOfRange(15)));
    }

    #[test]
    fn test_offset_is_assigned() {
        let dir = tempfile::tempdir().unwrap();
        let mut segment = Segment::new(dir.path(), 0, config(), BincodeCodec).unwrap();
        let record = Record {
            value: b"claims 99".to_vec(),
            offset: 99,
        };
        assert_eq!(segment.append(record).unwrap(), 0);
        assert_eq!(segment.read(0).unwrap().offset, 0);
    }

    #[test]
    fn test_maxed_by_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();
        config.max_index_bytes = 1024;
        config.max_store_bytes = 64;

        let mut segment = Segment::new(dir.path(), 0, config, BincodeCodec).unwrap();
        let mut appended = 0;
        while !segment.is_maxed() {
            segment.append(Record::new(vec![7u8; 20])).unwrap();
            appended += 1;
        }
        // Each frame is 8 + 8 (vec len) + 20 + 8 (offset) = 44 bytes.
        assert_eq!(appended, 2);
    }

    #[test]
    fn test_maxed_by_ragged_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();
        // Two entries and change.
        config.max_index_bytes = ENTRY_WIDTH * 2 + 5;

        let mut segment = Segment::new(dir.path(), 0, config, BincodeCodec).unwrap();
        segment.append(Record::new("a")).unwrap();
        assert!(!segment.is_maxed());
        segment.append(Record::new("b")).unwrap();
        assert!(segment.is_maxed());
    }

    #[test]
    fn test_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut segment = Segment::new(dir.path(), 5, config(), BincodeCodec).unwrap();
        segment.append(Record::new("a")).unwrap();
        segment.append(Record::new("b")).unwrap();
        segment.close().unwrap();

        let mut segment = Segment::new(dir.path(), 5, config(), BincodeCodec).unwrap();
        assert_eq!(segment.next_offset(), 7);
        assert_eq!(segment.read(6).unwrap().value, b"b");
        assert_eq!(segment.append(Record::new("c")).unwrap(), 7);
        assert_eq!(segment.read(7).unwrap().value, b"c");
    }

    #[test]
    fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let mut segment = Segment::new(dir.path(), 0, config(), BincodeCodec).unwrap();
        segment.append(Record::new("gone")).unwrap();
        assert!(dir.path().join("0.store").exists());
        assert!(dir.path().join("0.index").exists());

        segment.remove().unwrap();
        assert!(!dir.path().join("0.store").exists());
        assert!(!dir.path().join("0.index").exists());

        let segment = Segment::new(dir.path(), 0, config(), BincodeCodec).unwrap();
        assert_eq!(segment.next_offset(), 0);
        assert_eq!(segment.read(0), Err(Error::Eof));
    }
}
