use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use memmap2::MmapMut;
use tracing::warn;

use crate::common::{Error, Result};

const OFF_WIDTH: u64 = 4;
const POS_WIDTH: u64 = 8;
/// Bytes per index entry: relative offset (u32 BE) then store position (u64 BE).
pub const ENTRY_WIDTH: u64 = OFF_WIDTH + POS_WIDTH;

struct IndexInner {
    // None once closed
    mmap: Option<MmapMut>,
    size: u64,
}

/// Fixed-capacity, memory-mapped offset index of one segment.
///
/// The backing file is grown to `max_index_bytes` up front and mapped once;
/// `size` tracks the bytes actually used. Closing truncates the file back
/// to `size`.
pub struct Index {
    path: PathBuf,
    file: File,
    inner: Mutex<IndexInner>,
}

impl Index {
    pub fn new(path: impl Into<PathBuf>, file: File, max_index_bytes: u64) -> Result<Self> {
        let path = path.into();
        let file_len = file.metadata()?.len();
        file.set_len(max_index_bytes.max(file_len))?;
        // SAFETY: the file is owned by this index for the lifetime of the map
        // and is never resized while mapped.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        let size = recover_size(&mmap, file_len);
        if size != file_len - file_len % ENTRY_WIDTH {
            warn!(
                index = %path.display(),
                file_len,
                size,
                "index-recovered-from-unclean-shutdown"
            );
        }

        Ok(Index {
            path,
            file,
            inner: Mutex::new(IndexInner {
                mmap: Some(mmap),
                size,
            }),
        })
    }

    pub fn name(&self) -> &Path {
        &self.path
    }

    /// Bytes used by written entries.
    pub fn size(&self) -> u64 {
        self.lock().size
    }

    /// Reads the `n`-th entry as `(relative_offset, position)`.
    pub fn read(&self, n: u32) -> Result<(u32, u64)> {
        let inner = self.lock();
        let mmap = inner.mmap.as_ref().ok_or(Error::Closed)?;
        let at = n as u64 * ENTRY_WIDTH;
        if inner.size == 0 || at >= inner.size {
            return Err(Error::Eof);
        }
        Ok(decode_entry(mmap, at))
    }

    /// Reads the last written entry.
    pub fn read_last(&self) -> Result<(u32, u64)> {
        let inner = self.lock();
        let mmap = inner.mmap.as_ref().ok_or(Error::Closed)?;
        if inner.size == 0 {
            return Err(Error::Eof);
        }
        Ok(decode_entry(mmap, inner.size - ENTRY_WIDTH))
    }

    /// Drops trailing entries that point at or past `store_size`.
    ///
    /// The map may reach disk while buffered store frames never did; such
    /// entries reference bytes that do not exist. Returns the number dropped.
    pub fn trim_past(&self, store_size: u64) -> Result<u64> {
        let mut inner = self.lock();
        let mmap = inner.mmap.as_ref().ok_or(Error::Closed)?;
        let mut size = inner.size;
        while size > 0 {
            let (_, pos) = decode_entry(mmap, size - ENTRY_WIDTH);
            if pos < store_size {
                break;
            }
            size -= ENTRY_WIDTH;
        }
        let dropped = (inner.size - size) / ENTRY_WIDTH;
        inner.size = size;
        Ok(dropped)
    }

    pub fn write(&self, off: u32, pos: u64) -> Result<()> {
        let mut inner = self.lock();
        let size = inner.size;
        let mmap = inner.mmap.as_mut().ok_or(Error::Closed)?;
        if (mmap.len() as u64) - size < ENTRY_WIDTH {
            return Err(Error::IndexFull);
        }

        let at = size as usize;
        let off_end = at + OFF_WIDTH as usize;
        mmap[at..off_end].copy_from_slice(&off.to_be_bytes());
        mmap[off_end..at + ENTRY_WIDTH as usize].copy_from_slice(&pos.to_be_bytes());
        inner.size += ENTRY_WIDTH;
        Ok(())
    }

    /// Syncs the map, unmaps it and truncates the file to the used size.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.lock();
        let mmap = match inner.mmap.take() {
            Some(mmap) => mmap,
            None => return Ok(()),
        };
        mmap.flush()?;
        drop(mmap);
        self.file.set_len(inner.size)?;
        self.file.sync_all()?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, IndexInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Index {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(index = %self.path.display(), err = %err, "index-close-on-drop-failed");
        }
    }
}

fn decode_entry(mmap: &[u8], at: u64) -> (u32, u64) {
    let at = at as usize;
    let off_end = at + OFF_WIDTH as usize;
    let mut off = [0u8; OFF_WIDTH as usize];
    let mut pos = [0u8; POS_WIDTH as usize];
    off.copy_from_slice(&mmap[at..off_end]);
    pos.copy_from_slice(&mmap[off_end..at + ENTRY_WIDTH as usize]);
    (u32::from_be_bytes(off), u64::from_be_bytes(pos))
}

/// Logical size of an index whose file is `file_len` bytes long.
///
/// Entries are dense, so entry `i` always carries relative offset `i`, and
/// positions strictly increase. A file left at full capacity by a crash has
/// zeroed slots after the last real entry; those break the sequence and are
/// not counted.
fn recover_size(mmap: &[u8], file_len: u64) -> u64 {
    let entries = file_len / ENTRY_WIDTH;
    let mut n = 0;
    let mut last_pos = None;
    while n < entries {
        let (off, pos) = decode_entry(mmap, n * ENTRY_WIDTH);
        if off as u64 != n || last_pos.map_or(false, |last| pos <= last) {
            break;
        }
        last_pos = Some(pos);
        n += 1;
    }
    n * ENTRY_WIDTH
}
