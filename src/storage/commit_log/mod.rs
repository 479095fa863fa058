//! Segmented commit log.
//!
//! A [`Log`] keeps an ordered list of segments in one directory. Only the
//! last segment takes appends; once it is maxed a new one is started right
//! after the write that crossed the limit.
//!
//! ```text
//! <dir>/0.store   0.index      offsets 0..n
//! <dir>/n.store   n.index      offsets n..m   (active)
//! ```

mod config;
mod index;
mod segment;
mod store;

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use atomic_counter::{AtomicCounter, RelaxedCounter};
use tracing::{debug, error, info, warn};

pub use config::{Config, SegmentConfig};
pub use index::ENTRY_WIDTH;
pub use segment::Segment;
pub use store::{FrameReader, Store, LEN_WIDTH};

use crate::common::{Error, Result};
use crate::storage::{BincodeCodec, Codec, Record};

#[derive(Debug)]
struct LogStatus {
    appends: RelaxedCounter,
    reads: RelaxedCounter,
    rotations: RelaxedCounter,
    removed_segments: RelaxedCounter,
}

impl LogStatus {
    fn new() -> Self {
        LogStatus {
            appends: RelaxedCounter::new(0),
            reads: RelaxedCounter::new(0),
            rotations: RelaxedCounter::new(0),
            removed_segments: RelaxedCounter::new(0),
        }
    }
}

/// Point-in-time view of a log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogStats {
    pub segments: usize,
    pub lowest_offset: u64,
    pub highest_offset: u64,
    /// Counters below are per `Log` instance, not persisted.
    pub appends: usize,
    pub reads: usize,
    pub rotations: usize,
    pub removed_segments: usize,
}

pub struct Log<C: Codec = BincodeCodec> {
    dir: PathBuf,
    config: Config,
    codec: C,
    // Ordered by base offset, never empty; the last one is active.
    segments: RwLock<Vec<Segment<C>>>,
    status: LogStatus,
}

impl Log {
    /// Opens the log in `dir` with the bincode record codec.
    pub fn new(dir: impl Into<PathBuf>, config: Config) -> Result<Self> {
        Log::with_codec(dir, config, BincodeCodec)
    }
}

impl<C: Codec> Log<C> {
    pub fn with_codec(dir: impl Into<PathBuf>, config: Config, codec: C) -> Result<Self> {
        config.validate()?;
        let dir = dir.into();
        let segments = open_segments(&dir, &config, &codec)?;
        info!(
            dir = %dir.display(),
            segments = segments.len(),
            "log-opened"
        );
        Ok(Log {
            dir,
            config,
            codec,
            segments: RwLock::new(segments),
            status: LogStatus::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Appends `record` to the active segment and returns its offset.
    ///
    /// A failed rotation does not fail the append that triggered it; the
    /// next append rotates before writing.
    pub fn append(&self, record: Record) -> Result<u64> {
        let mut segments = self.write_segments();
        if active_segment(&mut segments)?.is_maxed() {
            self.rotate(&mut segments)?;
        }

        let active = active_segment(&mut segments)?;
        let off = active.append(record)?;
        self.status.appends.inc();

        if active.is_maxed() {
            if let Err(err) = self.rotate(&mut segments) {
                error!(base_offset = off + 1, err = %err, "segment-rotation-failed");
            }
        }
        Ok(off)
    }

    /// Starts a new active segment right after the current one.
    fn rotate(&self, segments: &mut Vec<Segment<C>>) -> Result<()> {
        let base_offset = active_segment(segments)?.next_offset();
        let segment = Segment::new(&self.dir, base_offset, self.config.segment, self.codec.clone())?;
        segments.push(segment);
        self.status.rotations.inc();
        info!(base_offset, "segment-rotated");
        Ok(())
    }

    pub fn read(&self, off: u64) -> Result<Record> {
        let segments = self.read_segments();
        let (lowest, highest) = offset_range(&segments)?;
        if off < lowest || off > highest {
            return Err(Error::OutOfRange(off));
        }

        let i = segments.partition_point(|s| s.next_offset() <= off);
        let segment = match segments.get(i) {
            Some(segment) if segment.contains(off) => segment,
            _ => return Err(Error::OutOfRange(off)),
        };
        let record = segment.read(off).map_err(|err| match err {
            Error::Eof => Error::OutOfRange(off),
            err => err,
        })?;
        self.status.reads.inc();
        Ok(record)
    }

    pub fn lowest_offset(&self) -> Result<u64> {
        offset_range(&self.read_segments()).map(|(lowest, _)| lowest)
    }

    pub fn highest_offset(&self) -> Result<u64> {
        offset_range(&self.read_segments()).map(|(_, highest)| highest)
    }

    /// Removes every segment whose offsets are all below `lowest`.
    ///
    /// The active segment always stays.
    pub fn truncate(&self, lowest: u64) -> Result<()> {
        let mut segments = self.write_segments();
        let sealed = segments.len().saturating_sub(1);
        // Next offsets increase along the list, so the candidates are a prefix.
        let n = segments[..sealed].partition_point(|s| s.next_offset() <= lowest);
        for segment in segments.drain(..n) {
            let base_offset = segment.base_offset();
            segment.remove()?;
            self.status.removed_segments.inc();
            info!(base_offset, lowest, "segment-truncated");
        }
        Ok(())
    }

    /// Raw store bytes of every segment, in offset order.
    ///
    /// The stream is the on-disk framing (`[u64 BE length][payload]`), parse
    /// it with [`FrameReader`].
    pub fn reader(&self) -> Result<LogReader> {
        let stores = self
            .read_segments()
            .iter()
            .map(|s| s.store().snapshot())
            .collect::<Result<_>>()?;
        Ok(LogReader::new(stores))
    }

    pub fn stats(&self) -> Result<LogStats> {
        let segments = self.read_segments();
        let (lowest_offset, highest_offset) = offset_range(&segments)?;
        Ok(LogStats {
            segments: segments.len(),
            lowest_offset,
            highest_offset,
            appends: self.status.appends.get(),
            reads: self.status.reads.get(),
            rotations: self.status.rotations.get(),
            removed_segments: self.status.removed_segments.get(),
        })
    }

    /// Removes every segment and starts over at `initial_offset`.
    pub fn reset(&self) -> Result<()> {
        let mut segments = self.write_segments();
        for segment in segments.drain(..) {
            segment.remove()?;
            self.status.removed_segments.inc();
        }
        *segments = open_segments(&self.dir, &self.config, &self.codec)?;
        info!(dir = %self.dir.display(), "log-reset");
        Ok(())
    }

    pub fn close(self) -> Result<()> {
        let segments = self.into_segments();
        for segment in segments {
            segment.close()?;
        }
        Ok(())
    }

    /// Closes the log and deletes all of its segment files.
    pub fn remove(self) -> Result<()> {
        let segments = self.into_segments();
        for segment in segments {
            segment.remove()?;
        }
        Ok(())
    }

    fn into_segments(self) -> Vec<Segment<C>> {
        self.segments
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_segments(&self) -> RwLockReadGuard<'_, Vec<Segment<C>>> {
        self.segments.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_segments(&self) -> RwLockWriteGuard<'_, Vec<Segment<C>>> {
        self.segments.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Reopens every segment found in `dir`, or creates the first one.
fn open_segments<C: Codec>(dir: &Path, config: &Config, codec: &C) -> Result<Vec<Segment<C>>> {
    let mut base_offsets = BTreeSet::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_segment_file = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some(segment::STORE_SUFFIX) | Some(segment::INDEX_SUFFIX)
        );
        if !is_segment_file {
            continue;
        }
        match path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.parse::<u64>().ok())
        {
            Some(base_offset) => {
                base_offsets.insert(base_offset);
            }
            None => warn!(file = %path.display(), "skipping-unparsable-segment-file"),
        }
    }

    let mut segments = Vec::with_capacity(base_offsets.len().max(1));
    for base_offset in base_offsets {
        debug!(base_offset, "segment-discovered");
        segments.push(Segment::new(dir, base_offset, config.segment, codec.clone())?);
    }
    if segments.is_empty() {
        segments.push(Segment::new(
            dir,
            config.segment.initial_offset,
            config.segment,
            codec.clone(),
        )?);
    }
    Ok(segments)
}

fn active_segment<C>(segments: &mut [Segment<C>]) -> Result<&mut Segment<C>> {
    segments
        .last_mut()
        .ok_or_else(|| Error::Internal("log has no active segment".to_string()))
}

/// `(lowest, highest)` offsets. A log holding no record at all reports its
/// base offset for both.
fn offset_range<C>(segments: &[Segment<C>]) -> Result<(u64, u64)>
where
    C: Codec,
{
    let (first, last) = match (segments.first(), segments.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => return Err(Error::Internal("log has no segments".to_string())),
    };
    let lowest = first.base_offset();
    let highest = if segments.len() == 1 && last.next_offset() == last.base_offset() {
        lowest
    } else {
        last.next_offset() - 1
    };
    Ok((lowest, highest))
}

/// Sequential reader over the stores of a log.
///
/// Holds its own file handles, sized when the reader was created, so
/// appends, truncation and close do not disturb a read in progress.
pub struct LogReader {
    stores: Vec<(File, u64)>,
    current: usize,
    off: u64,
}

impl LogReader {
    fn new(stores: Vec<(File, u64)>) -> Self {
        LogReader {
            stores,
            current: 0,
            off: 0,
        }
    }
}

impl Read for LogReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while let Some((file, size)) = self.stores.get(self.current) {
            let left = size.saturating_sub(self.off);
            if left > 0 {
                let want = buf.len().min(usize::try_from(left).unwrap_or(usize::MAX));
                let n = store::read_file_at(file, &mut buf[..want], self.off)?;
                if n > 0 {
                    self.off += n as u64;
                    return Ok(n);
                }
            }
            self.current += 1;
            self.off = 0;
        }
        Ok(0)
    }
}
