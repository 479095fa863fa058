use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::common::{Error, Result};

/// Width of the big-endian length prefix in front of every frame.
pub const LEN_WIDTH: u64 = 8;

struct StoreInner {
    // None once closed
    writer: Option<BufWriter<File>>,
    size: u64,
}

/// Append-only file of `[u64 BE length][payload]` frames.
///
/// Appends go through a buffered writer; every read flushes it first so
/// acknowledged writes are always visible. One lock serializes all calls.
pub struct Store {
    path: PathBuf,
    inner: Mutex<StoreInner>,
}

impl Store {
    /// Wraps a file opened for reading and appending. The current file
    /// length becomes the store size.
    pub fn new(path: impl Into<PathBuf>, file: File) -> Result<Self> {
        let size = file.metadata()?.len();
        Ok(Store {
            path: path.into(),
            inner: Mutex::new(StoreInner {
                writer: Some(BufWriter::new(file)),
                size,
            }),
        })
    }

    pub fn name(&self) -> &Path {
        &self.path
    }

    /// Bytes written so far, flushed or still buffered.
    pub fn size(&self) -> u64 {
        self.lock().size
    }

    /// Appends one frame, returning `(bytes_written, start_position)`.
    pub fn append(&self, data: &[u8]) -> Result<(u64, u64)> {
        let mut inner = self.lock();
        let pos = inner.size;
        let writer = inner.writer.as_mut().ok_or(Error::Closed)?;
        writer.write_all(&(data.len() as u64).to_be_bytes())?;
        writer.write_all(data)?;

        let written = LEN_WIDTH + data.len() as u64;
        inner.size += written;
        Ok((written, pos))
    }

    /// Reads the payload of the frame starting at `pos`.
    pub fn read(&self, pos: u64) -> Result<Vec<u8>> {
        let mut inner = self.lock();
        let size = inner.size;
        let writer = inner.writer.as_mut().ok_or(Error::Closed)?;
        writer.flush()?;

        let file = writer.get_mut();
        file.seek(SeekFrom::Start(pos))?;
        let mut len_buf = [0u8; LEN_WIDTH as usize];
        file.read_exact(&mut len_buf)?;
        let len = u64::from_be_bytes(len_buf);

        // Never trust a length that runs past what was written.
        let end = pos
            .checked_add(LEN_WIDTH)
            .and_then(|start| start.checked_add(len));
        match end {
            Some(end) if end <= size => {}
            _ => {
                return Err(Error::Corrupt(format!(
                    "frame at {} declares {} bytes, store holds {}",
                    pos, len, size
                )))
            }
        }

        let mut data = vec![0u8; len as usize];
        file.read_exact(&mut data)?;
        Ok(data)
    }

    /// Positional read of raw store bytes, frames and all.
    pub fn read_at(&self, buf: &mut [u8], off: u64) -> Result<usize> {
        let mut inner = self.lock();
        let writer = inner.writer.as_mut().ok_or(Error::Closed)?;
        writer.flush()?;
        Ok(read_file_at(writer.get_ref(), buf, off)?)
    }

    /// Flushes and hands out an independent handle to the store file along
    /// with the size at that moment.
    ///
    /// The handle stays readable after `close` and after the file is unlinked.
    pub fn snapshot(&self) -> Result<(File, u64)> {
        let mut inner = self.lock();
        let size = inner.size;
        let writer = inner.writer.as_mut().ok_or(Error::Closed)?;
        writer.flush()?;
        Ok((writer.get_ref().try_clone()?, size))
    }

    /// Flushes buffered frames and releases the file.
    ///
    /// The file is released even when the flush fails; the flush error wins.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.lock();
        let mut writer = match inner.writer.take() {
            Some(writer) => writer,
            None => return Ok(()),
        };
        let flushed = writer.flush();
        let (file, _) = writer.into_parts();
        let synced = file.sync_all();
        drop(file);
        flushed?;
        synced?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        // A poisoned lock still guards a consistent size/writer pair.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(unix)]
pub(crate) fn read_file_at(file: &File, buf: &mut [u8], off: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, off)
}

#[cfg(windows)]
pub(crate) fn read_file_at(file: &File, buf: &mut [u8], off: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, off)
}

/// Splits a byte stream back into store frames.
///
/// A clean end of stream between frames ends the iteration; a stream that
/// stops inside a frame yields an error.
pub struct FrameReader<R> {
    reader: R,
    done: bool,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        FrameReader {
            reader,
            done: false,
        }
    }

    fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let mut len_buf = [0u8; LEN_WIDTH as usize];
        let mut filled = 0;
        while filled < len_buf.len() {
            match self.reader.read(&mut len_buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }

        let len = u64::from_be_bytes(len_buf);
        let mut data = Vec::new();
        let read = (&mut self.reader).take(len).read_to_end(&mut data)?;
        if (read as u64) < len {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        Ok(Some(data))
    }
}

impl<R: Read> Iterator for FrameReader<R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let frame = self.next_frame();
        if !matches!(frame, Ok(Some(_))) {
            self.done = true;
        }
        frame.transpose()
    }
}
