//! File-backed datapools.
//!
//! Large line-oriented files are indexed by a hidden sidecar file
//! (`.<basename>.meta`) holding `line_number,byte_offset` rows so a checkout
//! can seek close to its starting line instead of scanning from the top.
//! Line numbers are 1-based and name the line that starts just after the
//! recorded offset.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;

use crate::{Datapool, DatapoolError, ItemIter};

const INDEX_CHUNK_BYTES: usize = 1024 * 1024;
// One index row per million lines keeps the sidecar around 1KB per 1M lines
// while bounding the forward scan after a seek.
const MAX_INDEX_INTERVAL: usize = 1_000_000;

/// A pool over the lines of a file.  The sidecar index is rebuilt when it is
/// missing, older than the data file, or unparseable.
pub struct FileDatapool {
    path: PathBuf,
    meta_path: PathBuf,
    len: OnceCell<usize>,
    cursor: usize,
}

impl FileDatapool {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, DatapoolError> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(DatapoolError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} doesn't exist", path.display()),
            )));
        }
        let meta_path = sidecar_path(&path);
        let pool = FileDatapool {
            path,
            meta_path,
            len: OnceCell::new(),
            cursor: 0,
        };
        if pool.index_is_stale()? {
            pool.build_index()?;
        }
        Ok(pool)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn index_is_stale(&self) -> Result<bool, DatapoolError> {
        if !self.meta_path.exists() {
            return Ok(true);
        }
        let data_mtime = std::fs::metadata(&self.path)?.modified()?;
        let meta_mtime = std::fs::metadata(&self.meta_path)?.modified()?;
        Ok(meta_mtime < data_mtime)
    }

    /// Stream the data file counting newlines, then write an index row every
    /// `min(total_lines, 1M)` lines.
    fn build_index(&self) -> Result<(), DatapoolError> {
        tracing::debug!("building datapool index for {}", self.path.display());
        let mut file = File::open(&self.path)?;
        let mut buf = vec![0u8; INDEX_CHUNK_BYTES];
        let mut line_count = 0usize;
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            line_count += buf[..n].iter().filter(|b| **b == b'\n').count();
        }

        let interval = line_count.min(MAX_INDEX_INTERVAL).max(1);

        let mut reader = BufReader::with_capacity(INDEX_CHUNK_BYTES, File::open(&self.path)?);
        let mut meta = std::io::BufWriter::new(File::create(&self.meta_path)?);
        let mut line = Vec::new();
        let mut line_number = 0usize;
        let mut seek_point = 0u64;
        loop {
            line.clear();
            let n = reader.read_until(b'\n', &mut line)?;
            if n == 0 {
                break;
            }
            line_number += 1;
            seek_point += n as u64;
            if line_number % interval == 0 {
                writeln!(meta, "{},{}", line_number, seek_point)?;
            }
        }
        meta.flush()?;
        Ok(())
    }

    /// The greatest indexed `(line_number, offset)` with `line_number <=
    /// start`.  A malformed index row forces a rebuild and one retry.
    fn seek_closest_point(&self, start: usize) -> Result<(usize, u64), DatapoolError> {
        match self.read_closest_point(start) {
            Ok(point) => Ok(point),
            Err(IndexParseError) => {
                tracing::warn!(
                    "corrupt datapool index {}, rebuilding",
                    self.meta_path.display()
                );
                self.build_index()?;
                self.read_closest_point(start)
                    .map_err(|_| DatapoolError::Io(std::io::Error::other("index rebuild failed")))
            }
        }
    }

    fn read_closest_point(&self, start: usize) -> Result<(usize, u64), IndexParseError> {
        let reader = BufReader::new(File::open(&self.meta_path).map_err(|_| IndexParseError)?);
        let mut closest = (0usize, 0u64);
        for row in reader.lines() {
            let row = row.map_err(|_| IndexParseError)?;
            let (line_number, seek_point) = parse_index_row(&row)?;
            if line_number <= start {
                closest = (line_number, seek_point);
            } else {
                break;
            }
        }
        Ok(closest)
    }

    fn last_index_point(&self) -> Result<(usize, u64), DatapoolError> {
        self.seek_closest_point(usize::MAX)
    }

    fn compute_len(&self) -> Result<usize, DatapoolError> {
        let (line_number, seek_point) = self.last_index_point()?;
        let mut reader = BufReader::new(File::open(&self.path)?);
        reader.seek(SeekFrom::Start(seek_point))?;
        let mut current = line_number;
        let mut line = Vec::new();
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                break;
            }
            current += 1;
        }
        Ok(current)
    }

    /// Lines with 1-based numbers in `(start, stop]`: the first yielded line
    /// is `start + 1`.  In 0-based item positions this is `[start, stop)`.
    fn extract_chunk(
        &self,
        start: usize,
        stop: Option<usize>,
    ) -> Result<LineChunkIter, DatapoolError> {
        let (line_number, seek_point) = if start > 0 {
            self.seek_closest_point(start)?
        } else {
            (0, 0)
        };
        let mut reader = BufReader::new(File::open(&self.path)?);
        reader.seek(SeekFrom::Start(seek_point))?;
        Ok(LineChunkIter {
            reader,
            current_line: line_number,
            start,
            stop,
        })
    }

    fn validated_len(&self) -> Result<usize, DatapoolError> {
        self.len.get_or_try_init(|| self.compute_len()).copied()
    }
}

impl std::fmt::Debug for FileDatapool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileDatapool")
            .field("path", &self.path)
            .field("cursor", &self.cursor)
            .finish()
    }
}

impl Datapool for FileDatapool {
    fn len(&self) -> Result<usize, DatapoolError> {
        self.validated_len()
    }

    fn checkout(&self, start: usize, stop: Option<usize>) -> Result<ItemIter, DatapoolError> {
        let len = self.validated_len()?;
        if start > len {
            return Err(DatapoolError::StartOutOfRange { start, len });
        }
        if let Some(stop) = stop {
            if stop < start {
                return Err(DatapoolError::StopBeforeStart { start, stop });
            }
        }
        Ok(Box::new(self.extract_chunk(start, stop)?))
    }

    fn cursor(&self) -> usize {
        self.cursor
    }

    fn set_cursor(&mut self, cursor: usize) {
        self.cursor = cursor;
    }
}

/// A file pool that wraps around when `stop <= start`, yielding
/// `(start, len]` then `(0, stop]` in line numbers.
pub struct RecyclableFileDatapool {
    inner: FileDatapool,
}

impl RecyclableFileDatapool {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, DatapoolError> {
        Ok(RecyclableFileDatapool {
            inner: FileDatapool::new(path)?,
        })
    }
}

impl std::fmt::Debug for RecyclableFileDatapool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecyclableFileDatapool")
            .field("path", &self.inner.path)
            .field("cursor", &self.inner.cursor)
            .finish()
    }
}

impl Datapool for RecyclableFileDatapool {
    fn len(&self) -> Result<usize, DatapoolError> {
        self.inner.len()
    }

    fn checkout(&self, start: usize, stop: Option<usize>) -> Result<ItemIter, DatapoolError> {
        let len = self.inner.validated_len()?;
        if start > len {
            return Err(DatapoolError::StartOutOfRange { start, len });
        }
        match stop {
            Some(stop) if stop <= start => {
                let head = self.inner.extract_chunk(start, Some(len))?;
                let tail = self.inner.extract_chunk(0, Some(stop))?;
                Ok(Box::new(head.chain(tail)))
            }
            _ => Ok(Box::new(self.inner.extract_chunk(start, stop)?)),
        }
    }

    fn cursor(&self) -> usize {
        self.inner.cursor
    }

    fn set_cursor(&mut self, cursor: usize) {
        self.inner.cursor = cursor;
    }
}

struct IndexParseError;

fn parse_index_row(row: &str) -> Result<(usize, u64), IndexParseError> {
    let (line_number, seek_point) = row.trim().split_once(',').ok_or(IndexParseError)?;
    Ok((
        line_number.parse().map_err(|_| IndexParseError)?,
        seek_point.parse().map_err(|_| IndexParseError)?,
    ))
}

fn sidecar_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.meta", name))
}

/// Reads forward from a seek point, yielding lines whose 1-based number is
/// in `(start, stop]`.  Invalid UTF-8 is replaced, trailing whitespace
/// trimmed.  IO failures mid-stream end the iterator.
struct LineChunkIter {
    reader: BufReader<File>,
    current_line: usize,
    start: usize,
    stop: Option<usize>,
}

impl Iterator for LineChunkIter {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let mut line = Vec::new();
        loop {
            if let Some(stop) = self.stop {
                if self.current_line >= stop {
                    return None;
                }
            }
            line.clear();
            match self.reader.read_until(b'\n', &mut line) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!("datapool read failed mid-checkout: {err}");
                    return None;
                }
            }
            self.current_line += 1;
            if self.current_line > self.start {
                return Some(String::from_utf8_lossy(&line).trim_end().to_string());
            }
        }
    }
}
