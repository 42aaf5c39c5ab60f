//! Datapools supply journeys with an ordered, indexed stream of data items.
//!
//! A pool is an ordered finite sequence of items checked out in slices by
//! the scheduler.  Pools are either backed by memory ([`IterableDatapool`])
//! or by a line-oriented file with a sidecar seek index ([`FileDatapool`]).
//! The recyclable variants wrap around instead of running dry when a
//! checkout crosses the end of the pool.

use std::sync::Arc;

use stampede_error::{ErrorCodes, StampedeError};
use thiserror::Error;

mod file;

pub use file::{FileDatapool, RecyclableFileDatapool};

/// A lazy stream of checked-out items.
pub type ItemIter = Box<dyn Iterator<Item = String> + Send>;

#[derive(Error, Debug)]
pub enum DatapoolError {
    #[error("start index {start} exceeds datapool length {len}")]
    StartOutOfRange { start: usize, len: usize },
    #[error("stop ({stop}) must be >= start ({start}) for a non-recyclable datapool")]
    StopBeforeStart { start: usize, stop: usize },
    #[error("datapool io: {0}")]
    Io(#[from] std::io::Error),
}

impl StampedeError for DatapoolError {
    fn code(&self) -> ErrorCodes {
        match self {
            DatapoolError::StartOutOfRange { .. } => ErrorCodes::OutOfRange,
            DatapoolError::StopBeforeStart { .. } => ErrorCodes::InvalidArgument,
            DatapoolError::Io(_) => ErrorCodes::Internal,
        }
    }
}

/// An ordered, indexed supply of items consumed by journeys.
///
/// `len` must be cheap after the first call; the scheduler consults it every
/// interval.  The cursor is the next unread position and is only ever moved
/// by the scheduler that owns the pool.
pub trait Datapool: Send {
    fn len(&self) -> Result<usize, DatapoolError>;

    fn is_empty(&self) -> Result<bool, DatapoolError> {
        Ok(self.len()? == 0)
    }

    /// Items in positions `[start, stop)`, 0-based.  `None` reads to the
    /// end.  Recyclable pools wrap when `stop <= start`, yielding
    /// `[start, len)` followed by `[0, stop)`; `stop == start` is one whole
    /// lap of the pool.
    fn checkout(&self, start: usize, stop: Option<usize>) -> Result<ItemIter, DatapoolError>;

    fn cursor(&self) -> usize;

    fn set_cursor(&mut self, cursor: usize);

    fn advance_cursor(&mut self, by: usize) {
        self.set_cursor(self.cursor() + by);
    }
}

/// An in-memory pool.  The source is realized into a vector once at
/// construction so repeated checkouts see a consistent sequence.
pub struct IterableDatapool {
    items: Arc<Vec<String>>,
    cursor: usize,
}

impl IterableDatapool {
    pub fn new<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        IterableDatapool {
            items: Arc::new(items.into_iter().map(Into::into).collect()),
            cursor: 0,
        }
    }

    fn slice(&self, start: usize, stop: usize) -> ItemIter {
        let items = Arc::clone(&self.items);
        let stop = stop.min(items.len());
        let start = start.min(stop);
        Box::new((start..stop).map(move |i| items[i].clone()))
    }
}

impl std::fmt::Debug for IterableDatapool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IterableDatapool")
            .field("len", &self.items.len())
            .field("cursor", &self.cursor)
            .finish()
    }
}

impl Datapool for IterableDatapool {
    fn len(&self) -> Result<usize, DatapoolError> {
        Ok(self.items.len())
    }

    fn checkout(&self, start: usize, stop: Option<usize>) -> Result<ItemIter, DatapoolError> {
        if start > self.items.len() {
            return Err(DatapoolError::StartOutOfRange {
                start,
                len: self.items.len(),
            });
        }
        let stop = stop.unwrap_or(self.items.len());
        if stop < start {
            return Err(DatapoolError::StopBeforeStart { start, stop });
        }
        Ok(self.slice(start, stop))
    }

    fn cursor(&self) -> usize {
        self.cursor
    }

    fn set_cursor(&mut self, cursor: usize) {
        self.cursor = cursor;
    }
}

/// An in-memory pool that wraps around when `stop < start`.
pub struct RecyclableDatapool {
    inner: IterableDatapool,
}

impl RecyclableDatapool {
    pub fn new<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RecyclableDatapool {
            inner: IterableDatapool::new(items),
        }
    }
}

impl std::fmt::Debug for RecyclableDatapool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecyclableDatapool")
            .field("len", &self.inner.items.len())
            .field("cursor", &self.inner.cursor)
            .finish()
    }
}

impl Datapool for RecyclableDatapool {
    fn len(&self) -> Result<usize, DatapoolError> {
        self.inner.len()
    }

    fn checkout(&self, start: usize, stop: Option<usize>) -> Result<ItemIter, DatapoolError> {
        let len = self.inner.items.len();
        if start > len {
            return Err(DatapoolError::StartOutOfRange { start, len });
        }
        match stop {
            // stop == start is a whole lap: [start, len) then [0, start).
            Some(stop) if stop <= start => {
                let head = self.inner.slice(start, len);
                let tail = self.inner.slice(0, stop);
                Ok(Box::new(head.chain(tail)))
            }
            _ => Ok(self.inner.slice(start, stop.unwrap_or(len))),
        }
    }

    fn cursor(&self) -> usize {
        self.inner.cursor
    }

    fn set_cursor(&mut self, cursor: usize) {
        self.inner.cursor = cursor;
    }
}
