//! Segmented, append-only commit log.
//!
//! Records are appended to the active segment of a [`Log`] and addressed by
//! a log-wide offset. Each segment pairs a length-prefixed store file with a
//! memory-mapped offset index.

pub mod common;
pub mod storage;

pub use common::{Error, Result};
pub use storage::commit_log::{Config, Log, LogReader, LogStats, SegmentConfig};
pub use storage::{BincodeCodec, Codec, Record};
