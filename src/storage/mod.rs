pub mod codec;
pub mod commit_log;

pub use codec::BincodeCodec;

use serde_derive::{Deserialize, Serialize};

use crate::common::Result;

/// A single log entry.
///
/// The payload is opaque to the log. `offset` is assigned by the segment on
/// append and overwritten with the index-derived value on read.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub value: Vec<u8>,
    pub offset: u64,
}

impl Record {
    pub fn new(value: impl Into<Vec<u8>>) -> Self {
        Record {
            value: value.into(),
            offset: 0,
        }
    }
}

pub trait Codec: Clone + Send + Sync {
    // Serializes a record into the bytes of one store frame
    fn encode(&self, record: &Record) -> Result<Vec<u8>>;

    // Deserializes the bytes of one store frame
    fn decode(&self, bytes: &[u8]) -> Result<Record>;
}
