use super::{Codec, Record};
use crate::common::{Error, Result};

/// Record codec backed by `bincode`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BincodeCodec;

impl BincodeCodec {
    pub fn new() -> Self {
        BincodeCodec
    }
}

impl Codec for BincodeCodec {
    fn encode(&self, record: &Record) -> Result<Vec<u8>> {
        bincode::serialize(record).map_err(|err| Error::Internal(err.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Record> {
        bincode::deserialize(bytes).map_err(|err| Error::Corrupt(err.to_string()))
    }
}
