//! Error types for snapshot analysis.

use crate::addr::MappedAddr;

/// Errors from snapshot reads, catalog operations, and object decoding
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Address {0} not within any region")]
    OutOfRange(MappedAddr),

    #[error("Read of {size} bytes at {addr} extends beyond end of region")]
    ReadBeyondRegion { addr: MappedAddr, size: u64 },

    #[error("Host address is not within any mapped region")]
    HostAddressOutOfRange,

    #[error("Snapshot contains no regions at {0}")]
    EmptySnapshot(String),

    #[error("Truncated region record at file offset {0:#x}")]
    TruncatedRegionRecord(u64),

    #[error("Base type object not present in analysis data; run find-base-type first")]
    BaseTypeMissing,

    #[error("Type {0:?} is missing from analysis data")]
    MissingType(String),

    #[error("Invalid object: {0}")]
    InvalidObject(&'static str),

    #[error("Scan stride {0:#x} must be a power of two no larger than {1:#x}")]
    BadStride(u64, u64),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Analysis data error: {0}")]
    Persist(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
