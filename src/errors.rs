//! Error taxonomy for the storage engine.
//!
//! Domain-specific enums carry the variants callers actually need to match
//! on (retry on version mismatch, surface budget exhaustion); everything
//! else is wrapped in [`anyhow::Error`] at the facade boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("no size class fits a request of {0} bytes")]
    NoSizeClassFor(usize),
    #[error("budget exhausted: virtual bytes {virtual_bytes} + region {region_size} would exceed max {max_buffer_size}")]
    BudgetExhausted {
        virtual_bytes: usize,
        region_size: usize,
        max_buffer_size: usize,
    },
    #[error("release of unregistered segment address {0:#x}")]
    UnknownSegment(usize),
    #[error("virtual reservation failed: {0}")]
    MapFailed(#[source] nix::Error),
    #[error("physical release failed: {0}")]
    UnmapFailed(#[source] nix::Error),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("contract violation: {0}")]
    ContractViolation(&'static str),
    #[error("nested compute on cache key already locked by this thread")]
    NestedCompute,
}

#[derive(Debug, Error)]
pub enum TxnError {
    #[error("page guard version mismatch, observed {observed} current {current}; restart the read")]
    VersionMismatch { observed: u32, current: u32 },
    #[error("revision epoch tracker exhausted ({capacity} slots in use)")]
    EpochTrackerFull { capacity: usize },
    #[error("nested compute on the same cache key within one transaction")]
    NestedCompute,
    #[error("resource {0} already has a live writer transaction; exactly one writer per resource is allowed")]
    WriterBusy(u64),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Txn(#[from] TxnError),
    #[error("page corrupt: {0}")]
    Corrupt(String),
}
