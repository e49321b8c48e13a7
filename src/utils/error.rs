//! Error types for vload

use std::io;
use thiserror::Error;

use crate::timer::TimerId;

/// Top-level application error
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Object pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Timer queue error: {0}")]
    Timer(#[from] TimerError),

    #[error("Pacing error: {0}")]
    Pacing(#[from] PacingError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Allocation of {what} failed")]
    Alloc { what: &'static str },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Histogram error: {0}")]
    Histogram(#[from] hdrhistogram::CreationError),

    #[error("Batch error: {0}")]
    Batch(String),
}

/// Fixed object pool errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Failed to allocate a block of {count} objects")]
    AllocFailed { count: usize },

    #[error("Pool released with {outstanding} objects still taken")]
    Outstanding { outstanding: usize },

    #[error("Handle {0} does not belong to this pool")]
    BadHandle(usize),

    #[error("Handle {0} returned while not taken")]
    NotTaken(usize),
}

/// Priority timer queue errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimerError {
    #[error("Periodic timer period {period}ms is below the {min}ms resolution")]
    PeriodTooShort { period: u64, min: u64 },

    #[error("Timer {0} not found")]
    NotFound(TimerId),

    #[error("Timer heap allocation failed")]
    HeapAlloc,

    #[error("Pool: {0}")]
    Pool(#[from] PoolError),
}

/// Pacing controller errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacingError {
    #[error("Free client list overflow: client {client} (capacity {capacity})")]
    FreeListOverflow { client: usize, capacity: usize },

    #[error("Free client list underflow")]
    FreeListUnderflow,

    #[error("Client {0} is already in the free list")]
    AlreadyFree(usize),

    #[error("{ticks} rate ticks per second do not divide 1000ms into periods of at least {min}ms")]
    TickRate { ticks: u32, min: u64 },
}

/// Configuration validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read { path: String, source: io::Error },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("URL {index}: {reason}")]
    Url { index: usize, reason: String },

    #[error("No URLs configured")]
    NoUrls,
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Transport-level errors reported per client
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Client {0} already has a fetch in flight")]
    Busy(usize),

    #[error("Cannot resolve {0}")]
    Resolve(String),

    #[error("Unsupported URL {0}")]
    BadUrl(String),

    #[error("Transport has no poll registry")]
    Unregistered,

    #[error("Connect failed: {0}")]
    Connect(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, LoaderError>;
