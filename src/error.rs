//! Error types for the state history store.

use crate::types::Quark;
use crate::value::ValueType;
use thiserror::Error;

/// Main error type for state history operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Attribute not found: {0}")]
    AttributeNotFound(String),

    #[error("Time {time} outside of store range [{start}, {end}]")]
    TimeRange { time: i64, start: i64, end: i64 },

    #[error("State value type mismatch: expected {expected}, got {actual}")]
    StateValueType { expected: ValueType, actual: ValueType },

    #[error("State system has been disposed")]
    Disposed,

    #[error("Out of order insertion: time {time} is before latest committed time {latest}")]
    OutOfOrderInsertion { time: i64, latest: i64 },

    #[error("State history is sealed, no further writes accepted")]
    Sealed,

    #[error("Pop of empty stack on attribute {0}")]
    EmptyStack(Quark),

    #[error("Stack depth limit reached on attribute {0}")]
    StackOverflow(Quark),

    #[error("Interval of {size} bytes does not fit in a node (capacity {capacity})")]
    IntervalTooLarge { size: usize, capacity: usize },

    #[error("Invalid interval: start {start} is after end {end}")]
    InvalidInterval { start: i64, end: i64 },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,

    #[error("Snapshot rejected: {0}")]
    SnapshotRejected(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl StateError {
    /// Whether this error means a persisted history can't be used as-is and
    /// should be rebuilt from the event stream.
    pub fn needs_rebuild(&self) -> bool {
        match self {
            StateError::Io(e) => e.kind() == std::io::ErrorKind::NotFound
                || e.kind() == std::io::ErrorKind::UnexpectedEof,
            StateError::Deserialization(_)
            | StateError::Corruption(_)
            | StateError::InvalidFormat(_)
            | StateError::ChecksumMismatch { .. }
            | StateError::VersionMismatch { .. }
            | StateError::NotInitialized => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for StateError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            StateError::Serialization(e.to_string())
        } else {
            StateError::Deserialization(e.to_string())
        }
    }
}

impl From<rmp_serde::encode::Error> for StateError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StateError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StateError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StateError::Deserialization(e.to_string())
    }
}

/// Result type for state history operations.
pub type Result<T> = std::result::Result<T, StateError>;
