//! # State History
//!
//! A time-indexed store of attribute values, built in one pass by a single
//! writer and queried by any number of readers, during the build or after.
//!
//! ## Core Concepts
//!
//! - **Attributes**: a growing tree of named paths, each identified by a
//!   stable integer quark
//! - **Intervals**: `[start, end]` ranges during which one attribute held one
//!   value; the intervals of an attribute partition time without gaps
//! - **History tree**: fixed-capacity nodes of closed intervals, sealed once
//!   full and searchable by time
//! - **Builder / state system**: the writer facade and the reader facade over
//!   the same shared structures
//!
//! ## Example
//!
//! ```ignore
//! use state_history::{StateSystemBuilder, StoreConfig};
//!
//! let mut builder = StateSystemBuilder::create(StoreConfig {
//!     path: "./kernel-states".into(),
//!     provider_version: 1,
//!     ..Default::default()
//! })?;
//!
//! let status = builder.get_quark_add(&["Threads", "1234", "Status"])?;
//! builder.modify_attribute(100, "running", status)?;
//! builder.modify_attribute(250, "blocked", status)?;
//! builder.close(400)?;
//!
//! let ss = builder.state_system();
//! let interval = ss.query_single_state(120, status)?;
//! assert_eq!((interval.start, interval.end), (100, 249));
//! ```

pub mod attribute;
pub mod error;
pub mod history;
pub mod ingest;
pub mod snapshot;
pub mod store;
pub mod system;
pub mod types;
pub mod value;

// Re-exports
pub use attribute::{AttributeTree, PARENT, WILDCARD};
pub use error::{Result, StateError};
pub use history::{HistoryConfig, HistoryTree};
pub use ingest::{spawn_writer, Operation, StateCommand, Writer};
pub use snapshot::{Snapshot, SnapshotAttribute, SnapshotInterval, SNAPSHOT_FORMAT_VERSION};
pub use store::{open_or_create, Opened, StorageKind, StoreConfig, MIN_BLOCK_SIZE};
pub use system::{StateSystem, StateSystemBuilder, MAX_STACK_DEPTH};
pub use types::*;
pub use value::{StateValue, ValueType, MAX_STRING_LEN};
