//! History node store.
//!
//! Closed intervals are grouped into fixed-capacity nodes arranged as a
//! tree keyed by time. Nodes are sealed (closed and written out) once full
//! and never change afterwards.

mod io;
mod node;
mod tree;

pub use io::{TreeHeader, FILE_VERSION, HEADER_SIZE};
pub use node::{Node, NodeLayout};
pub use tree::{HistoryConfig, HistoryTree};
