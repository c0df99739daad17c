//! Attribute tree: the dynamic namespace of quarks.
//!
//! Paths are ordered lists of string segments. Each node of the tree gets a
//! quark the first time its path is referenced, and the tree only ever grows.

mod tree;

pub use tree::{AttributeTree, PARENT, WILDCARD};
