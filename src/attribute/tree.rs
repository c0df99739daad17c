//! Arena-backed attribute tree.

use crate::error::{Result, StateError};
use crate::types::Quark;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

/// Pattern segment matching any single path segment.
pub const WILDCARD: &str = "*";

/// Pattern segment moving to the parent attribute.
pub const PARENT: &str = "..";

/// Magic bytes for attribute tree files.
const TREE_MAGIC: &[u8; 4] = b"ATR\0";

/// Current attribute tree format version.
const TREE_VERSION: u8 = 1;

/// Upper bound for a persisted tree body (sanity check).
const MAX_TREE_BYTES: u64 = 1 << 30;

#[derive(Debug)]
struct AttributeNode {
    name: String,
    parent: Option<Quark>,
    children: Vec<Quark>,
    child_index: HashMap<String, Quark>,
}

/// Persisted form of one attribute, in quark order.
#[derive(Serialize, Deserialize)]
struct PersistedAttribute {
    parent: Option<u32>,
    name: String,
}

/// Mapping from attribute paths to quarks.
///
/// Nodes live in an arena indexed by quark. The root is implicit and has no
/// quark; top-level attributes have `parent == None`.
#[derive(Debug, Default)]
pub struct AttributeTree {
    nodes: Vec<AttributeNode>,
    roots: Vec<Quark>,
    root_index: HashMap<String, Quark>,
}

impl AttributeTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of attributes (and so the next quark to be assigned).
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Get the quark for an absolute path, creating every missing node.
    ///
    /// Idempotent: an existing path returns its quark and creates nothing.
    pub fn get_quark_add<S: AsRef<str>>(&mut self, path: &[S]) -> Result<Quark> {
        if path.is_empty() {
            return Err(StateError::AttributeNotFound("empty attribute path".into()));
        }
        self.get_quark_relative_add(None, path)
    }

    /// Get the quark for a path below `parent` (or the root when `None`),
    /// creating every missing node. An empty path returns `parent` itself.
    pub fn get_quark_relative_add<S: AsRef<str>>(
        &mut self,
        parent: Option<Quark>,
        path: &[S],
    ) -> Result<Quark> {
        if let Some(p) = parent {
            self.check(p)?;
        }
        let mut current = parent;
        for segment in path {
            let segment = segment.as_ref();
            current = Some(match self.child(current, segment) {
                Some(q) => q,
                None => self.add_child(current, segment),
            });
        }
        current.ok_or_else(|| StateError::AttributeNotFound("empty attribute path".into()))
    }

    /// Look up an absolute path without creating anything.
    pub fn opt_quark<S: AsRef<str>>(&self, path: &[S]) -> Option<Quark> {
        if path.is_empty() {
            return None;
        }
        self.opt_quark_relative(None, path)
    }

    /// Look up a path below `parent` without creating anything.
    pub fn opt_quark_relative<S: AsRef<str>>(
        &self,
        parent: Option<Quark>,
        path: &[S],
    ) -> Option<Quark> {
        if let Some(p) = parent {
            if p.index() >= self.nodes.len() {
                return None;
            }
        }
        let mut current = parent;
        for segment in path {
            current = Some(self.child(current, segment.as_ref())?);
        }
        current
    }

    /// Quarks whose absolute path matches `pattern`.
    ///
    /// `*` matches any single segment and `..` moves to the parent. Matching
    /// is depth-exact. Results are deduplicated, in first-seen order.
    pub fn quarks_matching<S: AsRef<str>>(&self, pattern: &[S]) -> Vec<Quark> {
        self.quarks_matching_from(None, pattern)
    }

    /// Like [`AttributeTree::quarks_matching`], relative to `start`.
    pub fn quarks_matching_from<S: AsRef<str>>(
        &self,
        start: Option<Quark>,
        pattern: &[S],
    ) -> Vec<Quark> {
        let mut found = Vec::new();
        let mut seen = HashSet::new();

        if let Some(s) = start {
            if s.index() >= self.nodes.len() {
                return found;
            }
        }
        if pattern.is_empty() {
            if let Some(s) = start {
                found.push(s);
            }
            return found;
        }

        self.collect_matching(start, pattern, &mut found, &mut seen);
        found
    }

    fn collect_matching<S: AsRef<str>>(
        &self,
        at: Option<Quark>,
        pattern: &[S],
        found: &mut Vec<Quark>,
        seen: &mut HashSet<Quark>,
    ) {
        let (element, rest) = match pattern.split_first() {
            Some(split) => split,
            None => {
                if let Some(q) = at {
                    if seen.insert(q) {
                        found.push(q);
                    }
                }
                return;
            }
        };

        match element.as_ref() {
            WILDCARD => {
                for &child in self.children_of(at) {
                    self.collect_matching(Some(child), rest, found, seen);
                }
            }
            PARENT => {
                // The implicit root has no parent and no quark.
                if let Some(q) = at {
                    let parent = self.nodes[q.index()].parent;
                    if parent.is_some() || !rest.is_empty() {
                        self.collect_matching(parent, rest, found, seen);
                    }
                }
            }
            name => {
                if let Some(child) = self.child(at, name) {
                    self.collect_matching(Some(child), rest, found, seen);
                }
            }
        }
    }

    /// Children of `quark` (or of the root when `None`), in insertion order.
    /// With `recursive`, the whole subtree in depth-first pre-order.
    pub fn sub_attributes(&self, quark: Option<Quark>, recursive: bool) -> Result<Vec<Quark>> {
        if let Some(q) = quark {
            self.check(q)?;
        }
        let mut out = Vec::new();
        self.push_children(quark, recursive, &mut out);
        Ok(out)
    }

    fn push_children(&self, quark: Option<Quark>, recursive: bool, out: &mut Vec<Quark>) {
        for &child in self.children_of(quark) {
            out.push(child);
            if recursive {
                self.push_children(Some(child), true, out);
            }
        }
    }

    /// Last path segment of `quark`.
    pub fn name(&self, quark: Quark) -> Result<&str> {
        Ok(&self.node(quark)?.name)
    }

    /// Parent of `quark`, `None` for top-level attributes.
    pub fn parent(&self, quark: Quark) -> Result<Option<Quark>> {
        Ok(self.node(quark)?.parent)
    }

    /// Full path of `quark` from the root.
    pub fn full_path(&self, quark: Quark) -> Result<Vec<String>> {
        let mut path = Vec::new();
        let mut current = Some(quark);
        while let Some(q) = current {
            let node = self.node(q)?;
            path.push(node.name.clone());
            current = node.parent;
        }
        path.reverse();
        Ok(path)
    }

    /// Full path joined with `/`.
    pub fn full_path_string(&self, quark: Quark) -> Result<String> {
        Ok(self.full_path(quark)?.join("/"))
    }

    // --- Persistence ---

    /// Write the whole tree as one block, tagged with the provider version.
    pub fn save(&self, path: impl AsRef<Path>, provider_version: u32) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;

        let persisted: Vec<PersistedAttribute> = self
            .nodes
            .iter()
            .map(|n| PersistedAttribute {
                parent: n.parent.map(|p| p.0),
                name: n.name.clone(),
            })
            .collect();
        let encoded = rmp_serde::to_vec(&persisted)?;

        file.write_all(TREE_MAGIC)?;
        file.write_all(&[TREE_VERSION])?;
        file.write_all(&provider_version.to_le_bytes())?;
        file.write_all(&(encoded.len() as u64).to_le_bytes())?;
        file.write_all(&encoded)?;
        file.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;

        file.sync_all()?;
        Ok(())
    }

    /// Read a tree written by [`AttributeTree::save`].
    ///
    /// A provider version other than `expected_version` is reported as
    /// [`StateError::VersionMismatch`].
    pub fn load(path: impl AsRef<Path>, expected_version: u32) -> Result<Self> {
        let mut file = File::open(path.as_ref())?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != TREE_MAGIC {
            return Err(StateError::InvalidFormat("Invalid attribute tree magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != TREE_VERSION {
            return Err(StateError::InvalidFormat(format!(
                "Unsupported attribute tree version: {}",
                version[0]
            )));
        }

        let mut provider = [0u8; 4];
        file.read_exact(&mut provider)?;
        let provider_version = u32::from_le_bytes(provider);
        if provider_version != expected_version {
            return Err(StateError::VersionMismatch {
                expected: expected_version,
                found: provider_version,
            });
        }

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes);
        if len > MAX_TREE_BYTES {
            return Err(StateError::Corruption("Attribute tree too large".into()));
        }

        let mut encoded = vec![0u8; len as usize];
        file.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let expected = u32::from_le_bytes(checksum_bytes);
        let got = crc32fast::hash(&encoded);
        if expected != got {
            return Err(StateError::ChecksumMismatch { expected, got });
        }

        let persisted: Vec<PersistedAttribute> = rmp_serde::from_slice(&encoded)?;
        let mut tree = AttributeTree::new();
        for (i, attr) in persisted.into_iter().enumerate() {
            let parent = attr.parent.map(Quark);
            if let Some(p) = parent {
                if p.index() >= i {
                    return Err(StateError::Corruption(format!(
                        "Attribute {} references parent {} out of order",
                        i, p
                    )));
                }
            }
            tree.add_child(parent, &attr.name);
        }
        Ok(tree)
    }

    // --- Private Helpers ---

    fn child(&self, parent: Option<Quark>, name: &str) -> Option<Quark> {
        match parent {
            None => self.root_index.get(name).copied(),
            Some(p) => self.nodes.get(p.index())?.child_index.get(name).copied(),
        }
    }

    fn children_of(&self, quark: Option<Quark>) -> &[Quark] {
        match quark {
            None => &self.roots,
            Some(q) => self
                .nodes
                .get(q.index())
                .map(|n| n.children.as_slice())
                .unwrap_or(&[]),
        }
    }

    fn add_child(&mut self, parent: Option<Quark>, name: &str) -> Quark {
        let quark = Quark(self.nodes.len() as u32);
        self.nodes.push(AttributeNode {
            name: name.to_string(),
            parent,
            children: Vec::new(),
            child_index: HashMap::new(),
        });

        match parent {
            None => {
                self.roots.push(quark);
                self.root_index.insert(name.to_string(), quark);
            }
            Some(p) => {
                let node = &mut self.nodes[p.index()];
                node.children.push(quark);
                node.child_index.insert(name.to_string(), quark);
            }
        }
        quark
    }

    fn node(&self, quark: Quark) -> Result<&AttributeNode> {
        self.nodes
            .get(quark.index())
            .ok_or_else(|| StateError::AttributeNotFound(format!("quark {}", quark)))
    }

    fn check(&self, quark: Quark) -> Result<()> {
        self.node(quark).map(|_| ())
    }
}
