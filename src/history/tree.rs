//! The history tree: a time-ordered tree of fixed-capacity nodes.
//!
//! Only the nodes on the "latest branch" (root to rightmost leaf) are open.
//! An interval goes into the deepest latest-branch node that started at or
//! before it. When that node is full, it is sealed together with its
//! descendants and replaced by fresh siblings starting right after the
//! current tree end; when the root itself would need a sibling the tree
//! grows a new root.

use super::io::{NodeFile, TreeHeader};
use super::node::{interval_size, stored_size, Node, NodeLayout};
use crate::error::{Result, StateError};
use crate::types::{Interval, Quark};
use crate::value::{StateValue, MAX_STRING_LEN};
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Construction parameters of a history tree.
#[derive(Clone, Copy, Debug)]
pub struct HistoryConfig {
    pub start_time: i64,
    pub block_size: usize,
    pub max_children: usize,
    pub provider_version: u32,
    pub cache_size: usize,
}

enum Backend {
    Memory(RwLock<Vec<Option<Arc<Node>>>>),
    File(NodeFile),
}

impl Backend {
    fn write_node(&self, node: Arc<Node>) -> Result<()> {
        match self {
            Backend::Memory(nodes) => {
                let mut nodes = nodes.write();
                let index = node.seq() as usize;
                if nodes.len() <= index {
                    nodes.resize(index + 1, None);
                }
                nodes[index] = Some(node);
                Ok(())
            }
            Backend::File(file) => file.write_node(node),
        }
    }

    fn read_node(&self, seq: u32) -> Result<Arc<Node>> {
        match self {
            Backend::Memory(nodes) => nodes
                .read()
                .get(seq as usize)
                .cloned()
                .flatten()
                .ok_or_else(|| StateError::Corruption(format!("Missing history node {}", seq))),
            Backend::File(file) => file.read_node(seq),
        }
    }
}

struct TreeState {
    /// Open nodes from the root down to the current leaf. Empty once the
    /// tree was reopened from a sealed file.
    latest_branch: Vec<Node>,
    root_seq: u32,
    node_count: u32,
    /// Largest end time of any inserted interval.
    end: i64,
    built: bool,
}

impl TreeState {
    fn open_node(&self, seq: u32) -> Option<&Node> {
        self.latest_branch.iter().find(|n| n.seq() == seq)
    }

    fn next_seq(&mut self) -> u32 {
        let seq = self.node_count;
        self.node_count += 1;
        seq
    }
}

/// Time-indexed store of closed intervals.
pub struct HistoryTree {
    config: HistoryConfig,
    layout: NodeLayout,
    state: RwLock<TreeState>,
    backend: Backend,
}

impl HistoryTree {
    /// Create an empty tree held in memory.
    pub fn in_memory(config: HistoryConfig) -> Result<Self> {
        Ok(Self::new(config, Backend::Memory(RwLock::new(Vec::new()))))
    }

    /// Create an empty tree backed by a new node file at `path`.
    pub fn create(path: impl AsRef<Path>, config: HistoryConfig) -> Result<Self> {
        let header = TreeHeader {
            provider_version: config.provider_version,
            block_size: config.block_size as u32,
            max_children: config.max_children as u32,
            node_count: 1,
            root_seq: 0,
            start_time: config.start_time,
            end_time: config.start_time,
            built: false,
        };
        let file = NodeFile::create(path.as_ref(), &header, config.cache_size)?;
        debug!(path = %path.as_ref().display(), "Created history node file");
        Ok(Self::new(config, Backend::File(file)))
    }

    fn new(config: HistoryConfig, backend: Backend) -> Self {
        Self {
            config,
            layout: NodeLayout {
                block_size: config.block_size,
                max_children: config.max_children,
            },
            state: RwLock::new(TreeState {
                latest_branch: vec![Node::leaf(0, None, config.start_time)],
                root_seq: 0,
                node_count: 1,
                end: config.start_time,
                built: false,
            }),
            backend,
        }
    }

    /// Reopen a sealed node file.
    ///
    /// Fails with `VersionMismatch` when the file was written for another
    /// provider version, and with `Corruption` when it was never sealed.
    pub fn open(path: impl AsRef<Path>, provider_version: u32, cache_size: usize) -> Result<Self> {
        let (file, header) = NodeFile::open(path.as_ref(), cache_size)?;

        if header.provider_version != provider_version {
            return Err(StateError::VersionMismatch {
                expected: provider_version,
                found: header.provider_version,
            });
        }
        if !header.built {
            return Err(StateError::Corruption(
                "History file was never sealed".into(),
            ));
        }

        let config = HistoryConfig {
            start_time: header.start_time,
            block_size: header.block_size as usize,
            max_children: header.max_children as usize,
            provider_version,
            cache_size,
        };
        info!(
            path = %path.as_ref().display(),
            nodes = header.node_count,
            end = header.end_time,
            "Opened history"
        );

        Ok(Self {
            config,
            layout: header.layout(),
            state: RwLock::new(TreeState {
                latest_branch: Vec::new(),
                root_seq: header.root_seq,
                node_count: header.node_count,
                end: header.end_time,
                built: true,
            }),
            backend: Backend::File(file),
        })
    }

    pub fn start_time(&self) -> i64 {
        self.config.start_time
    }

    pub fn end_time(&self) -> i64 {
        self.state.read().end
    }

    pub fn provider_version(&self) -> u32 {
        self.config.provider_version
    }

    pub fn is_built(&self) -> bool {
        self.state.read().built
    }

    pub fn node_count(&self) -> u32 {
        self.state.read().node_count
    }

    /// Number of levels from the root to the latest leaf.
    pub fn depth(&self) -> Result<usize> {
        let state = self.state.read();
        if !state.latest_branch.is_empty() {
            return Ok(state.latest_branch.len());
        }
        let mut depth = 1;
        let mut seq = state.root_seq;
        while let Some(child) = self.with_node(&state, seq, |n| n.latest_child())? {
            depth += 1;
            seq = child;
        }
        Ok(depth)
    }

    /// Largest interval payload a node can take.
    pub fn max_interval_size(&self) -> usize {
        // Core nodes have the smaller capacity; any interval must fit there
        // so that insertion into an ancestor always terminates.
        self.layout.capacity(false)
    }

    /// Fails with `IntervalTooLarge` when no node could store an interval
    /// holding `value`.
    pub fn check_value_fits(&self, value: &StateValue) -> Result<()> {
        let size = stored_size(value);
        if let StateValue::String(s) = value {
            if s.len() > MAX_STRING_LEN {
                return Err(StateError::IntervalTooLarge {
                    size,
                    capacity: MAX_STRING_LEN,
                });
            }
        }
        let capacity = self.max_interval_size();
        if size > capacity {
            return Err(StateError::IntervalTooLarge { size, capacity });
        }
        Ok(())
    }

    // --- Insertion ---

    /// Insert a closed interval.
    ///
    /// Intervals must arrive in non-decreasing end time.
    pub fn insert(&self, interval: Interval) -> Result<()> {
        let mut state = self.state.write();
        if state.built {
            return Err(StateError::Sealed);
        }
        if interval.start < self.config.start_time {
            return Err(StateError::TimeRange {
                time: interval.start,
                start: self.config.start_time,
                end: state.end,
            });
        }
        if interval.end < state.end {
            return Err(StateError::OutOfOrderInsertion {
                time: interval.end,
                latest: state.end,
            });
        }
        self.check_value_fits(&interval.value)?;

        let end = interval.end;
        let leaf = state.latest_branch.len() - 1;
        self.try_insert_at(&mut state, interval, leaf)?;
        state.end = state.end.max(end);
        Ok(())
    }

    fn try_insert_at(&self, state: &mut TreeState, interval: Interval, mut index: usize) -> Result<()> {
        let size = interval_size(&interval);
        loop {
            let node = &mut state.latest_branch[index];
            if interval.start < node.start() {
                // The root starts at the tree start, so this always stops.
                index -= 1;
                continue;
            }
            if node.free_space(&self.layout) >= size {
                node.add_interval(interval);
                return Ok(());
            }
            self.add_sibling(state, index)?;
            index = state.latest_branch.len() - 1;
        }
    }

    /// Seal the latest-branch nodes from `index` down and replace them with
    /// fresh siblings.
    fn add_sibling(&self, state: &mut TreeState, index: usize) -> Result<()> {
        if index == 0 {
            return self.add_new_root(state);
        }
        let parent_full = state.latest_branch[index - 1].children().len() >= self.layout.max_children;
        if parent_full {
            return self.add_sibling(state, index - 1);
        }

        let split_time = state.end;
        let depth = state.latest_branch.len();
        self.seal_from(state, index, split_time)?;

        let mut parent_seq = state.latest_branch[index - 1].seq();
        for level in index..depth {
            let seq = state.next_seq();
            let node = if level == depth - 1 {
                Node::leaf(seq, Some(parent_seq), split_time + 1)
            } else {
                Node::core(seq, Some(parent_seq), split_time + 1)
            };
            state.latest_branch[level - 1].link_child(seq, split_time + 1);
            state.latest_branch.push(node);
            parent_seq = seq;
        }
        Ok(())
    }

    fn add_new_root(&self, state: &mut TreeState) -> Result<()> {
        let split_time = state.end;
        let depth = state.latest_branch.len();

        let root_seq = state.next_seq();
        let mut new_root = Node::core(root_seq, None, self.config.start_time);
        let old_root = &mut state.latest_branch[0];
        old_root.set_parent(root_seq);
        new_root.link_child(old_root.seq(), old_root.start());

        self.seal_from(state, 0, split_time)?;

        state.latest_branch.push(new_root);
        state.root_seq = root_seq;
        let mut parent_seq = root_seq;
        for level in 1..=depth {
            let seq = state.next_seq();
            let node = if level == depth {
                Node::leaf(seq, Some(parent_seq), split_time + 1)
            } else {
                Node::core(seq, Some(parent_seq), split_time + 1)
            };
            state.latest_branch[level - 1].link_child(seq, split_time + 1);
            state.latest_branch.push(node);
            parent_seq = seq;
        }

        info!(root = root_seq, depth = depth + 1, "History tree grew a new root");
        Ok(())
    }

    /// Close and write out every latest-branch node from `index` down,
    /// removing them from the branch.
    fn seal_from(&self, state: &mut TreeState, index: usize, end: i64) -> Result<()> {
        for mut node in state.latest_branch.drain(index..) {
            node.close(end);
            debug!(seq = node.seq(), start = node.start(), end, "Sealed history node");
            self.backend.write_node(Arc::new(node))?;
        }
        Ok(())
    }

    /// Seal the whole tree at `end` (at least the current tree end).
    pub fn close(&self, end: i64) -> Result<()> {
        let mut state = self.state.write();
        if state.built {
            return Err(StateError::Sealed);
        }
        let end = end.max(state.end);

        // Sealed copies stay in the latest branch until the header is out,
        // so readers never lose sight of them.
        for node in state.latest_branch.iter_mut() {
            node.close(end);
            self.backend.write_node(Arc::new(node.clone()))?;
        }
        state.end = end;
        state.built = true;

        if let Backend::File(file) = &self.backend {
            file.write_header(&TreeHeader {
                provider_version: self.config.provider_version,
                block_size: self.layout.block_size as u32,
                max_children: self.layout.max_children as u32,
                node_count: state.node_count,
                root_seq: state.root_seq,
                start_time: self.config.start_time,
                end_time: end,
                built: true,
            })?;
            file.sync()?;
        }

        info!(end, nodes = state.node_count, "Closed history tree");
        Ok(())
    }

    // --- Queries ---

    fn with_node<R>(&self, state: &TreeState, seq: u32, f: impl FnOnce(&Node) -> R) -> Result<R> {
        match state.open_node(seq) {
            Some(node) => Ok(f(node)),
            None => {
                let node = self.backend.read_node(seq)?;
                Ok(f(&node))
            }
        }
    }

    /// The stored interval of `quark` containing `t`, if any.
    pub fn query_point(&self, quark: Quark, t: i64) -> Result<Option<Interval>> {
        let state = self.state.read();
        let mut seq = state.root_seq;
        loop {
            let (found, child) = self.with_node(&state, seq, |node| {
                (node.relevant_interval(quark, t).cloned(), node.select_child(t))
            })?;
            if found.is_some() {
                return Ok(found);
            }
            match child {
                Some(child) => seq = child,
                None => return Ok(None),
            }
        }
    }

    /// Fill `out[q]` with the stored interval of quark `q` containing `t`,
    /// in a single descent. Slots already filled are kept.
    pub fn query_full(&self, t: i64, out: &mut [Option<Interval>]) -> Result<()> {
        let state = self.state.read();
        let mut seq = state.root_seq;
        loop {
            let child = self.with_node(&state, seq, |node| {
                node.collect_at(t, out);
                node.select_child(t)
            })?;
            if out.iter().all(Option::is_some) {
                return Ok(());
            }
            match child {
                Some(child) => seq = child,
                None => return Ok(()),
            }
        }
    }

    /// Stored intervals of `quark` overlapping `[start, end]`, ordered by
    /// start time. Stops at the first gap.
    pub fn query_range(&self, quark: Quark, start: i64, end: i64) -> Result<Vec<Interval>> {
        let mut result = Vec::new();
        let mut t = start.max(self.config.start_time);
        while t <= end {
            match self.query_point(quark, t)? {
                Some(interval) => {
                    t = interval.end.saturating_add(1);
                    result.push(interval);
                }
                None => break,
            }
        }
        Ok(result)
    }
}
