//! Fixed-capacity history tree nodes and their block encoding.

use crate::error::{Result, StateError};
use crate::types::{Interval, Quark};
use crate::value::{StateValue, ValueType};

/// Parent sequence number stored for the root node.
const NO_PARENT: u32 = u32::MAX;

/// Node type byte for core nodes.
const CORE_TYPE: u8 = 1;

/// Node type byte for leaf nodes.
const LEAF_TYPE: u8 = 2;

/// Common header: type + start + end + seq + parent + interval count.
const COMMON_HEADER_SIZE: usize = 1 + 8 + 8 + 4 + 4 + 4;

/// Per-child entry in a core node header: seq + start.
const CHILD_ENTRY_SIZE: usize = 4 + 8;

/// Fixed part of an encoded interval: start + end + quark + type tag.
const INTERVAL_HEADER_SIZE: usize = 8 + 8 + 4 + 1;

/// Block trailer: crc32 of everything before it.
const TRAILER_SIZE: usize = 4;

/// Size parameters shared by every node of one tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeLayout {
    pub block_size: usize,
    pub max_children: usize,
}

impl NodeLayout {
    fn header_size(&self, leaf: bool) -> usize {
        if leaf {
            COMMON_HEADER_SIZE
        } else {
            COMMON_HEADER_SIZE + 4 + self.max_children * CHILD_ENTRY_SIZE
        }
    }

    /// Bytes available for intervals in an empty node.
    pub fn capacity(&self, leaf: bool) -> usize {
        self.block_size
            .saturating_sub(self.header_size(leaf) + TRAILER_SIZE)
    }
}

/// Encoded size of one interval.
pub fn interval_size(interval: &Interval) -> usize {
    stored_size(&interval.value)
}

/// Encoded size of an interval holding `value`.
pub fn stored_size(value: &StateValue) -> usize {
    let payload = match value {
        StateValue::String(s) => 2 + s.len(),
        other => other.encoded_len(),
    };
    INTERVAL_HEADER_SIZE + payload
}

/// Reference from a core node to one of its children.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChildLink {
    pub seq: u32,
    pub start: i64,
}

#[derive(Clone, Debug)]
pub enum NodeKind {
    Core { children: Vec<ChildLink> },
    Leaf,
}

/// One node of the history tree.
///
/// Intervals are kept ordered by end time, which is also their insertion
/// order since intervals are committed when they are closed.
#[derive(Clone, Debug)]
pub struct Node {
    seq: u32,
    parent: Option<u32>,
    start: i64,
    end: Option<i64>,
    kind: NodeKind,
    intervals: Vec<Interval>,
    used: usize,
}

impl Node {
    pub fn leaf(seq: u32, parent: Option<u32>, start: i64) -> Self {
        Self::new(seq, parent, start, NodeKind::Leaf)
    }

    pub fn core(seq: u32, parent: Option<u32>, start: i64) -> Self {
        Self::new(
            seq,
            parent,
            start,
            NodeKind::Core {
                children: Vec::new(),
            },
        )
    }

    fn new(seq: u32, parent: Option<u32>, start: i64, kind: NodeKind) -> Self {
        Self {
            seq,
            parent,
            start,
            end: None,
            kind,
            intervals: Vec::new(),
            used: 0,
        }
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn parent(&self) -> Option<u32> {
        self.parent
    }

    pub fn set_parent(&mut self, parent: u32) {
        self.parent = Some(parent);
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    /// End time, known once the node is closed.
    pub fn end(&self) -> Option<i64> {
        self.end
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf)
    }

    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }

    pub fn children(&self) -> &[ChildLink] {
        match &self.kind {
            NodeKind::Core { children } => children,
            NodeKind::Leaf => &[],
        }
    }

    pub fn latest_child(&self) -> Option<u32> {
        self.children().last().map(|c| c.seq)
    }

    pub fn free_space(&self, layout: &NodeLayout) -> usize {
        layout.capacity(self.is_leaf()).saturating_sub(self.used)
    }

    pub fn add_interval(&mut self, interval: Interval) {
        self.used += interval_size(&interval);
        let mut index = self.intervals.len();
        while index > 0 && interval.end < self.intervals[index - 1].end {
            index -= 1;
        }
        self.intervals.insert(index, interval);
    }

    pub fn close(&mut self, end: i64) {
        self.end = Some(end);
    }

    pub fn link_child(&mut self, seq: u32, start: i64) {
        if let NodeKind::Core { children } = &mut self.kind {
            children.push(ChildLink { seq, start });
        }
    }

    /// The child whose subtree covers `t`: the last child starting at or
    /// before `t`.
    pub fn select_child(&self, t: i64) -> Option<u32> {
        let children = self.children();
        let idx = children.partition_point(|c| c.start <= t);
        if idx == 0 {
            None
        } else {
            Some(children[idx - 1].seq)
        }
    }

    /// The interval of `quark` containing `t`, if stored in this node.
    pub fn relevant_interval(&self, quark: Quark, t: i64) -> Option<&Interval> {
        self.intervals[self.start_index_for(t)..]
            .iter()
            .find(|i| i.quark == quark && i.start <= t)
    }

    /// Fill `out[quark]` for every interval in this node containing `t`.
    /// Slots already filled are left alone.
    pub fn collect_at(&self, t: i64, out: &mut [Option<Interval>]) {
        for interval in &self.intervals[self.start_index_for(t)..] {
            if interval.start > t {
                continue;
            }
            if let Some(slot) = out.get_mut(interval.quark.index()) {
                if slot.is_none() {
                    *slot = Some(interval.clone());
                }
            }
        }
    }

    /// Index of the first interval ending at or after `t`.
    fn start_index_for(&self, t: i64) -> usize {
        self.intervals.partition_point(|i| i.end < t)
    }

    // --- Block encoding ---

    /// Encode into exactly `layout.block_size` bytes. The node must be closed.
    pub fn encode(&self, layout: &NodeLayout) -> Result<Vec<u8>> {
        let end = self.end.ok_or_else(|| {
            StateError::InvalidFormat(format!("Node {} written before being closed", self.seq))
        })?;

        let mut buf = Vec::with_capacity(layout.block_size);
        buf.push(if self.is_leaf() { LEAF_TYPE } else { CORE_TYPE });
        buf.extend_from_slice(&self.start.to_le_bytes());
        buf.extend_from_slice(&end.to_le_bytes());
        buf.extend_from_slice(&self.seq.to_le_bytes());
        buf.extend_from_slice(&self.parent.unwrap_or(NO_PARENT).to_le_bytes());
        buf.extend_from_slice(&(self.intervals.len() as u32).to_le_bytes());

        if let NodeKind::Core { children } = &self.kind {
            buf.extend_from_slice(&(children.len() as u32).to_le_bytes());
            for i in 0..layout.max_children {
                let link = children.get(i).copied().unwrap_or(ChildLink { seq: 0, start: 0 });
                buf.extend_from_slice(&link.seq.to_le_bytes());
                buf.extend_from_slice(&link.start.to_le_bytes());
            }
        }

        for interval in &self.intervals {
            buf.extend_from_slice(&interval.start.to_le_bytes());
            buf.extend_from_slice(&interval.end.to_le_bytes());
            buf.extend_from_slice(&interval.quark.0.to_le_bytes());
            buf.push(interval.value.type_tag());
            if let StateValue::String(s) = &interval.value {
                buf.extend_from_slice(&(s.len() as u16).to_le_bytes());
            }
            buf.extend_from_slice(&interval.value.encode());
        }

        let body_len = layout.block_size - TRAILER_SIZE;
        if buf.len() > body_len {
            return Err(StateError::Corruption(format!(
                "Node {} overflows its block ({} > {})",
                self.seq,
                buf.len(),
                body_len
            )));
        }
        buf.resize(body_len, 0);
        let checksum = crc32fast::hash(&buf);
        buf.extend_from_slice(&checksum.to_le_bytes());
        Ok(buf)
    }

    /// Decode a block written by [`Node::encode`].
    pub fn decode(block: &[u8], layout: &NodeLayout) -> Result<Node> {
        if block.len() != layout.block_size {
            return Err(StateError::Corruption(format!(
                "Node block has {} bytes, expected {}",
                block.len(),
                layout.block_size
            )));
        }
        let body_len = layout.block_size - TRAILER_SIZE;
        let expected = read_u32(block, body_len)?;
        let got = crc32fast::hash(&block[..body_len]);
        if expected != got {
            return Err(StateError::ChecksumMismatch { expected, got });
        }

        let mut cursor = Cursor::new(&block[..body_len]);
        let node_type = cursor.u8()?;
        let start = cursor.i64()?;
        let end = cursor.i64()?;
        let seq = cursor.u32()?;
        let parent = match cursor.u32()? {
            NO_PARENT => None,
            p => Some(p),
        };
        let interval_count = cursor.u32()? as usize;

        let mut node = match node_type {
            LEAF_TYPE => Node::leaf(seq, parent, start),
            CORE_TYPE => {
                let mut node = Node::core(seq, parent, start);
                let child_count = cursor.u32()? as usize;
                if child_count > layout.max_children {
                    return Err(StateError::Corruption(format!(
                        "Node {} claims {} children (max {})",
                        seq, child_count, layout.max_children
                    )));
                }
                for i in 0..layout.max_children {
                    let child_seq = cursor.u32()?;
                    let child_start = cursor.i64()?;
                    if i < child_count {
                        node.link_child(child_seq, child_start);
                    }
                }
                node
            }
            other => {
                return Err(StateError::InvalidFormat(format!(
                    "Unknown node type: {}",
                    other
                )))
            }
        };

        for _ in 0..interval_count {
            let i_start = cursor.i64()?;
            let i_end = cursor.i64()?;
            let quark = Quark(cursor.u32()?);
            let tag = cursor.u8()?;
            let len = match ValueType::from_tag(tag)? {
                ValueType::Null => 0,
                ValueType::Int => 4,
                ValueType::Long | ValueType::Double => 8,
                ValueType::String => cursor.u16()? as usize,
            };
            let value = StateValue::decode(cursor.take(len)?, tag)?;
            let interval = Interval::new(quark, i_start, i_end, value)
                .map_err(|e| StateError::Corruption(e.to_string()))?;
            node.add_interval(interval);
        }

        node.close(end);
        Ok(node)
    }
}

fn read_u32(bytes: &[u8], at: usize) -> Result<u32> {
    let slice = bytes
        .get(at..at + 4)
        .ok_or_else(|| StateError::Corruption("Truncated node block".into()))?;
    let mut buf = [0u8; 4];
    buf.copy_from_slice(slice);
    Ok(u32::from_le_bytes(buf))
}

/// Little-endian reader over a node block.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let slice = self
            .bytes
            .get(self.pos..self.pos + len)
            .ok_or_else(|| StateError::Corruption("Truncated node block".into()))?;
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        buf.copy_from_slice(self.take(2)?);
        Ok(u16::from_le_bytes(buf))
    }

    fn u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(buf))
    }

    fn i64(&mut self) -> Result<i64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(i64::from_le_bytes(buf))
    }
}
