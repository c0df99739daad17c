//! On-disk node file: a fixed-size header followed by one block per node.
//!
//! Node `seq` lives at offset `HEADER_SIZE + seq * block_size`. Blocks are
//! written once, when their node is sealed, so they can be read in any
//! order. A sealed file is reopened read-only through a memory mapping.

use super::node::{Node, NodeLayout};
use crate::error::{Result, StateError};
use lru::LruCache;
use memmap2::Mmap;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;

/// Magic bytes for node files.
const TREE_MAGIC: &[u8; 4] = b"SHT\0";

/// Current node file format version.
pub const FILE_VERSION: u32 = 1;

/// Space reserved for the file header.
pub const HEADER_SIZE: u64 = 4096;

/// Encoded header fields, before the checksum.
const HEADER_FIELDS_SIZE: usize = 4 + 4 + 4 + 4 + 4 + 4 + 4 + 8 + 8 + 1;

/// Tree-level metadata stored at the start of the node file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeHeader {
    pub provider_version: u32,
    pub block_size: u32,
    pub max_children: u32,
    pub node_count: u32,
    pub root_seq: u32,
    pub start_time: i64,
    pub end_time: i64,
    pub built: bool,
}

impl TreeHeader {
    pub fn layout(&self) -> NodeLayout {
        NodeLayout {
            block_size: self.block_size as usize,
            max_children: self.max_children as usize,
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE as usize);
        buf.extend_from_slice(TREE_MAGIC);
        buf.extend_from_slice(&FILE_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.provider_version.to_le_bytes());
        buf.extend_from_slice(&self.block_size.to_le_bytes());
        buf.extend_from_slice(&self.max_children.to_le_bytes());
        buf.extend_from_slice(&self.node_count.to_le_bytes());
        buf.extend_from_slice(&self.root_seq.to_le_bytes());
        buf.extend_from_slice(&self.start_time.to_le_bytes());
        buf.extend_from_slice(&self.end_time.to_le_bytes());
        buf.push(self.built as u8);
        let checksum = crc32fast::hash(&buf);
        buf.extend_from_slice(&checksum.to_le_bytes());
        buf.resize(HEADER_SIZE as usize, 0);
        buf
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_FIELDS_SIZE + 4 {
            return Err(StateError::Corruption("Truncated node file header".into()));
        }
        if &bytes[0..4] != TREE_MAGIC {
            return Err(StateError::InvalidFormat("Invalid node file magic".into()));
        }

        let u32_at = |at: usize| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&bytes[at..at + 4]);
            u32::from_le_bytes(buf)
        };
        let i64_at = |at: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[at..at + 8]);
            i64::from_le_bytes(buf)
        };

        let version = u32_at(4);
        if version != FILE_VERSION {
            return Err(StateError::VersionMismatch {
                expected: FILE_VERSION,
                found: version,
            });
        }

        let expected = u32_at(HEADER_FIELDS_SIZE);
        let got = crc32fast::hash(&bytes[..HEADER_FIELDS_SIZE]);
        if expected != got {
            return Err(StateError::ChecksumMismatch { expected, got });
        }

        Ok(Self {
            provider_version: u32_at(8),
            block_size: u32_at(12),
            max_children: u32_at(16),
            node_count: u32_at(20),
            root_seq: u32_at(24),
            start_time: i64_at(28),
            end_time: i64_at(36),
            built: bytes[44] != 0,
        })
    }
}

/// Block storage for history tree nodes.
pub struct NodeFile {
    layout: NodeLayout,
    file: Mutex<File>,
    /// Read-only mapping, present when the file was opened sealed.
    mmap: Option<Mmap>,
    cache: Mutex<LruCache<u32, Arc<Node>>>,
}

impl NodeFile {
    /// Create (or truncate) a node file and write its initial header.
    pub fn create(path: impl AsRef<Path>, header: &TreeHeader, cache_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let node_file = Self {
            layout: header.layout(),
            file: Mutex::new(file),
            mmap: None,
            cache: Mutex::new(LruCache::new(cache_capacity(cache_size))),
        };
        node_file.write_header(header)?;
        Ok(node_file)
    }

    /// Open an existing node file read-only.
    pub fn open(path: impl AsRef<Path>, cache_size: usize) -> Result<(Self, TreeHeader)> {
        let mut file = File::open(path)?;

        let mut header_bytes = vec![0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header_bytes)?;
        let header = TreeHeader::decode(&header_bytes)?;

        let layout = header.layout();
        let expected_len = HEADER_SIZE + header.node_count as u64 * layout.block_size as u64;
        let actual_len = file.metadata()?.len();
        if actual_len < expected_len {
            return Err(StateError::Corruption(format!(
                "Node file is {} bytes, expected at least {}",
                actual_len, expected_len
            )));
        }

        // The file is sealed and never written again while mapped.
        let mmap = Some(unsafe { Mmap::map(&file)? });

        Ok((
            Self {
                layout,
                file: Mutex::new(file),
                mmap,
                cache: Mutex::new(LruCache::new(cache_capacity(cache_size))),
            },
            header,
        ))
    }

    pub fn write_header(&self, header: &TreeHeader) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header.encode())?;
        Ok(())
    }

    /// Write a sealed node to its block.
    pub fn write_node(&self, node: Arc<Node>) -> Result<()> {
        if self.mmap.is_some() {
            return Err(StateError::Sealed);
        }
        let block = node.encode(&self.layout)?;
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(self.offset(node.seq())))?;
            file.write_all(&block)?;
        }
        self.cache.lock().put(node.seq(), node);
        Ok(())
    }

    pub fn read_node(&self, seq: u32) -> Result<Arc<Node>> {
        if let Some(node) = self.cache.lock().get(&seq).cloned() {
            return Ok(node);
        }

        let offset = self.offset(seq) as usize;
        let len = self.layout.block_size;
        let node = match &self.mmap {
            Some(mmap) => {
                let block = mmap.get(offset..offset + len).ok_or_else(|| {
                    StateError::Corruption(format!("Node {} lies past the end of the file", seq))
                })?;
                Node::decode(block, &self.layout)?
            }
            None => {
                let mut block = vec![0u8; len];
                let mut file = self.file.lock();
                file.seek(SeekFrom::Start(offset as u64))?;
                file.read_exact(&mut block)?;
                Node::decode(&block, &self.layout)?
            }
        };

        if node.seq() != seq {
            return Err(StateError::Corruption(format!(
                "Block {} holds node {}",
                seq,
                node.seq()
            )));
        }

        let node = Arc::new(node);
        self.cache.lock().put(seq, Arc::clone(&node));
        Ok(node)
    }

    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    fn offset(&self, seq: u32) -> u64 {
        HEADER_SIZE + seq as u64 * self.layout.block_size as u64
    }
}

fn cache_capacity(cache_size: usize) -> NonZeroUsize {
    NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN)
}
