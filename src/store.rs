//! Store configuration and on-disk lifecycle: create, open, rebuild.

use crate::attribute::AttributeTree;
use crate::error::{Result, StateError};
use crate::history::{HistoryConfig, HistoryTree, NodeLayout};
use crate::system::{Shared, StateSystem, StateSystemBuilder};
use fs2::FileExt;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Magic bytes for the store manifest.
const STORE_MAGIC: &[u8; 4] = b"SHS\0";

/// Current store layout version.
const STORE_VERSION: u8 = 1;

const MANIFEST_FILE: &str = "MANIFEST";
const LOCK_FILE: &str = "LOCK";
const HISTORY_FILE: &str = "history.sht";
const ATTRIBUTES_FILE: &str = "attributes.bin";

/// Smallest accepted node block.
pub const MIN_BLOCK_SIZE: usize = 4096;

/// Room a core node must keep for intervals after its child table.
const MIN_CORE_CAPACITY: usize = 1024;

/// Where history nodes are kept.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageKind {
    /// A directory holding the node file and attribute tree.
    File,
    /// Process memory only; the store is gone when the last handle drops.
    Memory,
}

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Directory of a file-backed store.
    pub path: PathBuf,

    pub storage: StorageKind,

    /// Identifies the analysis producing this store; checked against the
    /// manifest and snapshots.
    pub store_id: String,

    /// Schema version chosen by the producer. Persisted files written with
    /// another version are stale.
    pub provider_version: u32,

    /// Earliest timestamp the store covers.
    pub start_time: i64,

    /// Bytes per history node.
    pub block_size: usize,

    /// Children per core node.
    pub max_children: usize,

    /// Decoded nodes kept in memory (number of nodes).
    pub node_cache_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./state-history"),
            storage: StorageKind::File,
            store_id: "state-history".to_string(),
            provider_version: 0,
            start_time: 0,
            block_size: 64 * 1024,
            max_children: 50,
            node_cache_size: 256,
        }
    }
}

impl StoreConfig {
    /// Configuration of an in-memory store starting at `start_time`.
    pub fn in_memory(start_time: i64) -> Self {
        Self {
            storage: StorageKind::Memory,
            start_time,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size < MIN_BLOCK_SIZE {
            return Err(StateError::InvalidConfig(format!(
                "block_size {} is below the minimum of {}",
                self.block_size, MIN_BLOCK_SIZE
            )));
        }
        if self.block_size > u32::MAX as usize {
            return Err(StateError::InvalidConfig(format!(
                "block_size {} does not fit in 32 bits",
                self.block_size
            )));
        }
        if self.max_children < 2 {
            return Err(StateError::InvalidConfig(
                "max_children must be at least 2".into(),
            ));
        }
        let layout = NodeLayout {
            block_size: self.block_size,
            max_children: self.max_children,
        };
        if layout.capacity(false) < MIN_CORE_CAPACITY {
            return Err(StateError::InvalidConfig(format!(
                "max_children {} leaves no room for intervals in a {} byte block",
                self.max_children, self.block_size
            )));
        }
        if self.store_id.len() > u16::MAX as usize {
            return Err(StateError::InvalidConfig("store_id is too long".into()));
        }
        Ok(())
    }

    fn history_config(&self) -> HistoryConfig {
        HistoryConfig {
            start_time: self.start_time,
            block_size: self.block_size,
            max_children: self.max_children,
            provider_version: self.provider_version,
            cache_size: self.node_cache_size,
        }
    }
}

/// Directory and lock of a file-backed store, held for as long as any
/// handle on the store lives.
pub(crate) struct StoreFiles {
    dir: PathBuf,
    _lock: File,
}

impl StoreFiles {
    pub fn attributes_path(&self) -> PathBuf {
        self.dir.join(ATTRIBUTES_FILE)
    }
}

/// Result of [`open_or_create`].
pub enum Opened {
    /// A sealed store that was already on disk.
    Existing(StateSystem),
    /// Nothing usable was found; the store must be (re)built.
    Created(StateSystemBuilder),
}

impl Opened {
    pub fn is_existing(&self) -> bool {
        matches!(self, Opened::Existing(_))
    }

    /// A read handle, whichever way the store was obtained.
    pub fn state_system(&self) -> StateSystem {
        match self {
            Opened::Existing(ss) => ss.clone(),
            Opened::Created(builder) => builder.state_system(),
        }
    }
}

/// Open the sealed store described by `config`, or start building a new
/// one when there is none.
///
/// Persisted files that are missing, unsealed, corrupt, or written with
/// another provider version are removed and a fresh builder is returned.
pub fn open_or_create(config: StoreConfig) -> Result<Opened> {
    if config.storage == StorageKind::File && config.path.join(MANIFEST_FILE).exists() {
        match StateSystem::open(config.clone()) {
            Ok(ss) => return Ok(Opened::Existing(ss)),
            Err(e) if e.needs_rebuild() => {
                warn!(
                    path = %config.path.display(),
                    error = %e,
                    "Discarding stale state history"
                );
                remove_stale_files(&config.path)?;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(Opened::Created(StateSystemBuilder::create(config)?))
}

impl StateSystemBuilder {
    /// Start building a new store, replacing any files already at the
    /// configured path.
    pub fn create(config: StoreConfig) -> Result<Self> {
        config.validate()?;

        let shared = match config.storage {
            StorageKind::Memory => {
                let history = HistoryTree::in_memory(config.history_config())?;
                Shared::building(config.store_id.clone(), AttributeTree::new(), history, None)
            }
            StorageKind::File => {
                fs::create_dir_all(&config.path)?;
                let lock = acquire_lock(&config.path, true)?;
                remove_stale_files(&config.path)?;
                write_manifest(&config.path, &config.store_id)?;

                let history =
                    HistoryTree::create(config.path.join(HISTORY_FILE), config.history_config())?;
                let files = StoreFiles {
                    dir: config.path.clone(),
                    _lock: lock,
                };
                Shared::building(
                    config.store_id.clone(),
                    AttributeTree::new(),
                    history,
                    Some(files),
                )
            }
        };

        info!(
            store_id = %config.store_id,
            storage = ?config.storage,
            start = config.start_time,
            "Created state history"
        );
        Ok(Self::from_shared(Arc::new(shared)))
    }
}

impl StateSystem {
    /// Open a sealed file-backed store for reading.
    ///
    /// Errors for which [`StateError::needs_rebuild`] holds mean the files
    /// cannot be used and the store has to be rebuilt.
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        if config.storage == StorageKind::Memory || !config.path.exists() {
            return Err(StateError::NotInitialized);
        }

        verify_manifest(&config.path, &config.store_id)?;
        let lock = acquire_lock(&config.path, false)?;

        let history = HistoryTree::open(
            config.path.join(HISTORY_FILE),
            config.provider_version,
            config.node_cache_size,
        )?;
        let attributes =
            AttributeTree::load(config.path.join(ATTRIBUTES_FILE), config.provider_version)?;

        let files = StoreFiles {
            dir: config.path.clone(),
            _lock: lock,
        };
        let shared = Shared::sealed(config.store_id, attributes, history, Some(files));
        Ok(Self::from_shared(Arc::new(shared)))
    }
}

fn write_manifest(path: &Path, store_id: &str) -> Result<()> {
    let mut file = File::create(path.join(MANIFEST_FILE))?;

    file.write_all(STORE_MAGIC)?;
    file.write_all(&[STORE_VERSION])?;
    file.write_all(&(store_id.len() as u16).to_le_bytes())?;
    file.write_all(store_id.as_bytes())?;
    file.sync_all()?;

    Ok(())
}

fn verify_manifest(path: &Path, store_id: &str) -> Result<()> {
    let mut file = File::open(path.join(MANIFEST_FILE))?;

    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    if &magic != STORE_MAGIC {
        return Err(StateError::InvalidFormat("Invalid store magic".into()));
    }

    let mut version = [0u8; 1];
    file.read_exact(&mut version)?;
    if version[0] != STORE_VERSION {
        return Err(StateError::VersionMismatch {
            expected: STORE_VERSION as u32,
            found: version[0] as u32,
        });
    }

    let mut len = [0u8; 2];
    file.read_exact(&mut len)?;
    let mut id = vec![0u8; u16::from_le_bytes(len) as usize];
    file.read_exact(&mut id)?;
    if id != store_id.as_bytes() {
        return Err(StateError::InvalidConfig(format!(
            "Directory holds store '{}', not '{}'",
            String::from_utf8_lossy(&id),
            store_id
        )));
    }

    Ok(())
}

/// Lock the store directory: exclusively for a builder, shared for readers
/// of a sealed store.
fn acquire_lock(path: &Path, exclusive: bool) -> Result<File> {
    let lock_file = File::create(path.join(LOCK_FILE))?;

    let locked = if exclusive {
        FileExt::try_lock_exclusive(&lock_file)
    } else {
        FileExt::try_lock_shared(&lock_file)
    };
    locked.map_err(|_| StateError::Locked)?;

    Ok(lock_file)
}

fn remove_stale_files(path: &Path) -> Result<()> {
    for name in [HISTORY_FILE, ATTRIBUTES_FILE] {
        match fs::remove_file(path.join(name)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::StateValue;
    use tempfile::TempDir;

    fn file_config(dir: &TempDir) -> StoreConfig {
        StoreConfig {
            path: dir.path().join("store"),
            store_id: "kernel".into(),
            provider_version: 3,
            block_size: 4096,
            max_children: 4,
            ..Default::default()
        }
    }

    #[test]
    fn test_validate() {
        assert!(StoreConfig::default().validate().is_ok());
        assert!(StoreConfig::in_memory(0).validate().is_ok());

        let small = StoreConfig {
            block_size: 1024,
            ..Default::default()
        };
        assert!(matches!(small.validate(), Err(StateError::InvalidConfig(_))));

        let single_child = StoreConfig {
            max_children: 1,
            ..Default::default()
        };
        assert!(single_child.validate().is_err());

        let crowded = StoreConfig {
            block_size: 4096,
            max_children: 300,
            ..Default::default()
        };
        assert!(crowded.validate().is_err());
    }

    #[test]
    fn test_create_then_open() {
        let dir = TempDir::new().unwrap();
        let config = file_config(&dir);

        {
            let mut builder = StateSystemBuilder::create(config.clone()).unwrap();
            let q = builder.get_quark_add(&["cpu", "0", "status"]).unwrap();
            builder.modify_attribute(10, "running", q).unwrap();
            builder.close(20).unwrap();
        }

        let ss = StateSystem::open(config).unwrap();
        assert!(ss.is_built());
        assert_eq!(ss.current_end_time(), 20);
        let q = ss.quark(&["cpu", "0", "status"]).unwrap();
        assert_eq!(
            ss.query_single_state(15, q).unwrap().value,
            StateValue::from("running")
        );
    }

    #[test]
    fn test_builder_holds_exclusive_lock() {
        let dir = TempDir::new().unwrap();
        let config = file_config(&dir);

        let _builder = StateSystemBuilder::create(config.clone()).unwrap();
        assert!(matches!(
            StateSystemBuilder::create(config),
            Err(StateError::Locked)
        ));
    }

    #[test]
    fn test_open_or_create() {
        let dir = TempDir::new().unwrap();
        let config = file_config(&dir);

        let opened = open_or_create(config.clone()).unwrap();
        assert!(!opened.is_existing());
        if let Opened::Created(mut builder) = opened {
            builder.close(5).unwrap();
        }

        let opened = open_or_create(config.clone()).unwrap();
        assert!(opened.is_existing());
        assert_eq!(opened.state_system().current_end_time(), 5);
        drop(opened);

        // Another provider version makes the files stale.
        let newer = StoreConfig {
            provider_version: 4,
            ..config
        };
        let opened = open_or_create(newer).unwrap();
        assert!(!opened.is_existing());
    }

    #[test]
    fn test_interrupted_build_is_rebuilt() {
        let dir = TempDir::new().unwrap();
        let config = file_config(&dir);
        {
            let mut builder = StateSystemBuilder::create(config.clone()).unwrap();
            let q = builder.get_quark_add(&["a"]).unwrap();
            builder.modify_attribute(3, 1, q).unwrap();
            // Dropped without close.
        }

        let err = StateSystem::open(config.clone()).err().unwrap();
        assert!(err.needs_rebuild());
        assert!(!open_or_create(config).unwrap().is_existing());
    }

    #[test]
    fn test_store_id_mismatch() {
        let dir = TempDir::new().unwrap();
        let config = file_config(&dir);
        StateSystemBuilder::create(config.clone())
            .unwrap()
            .close(1)
            .unwrap();

        let other = StoreConfig {
            store_id: "ust".into(),
            ..config
        };
        assert!(matches!(
            open_or_create(other),
            Err(StateError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_memory_store_cannot_be_opened() {
        assert!(matches!(
            StateSystem::open(StoreConfig::in_memory(0)),
            Err(StateError::NotInitialized)
        ));
    }
}
