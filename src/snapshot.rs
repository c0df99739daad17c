//! JSON snapshots of the full state at one instant.
//!
//! A snapshot lets a new build start from a known-good state instead of
//! replaying the whole event stream. It is tied to the analysis version that
//! produced it; reading it for another version is refused.

use crate::error::{Result, StateError};
use crate::system::StateSystem;
use crate::value::StateValue;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tracing::debug;

/// Current snapshot file format.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Interval captured for one attribute.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInterval {
    pub start: i64,
    /// `None` when the interval was still ongoing at export time.
    pub end: Option<i64>,
    pub value: StateValue,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotAttribute {
    pub path: Vec<String>,
    pub interval: SnapshotInterval,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub format_version: u32,
    pub store_id: String,
    pub analysis_version: u32,
    pub timestamp: i64,
    pub attributes: Vec<SnapshotAttribute>,
}

impl Snapshot {
    /// Write as JSON, replacing `path` only once the file is complete.
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer_pretty(&mut writer, self)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), attributes = self.attributes.len(), "Wrote snapshot");
        Ok(())
    }

    /// Read a snapshot written for `analysis_version`.
    pub fn read_from(path: impl AsRef<Path>, analysis_version: u32) -> Result<Self> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let snapshot: Snapshot = serde_json::from_reader(reader)?;

        if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(StateError::VersionMismatch {
                expected: SNAPSHOT_FORMAT_VERSION,
                found: snapshot.format_version,
            });
        }
        if snapshot.analysis_version != analysis_version {
            return Err(StateError::VersionMismatch {
                expected: analysis_version,
                found: snapshot.analysis_version,
            });
        }
        Ok(snapshot)
    }
}

impl StateSystem {
    /// Capture the value of every attribute at `t`.
    pub fn export_snapshot(&self, t: i64) -> Result<Snapshot> {
        let full = self.full_state(t)?;
        let mut attributes = Vec::with_capacity(full.len());
        for (interval, ongoing) in full {
            attributes.push(SnapshotAttribute {
                path: self.full_path(interval.quark)?,
                interval: SnapshotInterval {
                    start: interval.start,
                    end: if ongoing { None } else { Some(interval.end) },
                    value: interval.value,
                },
            });
        }

        Ok(Snapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            store_id: self.store_id().to_string(),
            analysis_version: self.metadata().provider_version,
            timestamp: t,
            attributes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use crate::system::StateSystemBuilder;
    use tempfile::TempDir;

    fn config() -> StoreConfig {
        StoreConfig {
            store_id: "sched".into(),
            provider_version: 7,
            ..StoreConfig::in_memory(0)
        }
    }

    fn sample() -> StateSystemBuilder {
        let mut builder = StateSystemBuilder::create(config()).unwrap();
        let cpu = builder.get_quark_add(&["CPUs", "0", "Current_thread"]).unwrap();
        let status = builder.get_quark_add(&["Threads", "12", "Status"]).unwrap();
        builder.modify_attribute(10, 12, cpu).unwrap();
        builder.modify_attribute(15, "running", status).unwrap();
        builder.modify_attribute(30, "blocked", status).unwrap();
        builder
    }

    #[test]
    fn test_export_marks_ongoing() {
        let builder = sample();
        let snapshot = builder.state_system().export_snapshot(20).unwrap();

        assert_eq!(snapshot.store_id, "sched");
        assert_eq!(snapshot.analysis_version, 7);
        let cpu = snapshot
            .attributes
            .iter()
            .find(|a| a.path == ["CPUs", "0", "Current_thread"])
            .unwrap();
        assert_eq!(cpu.interval.start, 10);
        assert_eq!(cpu.interval.end, None);
        assert_eq!(cpu.interval.value, StateValue::Int(12));

        let status = snapshot
            .attributes
            .iter()
            .find(|a| a.path == ["Threads", "12", "Status"])
            .unwrap();
        assert_eq!(status.interval.end, Some(29));
    }

    #[test]
    fn test_file_and_version_check() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.snapshot.json");
        let snapshot = sample().state_system().export_snapshot(20).unwrap();
        snapshot.write_to(&path).unwrap();

        assert_eq!(Snapshot::read_from(&path, 7).unwrap(), snapshot);
        let err = Snapshot::read_from(&path, 8).unwrap_err();
        assert!(matches!(err, StateError::VersionMismatch { expected: 8, found: 7 }));

        fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(
            Snapshot::read_from(&path, 7),
            Err(StateError::Deserialization(_))
        ));
    }

    #[test]
    fn test_load_into_fresh_builder() {
        let snapshot = sample().state_system().export_snapshot(20).unwrap();

        let mut builder = StateSystemBuilder::create(config()).unwrap();
        builder.load_snapshot(&snapshot).unwrap();
        let ss = builder.state_system();
        assert_eq!(ss.current_end_time(), 20);

        let status = ss.quark(&["Threads", "12", "Status"]).unwrap();
        let interval = ss.query_single_state(20, status).unwrap();
        assert_eq!(interval.start, 15);
        assert_eq!(interval.value, StateValue::from("running"));
        assert!(ss.query_single_state(14, status).unwrap().value.is_null());

        builder.modify_attribute(30, "blocked", status).unwrap();
        builder.close(40).unwrap();
        let full = ss.query_full_state(25).unwrap();
        assert_eq!(full[status.index()].value, StateValue::from("running"));
    }

    #[test]
    fn test_load_rejected() {
        let snapshot = sample().state_system().export_snapshot(20).unwrap();

        let mut used = sample();
        assert!(matches!(
            used.load_snapshot(&snapshot),
            Err(StateError::SnapshotRejected(_))
        ));

        let mut other = StateSystemBuilder::create(StoreConfig {
            store_id: "other".into(),
            ..config()
        })
        .unwrap();
        assert!(matches!(
            other.load_snapshot(&snapshot),
            Err(StateError::SnapshotRejected(_))
        ));
    }
}
