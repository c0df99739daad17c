//! Error handling and edge case tests.

use state_history::{
    Quark, Snapshot, StateError, StateSystem, StateSystemBuilder, StateValue, StoreConfig,
    ValueType,
};
use tempfile::TempDir;

fn memory_builder() -> StateSystemBuilder {
    StateSystemBuilder::create(StoreConfig::in_memory(100)).unwrap()
}

// --- Query errors ---

#[test]
fn test_query_outside_time_range() {
    let mut builder = memory_builder();
    let q = builder.get_quark_add(&["a"]).unwrap();
    builder.modify_attribute(150, 1, q).unwrap();
    let ss = builder.state_system();

    assert!(matches!(
        ss.query_single_state(99, q),
        Err(StateError::TimeRange { time: 99, start: 100, end: 150 })
    ));
    assert!(matches!(
        ss.query_single_state(151, q),
        Err(StateError::TimeRange { .. })
    ));
    assert!(ss.query_full_state(151).is_err());
    assert!(ss.query_single_state(150, q).is_ok());
    assert!(ss.query_single_state(100, q).unwrap().value.is_null());
}

#[test]
fn test_unknown_quark() {
    let builder = memory_builder();
    let ss = builder.state_system();

    assert!(matches!(
        ss.query_single_state(100, Quark(42)),
        Err(StateError::AttributeNotFound(_))
    ));
    assert!(ss.full_path(Quark(42)).is_err());
    assert!(ss.opt_quark(&["missing"]).is_none());
    assert!(ss.quarks_matching(&["missing", "*"]).is_empty());
}

#[test]
fn test_unbox_wrong_type() {
    let mut builder = memory_builder();
    let q = builder.get_quark_add(&["a"]).unwrap();
    builder.modify_attribute(100, "text", q).unwrap();

    let value = builder.state_system().query_single_state(100, q).unwrap().value;
    assert_eq!(value.unbox_str().unwrap(), "text");
    assert!(matches!(
        value.unbox_long(),
        Err(StateError::StateValueType {
            expected: ValueType::Long,
            actual: ValueType::String
        })
    ));
}

// --- Writer misuse ---

#[test]
fn test_writes_before_store_start() {
    let mut builder = memory_builder();
    let q = builder.get_quark_add(&["a"]).unwrap();
    assert!(matches!(
        builder.modify_attribute(50, 1, q),
        Err(StateError::TimeRange { time: 50, .. })
    ));
}

#[test]
fn test_out_of_order_does_not_corrupt() {
    let mut builder = memory_builder();
    let q = builder.get_quark_add(&["a"]).unwrap();
    builder.modify_attribute(200, 1, q).unwrap();
    assert!(builder.modify_attribute(150, 2, q).is_err());
    builder.modify_attribute(250, 3, q).unwrap();
    builder.close(300).unwrap();

    let ss = builder.state_system();
    let intervals = ss.query_history_range(q, 100, 300).unwrap();
    let values: Vec<StateValue> = intervals.into_iter().map(|i| i.value).collect();
    assert_eq!(
        values,
        vec![StateValue::Null, StateValue::Int(1), StateValue::Int(3)]
    );
}

#[test]
fn test_type_change_rejected() {
    let mut builder = memory_builder();
    let q = builder.get_quark_add(&["a"]).unwrap();
    builder.modify_attribute(100, 1.5, q).unwrap();
    builder.modify_attribute(110, StateValue::Null, q).unwrap();
    assert!(matches!(
        builder.modify_attribute(120, 2, q),
        Err(StateError::StateValueType {
            expected: ValueType::Double,
            actual: ValueType::Int
        })
    ));
    builder.modify_attribute(130, 2.5, q).unwrap();
}

#[test]
fn test_oversized_string_rejected_on_write() {
    let mut builder = memory_builder();
    let big = builder.get_quark_add(&["big"]).unwrap();
    let other = builder.get_quark_add(&["other"]).unwrap();
    builder.modify_attribute(100, "first", big).unwrap();
    builder.modify_attribute(105, 1, other).unwrap();

    assert!(matches!(
        builder.modify_attribute(110, "x".repeat(100_000), big),
        Err(StateError::IntervalTooLarge { .. })
    ));
    builder.modify_attribute(120, "second", big).unwrap();
    builder.close(200).unwrap();

    let ss = builder.state_system();
    assert!(ss.is_built());
    let first = ss.query_single_state(115, big).unwrap();
    assert_eq!((first.start, first.end), (100, 119));
    assert_eq!(first.value, StateValue::from("first"));
    let second = ss.query_single_state(150, big).unwrap();
    assert_eq!((second.start, second.end), (120, 200));
    assert_eq!(second.value, StateValue::from("second"));
    assert_eq!(ss.query_single_state(150, other).unwrap().value, StateValue::Int(1));
}

#[test]
fn test_rejected_push_leaves_stack_alone() {
    let mut builder = memory_builder();
    let q = builder.get_quark_add(&["Threads", "1", "CallStack"]).unwrap();
    builder.push_attribute(101, "main", q).unwrap();
    builder.pop_attribute(102, q).unwrap();

    assert!(matches!(
        builder.push_attribute(103, 42, q),
        Err(StateError::StateValueType {
            expected: ValueType::String,
            actual: ValueType::Int
        })
    ));
    assert!(builder.query_ongoing(q).unwrap().is_null());
    assert!(matches!(
        builder.pop_attribute(104, q),
        Err(StateError::EmptyStack(_))
    ));
    builder.close(110).unwrap();

    let depths = builder.state_system().query_history_range(q, 100, 110).unwrap();
    let values: Vec<StateValue> = depths.into_iter().map(|i| i.value).collect();
    assert_eq!(
        values,
        vec![StateValue::Null, StateValue::Int(1), StateValue::Null]
    );
}

#[test]
fn test_dispose_during_build() {
    let mut builder = memory_builder();
    let q = builder.get_quark_add(&["a"]).unwrap();
    let ss = builder.state_system();

    ss.dispose();
    assert!(matches!(ss.query_single_state(100, q), Err(StateError::Disposed)));
    assert!(matches!(ss.sub_attributes(None, false), Err(StateError::Disposed)));
    assert!(matches!(builder.modify_attribute(100, 1, q), Err(StateError::Disposed)));
    assert!(matches!(builder.close(200), Err(StateError::Disposed)));
}

// --- Persistence errors ---

#[test]
fn test_open_missing_store() {
    let dir = TempDir::new().unwrap();
    let err = StateSystem::open(StoreConfig {
        path: dir.path().join("nothing-here"),
        ..Default::default()
    })
    .err()
    .unwrap();
    assert!(matches!(err, StateError::NotInitialized));
    assert!(err.needs_rebuild());
}

#[test]
fn test_open_while_building_is_locked() {
    let dir = TempDir::new().unwrap();
    let config = StoreConfig {
        path: dir.path().join("store"),
        ..Default::default()
    };
    let _builder = StateSystemBuilder::create(config.clone()).unwrap();
    assert!(matches!(StateSystem::open(config), Err(StateError::Locked)));
}

#[test]
fn test_garbage_manifest() {
    let dir = TempDir::new().unwrap();
    let config = StoreConfig {
        path: dir.path().join("store"),
        ..Default::default()
    };
    std::fs::create_dir_all(&config.path).unwrap();
    std::fs::write(config.path.join("MANIFEST"), b"garbage!").unwrap();

    let err = StateSystem::open(config).err().unwrap();
    assert!(matches!(err, StateError::InvalidFormat(_)));
    assert!(err.needs_rebuild());
}

#[test]
fn test_snapshot_for_other_analysis() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("snapshot.json");

    let mut builder = memory_builder();
    let q = builder.get_quark_add(&["a"]).unwrap();
    builder.modify_attribute(120, 4, q).unwrap();
    builder
        .state_system()
        .export_snapshot(120)
        .unwrap()
        .write_to(&path)
        .unwrap();

    // The in-memory config uses provider version 0.
    assert!(Snapshot::read_from(&path, 0).is_ok());
    assert!(matches!(
        Snapshot::read_from(&path, 1),
        Err(StateError::VersionMismatch { expected: 1, found: 0 })
    ));
    assert!(Snapshot::read_from(dir.path().join("absent.json"), 0)
        .err()
        .unwrap()
        .needs_rebuild());
}
