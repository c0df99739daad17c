//! Core types for the state history store.

use crate::error::{Result, StateError};
use crate::value::StateValue;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of one attribute-tree node.
///
/// Quarks are assigned in the order attributes are first referenced and are
/// never reused or renumbered.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Quark(pub u32);

impl Quark {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for Quark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Quark({})", self.0)
    }
}

impl fmt::Display for Quark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A closed time range `[start, end]` during which one attribute held one value.
///
/// Timestamps are trace-domain nanoseconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub quark: Quark,
    pub start: i64,
    pub end: i64,
    pub value: StateValue,
}

impl Interval {
    /// Create an interval, checking `start <= end`.
    pub fn new(quark: Quark, start: i64, end: i64, value: StateValue) -> Result<Self> {
        if start > end {
            return Err(StateError::InvalidInterval { start, end });
        }
        Ok(Self {
            quark,
            start,
            end,
            value,
        })
    }

    /// Whether `t` lies within `[start, end]`.
    pub fn contains(&self, t: i64) -> bool {
        self.start <= t && t <= self.end
    }

    /// Whether this interval overlaps `[start, end]`.
    pub fn intersects(&self, start: i64, end: i64) -> bool {
        self.start <= end && start <= self.end
    }

    pub fn duration(&self) -> i64 {
        self.end - self.start
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}], attribute = {}, value = {}",
            self.start, self.end, self.quark, self.value
        )
    }
}

/// Store-level metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreMetadata {
    /// Schema version chosen by the producer.
    pub provider_version: u32,
    pub start_time: i64,
    /// Latest committed timestamp; only ever increases.
    pub current_end_time: i64,
    pub built: bool,
}
