//! Ongoing (not yet closed) value of every quark.

use crate::error::{Result, StateError};
use crate::history::HistoryTree;
use crate::types::{Interval, Quark};
use crate::value::{StateValue, ValueType};

/// Per-quark ongoing values, kept by the writer until each interval closes.
///
/// A quark's ongoing interval runs from its ongoing start time to the
/// latest time seen by the writer.
pub(crate) struct TransientState {
    store_start: i64,
    values: Vec<StateValue>,
    starts: Vec<i64>,
    /// Type fixed by the first non-null value of each quark.
    types: Vec<Option<ValueType>>,
    latest_time: i64,
    active: bool,
}

impl TransientState {
    pub fn new(store_start: i64) -> Self {
        Self {
            store_start,
            values: Vec::new(),
            starts: Vec::new(),
            types: Vec::new(),
            latest_time: store_start,
            active: true,
        }
    }

    /// An empty, inactive state for a store that was built elsewhere.
    pub fn sealed(store_start: i64, end_time: i64) -> Self {
        Self {
            latest_time: end_time,
            active: false,
            ..Self::new(store_start)
        }
    }

    pub fn latest_time(&self) -> i64 {
        self.latest_time
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Give every quark below `quark_count` a slot holding `Null` since the
    /// store start.
    pub fn ensure(&mut self, quark_count: usize) {
        while self.values.len() < quark_count {
            self.values.push(StateValue::Null);
            self.starts.push(self.store_start);
            self.types.push(None);
        }
    }

    fn slot(&self, quark: Quark) -> Result<usize> {
        let index = quark.index();
        if index < self.values.len() {
            Ok(index)
        } else {
            Err(StateError::AttributeNotFound(format!("quark {}", quark)))
        }
    }

    pub fn ongoing_value(&self, quark: Quark) -> Result<&StateValue> {
        Ok(&self.values[self.slot(quark)?])
    }

    pub fn ongoing_start(&self, quark: Quark) -> Result<i64> {
        Ok(self.starts[self.slot(quark)?])
    }

    /// The ongoing interval of `quark` if it covers `t`.
    pub fn interval_at(&self, quark: Quark, t: i64) -> Option<Interval> {
        if !self.is_active() {
            return None;
        }
        let index = quark.index();
        let start = *self.starts.get(index)?;
        if start > t || t > self.latest_time {
            return None;
        }
        Some(Interval {
            quark,
            start,
            end: self.latest_time,
            value: self.values[index].clone(),
        })
    }

    /// Fill empty slots of `out` with ongoing intervals covering `t`.
    pub fn collect_at(&self, t: i64, out: &mut [Option<Interval>]) {
        for (index, slot) in out.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = self.interval_at(Quark(index as u32), t);
            }
        }
    }

    fn check_type(&self, index: usize, value: &StateValue) -> Result<()> {
        if value.is_null() {
            return Ok(());
        }
        match self.types[index] {
            Some(expected) if expected != value.value_type() => Err(StateError::StateValueType {
                expected,
                actual: value.value_type(),
            }),
            _ => Ok(()),
        }
    }

    fn fix_type(&mut self, index: usize, value: &StateValue) {
        if !value.is_null() && self.types[index].is_none() {
            self.types[index] = Some(value.value_type());
        }
    }

    /// Whether `quark` could take `value`: the quark exists, the value
    /// matches its fixed type, and an interval holding it fits in a node.
    pub fn check_change(&self, quark: Quark, value: &StateValue, history: &HistoryTree) -> Result<()> {
        let index = self.slot(quark)?;
        self.check_type(index, value)?;
        history.check_value_fits(value)
    }

    /// Record that `quark` takes `value` at time `t`, handing the interval it
    /// closes to `history`.
    pub fn process_change(
        &mut self,
        t: i64,
        value: StateValue,
        quark: Quark,
        history: &HistoryTree,
    ) -> Result<()> {
        self.check_change(quark, &value, history)?;
        let index = quark.index();

        if self.values[index] != value {
            let start = self.starts[index];
            if start < t {
                let previous = self.values[index].clone();
                history.insert(Interval::new(quark, start, t - 1, previous)?)?;
            }
            self.fix_type(index, &value);
            self.values[index] = value;
            self.starts[index] = t;
        }

        self.latest_time = self.latest_time.max(t);
        Ok(())
    }

    /// Replace the ongoing value of `quark` without closing an interval.
    pub fn update_ongoing(
        &mut self,
        value: StateValue,
        quark: Quark,
        history: &HistoryTree,
    ) -> Result<()> {
        self.check_change(quark, &value, history)?;
        let index = quark.index();
        self.fix_type(index, &value);
        self.values[index] = value;
        Ok(())
    }

    /// Make `value` the ongoing value of `quark` since `start`, as if it had
    /// been assigned then.
    pub fn seed(
        &mut self,
        quark: Quark,
        value: StateValue,
        start: i64,
        history: &HistoryTree,
    ) -> Result<()> {
        self.check_change(quark, &value, history)?;
        let index = quark.index();
        self.fix_type(index, &value);
        self.values[index] = value;
        self.starts[index] = start;
        self.latest_time = self.latest_time.max(start);
        Ok(())
    }

    pub fn advance_to(&mut self, t: i64) {
        self.latest_time = self.latest_time.max(t);
    }

    /// Close every ongoing interval at `end` and stop tracking values.
    ///
    /// Values are only dropped once every interval is in history. After a
    /// failure, quarks already flushed start past `end`, so a retry at the
    /// same time commits the rest exactly once.
    pub fn close(&mut self, end: i64, history: &HistoryTree) -> Result<()> {
        for index in 0..self.values.len() {
            let start = self.starts[index];
            if start <= end {
                let value = self.values[index].clone();
                history.insert(Interval::new(Quark(index as u32), start, end, value)?)?;
                self.starts[index] = end + 1;
            }
        }
        self.values.clear();
        self.starts.clear();
        self.latest_time = end;
        self.active = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HistoryConfig;

    fn history() -> HistoryTree {
        HistoryTree::in_memory(HistoryConfig {
            start_time: 0,
            block_size: 4096,
            max_children: 4,
            provider_version: 1,
            cache_size: 8,
        })
        .unwrap()
    }

    #[test]
    fn test_change_closes_previous_interval() {
        let history = history();
        let mut state = TransientState::new(0);
        state.ensure(1);

        state.process_change(5, StateValue::Int(1), Quark(0), &history).unwrap();
        let closed = history.query_point(Quark(0), 2).unwrap().unwrap();
        assert_eq!((closed.start, closed.end), (0, 4));
        assert!(closed.value.is_null());

        let ongoing = state.interval_at(Quark(0), 5).unwrap();
        assert_eq!((ongoing.start, ongoing.end), (5, 5));
        assert!(state.interval_at(Quark(0), 4).is_none());
        assert!(state.interval_at(Quark(0), 6).is_none());
    }

    #[test]
    fn test_same_value_is_merged() {
        let history = history();
        let mut state = TransientState::new(0);
        state.ensure(1);

        state.process_change(2, StateValue::Int(1), Quark(0), &history).unwrap();
        state.process_change(6, StateValue::Int(1), Quark(0), &history).unwrap();
        assert_eq!(state.ongoing_start(Quark(0)).unwrap(), 2);
        assert_eq!(state.latest_time(), 6);
        assert_eq!(history.end_time(), 1);
    }

    #[test]
    fn test_same_timestamp_overwrites() {
        let history = history();
        let mut state = TransientState::new(0);
        state.ensure(1);

        state.process_change(3, StateValue::Int(1), Quark(0), &history).unwrap();
        state.process_change(3, StateValue::Int(2), Quark(0), &history).unwrap();
        assert_eq!(state.ongoing_value(Quark(0)).unwrap(), &StateValue::Int(2));
        assert!(history.query_point(Quark(0), 3).unwrap().is_none());
    }

    #[test]
    fn test_type_is_fixed_by_first_value() {
        let history = history();
        let mut state = TransientState::new(0);
        state.ensure(1);

        state.process_change(1, StateValue::Int(1), Quark(0), &history).unwrap();
        state.process_change(2, StateValue::Null, Quark(0), &history).unwrap();
        let err = state
            .process_change(3, StateValue::Long(1), Quark(0), &history)
            .unwrap_err();
        assert!(matches!(
            err,
            StateError::StateValueType {
                expected: ValueType::Int,
                actual: ValueType::Long
            }
        ));
        // Rejected change left the ongoing value alone.
        assert!(state.ongoing_value(Quark(0)).unwrap().is_null());
    }

    #[test]
    fn test_close_flushes_everything() {
        let history = history();
        let mut state = TransientState::new(0);
        state.ensure(2);
        state.process_change(4, StateValue::from("a"), Quark(1), &history).unwrap();
        state.close(10, &history).unwrap();

        assert!(!state.is_active());
        assert_eq!(state.latest_time(), 10);
        let q0 = history.query_point(Quark(0), 10).unwrap().unwrap();
        assert_eq!((q0.start, q0.end), (0, 10));
        let q1 = history.query_point(Quark(1), 7).unwrap().unwrap();
        assert_eq!(q1.value, StateValue::from("a"));
    }

    #[test]
    fn test_oversized_value_rejected_on_arrival() {
        let history = history();
        let mut state = TransientState::new(0);
        state.ensure(1);
        state.process_change(2, StateValue::from("ok"), Quark(0), &history).unwrap();

        let big = StateValue::String("x".repeat(5000));
        assert!(matches!(
            state.process_change(4, big.clone(), Quark(0), &history),
            Err(StateError::IntervalTooLarge { .. })
        ));
        assert!(state.update_ongoing(big.clone(), Quark(0), &history).is_err());
        assert!(state.seed(Quark(0), big, 0, &history).is_err());
        assert_eq!(state.ongoing_value(Quark(0)).unwrap(), &StateValue::from("ok"));
        assert_eq!(state.ongoing_start(Quark(0)).unwrap(), 2);
        assert_eq!(history.end_time(), 1);
    }

    #[test]
    fn test_failed_close_can_be_retried() {
        let history = history();
        let mut state = TransientState::new(0);
        state.ensure(2);
        state.process_change(3, StateValue::Int(7), Quark(0), &history).unwrap();
        // Slipped past the arrival checks, so only the history insert fails.
        state.values[1] = StateValue::String("x".repeat(5000));

        assert!(state.close(10, &history).is_err());
        assert!(state.is_active());
        assert_eq!(state.ongoing_value(Quark(0)).unwrap(), &StateValue::Int(7));

        state.values[1] = StateValue::from("y");
        state.close(10, &history).unwrap();

        let q0 = history.query_range(Quark(0), 0, 10).unwrap();
        let spans: Vec<(i64, i64)> = q0.iter().map(|i| (i.start, i.end)).collect();
        assert_eq!(spans, vec![(0, 2), (3, 10)]);
        assert_eq!(q0[1].value, StateValue::Int(7));
        let q1 = history.query_point(Quark(1), 10).unwrap().unwrap();
        assert_eq!((q1.start, q1.value), (0, StateValue::from("y")));
    }

    #[test]
    fn test_unknown_quark() {
        let state = TransientState::new(0);
        assert!(matches!(
            state.ongoing_value(Quark(3)),
            Err(StateError::AttributeNotFound(_))
        ));
    }
}
