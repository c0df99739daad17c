//! Multi-reader query facade.

use super::{Progress, Shared};
use crate::error::{Result, StateError};
use crate::types::{Interval, Quark, StoreMetadata};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Read handle on a state history.
///
/// Handles are cheap to clone and can be used from any number of threads,
/// while the store is still being built or after it was sealed. Queries see
/// a consistent prefix of what the writer committed.
#[derive(Clone)]
pub struct StateSystem {
    shared: Arc<Shared>,
}

impl StateSystem {
    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    fn check_disposed(&self) -> Result<()> {
        if self.shared.is_disposed() {
            return Err(StateError::Disposed);
        }
        Ok(())
    }

    fn check_quark(&self, quark: Quark) -> Result<()> {
        if quark.index() >= self.shared.attributes.read().len() {
            return Err(StateError::AttributeNotFound(format!("quark {}", quark)));
        }
        Ok(())
    }

    fn check_time(&self, t: i64) -> Result<()> {
        let start = self.start_time();
        let end = self.current_end_time();
        if t < start || t > end {
            return Err(StateError::TimeRange { time: t, start, end });
        }
        Ok(())
    }

    // --- Queries ---

    /// The interval of `quark` containing `t`.
    pub fn query_single_state(&self, t: i64, quark: Quark) -> Result<Interval> {
        self.check_disposed()?;
        self.check_quark(quark)?;
        self.check_time(t)?;
        self.single_state(t, quark)
    }

    // Intervals only ever move from the transient state into history, and
    // history is append-only: once the transient state misses `t`, the
    // interval is in history and the lock can go before the descent.
    fn single_state(&self, t: i64, quark: Quark) -> Result<Interval> {
        if let Some(interval) = self.shared.transient.read().interval_at(quark, t) {
            return Ok(interval);
        }
        self.shared.history.query_point(quark, t)?.ok_or_else(|| {
            StateError::Corruption(format!("No interval for quark {} at time {}", quark, t))
        })
    }

    /// One interval per quark, each containing `t`, indexed by quark.
    pub fn query_full_state(&self, t: i64) -> Result<Vec<Interval>> {
        Ok(self
            .full_state(t)?
            .into_iter()
            .map(|(interval, _)| interval)
            .collect())
    }

    /// Full state at `t`, with each interval flagged when it is still
    /// ongoing.
    pub(crate) fn full_state(&self, t: i64) -> Result<Vec<(Interval, bool)>> {
        self.check_disposed()?;
        self.check_time(t)?;

        let count = self.shared.attributes.read().len();
        let mut slots = vec![None; count];
        self.shared.transient.read().collect_at(t, &mut slots);
        let ongoing: Vec<bool> = slots.iter().map(Option::is_some).collect();
        self.shared.history.query_full(t, &mut slots)?;

        slots
            .into_iter()
            .zip(ongoing)
            .enumerate()
            .map(|(index, (slot, ongoing))| {
                slot.map(|interval| (interval, ongoing)).ok_or_else(|| {
                    StateError::Corruption(format!("No interval for quark {} at time {}", index, t))
                })
            })
            .collect()
    }

    /// Every interval of `quark` overlapping `[start, end]`, ordered by
    /// start time. The bounds are clamped to the store's time range.
    pub fn query_history_range(&self, quark: Quark, start: i64, end: i64) -> Result<Vec<Interval>> {
        self.check_disposed()?;
        self.check_quark(quark)?;

        let store_start = self.start_time();
        let store_end = self.current_end_time();
        if end < start || end < store_start || start > store_end {
            return Err(StateError::TimeRange {
                time: if start > store_end { start } else { end },
                start: store_start,
                end: store_end,
            });
        }

        let end = end.min(store_end);
        let mut t = start.max(store_start);
        // Closed intervals come straight from history; the ongoing tail, if
        // any, from the transient state.
        let mut intervals = self.shared.history.query_range(quark, t, end)?;
        if let Some(last) = intervals.last() {
            t = last.end.saturating_add(1);
        }
        while t <= end {
            let interval = self.single_state(t, quark)?;
            t = interval.end.saturating_add(1);
            intervals.push(interval);
        }
        Ok(intervals)
    }

    // --- Build progress ---

    /// Block until the store is sealed, at most `timeout`.
    ///
    /// Returns whether the store is fully built. A cancelled or disposed
    /// store returns `false` right away.
    pub fn wait_until_built(&self, timeout: Duration) -> bool {
        self.wait_for(timeout, |progress| progress.built)
    }

    /// Block until the store has committed data up to `t` or was sealed,
    /// at most `timeout`. Returns whether `t` is now queryable.
    pub fn wait_until_reached(&self, t: i64, timeout: Duration) -> bool {
        self.wait_for(timeout, |progress| {
            progress.built || self.shared.current_end_time() >= t
        });
        !self.is_disposed() && self.current_end_time() >= t
    }

    /// Wait on build progress until `done` holds, the build is cancelled or
    /// disposed, or `timeout` passes. Returns the final `done` outcome.
    fn wait_for(&self, timeout: Duration, done: impl Fn(&Progress) -> bool) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut progress = self.shared.progress.lock();
        loop {
            if progress.cancelled || self.shared.is_disposed() {
                return false;
            }
            if done(&progress) {
                return true;
            }
            match deadline {
                Some(deadline) => {
                    if self
                        .shared
                        .progress_changed
                        .wait_until(&mut progress, deadline)
                        .timed_out()
                    {
                        return !progress.cancelled && done(&progress);
                    }
                }
                None => self.shared.progress_changed.wait(&mut progress),
            }
        }
    }

    pub fn is_built(&self) -> bool {
        self.shared.progress.lock().built
    }

    /// Whether the builder went away without sealing the store.
    pub fn is_cancelled(&self) -> bool {
        self.shared.progress.lock().cancelled
    }

    pub fn start_time(&self) -> i64 {
        self.shared.start_time()
    }

    /// Latest committed timestamp. Never decreases.
    pub fn current_end_time(&self) -> i64 {
        self.shared.current_end_time()
    }

    pub fn store_id(&self) -> &str {
        &self.shared.store_id
    }

    pub fn metadata(&self) -> StoreMetadata {
        StoreMetadata {
            provider_version: self.shared.history.provider_version(),
            start_time: self.start_time(),
            current_end_time: self.current_end_time(),
            built: self.is_built(),
        }
    }

    /// Number of nodes in the history tree.
    pub fn node_count(&self) -> u32 {
        self.shared.history.node_count()
    }

    /// Levels of the history tree.
    pub fn history_depth(&self) -> Result<usize> {
        self.shared.history.depth()
    }

    /// Invalidate this store for every handle sharing it.
    ///
    /// Later queries fail with `Disposed`, waiters wake up and return
    /// `false`, and an active builder stops accepting writes.
    pub fn dispose(&self) {
        if !self.shared.disposed.swap(true, Ordering::AcqRel) {
            debug!(store_id = %self.shared.store_id, "State system disposed");
            self.shared.notify_progress(|_| ());
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    // --- Attributes ---

    pub fn quark_count(&self) -> usize {
        self.shared.attributes.read().len()
    }

    pub fn opt_quark<S: AsRef<str>>(&self, path: &[S]) -> Option<Quark> {
        self.shared.attributes.read().opt_quark(path)
    }

    pub fn opt_quark_relative<S: AsRef<str>>(&self, parent: Quark, path: &[S]) -> Option<Quark> {
        self.shared
            .attributes
            .read()
            .opt_quark_relative(Some(parent), path)
    }

    /// Quark of an absolute path, failing with `AttributeNotFound`.
    pub fn quark<S: AsRef<str>>(&self, path: &[S]) -> Result<Quark> {
        self.check_disposed()?;
        self.opt_quark(path).ok_or_else(|| {
            let segments: Vec<&str> = path.iter().map(AsRef::as_ref).collect();
            StateError::AttributeNotFound(segments.join("/"))
        })
    }

    /// Quarks matching `pattern`, where `*` matches any single segment and
    /// `..` moves to the parent.
    pub fn quarks_matching<S: AsRef<str>>(&self, pattern: &[S]) -> Vec<Quark> {
        self.shared.attributes.read().quarks_matching(pattern)
    }

    pub fn quarks_matching_from<S: AsRef<str>>(&self, start: Quark, pattern: &[S]) -> Vec<Quark> {
        self.shared
            .attributes
            .read()
            .quarks_matching_from(Some(start), pattern)
    }

    pub fn full_path(&self, quark: Quark) -> Result<Vec<String>> {
        self.check_disposed()?;
        self.shared.attributes.read().full_path(quark)
    }

    pub fn full_path_string(&self, quark: Quark) -> Result<String> {
        self.check_disposed()?;
        self.shared.attributes.read().full_path_string(quark)
    }

    pub fn name(&self, quark: Quark) -> Result<String> {
        self.check_disposed()?;
        Ok(self.shared.attributes.read().name(quark)?.to_string())
    }

    pub fn parent(&self, quark: Quark) -> Result<Option<Quark>> {
        self.check_disposed()?;
        self.shared.attributes.read().parent(quark)
    }

    /// Children of `quark` (top-level attributes for `None`) in creation
    /// order; the whole subtree with `recursive`.
    pub fn sub_attributes(&self, quark: Option<Quark>, recursive: bool) -> Result<Vec<Quark>> {
        self.check_disposed()?;
        self.shared.attributes.read().sub_attributes(quark, recursive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use crate::system::StateSystemBuilder;
    use crate::value::StateValue;

    #[test]
    fn test_queries_while_building() {
        let mut builder = StateSystemBuilder::create(StoreConfig::in_memory(0)).unwrap();
        let ss = builder.state_system();
        let q = builder.get_quark_add(&["a"]).unwrap();
        builder.modify_attribute(10, 1, q).unwrap();
        builder.modify_attribute(20, 2, q).unwrap();

        assert_eq!(ss.current_end_time(), 20);
        let ongoing = ss.query_single_state(20, q).unwrap();
        assert_eq!((ongoing.start, ongoing.end), (20, 20));
        let closed = ss.query_single_state(15, q).unwrap();
        assert_eq!((closed.start, closed.end), (10, 19));
        assert!(matches!(
            ss.query_single_state(21, q),
            Err(StateError::TimeRange { time: 21, start: 0, end: 20 })
        ));
    }

    #[test]
    fn test_full_state_flags_ongoing() {
        let mut builder = StateSystemBuilder::create(StoreConfig::in_memory(0)).unwrap();
        let a = builder.get_quark_add(&["a"]).unwrap();
        let b = builder.get_quark_add(&["b"]).unwrap();
        builder.modify_attribute(5, 1, a).unwrap();
        builder.modify_attribute(8, 2, b).unwrap();

        let ss = builder.state_system();
        let full = ss.full_state(6).unwrap();
        assert_eq!(full.len(), 2);
        assert_eq!(full[a.index()].0.value, StateValue::Int(1));
        assert!(full[a.index()].1);
        assert!(full[b.index()].0.value.is_null());
        assert!(!full[b.index()].1);
    }

    #[test]
    fn test_history_range_is_clamped() {
        let mut builder = StateSystemBuilder::create(StoreConfig::in_memory(0)).unwrap();
        let q = builder.get_quark_add(&["a"]).unwrap();
        for t in [10, 20, 30] {
            builder.modify_attribute(t, t, q).unwrap();
        }
        builder.close(40).unwrap();
        let ss = builder.state_system();

        let range = ss.query_history_range(q, -100, 25).unwrap();
        let starts: Vec<i64> = range.iter().map(|i| i.start).collect();
        assert_eq!(starts, vec![0, 10, 20]);

        assert!(ss.query_history_range(q, 30, 10).is_err());
        assert!(ss.query_history_range(q, 41, 50).is_err());
    }

    #[test]
    fn test_history_range_reaches_ongoing_tail() {
        let mut builder = StateSystemBuilder::create(StoreConfig::in_memory(0)).unwrap();
        let q = builder.get_quark_add(&["a"]).unwrap();
        for t in [10, 20, 30] {
            builder.modify_attribute(t, t, q).unwrap();
        }
        let ss = builder.state_system();

        let range = ss.query_history_range(q, 5, 100).unwrap();
        let spans: Vec<(i64, i64)> = range.iter().map(|i| (i.start, i.end)).collect();
        assert_eq!(spans, vec![(0, 9), (10, 19), (20, 29), (30, 30)]);
        assert_eq!(range[3].value, StateValue::Int(30));
    }

    #[test]
    fn test_dispose() {
        let mut builder = StateSystemBuilder::create(StoreConfig::in_memory(0)).unwrap();
        let q = builder.get_quark_add(&["a"]).unwrap();
        let ss = builder.state_system();
        let other = ss.clone();

        ss.dispose();
        assert!(other.is_disposed());
        assert!(matches!(other.query_single_state(0, q), Err(StateError::Disposed)));
        assert!(matches!(other.query_full_state(0), Err(StateError::Disposed)));
        assert!(matches!(builder.modify_attribute(1, 1, q), Err(StateError::Disposed)));
        assert!(!other.wait_until_built(Duration::from_secs(1)));
    }

    #[test]
    fn test_attribute_lookups() {
        let mut builder = StateSystemBuilder::create(StoreConfig::in_memory(0)).unwrap();
        let thread = builder.get_quark_add(&["Threads", "12", "Status"]).unwrap();
        let ss = builder.state_system();

        assert_eq!(ss.quark(&["Threads", "12", "Status"]).unwrap(), thread);
        assert!(matches!(
            ss.quark(&["Threads", "13"]),
            Err(StateError::AttributeNotFound(path)) if path == "Threads/13"
        ));
        assert_eq!(ss.full_path_string(thread).unwrap(), "Threads/12/Status");
        assert_eq!(ss.name(thread).unwrap(), "Status");
        let tid = ss.parent(thread).unwrap().unwrap();
        assert_eq!(ss.opt_quark_relative(tid, &["Status"]), Some(thread));
        assert_eq!(ss.quarks_matching_from(thread, &["..", "..", "*"]), vec![tid]);
        assert_eq!(ss.quark_count(), 3);
    }
}
