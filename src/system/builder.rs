//! Single-writer facade used by producers while events are processed.

use super::reader::StateSystem;
use super::transient::TransientState;
use super::Shared;
use crate::error::{Result, StateError};
use crate::history::HistoryTree;
use crate::snapshot::Snapshot;
use crate::types::Quark;
use crate::value::{StateValue, ValueType};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Deepest a stack attribute may grow.
pub const MAX_STACK_DEPTH: i32 = 100_000;

/// The writer side of a state history.
///
/// Exactly one builder exists per store. It owns the right to grow the
/// attribute tree and to append values; any number of [`StateSystem`]
/// handles taken from it can query concurrently. Timestamps passed to the
/// write operations must be non-decreasing.
///
/// Dropping a builder without calling [`close`](Self::close) cancels the
/// build: waiters are woken and the persisted files stay unsealed.
pub struct StateSystemBuilder {
    shared: Arc<Shared>,
    closed: bool,
}

impl StateSystemBuilder {
    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            closed: false,
        }
    }

    /// A reader handle on the store being built.
    pub fn state_system(&self) -> StateSystem {
        StateSystem::from_shared(Arc::clone(&self.shared))
    }

    fn check_writable(&self) -> Result<()> {
        if self.closed {
            return Err(StateError::Sealed);
        }
        if self.shared.is_disposed() {
            return Err(StateError::Disposed);
        }
        Ok(())
    }

    fn check_time(&self, t: i64) -> Result<()> {
        let latest = self.shared.transient.read().latest_time();
        if t < latest {
            return Err(StateError::OutOfOrderInsertion { time: t, latest });
        }
        Ok(())
    }

    /// Run one change against the transient state at time `t`, waking
    /// progress waiters when time moved forward.
    fn write<R>(
        &mut self,
        t: i64,
        change: impl FnOnce(&mut TransientState, &HistoryTree) -> Result<R>,
    ) -> Result<R> {
        self.check_writable()?;
        let (result, advanced) = {
            let mut transient = self.shared.transient.write();
            let latest = transient.latest_time();
            if t < latest {
                return Err(StateError::OutOfOrderInsertion { time: t, latest });
            }
            let result = change(&mut *transient, &self.shared.history)?;
            (result, transient.latest_time() > latest)
        };
        if advanced {
            self.shared.notify_progress(|_| ());
        }
        Ok(result)
    }

    // --- Attributes ---

    /// Get the quark of an absolute path, creating it if needed.
    pub fn get_quark_add<S: AsRef<str>>(&mut self, path: &[S]) -> Result<Quark> {
        self.add_quark(None, path)
    }

    /// Get the quark of a path below `parent`, creating it if needed.
    pub fn get_quark_relative_add<S: AsRef<str>>(
        &mut self,
        parent: Quark,
        path: &[S],
    ) -> Result<Quark> {
        self.add_quark(Some(parent), path)
    }

    fn add_quark<S: AsRef<str>>(&mut self, parent: Option<Quark>, path: &[S]) -> Result<Quark> {
        self.check_writable()?;
        // New quarks get their transient slot before readers can see them.
        let mut transient = self.shared.transient.write();
        let mut attributes = self.shared.attributes.write();
        let quark = match parent {
            None => attributes.get_quark_add(path)?,
            Some(p) => attributes.get_quark_relative_add(Some(p), path)?,
        };
        transient.ensure(attributes.len());
        Ok(quark)
    }

    pub fn opt_quark<S: AsRef<str>>(&self, path: &[S]) -> Option<Quark> {
        self.shared.attributes.read().opt_quark(path)
    }

    // --- Values ---

    /// Give `quark` a new value from time `t` on.
    ///
    /// The quark's previous interval is closed at `t - 1`. Assigning the
    /// value the quark already holds changes nothing, and a second change at
    /// the same timestamp replaces the first.
    pub fn modify_attribute(
        &mut self,
        t: i64,
        value: impl Into<StateValue>,
        quark: Quark,
    ) -> Result<()> {
        let value = value.into();
        let start = self.shared.start_time();
        if t < start {
            return Err(StateError::TimeRange {
                time: t,
                start,
                end: self.shared.current_end_time(),
            });
        }
        self.write(t, |transient, history| {
            transient.process_change(t, value, quark, history)
        })
    }

    /// Push `value` onto the stack held by `quark`.
    ///
    /// The stack attribute holds the depth; element `k` lives in the child
    /// attribute named `k`.
    pub fn push_attribute(
        &mut self,
        t: i64,
        value: impl Into<StateValue>,
        quark: Quark,
    ) -> Result<()> {
        self.check_writable()?;
        self.check_time(t)?;

        let depth = self.stack_depth(quark)?;
        if depth >= MAX_STACK_DEPTH {
            return Err(StateError::StackOverflow(quark));
        }
        let depth = depth + 1;
        let element = self.get_quark_relative_add(quark, &[depth.to_string()])?;

        // Both writes are checked up front so a rejected value leaves the
        // depth untouched.
        let value = value.into();
        {
            let transient = self.shared.transient.read();
            transient.check_change(quark, &StateValue::Int(depth), &self.shared.history)?;
            transient.check_change(element, &value, &self.shared.history)?;
        }

        self.modify_attribute(t, depth, quark)?;
        self.modify_attribute(t, value, element)
    }

    /// Pop the top of the stack held by `quark`, returning the popped value.
    ///
    /// Fails with `EmptyStack` when there is nothing to pop.
    pub fn pop_attribute(&mut self, t: i64, quark: Quark) -> Result<StateValue> {
        self.check_writable()?;
        self.check_time(t)?;

        let depth = self.stack_depth(quark)?;
        if depth <= 0 {
            return Err(StateError::EmptyStack(quark));
        }
        let element = self
            .shared
            .attributes
            .read()
            .opt_quark_relative(Some(quark), &[depth.to_string()])
            .ok_or_else(|| {
                StateError::AttributeNotFound(format!("stack element {} of quark {}", depth, quark))
            })?;
        let popped = self.query_ongoing(element)?;

        let remaining = if depth > 1 {
            StateValue::Int(depth - 1)
        } else {
            StateValue::Null
        };
        self.modify_attribute(t, remaining, quark)?;
        self.remove_attribute(t, element)?;
        Ok(popped)
    }

    fn stack_depth(&self, quark: Quark) -> Result<i32> {
        match self.query_ongoing(quark)? {
            StateValue::Null => Ok(0),
            StateValue::Int(depth) => Ok(depth),
            other => Err(StateError::StateValueType {
                expected: ValueType::Int,
                actual: other.value_type(),
            }),
        }
    }

    /// Set `quark` and its whole subtree to `Null` from time `t` on.
    pub fn remove_attribute(&mut self, t: i64, quark: Quark) -> Result<()> {
        self.check_writable()?;
        self.check_time(t)?;

        let subtree = self.shared.attributes.read().sub_attributes(Some(quark), true)?;
        for child in subtree {
            self.modify_attribute(t, StateValue::Null, child)?;
        }
        self.modify_attribute(t, StateValue::Null, quark)
    }

    /// The value `quark` currently holds.
    pub fn query_ongoing(&self, quark: Quark) -> Result<StateValue> {
        self.shared.transient.read().ongoing_value(quark).cloned()
    }

    /// When `quark` took its current value.
    pub fn ongoing_start_time(&self, quark: Quark) -> Result<i64> {
        self.shared.transient.read().ongoing_start(quark)
    }

    /// Replace the current value of `quark` without closing an interval,
    /// as if it had held `value` since its ongoing start time.
    pub fn update_ongoing_state(&mut self, value: impl Into<StateValue>, quark: Quark) -> Result<()> {
        self.check_writable()?;
        self.shared
            .transient
            .write()
            .update_ongoing(value.into(), quark, &self.shared.history)
    }

    // --- Snapshots ---

    /// Seed an empty store with the state captured in `snapshot`.
    ///
    /// Every attribute in the snapshot is created and takes its captured
    /// value from the captured interval's start. Writing resumes at the
    /// snapshot timestamp.
    pub fn load_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.check_writable()?;
        if snapshot.store_id != self.shared.store_id {
            return Err(StateError::SnapshotRejected(format!(
                "snapshot is for store '{}', not '{}'",
                snapshot.store_id, self.shared.store_id
            )));
        }

        let store_start = self.shared.start_time();
        if snapshot.timestamp < store_start {
            return Err(StateError::SnapshotRejected(format!(
                "snapshot time {} is before store start {}",
                snapshot.timestamp, store_start
            )));
        }

        {
            let mut transient = self.shared.transient.write();
            if transient.latest_time() > store_start || self.shared.history.end_time() > store_start {
                return Err(StateError::SnapshotRejected(
                    "store already holds history".into(),
                ));
            }

            let mut seeds = Vec::with_capacity(snapshot.attributes.len());
            {
                let mut attributes = self.shared.attributes.write();
                for attribute in &snapshot.attributes {
                    let quark = attributes.get_quark_add(attribute.path.as_slice())?;
                    let start = attribute.interval.start.clamp(store_start, snapshot.timestamp);
                    seeds.push((quark, attribute.interval.value.clone(), start));
                }
                transient.ensure(attributes.len());
            }

            for (quark, value, _) in &seeds {
                transient.check_change(*quark, value, &self.shared.history)?;
            }

            // History must be fed in end-time order.
            seeds.sort_by_key(|(_, _, start)| *start);
            for (quark, value, start) in seeds {
                if value.is_null() {
                    continue;
                }
                if start > store_start {
                    transient.process_change(start, value, quark, &self.shared.history)?;
                } else {
                    transient.seed(quark, value, start, &self.shared.history)?;
                }
            }
            transient.advance_to(snapshot.timestamp);
        }
        self.shared.notify_progress(|_| ());

        info!(
            store_id = %snapshot.store_id,
            timestamp = snapshot.timestamp,
            attributes = snapshot.attributes.len(),
            "Loaded state snapshot"
        );
        Ok(())
    }

    // --- Lifecycle ---

    /// Seal the store at `end_time`.
    ///
    /// Every ongoing interval is closed at `end_time`, or at the latest time
    /// already written if that is later. A file-backed store persists its
    /// attribute tree and marks its history as built.
    pub fn close(&mut self, end_time: i64) -> Result<()> {
        self.check_writable()?;
        let shared = &self.shared;
        let end = {
            let mut transient = shared.transient.write();
            let end = end_time
                .max(transient.latest_time())
                .max(shared.history.end_time());
            transient.close(end, &shared.history)?;
            if let Some(files) = &shared.files {
                shared
                    .attributes
                    .read()
                    .save(files.attributes_path(), shared.history.provider_version())?;
            }
            shared.history.close(end)?;
            end
        };

        self.closed = true;
        shared.notify_progress(|progress| progress.built = true);
        info!(
            store_id = %shared.store_id,
            end,
            quarks = shared.attributes.read().len(),
            "State history built"
        );
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for StateSystemBuilder {
    fn drop(&mut self) {
        if !self.closed {
            if self.shared.is_disposed() {
                debug!(store_id = %self.shared.store_id, "Builder dropped after dispose");
            } else {
                warn!(store_id = %self.shared.store_id, "Builder dropped before close, build cancelled");
            }
            self.shared.notify_progress(|progress| progress.cancelled = true);
        }
    }
}
