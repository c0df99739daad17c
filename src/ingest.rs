//! Write-side ingestion: state commands and a dedicated writer thread.
//!
//! Producers describe each change as a [`StateCommand`] (timestamp,
//! attribute path, operation, value). A [`Writer`] runs the builder on its
//! own thread and applies commands in the order they are received; readers
//! query the store through [`Writer::state_system`] meanwhile.

use crate::error::{Result, StateError};
use crate::system::{StateSystem, StateSystemBuilder};
use crate::value::StateValue;
use crossbeam_channel::{bounded, Sender};
use serde::{Deserialize, Serialize};
use std::thread::{self, JoinHandle};
use tracing::{info, warn};

/// What a command does to its attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Modify,
    Push,
    Pop,
    Remove,
}

/// One change to apply to the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateCommand {
    pub timestamp: i64,
    pub path: Vec<String>,
    pub operation: Operation,
    #[serde(default)]
    pub value: StateValue,
}

impl StateCommand {
    fn new(timestamp: i64, path: &[&str], operation: Operation, value: StateValue) -> Self {
        Self {
            timestamp,
            path: path.iter().map(|s| s.to_string()).collect(),
            operation,
            value,
        }
    }

    pub fn modify(timestamp: i64, path: &[&str], value: impl Into<StateValue>) -> Self {
        Self::new(timestamp, path, Operation::Modify, value.into())
    }

    pub fn push(timestamp: i64, path: &[&str], value: impl Into<StateValue>) -> Self {
        Self::new(timestamp, path, Operation::Push, value.into())
    }

    pub fn pop(timestamp: i64, path: &[&str]) -> Self {
        Self::new(timestamp, path, Operation::Pop, StateValue::Null)
    }

    pub fn remove(timestamp: i64, path: &[&str]) -> Self {
        Self::new(timestamp, path, Operation::Remove, StateValue::Null)
    }

    /// Apply this command, creating its attribute if needed. Returns the
    /// popped value for `Pop`.
    pub fn apply(self, builder: &mut StateSystemBuilder) -> Result<Option<StateValue>> {
        let quark = builder.get_quark_add(self.path.as_slice())?;
        match self.operation {
            Operation::Modify => builder
                .modify_attribute(self.timestamp, self.value, quark)
                .map(|_| None),
            Operation::Push => builder
                .push_attribute(self.timestamp, self.value, quark)
                .map(|_| None),
            Operation::Pop => builder.pop_attribute(self.timestamp, quark).map(Some),
            Operation::Remove => builder
                .remove_attribute(self.timestamp, quark)
                .map(|_| None),
        }
    }
}

/// Builder running on a dedicated thread, fed through a bounded channel.
///
/// The store is sealed at the last received timestamp once every sender is
/// gone. The first failing command stops the thread; the build is then
/// cancelled and [`Writer::finish`] returns the error.
pub struct Writer {
    sender: Sender<StateCommand>,
    state_system: StateSystem,
    handle: JoinHandle<Result<u64>>,
}

/// Move `builder` to a new writer thread accepting up to `capacity` queued
/// commands.
pub fn spawn_writer(mut builder: StateSystemBuilder, capacity: usize) -> Result<Writer> {
    let (sender, receiver) = bounded::<StateCommand>(capacity.max(1));
    let state_system = builder.state_system();
    let store_id = state_system.store_id().to_string();

    let handle = thread::Builder::new()
        .name(format!("state-writer-{}", store_id))
        .spawn(move || {
            info!(store_id = %store_id, "Writer thread started");
            let mut end = builder.state_system().start_time();
            let mut applied = 0u64;
            for command in receiver.iter() {
                end = end.max(command.timestamp);
                if let Err(e) = command.apply(&mut builder) {
                    warn!(store_id = %store_id, error = %e, applied, "Writer thread stopped");
                    return Err(e);
                }
                applied += 1;
            }
            builder.close(end)?;
            info!(store_id = %store_id, applied, end, "Writer thread finished");
            Ok(applied)
        })?;

    Ok(Writer {
        sender,
        state_system,
        handle,
    })
}

impl Writer {
    /// Queue a command, blocking while the channel is full.
    ///
    /// Fails with `Sealed` once the writer thread has stopped.
    pub fn send(&self, command: StateCommand) -> Result<()> {
        self.sender.send(command).map_err(|_| StateError::Sealed)
    }

    /// Another sender for producers on other threads.
    pub fn sender(&self) -> Sender<StateCommand> {
        self.sender.clone()
    }

    pub fn state_system(&self) -> StateSystem {
        self.state_system.clone()
    }

    /// Stop accepting commands and wait for the store to be sealed.
    /// Returns the number of commands applied.
    ///
    /// Senders obtained from [`Writer::sender`] must be dropped first.
    pub fn finish(self) -> Result<u64> {
        drop(self.sender);
        match self.handle.join() {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}
