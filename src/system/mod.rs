//! State system: single-writer builder and multi-reader query facade.
//!
//! A [`StateSystemBuilder`] and every [`StateSystem`] handle cloned from it
//! share one set of structures:
//! - the attribute tree, grown only by the writer,
//! - the transient state holding each quark's ongoing value,
//! - the history tree of closed intervals.
//!
//! The writer updates the transient state and the history tree under the
//! transient write lock, so a reader holding the read lock sees every quark
//! either in its ongoing interval or in history, never in between.

mod builder;
mod reader;
mod transient;

pub use builder::{StateSystemBuilder, MAX_STACK_DEPTH};
pub use reader::StateSystem;

use crate::attribute::AttributeTree;
use crate::history::HistoryTree;
use crate::store::StoreFiles;
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use transient::TransientState;

#[derive(Debug, Default)]
pub(crate) struct Progress {
    pub built: bool,
    pub cancelled: bool,
}

pub(crate) struct Shared {
    pub store_id: String,
    pub attributes: RwLock<AttributeTree>,
    pub transient: RwLock<TransientState>,
    pub history: HistoryTree,
    pub disposed: AtomicBool,
    pub progress: Mutex<Progress>,
    pub progress_changed: Condvar,
    /// Directory and lock of a file-backed store.
    pub files: Option<StoreFiles>,
}

impl Shared {
    /// Shared state of a store still being written.
    pub fn building(
        store_id: String,
        attributes: AttributeTree,
        history: HistoryTree,
        files: Option<StoreFiles>,
    ) -> Self {
        let mut transient = TransientState::new(history.start_time());
        transient.ensure(attributes.len());
        Self {
            store_id,
            attributes: RwLock::new(attributes),
            transient: RwLock::new(transient),
            history,
            disposed: AtomicBool::new(false),
            progress: Mutex::new(Progress::default()),
            progress_changed: Condvar::new(),
            files,
        }
    }

    /// Shared state of a store reopened after being sealed.
    pub fn sealed(
        store_id: String,
        attributes: AttributeTree,
        history: HistoryTree,
        files: Option<StoreFiles>,
    ) -> Self {
        let transient = TransientState::sealed(history.start_time(), history.end_time());
        Self {
            store_id,
            attributes: RwLock::new(attributes),
            transient: RwLock::new(transient),
            history,
            disposed: AtomicBool::new(false),
            progress: Mutex::new(Progress {
                built: true,
                cancelled: false,
            }),
            progress_changed: Condvar::new(),
            files,
        }
    }

    pub fn start_time(&self) -> i64 {
        self.history.start_time()
    }

    pub fn current_end_time(&self) -> i64 {
        let latest = self.transient.read().latest_time();
        latest.max(self.history.end_time())
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Wake every thread blocked on build progress.
    pub fn notify_progress(&self, update: impl FnOnce(&mut Progress)) {
        let mut progress = self.progress.lock();
        update(&mut progress);
        self.progress_changed.notify_all();
    }
}
