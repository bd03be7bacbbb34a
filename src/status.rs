//! Lifecycle states shared by workers and the server.

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};

/// Lifecycle state of a worker or server.
///
/// `Disposed` is terminal. Every other transition goes through
/// compare-and-swap so that concurrent lifecycle calls agree on one winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerStatus {
    Disposed,
    Stopped,
    Stopping,
    Starting,
    Started,
}

impl WorkerStatus {
    fn as_i32(self) -> i32 {
        match self {
            WorkerStatus::Disposed => -1,
            WorkerStatus::Stopped => 0,
            WorkerStatus::Stopping => 1,
            WorkerStatus::Starting => 2,
            WorkerStatus::Started => 3,
        }
    }

    fn from_i32(value: i32) -> Self {
        match value {
            -1 => WorkerStatus::Disposed,
            1 => WorkerStatus::Stopping,
            2 => WorkerStatus::Starting,
            3 => WorkerStatus::Started,
            _ => WorkerStatus::Stopped,
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerStatus::Disposed => "Disposed",
            WorkerStatus::Stopped => "Stopped",
            WorkerStatus::Stopping => "Stopping",
            WorkerStatus::Starting => "Starting",
            WorkerStatus::Started => "Started",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub(crate) struct AtomicStatus(AtomicI32);

impl AtomicStatus {
    pub(crate) fn new(status: WorkerStatus) -> Self {
        Self(AtomicI32::new(status.as_i32()))
    }

    pub(crate) fn load(&self) -> WorkerStatus {
        WorkerStatus::from_i32(self.0.load(Ordering::SeqCst))
    }

    /// Moves from `current` to `new` only if the state is still `current`.
    pub(crate) fn transition(&self, current: WorkerStatus, new: WorkerStatus) -> bool {
        self.0
            .compare_exchange(current.as_i32(), new.as_i32(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Unconditionally sets `new` and returns the previous state.
    pub(crate) fn swap(&self, new: WorkerStatus) -> WorkerStatus {
        WorkerStatus::from_i32(self.0.swap(new.as_i32(), Ordering::SeqCst))
    }
}
