//! Collaborator interfaces: progress and cancellation, build hooks and name lookup.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::info;
use parking_lot::Mutex;

use crate::handler::ClassTable;
use crate::hprof::model::HeapObject;

/// Receives progress and answers cancellation polls.
///
/// Scans poll [`is_cancelled`](Self::is_cancelled) at record boundaries only. Pass 2 calls
/// [`advance`](Self::advance) from several workers at once.
pub trait ProgressMonitor: Sync {
    /// Starts a task of `total_work` units.
    fn begin(&self, task: &str, total_work: u64);

    /// Reports `work` more units done.
    fn advance(&self, work: u64);

    /// Whether the caller asked to stop.
    fn is_cancelled(&self) -> bool;

    /// Ends the current task.
    fn done(&self);
}

/// A monitor that ignores progress and never cancels.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMonitor;

impl ProgressMonitor for NullMonitor {
    fn begin(&self, _task: &str, _total_work: u64) {}

    fn advance(&self, _work: u64) {}

    fn is_cancelled(&self) -> bool {
        false
    }

    fn done(&self) {}
}

/// A monitor with an atomic cancellation flag and work counter.
///
/// Task boundaries are logged at `info` level.
#[derive(Debug, Default)]
pub struct SimpleMonitor {
    cancelled: AtomicBool,
    worked: AtomicU64,
    total: AtomicU64,
    task: Mutex<String>,
}

impl SimpleMonitor {
    /// Creates a monitor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Units reported for the current task.
    pub fn worked(&self) -> u64 {
        self.worked.load(Ordering::Relaxed)
    }

    /// Units announced for the current task.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Name of the current task.
    pub fn task(&self) -> String {
        self.task.lock().clone()
    }
}

impl ProgressMonitor for SimpleMonitor {
    fn begin(&self, task: &str, total_work: u64) {
        info!("{task}");
        *self.task.lock() = task.to_string();
        self.total.store(total_work, Ordering::Relaxed);
        self.worked.store(0, Ordering::Relaxed);
    }

    fn advance(&self, work: u64) {
        self.worked.fetch_add(work, Ordering::Relaxed);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    fn done(&self) {
        info!("{} done", self.task.lock());
    }
}

/// Observes a build. Every method has an empty default.
pub trait BuildHook: Send + Sync {
    /// Called once with the sealed class table, before Pass 2 starts.
    fn after_pass1(&self, _classes: &ClassTable) {}

    /// Called for every decoded object, from any Pass 2 worker.
    fn on_object(&self, _object: &HeapObject) {}

    /// Called once with the final class table, before the indices are written.
    fn before_completion(&self, _classes: &ClassTable) {}
}

/// Resolves class names the dump's string table does not provide.
pub trait ClassNameProvider: Send + Sync {
    /// Name of the class at `address`, if known.
    fn class_name(&self, address: u64) -> Option<String>;
}

impl<F> ClassNameProvider for F
where
    F: Fn(u64) -> Option<String> + Send + Sync,
{
    fn class_name(&self, address: u64) -> Option<String> {
        self(address)
    }
}
