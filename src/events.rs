//! Callbacks from a run to whoever supervises it.
//!
//! The worker only ever calls into a [`RunObserver`]; observers must return
//! quickly and never block. Cancellation travels the other way through a
//! [`CancellationToken`], which the run checks once per period boundary.

use crate::error::FailureClass;
use crate::navigator::SessionState;
use crate::run::{RunReport, RunStatus};
use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};

pub use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactKind {
    /// One period's downloaded document.
    PeriodDocument,
    /// A spreadsheet sheet written to the sink.
    Sheet,
    /// The merged document produced at the end of the run.
    CombinedDocument,
}

pub trait RunObserver: Send + Sync {
    /// `period_index` is 1-based.
    fn on_progress(&self, _period_index: usize, _total: usize) {}

    fn on_state(&self, _state: SessionState) {}

    /// `handle` is a file path for documents and the sheet name for sheets.
    fn on_artifact_ready(&self, _kind: ArtifactKind, _handle: &str) {}

    fn on_error(&self, _message: &str, _class: FailureClass) {}

    fn on_completed(&self, _report: &RunReport) {}
}

/// Observer that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl RunObserver for NoopObserver {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    Progress,
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub state: TaskState,
    pub current: usize,
    pub total: usize,
    pub percent: u8,
    pub session: Option<SessionState>,
    pub last_error: Option<String>,
    pub errors: usize,
}

impl Default for ProgressSnapshot {
    fn default() -> Self {
        Self {
            state: TaskState::Pending,
            current: 0,
            total: 0,
            percent: 0,
            session: None,
            last_error: None,
            errors: 0,
        }
    }
}

/// Keeps the latest progress of a run for a polling control surface.
///
/// Cheap to clone; clones share the same snapshot and cancellation token, so
/// one clone can be handed to the run while another is polled.
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    snapshot: Arc<Mutex<ProgressSnapshot>>,
    cancel: CancellationToken,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.lock().clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn request_cancel(&self) {
        debug!("Cancellation requested by control surface");
        self.cancel.cancel();
    }

    fn lock(&self) -> MutexGuard<'_, ProgressSnapshot> {
        self.snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RunObserver for ProgressTracker {
    fn on_progress(&self, period_index: usize, total: usize) {
        let mut snapshot = self.lock();
        snapshot.state = TaskState::Progress;
        snapshot.current = period_index;
        snapshot.total = total;
        snapshot.percent = if total == 0 {
            0
        } else {
            ((period_index.min(total) * 100) / total) as u8
        };
    }

    fn on_state(&self, state: SessionState) {
        self.lock().session = Some(state);
    }

    fn on_error(&self, message: &str, class: FailureClass) {
        let mut snapshot = self.lock();
        snapshot.errors += 1;
        snapshot.last_error = Some(format!("{}: {}", class, message));
    }

    fn on_completed(&self, report: &RunReport) {
        let mut snapshot = self.lock();
        snapshot.state = match report.status {
            RunStatus::Completed | RunStatus::Cancelled => TaskState::Success,
            RunStatus::Aborted => TaskState::Failure,
        };
        if snapshot.state == TaskState::Success {
            snapshot.percent = 100;
        }
    }
}
