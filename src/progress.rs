//! Task bookkeeping for engine operations.
//!
//! Every operation runs as a [`Task`](TaskHandle) on its own thread. The caller
//! keeps a [`TaskHandle`] to poll progress, subscribe to [`TaskEvent`]s, request
//! cancellation and wait for the single [`TaskOutcome`].
//!
//! State machine: `Pending -> Running -> {Completed, Failed, Cancelled}`. The
//! outcome slot is written at most once; progress updates and cancellation
//! requests that arrive after a terminal state are ignored.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, warn};

use crate::common::ArchiveManifest;
use crate::error::{ArchiveError, CodecError, CryptoError, ValidationError};
use crate::volume::VolumeManifest;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Capacity of a task's event channel. Progress events are dropped while it
/// is full; the last two slots are kept for the final progress and `Finished`.
pub const EVENT_CAPACITY: usize = 1024;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Compress,
    Extract,
    Encrypt,
    Decrypt,
    Split,
    Join,
    Verify,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending = 0,
    Running = 1,
    Completed = 2,
    Failed = 3,
    Cancelled = 4,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => TaskState::Pending,
            1 => TaskState::Running,
            2 => TaskState::Completed,
            3 => TaskState::Failed,
            _ => TaskState::Cancelled,
        }
    }
}

/// Coarse status of a running task, suitable for a status line.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Queued = 0,
    Scanning = 1,
    Compressing = 2,
    Extracting = 3,
    Encrypting = 4,
    Decrypting = 5,
    Verifying = 6,
    Splitting = 7,
    Joining = 8,
    Finalizing = 9,
    Done = 10,
}

impl Phase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Phase::Queued,
            1 => Phase::Scanning,
            2 => Phase::Compressing,
            3 => Phase::Extracting,
            4 => Phase::Encrypting,
            5 => Phase::Decrypting,
            6 => Phase::Verifying,
            7 => Phase::Splitting,
            8 => Phase::Joining,
            9 => Phase::Finalizing,
            _ => Phase::Done,
        }
    }
}

/// Point-in-time view of a task's progress.
#[derive(Debug, Clone)]
pub struct ProgressState {
    pub task: TaskId,
    pub kind: TaskKind,
    pub phase: Phase,
    pub processed: u64,
    pub total: u64,
    /// `processed / total`, in `[0, 1]`, never decreasing.
    pub fraction: f64,
    /// Entry or volume the last update was about.
    pub current: Option<String>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub enum TaskEvent {
    Progress(ProgressState),
    Finished { task: TaskId, state: TaskState },
}

/// A per-entry failure collected under `continue_on_error`.
#[derive(Debug)]
pub struct EntryFailure {
    pub path: String,
    pub error: ArchiveError,
}

/// Success payload of a task.
#[derive(Debug, Default)]
pub struct TaskOutput {
    /// Files produced: the archive, extracted files, or volume parts plus manifest.
    pub outputs: Vec<PathBuf>,
    pub manifest: Option<ArchiveManifest>,
    pub volumes: Option<VolumeManifest>,
    /// Failures skipped under `continue_on_error`; empty in fail-fast mode.
    pub failures: Vec<EntryFailure>,
    pub entries_processed: u64,
}

impl TaskOutput {
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

#[derive(Debug)]
pub enum TaskOutcome {
    Completed(TaskOutput),
    Failed(ArchiveError),
    Cancelled,
}

impl TaskOutcome {
    pub fn state(&self) -> TaskState {
        match self {
            TaskOutcome::Completed(_) => TaskState::Completed,
            TaskOutcome::Failed(_) => TaskState::Failed,
            TaskOutcome::Cancelled => TaskState::Cancelled,
        }
    }

    pub fn output(&self) -> Option<&TaskOutput> {
        match self {
            TaskOutcome::Completed(out) => Some(out),
            _ => None,
        }
    }

    pub fn into_output(self) -> Option<TaskOutput> {
        match self {
            TaskOutcome::Completed(out) => Some(out),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ArchiveError> {
        match self {
            TaskOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Why a task body stopped early.
#[derive(Debug)]
pub enum Stop {
    Cancelled,
    Failed(ArchiveError),
}

impl From<ArchiveError> for Stop {
    fn from(e: ArchiveError) -> Self {
        Stop::Failed(e)
    }
}

impl From<ValidationError> for Stop {
    fn from(e: ValidationError) -> Self {
        Stop::Failed(e.into())
    }
}

impl From<CodecError> for Stop {
    fn from(e: CodecError) -> Self {
        Stop::Failed(e.into())
    }
}

impl From<CryptoError> for Stop {
    fn from(e: CryptoError) -> Self {
        Stop::Failed(e.into())
    }
}

struct TaskShared {
    id: TaskId,
    kind: TaskKind,
    state: AtomicU8,
    phase: AtomicU8,
    /// f64 bits; non-negative floats order like their bit patterns, so
    /// `fetch_max` keeps the value monotonic.
    progress: AtomicU64,
    processed: AtomicU64,
    total: AtomicU64,
    cancel: AtomicBool,
    outcome: Mutex<Option<TaskOutcome>>,
    events: Sender<TaskEvent>,
    done: Sender<()>,
    started: Instant,
}

impl TaskShared {
    fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn fraction(&self) -> f64 {
        f64::from_bits(self.progress.load(Ordering::Acquire))
    }

    fn snapshot(&self, current: Option<String>) -> ProgressState {
        ProgressState {
            task: self.id,
            kind: self.kind,
            phase: Phase::from_u8(self.phase.load(Ordering::Acquire)),
            processed: self.processed.load(Ordering::Acquire),
            total: self.total.load(Ordering::Acquire),
            fraction: self.fraction(),
            current,
            elapsed: self.started.elapsed(),
        }
    }

    /// Queues a progress event unless the channel is close to full.
    fn emit_progress(&self, current: Option<String>) {
        if self.events.len() + 2 >= EVENT_CAPACITY {
            return;
        }
        let _ = self.events.try_send(TaskEvent::Progress(self.snapshot(current)));
    }

    fn raise_progress(&self, fraction: f64) {
        let f = fraction.clamp(0.0, 1.0);
        self.progress.fetch_max(f.to_bits(), Ordering::AcqRel);
    }

    /// Stores the outcome unless one is already stored.
    fn finish(&self, outcome: TaskOutcome) -> bool {
        let mut slot = self.outcome.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() || self.state().is_terminal() {
            return false;
        }
        let state = outcome.state();
        if state == TaskState::Completed {
            let total = self.total.load(Ordering::Acquire);
            self.processed.store(total, Ordering::Release);
            self.raise_progress(1.0);
            self.phase.store(Phase::Done as u8, Ordering::Release);
            let _ = self.events.try_send(TaskEvent::Progress(self.snapshot(None)));
        }
        *slot = Some(outcome);
        self.state.store(state as u8, Ordering::Release);
        drop(slot);
        let _ = self.events.try_send(TaskEvent::Finished {
            task: self.id,
            state,
        });
        let _ = self.done.try_send(());
        true
    }
}

/// View of the task handed to the operation body.
pub struct TaskContext {
    shared: Arc<TaskShared>,
}

impl TaskContext {
    pub fn id(&self) -> TaskId {
        self.shared.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.load(Ordering::Acquire)
    }

    /// Cancellation point; called between entries.
    pub fn checkpoint(&self) -> Result<(), Stop> {
        if self.is_cancelled() {
            return Err(Stop::Cancelled);
        }
        Ok(())
    }

    pub fn set_phase(&self, phase: Phase) {
        if self.shared.state().is_terminal() {
            return;
        }
        self.shared.phase.store(phase as u8, Ordering::Release);
    }

    pub fn set_total(&self, total: u64) {
        self.shared.total.store(total, Ordering::Release);
    }

    /// Records one more processed unit (an entry or a volume).
    pub fn advance(&self, current: &str) {
        if self.shared.state().is_terminal() {
            return;
        }
        let processed = self.shared.processed.fetch_add(1, Ordering::AcqRel) + 1;
        let total = self.shared.total.load(Ordering::Acquire);
        if total > 0 {
            self.shared.raise_progress(processed as f64 / total as f64);
        }
        self.shared.emit_progress(Some(current.to_string()));
    }
}

/// Caller side of a task.
pub struct TaskHandle {
    shared: Arc<TaskShared>,
    events: Receiver<TaskEvent>,
    done: Receiver<()>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.shared.id)
            .field("kind", &self.shared.kind)
            .field("state", &self.shared.state())
            .finish()
    }
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.shared.id
    }

    pub fn kind(&self) -> TaskKind {
        self.shared.kind
    }

    pub fn state(&self) -> TaskState {
        self.shared.state()
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.shared.phase.load(Ordering::Acquire))
    }

    /// Fraction of entries processed, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        self.shared.fraction()
    }

    pub fn snapshot(&self) -> ProgressState {
        self.shared.snapshot(None)
    }

    /// Requests cooperative cancellation. Returns `false` if the task had
    /// already reached a terminal state, in which case nothing changes.
    pub fn cancel(&self) -> bool {
        if self.shared.state().is_terminal() {
            return false;
        }
        self.shared.cancel.store(true, Ordering::Release);
        debug!(task = %self.shared.id, "cancellation requested");
        true
    }

    /// Stream of progress and completion events. The channel is bounded by
    /// [`EVENT_CAPACITY`]; a caller that stops draining it misses progress
    /// events but still receives `Finished`.
    pub fn events(&self) -> Receiver<TaskEvent> {
        self.events.clone()
    }

    /// Waits up to `timeout` for a terminal state.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskState> {
        let state = self.shared.state();
        if state.is_terminal() {
            return Some(state);
        }
        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                Some(self.shared.state()).filter(|s| s.is_terminal())
            }
            Err(RecvTimeoutError::Timeout) => None,
        }
    }

    /// Blocks until the task is terminal and returns its outcome.
    pub fn wait(self) -> TaskOutcome {
        if !self.shared.state().is_terminal() {
            let _ = self.done.recv();
        }
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                warn!(task = %self.shared.id, "worker thread panicked");
            }
        }
        let outcome = self
            .shared
            .outcome
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        outcome.unwrap_or_else(|| {
            TaskOutcome::Failed(ArchiveError::io(
                PathBuf::new(),
                std::io::Error::new(std::io::ErrorKind::Other, "task worker exited without an outcome"),
            ))
        })
    }
}

/// Starts `body` on a new thread and returns its handle immediately.
pub(crate) fn spawn<F>(kind: TaskKind, body: F) -> TaskHandle
where
    F: FnOnce(&TaskContext) -> Result<TaskOutput, Stop> + Send + 'static,
{
    let (events_tx, events_rx) = bounded(EVENT_CAPACITY);
    let (done_tx, done_rx) = bounded(1);
    let shared = Arc::new(TaskShared {
        id: TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)),
        kind,
        state: AtomicU8::new(TaskState::Pending as u8),
        phase: AtomicU8::new(Phase::Queued as u8),
        progress: AtomicU64::new(0f64.to_bits()),
        processed: AtomicU64::new(0),
        total: AtomicU64::new(0),
        cancel: AtomicBool::new(false),
        outcome: Mutex::new(None),
        events: events_tx,
        done: done_tx,
        started: Instant::now(),
    });

    let ctx = TaskContext {
        shared: Arc::clone(&shared),
    };
    let thread = std::thread::spawn(move || {
        let span = info_span!("task", id = ctx.shared.id.0, kind = ?ctx.shared.kind);
        let _guard = span.enter();
        let _ = ctx.shared.state.compare_exchange(
            TaskState::Pending as u8,
            TaskState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| body(&ctx))) {
            Ok(Ok(output)) => TaskOutcome::Completed(output),
            Ok(Err(Stop::Cancelled)) => TaskOutcome::Cancelled,
            Ok(Err(Stop::Failed(e))) => TaskOutcome::Failed(e),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(%message, "task body panicked");
                TaskOutcome::Failed(ArchiveError::Worker(message))
            }
        };
        debug!(state = ?outcome.state(), "task finished");
        ctx.shared.finish(outcome);
    });

    TaskHandle {
        shared,
        events: events_rx,
        done: done_rx,
        thread: Mutex::new(Some(thread)),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
