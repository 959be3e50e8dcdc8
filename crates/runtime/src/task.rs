//! Tasks
//!
//! A task is a resumable step function ("fiber") plus its scheduler
//! bookkeeping: resume payload, blocked-state kind, cancel token, join
//! registry. Compiled code arrives here as a state machine (generators
//! and `async` bodies are desugared in the frontend), so resumption is
//! an ordinary call that restores the saved frame: the scheduler calls
//! the fiber with a [`Resume`] and acts on the returned [`Step`].
//!
//! A fiber may only suspend by RETURNING a suspending [`Step`]; a
//! synchronous intrinsic never yields.

use std::sync::Arc;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::errors::RtError;
use crate::runtime::Runtime;
use crate::value::Value;

pub type TaskId = u64;

/// What the scheduler hands a fiber when resuming it.
#[derive(Debug)]
pub enum Resume {
    /// First entry.
    Start,
    /// Suspension completed; the payload is the operation's result
    /// (received value for a channel receive, null for sleep/yield/send,
    /// the child's result for a join).
    Ready(Value),
    /// The awaited operation failed (failed join, closed channel).
    Err(RtError),
    /// Cancellation delivered at this suspension point. Raised by
    /// default; a fiber that swallows it sees it again at the next
    /// checkpoint only if the token is re-observed.
    Cancelled(RtError),
}

/// I/O readiness interest for [`Step::WaitIo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoInterest {
    Readable,
    Writable,
}

/// What a fiber tells the scheduler on return.
pub enum Step {
    /// Terminal: the task finished with this result.
    Done(Result<Value, RtError>),
    /// Cooperative yield; rescheduled at the back of the ready queue.
    Yield,
    /// Sleep for the duration, waking through the timer queue.
    Sleep(Duration),
    /// Suspended on a full channel; the value is parked with the waiter
    /// and delivered when a receiver makes room.
    WaitChanSend(u64, Value),
    /// Suspended on an empty channel.
    WaitChanRecv(u64),
    /// Await another task's result.
    WaitJoin(TaskId),
    /// Await fd readiness through the poller.
    WaitIo(i32, IoInterest),
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Step::Done(Ok(_)) => write!(f, "Done(ok)"),
            Step::Done(Err(e)) => write!(f, "Done(err {})", e.kind),
            Step::Yield => write!(f, "Yield"),
            Step::Sleep(d) => write!(f, "Sleep({:?})", d),
            Step::WaitChanSend(id, _) => write!(f, "WaitChanSend({})", id),
            Step::WaitChanRecv(id) => write!(f, "WaitChanRecv({})", id),
            Step::WaitJoin(id) => write!(f, "WaitJoin({})", id),
            Step::WaitIo(fd, i) => write!(f, "WaitIo({}, {:?})", fd, i),
        }
    }
}

/// A resumable task body.
pub type Fiber = Box<dyn FnMut(&Runtime, Resume) -> Step + Send>;

/// Why a task is blocked (scheduler bookkeeping, used to detach stale
/// waiters on cancellation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Sleep,
    ChanSend(u64),
    ChanRecv(u64),
    Join(TaskId),
    Io(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Blocked(BlockKind),
    Done,
}

/// Scheduler-side task record.
pub struct TaskEntry {
    pub id: TaskId,
    /// Taken out while the fiber runs so the scheduler lock is not held
    /// across user code.
    pub fiber: Option<Fiber>,
    pub state: TaskState,
    pub token: Arc<CancelToken>,
    /// Payload for the next resume.
    pub resume: Option<Resume>,
    /// Terminal result, kept for late joiners.
    pub result: Option<Result<Value, RtError>>,
    /// Tasks waiting in `WaitJoin` on this one.
    pub joiners: Vec<TaskId>,
    /// One `CancelledError` per cancellation event: set when delivered.
    pub cancel_delivered: bool,
    /// Bumped on every wake; stale timer entries compare epochs and
    /// drop themselves.
    pub wake_epoch: u64,
}

impl TaskEntry {
    pub fn new(id: TaskId, fiber: Fiber, token: Arc<CancelToken>) -> Self {
        TaskEntry {
            id,
            fiber: Some(fiber),
            state: TaskState::Ready,
            token,
            resume: Some(Resume::Start),
            result: None,
            joiners: Vec::new(),
            cancel_delivered: false,
            wake_epoch: 0,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == TaskState::Done
    }
}
