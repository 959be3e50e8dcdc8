//! The cooperative scheduler
//!
//! A single-threaded event loop per runtime instance. All user-visible
//! execution is serialized; worker threads exist only in the parallel
//! kernel pool and coordinate through the runtime lock.
//!
//! ## Ordering guarantees
//!
//! - Ready-queue dispatch is FIFO.
//! - `call_soon` callbacks run in registration order within a tick;
//!   callbacks registered during a tick run in the next tick.
//! - `call_at` entries fire in deadline order, ties broken by insertion
//!   order (a monotonic sequence number, never pointer identity).
//!
//! ## Suspension
//!
//! A task suspends only by returning a suspending [`Step`]: yield,
//! sleep, channel send/receive, join, or I/O readiness. Cancellation is
//! observed at those points and nowhere else, and each cancellation
//! event is delivered exactly once per task.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::channel::{RecvOutcome, SendOutcome, Wake};
use crate::errors::{cancelled, value_error, RtError};
use crate::runtime::Runtime;
use crate::task::{BlockKind, Fiber, Resume, Step, TaskEntry, TaskId, TaskState};
use crate::value::Value;

/// A deferred callback run on the loop.
pub type Callback = Box<dyn FnOnce(&Runtime) + Send>;

enum TimerTarget {
    /// Wake a sleeping task; stale if the epoch moved on.
    WakeTask { id: TaskId, epoch: u64 },
    /// Run a `call_at` callback.
    Callback(Callback),
    /// Deadline expiry: cancel the token (same path as cancellation).
    CancelToken(Arc<CancelToken>),
}

struct TimerEntry {
    at: Instant,
    seq: u64,
    target: TimerTarget,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

/// Scheduler state, behind the runtime's mutex. The lock is never held
/// while a fiber runs.
pub struct SchedulerInner {
    next_task: TaskId,
    next_seq: u64,
    tasks: HashMap<TaskId, TaskEntry>,
    ready: VecDeque<TaskId>,
    soon: VecDeque<Callback>,
    timers: BinaryHeap<Reverse<TimerEntry>>,
    current: Option<TaskId>,
    /// Error-propagation policy: tokens to cancel when the task fails.
    error_policies: HashMap<TaskId, Arc<CancelToken>>,
    pub total_spawned: u64,
    pub total_completed: u64,
    pub peak_tasks: usize,
}

impl SchedulerInner {
    pub fn new() -> Self {
        SchedulerInner {
            next_task: 1,
            next_seq: 0,
            tasks: HashMap::new(),
            ready: VecDeque::new(),
            soon: VecDeque::new(),
            timers: BinaryHeap::new(),
            current: None,
            error_policies: HashMap::new(),
            total_spawned: 0,
            total_completed: 0,
            peak_tasks: 0,
        }
    }

    fn live_count(&self) -> usize {
        self.tasks.values().filter(|t| !t.is_done()).count()
    }

    fn push_timer(&mut self, at: Instant, target: TimerTarget) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.timers.push(Reverse(TimerEntry { at, seq, target }));
    }

    /// Wake a blocked task with a resume payload.
    fn wake(&mut self, id: TaskId, resume: Resume) {
        if let Some(entry) = self.tasks.get_mut(&id) {
            if matches!(entry.state, TaskState::Blocked(_)) {
                if matches!(resume, Resume::Cancelled(_)) {
                    entry.cancel_delivered = true;
                }
                entry.resume = Some(resume);
                entry.wake_epoch += 1;
                entry.state = TaskState::Ready;
                self.ready.push_back(id);
            }
        }
    }
}

/// A structured-concurrency group: a token plus the children spawned
/// under it. Joining re-raises the first child failure; a child failure
/// cancels the group token so siblings observe cancellation promptly.
pub struct TaskGroup {
    pub token: Arc<CancelToken>,
    pub children: Vec<TaskId>,
}

impl Runtime {
    // =========================================================================
    // Spawning
    // =========================================================================

    /// Spawn a task under the current token (a fresh root when called
    /// from outside the loop).
    pub fn spawn(&self, fiber: Fiber) -> TaskId {
        let parent = self.current_token().unwrap_or_else(CancelToken::root);
        self.spawn_with_token(fiber, parent.child(None))
    }

    /// Spawn with an explicit token. A deadline on the token is armed
    /// as a timer that cancels through the normal cancellation path.
    pub fn spawn_with_token(&self, fiber: Fiber, token: Arc<CancelToken>) -> TaskId {
        let deadline = token.deadline();
        let mut sched = self.sched.lock().expect("scheduler poisoned");
        let id = sched.next_task;
        sched.next_task += 1;
        sched.total_spawned += 1;
        sched.tasks.insert(id, TaskEntry::new(id, fiber, token.clone()));
        let live = sched.live_count();
        if live > sched.peak_tasks {
            sched.peak_tasks = live;
        }
        sched.ready.push_back(id);
        if let Some(at) = deadline {
            sched.push_timer(at, TimerTarget::CancelToken(token));
        }
        id
    }

    /// The task currently being stepped, if any.
    pub fn current_task(&self) -> Option<TaskId> {
        self.sched.lock().expect("scheduler poisoned").current
    }

    /// The current task's cancel token.
    pub fn current_token(&self) -> Option<Arc<CancelToken>> {
        let sched = self.sched.lock().expect("scheduler poisoned");
        sched
            .current
            .and_then(|id| sched.tasks.get(&id))
            .map(|t| t.token.clone())
    }

    /// A task's terminal result, if it has finished.
    pub fn task_result(&self, id: TaskId) -> Option<Result<Value, RtError>> {
        let sched = self.sched.lock().expect("scheduler poisoned");
        sched.tasks.get(&id).and_then(|t| t.result.clone())
    }

    // =========================================================================
    // Groups
    // =========================================================================

    /// Open a group under the current token.
    pub fn group(&self) -> TaskGroup {
        let parent = self.current_token().unwrap_or_else(CancelToken::root);
        TaskGroup {
            token: parent.child(None),
            children: Vec::new(),
        }
    }

    /// Open a group with a deadline; expiry cancels every child.
    pub fn group_with_deadline(&self, at: Instant) -> TaskGroup {
        let parent = self.current_token().unwrap_or_else(CancelToken::root);
        let token = parent.child(Some(at));
        let mut sched = self.sched.lock().expect("scheduler poisoned");
        sched.push_timer(at, TimerTarget::CancelToken(token.clone()));
        TaskGroup {
            token,
            children: Vec::new(),
        }
    }

    /// Spawn a child into the group. The child's failure cancels the
    /// group token (error-propagation policy), so siblings see
    /// cancellation at their next suspension point.
    pub fn group_spawn(&self, group: &mut TaskGroup, fiber: Fiber) -> TaskId {
        let id = self.spawn_with_token(fiber, group.token.child(None));
        self.sched
            .lock()
            .expect("scheduler poisoned")
            .error_policies
            .insert(id, group.token.clone());
        group.children.push(id);
        id
    }

    /// Build the fiber that joins a group: awaits every child in spawn
    /// order, re-raises the first real failure (cancellations caused by
    /// that failure are filtered), and chains any additional failures.
    pub fn group_join_fiber(group: TaskGroup) -> Fiber {
        let children = group.children;
        let mut idx = 0usize;
        let mut primary: Option<RtError> = None;
        let mut saw_cancel: Option<RtError> = None;
        Box::new(move |_rt, resume| {
            match resume {
                Resume::Start => {}
                Resume::Ready(_) => idx += 1,
                Resume::Err(e) | Resume::Cancelled(e) => {
                    if e.kind == molt_core::ErrorKind::Cancelled {
                        if saw_cancel.is_none() {
                            saw_cancel = Some(e);
                        }
                    } else if let Some(first) = primary.take() {
                        // Additional failures chain behind the first.
                        primary = Some(first.with_cause(e));
                    } else {
                        primary = Some(e);
                    }
                    idx += 1;
                }
            }
            if idx < children.len() {
                return Step::WaitJoin(children[idx]);
            }
            match primary.take().or_else(|| saw_cancel.take()) {
                Some(e) => Step::Done(Err(e)),
                None => Step::Done(Ok(Value::null())),
            }
        })
    }

    // =========================================================================
    // Callbacks and timers
    // =========================================================================

    /// Run a callback on the loop, FIFO within a tick.
    pub fn call_soon(&self, cb: Callback) {
        self.sched
            .lock()
            .expect("scheduler poisoned")
            .soon
            .push_back(cb);
    }

    /// Run a callback at a deadline; ties run in insertion order.
    pub fn call_at(&self, at: Instant, cb: Callback) {
        self.sched
            .lock()
            .expect("scheduler poisoned")
            .push_timer(at, TimerTarget::Callback(cb));
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    /// Cancel a token tree and schedule every affected blocked task
    /// with a cancellation result. Delivery happens at the tasks'
    /// suspension points, which they are already at (they are blocked).
    pub fn cancel(&self, token: &Arc<CancelToken>) {
        token.cancel();
        let now = Instant::now();
        // Find affected blocked tasks and their block kinds.
        let affected: Vec<(TaskId, BlockKind)> = {
            let sched = self.sched.lock().expect("scheduler poisoned");
            sched
                .tasks
                .values()
                .filter_map(|t| match t.state {
                    TaskState::Blocked(kind)
                        if t.token.should_cancel(now) && !t.cancel_delivered =>
                    {
                        Some((t.id, kind))
                    }
                    _ => None,
                })
                .collect()
        };
        // Detach from wait structures before waking.
        for (id, kind) in &affected {
            match kind {
                BlockKind::ChanSend(chan) | BlockKind::ChanRecv(chan) => {
                    self.chans
                        .lock()
                        .expect("channel table poisoned")
                        .detach_waiter(*chan, *id);
                }
                BlockKind::Join(target) => {
                    let mut sched = self.sched.lock().expect("scheduler poisoned");
                    if let Some(t) = sched.tasks.get_mut(target) {
                        t.joiners.retain(|j| j != id);
                    }
                }
                BlockKind::Io(_) => {
                    self.poller
                        .lock()
                        .expect("poller poisoned")
                        .deregister_task(*id);
                }
                BlockKind::Sleep => {} // stale timer drops via epoch
            }
        }
        let mut sched = self.sched.lock().expect("scheduler poisoned");
        for (id, _) in affected {
            sched.wake(id, Resume::Cancelled(cancelled()));
        }
    }

    /// Cancel one task (its own token subtree).
    pub fn cancel_task(&self, id: TaskId) {
        let token = {
            let sched = self.sched.lock().expect("scheduler poisoned");
            sched.tasks.get(&id).map(|t| t.token.clone())
        };
        if let Some(token) = token {
            self.cancel(&token);
        }
    }

    // =========================================================================
    // The loop
    // =========================================================================

    /// Run until no task can make progress. Returns when every task is
    /// terminal and no timer or callback is pending.
    pub fn run(&self) {
        loop {
            self.maybe_collect();
            self.run_soon_tick();
            self.fire_due_timers();
            let ran = self.run_ready_batch();
            if ran {
                continue;
            }
            // Idle: decide whether to wait or stop.
            let (live, next_timer, has_soon) = {
                let sched = self.sched.lock().expect("scheduler poisoned");
                let next = sched.timers.peek().map(|Reverse(t)| t.at);
                (sched.live_count(), next, !sched.soon.is_empty())
            };
            if has_soon {
                continue;
            }
            let has_io = self.poller.lock().expect("poller poisoned").has_waiters();
            if has_io {
                let timeout = next_timer.map(|at| at.saturating_duration_since(Instant::now()));
                let woken = self
                    .poller
                    .lock()
                    .expect("poller poisoned")
                    .wait(timeout);
                let mut sched = self.sched.lock().expect("scheduler poisoned");
                for id in woken {
                    sched.wake(id, Resume::Ready(Value::null()));
                }
                continue;
            }
            if let Some(at) = next_timer {
                let now = Instant::now();
                if at > now {
                    std::thread::sleep(at - now);
                }
                continue;
            }
            if live == 0 {
                break;
            }
            // Live tasks but nothing can ever wake them.
            tracing::warn!(
                blocked = live,
                "scheduler idle with blocked tasks and no pending events; stopping"
            );
            break;
        }
    }

    /// Spawn `main`, run the loop, and return its result.
    pub fn run_main(&self, fiber: Fiber) -> Result<Value, RtError> {
        let id = self.spawn_with_token(fiber, CancelToken::root());
        self.run();
        self.task_result(id)
            .unwrap_or_else(|| Err(value_error("main task did not complete")))
    }

    fn run_soon_tick(&self) {
        // Snapshot the tick length so callbacks registered during the
        // tick run next tick, preserving FIFO within each tick.
        let count = {
            let sched = self.sched.lock().expect("scheduler poisoned");
            sched.soon.len()
        };
        for _ in 0..count {
            let cb = {
                let mut sched = self.sched.lock().expect("scheduler poisoned");
                sched.soon.pop_front()
            };
            match cb {
                Some(cb) => cb(self),
                None => break,
            }
        }
    }

    fn fire_due_timers(&self) {
        loop {
            let target = {
                let mut sched = self.sched.lock().expect("scheduler poisoned");
                let now = Instant::now();
                match sched.timers.peek() {
                    Some(Reverse(t)) if t.at <= now => {
                        let Reverse(entry) = sched.timers.pop().expect("peeked");
                        Some(entry.target)
                    }
                    _ => None,
                }
            };
            match target {
                None => break,
                Some(TimerTarget::WakeTask { id, epoch }) => {
                    let mut sched = self.sched.lock().expect("scheduler poisoned");
                    let fresh = sched
                        .tasks
                        .get(&id)
                        .map(|t| {
                            t.wake_epoch == epoch
                                && matches!(t.state, TaskState::Blocked(BlockKind::Sleep))
                        })
                        .unwrap_or(false);
                    if fresh {
                        sched.wake(id, Resume::Ready(Value::null()));
                    }
                }
                Some(TimerTarget::Callback(cb)) => cb(self),
                Some(TimerTarget::CancelToken(token)) => self.cancel(&token),
            }
        }
    }

    /// Step every task that was ready at the start of the batch.
    /// Returns true if any task ran.
    fn run_ready_batch(&self) -> bool {
        let batch: Vec<TaskId> = {
            let mut sched = self.sched.lock().expect("scheduler poisoned");
            sched.ready.drain(..).collect()
        };
        let ran = !batch.is_empty();
        for id in batch {
            self.step_task(id);
        }
        ran
    }

    fn step_task(&self, id: TaskId) {
        let (mut fiber, resume) = {
            let mut sched = self.sched.lock().expect("scheduler poisoned");
            let Some(entry) = sched.tasks.get_mut(&id) else {
                return;
            };
            if entry.is_done() || entry.fiber.is_none() {
                return;
            }
            let mut resume = entry.resume.take().unwrap_or(Resume::Start);
            // Cancellation is observed when resuming from a suspension
            // point; first entry is not one.
            if !entry.cancel_delivered
                && entry.token.should_cancel(Instant::now())
                && !matches!(resume, Resume::Start | Resume::Cancelled(_))
            {
                entry.cancel_delivered = true;
                resume = Resume::Cancelled(cancelled());
            }
            let fiber = entry.fiber.take().expect("fiber present");
            entry.state = TaskState::Running;
            sched.current = Some(id);
            (fiber, resume)
        };

        // User code runs with no scheduler lock held.
        let step = fiber(self, resume);

        {
            let mut sched = self.sched.lock().expect("scheduler poisoned");
            sched.current = None;
            if let Some(entry) = sched.tasks.get_mut(&id) {
                entry.fiber = Some(fiber);
            }
        }
        self.apply_step(id, step);
    }

    fn apply_step(&self, id: TaskId, step: Step) {
        // A suspending step IS a suspension point: a pending
        // cancellation is delivered here instead of parking the task.
        if !matches!(step, Step::Done(_)) {
            let mut sched = self.sched.lock().expect("scheduler poisoned");
            if let Some(entry) = sched.tasks.get_mut(&id) {
                if !entry.cancel_delivered && entry.token.should_cancel(Instant::now()) {
                    entry.cancel_delivered = true;
                    entry.resume = Some(Resume::Cancelled(cancelled()));
                    entry.state = TaskState::Ready;
                    sched.ready.push_back(id);
                    return;
                }
            }
        }
        match step {
            Step::Done(result) => self.complete_task(id, result),
            Step::Yield => {
                let mut sched = self.sched.lock().expect("scheduler poisoned");
                if let Some(entry) = sched.tasks.get_mut(&id) {
                    entry.resume = Some(Resume::Ready(Value::null()));
                    entry.state = TaskState::Ready;
                    sched.ready.push_back(id);
                }
            }
            Step::Sleep(dur) => {
                let mut sched = self.sched.lock().expect("scheduler poisoned");
                if let Some(entry) = sched.tasks.get_mut(&id) {
                    entry.state = TaskState::Blocked(BlockKind::Sleep);
                    let epoch = entry.wake_epoch;
                    let at = Instant::now() + dur;
                    sched.push_timer(at, TimerTarget::WakeTask { id, epoch });
                }
            }
            Step::WaitChanSend(chan, value) => {
                let outcome = {
                    let mut chans = self.chans.lock().expect("channel table poisoned");
                    chans.try_send(chan, value)
                };
                match outcome {
                    Err(e) => self.resume_now(id, Resume::Err(e)),
                    Ok((SendOutcome::Sent, wake)) => {
                        self.apply_channel_wake(wake);
                        self.resume_now(id, Resume::Ready(Value::null()));
                    }
                    Ok((SendOutcome::Closed, _)) => {
                        self.resume_now(id, Resume::Err(value_error("channel is closed")))
                    }
                    Ok((SendOutcome::Full, _)) => {
                        let mut chans = self.chans.lock().expect("channel table poisoned");
                        // Value is a word; parking it is a copy.
                        let _ = chans.park_sender(chan, id, value);
                        drop(chans);
                        let mut sched = self.sched.lock().expect("scheduler poisoned");
                        if let Some(entry) = sched.tasks.get_mut(&id) {
                            entry.state = TaskState::Blocked(BlockKind::ChanSend(chan));
                        }
                    }
                }
            }
            Step::WaitChanRecv(chan) => {
                let outcome = {
                    let mut chans = self.chans.lock().expect("channel table poisoned");
                    chans.try_recv(chan)
                };
                match outcome {
                    Err(e) => self.resume_now(id, Resume::Err(e)),
                    Ok((RecvOutcome::Received(v), wake)) => {
                        self.apply_channel_wake(wake);
                        self.resume_now(id, Resume::Ready(v));
                    }
                    Ok((RecvOutcome::Closed, _)) => {
                        self.resume_now(id, Resume::Err(value_error("channel is closed")))
                    }
                    Ok((RecvOutcome::Empty, _)) => {
                        let mut chans = self.chans.lock().expect("channel table poisoned");
                        let _ = chans.park_receiver(chan, id);
                        drop(chans);
                        let mut sched = self.sched.lock().expect("scheduler poisoned");
                        if let Some(entry) = sched.tasks.get_mut(&id) {
                            entry.state = TaskState::Blocked(BlockKind::ChanRecv(chan));
                        }
                    }
                }
            }
            Step::WaitJoin(target) => {
                let mut sched = self.sched.lock().expect("scheduler poisoned");
                let resume = match sched.tasks.get(&target) {
                    None => Some(Resume::Err(value_error(format!(
                        "join of unknown task {}",
                        target
                    )))),
                    Some(t) => t.result.clone().map(|r| match r {
                        Ok(v) => Resume::Ready(v),
                        Err(e) => Resume::Err(e),
                    }),
                };
                match resume {
                    Some(resume) => {
                        if let Some(entry) = sched.tasks.get_mut(&id) {
                            entry.resume = Some(resume);
                            entry.state = TaskState::Ready;
                            sched.ready.push_back(id);
                        }
                    }
                    None => {
                        if let Some(t) = sched.tasks.get_mut(&target) {
                            t.joiners.push(id);
                        }
                        if let Some(entry) = sched.tasks.get_mut(&id) {
                            entry.state = TaskState::Blocked(BlockKind::Join(target));
                        }
                    }
                }
            }
            Step::WaitIo(fd, interest) => {
                self.poller
                    .lock()
                    .expect("poller poisoned")
                    .register(fd, interest, id);
                let mut sched = self.sched.lock().expect("scheduler poisoned");
                if let Some(entry) = sched.tasks.get_mut(&id) {
                    entry.state = TaskState::Blocked(BlockKind::Io(fd));
                }
            }
        }
    }

    fn resume_now(&self, id: TaskId, resume: Resume) {
        let mut sched = self.sched.lock().expect("scheduler poisoned");
        if let Some(entry) = sched.tasks.get_mut(&id) {
            entry.resume = Some(resume);
            entry.state = TaskState::Ready;
            sched.ready.push_back(id);
        }
    }

    pub(crate) fn apply_channel_wake(&self, wake: Option<Wake>) {
        if let Some((task, resume)) = wake {
            let mut sched = self.sched.lock().expect("scheduler poisoned");
            sched.wake(task, resume);
        }
    }

    fn complete_task(&self, id: TaskId, result: Result<Value, RtError>) {
        let (joiners, policy, unjoined_err) = {
            let mut sched = self.sched.lock().expect("scheduler poisoned");
            let Some(entry) = sched.tasks.get_mut(&id) else {
                return;
            };
            entry.state = TaskState::Done;
            entry.fiber = None;
            entry.result = Some(result.clone());
            let joiners = std::mem::take(&mut entry.joiners);
            sched.total_completed += 1;
            let policy = sched.error_policies.remove(&id);
            let unjoined_err = match (&result, joiners.is_empty()) {
                (Err(e), true) if policy.is_none() => Some(e.clone()),
                _ => None,
            };
            for joiner in &joiners {
                let resume = match &result {
                    Ok(v) => Resume::Ready(*v),
                    Err(e) => Resume::Err(e.clone()),
                };
                sched.wake(*joiner, resume);
            }
            (joiners, policy, unjoined_err)
        };
        let _ = joiners;
        // Error-propagation policy: a failing group child cancels the
        // group token. Cancellation of the child itself does not.
        if let (Some(token), Err(e)) = (policy, &result) {
            if e.kind != molt_core::ErrorKind::Cancelled {
                self.cancel(&token);
            }
        }
        if let Some(e) = unjoined_err {
            self.report_task_error(e);
        }
    }

    /// Scheduler lifetime statistics (diagnostics).
    pub fn scheduler_stats(&self) -> (u64, u64, usize) {
        let sched = self.sched.lock().expect("scheduler poisoned");
        (sched.total_spawned, sched.total_completed, sched.peak_tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeConfig;
    use std::sync::Mutex;

    fn rt() -> Runtime {
        Runtime::new(RuntimeConfig::default())
    }

    /// A fiber that completes immediately with an int.
    fn const_fiber(n: i64) -> Fiber {
        Box::new(move |_rt, _resume| Step::Done(Ok(Value::small_int(n))))
    }

    #[test]
    fn test_run_single_task() {
        let rt = rt();
        let result = rt.run_main(const_fiber(42)).unwrap();
        assert_eq!(result.expect_i64().unwrap(), 42);
    }

    #[test]
    fn test_ready_queue_fifo() {
        let rt = rt();
        let log = Arc::new(Mutex::new(Vec::new()));
        for n in 0..4 {
            let log = Arc::clone(&log);
            rt.spawn(Box::new(move |_rt, resume| match resume {
                Resume::Start => Step::Yield,
                _ => {
                    log.lock().unwrap().push(n);
                    Step::Done(Ok(Value::null()))
                }
            }));
        }
        rt.run();
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_call_soon_registration_order() {
        let rt = rt();
        let log = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let log = Arc::clone(&log);
            rt.call_soon(Box::new(move |_rt| log.lock().unwrap().push(n)));
        }
        rt.run();
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_call_at_deadline_then_insertion_order() {
        let rt = rt();
        let log = Arc::new(Mutex::new(Vec::new()));
        let base = Instant::now() + Duration::from_millis(5);
        for (n, at) in [(0, base + Duration::from_millis(5)), (1, base), (2, base)] {
            let log = Arc::clone(&log);
            rt.call_at(at, Box::new(move |_rt| log.lock().unwrap().push(n)));
        }
        rt.run();
        // Earlier deadline first; equal deadlines in insertion order.
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 0]);
    }

    #[test]
    fn test_sleep_and_resume() {
        let rt = rt();
        let started = Instant::now();
        let result = rt.run_main(Box::new(move |_rt, resume| match resume {
            Resume::Start => Step::Sleep(Duration::from_millis(15)),
            Resume::Ready(_) => Step::Done(Ok(Value::small_int(1))),
            other => panic!("unexpected resume {:?}", other),
        }));
        assert!(result.is_ok());
        assert!(started.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_join_returns_child_result() {
        let rt = rt();
        let child = rt.spawn(const_fiber(7));
        let result = rt.run_main(Box::new(move |_rt, resume| match resume {
            Resume::Start => Step::WaitJoin(child),
            Resume::Ready(v) => Step::Done(Ok(v)),
            Resume::Err(e) => Step::Done(Err(e)),
            other => panic!("unexpected resume {:?}", other),
        }));
        assert_eq!(result.unwrap().expect_i64().unwrap(), 7);
    }

    #[test]
    fn test_unjoined_error_hits_error_channel() {
        let rt = rt();
        rt.spawn(Box::new(|_rt, _resume| {
            Step::Done(Err(crate::errors::value_error("boom")))
        }));
        rt.run();
        let errors = rt.take_task_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "boom");
    }

    /// Scenario: bounded channel of size 1, producer sends three items,
    /// consumer reads them. The producer suspends on the full channel
    /// and resumes as the consumer drains; order is preserved.
    #[test]
    fn test_channel_backpressure_roundtrip() {
        let rt = rt();
        let chan = {
            let mut chans = rt.chans.lock().unwrap();
            chans.create(1).unwrap()
        };
        let received = Arc::new(Mutex::new(Vec::new()));

        let mut to_send = vec![1i64, 2, 3].into_iter();
        rt.spawn(Box::new(move |_rt, _resume| match to_send.next() {
            Some(n) => Step::WaitChanSend(chan, Value::small_int(n)),
            None => Step::Done(Ok(Value::null())),
        }));

        let sink = Arc::clone(&received);
        let mut pending = 3usize;
        rt.spawn(Box::new(move |_rt, resume| {
            if let Resume::Ready(v) = resume {
                if !v.is_null() {
                    sink.lock().unwrap().push(v.expect_i64().unwrap());
                    pending -= 1;
                }
            }
            if pending == 0 {
                Step::Done(Ok(Value::null()))
            } else {
                Step::WaitChanRecv(chan)
            }
        }));

        rt.run();
        assert_eq!(*received.lock().unwrap(), vec![1, 2, 3]);
        let stats = rt.chans.lock().unwrap().stats(chan).unwrap();
        assert_eq!(stats.send_count, 3);
        assert_eq!(stats.recv_count, 3);
    }

    /// Scenario: a group where child B fails quickly; the join re-raises
    /// B's error, and sibling A observes CancelledError at its sleep
    /// long before the sleep would have finished.
    #[test]
    fn test_group_failure_cancels_siblings() {
        let rt = rt();
        let started = Instant::now();

        let mut group = rt.group();
        let a_outcome = Arc::new(Mutex::new(None));
        let a_seen = Arc::clone(&a_outcome);
        let a = rt.group_spawn(
            &mut group,
            Box::new(move |_rt, resume| match resume {
                Resume::Start => Step::Sleep(Duration::from_millis(200)),
                Resume::Cancelled(e) => {
                    *a_seen.lock().unwrap() = Some(e.kind);
                    Step::Done(Err(e))
                }
                Resume::Ready(_) => Step::Done(Ok(Value::null())),
                other => panic!("unexpected resume {:?}", other),
            }),
        );
        let _b = rt.group_spawn(
            &mut group,
            Box::new(|_rt, resume| match resume {
                Resume::Start => Step::Sleep(Duration::from_millis(5)),
                _ => Step::Done(Err(crate::errors::value_error("b failed"))),
            }),
        );
        let result = rt.run_main(Runtime::group_join_fiber(group));

        let err = result.unwrap_err();
        assert_eq!(err.kind, molt_core::ErrorKind::Value);
        assert_eq!(err.message, "b failed");
        assert_eq!(
            *a_outcome.lock().unwrap(),
            Some(molt_core::ErrorKind::Cancelled)
        );
        // A's 200ms sleep was cut short by the cancellation.
        assert!(started.elapsed() < Duration::from_millis(100));
        // A terminated with the cancellation it observed.
        match rt.task_result(a) {
            Some(Err(e)) => assert_eq!(e.kind, molt_core::ErrorKind::Cancelled),
            other => panic!("expected cancelled result, got {:?}", other.map(|r| r.is_ok())),
        }
    }

    #[test]
    fn test_cancellation_delivered_once() {
        let rt = rt();
        let deliveries = Arc::new(Mutex::new(0));
        let count = Arc::clone(&deliveries);
        let id = rt.spawn(Box::new(move |_rt, resume| match resume {
            Resume::Start => Step::Sleep(Duration::from_millis(50)),
            Resume::Cancelled(_) => {
                *count.lock().unwrap() += 1;
                // Swallow the cancellation and suspend twice more; the
                // same event must not be delivered again.
                Step::Yield
            }
            Resume::Ready(_) => Step::Done(Ok(Value::null())),
            other => panic!("unexpected resume {:?}", other),
        }));
        let rt_ref = &rt;
        rt_ref.call_soon(Box::new(move |rt| rt.cancel_task(id)));
        rt.run();
        assert_eq!(*deliveries.lock().unwrap(), 1);
    }

    #[test]
    fn test_deadline_group_cancels_children() {
        let rt = rt();
        let mut group = rt.group_with_deadline(Instant::now() + Duration::from_millis(10));
        rt.group_spawn(
            &mut group,
            Box::new(|_rt, resume| match resume {
                Resume::Start => Step::Sleep(Duration::from_millis(500)),
                Resume::Cancelled(e) => Step::Done(Err(e)),
                _ => Step::Done(Ok(Value::null())),
            }),
        );
        let started = Instant::now();
        let result = rt.run_main(Runtime::group_join_fiber(group));
        assert_eq!(result.unwrap_err().kind, molt_core::ErrorKind::Cancelled);
        assert!(started.elapsed() < Duration::from_millis(200));
    }
}
