//! Bounded MPMC channels
//!
//! Channels are the communication primitive between tasks. Backpressure
//! is mandatory: a send on a full channel suspends the sending task, a
//! receive on an empty channel suspends the receiver. Waiters on each
//! endpoint are FIFO queues, so fairness per (sender, receiver) pair is
//! structural.
//!
//! The table here owns channel state and per-channel statistics; it
//! never touches the scheduler. Operations that complete a peer's
//! suspension return [`Wake`] records and the runtime applies them to
//! the scheduler, keeping lock order one-directional.

use std::collections::{HashMap, VecDeque};

use crate::errors::{value_error, RtError};
use crate::task::{Resume, TaskId};
use crate::value::Value;

/// A task to reschedule, with its resume payload.
pub type Wake = (TaskId, Resume);

/// Non-blocking send result.
#[derive(Debug)]
pub enum SendOutcome {
    Sent,
    Full,
    Closed,
}

/// Non-blocking receive result.
#[derive(Debug)]
pub enum RecvOutcome {
    Received(Value),
    Empty,
    Closed,
}

/// Per-channel statistics (diagnostics).
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelStats {
    pub send_count: u64,
    pub recv_count: u64,
    pub queue_depth: usize,
}

struct ChannelState {
    bound: usize,
    queue: VecDeque<Value>,
    /// Senders parked on a full queue, with their pending values.
    send_waiters: VecDeque<(TaskId, Value)>,
    /// Receivers parked on an empty queue.
    recv_waiters: VecDeque<TaskId>,
    closed: bool,
    send_count: u64,
    recv_count: u64,
}

/// The channel registry: id -> state.
#[derive(Default)]
pub struct ChannelTable {
    next_id: u64,
    chans: HashMap<u64, ChannelState>,
}

fn closed_error() -> RtError {
    value_error("channel is closed")
}

fn invalid_channel(id: u64) -> RtError {
    value_error(format!("invalid channel id {}", id))
}

impl ChannelTable {
    pub fn new() -> Self {
        ChannelTable {
            next_id: 1,
            chans: HashMap::new(),
        }
    }

    /// Create a channel with the given bound (>= 1).
    pub fn create(&mut self, bound: usize) -> Result<u64, RtError> {
        if bound == 0 {
            return Err(value_error("channel bound must be at least 1"));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.chans.insert(
            id,
            ChannelState {
                bound,
                queue: VecDeque::new(),
                send_waiters: VecDeque::new(),
                recv_waiters: VecDeque::new(),
                closed: false,
                send_count: 0,
                recv_count: 0,
            },
        );
        Ok(id)
    }

    /// Non-blocking send. On success, at most one parked receiver is
    /// woken with the head of the queue.
    pub fn try_send(
        &mut self,
        id: u64,
        value: Value,
    ) -> Result<(SendOutcome, Option<Wake>), RtError> {
        let chan = self.chans.get_mut(&id).ok_or_else(|| invalid_channel(id))?;
        if chan.closed {
            return Ok((SendOutcome::Closed, None));
        }
        if chan.queue.len() >= chan.bound {
            return Ok((SendOutcome::Full, None));
        }
        chan.queue.push_back(value);
        chan.send_count += 1;
        let wake = chan.recv_waiters.pop_front().map(|task| {
            chan.recv_count += 1;
            let v = chan.queue.pop_front().expect("queue nonempty after push");
            (task, Resume::Ready(v))
        });
        Ok((SendOutcome::Sent, wake))
    }

    /// Non-blocking receive. On success, at most one parked sender's
    /// pending value moves into the queue and that sender is woken.
    pub fn try_recv(&mut self, id: u64) -> Result<(RecvOutcome, Option<Wake>), RtError> {
        let chan = self.chans.get_mut(&id).ok_or_else(|| invalid_channel(id))?;
        if let Some(v) = chan.queue.pop_front() {
            chan.recv_count += 1;
            let wake = chan.send_waiters.pop_front().map(|(task, pending)| {
                chan.queue.push_back(pending);
                chan.send_count += 1;
                (task, Resume::Ready(Value::null()))
            });
            return Ok((RecvOutcome::Received(v), wake));
        }
        // Empty queue; a parked sender can hand its value over directly.
        if let Some((task, pending)) = chan.send_waiters.pop_front() {
            chan.send_count += 1;
            chan.recv_count += 1;
            return Ok((
                RecvOutcome::Received(pending),
                Some((task, Resume::Ready(Value::null()))),
            ));
        }
        if chan.closed {
            return Ok((RecvOutcome::Closed, None));
        }
        Ok((RecvOutcome::Empty, None))
    }

    /// Park a sender whose value did not fit.
    pub fn park_sender(&mut self, id: u64, task: TaskId, value: Value) -> Result<(), RtError> {
        let chan = self.chans.get_mut(&id).ok_or_else(|| invalid_channel(id))?;
        chan.send_waiters.push_back((task, value));
        Ok(())
    }

    /// Park a receiver on an empty channel.
    pub fn park_receiver(&mut self, id: u64, task: TaskId) -> Result<(), RtError> {
        let chan = self.chans.get_mut(&id).ok_or_else(|| invalid_channel(id))?;
        chan.recv_waiters.push_back(task);
        Ok(())
    }

    /// Detach a task from any waiter queue (cancellation path). Returns
    /// the parked value if the task was a waiting sender.
    pub fn detach_waiter(&mut self, id: u64, task: TaskId) -> Option<Value> {
        let chan = self.chans.get_mut(&id)?;
        chan.recv_waiters.retain(|t| *t != task);
        if let Some(pos) = chan.send_waiters.iter().position(|(t, _)| *t == task) {
            return chan.send_waiters.remove(pos).map(|(_, v)| v);
        }
        None
    }

    /// Close a channel. Every parked waiter is woken with a closed-channel
    /// error; queued values remain receivable.
    pub fn close(&mut self, id: u64) -> Result<Vec<Wake>, RtError> {
        let chan = self.chans.get_mut(&id).ok_or_else(|| invalid_channel(id))?;
        chan.closed = true;
        let mut wakes = Vec::new();
        for (task, _value) in chan.send_waiters.drain(..) {
            wakes.push((task, Resume::Err(closed_error())));
        }
        for task in chan.recv_waiters.drain(..) {
            wakes.push((task, Resume::Err(closed_error())));
        }
        Ok(wakes)
    }

    pub fn stats(&self, id: u64) -> Option<ChannelStats> {
        self.chans.get(&id).map(|c| ChannelStats {
            send_count: c.send_count,
            recv_count: c.recv_count,
            queue_depth: c.queue.len(),
        })
    }

    /// Outstanding sent-but-unreceived items (bound invariant checks).
    pub fn depth(&self, id: u64) -> Option<usize> {
        self.chans.get(&id).map(|c| c.queue.len())
    }

    pub fn open_count(&self) -> usize {
        self.chans.values().filter(|c| !c.closed).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bound_enforced() {
        let mut table = ChannelTable::new();
        let id = table.create(2).unwrap();
        assert!(matches!(
            table.try_send(id, Value::small_int(1)).unwrap().0,
            SendOutcome::Sent
        ));
        assert!(matches!(
            table.try_send(id, Value::small_int(2)).unwrap().0,
            SendOutcome::Sent
        ));
        assert!(matches!(
            table.try_send(id, Value::small_int(3)).unwrap().0,
            SendOutcome::Full
        ));
        assert_eq!(table.depth(id), Some(2));
    }

    #[test]
    fn test_fifo_order() {
        let mut table = ChannelTable::new();
        let id = table.create(3).unwrap();
        for n in 1..=3 {
            table.try_send(id, Value::small_int(n)).unwrap();
        }
        for n in 1..=3 {
            match table.try_recv(id).unwrap().0 {
                RecvOutcome::Received(v) => assert_eq!(v.expect_i64().unwrap(), n),
                other => panic!("expected value, got {:?}", other),
            }
        }
        assert!(matches!(table.try_recv(id).unwrap().0, RecvOutcome::Empty));
    }

    #[test]
    fn test_recv_wakes_parked_sender_in_order() {
        let mut table = ChannelTable::new();
        let id = table.create(1).unwrap();
        table.try_send(id, Value::small_int(1)).unwrap();
        table.park_sender(id, 101, Value::small_int(2)).unwrap();
        table.park_sender(id, 102, Value::small_int(3)).unwrap();

        // First receive: v1 out, first parked sender's value moves in.
        let (out, wake) = table.try_recv(id).unwrap();
        assert!(matches!(out, RecvOutcome::Received(v) if v.expect_i64().unwrap() == 1));
        assert!(matches!(wake, Some((101, Resume::Ready(_)))));
        assert_eq!(table.depth(id), Some(1));

        let (out, wake) = table.try_recv(id).unwrap();
        assert!(matches!(out, RecvOutcome::Received(v) if v.expect_i64().unwrap() == 2));
        assert!(matches!(wake, Some((102, Resume::Ready(_)))));

        let (out, wake) = table.try_recv(id).unwrap();
        assert!(matches!(out, RecvOutcome::Received(v) if v.expect_i64().unwrap() == 3));
        assert!(wake.is_none());
    }

    #[test]
    fn test_send_hands_value_to_parked_receiver() {
        let mut table = ChannelTable::new();
        let id = table.create(1).unwrap();
        table.park_receiver(id, 201).unwrap();
        let (out, wake) = table.try_send(id, Value::small_int(9)).unwrap();
        assert!(matches!(out, SendOutcome::Sent));
        match wake {
            Some((201, Resume::Ready(v))) => assert_eq!(v.expect_i64().unwrap(), 9),
            other => panic!("expected receiver wake, got {:?}", other),
        }
        // Value went straight through; the queue is empty again.
        assert_eq!(table.depth(id), Some(0));
    }

    #[test]
    fn test_close_wakes_waiters_with_error() {
        let mut table = ChannelTable::new();
        let id = table.create(1).unwrap();
        table.try_send(id, Value::small_int(1)).unwrap();
        table.park_sender(id, 301, Value::small_int(2)).unwrap();
        table.park_receiver(id, 302).unwrap();
        let wakes = table.close(id).unwrap();
        assert_eq!(wakes.len(), 2);
        assert!(wakes.iter().all(|(_, r)| matches!(r, Resume::Err(_))));
        // Queued value still receivable after close.
        assert!(matches!(
            table.try_recv(id).unwrap().0,
            RecvOutcome::Received(_)
        ));
        assert!(matches!(table.try_recv(id).unwrap().0, RecvOutcome::Closed));
        // Sends fail fast.
        assert!(matches!(
            table.try_send(id, Value::small_int(3)).unwrap().0,
            SendOutcome::Closed
        ));
    }

    #[test]
    fn test_zero_bound_rejected() {
        let mut table = ChannelTable::new();
        assert!(table.create(0).is_err());
    }

    #[test]
    fn test_detach_waiter() {
        let mut table = ChannelTable::new();
        let id = table.create(1).unwrap();
        table.park_sender(id, 401, Value::small_int(7)).unwrap();
        let parked = table.detach_waiter(id, 401);
        assert!(parked.is_some());
        assert!(table.detach_waiter(id, 401).is_none());
    }
}
