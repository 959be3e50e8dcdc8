//! I/O readiness poller
//!
//! A thin wrapper over `poll(2)`. Tasks blocked on fd readiness are
//! registered here; the scheduler calls [`Poller::wait`] only while the
//! runtime lock is NOT held, so no I/O wait ever blocks other tasks'
//! state mutation. On sandbox targets the poller is not used; readiness
//! is a delegated host call.

use std::time::Duration;

use crate::task::{IoInterest, TaskId};

struct IoWaiter {
    fd: i32,
    interest: IoInterest,
    task: TaskId,
}

#[derive(Default)]
pub struct Poller {
    waiters: Vec<IoWaiter>,
}

impl Poller {
    pub fn new() -> Self {
        Poller::default()
    }

    pub fn register(&mut self, fd: i32, interest: IoInterest, task: TaskId) {
        self.waiters.push(IoWaiter { fd, interest, task });
    }

    /// Drop any registration for a task (cancellation path).
    pub fn deregister_task(&mut self, task: TaskId) {
        self.waiters.retain(|w| w.task != task);
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }

    /// Block up to `timeout` for readiness; `None` blocks indefinitely.
    /// Returns the tasks whose fds became ready (or errored/hung up,
    /// which also unblocks the waiter so it can observe the condition).
    pub fn wait(&mut self, timeout: Option<Duration>) -> Vec<TaskId> {
        if self.waiters.is_empty() {
            return Vec::new();
        }
        let mut fds: Vec<libc::pollfd> = self
            .waiters
            .iter()
            .map(|w| libc::pollfd {
                fd: w.fd,
                events: match w.interest {
                    IoInterest::Readable => libc::POLLIN,
                    IoInterest::Writable => libc::POLLOUT,
                },
                revents: 0,
            })
            .collect();
        let timeout_ms: i32 = match timeout {
            Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
            None => -1,
        };
        let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if n <= 0 {
            // Timeout or EINTR; the scheduler re-enters as needed.
            return Vec::new();
        }
        let mut ready = Vec::new();
        let mut remaining = Vec::new();
        for (waiter, pfd) in self.waiters.drain(..).zip(fds.iter()) {
            let hit = pfd.revents & (pfd.events | libc::POLLERR | libc::POLLHUP) != 0;
            if hit {
                ready.push(waiter.task);
            } else {
                remaining.push(waiter);
            }
        }
        self.waiters = remaining;
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_fds() -> (i32, i32) {
        let mut fds = [0i32; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0, "pipe(2) failed");
        (fds[0], fds[1])
    }

    fn close(fd: i32) {
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_ready_pipe_wakes_reader() {
        let (read_fd, write_fd) = pipe_fds();
        let mut poller = Poller::new();
        poller.register(read_fd, IoInterest::Readable, 7);
        // Nothing written yet: a zero timeout reports nothing ready.
        assert!(poller.wait(Some(Duration::from_millis(0))).is_empty());
        let wrote = unsafe { libc::write(write_fd, b"x".as_ptr().cast(), 1) };
        assert_eq!(wrote, 1);
        let ready = poller.wait(Some(Duration::from_millis(100)));
        assert_eq!(ready, vec![7]);
        assert!(!poller.has_waiters());
        close(read_fd);
        close(write_fd);
    }

    #[test]
    fn test_deregister() {
        let (read_fd, write_fd) = pipe_fds();
        let mut poller = Poller::new();
        poller.register(read_fd, IoInterest::Readable, 9);
        poller.deregister_task(9);
        assert!(!poller.has_waiters());
        close(read_fd);
        close(write_fd);
    }
}
