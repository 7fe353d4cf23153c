/*
 * scheduler.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Tagliacarte, a cross-platform email client.
 *
 * Tagliacarte is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Tagliacarte is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Tagliacarte.  If not, see <http://www.gnu.org/licenses/>.
 */

//! A single auxiliary thread that runs delayed tasks (retransmissions,
//! delayed acks, handshake timeouts) ordered by deadline.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

type Task = Box<dyn FnOnce() + Send>;

/// A deadline that's either "run immediately, ahead of anything already
/// queued" (used to force-close a socket that exceeded its retry budget
/// without waiting for other pending timers) or a concrete instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deadline {
    Immediate,
    At(Instant),
}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Deadline::Immediate, Deadline::Immediate) => Ordering::Equal,
            (Deadline::Immediate, Deadline::At(_)) => Ordering::Less,
            (Deadline::At(_), Deadline::Immediate) => Ordering::Greater,
            (Deadline::At(a), Deadline::At(b)) => a.cmp(b),
        }
    }
}

struct Entry {
    deadline: Deadline,
    seq: u64,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; we want the earliest deadline on top.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Inner {
    heap: Mutex<BinaryHeap<Entry>>,
    cv: Condvar,
    closed: Mutex<bool>,
    seq: AtomicU64,
}

/// Owns the timer thread. Dropping the last handle does not stop the
/// thread; call `shutdown` explicitly (the mailbox facade does this from
/// its own `close`).
pub struct Scheduler {
    inner: Arc<Inner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn start() -> Self {
        let inner = Arc::new(Inner {
            heap: Mutex::new(BinaryHeap::new()),
            cv: Condvar::new(),
            closed: Mutex::new(false),
            seq: AtomicU64::new(0),
        });
        let worker_inner = Arc::clone(&inner);
        let thread = std::thread::spawn(move || run(worker_inner));
        Self {
            inner,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// Schedule `task` to run after `delay`.
    pub fn schedule_after(&self, delay: Duration, task: impl FnOnce() + Send + 'static) {
        self.push(Deadline::At(Instant::now() + delay), task);
    }

    /// Schedule `task` to run as soon as possible, ahead of any other
    /// pending task regardless of its deadline.
    pub fn schedule_immediate(&self, task: impl FnOnce() + Send + 'static) {
        self.push(Deadline::Immediate, task);
    }

    fn push(&self, deadline: Deadline, task: impl FnOnce() + Send + 'static) {
        let seq = self.inner.seq.fetch_add(1, AtomicOrdering::Relaxed);
        let mut heap = self.inner.heap.lock().unwrap();
        heap.push(Entry {
            deadline,
            seq,
            task: Box::new(task),
        });
        drop(heap);
        self.inner.cv.notify_all();
    }

    pub fn shutdown(&self) {
        *self.inner.closed.lock().unwrap() = true;
        self.inner.cv.notify_all();
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn run(inner: Arc<Inner>) {
    loop {
        let entry = {
            let mut heap = inner.heap.lock().unwrap();
            loop {
                if *inner.closed.lock().unwrap() {
                    return;
                }
                match heap.peek() {
                    None => {
                        heap = inner.cv.wait(heap).unwrap();
                    }
                    Some(top) => match top.deadline {
                        Deadline::Immediate => break,
                        Deadline::At(at) => {
                            let now = Instant::now();
                            if at <= now {
                                break;
                            }
                            let (next, timeout) = inner.cv.wait_timeout(heap, at - now).unwrap();
                            heap = next;
                            let _ = timeout;
                        }
                    },
                }
            }
            heap.pop()
        };
        if let Some(entry) = entry {
            (entry.task)();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn runs_tasks_in_deadline_order() {
        let scheduler = Scheduler::start();
        let (tx, rx) = mpsc::channel();

        let tx2 = tx.clone();
        scheduler.schedule_after(Duration::from_millis(30), move || tx2.send(2).unwrap());
        let tx1 = tx.clone();
        scheduler.schedule_after(Duration::from_millis(5), move || tx1.send(1).unwrap());

        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 2);
        scheduler.shutdown();
    }

    #[test]
    fn immediate_task_jumps_the_queue() {
        let scheduler = Scheduler::start();
        let (tx, rx) = mpsc::channel();

        let tx2 = tx.clone();
        scheduler.schedule_after(Duration::from_millis(50), move || tx2.send("late").unwrap());
        let tx1 = tx.clone();
        scheduler.schedule_immediate(move || tx1.send("now").unwrap());

        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), "now");
        scheduler.shutdown();
    }
}
