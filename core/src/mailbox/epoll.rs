/*
 * epoll.rs
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

//! A readiness multiplexer in the shape of POSIX `epoll`: a group waits on
//! a set of sockets for read- or exception-readiness and wakes when any of
//! them becomes ready. Lock order is always registry -> socket context ->
//! epoll group, matching `socket.rs`/`mailbox_impl.rs`.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// One `epoll_create`-like group: the sockets it's watching and the subset
/// that's currently ready.
#[derive(Default)]
pub struct EpollGroup {
    pub rset: HashSet<u64>,
    pub xset: HashSet<u64>,
    pub ready_r: HashSet<u64>,
    pub ready_x: HashSet<u64>,
    pub closed: bool,
}

pub struct EpollContext {
    pub state: Mutex<EpollGroup>,
    pub cv: Condvar,
}

impl EpollContext {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EpollGroup::default()),
            cv: Condvar::new(),
        }
    }

    pub fn add(&self, rset: &HashSet<u64>, xset: &HashSet<u64>) {
        let mut state = self.state.lock().unwrap();
        state.rset.extend(rset.iter().copied());
        state.xset.extend(xset.iter().copied());
    }

    pub fn remove(&self, rset: &HashSet<u64>, xset: &HashSet<u64>) {
        let mut state = self.state.lock().unwrap();
        for sid in rset {
            state.rset.remove(sid);
            state.ready_r.remove(sid);
        }
        for sid in xset {
            state.xset.remove(sid);
            state.ready_x.remove(sid);
        }
    }

    /// Mark `sid` read-ready (or not) within this group; called by socket
    /// code whenever a watched socket's readability changes.
    pub fn notify_read(&self, sid: u64, ready: bool) {
        let mut state = self.state.lock().unwrap();
        if !state.rset.contains(&sid) {
            return;
        }
        if ready {
            state.ready_r.insert(sid);
        } else {
            state.ready_r.remove(&sid);
        }
        drop(state);
        self.cv.notify_all();
    }

    pub fn notify_exception(&self, sid: u64, ready: bool) {
        let mut state = self.state.lock().unwrap();
        if !state.xset.contains(&sid) {
            return;
        }
        if ready {
            state.ready_x.insert(sid);
        } else {
            state.ready_x.remove(&sid);
        }
        drop(state);
        self.cv.notify_all();
    }

    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        drop(state);
        self.cv.notify_all();
    }

    /// Block until at least one watched socket is ready, the group is
    /// closed, or `timeout` elapses. Returns the ready read/exception sets.
    pub fn wait(&self, timeout: Option<Duration>) -> (HashSet<u64>, HashSet<u64>) {
        let mut state = self.state.lock().unwrap();
        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            if state.closed || !state.ready_r.is_empty() || !state.ready_x.is_empty() {
                return (state.ready_r.clone(), state.ready_x.clone());
            }
            match deadline {
                None => state = self.cv.wait(state).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return (state.ready_r.clone(), state.ready_x.clone());
                    }
                    let (next, _timeout) = self.cv.wait_timeout(state, deadline - now).unwrap();
                    state = next;
                }
            }
        }
    }
}

impl Default for EpollContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_wakes_up_when_a_watched_socket_becomes_ready() {
        let epoll = Arc::new(EpollContext::new());
        epoll.add(&HashSet::from([1, 2]), &HashSet::new());

        let epoll2 = Arc::clone(&epoll);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            epoll2.notify_read(2, true);
        });

        let (ready_r, ready_x) = epoll.wait(Some(Duration::from_secs(2)));
        assert_eq!(ready_r, HashSet::from([2]));
        assert!(ready_x.is_empty());
        handle.join().unwrap();
    }

    #[test]
    fn wait_times_out_with_nothing_ready() {
        let epoll = EpollContext::new();
        epoll.add(&HashSet::from([1]), &HashSet::new());
        let (ready_r, ready_x) = epoll.wait(Some(Duration::from_millis(20)));
        assert!(ready_r.is_empty());
        assert!(ready_x.is_empty());
    }

    #[test]
    fn unwatched_socket_readiness_is_ignored() {
        let epoll = EpollContext::new();
        epoll.add(&HashSet::from([1]), &HashSet::new());
        epoll.notify_read(99, true);
        let (ready_r, _) = epoll.wait(Some(Duration::from_millis(10)));
        assert!(ready_r.is_empty());
    }
}
