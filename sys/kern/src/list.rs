// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Index-linked thread lists and the sleep queue.
//!
//! Threads live in a fixed table, so kernel data structures reference them
//! by table index instead of by pointer. A `ThreadList` is a FIFO chained
//! through each thread's scheduler link field; the `SleepQueue` is a sorted
//! fixed-capacity array (a thread occupies at most one entry, so capacity
//! equals the table size).

use crate::config::MAX_THREADS;
use crate::thread::ThreadTable;
use crate::time::Timestamp;

/// FIFO of threads, linked through `Thread::sched.next`.
///
/// A thread may be on at most one `ThreadList` at a time; the link field is
/// owned by whichever list the thread is on.
///
/// (The EDF policy manages its sorted and circular lists through the link
/// field directly, so this type is only compiled for the policies that use
/// it.)
#[cfg(any(feature = "scheduler-priority", feature = "scheduler-control"))]
#[derive(Copy, Clone, Debug)]
pub(crate) struct ThreadList {
    pub head: Option<u16>,
    pub tail: Option<u16>,
}

#[cfg(any(feature = "scheduler-priority", feature = "scheduler-control"))]
impl ThreadList {
    pub const EMPTY: Self = Self {
        head: None,
        tail: None,
    };

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn push_back(&mut self, table: &mut ThreadTable, idx: u16) {
        table.set_sched_next(idx, None);
        match self.tail {
            Some(t) => table.set_sched_next(t, Some(idx)),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
    }

    /// Unlinks `idx` from the list. Returns `false` if it wasn't there.
    pub fn remove(&mut self, table: &mut ThreadTable, idx: u16) -> bool {
        let mut prev: Option<u16> = None;
        let mut cur = self.head;
        while let Some(c) = cur {
            if c == idx {
                let after = table.sched_next(c);
                match prev {
                    Some(p) => table.set_sched_next(p, after),
                    None => self.head = after,
                }
                if self.tail == Some(c) {
                    self.tail = prev;
                }
                table.set_sched_next(c, None);
                return true;
            }
            prev = cur;
            cur = table.sched_next(c);
        }
        false
    }

    pub fn contains(&self, table: &ThreadTable, idx: u16) -> bool {
        let mut cur = self.head;
        while let Some(c) = cur {
            if c == idx {
                return true;
            }
            cur = table.sched_next(c);
        }
        false
    }
}

/// One parked timed wait: `thread` should be woken at `wakeup_time`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct SleepEntry {
    pub thread: u16,
    pub wakeup_time: Timestamp,
}

/// The global sleep queue, ordered by wakeup time ascending. Ties keep
/// insertion order, so two threads sleeping until the same instant wake in
/// the order they went to sleep.
pub(crate) struct SleepQueue {
    buf: [SleepEntry; MAX_THREADS],
    len: usize,
}

impl SleepQueue {
    pub const fn new() -> Self {
        Self {
            buf: [SleepEntry {
                thread: 0,
                wakeup_time: Timestamp::ZERO,
            }; MAX_THREADS],
            len: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Wakeup time of the earliest entry, or `NEVER` if nobody is sleeping.
    /// This is what the preemption timer gets armed against.
    pub fn head_time(&self) -> Timestamp {
        if self.len == 0 {
            Timestamp::NEVER
        } else {
            self.buf[0].wakeup_time
        }
    }

    pub fn head(&self) -> Option<SleepEntry> {
        if self.len == 0 {
            None
        } else {
            Some(self.buf[0])
        }
    }

    /// Inserts an entry, keeping the queue sorted. Equal wakeup times go
    /// after existing entries (stable ties).
    ///
    /// The queue has one slot per thread table slot and a thread can occupy
    /// at most one entry, so running out of room means a kernel bug.
    pub fn insert(&mut self, entry: SleepEntry) {
        if self.len >= self.buf.len() {
            crate::fail::die(crate::fail::KernelError::Unexpected);
        }
        let mut i = self.len;
        while i > 0 && self.buf[i - 1].wakeup_time > entry.wakeup_time {
            self.buf[i] = self.buf[i - 1];
            i -= 1;
        }
        self.buf[i] = entry;
        self.len += 1;
    }

    /// Removes and returns the earliest entry.
    pub fn pop_head(&mut self) -> Option<SleepEntry> {
        if self.len == 0 {
            return None;
        }
        let head = self.buf[0];
        self.len -= 1;
        for i in 0..self.len {
            self.buf[i] = self.buf[i + 1];
        }
        Some(head)
    }

    /// Removes the entry belonging to `thread`, if present (early wakeup).
    pub fn remove_thread(&mut self, thread: u16) -> bool {
        for i in 0..self.len {
            if self.buf[i].thread == thread {
                self.len -= 1;
                for j in i..self.len {
                    self.buf[j] = self.buf[j + 1];
                }
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn e(thread: u16, t: i64) -> SleepEntry {
        SleepEntry {
            thread,
            wakeup_time: Timestamp::from_ns(t),
        }
    }

    #[test]
    fn sleep_queue_orders_by_wakeup_time() {
        let mut q = SleepQueue::new();
        q.insert(e(1, 300));
        q.insert(e(2, 100));
        q.insert(e(3, 200));
        assert_eq!(q.head_time(), Timestamp::from_ns(100));
        assert_eq!(q.pop_head().unwrap().thread, 2);
        assert_eq!(q.pop_head().unwrap().thread, 3);
        assert_eq!(q.pop_head().unwrap().thread, 1);
        assert!(q.pop_head().is_none());
        assert_eq!(q.head_time(), Timestamp::NEVER);
    }

    #[test]
    fn sleep_queue_ties_keep_insertion_order() {
        let mut q = SleepQueue::new();
        q.insert(e(7, 500));
        q.insert(e(8, 500));
        q.insert(e(9, 500));
        assert_eq!(q.pop_head().unwrap().thread, 7);
        assert_eq!(q.pop_head().unwrap().thread, 8);
        assert_eq!(q.pop_head().unwrap().thread, 9);
    }

    #[test]
    fn sleep_queue_remove_thread() {
        let mut q = SleepQueue::new();
        q.insert(e(1, 100));
        q.insert(e(2, 200));
        q.insert(e(3, 300));
        assert!(q.remove_thread(2));
        assert!(!q.remove_thread(2));
        assert_eq!(q.pop_head().unwrap().thread, 1);
        assert_eq!(q.pop_head().unwrap().thread, 3);
    }
}
