// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Earliest-deadline-first scheduling.
//!
//! A thread's key is the absolute time (nanoseconds since boot) by which its
//! current job should complete. Realtime threads live on a list sorted by
//! deadline ascending; threads with the `NON_REALTIME` sentinel key live on
//! a circular list and share whatever CPU the realtime threads leave behind,
//! round-robin with a quantum.
//!
//! Missing a deadline is observable by the application (its job finishes
//! after the deadline it set) but does not change how dispatch works: the
//! earliest deadline still wins.

use crate::config::MAX_TIME_SLICE_NS;
use crate::config::MAX_THREADS;
use crate::fail::{die, KernelError};
use crate::thread::ThreadTable;
use crate::time::Timestamp;

/// An EDF scheduling key: an absolute deadline in nanoseconds. Smaller is
/// more urgent.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct Priority(pub i64);

impl Priority {
    /// Sentinel key for threads with no realtime requirement; they are
    /// served round-robin behind all realtime threads.
    pub const NON_REALTIME: Self = Self(i64::MAX - 2);

    /// The idle thread sorts after even the non-realtime sentinel.
    pub(crate) const IDLE: Self = Self(i64::MAX - 1);

    pub(crate) fn idle() -> Self {
        Self::IDLE
    }

    /// Key given to the kernel half of process threads; processes have no
    /// deadline of their own.
    #[cfg(feature = "processes")]
    pub(crate) fn process_default() -> Self {
        Self::NON_REALTIME
    }

    pub fn valid_for_create(self) -> bool {
        self.0 >= 0 && self.0 <= Self::NON_REALTIME.0
    }

    /// An earlier deadline outranks a later one.
    pub fn outranks(self, other: Self) -> bool {
        self.0 < other.0
    }

    fn is_realtime(self) -> bool {
        self.0 < Self::NON_REALTIME.0
    }

    #[cfg(test)]
    pub(crate) fn default_for_test() -> Self {
        Self::NON_REALTIME
    }
}

/// Per-thread state owned by this policy.
#[derive(Copy, Clone, Debug)]
pub struct SchedData {
    pub(crate) priority: Priority,
    /// Next link: in the sorted realtime list, or in the non-realtime
    /// circle (where it is always `Some` while the thread is enrolled).
    pub(crate) next: Option<u16>,
}

impl SchedData {
    pub(crate) fn new(priority: Priority) -> Self {
        Self {
            priority,
            next: None,
        }
    }

    pub(crate) fn priority(&self) -> Priority {
        self.priority
    }
}

pub struct Scheduler {
    /// Realtime threads, sorted by deadline ascending.
    head: Option<u16>,
    /// Non-realtime threads, a circular list; this pointer is also the
    /// round-robin cursor.
    head_nrt: Option<u16>,
    idle: Option<u16>,
    next_preemption: Timestamp,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            head: None,
            head_nrt: None,
            idle: None,
            next_preemption: Timestamp::NEVER,
        }
    }

    pub fn pk_add_thread(
        &mut self,
        threads: &mut ThreadTable,
        idx: u16,
        priority: Priority,
    ) {
        if let Some(t) = threads.get_mut(idx) {
            t.sched.priority = priority;
        }
        self.add(threads, idx);
    }

    pub fn pk_exists(
        &self,
        threads: &ThreadTable,
        _running: u16,
        idx: u16,
    ) -> bool {
        // Unlike the fixed-priority policy, threads stay enrolled while
        // running, so no running-thread exception is needed here.
        let live = |i: u16| {
            threads
                .get(i)
                .map(|t| !t.flags.is_reclaimable())
                .unwrap_or(false)
        };
        let mut cur = self.head;
        while let Some(i) = cur {
            if i == idx {
                return live(i);
            }
            cur = threads.sched_next(i);
        }
        if let Some(start) = self.head_nrt {
            let mut i = start;
            loop {
                if i == idx {
                    return live(i);
                }
                i = match threads.sched_next(i) {
                    Some(n) => n,
                    None => die(KernelError::Unexpected),
                };
                if i == start {
                    break;
                }
            }
        }
        false
    }

    /// Reclaims deleted+detached threads with a two-pass sweep: first
    /// collect the victims from both lists, then unlink and free each one.
    /// Unlinking while walking a circular list is exactly the kind of
    /// cleverness that goes wrong, so we don't. Threads enrolled here stay
    /// listed while running, so the sweep also skips anything a core is
    /// still executing.
    pub fn pk_remove_dead_threads(
        &mut self,
        threads: &mut ThreadTable,
        running: &[u16; crate::config::CORES],
    ) {
        let mut dead = [0u16; MAX_THREADS];
        let mut n = 0;
        let mut note = |i: u16, threads: &ThreadTable| {
            if !running.contains(&i)
                && threads
                    .get(i)
                    .map(|t| t.flags.is_reclaimable())
                    .unwrap_or(false)
            {
                dead[n] = i;
                n += 1;
            }
        };

        let mut cur = self.head;
        while let Some(i) = cur {
            note(i, threads);
            cur = threads.sched_next(i);
        }
        if let Some(start) = self.head_nrt {
            let mut i = start;
            loop {
                note(i, threads);
                i = match threads.sched_next(i) {
                    Some(nx) => nx,
                    None => die(KernelError::Unexpected),
                };
                if i == start {
                    break;
                }
            }
        }

        for &i in &dead[..n] {
            self.remove(threads, i);
            threads.free(i);
        }
    }

    /// Re-keys a thread: remove, update, insert. This is also the priority
    /// inheritance entry point -- inheriting under EDF means inheriting the
    /// blocker's deadline.
    pub fn pk_set_priority(
        &mut self,
        threads: &mut ThreadTable,
        _running: u16,
        idx: u16,
        new: Priority,
    ) {
        self.remove(threads, idx);
        if let Some(t) = threads.get_mut(idx) {
            t.sched.priority = new;
        }
        self.add(threads, idx);
    }

    pub fn irq_set_idle_thread(
        &mut self,
        threads: &mut ThreadTable,
        idx: u16,
    ) {
        if let Some(t) = threads.get_mut(idx) {
            t.sched.priority = Priority::IDLE;
        }
        self.idle = Some(idx);
    }

    pub fn irq_get_next_preemption(&self) -> Timestamp {
        self.next_preemption
    }

    /// Dispatch: the first ready realtime thread in deadline order; failing
    /// that, rotate the non-realtime circle to the next ready thread;
    /// failing that, idle.
    ///
    /// Preemption arming: a realtime thread runs until its deadline (a
    /// later-armed job with an earlier deadline gets in through the sleep
    /// queue or an explicit wakeup, both of which redispatch); non-realtime
    /// threads get a quantum. The sleep-queue head bounds everything.
    pub fn irq_run_scheduler(
        &mut self,
        threads: &mut ThreadTable,
        _prev: u16,
        sleep_head: Timestamp,
        now: Timestamp,
    ) -> (u16, Timestamp) {
        let mut selected = None;

        let mut cur = self.head;
        while let Some(i) = cur {
            if threads.get(i).map(|t| t.flags.is_ready()).unwrap_or(false) {
                selected = Some(i);
                break;
            }
            cur = threads.sched_next(i);
        }

        if selected.is_none() {
            if let Some(start) = self.head_nrt {
                let mut i = start;
                loop {
                    let next = match threads.sched_next(i) {
                        Some(n) => n,
                        None => die(KernelError::Unexpected),
                    };
                    let ready = threads
                        .get(i)
                        .map(|t| t.flags.is_ready())
                        .unwrap_or(false);
                    if ready {
                        selected = Some(i);
                        // Advance the cursor past the winner for fairness.
                        self.head_nrt = Some(next);
                        break;
                    }
                    i = next;
                    if i == start {
                        break;
                    }
                }
            }
        }

        let selected = selected.or(self.idle).unwrap_or_else(|| {
            // No realtime, no non-realtime, no idle: boot sequencing bug.
            die(KernelError::Unexpected)
        });

        let key = threads
            .get(selected)
            .map(|t| t.sched.priority)
            .unwrap_or(Priority::IDLE);
        let arm = if key.is_realtime() {
            sleep_head.min(Timestamp::from_ns(key.0))
        } else if key == Priority::NON_REALTIME {
            sleep_head.min(now.offset(MAX_TIME_SLICE_NS))
        } else {
            // Idle: nothing to preempt for except a sleeper coming due.
            sleep_head
        };
        self.next_preemption = arm;
        (selected, arm)
    }

    /// Inserts a thread into the structure matching its key.
    fn add(&mut self, threads: &mut ThreadTable, idx: u16) {
        let key = match threads.get(idx) {
            Some(t) => t.sched.priority,
            None => return,
        };
        if key.is_realtime() {
            // Sorted insert by deadline.
            match self.head {
                None => {
                    threads.set_sched_next(idx, None);
                    self.head = Some(idx);
                }
                Some(h)
                    if key.0
                        <= threads
                            .get(h)
                            .map(|t| t.sched.priority.0)
                            .unwrap_or(i64::MAX) =>
                {
                    threads.set_sched_next(idx, Some(h));
                    self.head = Some(idx);
                }
                Some(h) => {
                    let mut walk = h;
                    loop {
                        let next = threads.sched_next(walk);
                        let insert_here = match next {
                            None => true,
                            Some(n) => {
                                key.0
                                    <= threads
                                        .get(n)
                                        .map(|t| t.sched.priority.0)
                                        .unwrap_or(i64::MAX)
                            }
                        };
                        if insert_here {
                            threads.set_sched_next(idx, next);
                            threads.set_sched_next(walk, Some(idx));
                            break;
                        }
                        walk = next.unwrap();
                    }
                }
            }
        } else {
            // Join the non-realtime circle just after the cursor.
            match self.head_nrt {
                None => {
                    threads.set_sched_next(idx, Some(idx));
                    self.head_nrt = Some(idx);
                }
                Some(h) => {
                    let after = threads.sched_next(h);
                    threads.set_sched_next(idx, after);
                    threads.set_sched_next(h, Some(idx));
                }
            }
        }
    }

    /// Unlinks a thread from whichever structure its key places it in.
    fn remove(&mut self, threads: &mut ThreadTable, idx: u16) {
        let key = match threads.get(idx) {
            Some(t) => t.sched.priority,
            None => return,
        };
        if key.is_realtime() {
            let Some(h) = self.head else {
                die(KernelError::Unexpected);
            };
            if h == idx {
                self.head = threads.sched_next(idx);
                threads.set_sched_next(idx, None);
                return;
            }
            let mut walk = h;
            loop {
                let next = match threads.sched_next(walk) {
                    Some(n) => n,
                    None => die(KernelError::Unexpected),
                };
                if next == idx {
                    threads.set_sched_next(walk, threads.sched_next(idx));
                    threads.set_sched_next(idx, None);
                    return;
                }
                walk = next;
            }
        } else {
            let Some(h) = self.head_nrt else {
                die(KernelError::Unexpected);
            };
            // Single-element circle?
            if h == idx && threads.sched_next(idx) == Some(idx) {
                self.head_nrt = None;
                threads.set_sched_next(idx, None);
                return;
            }
            // Find the predecessor around the circle.
            let mut walk = h;
            loop {
                let next = match threads.sched_next(walk) {
                    Some(n) => n,
                    None => die(KernelError::Unexpected),
                };
                if next == idx {
                    threads.set_sched_next(walk, threads.sched_next(idx));
                    if self.head_nrt == Some(idx) {
                        self.head_nrt = threads.sched_next(idx);
                    }
                    threads.set_sched_next(idx, None);
                    return;
                }
                walk = next;
                if walk == h {
                    die(KernelError::Unexpected);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::test_support::state_with_threads;
    use crate::thread::ThreadFlags;

    fn set_deadline(
        ks: &mut crate::startup::KernelState,
        idx: u16,
        deadline: i64,
    ) {
        let running = ks.running[0];
        ks.sched.pk_set_priority(
            &mut ks.threads,
            running,
            idx,
            Priority(deadline),
        );
    }

    fn select(ks: &mut crate::startup::KernelState, now: i64) -> (u16, Timestamp) {
        let prev = ks.running[0];
        let head = ks.sleep.head_time();
        let r = ks.sched.irq_run_scheduler(
            &mut ks.threads,
            prev,
            head,
            Timestamp::from_ns(now),
        );
        ks.running[0] = r.0;
        r
    }

    #[test]
    fn earliest_deadline_wins() {
        let mut ks = state_with_threads(3);
        set_deadline(&mut ks, 1, 5_000_000);
        set_deadline(&mut ks, 2, 1_000_000);
        set_deadline(&mut ks, 3, 3_000_000);

        let (next, arm) = select(&mut ks, 0);
        assert_eq!(next, 2);
        // A realtime thread runs until its deadline (no sleepers here).
        assert_eq!(arm, Timestamp::from_ns(1_000_000));

        // When 2 blocks, 3 is next by deadline.
        ks.threads
            .get_mut(2)
            .unwrap()
            .flags
            .insert(ThreadFlags::WAIT);
        let (next, _) = select(&mut ks, 0);
        assert_eq!(next, 3);
    }

    #[test]
    fn non_realtime_round_robin_behind_realtime() {
        let mut ks = state_with_threads(3);
        // Thread 1 realtime, 2 and 3 non-realtime (the default).
        set_deadline(&mut ks, 1, 2_000_000);

        let (next, _) = select(&mut ks, 0);
        assert_eq!(next, 1);

        ks.threads
            .get_mut(1)
            .unwrap()
            .flags
            .insert(ThreadFlags::WAIT);
        let (a, arm) = select(&mut ks, 100);
        let (b, _) = select(&mut ks, 200);
        let (c, _) = select(&mut ks, 300);
        // 2 and 3 alternate.
        assert_ne!(a, b);
        assert_eq!(a, c);
        assert!([a, b].contains(&2) && [a, b].contains(&3));
        // Non-realtime threads get a quantum.
        assert_eq!(
            arm,
            Timestamp::from_ns(100).offset(MAX_TIME_SLICE_NS)
        );
    }

    #[test]
    fn sleep_queue_head_bounds_the_arming() {
        let mut ks = state_with_threads(1);
        set_deadline(&mut ks, 1, 5_000_000);
        ks.sleep.insert(crate::list::SleepEntry {
            thread: 1,
            wakeup_time: Timestamp::from_ns(40_000),
        });
        let (_, arm) = select(&mut ks, 0);
        assert_eq!(arm, Timestamp::from_ns(40_000));
    }

    #[test]
    fn idle_when_nothing_ready() {
        let mut ks = state_with_threads(2);
        for i in [1u16, 2] {
            ks.threads
                .get_mut(i)
                .unwrap()
                .flags
                .insert(ThreadFlags::WAIT);
        }
        let (next, arm) = select(&mut ks, 0);
        assert_eq!(next, 0);
        assert_eq!(arm, Timestamp::NEVER);
    }

    #[test]
    fn exists_finds_both_classes() {
        let mut ks = state_with_threads(2);
        set_deadline(&mut ks, 1, 1_000);
        assert!(ks.sched.pk_exists(&ks.threads, 1, 1)); // realtime list
        assert!(ks.sched.pk_exists(&ks.threads, 1, 2)); // NRT circle
        assert!(!ks.sched.pk_exists(&ks.threads, 1, 7));
    }

    #[test]
    fn two_pass_sweep_reclaims_from_both_lists() {
        let mut ks = state_with_threads(4);
        set_deadline(&mut ks, 1, 1_000);
        set_deadline(&mut ks, 2, 2_000);
        // 1,2 realtime; 3,4 in the circle. Kill 2 and 4.
        for i in [2u16, 4] {
            ks.threads
                .get_mut(i)
                .unwrap()
                .flags
                .insert(ThreadFlags::DELETED | ThreadFlags::DETACHED);
        }
        let running = ks.running;
        ks.sched.pk_remove_dead_threads(&mut ks.threads, &running);
        assert!(ks.threads.get(2).is_none());
        assert!(ks.threads.get(4).is_none());
        assert!(ks.sched.pk_exists(&ks.threads, 1, 1));
        assert!(ks.sched.pk_exists(&ks.threads, 1, 3));
    }

    #[test]
    fn sweep_empties_a_single_thread_circle() {
        let mut ks = state_with_threads(2);
        set_deadline(&mut ks, 1, 1_000);
        // Only thread 2 remains in the circle; delete it.
        ks.threads
            .get_mut(2)
            .unwrap()
            .flags
            .insert(ThreadFlags::DELETED | ThreadFlags::DETACHED);
        let running = ks.running;
        ks.sched.pk_remove_dead_threads(&mut ks.threads, &running);
        assert!(ks.threads.get(2).is_none());
        // The circle is empty; dispatch falls through to realtime/idle.
        let (next, _) = select(&mut ks, 0);
        assert_eq!(next, 1);
    }

    #[test]
    fn rekey_moves_between_classes() {
        let mut ks = state_with_threads(2);
        // 2 starts non-realtime; give it an urgent deadline.
        set_deadline(&mut ks, 2, 500);
        let (next, _) = select(&mut ks, 0);
        assert_eq!(next, 2);
        // And back to non-realtime.
        let running = ks.running[0];
        ks.sched.pk_set_priority(
            &mut ks.threads,
            running,
            2,
            Priority::NON_REALTIME,
        );
        assert!(ks.sched.pk_exists(&ks.threads, running, 2));
    }
}
