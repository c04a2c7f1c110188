// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-priority preemptive round-robin scheduling.
//!
//! One FIFO per priority level. A dispatch pushes the outgoing thread to
//! the tail of its level, scans levels from most to least important, and
//! takes the first ready thread it finds, removing it from the list -- the
//! running thread is never on any list. Threads at the same level therefore
//! share the CPU round-robin, one quantum at a time; a higher level
//! becoming ready preempts at the next dispatch.
//!
//! Lists hold every live non-running thread, ready or not; the scan skips
//! the blocked ones. This keeps block/unblock off the hot list-surgery path
//! at the price of a slightly longer scan, which on the small thread counts
//! involved is the right trade.

use crate::config::{CORES, MAX_TIME_SLICE_NS, PRIORITY_MAX};
use crate::fail::{die, KernelError};
use crate::list::ThreadList;
use crate::thread::ThreadTable;
use crate::time::Timestamp;

/// A fixed-priority scheduling key. Higher numbers are more important;
/// threads use `0..PRIORITY_MAX` and the idle thread sits at -1.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct Priority(pub i8);

impl Priority {
    pub(crate) const IDLE: Self = Self(-1);

    /// Key carried by the idle thread.
    pub(crate) fn idle() -> Self {
        Self::IDLE
    }

    /// Priority given to the kernel half of process threads.
    #[cfg(feature = "processes")]
    pub(crate) fn process_default() -> Self {
        Self(0)
    }

    /// Whether a thread may be created at this priority.
    pub fn valid_for_create(self) -> bool {
        self.0 >= 0 && self.0 < PRIORITY_MAX
    }

    /// True if `self` is strictly more important than `other`. Spelled out
    /// so call sites read as intent rather than as a numeric comparison.
    pub fn outranks(self, other: Self) -> bool {
        self.0 > other.0
    }

    #[cfg(test)]
    pub(crate) fn default_for_test() -> Self {
        Self(1)
    }
}

/// Per-thread state owned by this policy.
#[derive(Copy, Clone, Debug)]
pub struct SchedData {
    pub(crate) priority: Priority,
    /// Link used by whichever [`ThreadList`] the thread is on.
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

/// The policy state: one FIFO per priority level, plus the idle thread.
pub struct Scheduler {
    ready: [ThreadList; PRIORITY_MAX as usize],
    idle: Option<u16>,
    next_preemption: Timestamp,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            ready: [ThreadList::EMPTY; PRIORITY_MAX as usize],
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
        self.ready[priority.0 as usize].push_back(threads, idx);
    }

    /// Checks whether a thread is known to the scheduler and not yet dead.
    ///
    /// The currently running thread is not on any list but still counts as
    /// existing; that exception is deliberate and callers rely on it.
    pub fn pk_exists(
        &self,
        threads: &ThreadTable,
        running: u16,
        idx: u16,
    ) -> bool {
        if idx == running {
            return true;
        }
        for level in (0..PRIORITY_MAX as usize).rev() {
            if self.ready[level].contains(threads, idx) {
                return threads
                    .get(idx)
                    .map(|t| !t.flags.is_reclaimable())
                    .unwrap_or(false);
            }
        }
        false
    }

    /// The idle thread's cleanup pass: reclaims every thread that is both
    /// deleted and detached. A thread still running on some core (in its
    /// final yield) is left for the next pass.
    pub fn pk_remove_dead_threads(
        &mut self,
        threads: &mut ThreadTable,
        running: &[u16; CORES],
    ) {
        for level in 0..PRIORITY_MAX as usize {
            let mut cur = self.ready[level].head;
            while let Some(idx) = cur {
                cur = threads.sched_next(idx);
                let dead = !running.contains(&idx)
                    && threads
                        .get(idx)
                        .map(|t| t.flags.is_reclaimable())
                        .unwrap_or(false);
                if dead {
                    self.ready[level].remove(threads, idx);
                    threads.free(idx);
                }
            }
        }
    }

    /// Moves a thread to a new priority level. Used both for explicit
    /// priority changes and for priority inheritance: the thread is removed
    /// from its old list, re-keyed, and reinserted -- never mutated in
    /// place.
    pub fn pk_set_priority(
        &mut self,
        threads: &mut ThreadTable,
        running: u16,
        idx: u16,
        new: Priority,
    ) {
        if idx == running {
            // Running thread is not in any list; just change the key.
            if let Some(t) = threads.get_mut(idx) {
                t.sched.priority = new;
            }
            return;
        }
        let old = match threads.get(idx) {
            Some(t) => t.sched.priority,
            None => return,
        };
        if !self.ready[old.0 as usize].remove(threads, idx) {
            die(KernelError::Unexpected);
        }
        if let Some(t) = threads.get_mut(idx) {
            t.sched.priority = new;
        }
        self.ready[new.0 as usize].push_back(threads, idx);
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

    /// Picks the next thread to run after `prev`, returning it along with
    /// the time the preemption timer should fire next.
    ///
    /// The timer is armed at the sleep-queue head or one quantum out,
    /// whichever is sooner -- except when falling back to idle, where the
    /// quantum would only wake us up to re-pick idle.
    pub fn irq_run_scheduler(
        &mut self,
        threads: &mut ThreadTable,
        prev: u16,
        sleep_head: Timestamp,
        now: Timestamp,
    ) -> (u16, Timestamp) {
        // Round-robin: the outgoing thread goes to the back of its level.
        // The idle thread is identified by its sentinel priority and stays
        // off the lists.
        let prev_priority = threads
            .get(prev)
            .map(|t| t.sched.priority)
            .unwrap_or(Priority::IDLE);
        if prev_priority != Priority::IDLE {
            self.ready[prev_priority.0 as usize].push_back(threads, prev);
        }

        for level in (0..PRIORITY_MAX as usize).rev() {
            let mut cur = self.ready[level].head;
            while let Some(idx) = cur {
                cur = threads.sched_next(idx);
                let ready = threads
                    .get(idx)
                    .map(|t| t.flags.is_ready())
                    .unwrap_or(false);
                if ready {
                    self.ready[level].remove(threads, idx);
                    let arm = sleep_head.min(now.offset(MAX_TIME_SLICE_NS));
                    self.next_preemption = arm;
                    return (idx, arm);
                }
            }
        }

        let idle = match self.idle {
            Some(i) => i,
            None => die(KernelError::Unexpected),
        };
        self.next_preemption = sleep_head;
        (idle, sleep_head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::test_support::state_with_threads;
    use crate::thread::ThreadFlags;
    use crate::time::Timestamp;

    const T0: Timestamp = Timestamp::ZERO;

    fn select(ks: &mut crate::startup::KernelState) -> u16 {
        let prev = ks.running[0];
        let head = ks.sleep.head_time();
        let (next, _) =
            ks.sched.irq_run_scheduler(&mut ks.threads, prev, head, T0);
        ks.running[0] = next;
        next
    }

    #[test]
    fn equal_priorities_round_robin() {
        let mut ks = state_with_threads(3);
        // Threads 1..=3 all at the default priority; 1 is running.
        assert_eq!(select(&mut ks), 2);
        assert_eq!(select(&mut ks), 3);
        assert_eq!(select(&mut ks), 1);
        assert_eq!(select(&mut ks), 2);
    }

    #[test]
    fn higher_priority_wins() {
        let mut ks = state_with_threads(3);
        let running = ks.running[0];
        ks.sched.pk_set_priority(
            &mut ks.threads,
            running,
            3,
            Priority(2),
        );
        assert_eq!(select(&mut ks), 3);
        // As long as 3 stays ready it keeps getting picked.
        assert_eq!(select(&mut ks), 3);
        // Once it blocks, the lower level resumes rotating.
        ks.threads
            .get_mut(3)
            .unwrap()
            .flags
            .insert(ThreadFlags::WAIT);
        let next = select(&mut ks);
        assert_ne!(next, 3);
    }

    #[test]
    fn all_blocked_falls_back_to_idle() {
        let mut ks = state_with_threads(2);
        for idx in [1u16, 2] {
            ks.threads
                .get_mut(idx)
                .unwrap()
                .flags
                .insert(ThreadFlags::WAIT);
        }
        assert_eq!(select(&mut ks), 0); // idle lives in slot 0
    }

    #[test]
    fn idle_arms_timer_on_sleep_queue_only() {
        let mut ks = state_with_threads(1);
        ks.threads
            .get_mut(1)
            .unwrap()
            .flags
            .insert(ThreadFlags::SLEEP);
        let head = Timestamp::from_ns(500_000_000);
        let (next, arm) =
            ks.sched.irq_run_scheduler(&mut ks.threads, 1, head, T0);
        assert_eq!(next, 0);
        assert_eq!(arm, head);
        assert_eq!(ks.sched.irq_get_next_preemption(), head);
    }

    #[test]
    fn busy_thread_arms_timer_on_quantum() {
        let mut ks = state_with_threads(2);
        let now = Timestamp::from_ns(1_000);
        let (_, arm) = ks.sched.irq_run_scheduler(
            &mut ks.threads,
            ks.running[0],
            Timestamp::NEVER,
            now,
        );
        assert_eq!(arm, now.offset(MAX_TIME_SLICE_NS));
    }

    #[test]
    fn exists_covers_the_running_thread() {
        let ks = state_with_threads(1);
        // Thread 1 is running and therefore in no list.
        assert!(ks.sched.pk_exists(&ks.threads, 1, 1));
        // Slot 5 was never created.
        assert!(!ks.sched.pk_exists(&ks.threads, 1, 5));
    }

    #[test]
    fn cleanup_reclaims_only_deleted_and_detached() {
        let mut ks = state_with_threads(3);
        ks.threads
            .get_mut(2)
            .unwrap()
            .flags
            .insert(ThreadFlags::DELETED | ThreadFlags::DETACHED);
        // Thread 3 is deleted but joinable: must linger for its joiner.
        ks.threads
            .get_mut(3)
            .unwrap()
            .flags
            .insert(ThreadFlags::DELETED);

        let running = ks.running;
        ks.sched.pk_remove_dead_threads(&mut ks.threads, &running);

        assert!(ks.threads.get(2).is_none());
        assert!(ks.threads.get(3).is_some());
        assert!(!ks.sched.pk_exists(&ks.threads, 1, 2));
    }

    #[test]
    fn set_priority_reinserts_not_mutates() {
        let mut ks = state_with_threads(2);
        let running = ks.running[0];
        ks.sched.pk_set_priority(&mut ks.threads, running, 2, Priority(3));
        assert_eq!(
            ks.threads.get(2).unwrap().sched.priority,
            Priority(3)
        );
        // And it is findable at its new level.
        assert!(ks.sched.pk_exists(&ks.threads, running, 2));
        assert_eq!(select(&mut ks), 2);
    }
}
