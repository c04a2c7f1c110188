// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Control-theoretic scheduling.
//!
//! Threads take turns in a round, like round-robin, but the length of each
//! turn (the *burst*) is not a fixed quantum: a first-order feedback
//! corrector nudges every thread's burst toward a per-thread target derived
//! from its priority. A thread that keeps blocking early (interactive work)
//! sees its burst shrink toward what it actually uses; a thread that always
//! exhausts its burst (batch work) grows toward its target. The result is a
//! CPU share that tracks priority without starving anyone, at the cost of
//! less crisp preemption than the fixed-priority policy.
//!
//! The measured quantity is the time between a thread's dispatch and the
//! next dispatch on the same core; the corrector halves the error each
//! round, and bursts are clamped to a configured range so neither runaway
//! integration nor degenerate thrashing is possible.

use crate::config::{
    CONTROL_BURST_MAX_NS, CONTROL_BURST_MIN_NS, CONTROL_BURST_SETPOINT_NS,
    PRIORITY_MAX,
};
use crate::fail::{die, KernelError};
use crate::list::ThreadList;
use crate::thread::ThreadTable;
use crate::time::Timestamp;

/// Priority of a thread under the control policy. Used for the burst
/// target and for the ordering needs of the synchronization primitives;
/// dispatch order within a round is FIFO regardless of priority.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct Priority(pub i8);

impl Priority {
    pub(crate) const IDLE: Self = Self(-1);

    pub(crate) fn idle() -> Self {
        Self::IDLE
    }

    /// Priority given to the kernel half of process threads.
    #[cfg(feature = "processes")]
    pub(crate) fn process_default() -> Self {
        Self(0)
    }

    pub fn valid_for_create(self) -> bool {
        self.0 >= 0 && self.0 < PRIORITY_MAX
    }

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
    pub(crate) next: Option<u16>,
    /// Current burst allotment, nanoseconds.
    burst_ns: i64,
    /// When this thread was last dispatched; sentinel NEVER when it has
    /// not run since enrollment.
    dispatched_at: Timestamp,
}

impl SchedData {
    pub(crate) fn new(priority: Priority) -> Self {
        Self {
            priority,
            next: None,
            burst_ns: CONTROL_BURST_SETPOINT_NS,
            dispatched_at: Timestamp::NEVER,
        }
    }

    pub(crate) fn priority(&self) -> Priority {
        self.priority
    }

    /// Burst target for this thread's priority: the setpoint scaled by
    /// priority level, so a level-2 thread aims at three times the share of
    /// a level-0 thread.
    fn target_ns(&self) -> i64 {
        CONTROL_BURST_SETPOINT_NS * (self.priority.0 as i64 + 1)
    }
}

pub struct Scheduler {
    /// The round: every enrolled non-running thread, FIFO.
    round: ThreadList,
    idle: Option<u16>,
    next_preemption: Timestamp,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            round: ThreadList::EMPTY,
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
            t.sched.burst_ns = t.sched.target_ns().clamp(
                CONTROL_BURST_MIN_NS,
                CONTROL_BURST_MAX_NS,
            );
        }
        self.round.push_back(threads, idx);
    }

    pub fn pk_exists(
        &self,
        threads: &ThreadTable,
        running: u16,
        idx: u16,
    ) -> bool {
        if idx == running {
            return true;
        }
        self.round.contains(threads, idx)
            && threads
                .get(idx)
                .map(|t| !t.flags.is_reclaimable())
                .unwrap_or(false)
    }

    pub fn pk_remove_dead_threads(
        &mut self,
        threads: &mut ThreadTable,
        running: &[u16; crate::config::CORES],
    ) {
        let mut cur = self.round.head;
        while let Some(idx) = cur {
            cur = threads.sched_next(idx);
            let dead = !running.contains(&idx)
                && threads
                    .get(idx)
                    .map(|t| t.flags.is_reclaimable())
                    .unwrap_or(false);
            if dead {
                self.round.remove(threads, idx);
                threads.free(idx);
            }
        }
    }

    /// Re-keys a thread. The round is FIFO, so position doesn't change;
    /// the new priority takes effect through the burst target.
    pub fn pk_set_priority(
        &mut self,
        threads: &mut ThreadTable,
        running: u16,
        idx: u16,
        new: Priority,
    ) {
        if idx != running && !self.round.contains(threads, idx) {
            die(KernelError::Unexpected);
        }
        if let Some(t) = threads.get_mut(idx) {
            t.sched.priority = new;
        }
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

    pub fn irq_run_scheduler(
        &mut self,
        threads: &mut ThreadTable,
        prev: u16,
        sleep_head: Timestamp,
        now: Timestamp,
    ) -> (u16, Timestamp) {
        // Close out the previous thread's burst measurement and apply the
        // feedback correction.
        if let Some(t) = threads.get_mut(prev) {
            if t.sched.priority != Priority::IDLE
                && t.sched.dispatched_at != Timestamp::NEVER
            {
                let measured =
                    now.as_ns() - t.sched.dispatched_at.as_ns();
                let error = t.sched.target_ns() - measured;
                t.sched.burst_ns = (t.sched.burst_ns + error / 2)
                    .clamp(CONTROL_BURST_MIN_NS, CONTROL_BURST_MAX_NS);
                t.sched.dispatched_at = Timestamp::NEVER;
            }
        }

        // Outgoing thread rejoins the back of the round.
        let prev_is_idle = threads
            .get(prev)
            .map(|t| t.sched.priority == Priority::IDLE)
            .unwrap_or(true);
        if !prev_is_idle {
            self.round.push_back(threads, prev);
        }

        let mut cur = self.round.head;
        while let Some(idx) = cur {
            cur = threads.sched_next(idx);
            let ready = threads
                .get(idx)
                .map(|t| t.flags.is_ready())
                .unwrap_or(false);
            if ready {
                self.round.remove(threads, idx);
                let burst = threads
                    .get_mut(idx)
                    .map(|t| {
                        t.sched.dispatched_at = now;
                        t.sched.burst_ns
                    })
                    .unwrap_or(CONTROL_BURST_MIN_NS);
                let arm = sleep_head.min(now.offset(burst));
                self.next_preemption = arm;
                return (idx, arm);
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

    fn select(
        ks: &mut crate::startup::KernelState,
        now: i64,
    ) -> (u16, Timestamp) {
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
    fn round_is_fifo() {
        let mut ks = state_with_threads(3);
        assert_eq!(select(&mut ks, 0).0, 2);
        assert_eq!(select(&mut ks, 0).0, 3);
        assert_eq!(select(&mut ks, 0).0, 1);
    }

    #[test]
    fn burst_shrinks_for_early_blockers() {
        let mut ks = state_with_threads(2);
        let before = ks.threads.get(1).unwrap().sched.burst_ns;

        // Thread 1 is dispatched at t=0 and blocks almost immediately; the
        // next dispatch happens at t=10us.
        ks.threads.get_mut(1).unwrap().sched.dispatched_at =
            Timestamp::ZERO;
        select(&mut ks, 10_000);

        let after = ks.threads.get(1).unwrap().sched.burst_ns;
        assert!(
            after > before,
            "under-use drives the burst toward the target: {after} <= {before}"
        );
        // (With a fresh thread the measured burst is far below target, so
        // the correction is positive; a hog past its target shrinks.)
        let hog = ks.threads.get_mut(2).unwrap();
        hog.sched.dispatched_at = Timestamp::ZERO;
        hog.sched.burst_ns = CONTROL_BURST_MAX_NS;
        ks.running[0] = 2;
        select(&mut ks, 50_000_000);
        let hog_after = ks.threads.get(2).unwrap().sched.burst_ns;
        assert!(hog_after < CONTROL_BURST_MAX_NS);
    }

    #[test]
    fn burst_is_clamped() {
        let mut ks = state_with_threads(1);
        ks.threads.get_mut(1).unwrap().sched.dispatched_at =
            Timestamp::ZERO;
        // Grossly overrun: correction would go far negative.
        select(&mut ks, 10_000_000_000);
        let b = ks.threads.get(1).unwrap().sched.burst_ns;
        assert!(b >= CONTROL_BURST_MIN_NS && b <= CONTROL_BURST_MAX_NS);
    }

    #[test]
    fn higher_priority_aims_at_larger_bursts() {
        let mut ks = state_with_threads(2);
        let running = ks.running[0];
        ks.sched
            .pk_set_priority(&mut ks.threads, running, 2, Priority(3));
        let lo = ks.threads.get(1).unwrap().sched.target_ns();
        let hi = ks.threads.get(2).unwrap().sched.target_ns();
        assert!(hi > lo);
    }

    #[test]
    fn idle_when_round_is_blocked() {
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
}
