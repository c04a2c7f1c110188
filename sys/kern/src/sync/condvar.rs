// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Condition variables.
//!
//! A condvar pairs with a [`super::Mutex`]: `wait` atomically drops the
//! mutex (all recursion levels at once), parks the caller on a FIFO, and
//! re-acquires the mutex to the same depth before returning. Signal wakes
//! the longest waiter; broadcast wakes everyone and yields afterward if any
//! of them outranks the caller.
//!
//! Waits may return spuriously (and a termination request forces one early
//! return); callers re-check their predicate in a loop, which is the only
//! correct way to use a condvar anyway. In every such case the mutex is
//! re-acquired, at the original depth, before `wait` returns.

use core::cell::UnsafeCell;

use alloc::collections::VecDeque;

use crate::lock::{GlobalIrqLock, PauseKernelLock};
use crate::startup::with_kernel_state;
use crate::sync::Mutex;
use crate::thread::{self, Wakeup};
use crate::time::{TimedWaitResult, Timestamp};

/// A condition variable with a FIFO wait queue.
pub struct CondVar {
    queue: UnsafeCell<VecDeque<u16>>,
}

// Safety: the queue is only touched inside `with_kernel_state`, which
// serializes all kernel state access.
unsafe impl Send for CondVar {}
unsafe impl Sync for CondVar {}

impl CondVar {
    pub const fn new() -> Self {
        Self {
            queue: UnsafeCell::new(VecDeque::new()),
        }
    }

    /// Blocks until signaled (or woken spuriously), releasing `mutex` for
    /// the duration. The caller must hold `mutex`.
    pub fn wait(&self, mutex: &Mutex) {
        let pk = PauseKernelLock::acquire();
        let me = with_kernel_state(|ks| ks.current());
        let depth = mutex.pk_unlock_all_depth_levels(&pk);
        with_kernel_state(|_ks| {
            // Safety: kernel state lock held, see type-level comment.
            unsafe { (*self.queue.get()).push_back(me) };
        });
        thread::pk_restart_kernel_and_wait(&pk);
        with_kernel_state(|_ks| {
            // Still enqueued on a spurious wakeup or termination; a real
            // signal already removed us.
            unsafe { (*self.queue.get()).retain(|&t| t != me) };
        });
        mutex.pk_lock_to_depth(&pk, depth);
    }

    /// Like [`CondVar::wait`] with a deadline. Returns `Timeout` if the
    /// clock, rather than a signal, ended the wait; the mutex is held again
    /// either way.
    pub fn timed_wait(
        &self,
        mutex: &Mutex,
        deadline: Timestamp,
    ) -> TimedWaitResult {
        let pk = PauseKernelLock::acquire();
        let me = with_kernel_state(|ks| ks.current());
        let depth = mutex.pk_unlock_all_depth_levels(&pk);
        with_kernel_state(|_ks| {
            // Safety: kernel state lock held.
            unsafe { (*self.queue.get()).push_back(me) };
        });
        let result = thread::pk_restart_kernel_and_timed_wait(&pk, deadline);
        with_kernel_state(|_ks| {
            // Safety: kernel state lock held.
            unsafe { (*self.queue.get()).retain(|&t| t != me) };
        });
        mutex.pk_lock_to_depth(&pk, depth);
        result
    }

    /// Wakes the longest-waiting thread, if any. If it outranks the caller
    /// a context switch becomes pending before this returns.
    pub fn signal(&self) {
        let _lock = GlobalIrqLock::acquire();
        let woken = with_kernel_state(|ks| {
            // Safety: kernel state lock held.
            let head = unsafe { (*self.queue.get()).pop_front() };
            match head {
                Some(t) => thread::wakeup_inner(ks, t),
                None => Wakeup::NotWaiting,
            }
        });
        if let Wakeup::Woken {
            outranks_running: true,
        } = woken
        {
            crate::arch::pend_context_switch();
        }
    }

    /// Wakes every waiter. Runs under the pause lock rather than with
    /// interrupts masked, since the sweep is unbounded in the number of
    /// waiters; yields at the end if anyone woken outranks the caller.
    pub fn broadcast(&self) {
        let mut hppw = false;
        {
            let _pk = PauseKernelLock::acquire();
            with_kernel_state(|ks| {
                loop {
                    // Safety: kernel state lock held.
                    let head = unsafe { (*self.queue.get()).pop_front() };
                    let Some(t) = head else { break };
                    if let Wakeup::Woken {
                        outranks_running: true,
                    } = thread::pk_wakeup(ks, t)
                    {
                        hppw = true;
                    }
                }
            });
        }
        // pk_wakeup doesn't make the scheduler interrupt pending; do it
        // here once, after the kernel is unpaused.
        if hppw {
            thread::yield_now();
        }
    }
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::test_support::state_with_threads;
    use crate::thread::ThreadFlags;

    // The blocking halves of wait/timed_wait need a live scheduler; these
    // tests cover the queue discipline and the wake paths against a local
    // state, the same way the mutex tests do.

    #[test]
    fn fifo_order_of_wakeups() {
        let cv = CondVar::new();
        unsafe {
            (*cv.queue.get()).push_back(1);
            (*cv.queue.get()).push_back(2);
            (*cv.queue.get()).push_back(3);
        }
        for expect in [1u16, 2, 3] {
            let head = unsafe { (*cv.queue.get()).pop_front() };
            assert_eq!(head, Some(expect));
        }
    }

    #[test]
    fn broadcast_drains_and_wakes() {
        let mut ks = state_with_threads(3);
        let cv = CondVar::new();
        for t in [2u16, 3] {
            ks.threads
                .get_mut(t)
                .unwrap()
                .flags
                .insert(ThreadFlags::WAIT);
            unsafe { (*cv.queue.get()).push_back(t) };
        }
        // Drain the queue the way broadcast does.
        loop {
            let head = unsafe { (*cv.queue.get()).pop_front() };
            let Some(t) = head else { break };
            thread::pk_wakeup(&mut ks, t);
        }
        assert!(unsafe { (*cv.queue.get()).is_empty() });
        assert!(ks.threads.get(2).unwrap().flags.is_ready());
        assert!(ks.threads.get(3).unwrap().flags.is_ready());
    }

    #[test]
    fn spurious_wakeup_leaves_queue_consistent() {
        let cv = CondVar::new();
        unsafe {
            (*cv.queue.get()).push_back(1);
            // The waiter returns spuriously and removes itself, as the tail
            // of wait() does.
            (*cv.queue.get()).retain(|&t| t != 1);
            assert!((*cv.queue.get()).is_empty());
        }
    }
}
