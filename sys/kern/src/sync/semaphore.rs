// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Counting semaphores.
//!
//! The one primitive that is legal from interrupt context: an ISR may call
//! [`Semaphore::irq_signal`] (or the `hppw` variant when it wants to manage
//! the deferred yield itself) to release a thread waiting for the event.
//!
//! Waiters queue FIFO. A signal with waiters present hands the count
//! directly to the head -- the counter is not incremented and re-decremented,
//! so the wake order is exactly the wait order. A waiter's queue entry
//! doubles as its wakeup token: `signal` removes the entry *before* waking,
//! and the waiter loops until its entry is gone, which makes spurious
//! wakeups (and termination's forced early return) harmless.

use core::cell::UnsafeCell;

use alloc::collections::VecDeque;

use crate::lock::GlobalIrqLock;
use crate::startup::{with_kernel_state, KernelState};
use crate::thread::{self, Wakeup};
use crate::time::{TimedWaitResult, Timestamp};

pub(crate) struct SemState {
    count: u32,
    fifo: VecDeque<u16>,
}

/// What a signal did, for the IRQ variants' yield bookkeeping.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Signal {
    /// Nobody was waiting; the count went up.
    Counted,
    /// The head waiter got the signal.
    Woke { outranks_running: bool },
}

pub(crate) fn signal_inner(
    ks: &mut KernelState,
    state: &mut SemState,
) -> Signal {
    match state.fifo.pop_front() {
        None => {
            state.count += 1;
            Signal::Counted
        }
        Some(t) => match thread::wakeup_inner(ks, t) {
            Wakeup::Woken { outranks_running } => {
                Signal::Woke { outranks_running }
            }
            // The waiter wasn't parked yet (it is between enqueueing and
            // blocking); removing its queue entry is still the whole
            // handoff, its wait loop will see that and proceed.
            Wakeup::NotWaiting => Signal::Woke {
                outranks_running: false,
            },
        },
    }
}

/// A counting FIFO semaphore, safe to signal from interrupt handlers.
pub struct Semaphore {
    state: UnsafeCell<SemState>,
}

// Safety: the state is only touched under the global IRQ lock (via
// with_kernel_state or with the lock explicitly held).
unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    pub const fn new(initial: u32) -> Self {
        Self {
            state: UnsafeCell::new(SemState {
                count: initial,
                fifo: VecDeque::new(),
            }),
        }
    }

    /// Waits for the semaphore: takes a count if one is available,
    /// otherwise queues up behind earlier waiters.
    pub fn wait(&self) {
        let lock = GlobalIrqLock::acquire();
        let me = with_kernel_state(|ks| {
            // Safety: global lock held via with_kernel_state.
            let s = unsafe { &mut *self.state.get() };
            if s.count > 0 {
                s.count -= 1;
                None
            } else {
                let me = ks.current();
                s.fifo.push_back(me);
                Some(me)
            }
        });
        let Some(me) = me else { return };
        loop {
            let token_gone = with_kernel_state(|_ks| {
                // Safety: as above.
                let s = unsafe { &*self.state.get() };
                !s.fifo.contains(&me)
            });
            if token_gone {
                return;
            }
            thread::irq_unlock_and_wait(&lock);
        }
    }

    /// Waits with a deadline. On `Timeout` the queue entry is withdrawn and
    /// no count is consumed.
    pub fn timed_wait(&self, deadline: Timestamp) -> TimedWaitResult {
        let lock = GlobalIrqLock::acquire();
        let me = with_kernel_state(|ks| {
            // Safety: global lock held via with_kernel_state.
            let s = unsafe { &mut *self.state.get() };
            if s.count > 0 {
                s.count -= 1;
                None
            } else {
                let me = ks.current();
                s.fifo.push_back(me);
                Some(me)
            }
        });
        let Some(me) = me else {
            return TimedWaitResult::NoTimeout;
        };
        loop {
            let token_gone = with_kernel_state(|_ks| {
                // Safety: as above.
                let s = unsafe { &*self.state.get() };
                !s.fifo.contains(&me)
            });
            if token_gone {
                return TimedWaitResult::NoTimeout;
            }
            if thread::irq_unlock_and_timed_wait(&lock, deadline)
                == TimedWaitResult::Timeout
            {
                with_kernel_state(|_ks| {
                    // Safety: as above.
                    let s = unsafe { &mut *self.state.get() };
                    s.fifo.retain(|&t| t != me);
                });
                return TimedWaitResult::Timeout;
            }
        }
    }

    /// Signals the semaphore from thread context.
    pub fn signal(&self) {
        let _lock = GlobalIrqLock::acquire();
        let sig = with_kernel_state(|ks| {
            // Safety: global lock held via with_kernel_state.
            let s = unsafe { &mut *self.state.get() };
            signal_inner(ks, s)
        });
        if sig
            == (Signal::Woke {
                outranks_running: true,
            })
        {
            crate::arch::pend_context_switch();
        }
    }

    /// Signals from interrupt context. If the woken thread outranks the
    /// interrupted one, the context switch becomes pending and happens on
    /// interrupt return.
    pub fn irq_signal(&self) {
        let sig = with_kernel_state(|ks| {
            // Safety: global lock held via with_kernel_state.
            let s = unsafe { &mut *self.state.get() };
            signal_inner(ks, s)
        });
        if sig
            == (Signal::Woke {
                outranks_running: true,
            })
        {
            crate::arch::pend_context_switch();
        }
    }

    /// Signals from interrupt context, accumulating the "woke a
    /// higher-priority thread" fact into `hppw` instead of acting on it.
    /// Handlers that signal several semaphores use this to yield once at
    /// the end.
    pub fn irq_signal_hppw(&self, hppw: &mut bool) {
        let sig = with_kernel_state(|ks| {
            // Safety: global lock held via with_kernel_state.
            let s = unsafe { &mut *self.state.get() };
            signal_inner(ks, s)
        });
        if sig
            == (Signal::Woke {
                outranks_running: true,
            })
        {
            *hppw = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::test_support::state_with_threads;
    use crate::thread::ThreadFlags;

    fn state_of(s: &Semaphore) -> &mut SemState {
        unsafe { &mut *s.state.get() }
    }

    #[test]
    fn signal_with_no_waiters_counts() {
        let mut ks = state_with_threads(1);
        let sem = Semaphore::new(0);
        assert_eq!(
            signal_inner(&mut ks, state_of(&sem)),
            Signal::Counted
        );
        assert_eq!(state_of(&sem).count, 1);
    }

    #[test]
    fn wakeups_in_wait_order() {
        let mut ks = state_with_threads(3);
        let sem = Semaphore::new(0);
        // A, B, C wait in that order.
        for t in [1u16, 2, 3] {
            state_of(&sem).fifo.push_back(t);
            ks.threads
                .get_mut(t)
                .unwrap()
                .flags
                .insert(ThreadFlags::WAIT);
        }
        // Three signals wake A, B, C in order; the count never moves.
        for expect in [1u16, 2, 3] {
            let before = state_of(&sem).count;
            let sig = signal_inner(&mut ks, state_of(&sem));
            assert!(matches!(sig, Signal::Woke { .. }));
            assert_eq!(state_of(&sem).count, before);
            assert!(ks.threads.get(expect).unwrap().flags.is_ready());
            assert!(!state_of(&sem).fifo.contains(&expect));
        }
        assert_eq!(state_of(&sem).count, 0);
    }

    #[test]
    fn token_removal_is_the_handoff() {
        let mut ks = state_with_threads(2);
        let sem = Semaphore::new(0);
        state_of(&sem).fifo.push_back(2);
        // The waiter hasn't parked yet; the signal still consumes its queue
        // entry, which is what its wait loop checks.
        let sig = signal_inner(&mut ks, state_of(&sem));
        assert_eq!(
            sig,
            Signal::Woke {
                outranks_running: false
            }
        );
        assert!(state_of(&sem).fifo.is_empty());
        assert_eq!(state_of(&sem).count, 0);
    }

    #[test]
    fn timeout_withdraws_the_entry() {
        let sem = Semaphore::new(0);
        state_of(&sem).fifo.push_back(2);
        // Model the timeout path: the waiter removes itself.
        state_of(&sem).fifo.retain(|&t| t != 2);
        assert!(state_of(&sem).fifo.is_empty());
    }
}
