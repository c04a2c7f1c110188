// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-thread CPU time accounting (`cpu-time-counter` feature).
//!
//! Every dispatch timestamps the incoming thread; the next dispatch on the
//! same core closes out the interval and adds it to the outgoing thread's
//! total. No sampling, no ticks: the context switch itself is the
//! measurement boundary.

use crate::startup::{with_kernel_state, KernelState};
use crate::thread::ThreadId;
use crate::time::Timestamp;

/// Per-thread accounting state, embedded in the thread control block.
#[derive(Copy, Clone, Debug)]
pub struct CpuTime {
    total_ns: i64,
    /// When the thread was last dispatched; NEVER while switched out.
    activated_at: Timestamp,
}

impl Default for CpuTime {
    fn default() -> Self {
        Self {
            total_ns: 0,
            activated_at: Timestamp::NEVER,
        }
    }
}

/// Charges the outgoing thread for its run and timestamps the incoming one.
/// Called from the dispatcher with the global lock held.
pub(crate) fn irq_account_switch(
    ks: &mut KernelState,
    prev: u16,
    next: u16,
    now: Timestamp,
) {
    if let Some(t) = ks.threads.get_mut(prev) {
        if t.cpu_time.activated_at != Timestamp::NEVER {
            t.cpu_time.total_ns += now.as_ns() - t.cpu_time.activated_at.as_ns();
            t.cpu_time.activated_at = Timestamp::NEVER;
        }
    }
    if let Some(t) = ks.threads.get_mut(next) {
        t.cpu_time.activated_at = now;
    }
}

/// Total CPU time consumed by `id`, in nanoseconds. Time since the thread's
/// current dispatch (if it is running right now) is not included.
pub fn cpu_time_ns(id: ThreadId) -> Option<i64> {
    with_kernel_state(|ks| {
        let idx = ks.threads.index_of(id)?;
        ks.threads.get(idx).map(|t| t.cpu_time.total_ns)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::test_support::state_with_threads;

    #[test]
    fn switch_intervals_accumulate() {
        let mut ks = state_with_threads(2);
        // 1 runs from t=100 to t=400, then 2 runs until t=900.
        irq_account_switch(&mut ks, 0, 1, Timestamp::from_ns(100));
        irq_account_switch(&mut ks, 1, 2, Timestamp::from_ns(400));
        irq_account_switch(&mut ks, 2, 1, Timestamp::from_ns(900));
        assert_eq!(ks.threads.get(1).unwrap().cpu_time.total_ns, 300);
        assert_eq!(ks.threads.get(2).unwrap().cpu_time.total_ns, 500);
        // Thread 1 is running again; its new interval is still open.
        irq_account_switch(&mut ks, 1, 0, Timestamp::from_ns(1_000));
        assert_eq!(ks.threads.get(1).unwrap().cpu_time.total_ns, 400);
    }
}
