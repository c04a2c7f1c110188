// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scheduling policy selection and the dispatcher.
//!
//! Three interchangeable policies exist; exactly one is compiled in, chosen
//! by the `scheduler-*` features. Each policy module defines the same three
//! names -- `Scheduler`, `SchedData`, `Priority` -- re-exported here, so the
//! rest of the kernel is policy-agnostic without paying for runtime
//! dispatch in interrupt handlers.
//!
//! Every policy exposes exactly this operation set:
//!
//! - `pk_add_thread`, `pk_remove_dead_threads`, `pk_set_priority`,
//!   `pk_exists` (kernel-pause lock required);
//! - `irq_set_idle_thread`, `irq_get_next_preemption`,
//!   `irq_run_scheduler`
//!   (global IRQ lock required).
//!
//! The dispatcher below is the preemption entry: the OS timer deadline and
//! every explicit yield funnel into [`irq_dispatch`], which wakes due
//! sleepers, asks the policy for the next thread, points the context-switch
//! machinery at its saved state, and re-arms the preemption timer.

use crate::lock;
use crate::startup::{with_kernel_state, KernelState};
use crate::thread;
use crate::time::Timestamp;

cfg_if::cfg_if! {
    if #[cfg(feature = "scheduler-priority")] {
        pub mod priority;
        pub use priority::{Priority, SchedData, Scheduler};
    } else if #[cfg(feature = "scheduler-edf")] {
        pub mod edf;
        pub use edf::{Priority, SchedData, Scheduler};
    } else if #[cfg(feature = "scheduler-control")] {
        pub mod control;
        pub use control::{Priority, SchedData, Scheduler};
    }
}

/// The preemption entry. Called by the architecture's deferred
/// context-switch handler, after the outgoing thread's registers are parked
/// in its ctxsave.
///
/// If the kernel is paused this records the missed preemption and returns
/// without touching anything; `restart_kernel` replays it.
pub(crate) fn irq_dispatch() {
    with_kernel_state(|ks| {
        if lock::irq_kernel_paused() {
            lock::irq_set_pending_wakeup();
            return;
        }
        let now = crate::timer::now();
        thread::irq_wake_threads(ks, now);
        irq_reschedule(ks, now);
    });
}

/// Selects and installs the next thread on this core. Requires the global
/// IRQ lock (implied by running inside `with_kernel_state`).
pub(crate) fn irq_reschedule(ks: &mut KernelState, now: Timestamp) {
    let core = crate::arch::current_core();
    let prev = ks.running[core];

    // Dispatching away from a thread is the moment its stack abuse becomes
    // our problem; check the watermark before we commit to anything.
    thread::irq_stack_overflow_check(ks, prev);

    let sleep_head = ks.sleep.head_time();
    let (next, arm) =
        ks.sched.irq_run_scheduler(&mut ks.threads, prev, sleep_head, now);
    // The policy knows one idle thread; each core has its own. Substitute
    // ours if the fallback was chosen.
    let next = if ks.idle_threads.contains(&next) {
        ks.idle_threads[core]
    } else {
        next
    };
    ks.running[core] = next;

    #[cfg(feature = "cpu-time-counter")]
    crate::cputime::irq_account_switch(ks, prev, next, now);

    install_context(ks, next);
    crate::timer::irq_set_deadline(arm);
}

/// Points the context-switch machinery at `next`'s correct register file
/// (kernel-mode or user-mode ctxsave) and programs the MPU accordingly.
fn install_context(ks: &mut KernelState, next: u16) {
    let Some(t) = ks.threads.get_mut(next) else {
        crate::fail::die(crate::fail::KernelError::Unexpected);
    };

    #[cfg(feature = "processes")]
    {
        if t.flags.contains(thread::ThreadFlags::USERSPACE) {
            let user = match t.user.as_mut() {
                Some(u) => u,
                None => {
                    crate::fail::die(crate::fail::KernelError::Unexpected)
                }
            };
            let save = &mut user.save as *mut crate::arch::SavedState;
            let proc = user.process;
            // Safety: the pointer targets the thread's boxed user context,
            // which lives until the thread is reclaimed, and reclamation
            // only happens to non-running threads.
            unsafe { crate::arch::set_current_ctxsave(save) };
            crate::process::irq_apply_mpu(ks, proc);
            return;
        }
    }

    let save = &mut t.save as *mut crate::arch::SavedState;
    // Safety: same argument; table slots of the running thread are not
    // reclaimed.
    unsafe { crate::arch::set_current_ctxsave(save) };
    #[cfg(feature = "processes")]
    crate::arch::mpu_disable();
}
