// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup, the kernel state singleton, and the idle thread.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::config::{CORES, STACK_IDLE, STACK_MIN};
use crate::fail::{die, KernelError};
use crate::list::SleepQueue;
use crate::lock::PauseKernelLock;
use crate::sched;
use crate::thread::{self, OwnedStack, ThreadTable};

/// Everything the kernel mutates under its locks, gathered in one place so
/// a single `&mut` can be threaded through the internals.
pub(crate) struct KernelState {
    pub threads: ThreadTable,
    pub sched: sched::Scheduler,
    pub sleep: SleepQueue,
    /// Index of the thread running on each core. Maintained by the
    /// dispatcher; `running[c]` is never on a ready structure of the
    /// fixed-priority policy and never on any wait structure.
    pub running: [u16; CORES],
    /// Index of each core's idle thread.
    pub idle_threads: [u16; CORES],
    #[cfg(feature = "processes")]
    pub processes: crate::process::ProcessTable,
}

impl KernelState {
    pub const fn new() -> Self {
        Self {
            threads: ThreadTable::new(),
            sched: sched::Scheduler::new(),
            sleep: SleepQueue::new(),
            running: [0; CORES],
            idle_threads: [0; CORES],
            #[cfg(feature = "processes")]
            processes: crate::process::ProcessTable::new(),
        }
    }

    /// Index of the thread running on the calling core.
    pub fn current(&self) -> u16 {
        self.running[crate::arch::current_core()]
    }
}

#[repr(transparent)]
struct KernelStateCell(UnsafeCell<KernelState>);

// Safety: all access goes through `with_kernel_state`, which holds the
// global IRQ lock (masking interrupts on this core, spinlocking out the
// other) for the duration and catches reentry with a flag.
unsafe impl Sync for KernelStateCell {}

static KERNEL_STATE: KernelStateCell =
    KernelStateCell(UnsafeCell::new(KernelState::new()));

/// Tracks when a mutable reference to the kernel state is floating around,
/// to prevent production of a second one. Reentry here means a kernel bug,
/// not contention, so it panics.
static STATE_IN_USE: AtomicBool = AtomicBool::new(false);

/// Runs `body` with exclusive access to the kernel state, under the global
/// IRQ lock. This is the only way to touch [`KernelState`]; every public
/// entry point funnels through here, keeping the masked windows short.
pub(crate) fn with_kernel_state<R>(
    body: impl FnOnce(&mut KernelState) -> R,
) -> R {
    let _irq = crate::lock::GlobalIrqLock::acquire();
    if STATE_IN_USE.swap(true, Ordering::Acquire) {
        panic!(); // recursive use of with_kernel_state
    }
    // Safety: the flag above guarantees no other reference exists, and the
    // global lock keeps other cores (and this core's interrupts) out.
    let r = body(unsafe { &mut *KERNEL_STATE.0.get() });
    STATE_IN_USE.store(false, Ordering::Release);
    r
}

/// The main kernel entry point.
///
/// Board bring-up code calls this after hardware init, with interrupts still
/// disabled. It builds the idle thread(s) and the application's main thread,
/// runs the first dispatch, and drops to thread mode; it does not return.
///
/// # Safety
///
/// Must be called exactly once, from the main (interrupt) stack, in
/// privileged mode, with interrupts disabled.
pub unsafe fn start_kernel(
    main: thread::Entry,
    main_stack_size: usize,
    main_priority: sched::Priority,
) -> ! {
    if crate::arch::interrupts_enabled() {
        die(KernelError::InterruptsEnabledAtBoot);
    }
    crate::timer::init();

    with_kernel_state(|ks| {
        for core in 0..CORES {
            let stack = OwnedStack::allocate(STACK_IDLE)
                .unwrap_or_else(|| die(KernelError::OutOfMemory));
            let idle = thread::create_idle_inner(ks, idle_main, stack)
                .unwrap_or_else(|| die(KernelError::OutOfMemory));
            ks.idle_threads[core] = idle;
            ks.running[core] = idle;
        }

        let stack = OwnedStack::allocate(main_stack_size.max(STACK_MIN))
            .unwrap_or_else(|| die(KernelError::OutOfMemory));
        thread::pk_create_inner(
            ks,
            main,
            stack,
            main_priority,
            core::ptr::null_mut(),
            thread::Options::empty(),
        )
        .unwrap_or_else(|| die(KernelError::OutOfMemory));

        // Run the real dispatch path once so the context-switch machinery
        // points at the main thread and the preemption timer is armed.
        let now = crate::timer::now();
        crate::sched::irq_reschedule(ks, now);
    });

    crate::lock::mark_kernel_started();
    // Safety: our contract is start_first_thread's contract.
    unsafe { crate::arch::start_first_thread() }
}

/// The idle thread: reclaims dead threads, then waits for something to
/// happen, as deeply asleep as the deep-sleep lock allows.
fn idle_main(_: *mut ()) -> *mut () {
    loop {
        {
            let _pk = PauseKernelLock::acquire();
            with_kernel_state(|ks| {
                ks.sched
                    .pk_remove_dead_threads(&mut ks.threads, &ks.running);
            });
        }
        #[cfg(feature = "deep-sleep")]
        {
            if crate::lock::deep_sleep_allowed() {
                crate::arch::deep_sleep();
                continue;
            }
        }
        crate::arch::wait_for_interrupt();
    }
}
