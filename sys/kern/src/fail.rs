// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The unrecoverable-error funnel.
//!
//! Every condition the kernel cannot survive is routed through [`die`],
//! which masks interrupts, parks any peer core, emits a fixed diagnostic
//! string through the board's IRQ-safe log sink, records an epitaph for
//! debuggers, and resets the system.
//!
//! This module defines the following binary interface to debuggers:
//!
//! - `kern::fail::KERNEL_HAS_FAILED` is a `bool`, cleared before the kernel
//!   starts and set on the way into `die`. Any other value means the kernel
//!   either never booted or corrupted memory on the way down.
//! - `kern::fail::KERNEL_EPITAPH` is a fixed-size `u8` array holding the
//!   failure description as NUL-padded UTF-8.

use core::sync::atomic::{AtomicUsize, Ordering};

/// The unrecoverable error taxonomy. Each variant maps to one fixed
/// diagnostic string, so the log path allocates and formats nothing.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum KernelError {
    /// Allocation failed in a context where the failure cannot be returned
    /// to a caller (e.g. idle thread creation at boot).
    OutOfMemory,
    /// A kernel-mode stack overran its watermark.
    StackOverflow,
    /// An invariant the kernel relies on was found violated.
    Unexpected,
    /// The kernel-pause counter was decremented below zero.
    PauseKernelNesting,
    /// The global IRQ lock was released more times than it was acquired.
    GlobalLockNesting,
    /// One of the nestable lock counters hit its ceiling.
    NestingOverflow,
    /// A non-recursive mutex was locked twice by its owner, or a priority
    /// inheritance walk closed a cycle.
    MutexDeadlock,
    /// Interrupts were found enabled before the kernel was started.
    InterruptsEnabledAtBoot,
    /// An interrupt handler slot was claimed twice.
    InterruptRegistration,
}

impl KernelError {
    fn as_str(self) -> &'static str {
        match self {
            KernelError::OutOfMemory => "\r\n***Out of memory\r\n",
            KernelError::StackOverflow => "\r\n***Stack overflow\r\n",
            KernelError::Unexpected => "\r\n***Unexpected error\r\n",
            KernelError::PauseKernelNesting => {
                "\r\n***Pause kernel nesting\r\n"
            }
            KernelError::GlobalLockNesting => "\r\n***Global lock nesting\r\n",
            KernelError::NestingOverflow => "\r\n***Nesting overflow\r\n",
            KernelError::MutexDeadlock => "\r\n***Deadlock\r\n",
            KernelError::InterruptsEnabledAtBoot => {
                "\r\n***Interrupts enabled at boot\r\n"
            }
            KernelError::InterruptRegistration => {
                "\r\n***Interrupt registration error\r\n"
            }
        }
    }
}

/// Flag that gets set on the way into `die`, giving tools a one-stop shop
/// for kernel triage.
#[cfg(any(armv6m, armv7m, armv8m))]
#[used]
static mut KERNEL_HAS_FAILED: bool = false;

#[cfg(any(armv6m, armv7m, armv8m))]
const EPITAPH_LEN: usize = 128;

/// Records up to `EPITAPH_LEN` bytes of failure description, NUL padded.
#[cfg(any(armv6m, armv7m, armv8m))]
#[used]
static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

/// The board's IRQ-safe log sink, stored as a type-erased function pointer.
/// Zero means "no sink registered". Registered once during board bring-up,
/// before interrupts are enabled, hence the relaxed orderings.
static ERROR_LOG_SINK: AtomicUsize = AtomicUsize::new(0);

/// Registers `sink` as the destination for kernel diagnostics. The sink must
/// be callable with interrupts disabled; a blocking UART write routine is
/// the usual choice.
pub fn set_error_log(sink: fn(&str)) {
    ERROR_LOG_SINK.store(sink as usize, Ordering::Relaxed);
}

/// Writes `msg` to the board's log sink, if one is registered. Safe to call
/// with interrupts disabled or from an interrupt handler; that is the whole
/// point of the sink's contract.
pub fn irq_error_log(msg: &str) {
    let raw = ERROR_LOG_SINK.load(Ordering::Relaxed);
    if raw != 0 {
        // Safety: the only value ever stored (other than the initial zero)
        // is a `fn(&str)` provided to set_error_log, and function pointers
        // don't dangle.
        let sink: fn(&str) = unsafe { core::mem::transmute(raw) };
        sink(msg);
    }
}

#[cfg(any(armv6m, armv7m, armv8m))]
fn record_epitaph(msg: &str) {
    // We'd love to use an AtomicBool here but this must also work in the
    // weird post-fault states where we trust very little.
    //
    // Safety: this is the only site that writes these statics, and it runs
    // with interrupts masked; a recursive failure is caught by the flag
    // check below.
    let already_failed = unsafe {
        core::ptr::replace(core::ptr::addr_of_mut!(KERNEL_HAS_FAILED), true)
    };
    if already_failed {
        // die() within die() -- don't touch the original epitaph, and don't
        // recurse. Spin until the watchdog or the reset below (in the first
        // invocation) takes effect.
        loop {
            core::sync::atomic::fence(Ordering::SeqCst);
        }
    }
    let buf = unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH) };
    let n = msg.len().min(EPITAPH_LEN);
    buf[..n].copy_from_slice(&msg.as_bytes()[..n]);
}

/// Kills the system in response to `err`. Does not return.
pub fn die(err: KernelError) -> ! {
    // Hosted builds exist to run tests, and tests want a panic they can
    // observe (repeatedly, across test cases) rather than a one-shot
    // epitaph and a fake reset.
    #[cfg(not(any(armv6m, armv7m, armv8m)))]
    panic!("kernel died: {}", err.as_str().trim());

    #[cfg(any(armv6m, armv7m, armv8m))]
    {
        // Mask interrupts on this core first; nothing below should be
        // preemptible.
        crate::arch::irq_disable_current_core();

        // On multicore, try to make the other core hang up. Deliberately do
        // NOT take the global lock: it may already be held, by us or by the
        // peer, and this is an emergency. The only real risk is interleaved
        // garbage on the serial log.
        #[cfg(feature = "smp")]
        crate::arch::park_other_cores();

        record_epitaph(err.as_str());
        irq_error_log(err.as_str());
        crate::arch::reset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_error_has_a_distinct_string() {
        let all = [
            KernelError::OutOfMemory,
            KernelError::StackOverflow,
            KernelError::Unexpected,
            KernelError::PauseKernelNesting,
            KernelError::GlobalLockNesting,
            KernelError::NestingOverflow,
            KernelError::MutexDeadlock,
            KernelError::InterruptsEnabledAtBoot,
            KernelError::InterruptRegistration,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a.as_str(), b.as_str());
            }
        }
    }
}
