// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel's three lock flavors.
//!
//! - The **global IRQ lock** masks interrupts on the current core (and, on
//!   dual-core builds, takes the hardware spinlock). It is nestable up to a
//!   depth ceiling, and is the license to call `irq_`-prefixed functions.
//! - The **kernel-pause lock** is an atomic counter. While it is nonzero the
//!   dispatcher refuses to switch contexts, recording the missed preemption
//!   instead; interrupts keep running, so holding it does not add interrupt
//!   latency. It is the license to call `pk_`-prefixed functions.
//! - The **deep-sleep lock** is a counter the idle thread consults before
//!   stopping peripheral clocks.
//!
//! Each flavor is exposed as a scoped guard that releases on drop, plus a
//! matching "unlock inside a locked scope" guard.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use crate::fail::{die, KernelError};

/// Nesting depth of the global IRQ lock. Only ever accessed with interrupts
/// masked on the owning core (and, on SMP, while holding the spinlock), so
/// relaxed operations are fine; the atomic type is for interior mutability,
/// not for ordering.
static IRQ_NESTING: AtomicU8 = AtomicU8::new(0);

/// Which core currently holds the global lock; 0xFF when nobody does.
#[cfg(feature = "smp")]
static HOLDING_CORE: AtomicU8 = AtomicU8::new(0xFF);

/// The kernel-pause counter. Nonzero means the dispatcher must not switch.
static PAUSE_COUNT: AtomicU32 = AtomicU32::new(0);

/// Set when the dispatcher was invoked while the kernel was paused; consumed
/// by `restart_kernel` to yield as soon as the pause ends.
static PENDING_WAKEUP: AtomicBool = AtomicBool::new(false);

#[cfg(feature = "deep-sleep")]
static DEEP_SLEEP_COUNT: AtomicU32 = AtomicU32::new(0);

/// Set at the end of `startup::start_kernel`. Before that point the global
/// lock must be releasable without enabling interrupts, because boot code
/// runs with interrupts off the whole time.
static KERNEL_STARTED: AtomicBool = AtomicBool::new(false);

pub(crate) fn mark_kernel_started() {
    KERNEL_STARTED.store(true, Ordering::Release);
}

pub fn kernel_started() -> bool {
    KERNEL_STARTED.load(Ordering::Acquire)
}

/// Acquires the global IRQ lock. Nestable; see [`GlobalIrqLock`] for the
/// scoped version, which is what nearly all code should use.
pub fn global_irq_lock() {
    #[cfg(feature = "smp")]
    {
        if HOLDING_CORE.load(Ordering::Relaxed)
            == crate::arch::current_core() as u8
        {
            // Nested acquisition on the core that already holds the lock.
            let n = IRQ_NESTING.load(Ordering::Relaxed);
            if n == 0xFF {
                die(KernelError::NestingOverflow);
            }
            IRQ_NESTING.store(n + 1, Ordering::Relaxed);
            return;
        }
        crate::arch::irq_disable_current_core();
        crate::arch::spin_lock();
        HOLDING_CORE
            .store(crate::arch::current_core() as u8, Ordering::Relaxed);
        if IRQ_NESTING.load(Ordering::Relaxed) != 0 {
            die(KernelError::GlobalLockNesting);
        }
        IRQ_NESTING.store(1, Ordering::Relaxed);
    }
    #[cfg(not(feature = "smp"))]
    {
        crate::arch::irq_disable_current_core();
        let n = IRQ_NESTING.load(Ordering::Relaxed);
        if n == 0xFF {
            die(KernelError::NestingOverflow);
        }
        IRQ_NESTING.store(n + 1, Ordering::Relaxed);
    }
}

/// Releases the global IRQ lock.
pub fn global_irq_unlock() {
    let n = IRQ_NESTING.load(Ordering::Relaxed);
    if n == 0 {
        // Unlocked one time more than locked.
        die(KernelError::GlobalLockNesting);
    }
    IRQ_NESTING.store(n - 1, Ordering::Relaxed);
    if n == 1 {
        #[cfg(feature = "smp")]
        {
            HOLDING_CORE.store(0xFF, Ordering::Relaxed);
            crate::arch::spin_unlock();
        }
        // Before the kernel is started the whole point of this path is to be
        // callable with interrupts that have never been enabled; releasing
        // the lock must not enable them early.
        if kernel_started() {
            crate::arch::irq_enable_current_core();
        }
    }
}

/// Pauses the kernel: no context switch will occur until the matching
/// [`restart_kernel`]. Cumulative.
pub fn pause_kernel() {
    let old = PAUSE_COUNT.fetch_add(1, Ordering::Acquire);
    if old >= 0xFF {
        die(KernelError::NestingOverflow);
    }
}

/// Undoes one [`pause_kernel`]. If a preemption arrived while the kernel was
/// paused, yields immediately -- this works the same way as hardware
/// interrupts that stay pending while masked, and is what keeps context
/// switches to higher-priority threads timely.
pub fn restart_kernel() {
    let old = PAUSE_COUNT.fetch_sub(1, Ordering::Release);
    if old == 0 {
        die(KernelError::PauseKernelNesting);
    }
    // Tolerate being called with interrupts disabled: in that case the
    // wakeup stays pending until interrupts come back.
    if old == 1
        && IRQ_NESTING.load(Ordering::Relaxed) == 0
        && PENDING_WAKEUP.swap(false, Ordering::Relaxed)
    {
        crate::thread::yield_now();
    }
}

/// True while the kernel-pause counter is nonzero. Only meaningful from the
/// dispatcher, which runs with the global lock held.
pub(crate) fn irq_kernel_paused() -> bool {
    PAUSE_COUNT.load(Ordering::Relaxed) != 0
}

/// Records that the dispatcher declined to run because the kernel was
/// paused.
pub(crate) fn irq_set_pending_wakeup() {
    PENDING_WAKEUP.store(true, Ordering::Relaxed);
}

/// Prevents the idle thread from entering deep sleep until the matching
/// unlock. Nestable across drivers.
pub fn deep_sleep_lock() {
    #[cfg(feature = "deep-sleep")]
    DEEP_SLEEP_COUNT.fetch_add(1, Ordering::Relaxed);
}

/// See [`deep_sleep_lock`].
pub fn deep_sleep_unlock() {
    #[cfg(feature = "deep-sleep")]
    DEEP_SLEEP_COUNT.fetch_sub(1, Ordering::Relaxed);
}

/// True if nothing currently objects to stopping peripheral clocks.
#[cfg(feature = "deep-sleep")]
pub(crate) fn deep_sleep_allowed() -> bool {
    DEEP_SLEEP_COUNT.load(Ordering::Relaxed) == 0
}

/// Scoped holder of the global IRQ lock.
///
/// Nestable: acquiring a `GlobalIrqLock` while one is already held simply
/// bumps the depth. Do not mix with [`FastGlobalIrqLock`] in the same call
/// stack; the fast variant doesn't maintain the depth counter.
pub struct GlobalIrqLock {
    _not_send: PhantomData<*mut ()>,
}

impl GlobalIrqLock {
    pub fn acquire() -> Self {
        global_irq_lock();
        GlobalIrqLock {
            _not_send: PhantomData,
        }
    }
}

impl Drop for GlobalIrqLock {
    fn drop(&mut self) {
        global_irq_unlock();
    }
}

/// Temporarily releases the global IRQ lock inside a scope holding it.
pub struct GlobalIrqUnlock<'a> {
    _held: &'a GlobalIrqLock,
}

impl<'a> GlobalIrqUnlock<'a> {
    pub fn new(held: &'a GlobalIrqLock) -> Self {
        global_irq_unlock();
        GlobalIrqUnlock { _held: held }
    }
}

impl Drop for GlobalIrqUnlock<'_> {
    fn drop(&mut self) {
        global_irq_lock();
    }
}

/// Non-nesting fast path of the global IRQ lock: skips the depth counter
/// entirely. Cannot be used before the kernel is started, and cannot be
/// nested -- this is the optimization the lock discipline allows for leaf
/// critical sections that are known not to be reentered.
pub struct FastGlobalIrqLock {
    _not_send: PhantomData<*mut ()>,
}

impl FastGlobalIrqLock {
    pub fn acquire() -> Self {
        crate::arch::irq_disable_current_core();
        #[cfg(feature = "smp")]
        crate::arch::spin_lock();
        FastGlobalIrqLock {
            _not_send: PhantomData,
        }
    }
}

impl Drop for FastGlobalIrqLock {
    fn drop(&mut self) {
        #[cfg(feature = "smp")]
        crate::arch::spin_unlock();
        crate::arch::irq_enable_current_core();
    }
}

/// Scoped kernel-pause holder.
pub struct PauseKernelLock {
    _not_send: PhantomData<*mut ()>,
}

impl PauseKernelLock {
    pub fn acquire() -> Self {
        pause_kernel();
        PauseKernelLock {
            _not_send: PhantomData,
        }
    }
}

impl Drop for PauseKernelLock {
    fn drop(&mut self) {
        restart_kernel();
    }
}

/// Temporarily restarts the kernel inside a scope that paused it.
pub struct PauseKernelUnlock<'a> {
    _held: &'a PauseKernelLock,
}

impl<'a> PauseKernelUnlock<'a> {
    pub fn new(held: &'a PauseKernelLock) -> Self {
        restart_kernel();
        PauseKernelUnlock { _held: held }
    }
}

impl Drop for PauseKernelUnlock<'_> {
    fn drop(&mut self) {
        pause_kernel();
    }
}

/// Scoped deep-sleep inhibitor.
pub struct DeepSleepLock {
    _not_send: PhantomData<*mut ()>,
}

impl DeepSleepLock {
    pub fn acquire() -> Self {
        deep_sleep_lock();
        DeepSleepLock {
            _not_send: PhantomData,
        }
    }
}

impl Drop for DeepSleepLock {
    fn drop(&mut self) {
        deep_sleep_unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The lock counters are process-wide statics, and the test harness runs
    // tests on parallel threads; serialize these so their bookkeeping
    // doesn't interleave.
    static TEST_SERIAL: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn global_lock_nests() {
        let _serial = TEST_SERIAL.lock().unwrap();
        let a = GlobalIrqLock::acquire();
        let before = IRQ_NESTING.load(Ordering::Relaxed);
        {
            let _b = GlobalIrqLock::acquire();
            assert_eq!(IRQ_NESTING.load(Ordering::Relaxed), before + 1);
        }
        assert_eq!(IRQ_NESTING.load(Ordering::Relaxed), before);
        drop(a);
    }

    #[test]
    fn scoped_unlock_restores_depth() {
        let _serial = TEST_SERIAL.lock().unwrap();
        let a = GlobalIrqLock::acquire();
        let before = IRQ_NESTING.load(Ordering::Relaxed);
        {
            let _u = GlobalIrqUnlock::new(&a);
            assert_eq!(IRQ_NESTING.load(Ordering::Relaxed), before - 1);
        }
        assert_eq!(IRQ_NESTING.load(Ordering::Relaxed), before);
        drop(a);
    }

    #[test]
    fn pause_is_cumulative() {
        let _serial = TEST_SERIAL.lock().unwrap();
        let a = PauseKernelLock::acquire();
        let b = PauseKernelLock::acquire();
        assert!(irq_kernel_paused());
        drop(b);
        assert!(irq_kernel_paused());
        drop(a);
        assert!(!irq_kernel_paused());
    }

    #[test]
    fn pending_wakeup_consumed_on_restart() {
        let _serial = TEST_SERIAL.lock().unwrap();
        let a = PauseKernelLock::acquire();
        irq_set_pending_wakeup();
        drop(a); // restart_kernel consumes the flag (yield is a no-op here)
        assert!(!PENDING_WAKEUP.load(Ordering::Relaxed));
    }
}
