// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Stand-in CPU port for hosted builds.
//!
//! This exists so the kernel's logic -- schedulers, sleep queue, sync
//! primitives, process bookkeeping -- compiles and runs under `cargo test`
//! on a development machine. Nothing here switches contexts or masks
//! interrupts: "pending a context switch" is a note in a static, "the
//! hardware timer" is a counter the tests set, and "reset" is a panic the
//! tests can observe.

use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};

use abi::RegionAttributes;

macro_rules! uassert {
    ($cond:expr) => {
        assert!($cond)
    };
}

/// Hosted stand-in for the saved register file. Carries just enough state
/// for the portable code's accessors to be meaningful.
#[derive(Debug, Default)]
pub struct SavedState {
    psp: u32,
    r11: u32,
}

impl SavedState {
    pub fn stack_pointer(&self) -> u32 {
        self.psp
    }

    pub fn syscall_number(&self) -> u32 {
        self.r11
    }
}

/// Hosted stand-in for precomputed MPU register images.
#[derive(Copy, Clone, Debug)]
pub struct RegionData {
    rbar: u32,
    rasr: u32,
}

impl RegionData {
    pub const DISABLED: Self = Self { rbar: 0, rasr: 0 };
}

pub fn compute_region_data(
    base: u32,
    size: u32,
    _attributes: RegionAttributes,
) -> RegionData {
    uassert!(base & 0x1F == 0);
    uassert!(size.is_power_of_two() && size >= 32);
    RegionData {
        rbar: base,
        rasr: size,
    }
}

pub(crate) fn init_thread_frame(
    thread: &mut crate::thread::Thread,
    _entry: crate::thread::Entry,
    _arg: *mut (),
) {
    // No frame to build; point the "stack pointer" at the top so bounds
    // checks see a plausible value.
    thread.save = SavedState {
        psp: thread.stack.top() as u32,
        r11: 0,
    };
}

#[cfg(feature = "processes")]
pub fn init_userspace_frame(
    save: &mut SavedState,
    _entry: u32,
    user_sp: u32,
    _got_base: u32,
) {
    *save = SavedState {
        psp: user_sp & !7,
        r11: 0,
    };
}

#[cfg(feature = "processes")]
pub fn mpu_apply(_regions: &[crate::process::MpuRegion]) {}

#[cfg(feature = "processes")]
pub fn mpu_disable() {}

static CURRENT_CTXSAVE: AtomicPtr<SavedState> =
    AtomicPtr::new(core::ptr::null_mut());

/// # Safety
///
/// Mirrors the real port's contract; hosted code never dereferences it.
pub unsafe fn set_current_ctxsave(save: *mut SavedState) {
    CURRENT_CTXSAVE.store(save, Ordering::Relaxed);
}

static SWITCH_PENDED: AtomicBool = AtomicBool::new(false);

pub fn pend_context_switch() {
    SWITCH_PENDED.store(true, Ordering::Relaxed);
}

pub fn wait_for_interrupt() {}

#[cfg(feature = "deep-sleep")]
pub fn deep_sleep() {}

pub fn reset() -> ! {
    panic!("SYSTEM RESET");
}

static INTERRUPTS_ENABLED: AtomicBool = AtomicBool::new(false);

pub fn irq_disable_current_core() {
    INTERRUPTS_ENABLED.store(false, Ordering::Relaxed);
}

pub fn irq_enable_current_core() {
    INTERRUPTS_ENABLED.store(true, Ordering::Relaxed);
}

pub fn interrupts_enabled() -> bool {
    INTERRUPTS_ENABLED.load(Ordering::Relaxed)
}

pub fn current_core() -> usize {
    0
}

#[cfg(feature = "smp")]
pub fn spin_lock() {}

#[cfg(feature = "smp")]
pub fn spin_unlock() {}

#[cfg(feature = "smp")]
pub fn park_other_cores() {}

/// The fake hardware counter, runs at [`timer_frequency_hz`]. Tests move
/// it with [`test_set_ticks`].
static TICKS: AtomicU64 = AtomicU64::new(0);

pub fn timer_frequency_hz() -> u32 {
    1_000_000
}

pub fn timer_ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Moves the fake counter. Test-support only, but not `cfg(test)`: doc
/// builds and dependents' tests use it too.
pub fn test_set_ticks(ticks: u64) {
    TICKS.store(ticks, Ordering::Relaxed);
}

pub fn irq_timer_set_compare(_ticks: u64) {}

#[cfg(feature = "deep-sleep")]
pub fn irq_timer_set_time(ticks: u64) {
    TICKS.store(ticks, Ordering::Relaxed);
}

#[cfg(feature = "deep-sleep")]
pub fn irq_pend_timer_on(_core: usize) {
    pend_context_switch();
}

pub fn irq_enable_line(_n: u32) {}

pub fn irq_disable_line(_n: u32) {}

pub fn irq_pend_line(_n: u32) {}

pub fn irq_set_priority_line(_n: u32, _priority: u8) {}

/// # Safety
///
/// Hosted builds never start threads; this is here so `start_kernel`
/// typechecks.
pub unsafe fn start_first_thread() -> ! {
    panic!("start_first_thread on hosted build");
}
