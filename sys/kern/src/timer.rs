// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The OS timer: a monotonic nanosecond clock plus one one-shot deadline
//! per core.
//!
//! The hardware side is the board's business (a free-running counter and a
//! compare interrupt, reached through the architecture port); this module
//! owns the tick/nanosecond conversion and the per-core `last armed
//! deadline` bookkeeping, including re-evaluating armed alarms when the
//! clock is moved forward after deep sleep.
//!
//! The deadline interrupt's only job is to make the scheduler's preemption
//! entry run: the handler pends the context-switch exception, which wakes
//! due sleepers and redispatches with the current time in hand.

use core::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::config::CORES;
use crate::time::{TimeConversion, Timestamp};

/// The tick conversion factors, stored as the raw fixed-point words so they
/// can live in statics. Written once during `start_kernel`, before
/// interrupts are enabled; read everywhere.
static TICKS_TO_NS: AtomicU64 = AtomicU64::new(0);
static NS_TO_TICKS: AtomicU64 = AtomicU64::new(0);

/// Last deadline armed on each core, in nanoseconds. `i64::MAX` (NEVER)
/// when the core's alarm is unarmed.
static LAST_ARMED: [AtomicI64; CORES] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const NEVER: AtomicI64 = AtomicI64::new(i64::MAX);
    [NEVER; CORES]
};

/// Captures the board timer's frequency and precomputes the conversion
/// factors. Called once from `start_kernel`.
pub(crate) fn init() {
    let tc = TimeConversion::new(crate::arch::timer_frequency_hz());
    let (to_ns, to_ticks) = tc.raw_factors();
    TICKS_TO_NS.store(to_ns, Ordering::Relaxed);
    NS_TO_TICKS.store(to_ticks, Ordering::Relaxed);
}

fn conversion() -> TimeConversion {
    TimeConversion::from_raw_factors(
        TICKS_TO_NS.load(Ordering::Relaxed),
        NS_TO_TICKS.load(Ordering::Relaxed),
    )
}

/// Returns the OS time: a monotonic clock, in nanoseconds, started when the
/// kernel booted. Callable from any context, including with interrupts
/// disabled -- the counter read underneath tolerates the low/high word race
/// by re-reading.
pub fn now() -> Timestamp {
    Timestamp::from_ns(conversion().ticks_to_ns(crate::arch::timer_ticks()))
}

/// Arms this core's alarm for the absolute time `deadline`, remembering it
/// so a later clock adjustment can re-evaluate. `NEVER` disarms.
pub(crate) fn irq_set_deadline(deadline: Timestamp) {
    let core = crate::arch::current_core();
    LAST_ARMED[core].store(deadline.as_ns(), Ordering::Relaxed);
    if deadline == Timestamp::NEVER {
        return;
    }
    let ticks = conversion().ns_to_ticks(deadline.as_ns());
    crate::arch::irq_timer_set_compare(ticks);
}

/// The deadline interrupt handler, to be called from the board's timer
/// compare ISR. Defers the real work to the context-switch exception; that
/// entry sequence is the one that can safely park the interrupted thread's
/// registers.
pub fn irq_timer_interrupt() {
    crate::arch::pend_context_switch();
}

/// Moves the clock forward after a deep-sleep interval in which the counter
/// was stopped. Never moves it backward. Any alarm now in the past fires
/// immediately, on every core, so each re-evaluates its own deadline.
///
/// Called by the board's deep-sleep exit path, with interrupts still
/// masked.
#[cfg(feature = "deep-sleep")]
pub fn irq_advance_time(new_now: Timestamp) {
    let current = now();
    if new_now <= current {
        return;
    }
    let ticks = conversion().ns_to_ticks(new_now.as_ns());
    crate::arch::irq_timer_set_time(ticks);

    for core in 0..CORES {
        if LAST_ARMED[core].load(Ordering::Relaxed) <= new_now.as_ns() {
            crate::arch::irq_pend_timer_on(core);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The hosted arch runs a fake counter at 1 MHz that tests can set.

    #[test]
    fn now_reflects_the_hardware_counter() {
        init();
        crate::arch::test_set_ticks(1_000); // 1000 us at 1 MHz
        assert_eq!(now(), Timestamp::from_ns(1_000_000));
        crate::arch::test_set_ticks(2_500);
        assert_eq!(now(), Timestamp::from_ns(2_500_000));
    }

    #[test]
    fn arming_remembers_the_deadline() {
        init();
        irq_set_deadline(Timestamp::from_ns(5_000_000));
        assert_eq!(
            LAST_ARMED[0].load(Ordering::Relaxed),
            5_000_000
        );
        irq_set_deadline(Timestamp::NEVER);
        assert_eq!(LAST_ARMED[0].load(Ordering::Relaxed), i64::MAX);
    }
}
