// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Quartz kernel.
//!
//! This is the board-independent core of the operating system: the part that
//! multiplexes the CPU across threads with bounded latency, and (optionally)
//! keeps user processes inside their MPU boxes.
//!
//! Code outside the `arch` module is *intended* to be portable to any 32-bit
//! single-address-space microcontroller, but it is only actively developed
//! and tested on ARMv7-M, so it's entirely possible that some ARM-isms have
//! unintentionally leaked into the portable parts.
//!
//! # Design principles
//!
//! While this isn't a *deeply* principled kernel, there are some basic ideas
//! that appear consistently.
//!
//! 1. Bounded, predictable latency. Interrupts are masked only for short,
//!    constant-ish critical sections; anything longer runs under the cheaper
//!    kernel-pause lock, which defers context switches without raising
//!    interrupt latency.
//! 2. Static configuration. The scheduling policy, the process support, and
//!    the dual-core support are all chosen at compile time; there is no
//!    runtime dispatch on any of them.
//! 3. A strong preference for safe code where reasonable, and for carefully
//!    argued `unsafe` where not.
//! 4. A preference for simple and clear algorithms over fast and clever
//!    algorithms. Thread counts on these parts are small; linear scans of
//!    short lists beat pointer gymnastics.
//!
//! # Lock discipline
//!
//! Kernel internals follow a naming convention inherited from the lock
//! rules (see `lock`): functions prefixed `pk_` may only be called while
//! holding the kernel-pause lock, and functions prefixed `irq_` may only be
//! called with the global IRQ lock held (equivalently, from an interrupt
//! handler). Functions with neither prefix acquire what they need.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

#[macro_use]
mod klog;

#[macro_use]
pub mod arch;

pub mod config;
pub mod fail;
pub mod lock;
pub mod sched;
pub mod startup;
pub mod sync;
pub mod thread;
pub mod time;
pub mod timer;

#[cfg(feature = "cpu-time-counter")]
pub mod cputime;

cfg_if::cfg_if! {
    if #[cfg(feature = "processes")] {
        pub mod process;
        pub mod syscalls;
        pub mod umem;
    }
}

mod list;

// The scheduling policy features are mutually exclusive; catch bad feature
// unification early rather than producing baffling duplicate-item errors.
#[cfg(any(
    all(feature = "scheduler-priority", feature = "scheduler-edf"),
    all(feature = "scheduler-priority", feature = "scheduler-control"),
    all(feature = "scheduler-edf", feature = "scheduler-control"),
))]
compile_error!("select exactly one scheduler-* feature");

#[cfg(not(any(
    feature = "scheduler-priority",
    feature = "scheduler-edf",
    feature = "scheduler-control",
)))]
compile_error!("select a scheduler-* feature");
