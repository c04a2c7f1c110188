// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Build-time tunables.
//!
//! Everything here takes effect at compile time. Applications that need
//! different numbers edit this file (or patch the crate); there is no
//! runtime configuration surface.

/// Number of slots in the thread table, including the idle thread. A handle
/// to a reclaimed slot is detected through its generation number, so this
/// bounds *live* threads, not threads-ever-created.
pub const MAX_THREADS: usize = 16;

/// Number of priority levels for the fixed-priority scheduler. Valid thread
/// priorities are `0..PRIORITY_MAX`, higher numbers more important; the idle
/// thread sits below all of them at -1.
pub const PRIORITY_MAX: i8 = 4;

/// Maximum time a thread runs before the scheduler re-evaluates, in
/// nanoseconds. Applies to the fixed-priority policy and to EDF's
/// non-realtime threads.
pub const MAX_TIME_SLICE_NS: i64 = 1_000_000;

/// Minimum allowed thread stack size, in bytes, not counting the watermark.
pub const STACK_MIN: usize = 256;

/// Stack size of the idle thread, in bytes.
pub const STACK_IDLE: usize = 256;

/// Number of watermark words placed at the base of every stack.
pub const WATERMARK_LEN: usize = 16;

/// Value the watermark words are filled with. Any other value found there
/// during a context switch means the stack has overflowed.
pub const WATERMARK_FILL: u32 = 0xAAAA_AAAA;

/// Value the rest of a fresh stack is filled with, to make stack usage
/// visible in a debugger.
pub const STACK_FILL: u32 = 0xBBBB_BBBB;

/// Number of cores the kernel schedules.
#[cfg(feature = "smp")]
pub const CORES: usize = 2;
#[cfg(not(feature = "smp"))]
pub const CORES: usize = 1;

/// Maximum number of concurrently loaded processes.
#[cfg(feature = "processes")]
pub const MAX_PROCESSES: usize = 4;

/// Upper bound on a process image accepted from the loader, in bytes.
#[cfg(feature = "processes")]
pub const MAX_PROCESS_IMAGE_SIZE: usize = 64 * 1024;

/// Kernel-mode stack size for threads that belong to a process, in bytes.
/// This is the stack used while servicing that thread's syscalls.
#[cfg(feature = "processes")]
pub const SYSTEM_MODE_PROCESS_STACK_SIZE: usize = 2048;

/// Control scheduler: nominal burst assigned to a fresh thread, in
/// nanoseconds.
#[cfg(feature = "scheduler-control")]
pub const CONTROL_BURST_SETPOINT_NS: i64 = 1_000_000;

/// Control scheduler: bounds on the per-thread burst after feedback
/// correction.
#[cfg(feature = "scheduler-control")]
pub const CONTROL_BURST_MIN_NS: i64 = 100_000;
#[cfg(feature = "scheduler-control")]
pub const CONTROL_BURST_MAX_NS: i64 = 4_000_000;
