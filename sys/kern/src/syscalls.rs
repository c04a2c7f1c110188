// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The supervisor-call path between a process and the kernel.
//!
//! Each process thread runs [`process_main_loop`] in kernel mode. Every
//! iteration lends the CPU to the unprivileged half via
//! [`switch_to_userspace`], which returns when the user code traps back --
//! with a syscall (SVC) or with a fault.
//!
//! The syscall number arrives in a register that the trap entry preserves
//! in the user context. Parameters live in the trap frame on the *user
//! stack*, reached through the saved user stack pointer; the kernel
//! validates the frame against the process's regions and reads each value
//! exactly once. Re-reading would hand the process a time-of-check vs
//! time-of-use window, since the frame stays writable by other cores or a
//! misbehaving DMA the process controls.

use abi::{ExitStatus, FaultInfo, Sysnum, UsageError};

use crate::fail::{die, KernelError};
use crate::lock::GlobalIrqLock;
use crate::process;
use crate::startup::with_kernel_state;
use crate::thread::{self, ThreadFlags};
use crate::umem::USlice;

/// What came back from a trip through userspace.
pub(crate) enum UserspaceEvent {
    Syscall(SyscallParameters),
    Fault(FaultInfo),
}

/// The raw trap information: the syscall number from its dedicated
/// register, and the user stack pointer at the moment of the trap.
pub(crate) struct SyscallParameters {
    pub nr: u32,
    pub frame_base: usize,
}

/// Runs the unprivileged half of the current thread until it traps.
///
/// On return the thread is back in kernel mode with the user register file
/// parked in its user context.
pub(crate) fn switch_to_userspace() -> UserspaceEvent {
    with_kernel_state(|ks| {
        let me = ks.current();
        if let Some(t) = ks.threads.get_mut(me) {
            t.flags.insert(ThreadFlags::USERSPACE);
        }
    });
    // The dispatcher sees the flag and installs the user register file and
    // the process's MPU regions. Our kernel-side context freezes right
    // here until the process traps.
    thread::yield_now();

    with_kernel_state(|ks| {
        let me = ks.current();
        let Some(t) = ks.threads.get_mut(me) else {
            die(KernelError::Unexpected);
        };
        let Some(user) = t.user.as_mut() else {
            die(KernelError::Unexpected);
        };
        if let Some(fault) = user.fault.take() {
            return UserspaceEvent::Fault(fault);
        }
        UserspaceEvent::Syscall(SyscallParameters {
            nr: user.save.syscall_number(),
            frame_base: user.save.stack_pointer() as usize,
        })
    })
}

/// Entry point of every process's kernel-side thread. The argument is the
/// process table slot, smuggled through the thread argument.
pub(crate) fn process_main_loop(arg: *mut ()) -> *mut () {
    let proc = arg as usize as u16;
    loop {
        if thread::test_terminate() {
            // Terminated from outside; the exit status (if any) was
            // recorded by whoever terminated us.
            break;
        }
        match switch_to_userspace() {
            UserspaceEvent::Fault(fault) => {
                klog!("process {proc} faulted: {fault:?}");
                exit_with(proc, ExitStatus::signaled(fault.as_signal()));
                break;
            }
            UserspaceEvent::Syscall(params) => {
                match service_syscall(proc, &params) {
                    Ok(Flow::Resume) => {}
                    Ok(Flow::Exit(status)) => {
                        exit_with(proc, status);
                        break;
                    }
                    Err(fault) => {
                        exit_with(
                            proc,
                            ExitStatus::signaled(fault.as_signal()),
                        );
                        break;
                    }
                }
            }
        }
    }
    core::ptr::null_mut()
}

fn exit_with(proc: u16, status: ExitStatus) {
    let _lock = GlobalIrqLock::acquire();
    with_kernel_state(|ks| process::exit_inner(ks, proc, status));
}

enum Flow {
    Resume,
    Exit(ExitStatus),
}

/// Reads the four argument words from the trap frame. One validated read;
/// the values are then used from the copy.
fn read_args(proc: u16, frame_base: usize) -> Result<[u32; 4], FaultInfo> {
    with_kernel_state(|ks| {
        let Some(p) = ks.processes.get(proc) else {
            return Err(FaultInfo::SyscallUsage(UsageError::InvalidSlice));
        };
        let slice = USlice::<u32>::from_raw(frame_base, 4)
            .map_err(FaultInfo::from)?;
        let frame = p.try_read(&slice)?;
        Ok([frame[0], frame[1], frame[2], frame[3]])
    })
}

/// Writes results back into the trap frame's r0/r1 slots, so the process
/// sees them as return values.
fn write_result(
    proc: u16,
    frame_base: usize,
    lo: u32,
    hi: u32,
) -> Result<(), FaultInfo> {
    with_kernel_state(|ks| {
        let Some(p) = ks.processes.get(proc) else {
            return Err(FaultInfo::SyscallUsage(UsageError::InvalidSlice));
        };
        let mut slice = USlice::<u32>::from_raw(frame_base, 2)
            .map_err(FaultInfo::from)?;
        let frame = p.try_write(&mut slice)?;
        frame[0] = lo;
        frame[1] = hi;
        Ok(())
    })
}

/// Dispatches one syscall. An `Err` is an unrecoverable process fault
/// (terminate with signal); recoverable conditions are reported through
/// the return registers.
fn service_syscall(
    proc: u16,
    params: &SyscallParameters,
) -> Result<Flow, FaultInfo> {
    let nr = Sysnum::try_from(params.nr).map_err(|_| {
        FaultInfo::SyscallUsage(UsageError::BadSyscallNumber)
    })?;
    let args = read_args(proc, params.frame_base)?;

    match nr {
        Sysnum::Exit => Ok(Flow::Exit(ExitStatus::exited(args[0] as u8))),
        Sysnum::Yield => {
            thread::yield_now();
            Ok(Flow::Resume)
        }
        Sysnum::GetTime => {
            let now = crate::timer::now().as_ns() as u64;
            write_result(
                proc,
                params.frame_base,
                now as u32,
                (now >> 32) as u32,
            )?;
            Ok(Flow::Resume)
        }
        Sysnum::NanoSleep => {
            let ns = (args[0] as i64) | ((args[1] as i64) << 32);
            thread::sleep_ns(ns);
            Ok(Flow::Resume)
        }
        Sysnum::Write => {
            let slice =
                USlice::<u8>::from_raw(args[0] as usize, args[1] as usize)
                    .map_err(FaultInfo::from)?;
            let written = with_kernel_state(|ks| {
                let Some(p) = ks.processes.get(proc) else {
                    return Err(FaultInfo::SyscallUsage(
                        UsageError::InvalidSlice,
                    ));
                };
                let bytes = p.try_read(&slice)?;
                if let Ok(text) = core::str::from_utf8(bytes) {
                    crate::fail::irq_error_log(text);
                }
                Ok(bytes.len() as u32)
            })?;
            write_result(proc, params.frame_base, written, 0)?;
            Ok(Flow::Resume)
        }
    }
}
