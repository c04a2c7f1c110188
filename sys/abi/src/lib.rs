// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel and user processes.
//!
//! Everything in this crate is visible on both sides of the privilege
//! boundary: the kernel uses these types to classify faults and encode exit
//! statuses, and process-side code (plus host tooling, via `serde`) uses them
//! to interpret what the kernel reports.

// Allow std-y things in tests; see kerncore for the caveat about
// rust-analyzer defaulting to test builds.
#![cfg_attr(not(test), no_std)]

use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Number of MPU region slots available to a process.
///
/// This matches the number of hardware regions we are willing to reload on
/// every context switch; PMSAv7 parts have at least eight, and we keep one
/// aside for the kernel's own use.
pub const REGIONS_PER_PROCESS: usize = 7;

/// A record describing a fault taken by a thread running in a process, or by
/// kernel code asked to act on a process's behalf.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum FaultInfo {
    /// A data access outside the process's configured regions. `address` is
    /// `None` for the (rare) processor fault encodings that don't capture a
    /// faulting address.
    MemoryAccess {
        address: Option<u32>,
        source: FaultSource,
    },
    /// Instruction fetch outside the process's executable regions.
    IllegalText,
    /// The process pushed its stack pointer below its stack region, or the
    /// watermark at the stack base was found corrupted.
    StackOverflow { address: u32 },
    /// A bus error, precise or imprecise.
    BusError {
        address: Option<u32>,
        source: FaultSource,
    },
    /// Integer division by zero (the divide-by-zero trap is explicitly
    /// enabled at boot; the architectural default of returning zero is not
    /// something we placate).
    DivideByZero,
    /// An unaligned access, on profiles where the unaligned trap is enabled.
    UnalignedAccess,
    /// Use of a coprocessor the process has no access to.
    CoprocessorAccess,
    /// Execution of an undefined or illegal instruction.
    IllegalInstruction,
    /// A malformed exception-return sequence, e.g. a corrupted EXC_RETURN.
    InvalidExceptionReturn,
    /// An attempt to read or write the EPSR execution state bits.
    EpsrAccess,
    /// An escalated HardFault that could not be classified further.
    HardFault,
    /// Arguments passed to a syscall were invalid.
    SyscallUsage(UsageError),
}

impl FaultInfo {
    /// Maps this fault to the signal number delivered to the parent through
    /// the process exit status.
    pub fn as_signal(&self) -> Signal {
        match self {
            FaultInfo::MemoryAccess { .. }
            | FaultInfo::IllegalText
            | FaultInfo::StackOverflow { .. } => Signal::SIGSEGV,
            FaultInfo::BusError { .. } | FaultInfo::UnalignedAccess => {
                Signal::SIGBUS
            }
            FaultInfo::DivideByZero => Signal::SIGFPE,
            FaultInfo::CoprocessorAccess
            | FaultInfo::IllegalInstruction
            | FaultInfo::InvalidExceptionReturn
            | FaultInfo::EpsrAccess
            | FaultInfo::HardFault => Signal::SIGILL,
            FaultInfo::SyscallUsage(_) => Signal::SIGSYS,
        }
    }
}

impl From<UsageError> for FaultInfo {
    fn from(e: UsageError) -> Self {
        Self::SyscallUsage(e)
    }
}

/// A fault committed by user code when interacting with a syscall.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum UsageError {
    /// The process used an undefined syscall number.
    BadSyscallNumber,
    /// A syscall argument named a slice that is unaligned for its type or
    /// wraps the end of the address space. Neither is ever legal.
    InvalidSlice,
    /// A syscall argument named memory outside the process's regions.
    OutsideRegions,
}

/// Origin of a fault.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum FaultSource {
    /// User code did something that was intercepted by the processor.
    User,
    /// User code asked the kernel to do something bad on its behalf.
    Kernel,
}

/// Signal numbers used in exit statuses. Numbering follows the embedded libc
/// convention so that process-side `sys/wait.h` style macros keep working.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Signal {
    SIGILL = 4,
    SIGFPE = 8,
    SIGBUS = 10,
    SIGSEGV = 11,
    SIGSYS = 12,
}

/// Process termination status, as observed by the parent via `wait`.
///
/// The encoding mirrors the traditional `wait` status word: the low byte is
/// the terminating signal (zero for a normal exit), the next byte the exit
/// code.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Serialize,
    Deserialize,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct ExitStatus(pub u32);

impl ExitStatus {
    /// Status of a process that returned `code` from its entry point or
    /// called the exit syscall.
    pub const fn exited(code: u8) -> Self {
        Self((code as u32) << 8)
    }

    /// Status of a process terminated by the kernel with `signal`.
    pub const fn signaled(signal: Signal) -> Self {
        Self(signal as u32)
    }

    pub const fn is_exited(self) -> bool {
        self.0 & 0xFF == 0
    }

    pub const fn is_signaled(self) -> bool {
        self.0 & 0xFF != 0
    }

    /// Exit code, meaningful only if `is_exited`.
    pub const fn exit_code(self) -> u8 {
        (self.0 >> 8) as u8
    }

    /// Terminating signal number, meaningful only if `is_signaled`.
    pub const fn term_signal(self) -> u8 {
        (self.0 & 0xFF) as u8
    }
}

bitflags::bitflags! {
    /// Access attributes for one process memory region.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
    #[repr(transparent)]
    pub struct RegionAttributes: u32 {
        /// Region can be read.
        const READ = 1 << 0;
        /// Region can be written.
        const WRITE = 1 << 1;
        /// Region can contain executable code.
        const EXECUTE = 1 << 2;
        /// Region maps memory-mapped registers; affects cacheability.
        const DEVICE = 1 << 3;

        const RESERVED = !((1 << 4) - 1);
    }
}

/// Enumeration of syscall numbers.
///
/// The syscall number travels in a fixed register preserved by the
/// supervisor-call entry sequence; parameters are read from the user stack.
#[repr(u32)]
pub enum Sysnum {
    Exit = 0,
    Yield = 1,
    GetTime = 2,
    NanoSleep = 3,
    Write = 4,
}

/// We're using an explicit `TryFrom` impl for `Sysnum` instead of
/// `FromPrimitive` because the kernel doesn't currently depend on
/// `num-traits` and this seems okay.
impl core::convert::TryFrom<u32> for Sysnum {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Exit),
            1 => Ok(Self::Yield),
            2 => Ok(Self::GetTime),
            3 => Ok(Self::NanoSleep),
            4 => Ok(Self::Write),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_status_round_trip() {
        let s = ExitStatus::exited(42);
        assert!(s.is_exited());
        assert!(!s.is_signaled());
        assert_eq!(s.exit_code(), 42);

        let s = ExitStatus::signaled(Signal::SIGSEGV);
        assert!(s.is_signaled());
        assert!(!s.is_exited());
        assert_eq!(s.term_signal(), 11);
    }

    #[test]
    fn memory_faults_map_to_segv() {
        for f in [
            FaultInfo::MemoryAccess {
                address: Some(0),
                source: FaultSource::User,
            },
            FaultInfo::MemoryAccess {
                address: None,
                source: FaultSource::Kernel,
            },
            FaultInfo::IllegalText,
            FaultInfo::StackOverflow {
                address: 0x2000_0000,
            },
        ] {
            assert_eq!(f.as_signal(), Signal::SIGSEGV);
        }
    }
}
