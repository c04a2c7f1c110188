// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! User processes: MPU-isolated programs sharing the single address space.
//!
//! A process is a set of size-aligned MPU regions, an image block from the
//! board's pool allocator, and a thread. The thread leads a double life:
//! its kernel half runs [`crate::syscalls::process_main_loop`] on a private
//! kernel stack, and each trip through `switch_to_userspace` lends the CPU
//! to the unprivileged half until it traps back with a syscall or a fault.
//! Faults terminate the process with a signal-style exit status; the kernel
//! and the other processes keep running.
//!
//! Parents observe termination through [`wait`]/[`waitpid`], which reap the
//! zombie and return its status.

use core::ptr::NonNull;

use abi::{ExitStatus, FaultInfo, RegionAttributes, REGIONS_PER_PROCESS};

use crate::config::{
    MAX_PROCESSES, MAX_PROCESS_IMAGE_SIZE, SYSTEM_MODE_PROCESS_STACK_SIZE,
};
use crate::fail::{die, KernelError};
use crate::lock::GlobalIrqLock;
use crate::startup::{with_kernel_state, KernelState};
use crate::thread::{self, OwnedStack, ThreadFlags};
use crate::umem::USlice;

/// Names a process. Values are never reused within a boot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct Pid(pub i32);

/// One MPU region: a size-aligned power-of-two span with access attributes
/// and the precomputed hardware register images for fast reload at context
/// switch.
#[derive(Copy, Clone, Debug)]
pub struct MpuRegion {
    pub base: u32,
    pub size: u32,
    pub attributes: RegionAttributes,
    pub(crate) arch_data: crate::arch::RegionData,
}

impl kerncore::MemoryRegion for MpuRegion {
    fn contains(&self, addr: usize) -> bool {
        addr >= self.base as usize
            && addr < (self.base as usize + self.size as usize)
    }

    fn base_addr(&self) -> usize {
        self.base as usize
    }

    fn end_addr(&self) -> usize {
        self.base as usize + self.size as usize
    }
}

/// Errors from region configuration; all indicate a loader bug rather than
/// something user code did.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegionError {
    /// Size is not a power of two of at least 32 bytes.
    BadSize,
    /// Base is not aligned to the size.
    BadAlignment,
    /// The region overlaps one already configured.
    Overlap,
    /// All region slots are in use.
    TooManyRegions,
}

/// A process's MPU configuration: a small ordered set of regions, kept
/// sorted by base address so access checks can single-pass.
#[derive(Copy, Clone, Debug)]
pub struct MpuRegions {
    /// Entries past `count` are inert placeholders; keeping the array
    /// homogeneous lets `table()` hand out a plain slice.
    regions: [MpuRegion; REGIONS_PER_PROCESS],
    count: usize,
}

impl MpuRegions {
    const UNUSED: MpuRegion = MpuRegion {
        base: 0,
        size: 0,
        attributes: RegionAttributes::empty(),
        arch_data: crate::arch::RegionData::DISABLED,
    };

    pub const fn empty() -> Self {
        Self {
            regions: [Self::UNUSED; REGIONS_PER_PROCESS],
            count: 0,
        }
    }

    /// Adds a region. The MPU's constraints apply: power-of-two size, at
    /// least 32 bytes, base aligned to size.
    pub fn add(
        &mut self,
        base: u32,
        size: u32,
        attributes: RegionAttributes,
    ) -> Result<(), RegionError> {
        if !size.is_power_of_two() || size < 32 {
            return Err(RegionError::BadSize);
        }
        if base % size != 0 {
            return Err(RegionError::BadAlignment);
        }
        if self.count == REGIONS_PER_PROCESS {
            return Err(RegionError::TooManyRegions);
        }
        let end = base as u64 + size as u64;
        for r in self.table() {
            let r_end = r.base as u64 + r.size as u64;
            if (base as u64) < r_end && (r.base as u64) < end {
                return Err(RegionError::Overlap);
            }
        }
        let region = MpuRegion {
            base,
            size,
            attributes,
            arch_data: crate::arch::compute_region_data(
                base, size, attributes,
            ),
        };
        // Insert sorted by base.
        let mut i = self.count;
        while i > 0 && self.regions[i - 1].base > base {
            self.regions[i] = self.regions[i - 1];
            i -= 1;
        }
        self.regions[i] = region;
        self.count += 1;
        Ok(())
    }

    /// The configured regions, sorted by base address.
    pub fn table(&self) -> &[MpuRegion] {
        &self.regions[..self.count]
    }
}

/// Description of a loaded program, produced by the (out-of-scope) loader:
/// the initialized image bytes and the layout inside the process's RAM
/// block.
pub struct ProgramImage<'a> {
    /// Bytes copied to the start of the RAM block: code (if RAM-resident),
    /// GOT, initialized data.
    pub init: &'a [u8],
    /// Offset of the entry point inside the RAM block.
    pub entry_offset: usize,
    /// Offset of the global offset table inside the RAM block; handed to
    /// user code in its dedicated register.
    pub got_offset: usize,
    /// Total RAM the program needs (image + bss + user stack). Rounded up
    /// to the pool's sizing; must not exceed `MAX_PROCESS_IMAGE_SIZE`.
    pub ram_size: usize,
    /// Size of the user-mode stack at the top of the RAM block.
    pub stack_size: usize,
    /// Optional execute-in-place region (flash) the program also needs
    /// mapped, as (base, size).
    pub xip_region: Option<(u32, u32)>,
}

/// The board's allocator for process image blocks. Blocks come back
/// size-aligned -- i.e. usable as MPU regions directly.
pub trait ImagePool: Sync {
    /// Allocates a block of at least `size` bytes, returning the block and
    /// its actual (power-of-two) size.
    fn allocate(&self, size: usize) -> Option<(NonNull<u8>, usize)>;
    /// Returns a block to the pool.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from `allocate` on the same pool, and nothing
    /// may reference the block afterward.
    unsafe fn deallocate(&self, ptr: NonNull<u8>);
}

/// The registered pool. Set once during board bring-up, before any spawn.
static mut IMAGE_POOL: Option<&'static dyn ImagePool> = None;

/// Registers the image pool collaborator. Call before starting the kernel.
pub fn set_image_pool(pool: &'static dyn ImagePool) {
    // Safety: single-threaded boot context, per the function contract.
    unsafe {
        *core::ptr::addr_of_mut!(IMAGE_POOL) = Some(pool);
    }
}

fn image_pool() -> &'static dyn ImagePool {
    // Safety: written once at boot, read-only afterward.
    match unsafe { *core::ptr::addr_of!(IMAGE_POOL) } {
        Some(p) => p,
        None => die(KernelError::Unexpected),
    }
}

enum ProcState {
    Running,
    Zombie(ExitStatus),
}

pub(crate) struct Process {
    pid: Pid,
    /// The process that spawned us, if the spawner was itself a process.
    parent: Option<Pid>,
    state: ProcState,
    pub(crate) mpu: MpuRegions,
    image: Option<(NonNull<u8>, usize)>,
    /// The kernel-side thread driving this process.
    main_thread: u16,
}

impl Process {
    /// Tests whether this process could touch `slice` itself, with all of
    /// the `desired` attributes.
    #[must_use]
    fn can_access<T>(
        &self,
        slice: &USlice<T>,
        desired: RegionAttributes,
    ) -> bool {
        kerncore::can_access(slice, self.mpu.table(), |r| {
            r.attributes.contains(desired)
                && !r.attributes.contains(RegionAttributes::DEVICE)
        })
    }

    /// Obtains kernel access to the memory backing `slice`, if and only if
    /// the process can read it. This is how syscall arguments are reached:
    /// validate once, read once.
    pub(crate) fn try_read<'s, T>(
        &self,
        slice: &'s USlice<T>,
    ) -> Result<&'s [T], FaultInfo>
    where
        T: zerocopy::FromBytes + zerocopy::Immutable + zerocopy::KnownLayout,
    {
        if self.can_access(slice, RegionAttributes::READ) {
            // Safety: validated against the region table on the line above.
            Ok(unsafe { slice.assume_readable() })
        } else {
            Err(FaultInfo::MemoryAccess {
                address: Some(slice.base_addr() as u32),
                source: abi::FaultSource::Kernel,
            })
        }
    }

    /// Write counterpart of [`Process::try_read`].
    pub(crate) fn try_write<'s, T>(
        &self,
        slice: &'s mut USlice<T>,
    ) -> Result<&'s mut [T], FaultInfo>
    where
        T: zerocopy::FromBytes + zerocopy::Immutable + zerocopy::KnownLayout,
    {
        if self.can_access(slice, RegionAttributes::WRITE) {
            // Safety: validated against the region table on the line above;
            // the kernel holds no other reference into task memory here.
            Ok(unsafe { slice.assume_writable() })
        } else {
            Err(FaultInfo::MemoryAccess {
                address: Some(slice.base_addr() as u32),
                source: abi::FaultSource::Kernel,
            })
        }
    }
}

pub(crate) struct ProcessTable {
    slots: [Option<Process>; MAX_PROCESSES],
    next_pid: i32,
    /// Threads parked in wait/waitpid. Woken (all of them) whenever any
    /// process becomes a zombie; each re-checks what it is waiting for.
    exit_waiters: alloc::vec::Vec<u16>,
}

impl ProcessTable {
    pub const fn new() -> Self {
        const NONE: Option<Process> = None;
        Self {
            slots: [NONE; MAX_PROCESSES],
            next_pid: 1,
            exit_waiters: alloc::vec::Vec::new(),
        }
    }

    pub(crate) fn get(&self, idx: u16) -> Option<&Process> {
        self.slots.get(idx as usize)?.as_ref()
    }

    pub(crate) fn get_mut(&mut self, idx: u16) -> Option<&mut Process> {
        self.slots.get_mut(idx as usize)?.as_mut()
    }
}

/// Builds the process's region set: the RAM block plus any XIP region.
fn build_regions(
    block: (NonNull<u8>, usize),
    image: &ProgramImage<'_>,
) -> Result<MpuRegions, RegionError> {
    let mut mpu = MpuRegions::empty();
    mpu.add(
        block.0.as_ptr() as u32,
        block.1 as u32,
        RegionAttributes::READ
            | RegionAttributes::WRITE
            | RegionAttributes::EXECUTE,
    )?;
    if let Some((base, size)) = image.xip_region {
        mpu.add(
            base,
            size,
            RegionAttributes::READ | RegionAttributes::EXECUTE,
        )?;
    }
    Ok(mpu)
}

/// Creates a process from a loaded program and starts its thread.
///
/// Returns `None` if the process table is full, the pool is exhausted, the
/// image is oversized or malformed, or thread creation fails.
pub fn spawn(image: &ProgramImage<'_>) -> Option<Pid> {
    // The image, the bss it implies, and the user stack must all fit; the
    // entry point must land inside the block.
    if image.ram_size > MAX_PROCESS_IMAGE_SIZE
        || image.init.len().saturating_add(image.stack_size) > image.ram_size
        || image.entry_offset >= image.ram_size
    {
        return None;
    }
    let block = image_pool().allocate(image.ram_size)?;

    // Copy the initialized image into the block. The rest (bss, stack) is
    // zeroed so processes never see stale data from a previous tenant.
    //
    // Safety: the pool just handed us this block; nobody else references
    // it.
    unsafe {
        core::ptr::write_bytes(block.0.as_ptr(), 0, block.1);
        core::ptr::copy_nonoverlapping(
            image.init.as_ptr(),
            block.0.as_ptr(),
            image.init.len(),
        );
    }

    let mpu = match build_regions(block, image) {
        Ok(m) => m,
        Err(_) => {
            // Safety: block came from this pool moments ago.
            unsafe { image_pool().deallocate(block.0) };
            return None;
        }
    };

    let base = block.0.as_ptr() as u32;
    let entry = base + image.entry_offset as u32;
    let got = base + image.got_offset as u32;
    // User stack: at the top of the RAM block, AAPCS-aligned.
    let user_sp = (base + block.1 as u32) & !7;

    let _lock = GlobalIrqLock::acquire();
    let pid = with_kernel_state(|ks| {
        let slot = ks
            .processes
            .slots
            .iter()
            .position(|s| s.is_none())?;
        let pid = Pid(ks.processes.next_pid);

        let parent = current_process_pid(ks);

        let stack = OwnedStack::allocate(SYSTEM_MODE_PROCESS_STACK_SIZE)?;
        let tid = thread::pk_create_inner(
            ks,
            crate::syscalls::process_main_loop,
            stack,
            crate::sched::Priority::process_default(),
            slot as *mut (),
            thread::Options::empty(),
        )?;
        let tidx = tid.index() as u16;

        // Attach the userspace half: its register file, seeded with entry
        // point, stack, and GOT base.
        let mut user = alloc::boxed::Box::new(UserContext {
            save: Default::default(),
            process: slot as u16,
            fault: None,
        });
        crate::arch::init_userspace_frame(&mut user.save, entry, user_sp, got);
        if let Some(t) = ks.threads.get_mut(tidx) {
            t.user = Some(user);
        }

        ks.processes.slots[slot] = Some(Process {
            pid,
            parent,
            state: ProcState::Running,
            mpu,
            image: Some(block),
            main_thread: tidx,
        });
        ks.processes.next_pid = ks.processes.next_pid.wrapping_add(1).max(1);
        Some(pid)
    });
    if pid.is_none() {
        // Safety: nothing retained a reference to the block.
        unsafe { image_pool().deallocate(block.0) };
    }
    pid
}

/// The process the current thread belongs to, if any.
fn current_process_pid(ks: &KernelState) -> Option<Pid> {
    let me = ks.current();
    let proc = ks.threads.get(me)?.user.as_ref()?.process;
    ks.processes.get(proc).map(|p| p.pid)
}

/// The userspace half of a process thread: the register file used while
/// unprivileged, the owning process, and the landing slot for faults.
pub struct UserContext {
    pub(crate) save: crate::arch::SavedState,
    pub(crate) process: u16,
    pub(crate) fault: Option<FaultInfo>,
}

/// Loads `proc`'s MPU configuration; the dispatcher calls this when
/// resuming a thread in its userspace half.
pub(crate) fn irq_apply_mpu(ks: &KernelState, proc: u16) {
    let Some(p) = ks.processes.get(proc) else {
        die(KernelError::Unexpected);
    };
    crate::arch::mpu_apply(p.mpu.table());
}

/// Delivers a fault taken in userspace: parks the fault in the thread's
/// user context and flips the thread back to its kernel half, which will
/// observe the fault on return from `switch_to_userspace` and terminate the
/// process. Returns `false` if the thread was not in userspace (the fault
/// is the kernel's own problem).
pub(crate) fn irq_deliver_fault(
    ks: &mut KernelState,
    thread_idx: u16,
    fault: FaultInfo,
) -> bool {
    let Some(t) = ks.threads.get_mut(thread_idx) else {
        return false;
    };
    if !t.flags.contains(ThreadFlags::USERSPACE) {
        return false;
    }
    let Some(user) = t.user.as_mut() else {
        return false;
    };
    user.fault = Some(fault);
    t.flags.remove(ThreadFlags::USERSPACE);
    true
}

/// Reports a fault against a process as a whole (e.g. a kernel-stack
/// watermark failure in one of its threads); terminates it with the
/// matching signal.
pub(crate) fn irq_report_fault(
    ks: &mut KernelState,
    proc: u16,
    fault: FaultInfo,
) {
    exit_inner(ks, proc, ExitStatus::signaled(fault.as_signal()));
}

/// Marks `proc` a zombie with `status`, returns its image to the pool, and
/// wakes every thread parked in wait/waitpid.
pub(crate) fn exit_inner(ks: &mut KernelState, proc: u16, status: ExitStatus) {
    let Some(p) = ks.processes.get_mut(proc) else {
        return;
    };
    if let ProcState::Zombie(_) = p.state {
        return;
    }
    p.state = ProcState::Zombie(status);
    klog!("pid {} exited, status {:#x}", p.pid.0, status.0);
    let main_thread = p.main_thread;
    if let Some((ptr, _)) = p.image.take() {
        // Safety: the process is dead; its threads never touch the image
        // again (the MPU configuration dies with the USERSPACE flag).
        unsafe { image_pool().deallocate(ptr) };
    }
    // Ask the kernel half of the process's thread to unwind, in case the
    // termination came from outside it (e.g. a watermark check).
    if let Some(t) = ks.threads.get_mut(main_thread) {
        t.flags.insert(ThreadFlags::DELETING);
    }
    let _ = thread::pk_wakeup(ks, main_thread);
    let waiters = core::mem::take(&mut ks.processes.exit_waiters);
    for w in waiters {
        let _ = thread::pk_wakeup(ks, w);
    }
}

/// Looks for a reapable zombie child of `parent`. `pid = None` means "any
/// child". On hit, frees the table slot and returns the status.
fn try_reap(
    ks: &mut KernelState,
    parent: Option<Pid>,
    pid: Option<Pid>,
) -> Option<(Pid, ExitStatus)> {
    for slot in ks.processes.slots.iter_mut() {
        let Some(p) = slot else { continue };
        let matches = match pid {
            Some(want) => p.pid == want,
            None => p.parent == parent,
        };
        if !matches {
            continue;
        }
        if let ProcState::Zombie(status) = p.state {
            let pid = p.pid;
            *slot = None;
            return Some((pid, status));
        }
    }
    None
}

fn any_process_matches(
    ks: &KernelState,
    parent: Option<Pid>,
    pid: Option<Pid>,
) -> bool {
    ks.processes.slots.iter().flatten().any(|p| match pid {
        Some(want) => p.pid == want,
        None => p.parent == parent,
    })
}

/// Waits for any child of the caller to terminate, returning its pid and
/// exit status. "Child" means spawned from the same context: processes
/// spawned by kernel threads are children of every kernel thread. Returns
/// `None` immediately if the caller has no children.
pub fn wait() -> Option<(Pid, ExitStatus)> {
    waitpid_inner(None)
}

/// Waits for the given process to terminate. Returns `None` if no such
/// process exists.
pub fn waitpid(pid: Pid) -> Option<(Pid, ExitStatus)> {
    waitpid_inner(Some(pid))
}

fn waitpid_inner(pid: Option<Pid>) -> Option<(Pid, ExitStatus)> {
    let lock = GlobalIrqLock::acquire();
    loop {
        enum Step {
            Done(Option<(Pid, ExitStatus)>),
            Park,
        }
        let step = with_kernel_state(|ks| {
            let parent = current_process_pid(ks);
            if let Some(hit) = try_reap(ks, parent, pid) {
                return Step::Done(Some(hit));
            }
            if !any_process_matches(ks, parent, pid) {
                return Step::Done(None);
            }
            let me = ks.current();
            if !ks.processes.exit_waiters.contains(&me) {
                ks.processes.exit_waiters.push(me);
            }
            Step::Park
        });
        match step {
            Step::Done(r) => {
                // Make sure we're no longer on the waiter list (the wake
                // path drains it wholesale, but we may exit without being
                // woken).
                with_kernel_state(|ks| {
                    let me = ks.current();
                    ks.processes.exit_waiters.retain(|&t| t != me);
                });
                return r;
            }
            Step::Park => thread::irq_unlock_and_wait(&lock),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_keep_sorted_and_reject_overlap() {
        let mut mpu = MpuRegions::empty();
        mpu.add(0x2000_4000, 0x4000, RegionAttributes::READ).unwrap();
        mpu.add(0x0800_0000, 0x2_0000, RegionAttributes::READ).unwrap();
        mpu.add(0x2000_0000, 0x4000, RegionAttributes::READ).unwrap();

        let bases: alloc::vec::Vec<u32> =
            mpu.table().iter().map(|r| r.base).collect();
        assert_eq!(bases, [0x0800_0000, 0x2000_0000, 0x2000_4000]);

        assert_eq!(
            mpu.add(0x2000_0000, 0x8000, RegionAttributes::READ),
            Err(RegionError::Overlap)
        );
    }

    #[test]
    fn regions_enforce_mpu_constraints() {
        let mut mpu = MpuRegions::empty();
        assert_eq!(
            mpu.add(0x2000_0000, 48, RegionAttributes::READ),
            Err(RegionError::BadSize)
        );
        assert_eq!(
            mpu.add(0x2000_0000, 16, RegionAttributes::READ),
            Err(RegionError::BadSize)
        );
        assert_eq!(
            mpu.add(0x2000_0020, 0x40, RegionAttributes::READ),
            Err(RegionError::BadAlignment)
        );
    }

    #[test]
    fn region_slots_are_finite() {
        let mut mpu = MpuRegions::empty();
        for i in 0..REGIONS_PER_PROCESS as u32 {
            mpu.add(i * 0x1_0000, 0x1_0000, RegionAttributes::READ)
                .unwrap();
        }
        assert_eq!(
            mpu.add(0x4000_0000, 0x1_0000, RegionAttributes::READ),
            Err(RegionError::TooManyRegions)
        );
    }

    #[test]
    fn access_checks_respect_attributes() {
        let mut mpu = MpuRegions::empty();
        mpu.add(
            0x2000_0000,
            0x4000,
            RegionAttributes::READ | RegionAttributes::WRITE,
        )
        .unwrap();
        mpu.add(0x0800_0000, 0x2_0000, RegionAttributes::READ).unwrap();

        let readable = |r: &MpuRegion| {
            r.attributes.contains(RegionAttributes::READ)
        };
        let writable = |r: &MpuRegion| {
            r.attributes.contains(RegionAttributes::WRITE)
        };

        let flash = USlice::<u8>::from_raw(0x0800_0100, 64).unwrap();
        let ram = USlice::<u8>::from_raw(0x2000_0100, 64).unwrap();
        let nowhere = USlice::<u8>::from_raw(0x3000_0000, 64).unwrap();

        assert!(kerncore::can_access(&flash, mpu.table(), readable));
        assert!(!kerncore::can_access(&flash, mpu.table(), writable));
        assert!(kerncore::can_access(&ram, mpu.table(), writable));
        assert!(!kerncore::can_access(&nowhere, mpu.table(), readable));
    }
}
