// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for ARMv7-M.
//!
//! # Notes on ARM-M interrupts
//!
//! The kernel uses three exception vectors:
//!
//! - `SVCall` handles the one-time drop into the first thread at boot and,
//!   with processes enabled, the syscall trap out of unprivileged code.
//! - `PendSV` performs deferred context switches: everything that wants a
//!   reschedule (the timer deadline, an explicit yield, an IRQ that woke a
//!   high-priority thread) just pends it.
//! - The configurable fault vectors funnel into one classifier.
//!
//! The split exists because of interrupt latency. On any interrupt the
//! processor stacks a small subset of machine state and calls the ISR as a
//! normal function. That's great until you want to resume a *different*
//! thread, or inspect the callee-saved registers: then you must deposit the
//! full register file somewhere by hand. Doing that full save/restore in
//! every ISR would tax the common case, so ordinary interrupts stay cheap
//! and anything needing a switch pends `PendSV`, which runs the expensive
//! sequence once, after the last chained ISR retires.
//!
//! We didn't invent this idea -- it's covered in most books on the
//! Cortex-M.
//!
//! One non-event worth recording: unprivileged code executing `cpsid i` is
//! silently ignored by the hardware, not trapped, so a process "disabling
//! interrupts" needs no handling anywhere in the kernel.
//!
//! # The context-save area
//!
//! A thread's [`SavedState`] holds the callee-saved integer registers, the
//! process stack pointer, EXC_RETURN, and the callee-saved half of the FPU
//! register file. Everything else is on the thread's stack in the hardware
//! exception frame. The entry/exit sequences `stm`/`ldm` straight through
//! the struct, which is why its layout is load-bearing.
//!
//! The `CURRENT_CTXSAVE` global points at the save area of the running
//! thread -- its kernel one, or its userspace one when the thread is
//! executing unprivileged code. Only exception entry/exit sequences
//! dereference it, which is what makes the aliasing with the kernel's
//! `&mut` state tolerable: those sequences run strictly before or after,
//! never during, a kernel state borrow on this core.

use core::arch::global_asm;
use core::sync::atomic::{AtomicPtr, Ordering};

use abi::RegionAttributes;

macro_rules! uassert {
    ($cond:expr) => {
        if !$cond {
            panic!("Assertion failed!");
        }
    };
}

/// Pointer to the running thread's active save area. The exception entry
/// sequences address this by symbol name.
#[no_mangle]
static CURRENT_CTXSAVE: AtomicPtr<SavedState> =
    AtomicPtr::new(core::ptr::null_mut());

/// ARMv7-M volatile registers that must be saved across context switches.
#[repr(C)]
#[derive(Debug, Default)]
pub struct SavedState {
    // NOTE: the following fields must be kept contiguous!
    r4: u32,
    r5: u32,
    r6: u32,
    r7: u32,
    r8: u32,
    r9: u32,
    r10: u32,
    r11: u32,
    psp: u32,
    exc_return: u32,
    s16: u32,
    s17: u32,
    s18: u32,
    s19: u32,
    s20: u32,
    s21: u32,
    s22: u32,
    s23: u32,
    s24: u32,
    s25: u32,
    s26: u32,
    s27: u32,
    s28: u32,
    s29: u32,
    s30: u32,
    s31: u32,
    // NOTE: the above fields must be kept contiguous!
}

impl SavedState {
    /// Stack pointer at the time of the save.
    pub fn stack_pointer(&self) -> u32 {
        self.psp
    }

    /// The syscall number register. r11 is callee-saved, so the trap entry
    /// has parked it here by the time anyone asks.
    pub fn syscall_number(&self) -> u32 {
        self.r11
    }
}

/// Stuff placed on the stack at exception entry whether or not the FPU
/// was active.
#[derive(Debug, Default)]
#[repr(C)]
struct BaseExceptionFrame {
    r0: u32,
    r1: u32,
    r2: u32,
    r3: u32,
    r12: u32,
    lr: u32,
    pc: u32,
    xpsr: u32,
}

/// Extended version for FPU.
#[derive(Debug, Default)]
#[repr(C)]
struct ExtendedExceptionFrame {
    base: BaseExceptionFrame,
    fpu_regs: [u32; 16],
    fpscr: u32,
    reserved: u32,
}

/// Initially we just set the Thumb Mode bit, the minimum required.
const INITIAL_PSR: u32 = 1 << 24;

/// We don't really care about the initial FPU mode; 0 is reasonable.
const INITIAL_FPSCR: u32 = 0;

/// EXC_RETURN into thread mode, process stack, FP state present.
const EXC_RETURN_CONST: u32 = 0xFFFFFFED;

/// Lays down a synthetic exception frame on a new thread's stack so that
/// the first dispatch "returns" into the launcher with the entry point and
/// argument in the first two argument registers.
pub(crate) fn init_thread_frame(
    thread: &mut crate::thread::Thread,
    entry: crate::thread::Entry,
    arg: *mut (),
) {
    let top = thread.stack.top() as u32;
    // The allocator gives us 8-byte-aligned tops; AAPCS insists.
    uassert!(top & 0x7 == 0);

    let frame_size = core::mem::size_of::<ExtendedExceptionFrame>() as u32;
    uassert!(top >= frame_size);
    let frame = (top - frame_size) as *mut ExtendedExceptionFrame;

    // Conservatively zero the entire frame, then fill in the bits we
    // actually care about.
    //
    // Safety: the frame lies within the thread's freshly allocated stack,
    // which nothing else references yet.
    unsafe {
        frame.write(ExtendedExceptionFrame::default());
        let f = &mut *frame;
        f.base.pc = (crate::thread::thread_launcher as usize as u32) | 1;
        f.base.r0 = entry as usize as u32;
        f.base.r1 = arg as u32;
        f.base.xpsr = INITIAL_PSR;
        f.base.lr = 0xFFFF_FFFF; // trap on return from the launcher
        f.fpscr = INITIAL_FPSCR;
    }

    // The initial stack pointer is the base of this frame, *not* the stack
    // top.
    thread.save = SavedState {
        psp: frame as u32,
        exc_return: EXC_RETURN_CONST,
        ..Default::default()
    };
}

/// Builds the userspace half of a process thread: a synthetic frame on the
/// *user* stack entering the program at `entry`, with the GOT base parked
/// in r9 where position-independent user code expects it.
#[cfg(feature = "processes")]
pub fn init_userspace_frame(
    save: &mut SavedState,
    entry: u32,
    user_sp: u32,
    got_base: u32,
) {
    let sp = user_sp & !7;
    let frame_size = core::mem::size_of::<ExtendedExceptionFrame>() as u32;
    uassert!(sp >= frame_size);
    let frame = (sp - frame_size) as *mut ExtendedExceptionFrame;

    // Safety: the frame is inside the process's freshly allocated RAM
    // block, which the kernel (privileged) can write and nothing aliases
    // yet.
    unsafe {
        frame.write(ExtendedExceptionFrame::default());
        let f = &mut *frame;
        f.base.pc = entry | 1;
        f.base.xpsr = INITIAL_PSR;
        f.base.lr = 0xFFFF_FFFF;
        f.fpscr = INITIAL_FPSCR;
    }

    *save = SavedState {
        psp: frame as u32,
        exc_return: EXC_RETURN_CONST,
        r9: got_base,
        ..Default::default()
    };
}

/// PMSAv7 region register images, precomputed at region setup so the
/// context switch only stores them.
///
/// `repr(C)` to preserve field order, which matches the MPU's register
/// order; this improves code generation in practice.
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct RegionData {
    rbar: u32,
    rasr: u32,
}

impl RegionData {
    /// An unprogrammed slot: region disabled.
    pub const DISABLED: Self = Self { rbar: 0, rasr: 0 };
}

/// Computes the RBAR/RASR images for a size-aligned power-of-two region.
pub fn compute_region_data(
    base: u32,
    size: u32,
    attributes: RegionAttributes,
) -> RegionData {
    // This MPU requires 32-byte-aligned regions, in part because it stuffs
    // extra stuff into the bottom five bits of RBAR.
    uassert!(base & 0x1F == 0);
    uassert!(size.is_power_of_two() && size >= 32);

    let xn = !attributes.contains(RegionAttributes::EXECUTE);
    // These AP encodings are chosen such that we never deny *privileged*
    // code (i.e. us) access to the memory.
    let ap = if attributes.contains(RegionAttributes::WRITE) {
        0b011
    } else if attributes.contains(RegionAttributes::READ) {
        0b010
    } else {
        0b001
    };
    // TEX/SCB pick memory type and cache policy; see table B3-13 in the
    // ARMv7-M ARM.
    let (tex, scb) = if attributes.contains(RegionAttributes::DEVICE) {
        (0b000, 0b001)
    } else {
        // Normal memory, write-back, read/write allocate, not shared.
        (0b001, 0b011)
    };
    // The MPU wants log2(size) minus one in the SIZE field; the minimum 32
    // bytes is encoded as 4 because 2**(4+1) == 32. Sizes are validated as
    // powers of two above, so counting leading zeros gets us log2.
    let l2size = 30 - size.leading_zeros();

    let rasr =
        (xn as u32) << 28 | ap << 24 | tex << 19 | scb << 16 | l2size << 1 | 1;
    RegionData { rbar: base, rasr }
}

/// Loads a process's regions into the MPU and arranges for thread mode to
/// run unprivileged. Called from dispatch when resuming a userspace half.
#[cfg(feature = "processes")]
pub fn mpu_apply(regions: &[crate::process::MpuRegion]) {
    // We are manufacturing authority to interact with the MPU here, because
    // we can't thread a cortex-specific peripheral through an
    // architecture-independent API. This approach might bear revisiting
    // later.
    let mpu = unsafe {
        // At least by not taking a &mut we're confident we're not violating
        // aliasing....
        &*cortex_m::peripheral::MPU::PTR
    };

    // Turn the MPU off while regions are inconsistent. Loads with it *on*
    // can pair an RBAR from one region with the RASR of another; that has
    // caused real crashes on other systems, and disable/enable costs
    // single-digit cycles.
    //
    // Safety: no memory safety implications for the kernel; we run
    // privileged with PRIVDEFENA.
    unsafe {
        mpu.ctrl.write(0);
    }

    for slot in 0..abi::REGIONS_PER_PROCESS {
        let data = regions
            .get(slot)
            .map(|r| r.arch_data)
            .unwrap_or(RegionData::DISABLED);
        // Safety: loading values computed by compute_region_data, which
        // only constrain unprivileged accesses.
        unsafe {
            mpu.rnr.write(slot as u32);
            mpu.rbar.write(data.rbar);
            mpu.rasr.write(data.rasr);
        }
    }

    const ENABLE: u32 = 0b001;
    const PRIVDEFENA: u32 = 0b100;
    // Safety: as above.
    unsafe {
        mpu.ctrl.write(ENABLE | PRIVDEFENA);
    }

    // Thread mode drops privileges on the way out. (Written directly;
    // CONTROL writes from handler mode affect thread mode, and the ISB
    // orders it before the exception return.)
    //
    // Safety: only constrains unprivileged execution.
    unsafe {
        core::arch::asm!(
            "msr CONTROL, {0}",
            "isb",
            in(reg) 1u32,
            options(nomem, preserves_flags),
        );
    }
}

/// Restores the kernel's view: default memory map, privileged thread mode.
#[cfg(feature = "processes")]
pub fn mpu_disable() {
    let mpu = unsafe { &*cortex_m::peripheral::MPU::PTR };
    // Safety: turning the MPU off cannot break the (privileged) kernel.
    unsafe {
        mpu.ctrl.write(0);
    }
    // Safety: restores full privileges for kernel threads; we are the
    // kernel.
    unsafe {
        core::arch::asm!(
            "msr CONTROL, {0}",
            "isb",
            in(reg) 0u32,
            options(nomem, preserves_flags),
        );
    }
}

/// Records `save` as the register file to restore on next exception
/// return.
///
/// # Safety
///
/// `save` must point into the thread table (or a thread's boxed user
/// context) and stay valid until the next call; only exception entry/exit
/// may dereference it.
pub unsafe fn set_current_ctxsave(save: *mut SavedState) {
    CURRENT_CTXSAVE.store(save, Ordering::Relaxed);
}

/// Requests a deferred context switch: pends PendSV, which runs when the
/// current ISR chain (if any) retires and interrupts allow.
pub fn pend_context_switch() {
    cortex_m::peripheral::SCB::set_pendsv();
}

pub fn wait_for_interrupt() {
    cortex_m::asm::wfi();
}

/// Deep sleep: lets the board stop peripheral clocks. The board hooks the
/// actual entry/exit (and the clock advance on the way back) through
/// `qz_deep_sleep`.
#[cfg(feature = "deep-sleep")]
pub fn deep_sleep() {
    extern "C" {
        fn qz_deep_sleep();
    }
    // Safety: collaborator contract; the board's implementation is
    // required to preserve kernel invariants (it runs on the idle thread
    // with nothing else runnable).
    unsafe { qz_deep_sleep() }
}

pub fn reset() -> ! {
    cortex_m::peripheral::SCB::sys_reset()
}

pub fn irq_disable_current_core() {
    cortex_m::interrupt::disable();
}

pub fn irq_enable_current_core() {
    // Safety: the lock discipline guarantees this pairs with a disable.
    unsafe { cortex_m::interrupt::enable() }
}

pub fn interrupts_enabled() -> bool {
    cortex_m::register::primask::read().is_active()
}

#[cfg(not(feature = "smp"))]
pub fn current_core() -> usize {
    0
}

// On dual-core parts, core identity and the hardware spinlock behind the
// global lock are SoC-specific; the board supplies them.
#[cfg(feature = "smp")]
extern "C" {
    fn qz_current_core() -> u32;
    fn qz_spin_lock();
    fn qz_spin_unlock();
    fn qz_park_other_cores();
    fn qz_pend_timer_irq(core: u32);
}

#[cfg(feature = "smp")]
pub fn current_core() -> usize {
    // Safety: collaborator contract; reads a SoC id register.
    (unsafe { qz_current_core() }) as usize
}

#[cfg(feature = "smp")]
pub fn spin_lock() {
    // Safety: collaborator contract.
    unsafe { qz_spin_lock() }
}

#[cfg(feature = "smp")]
pub fn spin_unlock() {
    // Safety: collaborator contract.
    unsafe { qz_spin_unlock() }
}

#[cfg(feature = "smp")]
pub fn park_other_cores() {
    // Safety: collaborator contract.
    unsafe { qz_park_other_cores() }
}

// The OS timer hardware is the board's: a free-running counter split
// across two 32-bit halves, a compare channel per core, and an interrupt
// routed to `kern::timer::irq_timer_interrupt`.
extern "C" {
    fn qz_timer_frequency_hz() -> u32;
    fn qz_timer_count_low() -> u32;
    fn qz_timer_count_high() -> u32;
    fn qz_timer_set_compare(ticks: u64);
    #[cfg(feature = "deep-sleep")]
    fn qz_timer_set_count(ticks: u64);
}

pub fn timer_frequency_hz() -> u32 {
    // Safety: collaborator contract; pure read.
    unsafe { qz_timer_frequency_hz() }
}

/// Reads the 64-bit tick counter, tolerating the race across the two
/// halves: read high, low, high again, and retry if the high half moved.
pub fn timer_ticks() -> u64 {
    loop {
        // Safety: collaborator contract; pure reads.
        let (h1, lo, h2) = unsafe {
            (
                qz_timer_count_high(),
                qz_timer_count_low(),
                qz_timer_count_high(),
            )
        };
        if h1 == h2 {
            return (h1 as u64) << 32 | lo as u64;
        }
    }
}

pub fn irq_timer_set_compare(ticks: u64) {
    // Safety: collaborator contract.
    unsafe { qz_timer_set_compare(ticks) }
}

#[cfg(feature = "deep-sleep")]
pub fn irq_timer_set_time(ticks: u64) {
    // Safety: collaborator contract.
    unsafe { qz_timer_set_count(ticks) }
}

/// Re-fires the timer deadline interrupt on `core` after a clock advance.
#[cfg(feature = "deep-sleep")]
pub fn irq_pend_timer_on(core: usize) {
    #[cfg(feature = "smp")]
    // Safety: collaborator contract.
    unsafe {
        qz_pend_timer_irq(core as u32)
    }
    #[cfg(not(feature = "smp"))]
    {
        let _ = core;
        pend_context_switch();
    }
}

/// Enables an NVIC interrupt line.
pub fn irq_enable_line(n: u32) {
    let nvic = unsafe { &*cortex_m::peripheral::NVIC::PTR };
    let reg = (n / 32) as usize;
    let bit = 1 << (n % 32);
    // Safety: enabling an interrupt the board has a handler for.
    unsafe {
        nvic.iser[reg].write(bit);
    }
}

/// Disables an NVIC interrupt line.
pub fn irq_disable_line(n: u32) {
    let nvic = unsafe { &*cortex_m::peripheral::NVIC::PTR };
    let reg = (n / 32) as usize;
    let bit = 1 << (n % 32);
    // Safety: write-one-to-clear enable register.
    unsafe {
        nvic.icer[reg].write(bit);
    }
}

/// Makes an NVIC interrupt line pending from software.
pub fn irq_pend_line(n: u32) {
    let nvic = unsafe { &*cortex_m::peripheral::NVIC::PTR };
    let reg = (n / 32) as usize;
    let bit = 1 << (n % 32);
    // Safety: pending an interrupt the board has a handler for.
    unsafe {
        nvic.ispr[reg].write(bit);
    }
}

/// Sets the NVIC priority of an interrupt line. Remember that peripheral
/// interrupts must stay below (numerically above) the kernel's service
/// exceptions, which sit at the minimum priority.
pub fn irq_set_priority_line(n: u32, priority: u8) {
    let nvic = unsafe { &*cortex_m::peripheral::NVIC::PTR };
    // Safety: priorities only affect preemption order.
    unsafe {
        nvic.ipr[n as usize].write(priority);
    }
}

/// Drops out of the boot path into the first thread.
///
/// # Safety
///
/// Call exactly once, at the end of `start_kernel`, on the main stack, with
/// the dispatcher already run once (so `CURRENT_CTXSAVE` is live).
pub unsafe fn start_first_thread() -> ! {
    // Set exception priorities: faults high so we can catch kernel
    // problems, SVCall/PendSV at the bottom so the kernel is never
    // preempted by itself. The board is expected to have set its timer and
    // peripheral IRQs between the two.
    //
    // Safety: purely lowering priorities from their defaults; cannot cause
    // surprise preemption.
    unsafe {
        let scb = &*cortex_m::peripheral::SCB::PTR;
        // Enable the separate fault handlers (MEMFAULT, BUSFAULT,
        // USGFAULT).
        scb.shcsr.modify(|x| x | 0b111 << 16);
        // MemManage, BusFault, UsageFault to the highest configurable
        // priority.
        scb.shpr[0].write(0x00);
        scb.shpr[1].write(0x00);
        scb.shpr[2].write(0x00);
        // SVCall, PendSV to the lowest.
        scb.shpr[7].write(0xFF);
        scb.shpr[10].write(0xFF);
        scb.shpr[11].write(0xFF);

        // ARM's default disposition is that division by zero doesn't
        // actually fail, but rather returns 0. (!) We explicitly configure
        // ourselves to trap on any divide by zero.
        const DIV_0_TRP: u32 = 1 << 4;
        scb.ccr.modify(|x| x | DIV_0_TRP);
    }

    let save = CURRENT_CTXSAVE.load(Ordering::Relaxed);
    uassert!(!save.is_null());
    // Safety: the dispatcher stored a valid thread save area.
    let psp = unsafe { (*save).psp };
    // Safety: setting PSP has no effect while running on the main stack.
    unsafe {
        cortex_m::register::psp::write(psp);
    }

    // Flip into Handler mode by trapping, so the exception return machinery
    // can drop us into Thread mode on the process stack. The SVC entry
    // sequence recognizes this one startup case by the caller's mode.
    //
    // Safety: the asm restores callee-saved registers from the save area
    // and never returns.
    unsafe {
        core::arch::asm!(
            "
            @ Restore callee-save registers.
            ldm {save}, {{r4-r11}}
            @ Interrupts on; SVC would escalate to HardFault under PRIMASK.
            cpsie i
            @ Trap into the kernel.
            svc #0xFF
            @ noreturn generates a UDF here in case that should return.
            ",
            save = in(reg) &(*save).r4,
            options(noreturn),
        )
    }
}

// Handler that gets linked into the vector table for the Supervisor Call
// (SVC) instruction. (Name is dictated by the `cortex_m` crate.)
//
// Two cases arrive here:
//
// - The one-time boot trap from `start_first_thread` (recognized by the
//   caller's mode in LR): manufacture an EXC_RETURN into thread mode and
//   go. Privileges are *kept* -- the first thread is a kernel thread.
// - With processes enabled, the syscall trap from unprivileged code: park
//   the user register file in the active save area (which points at the
//   thread's userspace context while it runs user code), let `svc_entry`
//   flip the thread to its kernel half, and restore from wherever
//   `CURRENT_CTXSAVE` points afterward.
global_asm! {"
    .section .text.SVCall
    .globl SVCall
    .type SVCall,function
    SVCall:
        @ Inspect LR to figure out the caller's mode.
        mov r0, lr
        mov r1, #0xFFFFFFF3
        bic r0, r1
        @ Is the call coming from thread mode + main stack, i.e.
        @ from the kernel startup routine?
        cmp r0, #0x8
        @ If so, this is startup; jump ahead. The common case falls
        @ through because branch-not-taken tends to be faster on small
        @ cores.
        beq 1f

        @ store volatile state.
        @ first, get a pointer to the current save area.
        movw r0, #:lower16:CURRENT_CTXSAVE
        movt r0, #:upper16:CURRENT_CTXSAVE
        ldr r1, [r0]
        movs r2, r1
        @ fetch the process-mode stack pointer.
        @ fetching into r12 means the order in the stm below is right.
        mrs r12, PSP
        @ now, store volatile registers, plus the PSP in r12, plus LR.
        stm r2!, {{r4-r12, lr}}
        vstm r2, {{s16-s31}}

        bl svc_entry

        @ we're returning into the thread's kernel half.
        movw r0, #:lower16:CURRENT_CTXSAVE
        movt r0, #:upper16:CURRENT_CTXSAVE
        ldr r0, [r0]
        @ restore volatile registers, plus load PSP into r12
        ldm r0!, {{r4-r12, lr}}
        vldm r0, {{s16-s31}}
        msr PSP, r12

        @ resume
        bx lr

    1:  @ starting up the first thread: return into thread mode on the
        @ process stack, keeping privileges.
        mov lr, {exc_return}
        bx lr
    ",
    exc_return = const EXC_RETURN_CONST,
}

/// The Rust side of the syscall trap: flips the current thread from its
/// userspace half to its kernel half. The scheduler does not run; this is
/// the same thread continuing in a different register file.
#[no_mangle]
unsafe extern "C" fn svc_entry() {
    #[cfg(feature = "processes")]
    {
        crate::startup::with_kernel_state(|ks| {
            let me = ks.current();
            let Some(t) = ks.threads.get_mut(me) else {
                crate::fail::die(crate::fail::KernelError::Unexpected);
            };
            if !t.flags.contains(crate::thread::ThreadFlags::USERSPACE) {
                // SVC from a kernel thread; kernel threads call in
                // directly and have no business trapping.
                crate::fail::die(crate::fail::KernelError::Unexpected);
            }
            t.flags.remove(crate::thread::ThreadFlags::USERSPACE);
            let save = &mut t.save as *mut SavedState;
            // Safety: table slot of the running thread, stable until next
            // entry.
            unsafe { set_current_ctxsave(save) };
        });
        mpu_disable();
    }
    #[cfg(not(feature = "processes"))]
    {
        // No processes, no legitimate SVC after boot.
        crate::fail::die(crate::fail::KernelError::Unexpected);
    }
}

// PendSV: the deferred context switch. Stores the outgoing thread's
// registers through CURRENT_CTXSAVE, runs the scheduler, and restores
// whatever CURRENT_CTXSAVE points at afterward.
global_asm! {"
    .section .text.PendSV
    .globl PendSV
    .type PendSV,function
    PendSV:
        @ store volatile state.
        @ first, get a pointer to the current save area.
        movw r0, #:lower16:CURRENT_CTXSAVE
        movt r0, #:upper16:CURRENT_CTXSAVE
        ldr r1, [r0]
        @ fetch the process-mode stack pointer.
        @ fetching into r12 means the order in the stm below is right.
        mrs r12, PSP
        @ now, store volatile registers, plus the PSP in r12, plus LR.
        stm r1!, {{r4-r12, lr}}
        vstm r1, {{s16-s31}}

        bl pendsv_entry

        @ we're returning back to *some* thread, maybe not the same one.
        movw r0, #:lower16:CURRENT_CTXSAVE
        movt r0, #:upper16:CURRENT_CTXSAVE
        ldr r0, [r0]
        @ restore volatile registers, plus load PSP into r12
        ldm r0!, {{r4-r12, lr}}
        vldm r0, {{s16-s31}}
        msr PSP, r12

        @ resume
        bx lr
    ",
}

/// The Rust side of the PendSV handler, after all volatile registers have
/// been saved somewhere predictable.
#[no_mangle]
unsafe extern "C" fn pendsv_entry() {
    crate::sched::irq_dispatch();
}

#[repr(u32)]
#[allow(dead_code)] // constructed by the fault assembly, not by Rust
enum FaultType {
    MemoryManagement = 4,
    BusFault = 5,
    UsageFault = 6,
}

// The configurable faults share one entry path: park the (integer) state
// in the current save area, classify in Rust, and resume whatever thread
// the classifier chose. The FPU registers are deliberately *not* saved
// here: touching them triggers a lazy state save through a stack pointer
// we may have just learned is garbage. The classifier stores them later,
// after defusing that.
global_asm! {"
    .section .text.im_dead
    .globl im_dead
    .type im_dead,function
    im_dead:
        @ lie down try not to cry cry a lot
        movw r0, #0xed0c
        movt r0, #0xe000
        movw r1, #0x0004
        movt r1, #0x05fa
        str.w  r1, [r0]
    1:
        b 1b

    .section .text.configurable_fault
    .globl configurable_fault
    .type configurable_fault,function
    configurable_fault:
        @ Read the current save-area pointer.
        movw r0, #:lower16:CURRENT_CTXSAVE
        movt r0, #:upper16:CURRENT_CTXSAVE
        ldr r0, [r0]
        mrs r12, PSP

        @ Save integer context for the classifier (and the debugger).
        mov r2, r0
        stm r2!, {{r4-r12, lr}}

        @ Fault number from IPSR (bottom 4 bits suffice; this path only
        @ serves exceptions below 16). Pass the save area, the fault
        @ number, and the FPU save slot to the classifier.
        mrs r1, IPSR
        and r1, r1, #0xf
        bl handle_fault

        @ The classifier may have switched save areas; reload.
        movw r0, #:lower16:CURRENT_CTXSAVE
        movt r0, #:upper16:CURRENT_CTXSAVE
        ldr r0, [r0]

        @ Restore volatile registers, plus load PSP into r12
        ldm r0!, {{r4-r12, lr}}
        vldm r0, {{s16-s31}}
        msr PSP, r12

        @ resume
        bx lr

    .section .text.MemoryManagement
    .globl MemoryManagement
    .type MemoryManagement,function
    MemoryManagement:
        b configurable_fault

    .section .text.BusFault
    .globl BusFault
    .type BusFault,function
    BusFault:
        b configurable_fault

    .section .text.UsageFault
    .globl UsageFault
    .type UsageFault,function
    UsageFault:
        b configurable_fault

    .section .text.HardFault
    .globl HardFault
    .type HardFault,function
    HardFault:
        b im_dead
    ",
}

bitflags::bitflags! {
    /// Bits in the Configurable Fault Status Register.
    #[derive(Copy, Clone)]
    #[repr(transparent)]
    struct Cfsr: u32 {
        // Bits 0-7: MMFSR (Memory Management Fault Status Register)
        const IACCVIOL = 1 << 0;
        const DACCVIOL = 1 << 1;
        // MMFSR bit 2 reserved
        const MUNSTKERR = 1 << 3;
        const MSTKERR = 1 << 4;
        const MLSPERR = 1 << 5;
        // MMFSR bit 6 reserved
        const MMARVALID = 1 << 7;

        // Bits 8-15: BFSR (Bus Fault Status Register)
        const IBUSERR = 1 << (8 + 0);
        const PRECISERR = 1 << (8 + 1);
        const IMPRECISERR = 1 << (8 + 2);
        const UNSTKERR = 1 << (8 + 3);
        const STKERR = 1 << (8 + 4);
        const LSPERR = 1 << (8 + 5);
        // BFSR bit 6 reserved
        const BFARVALID = 1 << (8 + 7);

        // Bits 16-31: UFSR (Usage Fault Status Register)
        const UNDEFINSTR = 1 << (16 + 0);
        const INVSTATE = 1 << (16 + 1);
        const INVPC = 1 << (16 + 2);
        const NOCP = 1 << (16 + 3);
        // UFSR bits 4-7 reserved on ARMv7-M
        const UNALIGNED = 1 << (16 + 8);
        const DIVBYZERO = 1 << (16 + 9);
        // UFSR bits 10-31 reserved
    }
}

/// Classifies a configurable fault into the ABI taxonomy.
#[cfg(feature = "processes")]
fn classify_fault(
    fault_type: FaultType,
    cfsr: Cfsr,
    mmfar: u32,
    bfar: u32,
    psp: u32,
) -> (abi::FaultInfo, bool) {
    use abi::{FaultInfo, FaultSource};
    match fault_type {
        FaultType::MemoryManagement => {
            if cfsr.contains(Cfsr::MSTKERR) {
                // The stack pointer is so trashed we couldn't even stack
                // the exception frame; there is no PC to be had.
                (FaultInfo::StackOverflow { address: psp }, true)
            } else if cfsr.contains(Cfsr::IACCVIOL) {
                (FaultInfo::IllegalText, false)
            } else {
                (
                    FaultInfo::MemoryAccess {
                        address: if cfsr.contains(Cfsr::MMARVALID) {
                            Some(mmfar)
                        } else {
                            None
                        },
                        source: FaultSource::User,
                    },
                    false,
                )
            }
        }
        FaultType::BusFault => (
            FaultInfo::BusError {
                address: if cfsr.contains(Cfsr::BFARVALID) {
                    Some(bfar)
                } else {
                    None
                },
                source: FaultSource::User,
            },
            false,
        ),
        FaultType::UsageFault => (
            if cfsr.contains(Cfsr::DIVBYZERO) {
                FaultInfo::DivideByZero
            } else if cfsr.contains(Cfsr::UNALIGNED) {
                FaultInfo::UnalignedAccess
            } else if cfsr.contains(Cfsr::NOCP) {
                FaultInfo::CoprocessorAccess
            } else if cfsr.contains(Cfsr::UNDEFINSTR) {
                FaultInfo::IllegalInstruction
            } else if cfsr.contains(Cfsr::INVPC) {
                FaultInfo::InvalidExceptionReturn
            } else if cfsr.contains(Cfsr::INVSTATE) {
                FaultInfo::EpsrAccess
            } else {
                FaultInfo::HardFault
            },
            false,
        ),
    }
}

/// Common implementation of fault handling.
///
/// # Safety
///
/// Requirements for using this safely include:
///
/// - Call this on the way into the kernel from the fault assembly, not
///   from kernel Rust code.
/// - `save` must be the active save area, with integer state already
///   parked.
#[no_mangle]
unsafe extern "C" fn handle_fault(save: *mut SavedState, fault_num: u32) {
    // To diagnose the fault we need the System Control Block. Pull such
    // access from thin air; the resulting shared reference to a
    // static-scoped peripheral breaks no rules.
    let scb = unsafe { &*cortex_m::peripheral::SCB::PTR };
    let cfsr = Cfsr::from_bits_truncate(scb.cfsr.read());

    // Safety: the fault assembly passed us the live save area.
    let (exc_return, psp) = unsafe { ((*save).exc_return, (*save).psp) };
    let from_thread_mode = exc_return & 0b1000 != 0;

    if !from_thread_mode {
        // This fault originates from the kernel itself. Make the panic as
        // information-rich as we can afford before the reset.
        panic!(
            "Kernel fault {}: CFSR={:#010x}, MMFAR={:#010x}, BFAR={:#010x}, \
             PSP={:#010x}",
            fault_num,
            cfsr.bits(),
            scb.mmfar.read(),
            scb.bfar.read(),
            psp,
        );
    }

    #[cfg(not(feature = "processes"))]
    {
        // Thread-mode code is all privileged kernel code in this
        // configuration; a fault there is just as dead.
        panic!(
            "Thread fault {}: CFSR={:#010x}, MMFAR={:#010x}, BFAR={:#010x}, \
             PSP={:#010x}",
            fault_num,
            cfsr.bits(),
            scb.mmfar.read(),
            scb.bfar.read(),
            psp,
        );
    }

    #[cfg(feature = "processes")]
    {
        let fault_type = match fault_num {
            4 => FaultType::MemoryManagement,
            5 => FaultType::BusFault,
            6 => FaultType::UsageFault,
            _ => panic!("unexpected fault vector {fault_num}"),
        };

        // A *derived* fault (e.g. an SVC without stack for the frame)
        // leaves the original exception pending; returning to the kernel
        // half would replay it as a phantom trap. Clear the pended
        // architectural exceptions wholesale; hardware interrupts are not
        // affected.
        //
        // Safety: adjusting pend bits cannot violate memory safety.
        unsafe {
            scb.shcsr.modify(|bits| bits & !(0b1111 << 12));
        }

        let (fault, stack_invalid) = classify_fault(
            fault_type,
            cfsr,
            scb.mmfar.read(),
            scb.bfar.read(),
            psp,
        );

        // We are responsible for clearing recorded fault state;
        // write-one-to-clear.
        //
        // Safety: per above.
        unsafe {
            scb.cfsr.write(cfsr.bits());
        }

        if stack_invalid {
            // Prevent the lazy FPU state preservation from storing through
            // the known-bad stack pointer when we touch FP registers
            // below.
            const LSPACT: u32 = 1 << 0;
            // Safety: clearing LSPACT only cancels a pending lazy save.
            unsafe {
                let fpu = &*cortex_m::peripheral::FPU::PTR;
                fpu.fpccr.modify(|x| x & !LSPACT);
            }
        }

        // Now it's safe to complete the context with the FP registers, for
        // whoever debugs this process's corpse.
        //
        // Safety: `save` is valid per our contract; s16 onward is sized
        // for the vstm.
        unsafe {
            core::arch::asm!(
                "vstm {0}, {{s16-s31}}",
                in(reg) core::ptr::addr_of_mut!((*save).s16),
            );
        }

        crate::startup::with_kernel_state(|ks| {
            let me = ks.current();
            if crate::process::irq_deliver_fault(ks, me, fault) {
                // Flip to the kernel half; it observes the fault and
                // terminates the process. The kernel survives.
                let Some(t) = ks.threads.get_mut(me) else {
                    crate::fail::die(crate::fail::KernelError::Unexpected);
                };
                let ksave = &mut t.save as *mut SavedState;
                // Safety: stable table slot of the running thread.
                unsafe { set_current_ctxsave(ksave) };
                mpu_disable();
            } else {
                // A privileged kernel thread faulted in thread mode.
                panic!("kernel thread fault: {:?}", fault);
            }
        });
    }
}
