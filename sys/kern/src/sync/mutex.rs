// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mutexes with priority inheritance.
//!
//! Contended locks are the classic way to invert priorities: a low-priority
//! owner holds out a high-priority waiter while middling threads hog the
//! CPU. The cure implemented here is transient promotion: whenever a thread
//! blocks on a mutex, the owner's effective priority is raised to the
//! waiter's, transitively along the chain of owners-blocked-on-mutexes, and
//! unwound as mutexes are released.
//!
//! # Invariants
//!
//! - `M.owner == Some(T)` iff `M` is on `T`'s held list.
//! - `T.mutex_waiting == Some(M)` iff `T` is in `M`'s wait heap.
//! - A thread's effective priority never falls below the strongest waiter
//!   on any mutex it holds; with no mutexes held, effective priority equals
//!   `saved_priority`.
//! - The owner/waiter graph is acyclic. A cycle means application deadlock;
//!   the inheritance walk detects it (revisit of the locking thread, or a
//!   walk longer than the thread table) and dies with `MutexDeadlock`
//!   rather than looping.
//!
//! # Locking context
//!
//! All mutex state is manipulated under the kernel-pause lock, with the
//! individual state mutations inside `with_kernel_state` (which masks
//! interrupts for their short duration). Mutexes are not usable from
//! interrupt handlers; that is what [`super::Semaphore`] is for.

use core::cell::UnsafeCell;
use core::ptr::NonNull;

use alloc::vec::Vec;

use crate::config::MAX_THREADS;
use crate::fail::{die, KernelError};
use crate::lock::PauseKernelLock;
use crate::sched;
use crate::startup::{with_kernel_state, KernelState};
use crate::thread::{self, ThreadTable};

/// A thread parked in a wait heap. The priority is a snapshot, refreshed
/// from the thread table before every ordering-sensitive operation, since
/// inheritance changes priorities underneath us.
#[derive(Copy, Clone, Debug)]
struct Waiter {
    thread: u16,
    priority: sched::Priority,
    /// Tie-break: earlier arrivals outrank later ones at equal priority.
    seq: u64,
}

fn waiter_outranks(a: &Waiter, b: &Waiter) -> bool {
    a.priority.outranks(b.priority)
        || (a.priority == b.priority && a.seq < b.seq)
}

fn sift_up(heap: &mut [Waiter], mut i: usize) {
    while i > 0 {
        let parent = (i - 1) / 2;
        if waiter_outranks(&heap[i], &heap[parent]) {
            heap.swap(i, parent);
            i = parent;
        } else {
            break;
        }
    }
}

fn sift_down(heap: &mut [Waiter], mut i: usize) {
    loop {
        let l = 2 * i + 1;
        let r = 2 * i + 2;
        let mut best = i;
        if l < heap.len() && waiter_outranks(&heap[l], &heap[best]) {
            best = l;
        }
        if r < heap.len() && waiter_outranks(&heap[r], &heap[best]) {
            best = r;
        }
        if best == i {
            break;
        }
        heap.swap(i, best);
        i = best;
    }
}

fn heap_push(heap: &mut Vec<Waiter>, w: Waiter) {
    heap.push(w);
    let last = heap.len() - 1;
    sift_up(heap, last);
}

fn heap_pop(heap: &mut Vec<Waiter>) -> Option<Waiter> {
    if heap.is_empty() {
        return None;
    }
    let last = heap.len() - 1;
    heap.swap(0, last);
    let top = heap.pop();
    sift_down(heap, 0);
    top
}

/// Reloads every waiter's priority from the table and restores the heap
/// property. Called after inheritance may have changed priorities.
fn heap_refresh(heap: &mut [Waiter], threads: &ThreadTable) {
    for w in heap.iter_mut() {
        if let Some(t) = threads.get(w.thread) {
            w.priority = t.priority();
        }
    }
    for i in (0..heap.len() / 2).rev() {
        sift_down(heap, i);
    }
}

/// The lock state proper, reached through raw pointers from thread control
/// blocks (held list, blocked-on back-pointer).
pub(crate) struct MutexState {
    owner: Option<u16>,
    /// -1 for a non-recursive mutex; 0..N extra acquisitions for a
    /// recursive one.
    depth: i32,
    waiting: Vec<Waiter>,
    next_seq: u64,
    /// Link in the owner's held-mutex list.
    next_held: Option<NonNull<MutexState>>,
}

/// Result of the first locking step.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum LockStart {
    Acquired,
    Enqueued,
}

/// Result of an unlock step.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Unlock {
    /// Caller is not the owner; nothing happened.
    NotOwner,
    /// Recursive depth decremented; still held.
    Recursed,
    /// Fully released. `hppw` reports that ownership passed to a thread
    /// that outranks the caller, so the caller should yield; `depth` is the
    /// recursion depth that was discarded (for condvar save/restore).
    Released { hppw: bool, depth: u32 },
}

/// Pushes `m` onto `owner`'s held list, capturing the pre-inheritance
/// priority if this is the first mutex held.
///
/// # Safety
///
/// `m` must point to a live `MutexState` not currently on any held list.
unsafe fn push_held(ks: &mut KernelState, owner: u16, m: NonNull<MutexState>) {
    let Some(t) = ks.threads.get_mut(owner) else {
        die(KernelError::Unexpected);
    };
    if t.mutex_held.is_none() {
        t.saved_priority = t.priority();
    }
    // Safety: per caller contract, we have the only live reference.
    unsafe {
        (*m.as_ptr()).next_held = t.mutex_held;
    }
    t.mutex_held = Some(m);
}

/// Unlinks `m` from `owner`'s held list. The mutex being absent means our
/// bookkeeping is broken, which is not survivable.
///
/// # Safety
///
/// `m` must point to a live `MutexState`.
unsafe fn remove_held(ks: &mut KernelState, owner: u16, m: NonNull<MutexState>) {
    let Some(t) = ks.threads.get_mut(owner) else {
        die(KernelError::Unexpected);
    };
    // Safety: held-list entries are live mutexes; we dereference one link
    // at a time, never holding two references to the same node.
    unsafe {
        if t.mutex_held == Some(m) {
            t.mutex_held = (*m.as_ptr()).next_held;
            (*m.as_ptr()).next_held = None;
            return;
        }
        let mut walk = t.mutex_held;
        while let Some(w) = walk {
            let next = (*w.as_ptr()).next_held;
            if next == Some(m) {
                (*w.as_ptr()).next_held = (*m.as_ptr()).next_held;
                (*m.as_ptr()).next_held = None;
                return;
            }
            walk = next;
        }
    }
    die(KernelError::Unexpected);
}

/// Recomputes `owner`'s effective priority as the maximum of its saved
/// priority and the strongest waiter on any mutex it still holds, applying
/// the change through the scheduler.
///
/// # Safety
///
/// `owner`'s held list must consist of live `MutexState`s.
unsafe fn recompute_inheritance(ks: &mut KernelState, owner: u16) {
    let Some(t) = ks.threads.get(owner) else { return };
    let mut pr = t.saved_priority;
    let mut walk = t.mutex_held;
    while let Some(w) = walk {
        // Safety: held-list entries are live; one node at a time.
        let (head, next) = unsafe {
            let ms = &mut *w.as_ptr();
            heap_refresh(&mut ms.waiting, &ks.threads);
            (ms.waiting.first().copied(), ms.next_held)
        };
        if let Some(h) = head {
            if h.priority.outranks(pr) {
                pr = h.priority;
            }
        }
        walk = next;
    }
    let current = ks.threads.get(owner).map(|t| t.priority());
    if current != Some(pr) {
        let running = ks.current();
        ks.sched.pk_set_priority(&mut ks.threads, running, owner, pr);
    }
}

/// First step of locking: take the mutex if possible, otherwise enqueue the
/// caller and propagate priority inheritance down the blocking chain.
///
/// With `to_depth`, a recursive mutex is (re)acquired at that exact depth
/// instead of depth zero / depth+1 -- the condvar re-lock path.
///
/// # Safety
///
/// `m` must point to a live `MutexState`; `me` must be the calling thread's
/// index; the kernel-pause lock must be held across the whole lock
/// operation.
pub(crate) unsafe fn pk_lock_start(
    ks: &mut KernelState,
    m: NonNull<MutexState>,
    me: u16,
    to_depth: Option<u32>,
) -> LockStart {
    // Safety: short-lived exclusive access; nothing below aliases it while
    // this reference is live.
    let (owner, my_priority) = {
        let ms = unsafe { &mut *m.as_ptr() };
        match ms.owner {
            None => {
                ms.owner = Some(me);
                if ms.depth >= 0 {
                    ms.depth = to_depth.unwrap_or(0) as i32;
                }
                // Fall through to the held-list bookkeeping below.
            }
            Some(o) if o == me => {
                if ms.depth >= 0 {
                    ms.depth = match to_depth {
                        Some(d) => d as i32,
                        None => ms.depth + 1,
                    };
                    return LockStart::Acquired;
                }
                // Relocking a non-recursive mutex you own: instant
                // deadlock, reported rather than hung.
                die(KernelError::MutexDeadlock);
            }
            Some(_) => {}
        }
        let my_priority = ks
            .threads
            .get(me)
            .map(|t| t.priority())
            .unwrap_or_else(|| die(KernelError::Unexpected));
        if ms.owner == Some(me) {
            (None, my_priority)
        } else {
            let w = Waiter {
                thread: me,
                priority: my_priority,
                seq: ms.next_seq,
            };
            ms.next_seq += 1;
            heap_push(&mut ms.waiting, w);
            (ms.owner, my_priority)
        }
    };

    let Some(owner) = owner else {
        // We took it; finish the acquisition bookkeeping.
        unsafe { push_held(ks, me, m) };
        return LockStart::Acquired;
    };

    // We are enqueued. Record what we're blocked on, then walk the chain of
    // blocked owners raising priorities.
    {
        let Some(t) = ks.threads.get_mut(me) else {
            die(KernelError::Unexpected);
        };
        if t.mutex_waiting.is_some() {
            die(KernelError::Unexpected);
        }
        t.mutex_waiting = Some(m);
    }

    let mut walk = owner;
    let mut steps = 0;
    loop {
        if walk == me || steps > MAX_THREADS {
            // The blocking chain closed on itself: application
            // deadlock.
            die(KernelError::MutexDeadlock);
        }
        steps += 1;
        let walk_priority = ks
            .threads
            .get(walk)
            .map(|t| t.priority())
            .unwrap_or_else(|| die(KernelError::Unexpected));
        if !my_priority.outranks(walk_priority) {
            // This hop is already at least as strong -- its base priority,
            // or a boost it owes waiters on some *other* mutex it holds.
            // The lock path must never lower an effective priority (that
            // is unlock's recomputation), and everything further down the
            // chain is at least this strong by the inheritance invariant,
            // so the walk is done.
            break;
        }
        let running = ks.current();
        ks.sched.pk_set_priority(
            &mut ks.threads,
            running,
            walk,
            my_priority,
        );
        let blocked_on = ks
            .threads
            .get(walk)
            .and_then(|t| t.mutex_waiting);
        match blocked_on {
            None => break,
            Some(next_m) => {
                // Safety: a thread's mutex_waiting points at a live
                // mutex distinct from any other node in the (acyclic)
                // chain; cycles die above before aliasing can occur.
                let next_owner = unsafe {
                    let ms2 = &mut *next_m.as_ptr();
                    heap_refresh(&mut ms2.waiting, &ks.threads);
                    ms2.owner
                };
                walk = next_owner
                    .unwrap_or_else(|| die(KernelError::Unexpected));
            }
        }
    }
    LockStart::Enqueued
}

/// Non-blocking lock attempt.
///
/// # Safety
///
/// As for [`pk_lock_start`].
pub(crate) unsafe fn pk_try_lock_step(
    ks: &mut KernelState,
    m: NonNull<MutexState>,
    me: u16,
) -> bool {
    let taken = {
        let ms = unsafe { &mut *m.as_ptr() };
        match ms.owner {
            None => {
                ms.owner = Some(me);
                true
            }
            Some(o) if o == me && ms.depth >= 0 => {
                ms.depth += 1;
                return true;
            }
            _ => false,
        }
    };
    if taken {
        unsafe { push_held(ks, me, m) };
    }
    taken
}

/// Releases the mutex (or one recursion level). With `all_depths`, the full
/// recursion depth is dropped at once and reported back -- the condvar
/// unlock path.
///
/// # Safety
///
/// As for [`pk_lock_start`].
pub(crate) unsafe fn pk_unlock_step(
    ks: &mut KernelState,
    m: NonNull<MutexState>,
    me: u16,
    all_depths: bool,
) -> Unlock {
    let depth = {
        let ms = unsafe { &mut *m.as_ptr() };
        if ms.owner != Some(me) {
            return Unlock::NotOwner;
        }
        if ms.depth > 0 && !all_depths {
            ms.depth -= 1;
            return Unlock::Recursed;
        }
        let d = if ms.depth > 0 { ms.depth as u32 } else { 0 };
        ms.depth = if ms.depth >= 0 { 0 } else { -1 };
        d
    };

    unsafe { remove_held(ks, me, m) };
    unsafe { recompute_inheritance(ks, me) };

    // Hand the mutex to the strongest waiter, if any.
    let handoff = {
        let ms = unsafe { &mut *m.as_ptr() };
        heap_refresh(&mut ms.waiting, &ks.threads);
        heap_pop(&mut ms.waiting)
    };
    let Some(next) = handoff else {
        let ms = unsafe { &mut *m.as_ptr() };
        ms.owner = None;
        if ms.waiting.capacity() != 0 {
            // Nobody waiting; return the queue's memory.
            ms.waiting = Vec::new();
        }
        return Unlock::Released { hppw: false, depth };
    };

    unsafe {
        (*m.as_ptr()).owner = Some(next.thread);
    }
    {
        let Some(nt) = ks.threads.get_mut(next.thread) else {
            die(KernelError::Unexpected);
        };
        if nt.mutex_waiting != Some(m) {
            die(KernelError::Unexpected);
        }
        nt.mutex_waiting = None;
    }
    thread::pk_wakeup(ks, next.thread);
    unsafe { push_held(ks, next.thread, m) };

    // The new owner inherits from whoever is still queued behind it.
    let strongest_left = {
        let ms = unsafe { &mut *m.as_ptr() };
        heap_refresh(&mut ms.waiting, &ks.threads);
        ms.waiting.first().copied()
    };
    let new_owner_priority = ks
        .threads
        .get(next.thread)
        .map(|t| t.priority())
        .unwrap_or_else(|| die(KernelError::Unexpected));
    if let Some(head) = strongest_left {
        if head.priority.outranks(new_owner_priority) {
            let running = ks.current();
            ks.sched.pk_set_priority(
                &mut ks.threads,
                running,
                next.thread,
                head.priority,
            );
        }
    }

    let my_priority = ks
        .threads
        .get(me)
        .map(|t| t.priority())
        .unwrap_or_else(|| die(KernelError::Unexpected));
    let new_owner_priority = ks
        .threads
        .get(next.thread)
        .map(|t| t.priority())
        .unwrap_or(new_owner_priority);
    Unlock::Released {
        hppw: new_owner_priority.outranks(my_priority),
        depth,
    }
}

/// Options accepted by [`Mutex::new`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Options {
    Default,
    Recursive,
}

/// A mutex with priority inheritance.
///
/// Not for interrupt handlers; lock and unlock run under the kernel-pause
/// lock so they never add interrupt latency, which also means they cannot
/// be called where the scheduler can't run.
pub struct Mutex {
    state: UnsafeCell<MutexState>,
}

// Safety: all access to the inner state happens under the kernel's locking
// discipline (pause lock + masked mutation windows), never concurrently.
unsafe impl Send for Mutex {}
unsafe impl Sync for Mutex {}

impl Mutex {
    pub const fn new(options: Options) -> Self {
        Self {
            state: UnsafeCell::new(MutexState {
                owner: None,
                depth: match options {
                    Options::Recursive => 0,
                    Options::Default => -1,
                },
                waiting: Vec::new(),
                next_seq: 0,
                next_held: None,
            }),
        }
    }

    pub(crate) fn state_ptr(&self) -> NonNull<MutexState> {
        // Safety: UnsafeCell::get never returns null.
        unsafe { NonNull::new_unchecked(self.state.get()) }
    }

    /// Locks the mutex, blocking while another thread owns it.
    pub fn lock(&self) {
        let pk = PauseKernelLock::acquire();
        self.pk_lock_to_depth_impl(&pk, None);
    }

    /// Locks without blocking; returns `true` if the mutex is now held by
    /// the caller (including one more recursion level).
    pub fn try_lock(&self) -> bool {
        let _pk = PauseKernelLock::acquire();
        with_kernel_state(|ks| {
            let me = ks.current();
            // Safety: self.state outlives the call and me is current.
            unsafe { pk_try_lock_step(ks, self.state_ptr(), me) }
        })
    }

    /// Unlocks the mutex. Returns `false` (and does nothing) if the caller
    /// is not the owner.
    pub fn unlock(&self) -> bool {
        let out = {
            let _pk = PauseKernelLock::acquire();
            with_kernel_state(|ks| {
                let me = ks.current();
                // Safety: self.state outlives the call and me is current.
                unsafe { pk_unlock_step(ks, self.state_ptr(), me, false) }
            })
        };
        match out {
            Unlock::NotOwner => false,
            Unlock::Recursed => true,
            Unlock::Released { hppw, .. } => {
                if hppw {
                    thread::yield_now();
                }
                true
            }
        }
    }

    /// Drops the full recursion depth in one go, returning it so a condvar
    /// wait can restore it on re-lock. Returns 0 if the caller is not the
    /// owner.
    pub(crate) fn pk_unlock_all_depth_levels(
        &self,
        _pk: &PauseKernelLock,
    ) -> u32 {
        let out = with_kernel_state(|ks| {
            let me = ks.current();
            // Safety: self.state outlives the call and me is current.
            unsafe { pk_unlock_step(ks, self.state_ptr(), me, true) }
        });
        match out {
            Unlock::Released { depth, .. } => depth,
            _ => 0,
        }
    }

    /// Re-locks at a saved recursion depth; the other half of the condvar
    /// protocol.
    pub(crate) fn pk_lock_to_depth(&self, pk: &PauseKernelLock, depth: u32) {
        self.pk_lock_to_depth_impl(pk, Some(depth));
    }

    fn pk_lock_to_depth_impl(
        &self,
        pk: &PauseKernelLock,
        to_depth: Option<u32>,
    ) {
        let (me, start) = with_kernel_state(|ks| {
            let me = ks.current();
            // Safety: self.state outlives the call and me is current.
            let s =
                unsafe { pk_lock_start(ks, self.state_ptr(), me, to_depth) };
            (me, s)
        });
        if start == LockStart::Acquired {
            return;
        }
        // Wait for the unlock path to hand us the mutex. The loop absorbs
        // spurious wakeups (including a termination request, which forces
        // one early return but cannot abort the acquisition).
        loop {
            let mine = with_kernel_state(|_ks| {
                // Safety: reading our own state under the state lock.
                (unsafe { (*self.state_ptr().as_ptr()).owner }) == Some(me)
            });
            if mine {
                break;
            }
            thread::pk_restart_kernel_and_wait(pk);
        }
        if let Some(d) = to_depth {
            with_kernel_state(|_ks| {
                // Safety: we own the mutex now.
                let ms = unsafe { &mut *self.state_ptr().as_ptr() };
                if ms.depth >= 0 {
                    ms.depth = d as i32;
                }
            });
        }
    }
}

impl Drop for Mutex {
    fn drop(&mut self) {
        // Dropping a mutex somebody owns or waits on would leave dangling
        // pointers in thread control blocks.
        let ms = self.state.get_mut();
        if ms.owner.is_some() || !ms.waiting.is_empty() {
            die(KernelError::Unexpected);
        }
    }
}

// The tests pick priorities numerically, which assumes the fixed-priority
// policy's key type; the mutex logic itself is policy-independent.
#[cfg(all(test, feature = "scheduler-priority"))]
mod tests {
    use super::*;
    use crate::thread::test_support::state_with_threads;

    // The tests drive the pk_* steps directly against a local kernel state,
    // standing in for threads that would otherwise block for real.

    fn prio_of(
        ks: &crate::startup::KernelState,
        idx: u16,
    ) -> sched::Priority {
        ks.threads.get(idx).unwrap().priority()
    }

    fn set_prio(ks: &mut crate::startup::KernelState, idx: u16, p: i8) {
        let running = ks.running[0];
        ks.sched.pk_set_priority(
            &mut ks.threads,
            running,
            idx,
            sched::Priority(p),
        );
        ks.threads.get_mut(idx).unwrap().saved_priority =
            sched::Priority(p);
    }

    #[test]
    fn uncontended_lock_and_unlock() {
        let mut ks = state_with_threads(1);
        let m = Mutex::new(Options::Default);
        unsafe {
            assert_eq!(
                pk_lock_start(&mut ks, m.state_ptr(), 1, None),
                LockStart::Acquired
            );
            // Holding a mutex shows up on the held list.
            assert!(ks.threads.get(1).unwrap().mutex_held.is_some());
            let out = pk_unlock_step(&mut ks, m.state_ptr(), 1, false);
            assert_eq!(
                out,
                Unlock::Released {
                    hppw: false,
                    depth: 0
                }
            );
            assert!(ks.threads.get(1).unwrap().mutex_held.is_none());
        }
    }

    #[test]
    fn unlock_by_non_owner_is_refused() {
        let mut ks = state_with_threads(2);
        let m = Mutex::new(Options::Default);
        unsafe {
            pk_lock_start(&mut ks, m.state_ptr(), 1, None);
            assert_eq!(
                pk_unlock_step(&mut ks, m.state_ptr(), 2, false),
                Unlock::NotOwner
            );
            // Still held by 1.
            assert_eq!(
                pk_unlock_step(&mut ks, m.state_ptr(), 1, false),
                Unlock::Released {
                    hppw: false,
                    depth: 0
                }
            );
        }
    }

    #[test]
    fn recursive_depth_counts() {
        let mut ks = state_with_threads(1);
        let m = Mutex::new(Options::Recursive);
        unsafe {
            pk_lock_start(&mut ks, m.state_ptr(), 1, None);
            pk_lock_start(&mut ks, m.state_ptr(), 1, None);
            pk_lock_start(&mut ks, m.state_ptr(), 1, None);
            assert_eq!(
                pk_unlock_step(&mut ks, m.state_ptr(), 1, false),
                Unlock::Recursed
            );
            assert_eq!(
                pk_unlock_step(&mut ks, m.state_ptr(), 1, false),
                Unlock::Recursed
            );
            assert!(matches!(
                pk_unlock_step(&mut ks, m.state_ptr(), 1, false),
                Unlock::Released { .. }
            ));
        }
    }

    #[test]
    #[should_panic]
    fn self_deadlock_on_non_recursive_is_fatal() {
        let mut ks = state_with_threads(1);
        // ManuallyDrop: the mutex is (by definition) still owned when the
        // panic unwinds, and Drop would turn that into an abort.
        let m = core::mem::ManuallyDrop::new(Mutex::new(Options::Default));
        unsafe {
            pk_lock_start(&mut ks, m.state_ptr(), 1, None);
            // Second lock by the owner of a non-recursive mutex.
            pk_lock_start(&mut ks, m.state_ptr(), 1, None);
        }
    }

    #[test]
    fn priority_inheritance_raises_and_restores() {
        let mut ks = state_with_threads(3);
        set_prio(&mut ks, 1, 0); // L
        set_prio(&mut ks, 2, 1); // M (unused, scenery)
        set_prio(&mut ks, 3, 2); // H
        let m = Mutex::new(Options::Default);
        unsafe {
            // L takes the mutex.
            pk_lock_start(&mut ks, m.state_ptr(), 1, None);
            assert_eq!(prio_of(&ks, 1), sched::Priority(0));

            // H blocks on it: L is promoted to H's priority.
            assert_eq!(
                pk_lock_start(&mut ks, m.state_ptr(), 3, None),
                LockStart::Enqueued
            );
            assert_eq!(prio_of(&ks, 1), sched::Priority(2));
            assert!(ks.threads.get(3).unwrap().mutex_waiting.is_some());

            // L releases: ownership passes to H, L drops back to 0, and
            // the unlock reports that we were outranked.
            let out = pk_unlock_step(&mut ks, m.state_ptr(), 1, false);
            assert_eq!(
                out,
                Unlock::Released {
                    hppw: true,
                    depth: 0
                }
            );
            assert_eq!(prio_of(&ks, 1), sched::Priority(0));
            assert_eq!(prio_of(&ks, 3), sched::Priority(2));
            assert!(ks.threads.get(3).unwrap().mutex_waiting.is_none());

            // And H can release cleanly.
            assert!(matches!(
                pk_unlock_step(&mut ks, m.state_ptr(), 3, false),
                Unlock::Released { .. }
            ));
        }
    }

    #[test]
    fn inheritance_propagates_along_a_chain() {
        let mut ks = state_with_threads(3);
        set_prio(&mut ks, 1, 0); // A
        set_prio(&mut ks, 2, 0); // B
        set_prio(&mut ks, 3, 2); // C
        let m1 = Mutex::new(Options::Default);
        let m2 = Mutex::new(Options::Default);
        unsafe {
            // A owns m1; B owns m2 and blocks on m1.
            pk_lock_start(&mut ks, m1.state_ptr(), 1, None);
            pk_lock_start(&mut ks, m2.state_ptr(), 2, None);
            assert_eq!(
                pk_lock_start(&mut ks, m1.state_ptr(), 2, None),
                LockStart::Enqueued
            );

            // C blocks on m2: the promotion must flow through B to A.
            assert_eq!(
                pk_lock_start(&mut ks, m2.state_ptr(), 3, None),
                LockStart::Enqueued
            );
            assert_eq!(prio_of(&ks, 2), sched::Priority(2));
            assert_eq!(prio_of(&ks, 1), sched::Priority(2));
        }
        // Unwind so Drop doesn't object.
        unsafe {
            pk_unlock_step(&mut ks, m1.state_ptr(), 1, false); // -> B
            pk_unlock_step(&mut ks, m1.state_ptr(), 2, false);
            pk_unlock_step(&mut ks, m2.state_ptr(), 2, false); // -> C
            pk_unlock_step(&mut ks, m2.state_ptr(), 3, false);
        }
        // Everyone is back at their base priority.
        assert_eq!(prio_of(&ks, 1), sched::Priority(0));
        assert_eq!(prio_of(&ks, 2), sched::Priority(0));
        assert_eq!(prio_of(&ks, 3), sched::Priority(2));
    }

    #[test]
    fn boost_from_another_held_mutex_is_not_lowered() {
        let mut ks = state_with_threads(4);
        set_prio(&mut ks, 1, 0); // A, owns m1 and m3
        set_prio(&mut ks, 2, 0); // B, owns m2, blocked on m1
        set_prio(&mut ks, 3, 1); // C, will block on m2
        set_prio(&mut ks, 4, 2); // D, will block on m3
        let m1 = Mutex::new(Options::Default);
        let m2 = Mutex::new(Options::Default);
        let m3 = Mutex::new(Options::Default);
        unsafe {
            pk_lock_start(&mut ks, m1.state_ptr(), 1, None);
            pk_lock_start(&mut ks, m3.state_ptr(), 1, None);
            pk_lock_start(&mut ks, m2.state_ptr(), 2, None);
            assert_eq!(
                pk_lock_start(&mut ks, m1.state_ptr(), 2, None),
                LockStart::Enqueued
            );

            // D blocks on m3: A now owes D a boost to 2.
            assert_eq!(
                pk_lock_start(&mut ks, m3.state_ptr(), 4, None),
                LockStart::Enqueued
            );
            assert_eq!(prio_of(&ks, 1), sched::Priority(2));

            // C blocks on m2: the walk raises B to C's priority, then
            // reaches A -- which is already stronger via m3 and must keep
            // that boost, not be dragged down to C's level.
            assert_eq!(
                pk_lock_start(&mut ks, m2.state_ptr(), 3, None),
                LockStart::Enqueued
            );
            assert_eq!(prio_of(&ks, 2), sched::Priority(1));
            assert_eq!(prio_of(&ks, 1), sched::Priority(2));

            // Releasing m1 hands it to B; A still holds m3, so the boost
            // it owes D survives that release too.
            pk_unlock_step(&mut ks, m1.state_ptr(), 1, false);
            assert_eq!(prio_of(&ks, 1), sched::Priority(2));

            // Only releasing m3 lets A fall back to its base.
            pk_unlock_step(&mut ks, m3.state_ptr(), 1, false); // -> D
            assert_eq!(prio_of(&ks, 1), sched::Priority(0));
            pk_unlock_step(&mut ks, m3.state_ptr(), 4, false);

            // Unwind B's side.
            pk_unlock_step(&mut ks, m1.state_ptr(), 2, false);
            assert_eq!(prio_of(&ks, 2), sched::Priority(1));
            pk_unlock_step(&mut ks, m2.state_ptr(), 2, false); // -> C
            assert_eq!(prio_of(&ks, 2), sched::Priority(0));
            pk_unlock_step(&mut ks, m2.state_ptr(), 3, false);
        }
        assert_eq!(prio_of(&ks, 3), sched::Priority(1));
        assert_eq!(prio_of(&ks, 4), sched::Priority(2));
    }

    #[test]
    #[should_panic]
    fn deadlock_cycle_is_detected() {
        let mut ks = state_with_threads(2);
        set_prio(&mut ks, 1, 0);
        set_prio(&mut ks, 2, 1);
        let m1 = Mutex::new(Options::Default);
        let m2 = Mutex::new(Options::Default);
        // Keep the states alive past the panic so Drop (which would also
        // die, masking the assertion) never runs on poisoned state.
        let m1 = core::mem::ManuallyDrop::new(m1);
        let m2 = core::mem::ManuallyDrop::new(m2);
        unsafe {
            pk_lock_start(&mut ks, m1.state_ptr(), 1, None);
            pk_lock_start(&mut ks, m2.state_ptr(), 2, None);
            // 1 blocks on m2 (owned by 2)...
            pk_lock_start(&mut ks, m2.state_ptr(), 1, None);
            // ...and 2 blocks on m1 (owned by 1): a cycle. The inheritance
            // walk must report deadlock instead of looping.
            pk_lock_start(&mut ks, m1.state_ptr(), 2, None);
        }
    }

    #[test]
    fn waiters_are_served_by_priority_then_fifo() {
        let mut ks = state_with_threads(4);
        set_prio(&mut ks, 1, 1); // owner
        set_prio(&mut ks, 2, 0);
        set_prio(&mut ks, 3, 2);
        set_prio(&mut ks, 4, 2);
        let m = Mutex::new(Options::Default);
        unsafe {
            pk_lock_start(&mut ks, m.state_ptr(), 1, None);
            // Enqueue order: 2 (low), 3 (high), 4 (high).
            pk_lock_start(&mut ks, m.state_ptr(), 2, None);
            pk_lock_start(&mut ks, m.state_ptr(), 3, None);
            pk_lock_start(&mut ks, m.state_ptr(), 4, None);

            // 3 outranks; at equal priority 3 beats 4 by arrival order;
            // 2 comes last.
            pk_unlock_step(&mut ks, m.state_ptr(), 1, false);
            assert_eq!((*m.state_ptr().as_ptr()).owner, Some(3));
            pk_unlock_step(&mut ks, m.state_ptr(), 3, false);
            assert_eq!((*m.state_ptr().as_ptr()).owner, Some(4));
            pk_unlock_step(&mut ks, m.state_ptr(), 4, false);
            assert_eq!((*m.state_ptr().as_ptr()).owner, Some(2));
            pk_unlock_step(&mut ks, m.state_ptr(), 2, false);
        }
    }

    #[test]
    fn unlock_all_depth_levels_round_trip() {
        let mut ks = state_with_threads(1);
        let m = Mutex::new(Options::Recursive);
        unsafe {
            pk_lock_start(&mut ks, m.state_ptr(), 1, None);
            pk_lock_start(&mut ks, m.state_ptr(), 1, None);
            pk_lock_start(&mut ks, m.state_ptr(), 1, None);
            // Depth is 2 (two recursive acquisitions above the first).
            let out = pk_unlock_step(&mut ks, m.state_ptr(), 1, true);
            let Unlock::Released { depth, .. } = out else {
                panic!("expected release, got {out:?}");
            };
            assert_eq!(depth, 2);
            assert_eq!((*m.state_ptr().as_ptr()).owner, None);

            // Re-lock at the saved depth, then verify it takes that many
            // unlocks to let go.
            pk_lock_start(&mut ks, m.state_ptr(), 1, Some(depth));
            assert_eq!(
                pk_unlock_step(&mut ks, m.state_ptr(), 1, false),
                Unlock::Recursed
            );
            assert_eq!(
                pk_unlock_step(&mut ks, m.state_ptr(), 1, false),
                Unlock::Recursed
            );
            assert!(matches!(
                pk_unlock_step(&mut ks, m.state_ptr(), 1, false),
                Unlock::Released { .. }
            ));
        }
    }

    #[test]
    fn try_lock_does_not_enqueue() {
        let mut ks = state_with_threads(2);
        let m = Mutex::new(Options::Default);
        unsafe {
            assert!(pk_try_lock_step(&mut ks, m.state_ptr(), 1));
            assert!(!pk_try_lock_step(&mut ks, m.state_ptr(), 2));
            // Thread 2 is not blocked on anything.
            assert!(ks.threads.get(2).unwrap().mutex_waiting.is_none());
            assert!((*m.state_ptr().as_ptr()).waiting.is_empty());
            pk_unlock_step(&mut ks, m.state_ptr(), 1, false);
        }
    }

    #[test]
    fn saved_priority_restored_after_last_of_several_mutexes() {
        let mut ks = state_with_threads(2);
        set_prio(&mut ks, 1, 0);
        set_prio(&mut ks, 2, 2);
        let m1 = Mutex::new(Options::Default);
        let m2 = Mutex::new(Options::Default);
        unsafe {
            pk_lock_start(&mut ks, m1.state_ptr(), 1, None);
            pk_lock_start(&mut ks, m2.state_ptr(), 1, None);
            // High-priority waiter on m2 promotes the owner.
            pk_lock_start(&mut ks, m2.state_ptr(), 2, None);
            assert_eq!(prio_of(&ks, 1), sched::Priority(2));

            // Releasing m1 keeps the promotion (m2 still has the waiter)...
            pk_unlock_step(&mut ks, m1.state_ptr(), 1, false);
            assert_eq!(prio_of(&ks, 1), sched::Priority(2));

            // ...releasing m2 hands it over and restores the base.
            pk_unlock_step(&mut ks, m2.state_ptr(), 1, false);
            assert_eq!(prio_of(&ks, 1), sched::Priority(0));
            pk_unlock_step(&mut ks, m2.state_ptr(), 2, false);
        }
    }
}
