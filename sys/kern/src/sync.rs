// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Synchronization primitives.
//!
//! Three primitives, three wait-queue disciplines:
//!
//! - [`mutex::Mutex`] -- priority queue of waiters, with priority
//!   inheritance from waiters to owner;
//! - [`condvar::CondVar`] -- FIFO, paired with a mutex;
//! - [`semaphore::Semaphore`] -- FIFO counting semaphore, the only one of
//!   the three that is safe to signal from interrupt context.

pub mod condvar;
pub mod mutex;
pub mod semaphore;

pub use condvar::CondVar;
pub use mutex::Mutex;
pub use semaphore::Semaphore;
