// SPDX-License-Identifier: MPL-2.0

//! Submission-side lock for the command queue.
//!
//! A degenerate reader/writer counter: any number of shared holders
//! (in-flight sync waiters) exclude the single exclusive holder (error
//! recovery), and nothing else. There is no fairness and no blocking
//! exclusive acquire. Shared acquisition is relaxed; call sites that need
//! ordering insert their own fences.

use core::{
    hint::spin_loop,
    sync::atomic::{AtomicI32, Ordering},
};

/// Counter state: `>= 0` is the number of shared holders; `i32::MIN`
/// marks an exclusive holder.
pub(crate) struct CmdqLock(AtomicI32);

impl CmdqLock {
    pub(crate) const fn new() -> Self {
        Self(AtomicI32::new(0))
    }

    pub(crate) fn shared_lock(&self) {
        // While held exclusively the counter sits at `i32::MIN`, so this
        // increment keeps it negative; the stray increment is discarded
        // by the store in `exclusive_unlock`.
        if self.0.fetch_add(1, Ordering::Relaxed) >= 0 {
            return;
        }
        loop {
            let mut val = self.0.load(Ordering::Relaxed);
            while val < 0 {
                spin_loop();
                val = self.0.load(Ordering::Relaxed);
            }
            if self
                .0
                .compare_exchange(val, val + 1, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    pub(crate) fn shared_unlock(&self) {
        self.0.fetch_sub(1, Ordering::Release);
    }

    /// Fails when the caller appears to be the last shared holder.
    ///
    /// The check is racy by construction; the sync epilogue in `cmdq`
    /// performs its consumer-index bookkeeping before the plain unlock
    /// whenever this returns `false`.
    pub(crate) fn shared_tryunlock(&self) -> bool {
        if self.0.load(Ordering::Relaxed) == 1 {
            return false;
        }
        self.shared_unlock();
        true
    }

    /// Succeeds only when no holder of either kind is present.
    pub(crate) fn exclusive_trylock(&self) -> bool {
        self.0
            .compare_exchange(0, i32::MIN, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub(crate) fn exclusive_unlock(&self) {
        self.0.store(0, Ordering::Release);
    }
}
