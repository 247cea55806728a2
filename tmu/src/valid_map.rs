// SPDX-License-Identifier: MPL-2.0

//! Per-slot validity bitmap with wrap polarity.
//!
//! The valid bit is the inverse of the wrap bit. A zero-initialised map is
//! all-invalid; marking every slot valid completes one wrap, and the next
//! wrap makes those same bit values invalid again without an explicit
//! clear. Producers toggle exactly the bits of their reserved range, so
//! the batch owner can wait for other producers' slots without a global
//! barrier.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::{
    error::Result,
    poll::{PollPolicy, QueuePoll},
    queue::LlQueue,
};

const BITS_PER_WORD: u32 = u64::BITS;

/// Mask with bits `[lo, hi)` set. `hi` must exceed `lo`.
fn genmask(lo: u32, hi: u32) -> u64 {
    (u64::MAX >> (BITS_PER_WORD - (hi - lo))) << lo
}

pub(crate) struct ValidMap {
    words: Box<[AtomicU64]>,
    shift: u8,
}

impl ValidMap {
    pub(crate) fn new(shift: u8) -> Self {
        let capacity = 1usize << shift;
        let words = (0..capacity.div_ceil(BITS_PER_WORD as usize))
            .map(|_| AtomicU64::new(0))
            .collect();
        Self { words, shift }
    }

    /// Bits one ring wrap covers within a single word.
    fn word_bits(&self) -> u32 {
        BITS_PER_WORD.min(1 << self.shift)
    }

    /// Visits the word-aligned chunks of `[sprod, eprod)`, never crossing
    /// a wrap boundary within one chunk.
    fn walk(
        &self,
        sprod: u32,
        eprod: u32,
        mut f: impl FnMut(&AtomicU64, u64, bool) -> Result<()>,
    ) -> Result<()> {
        let mut llq = LlQueue::with_prod(self.shift, sprod);
        let bits = self.word_bits();
        let ewidx = (llq.idx(eprod) / bits) as usize;
        let ebidx = llq.idx(eprod) % bits;
        while llq.prod != eprod {
            let swidx = (llq.idx(llq.prod) / bits) as usize;
            let sbidx = llq.idx(llq.prod) % bits;
            let mut limit = bits;
            if swidx == ewidx && sbidx < ebidx {
                limit = ebidx;
            }
            let mask = genmask(sbidx, limit);
            f(&self.words[swidx], mask, llq.wrp(llq.prod) != 0)?;
            llq.prod = llq.inc_prod_n(limit - sbidx);
        }
        Ok(())
    }

    /// Marks all slots in `[sprod, eprod)` valid for their wrap.
    pub(crate) fn set_range(&self, sprod: u32, eprod: u32) {
        // The closure never fails, so neither does the walk.
        let _ = self.walk(sprod, eprod, |word, mask, _wrp| {
            word.fetch_xor(mask, Ordering::Relaxed);
            Ok(())
        });
    }

    /// Busy-polls until every slot in `[sprod, eprod)` is valid.
    pub(crate) fn poll_range(&self, sprod: u32, eprod: u32, policy: PollPolicy) -> Result<()> {
        self.walk(sprod, eprod, |word, mask, wrp| {
            let valid = if wrp { 0 } else { mask };
            let mut poll = QueuePoll::new(policy);
            while word.load(Ordering::Relaxed) & mask != valid {
                poll.poll()?;
            }
            Ok(())
        })
    }
}
