// SPDX-License-Identifier: MPL-2.0

//! Low-level ring index arithmetic shared by the command and event queues.
//!
//! A position is a `u32` in three parts: the low `shift` bits index into
//! the ring, the next bit is the wrap flag, and bit 31 is the overflow
//! flag the hardware sets on a producer index when it had to drop entries.
//! Keeping the wrap flag next to the index disambiguates a full queue from
//! an empty one without burning a slot.

use alloc::sync::Arc;
use core::sync::atomic::{fence, Ordering};

use crate::{
    error::{Error, Result},
    regs::{QueueMem, Reg, RegisterFile},
};

/// Producer-side overflow flag. The command queue can never overflow
/// (software produces into it), so the same bit doubles as the batch
/// "owned" flag there.
pub(crate) const OVF_FLAG: u32 = 1 << 31;

/// Largest supported ring shift; keeps the index, wrap and overflow bits
/// disjoint in a `u32`.
pub(crate) const MAX_SHIFT: u8 = 20;

/// Snapshot of one queue's producer and consumer positions.
#[derive(Clone, Copy, Debug)]
pub(crate) struct LlQueue {
    pub(crate) prod: u32,
    pub(crate) cons: u32,
    pub(crate) shift: u8,
}

impl LlQueue {
    pub(crate) fn new(shift: u8) -> Self {
        Self {
            prod: 0,
            cons: 0,
            shift,
        }
    }

    pub(crate) fn with_prod(shift: u8, prod: u32) -> Self {
        Self {
            prod,
            cons: 0,
            shift,
        }
    }

    pub(crate) fn capacity(&self) -> u32 {
        1 << self.shift
    }

    /// Ring index of a position.
    pub(crate) fn idx(&self, p: u32) -> u32 {
        p & (self.capacity() - 1)
    }

    /// Wrap flag of a position.
    pub(crate) fn wrp(&self, p: u32) -> u32 {
        p & self.capacity()
    }

    pub(crate) fn has_space(&self, n: u32) -> bool {
        let prod = self.idx(self.prod);
        let cons = self.idx(self.cons);
        let space = if self.wrp(self.prod) == self.wrp(self.cons) {
            self.capacity() - (prod - cons)
        } else {
            cons - prod
        };
        space >= n
    }

    pub(crate) fn is_full(&self) -> bool {
        self.idx(self.prod) == self.idx(self.cons) && self.wrp(self.prod) != self.wrp(self.cons)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.idx(self.prod) == self.idx(self.cons) && self.wrp(self.prod) == self.wrp(self.cons)
    }

    /// Whether the consumer has moved past `prod`.
    pub(crate) fn is_consumed(&self, prod: u32) -> bool {
        (self.wrp(self.cons) == self.wrp(prod) && self.idx(self.cons) > self.idx(prod))
            || (self.wrp(self.cons) != self.wrp(prod) && self.idx(self.cons) <= self.idx(prod))
    }

    pub(crate) fn inc_cons(&mut self) {
        let cons = (self.wrp(self.cons) | self.idx(self.cons)) + 1;
        self.cons = (self.cons & OVF_FLAG) | self.wrp(cons) | self.idx(cons);
    }

    /// Position `n` slots past the producer, preserving the overflow flag.
    pub(crate) fn inc_prod_n(&self, n: u32) -> u32 {
        let prod = (self.wrp(self.prod) | self.idx(self.prod)) + n;
        (self.prod & OVF_FLAG) | self.wrp(prod) | self.idx(prod)
    }
}

// The shared producer/consumer word packs the producer index into the low
// half and the consumer index into the high half. All views go through
// these accessors; there is no type punning.

pub(crate) fn pack(prod: u32, cons: u32) -> u64 {
    (u64::from(cons) << 32) | u64::from(prod)
}

pub(crate) fn prod_of(val: u64) -> u32 {
    val as u32
}

pub(crate) fn cons_of(val: u64) -> u32 {
    (val >> 32) as u32
}

/// A software-consumed queue: slot storage plus shadow indices, drained
/// one entry at a time.
pub(crate) struct Queue {
    pub(crate) llq: LlQueue,
    mem: Arc<QueueMem>,
    regs: Arc<dyn RegisterFile>,
    prod_reg: Reg,
    cons_reg: Reg,
}

impl Queue {
    pub(crate) fn new(
        shift: u8,
        mem: Arc<QueueMem>,
        regs: Arc<dyn RegisterFile>,
        prod_reg: Reg,
        cons_reg: Reg,
    ) -> Self {
        Self {
            llq: LlQueue::new(shift),
            mem,
            regs,
            prod_reg,
            cons_reg,
        }
    }

    /// Removes the entry at the shadow consumer index, if any.
    pub(crate) fn remove_raw(&mut self, ent: &mut [u64]) -> bool {
        if self.llq.is_empty() {
            return false;
        }
        self.mem
            .read_ent(self.llq.idx(self.llq.cons) as usize, ent);
        self.llq.inc_cons();
        self.sync_cons_out();
        true
    }

    /// Publishes the shadow consumer index to the hardware.
    pub(crate) fn sync_cons_out(&self) {
        // All queue reads must settle before the index update frees the
        // slots for reuse.
        fence(Ordering::SeqCst);
        self.regs.write(self.cons_reg, self.llq.cons);
    }

    /// Refreshes the shadow producer index from the hardware.
    ///
    /// Fails with [`Error::Overflow`] when the hardware overflow flag no
    /// longer matches the local copy, meaning entries were dropped.
    pub(crate) fn sync_prod_in(&mut self) -> Result<()> {
        let prod = self.regs.read(self.prod_reg);
        let ret = if (prod ^ self.llq.prod) & OVF_FLAG != 0 {
            Err(Error::Overflow)
        } else {
            Ok(())
        };
        self.llq.prod = prod;
        ret
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn walk(llq: &mut LlQueue, n: u32) {
        llq.prod = llq.inc_prod_n(n);
    }

    #[test]
    fn empty_and_full_are_exclusive() {
        // Walk a capacity-4 ring through two full wraps with the consumer
        // trailing by an entry; full/empty/partial must always be a
        // three-way partition.
        let mut llq = LlQueue::new(2);
        assert!(llq.is_empty());
        assert!(!llq.is_full());
        for _ in 0..8 {
            walk(&mut llq, 1);
            assert!(!llq.is_empty());
            let partial = llq.has_space(1);
            assert_ne!(partial, llq.is_full());
            llq.inc_cons();
            assert!(llq.is_empty());
            assert!(!llq.is_full());
        }
    }

    #[test]
    fn fills_at_capacity() {
        let mut llq = LlQueue::new(2);
        walk(&mut llq, 4);
        assert!(llq.is_full());
        assert!(!llq.is_empty());
        assert!(!llq.has_space(1));
        llq.inc_cons();
        assert!(llq.has_space(1));
        assert!(!llq.has_space(2));
    }

    #[test]
    fn space_accounts_for_wrap() {
        let mut llq = LlQueue::new(3);
        walk(&mut llq, 6);
        for _ in 0..6 {
            llq.inc_cons();
        }
        // prod and cons sit at index 6 on the same wrap: all 8 free.
        assert!(llq.has_space(8));
        walk(&mut llq, 5);
        // prod wrapped past the end, cons did not.
        assert!(llq.has_space(3));
        assert!(!llq.has_space(4));
    }

    #[test]
    fn consumed_tracks_wrap() {
        let mut llq = LlQueue::new(2);
        let target = llq.prod; // position 0, wrap 0
        assert!(!llq.is_consumed(target));
        llq.inc_cons();
        assert!(llq.is_consumed(target));
        // After a full consumer wrap the same index means "one lap later".
        for _ in 0..3 {
            llq.inc_cons();
        }
        assert!(llq.is_consumed(target));
    }

    #[test]
    fn prod_advance_preserves_overflow() {
        let mut llq = LlQueue::new(2);
        llq.prod |= OVF_FLAG;
        let prod = llq.inc_prod_n(5);
        assert_eq!(prod & OVF_FLAG, OVF_FLAG);
        // 5 past position 0: index 1 on the next wrap.
        assert_eq!(prod & !OVF_FLAG, 4 | 1);
    }

    #[test]
    fn packed_word_round_trip() {
        let val = pack(0x8000_0003, 0x0000_0107);
        assert_eq!(prod_of(val), 0x8000_0003);
        assert_eq!(cons_of(val), 0x0000_0107);
    }
}
