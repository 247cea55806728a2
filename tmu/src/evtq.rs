// SPDX-License-Identifier: MPL-2.0

//! The event queue: the consumer-side complement of the command queue.
//!
//! The hardware produces fault and stall notifications into this ring;
//! software drains it one entry at a time. Removal happens under a small
//! lock, but each entry is dispatched with the lock dropped so a slow
//! handler never blocks the queue bookkeeping. Every `capacity` entries a
//! batch counter ticks, giving [`EvtQueue::flush`] a cheap way to wait
//! for drain progress without tracking exact positions.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use int_to_c_enum::TryFromInt;
use log::error;
use spin::Mutex;

use crate::{
    error::{Error, Result},
    poll::{PollPolicy, QueuePoll},
    queue::{Queue, OVF_FLAG},
    regs::{QueueMem, Reg, RegisterFile},
};

/// Dwords per event record.
pub(crate) const EVT_ENT_DWORDS: usize = 4;

const EVT_0_CODE_MASK: u64 = 0xff;
const EVT_0_LAST: u64 = 1 << 11;
const EVT_0_SID_SHIFT: u64 = 32;
const EVT_1_STAG_MASK: u64 = 0xffff;

/// Event codes reported by the device.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromInt)]
pub enum EventCode {
    /// The stream id of a transaction is out of range or unconfigured.
    BadStreamId = 0x02,
    /// No translation exists for the faulting address.
    TranslationFault = 0x10,
    /// The translation forbids the attempted access.
    PermissionFault = 0x12,
    /// A transaction stalled and awaits a resume command.
    StallFault = 0x24,
}

/// A raw event record removed from the event queue.
#[derive(Clone, Copy, Debug)]
pub struct EvtEnt(pub [u64; EVT_ENT_DWORDS]);

impl EvtEnt {
    /// Raw event code.
    pub fn code(&self) -> u8 {
        (self.0[0] & EVT_0_CODE_MASK) as u8
    }

    /// Stream that raised the event.
    pub fn sid(&self) -> u32 {
        (self.0[0] >> EVT_0_SID_SHIFT) as u32
    }

    /// Stall tag identifying the faulted transaction group.
    pub fn stag(&self) -> u16 {
        (self.0[1] & EVT_1_STAG_MASK) as u16
    }

    /// Whether this event terminates its transaction group.
    pub fn is_last(&self) -> bool {
        self.0[0] & EVT_0_LAST != 0
    }

    #[cfg(test)]
    pub(crate) fn stall(sid: u32, stag: u16, last: bool) -> Self {
        let mut d0 = EventCode::StallFault as u64 | (u64::from(sid) << EVT_0_SID_SHIFT);
        if last {
            d0 |= EVT_0_LAST;
        }
        Self([d0, u64::from(stag), 0, 0])
    }
}

pub(crate) struct EvtQueue {
    shift: u8,
    mem: Arc<QueueMem>,
    q: Mutex<Queue>,
    /// Ticks once per `capacity` dispatched entries and once per
    /// completed drain.
    batch: AtomicU64,
    flush_poll: PollPolicy,
}

impl EvtQueue {
    pub(crate) fn new(shift: u8, regs: Arc<dyn RegisterFile>, flush_poll: PollPolicy) -> Self {
        let mem = Arc::new(QueueMem::new(1 << shift, EVT_ENT_DWORDS));
        let q = Queue::new(
            shift,
            Arc::clone(&mem),
            regs,
            Reg::EvtProd,
            Reg::EvtCons,
        );
        Self {
            shift,
            mem,
            q: Mutex::new(q),
            batch: AtomicU64::new(0),
            flush_poll,
        }
    }

    pub(crate) fn mem(&self) -> &Arc<QueueMem> {
        &self.mem
    }

    /// Drains everything currently queued, dispatching each entry with
    /// the queue lock dropped.
    ///
    /// Fails with [`Error::Overflow`] when the hardware dropped entries
    /// because software drained too slowly; whatever still sits in the
    /// ring is dispatched regardless, the dropped entries are gone.
    pub(crate) fn drain(&self, dispatch: &mut dyn FnMut(EvtEnt)) -> Result<()> {
        let capacity = 1usize << self.shift;
        let mut handled = 0usize;
        let mut overflowed = false;
        let mut q = self.q.lock();
        loop {
            let mut ent = [0u64; EVT_ENT_DWORDS];
            while q.remove_raw(&mut ent) {
                drop(q);
                dispatch(EvtEnt(ent));
                q = self.q.lock();
                handled += 1;
                if handled == capacity {
                    self.batch.fetch_add(1, Ordering::Release);
                    handled = 0;
                }
            }
            if q.sync_prod_in().is_err() {
                error!("event queue overflow; events lost");
                overflowed = true;
            }
            if q.llq.is_empty() {
                break;
            }
        }
        // Caught up: adopt the producer's overflow flag so one mismatch is
        // reported exactly once.
        q.llq.cons = (q.llq.prod & OVF_FLAG) | q.llq.wrp(q.llq.cons) | q.llq.idx(q.llq.cons);
        q.sync_cons_out();
        self.batch.fetch_add(1, Ordering::Release);
        drop(q);
        if overflowed {
            Err(Error::Overflow)
        } else {
            Ok(())
        }
    }

    /// Waits until the queue has been seen empty, or two whole batches
    /// have completed since the call began — an intentionally coarse
    /// drain-progress proxy.
    pub(crate) fn flush(&self) -> Result<()> {
        let batch = {
            let mut q = self.q.lock();
            if q.sync_prod_in().is_err() {
                error!("event queue overflow; events lost");
            }
            self.batch.load(Ordering::Acquire)
        };
        let mut poll = QueuePoll::new(self.flush_poll);
        loop {
            {
                let q = self.q.lock();
                if q.llq.is_empty() {
                    return Ok(());
                }
            }
            if self.batch.load(Ordering::Acquire) >= batch + 2 {
                return Ok(());
            }
            poll.poll()?;
        }
    }

    #[cfg(test)]
    pub(crate) fn batch(&self) -> u64 {
        self.batch.load(Ordering::Acquire)
    }
}
