// SPDX-License-Identifier: MPL-2.0

//! The multi-producer command queue.
//!
//! One bounded ring is shared by every submitting thread and the hardware
//! consumer. Scalability comes from splitting the queue into ranges of
//! slots gathered per submitter: a submitter reserves its range with one
//! compare-and-exchange on the packed producer/consumer word, fills the
//! slots without further synchronization, and toggles the matching bits of
//! the validity bitmap. Whoever reserved while no batch head was owned
//! becomes the *owner*: it waits for the previous owner to finish, closes
//! the gathering window by clearing the owned flag, waits for every
//! gathered slot to become valid, and publishes the whole batch through
//! the producer register in one doorbell write. A submitter that appended
//! a sync barrier then waits until the consumer signals that barrier,
//! either by writing back into the sync slot or by moving its consumer
//! index past it.

use alloc::sync::Arc;
use core::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};

use log::{error, warn};

use crate::{
    cmd::{self, CMD_ENT_DWORDS},
    error::{Error, RateLimit, Result},
    lock::CmdqLock,
    poll::{PollPolicy, QueuePoll},
    queue::{cons_of, pack, prod_of, LlQueue, OVF_FLAG},
    regs::{ConsError, Features, QueueMem, Reg, RegisterFile, CONS_ERR_MASK, CONS_ERR_SHIFT},
    valid_map::ValidMap,
};

/// Marks the producer position as the head of a batch some producer
/// already owns. The command queue cannot overflow, so the overflow bit
/// is free to carry this.
const PROD_OWNED_FLAG: u32 = OVF_FLAG;

/// Timeout reports from the submission hot path share one limiter.
const TIMEOUT_LOG_INTERVAL: u32 = 32;

pub(crate) struct CmdQueue {
    shift: u8,
    features: Features,
    mem: Arc<QueueMem>,
    regs: Arc<dyn RegisterFile>,
    /// Packed producer (low half) and consumer (high half) shadow.
    llq: AtomicU64,
    /// Next position whose owner may publish; the handoff point between
    /// consecutive batch owners.
    owner_prod: AtomicU32,
    valid_map: ValidMap,
    lock: CmdqLock,
    reserve_poll: PollPolicy,
    sync_poll: PollPolicy,
    owner_poll: PollPolicy,
    timeout_rl: RateLimit,
}

impl CmdQueue {
    pub(crate) fn new(
        shift: u8,
        features: Features,
        regs: Arc<dyn RegisterFile>,
        reserve_poll: PollPolicy,
        sync_poll: PollPolicy,
        owner_poll: PollPolicy,
    ) -> Self {
        Self {
            shift,
            features,
            mem: Arc::new(QueueMem::new(1 << shift, CMD_ENT_DWORDS)),
            regs,
            llq: AtomicU64::new(0),
            owner_prod: AtomicU32::new(0),
            valid_map: ValidMap::new(shift),
            lock: CmdqLock::new(),
            reserve_poll,
            sync_poll,
            owner_poll,
            timeout_rl: RateLimit::new(TIMEOUT_LOG_INTERVAL),
        }
    }

    pub(crate) fn mem(&self) -> &Arc<QueueMem> {
        &self.mem
    }

    fn snapshot(&self) -> LlQueue {
        let val = self.llq.load(Ordering::Relaxed);
        LlQueue {
            prod: prod_of(val),
            cons: cons_of(val),
            shift: self.shift,
        }
    }

    /// Replaces the consumer half of the shadow word.
    fn store_cons(&self, cons: u32) {
        let mut cur = self.llq.load(Ordering::Relaxed);
        loop {
            match self.llq.compare_exchange_weak(
                cur,
                pack(prod_of(cur), cons),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(now) => cur = now,
            }
        }
    }

    /// Issues a batch of encoded commands, optionally followed by a sync
    /// barrier this call waits on.
    pub(crate) fn issue(&self, ents: &[[u64; CMD_ENT_DWORDS]], sync: bool) -> Result<()> {
        let n = ents.len() as u32;
        let total = n + u32::from(sync);
        if total == 0 {
            return Ok(());
        }

        // 1. Reserve space, discovering whether the batch head is already
        // owned by another producer.
        let mut poll = QueuePoll::new(self.reserve_poll);
        let mut llq = self.snapshot();
        let mut head;
        loop {
            while !llq.has_space(total) {
                if let Err(e) = self.poll_until_not_full(&mut llq, &mut poll) {
                    if self.timeout_rl.check() {
                        error!(
                            "cmdq reservation timed out (prod {:#010x}, cons {:#010x})",
                            llq.prod, llq.cons
                        );
                    }
                    return Err(e);
                }
            }
            head = llq.inc_prod_n(total) | PROD_OWNED_FLAG;
            match self.llq.compare_exchange(
                pack(llq.prod, llq.cons),
                pack(head, llq.cons),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(now) => {
                    llq.prod = prod_of(now);
                    llq.cons = cons_of(now);
                }
            }
        }
        let owner = (llq.prod & PROD_OWNED_FLAG) == 0;
        head &= !PROD_OWNED_FLAG;
        llq.prod &= !PROD_OWNED_FLAG;

        // 2. Fill the reserved slots. No synchronization is needed here;
        // nobody else may touch them until they are marked valid.
        for (i, ent) in ents.iter().enumerate() {
            let prod = llq.inc_prod_n(i as u32);
            self.mem.write_ent(llq.idx(prod) as usize, ent);
        }
        if sync {
            let sprod = llq.inc_prod_n(n);
            self.mem
                .write_ent(llq.idx(sprod) as usize, &self.build_sync(sprod));
            // A sync waiter must be able to tell two wraps apart; holding
            // the lock shared keeps the consumer shadow frozen until this
            // submitter is done waiting.
            self.lock.shared_lock();
        }

        // 3. Publish validity for exactly the reserved range, after the
        // slot contents are globally visible.
        fence(Ordering::SeqCst);
        self.valid_map.set_range(llq.prod, head);

        // 4. The owner publishes the gathered batch.
        if owner {
            // a. Wait for the previous owner to finish. Forward progress
            // here depends on that owner completing its batch; a stall is
            // reported but the wait is re-armed.
            let mut owner_poll = QueuePoll::new(self.owner_poll);
            while self.owner_prod.load(Ordering::Acquire) != llq.prod {
                if owner_poll.poll().is_err() {
                    error!("cmdq ownership handoff stalled at {:#010x}", llq.prod);
                    owner_poll = QueuePoll::new(self.owner_poll);
                }
            }
            // b. Close the gathering window; everything up to the current
            // head is now this owner's to publish.
            let cleared = self
                .llq
                .fetch_and(!u64::from(PROD_OWNED_FLAG), Ordering::Relaxed);
            let prod = prod_of(cleared) & !PROD_OWNED_FLAG;
            // c. Wait for the other producers in the batch to finish
            // filling their slots.
            while self
                .valid_map
                .poll_range(llq.prod, prod, self.owner_poll)
                .is_err()
            {
                error!("cmdq publish stalled waiting for valid slots at {:#010x}", prod);
            }
            // d. Ring the doorbell once for the whole batch.
            fence(Ordering::SeqCst);
            self.regs.write(Reg::CmdProd, prod);
            // e. Hand over to the next owner only after the hardware has
            // the new index, so it can never move backwards.
            self.owner_prod.store(prod, Ordering::Release);
        }

        // 5. Wait for the sync barrier to drain.
        if sync {
            let sprod = llq.inc_prod_n(n);
            let ret = self.poll_until_sync(&mut llq, sprod);
            if ret.is_err() && self.timeout_rl.check() {
                error!(
                    "sync timeout at {:#010x} [hwprod {:#010x}, hwcons {:#010x}]",
                    sprod,
                    self.regs.read(Reg::CmdProd),
                    self.regs.read(Reg::CmdCons)
                );
            }
            // The last waiter out publishes the consumer index it
            // observed; anyone else just drops the lock. Updating the
            // shadow only when no other waiter is live keeps a fresh
            // acquire from racing the update.
            if !self.lock.shared_tryunlock() {
                self.store_cons(llq.cons);
                self.lock.shared_unlock();
            }
            ret?;
        }
        Ok(())
    }

    /// Waits for free space, refreshing the consumer shadow from the
    /// hardware when the queue can be had exclusively.
    ///
    /// Every pass consumes poll budget, so a request that can never fit
    /// fails instead of spinning forever.
    fn poll_until_not_full(&self, llq: &mut LlQueue, poll: &mut QueuePoll) -> Result<()> {
        poll.poll()?;
        if self.lock.exclusive_trylock() {
            let cons = self.regs.read(Reg::CmdCons);
            self.store_cons(cons);
            self.lock.exclusive_unlock();
            *llq = self.snapshot();
            return Ok(());
        }
        // Somebody holds the queue; wait for them to update the shadow.
        loop {
            *llq = self.snapshot();
            if !llq.is_full() {
                return Ok(());
            }
            poll.poll()?;
        }
    }

    /// Builds this queue's sync slot for the barrier at `prod`.
    fn build_sync(&self, prod: u32) -> [u64; CMD_ENT_DWORDS] {
        let msiaddr = if self
            .features
            .contains(Features::MSI | Features::COHERENCY)
        {
            let llq = LlQueue::with_prod(self.shift, prod);
            Some(u64::from(llq.idx(prod)) * (CMD_ENT_DWORDS as u64 * 8))
        } else {
            None
        };
        cmd::sync_ent(msiaddr)
    }

    fn poll_until_sync(&self, llq: &mut LlQueue, sprod: u32) -> Result<()> {
        if self.features.contains(Features::MSI | Features::COHERENCY) {
            self.poll_until_msi(llq, sprod)
        } else {
            self.poll_until_consumed(llq, sprod)
        }
    }

    /// Waits for the consumer to clear the first dword of the sync slot.
    fn poll_until_msi(&self, llq: &mut LlQueue, sprod: u32) -> Result<()> {
        let mut poll = QueuePoll::new(self.sync_poll);
        let idx = llq.idx(sprod) as usize;
        loop {
            if self.mem.load_dword(idx, 0) == 0 {
                llq.cons = LlQueue::with_prod(self.shift, sprod).inc_prod_n(1);
                return Ok(());
            }
            if let Err(e) = poll.poll() {
                llq.cons = sprod;
                return Err(e);
            }
        }
    }

    /// Waits for the hardware consumer index to pass the sync slot.
    fn poll_until_consumed(&self, llq: &mut LlQueue, sprod: u32) -> Result<()> {
        let mut poll = QueuePoll::new(self.sync_poll);
        llq.cons = cons_of(self.llq.load(Ordering::Relaxed));
        loop {
            if llq.is_consumed(sprod) {
                return Ok(());
            }
            let ret = poll.poll();
            llq.cons = self.regs.read(Reg::CmdCons);
            ret?;
        }
    }

    /// Error-skip protocol: when the consumer reports an illegal entry,
    /// rewrite that slot in place as a sync so the queue can drain past
    /// it.
    ///
    /// The rewrite happens only with the queue held exclusively; with
    /// submitters in flight this recovery is abandoned rather than racing
    /// their slot fills.
    pub(crate) fn skip_err(&self) -> Result<()> {
        let cons = self.regs.read(Reg::CmdCons);
        let code = ConsError::try_from(((cons >> CONS_ERR_SHIFT) & CONS_ERR_MASK) as u8);
        error!("cmdq error (cons {:#010x}): {:?}", cons, code);
        match code {
            Ok(ConsError::None) => return Ok(()),
            Ok(ConsError::FetchAbort) => {
                // The consumer refetches the entry on its own.
                error!("retrying command fetch");
                return Err(Error::FetchAbort);
            }
            Ok(ConsError::IllegalCommand) | Err(_) => (),
        }
        if !self.lock.exclusive_trylock() {
            warn!("cmdq busy, leaving the faulted entry in place");
            return Err(Error::IllegalCommand);
        }
        let llq = LlQueue::with_prod(self.shift, cons);
        let idx = llq.idx(cons) as usize;
        let mut ent = [0u64; CMD_ENT_DWORDS];
        self.mem.read_ent(idx, &mut ent);
        error!(
            "skipping command in error state: {:#018x} {:#018x}",
            ent[0], ent[1]
        );
        self.mem.write_ent(idx, &cmd::sync_ent(None));
        fence(Ordering::SeqCst);
        self.lock.exclusive_unlock();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::{atomic::AtomicBool, Arc},
        thread,
    };

    use super::*;
    use crate::{
        cmd::Cmd,
        sim::{spawn_cmd_consumer, SimRegs},
    };

    const TEST_POLL: PollPolicy = PollPolicy {
        spin_count: 10,
        max_backoffs: 28,
    };
    const SHORT_POLL: PollPolicy = PollPolicy {
        spin_count: 4,
        max_backoffs: 6,
    };

    fn new_cmdq(shift: u8, features: Features, regs: Arc<SimRegs>) -> Arc<CmdQueue> {
        Arc::new(CmdQueue::new(
            shift,
            features,
            regs,
            TEST_POLL,
            TEST_POLL,
            TEST_POLL,
        ))
    }

    fn marker(id: u32) -> [u64; CMD_ENT_DWORDS] {
        Cmd::PrefetchCfg { sid: id, addr: 0 }
            .encode(Features::all())
            .unwrap()
    }

    fn marker_id(dword0: u64) -> u32 {
        (dword0 >> 32) as u32
    }

    #[test]
    fn two_sync_submitters_fill_the_ring() {
        for features in [
            Features::MSI | Features::COHERENCY | Features::SEV,
            Features::SEV,
        ] {
            let regs = SimRegs::new();
            let cmdq = new_cmdq(3, features, Arc::clone(&regs));
            let stop = Arc::new(AtomicBool::new(false));
            let consumer = spawn_cmd_consumer(
                Arc::clone(&regs),
                Arc::clone(cmdq.mem()),
                3,
                Arc::clone(&stop),
            );

            let submitters: Vec<_> = (0..2u32)
                .map(|tid| {
                    let cmdq = Arc::clone(&cmdq);
                    thread::spawn(move || {
                        let ents: Vec<_> = (0..3).map(|i| marker(tid * 8 + i)).collect();
                        cmdq.issue(&ents, true)
                    })
                })
                .collect();
            for t in submitters {
                assert_eq!(t.join().unwrap(), Ok(()));
            }
            stop.store(true, core::sync::atomic::Ordering::SeqCst);
            consumer.join().unwrap();

            // 6 commands + 2 syncs fill the capacity-8 ring exactly: the
            // producer register ends one whole wrap in.
            assert_eq!(regs.read(Reg::CmdProd), 8);
            let writes = regs.prod_writes();
            assert!(!writes.is_empty() && writes.len() <= 2);
            // Doorbell values only ever grow.
            let mut last = 0;
            for w in writes {
                assert!(w > last || last == 0);
                last = w;
            }
        }
    }

    #[test]
    fn concurrent_batches_linearize() {
        let regs = SimRegs::new();
        let cmdq = new_cmdq(5, Features::SEV, Arc::clone(&regs));

        let submitters: Vec<_> = (0..4u32)
            .map(|tid| {
                let cmdq = Arc::clone(&cmdq);
                thread::spawn(move || {
                    for batch in 0..2u32 {
                        let ents: Vec<_> =
                            (0..3u32).map(|i| marker(tid * 16 + batch * 4 + i)).collect();
                        cmdq.issue(&ents, false).unwrap();
                    }
                })
            })
            .collect();
        for t in submitters {
            t.join().unwrap();
        }

        // All 8 batches are published once every submitter has returned.
        let published = regs.read(Reg::CmdProd);
        assert_eq!(published, 24);

        // Every command appears exactly once, and each batch of three
        // occupies consecutive slots in submission order.
        let mut seen = std::collections::BTreeSet::new();
        let mem = cmdq.mem();
        let mut slot = 0;
        while slot < 24 {
            let first = marker_id(mem.load_dword(slot, 0));
            assert!(seen.insert(first));
            assert_eq!(first % 4, 0);
            for i in 1..3 {
                assert_eq!(marker_id(mem.load_dword(slot + i, 0)), first + i as u32);
            }
            slot += 3;
        }
        assert_eq!(seen.len(), 8);

        // Batching means at most one doorbell write per issue call.
        assert!(regs.prod_writes().len() <= 8);
    }

    #[test]
    fn over_capacity_reservation_times_out() {
        let regs = SimRegs::new();
        let cmdq = Arc::new(CmdQueue::new(
            2,
            Features::SEV,
            Arc::clone(&regs) as Arc<dyn RegisterFile>,
            SHORT_POLL,
            SHORT_POLL,
            SHORT_POLL,
        ));
        let ents: Vec<_> = (0..5u32).map(marker).collect();
        assert_eq!(cmdq.issue(&ents, false), Err(Error::Timeout));
        // No reservation was made and no doorbell rung.
        assert_eq!(cmdq.llq.load(Ordering::Relaxed), 0);
        assert!(regs.prod_writes().is_empty());
        assert_eq!(cmdq.owner_prod.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn sync_only_barrier() {
        let regs = SimRegs::new();
        let cmdq = new_cmdq(4, Features::MSI | Features::COHERENCY, Arc::clone(&regs));
        let stop = Arc::new(AtomicBool::new(false));
        let consumer = spawn_cmd_consumer(
            Arc::clone(&regs),
            Arc::clone(cmdq.mem()),
            4,
            Arc::clone(&stop),
        );
        assert_eq!(cmdq.issue(&[], true), Ok(()));
        stop.store(true, core::sync::atomic::Ordering::SeqCst);
        consumer.join().unwrap();
        assert_eq!(regs.read(Reg::CmdProd), 1);
    }

    #[test]
    fn empty_issue_is_a_no_op() {
        let regs = SimRegs::new();
        let cmdq = new_cmdq(4, Features::SEV, Arc::clone(&regs));
        assert_eq!(cmdq.issue(&[], false), Ok(()));
        assert_eq!(cmdq.llq.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn skip_err_rewrites_illegal_slot() {
        let regs = SimRegs::new();
        let cmdq = new_cmdq(3, Features::SEV, Arc::clone(&regs));
        // A garbage entry sits at index 2 where the consumer stopped.
        cmdq.mem().write_ent(2, &[0xbad0_0bad, 0xffff]);
        regs.set(Reg::CmdCons, (1 << CONS_ERR_SHIFT) | 2);

        assert_eq!(cmdq.skip_err(), Ok(()));
        let d0 = cmdq.mem().load_dword(2, 0);
        assert_eq!(cmd::opcode_of(d0), cmd::OP_SYNC);
        assert_eq!(cmd::sync_cs_of(d0), cmd::SYNC_0_CS_SEV);
    }

    #[test]
    fn skip_err_abandons_when_busy() {
        let regs = SimRegs::new();
        let cmdq = new_cmdq(3, Features::SEV, Arc::clone(&regs));
        cmdq.mem().write_ent(0, &[0xbad0_0bad, 0]);
        regs.set(Reg::CmdCons, 1 << CONS_ERR_SHIFT);

        cmdq.lock.shared_lock();
        assert_eq!(cmdq.skip_err(), Err(Error::IllegalCommand));
        // The slot was left alone.
        assert_eq!(cmdq.mem().load_dword(0, 0), 0xbad0_0bad);
        cmdq.lock.shared_unlock();
    }

    #[test]
    fn skip_err_other_codes() {
        let regs = SimRegs::new();
        let cmdq = new_cmdq(3, Features::SEV, Arc::clone(&regs));
        regs.set(Reg::CmdCons, 0);
        assert_eq!(cmdq.skip_err(), Ok(()));
        regs.set(Reg::CmdCons, 2 << CONS_ERR_SHIFT);
        assert_eq!(cmdq.skip_err(), Err(Error::FetchAbort));
    }
}
