// SPDX-License-Identifier: MPL-2.0

//! The device façade tying the queues, streams and error handling
//! together.

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering};

use log::{error, info, warn};

use crate::{
    cmd::{Cmd, ResumeResp},
    cmdq::CmdQueue,
    error::{Error, Result},
    evtq::{EventCode, EvtEnt, EvtQueue},
    poll::PollPolicy,
    queue::MAX_SHIFT,
    regs::{Features, GlobalError, QueueMem, Reg, RegisterFile},
    stream::{Stream, StreamTable},
};

/// Construction parameters for a [`Tmu`].
#[derive(Clone, Copy, Debug)]
pub struct Config {
    pub features: Features,
    /// Command ring capacity is `1 << cmdq_shift` slots.
    pub cmdq_shift: u8,
    /// Event ring capacity is `1 << evtq_shift` slots.
    pub evtq_shift: u8,
    pub reserve_poll: PollPolicy,
    pub sync_poll: PollPolicy,
    /// Budget for the ownership handoff wait; on expiry the wait logs and
    /// re-arms rather than giving up, since forward progress depends on
    /// the previous batch owner.
    pub owner_poll: PollPolicy,
    pub flush_poll: PollPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            features: Features::MSI | Features::SEV | Features::COHERENCY | Features::STALLS,
            cmdq_shift: 8,
            evtq_shift: 7,
            reserve_poll: PollPolicy::DEFAULT,
            sync_poll: PollPolicy::DEFAULT,
            owner_poll: PollPolicy::OWNER,
            flush_poll: PollPolicy::DEFAULT,
        }
    }
}

/// A memory-mapped translation unit's command engine.
///
/// All methods take `&self`; any number of threads may submit commands,
/// drain events and handle errors concurrently.
pub struct Tmu {
    regs: Arc<dyn RegisterFile>,
    features: Features,
    cmdq: CmdQueue,
    evtq: EvtQueue,
    streams: StreamTable,
    disabled: AtomicBool,
}

impl Tmu {
    pub fn new(regs: Arc<dyn RegisterFile>, config: Config) -> Result<Self> {
        if config.cmdq_shift == 0
            || config.cmdq_shift > MAX_SHIFT
            || config.evtq_shift == 0
            || config.evtq_shift > MAX_SHIFT
        {
            return Err(Error::Unsupported);
        }
        let cmdq = CmdQueue::new(
            config.cmdq_shift,
            config.features,
            Arc::clone(&regs),
            config.reserve_poll,
            config.sync_poll,
            config.owner_poll,
        );
        let evtq = EvtQueue::new(config.evtq_shift, Arc::clone(&regs), config.flush_poll);
        // Start both queues from a clean index state, then enable.
        regs.write(Reg::CmdProd, 0);
        regs.write(Reg::CmdCons, 0);
        regs.write(Reg::EvtProd, 0);
        regs.write(Reg::EvtCons, 0);
        regs.write(Reg::Cr0, 1);
        info!(
            "translation unit ready (cmdq {} slots, evtq {} slots, features {:?})",
            1u32 << config.cmdq_shift,
            1u32 << config.evtq_shift,
            config.features
        );
        Ok(Self {
            regs,
            features: config.features,
            cmdq,
            evtq,
            streams: StreamTable::new(),
            disabled: AtomicBool::new(false),
        })
    }

    pub fn features(&self) -> Features {
        self.features
    }

    /// Command ring storage, as the consumer sees it.
    pub fn cmd_mem(&self) -> &Arc<QueueMem> {
        self.cmdq.mem()
    }

    /// Event ring storage, as the producer sees it.
    pub fn evt_mem(&self) -> &Arc<QueueMem> {
        self.evtq.mem()
    }

    /// Submits a command batch, optionally followed by a sync barrier the
    /// call waits on.
    ///
    /// Commands the device cannot accept are rejected before anything is
    /// enqueued.
    pub fn issue(&self, cmds: &[Cmd], sync: bool) -> Result<()> {
        let mut ents = Vec::with_capacity(cmds.len());
        for cmd in cmds {
            ents.push(cmd.encode(self.features)?);
        }
        self.cmdq.issue(&ents, sync)
    }

    /// Attaches a stream so its events can be resolved.
    pub fn attach_stream(&self, sid: u32, can_stall: bool) -> Result<()> {
        if can_stall && !self.features.contains(Features::STALLS) {
            return Err(Error::Unsupported);
        }
        self.streams.attach(Stream { sid, can_stall });
        Ok(())
    }

    /// Detaches a stream, reporting whether it was attached.
    pub fn detach_stream(&self, sid: u32) -> bool {
        self.streams.detach(sid).is_some()
    }

    /// Responds to a stalled transaction group of an attached stream.
    pub fn page_response(&self, sid: u32, stag: u16, resp: ResumeResp) -> Result<()> {
        let stream = self.streams.get(sid).ok_or(Error::Unsupported)?;
        if !stream.can_stall {
            return Err(Error::Unsupported);
        }
        // Resume consumption alone terminates the stalled transaction;
        // no sync barrier is needed behind it.
        self.issue(&[Cmd::Resume { sid, stag, resp }], false)
    }

    /// Drains the event queue, resolving what can be resolved.
    pub fn drain_events(&self) -> Result<()> {
        self.evtq.drain(&mut |ent| self.handle_event(ent))
    }

    /// Waits until the events queued so far have been dispatched.
    pub fn flush_events(&self) -> Result<()> {
        self.evtq.flush()
    }

    fn handle_event(&self, ent: EvtEnt) {
        match EventCode::try_from(ent.code()) {
            Ok(EventCode::StallFault) if ent.is_last() => {
                // Nothing here resolves faults; terminate the stalled
                // group so the stream cannot wedge the device.
                if let Err(e) = self.page_response(ent.sid(), ent.stag(), ResumeResp::Abort) {
                    warn!("stall resume for stream {:#x} failed: {:?}", ent.sid(), e);
                }
            }
            Ok(code) => info!("event {:?} from stream {:#x}", code, ent.sid()),
            Err(_) => info!("unknown event {:#04x} received", ent.code()),
        }
    }

    /// Entry point for the global error interrupt.
    ///
    /// Computes the set of error bits that have not been acknowledged
    /// yet, dispatches on them, and acknowledges what was observed.
    pub fn handle_global_error(&self) {
        let gerror = self.regs.read(Reg::GlobalErr);
        let gerrorn = self.regs.read(Reg::GlobalErrAck);
        let active = GlobalError::from_bits_truncate(gerror ^ gerrorn);
        if active.is_empty() {
            return;
        }
        warn!(
            "unexpected global error reported ({:#010x}), this could be serious",
            active.bits()
        );
        if active.contains(GlobalError::SFM_ERR) {
            error!("device has entered service failure mode");
            self.disable();
        }
        if active.contains(GlobalError::MSI_GERROR_ABT) {
            warn!("global error completion write aborted");
        }
        if active.contains(GlobalError::MSI_EVTQ_ABT) {
            warn!("event queue completion write aborted");
        }
        if active.contains(GlobalError::MSI_CMDQ_ABT) {
            warn!("command queue completion write aborted");
        }
        if active.contains(GlobalError::EVTQ_ABT) {
            error!("event queue write aborted; events may have been lost");
        }
        if active.contains(GlobalError::CMDQ_ERR) {
            if let Err(e) = self.cmdq.skip_err() {
                warn!("command queue error recovery: {:?}", e);
            }
        }
        self.regs.write(Reg::GlobalErrAck, gerror);
    }

    /// Whether the device was shut down after a service failure. Only
    /// external re-initialization brings it back.
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    fn disable(&self) {
        self.regs.write(Reg::Cr0, 0);
        self.disabled.store(true, Ordering::Relaxed);
    }
}
