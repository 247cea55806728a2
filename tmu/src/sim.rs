// SPDX-License-Identifier: MPL-2.0

//! A pure-software consumer standing in for the hardware in tests.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex,
    },
    thread,
};

use crate::{
    cmd,
    queue::LlQueue,
    regs::{QueueMem, Reg, RegisterFile},
};

const NUM_REGS: usize = 7;

fn slot(reg: Reg) -> usize {
    match reg {
        Reg::CmdProd => 0,
        Reg::CmdCons => 1,
        Reg::EvtProd => 2,
        Reg::EvtCons => 3,
        Reg::GlobalErr => 4,
        Reg::GlobalErrAck => 5,
        Reg::Cr0 => 6,
    }
}

/// Register file backed by plain atomics, recording producer doorbell
/// writes for assertions.
pub(crate) struct SimRegs {
    regs: [AtomicU32; NUM_REGS],
    prod_writes: Mutex<Vec<u32>>,
}

impl SimRegs {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            regs: Default::default(),
            prod_writes: Mutex::new(Vec::new()),
        })
    }

    /// Sets a register without recording the write.
    pub(crate) fn set(&self, reg: Reg, val: u32) {
        self.regs[slot(reg)].store(val, Ordering::SeqCst);
    }

    pub(crate) fn prod_writes(&self) -> Vec<u32> {
        self.prod_writes.lock().unwrap().clone()
    }
}

impl RegisterFile for SimRegs {
    fn read(&self, reg: Reg) -> u32 {
        self.regs[slot(reg)].load(Ordering::SeqCst)
    }

    fn write(&self, reg: Reg, val: u32) {
        if reg == Reg::CmdProd {
            self.prod_writes.lock().unwrap().push(val);
        }
        self.regs[slot(reg)].store(val, Ordering::SeqCst);
    }
}

/// Runs a consumer that drains the command queue as fast as it can,
/// acknowledging message-signaled syncs by zeroing their slots.
pub(crate) fn spawn_cmd_consumer(
    regs: Arc<SimRegs>,
    mem: Arc<QueueMem>,
    shift: u8,
    stop: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || loop {
        let mut llq = LlQueue {
            prod: regs.read(Reg::CmdProd),
            cons: regs.read(Reg::CmdCons),
            shift,
        };
        let mut progressed = false;
        while !llq.is_empty() {
            let idx = llq.idx(llq.cons) as usize;
            let dword0 = mem.load_dword(idx, 0);
            if cmd::opcode_of(dword0) == cmd::OP_SYNC
                && cmd::sync_cs_of(dword0) == cmd::SYNC_0_CS_MSI
            {
                mem.store_dword(idx, 0, 0);
            }
            llq.inc_cons();
            progressed = true;
        }
        if progressed {
            regs.write(Reg::CmdCons, llq.cons);
        }
        if stop.load(Ordering::SeqCst) && !progressed {
            break;
        }
        thread::yield_now();
    })
}
