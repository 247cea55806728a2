// SPDX-License-Identifier: MPL-2.0

//! The hardware surface: register capability, queue slot storage, and the
//! feature and global-error bit sets.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use int_to_c_enum::TryFromInt;

/// Register identifiers understood by a [`RegisterFile`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reg {
    /// Command queue producer index.
    CmdProd,
    /// Command queue consumer index; bits 30:24 carry the consumer error
    /// code.
    CmdCons,
    /// Event queue producer index.
    EvtProd,
    /// Event queue consumer index.
    EvtCons,
    /// Global error status.
    GlobalErr,
    /// Global error acknowledge.
    GlobalErrAck,
    /// Control register; bit 0 enables the device.
    Cr0,
}

/// Access to the memory-mapped register file of the device.
///
/// Reads and writes have relaxed device ordering; call sites insert the
/// barriers the queue protocol requires. Injecting this capability lets a
/// pure-software consumer stand in for the hardware.
pub trait RegisterFile: Send + Sync {
    fn read(&self, reg: Reg) -> u32;
    fn write(&self, reg: Reg, val: u32);
}

bitflags! {
    /// Capability bits reported by the device.
    pub struct Features: u32 {
        /// The consumer signals sync completion by writing back into the
        /// sync slot.
        const MSI = 1 << 0;
        /// The consumer raises an event signal when its indexes move.
        const SEV = 1 << 1;
        /// Queue memory is I/O-coherent.
        const COHERENCY = 1 << 2;
        /// Streams may stall faulting transactions and await a resume.
        const STALLS = 1 << 3;
    }
}

bitflags! {
    /// Global error bits. A bit is active while it differs from the
    /// acknowledge register.
    pub struct GlobalError: u32 {
        const CMDQ_ERR = 1 << 0;
        const EVTQ_ABT = 1 << 2;
        const MSI_CMDQ_ABT = 1 << 4;
        const MSI_EVTQ_ABT = 1 << 5;
        const MSI_GERROR_ABT = 1 << 7;
        const SFM_ERR = 1 << 8;
    }
}

/// Field of [`Reg::CmdCons`] holding the consumer error code.
pub(crate) const CONS_ERR_SHIFT: u32 = 24;
pub(crate) const CONS_ERR_MASK: u32 = 0x7f;

/// Error code the consumer reports in the command consumer register.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromInt)]
pub enum ConsError {
    None = 0,
    IllegalCommand = 1,
    FetchAbort = 2,
}

/// Once-allocated queue slot storage shared with the consumer.
///
/// Stands in for the DMA segment a real device walks. Slots are plain
/// dwords held in atomic words: producers fill exclusively reserved slots
/// with relaxed stores, and the consumer (hardware, or the software stand-in
/// used by the tests) reads them after the index protocol has published
/// them.
pub struct QueueMem {
    words: Box<[AtomicU64]>,
    ent_dwords: usize,
}

impl QueueMem {
    pub(crate) fn new(capacity: usize, ent_dwords: usize) -> Self {
        let words = (0..capacity * ent_dwords)
            .map(|_| AtomicU64::new(0))
            .collect();
        Self { words, ent_dwords }
    }

    /// Number of entry slots.
    pub fn capacity(&self) -> usize {
        self.words.len() / self.ent_dwords
    }

    /// Dwords per entry slot.
    pub fn ent_dwords(&self) -> usize {
        self.ent_dwords
    }

    pub(crate) fn write_ent(&self, idx: usize, ent: &[u64]) {
        let base = idx * self.ent_dwords;
        for (i, dword) in ent.iter().enumerate() {
            self.words[base + i].store(*dword, Ordering::Relaxed);
        }
    }

    pub(crate) fn read_ent(&self, idx: usize, ent: &mut [u64]) {
        let base = idx * self.ent_dwords;
        for (i, dword) in ent.iter_mut().enumerate() {
            *dword = self.words[base + i].load(Ordering::Relaxed);
        }
    }

    /// Reads one dword of a slot.
    pub fn load_dword(&self, idx: usize, dword: usize) -> u64 {
        self.words[idx * self.ent_dwords + dword].load(Ordering::Relaxed)
    }

    /// Overwrites one dword of a slot (the consumer-side completion
    /// write-back path).
    pub fn store_dword(&self, idx: usize, dword: usize, val: u64) {
        self.words[idx * self.ent_dwords + dword].store(val, Ordering::Relaxed);
    }
}
