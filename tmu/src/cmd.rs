// SPDX-License-Identifier: MPL-2.0

//! Command encoding.
//!
//! Every command occupies one 16-byte slot: two dwords with the opcode in
//! the low byte of dword 0. Commands that the device cannot accept are
//! rejected here, before any slot is reserved.

use crate::{
    error::{Error, Result},
    regs::Features,
};

/// Dwords per command slot.
pub(crate) const CMD_ENT_DWORDS: usize = 2;

pub(crate) const CMD_0_OP_MASK: u64 = 0xff;

// Opcodes.
pub(crate) const OP_PREFETCH_CFG: u64 = 0x01;
pub(crate) const OP_CFGI_STE: u64 = 0x03;
pub(crate) const OP_CFGI_ALL: u64 = 0x04;
pub(crate) const OP_TLBI_ASID: u64 = 0x11;
pub(crate) const OP_TLBI_VA: u64 = 0x12;
pub(crate) const OP_TLBI_ALL: u64 = 0x30;
pub(crate) const OP_RESUME: u64 = 0x44;
pub(crate) const OP_SYNC: u64 = 0x46;

// Sync completion-signal field in dword 0.
pub(crate) const SYNC_0_CS_SHIFT: u64 = 12;
pub(crate) const SYNC_0_CS_MASK: u64 = 0x3;
pub(crate) const SYNC_0_CS_MSI: u64 = 1;
pub(crate) const SYNC_0_CS_SEV: u64 = 2;
const SYNC_1_MSIADDR_MASK: u64 = 0x000f_ffff_ffff_fffc;

// Per-opcode fields.
const CFGI_0_SID_SHIFT: u64 = 32;
const CFGI_1_LEAF: u64 = 1 << 0;
const CFGI_1_RANGE_MASK: u64 = 0x1f;
const TLBI_0_ASID_SHIFT: u64 = 48;
const TLBI_1_LEAF: u64 = 1 << 0;
const TLBI_1_VA_MASK: u64 = !0xfff;
const PREFETCH_0_SID_SHIFT: u64 = 32;
const PREFETCH_1_ADDR_MASK: u64 = !0xfff;
const RESUME_0_SID_SHIFT: u64 = 32;
const RESUME_0_ACTION_RETRY: u64 = 1 << 12;
const RESUME_0_ACTION_ABORT: u64 = 1 << 13;
const RESUME_1_STAG_MASK: u64 = 0xffff;

/// Response carried by a stall resume command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResumeResp {
    /// Retry the stalled transaction.
    Retry,
    /// Terminate the stalled transaction.
    Abort,
}

/// A queueable command.
#[derive(Clone, Copy, Debug)]
pub enum Cmd {
    /// Invalidate the cached configuration of one stream.
    CfgiSte { sid: u32, leaf: bool },
    /// Invalidate all cached stream configuration.
    CfgiAll,
    /// Invalidate translations of one address in an address space.
    TlbiVa { asid: u16, addr: u64, leaf: bool },
    /// Invalidate all translations of an address space.
    TlbiAsid { asid: u16 },
    /// Invalidate every cached translation.
    TlbiAll,
    /// Hint the device to prefetch a stream's configuration.
    PrefetchCfg { sid: u32, addr: u64 },
    /// Resume or terminate a stalled transaction.
    Resume { sid: u32, stag: u16, resp: ResumeResp },
}

impl Cmd {
    /// Encodes the command for a device with the given features.
    pub(crate) fn encode(&self, features: Features) -> Result<[u64; CMD_ENT_DWORDS]> {
        let mut ent = [0u64; CMD_ENT_DWORDS];
        match *self {
            Cmd::CfgiSte { sid, leaf } => {
                ent[0] |= OP_CFGI_STE | (u64::from(sid) << CFGI_0_SID_SHIFT);
                if leaf {
                    ent[1] |= CFGI_1_LEAF;
                }
            }
            Cmd::CfgiAll => {
                // Cover the entire stream id range.
                ent[0] |= OP_CFGI_ALL;
                ent[1] |= CFGI_1_RANGE_MASK & 31;
            }
            Cmd::TlbiVa { asid, addr, leaf } => {
                ent[0] |= OP_TLBI_VA | (u64::from(asid) << TLBI_0_ASID_SHIFT);
                ent[1] |= addr & TLBI_1_VA_MASK;
                if leaf {
                    ent[1] |= TLBI_1_LEAF;
                }
            }
            Cmd::TlbiAsid { asid } => {
                ent[0] |= OP_TLBI_ASID | (u64::from(asid) << TLBI_0_ASID_SHIFT);
            }
            Cmd::TlbiAll => {
                ent[0] |= OP_TLBI_ALL;
            }
            Cmd::PrefetchCfg { sid, addr } => {
                ent[0] |= OP_PREFETCH_CFG | (u64::from(sid) << PREFETCH_0_SID_SHIFT);
                ent[1] |= addr & PREFETCH_1_ADDR_MASK;
            }
            Cmd::Resume { sid, stag, resp } => {
                if !features.contains(Features::STALLS) {
                    return Err(Error::Unsupported);
                }
                ent[0] |= OP_RESUME | (u64::from(sid) << RESUME_0_SID_SHIFT);
                ent[0] |= match resp {
                    ResumeResp::Retry => RESUME_0_ACTION_RETRY,
                    ResumeResp::Abort => RESUME_0_ACTION_ABORT,
                };
                ent[1] |= u64::from(stag) & RESUME_1_STAG_MASK;
            }
        }
        Ok(ent)
    }
}

/// Builds a sync barrier slot. With `msiaddr` the consumer acknowledges by
/// writing zero to that queue offset; otherwise it raises an event signal.
pub(crate) fn sync_ent(msiaddr: Option<u64>) -> [u64; CMD_ENT_DWORDS] {
    let mut ent = [OP_SYNC, 0];
    match msiaddr {
        Some(addr) => {
            ent[0] |= SYNC_0_CS_MSI << SYNC_0_CS_SHIFT;
            ent[1] |= addr & SYNC_1_MSIADDR_MASK;
        }
        None => ent[0] |= SYNC_0_CS_SEV << SYNC_0_CS_SHIFT,
    }
    ent
}

pub(crate) fn opcode_of(dword0: u64) -> u64 {
    dword0 & CMD_0_OP_MASK
}

pub(crate) fn sync_cs_of(dword0: u64) -> u64 {
    (dword0 >> SYNC_0_CS_SHIFT) & SYNC_0_CS_MASK
}
