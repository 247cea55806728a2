// SPDX-License-Identifier: MPL-2.0

//! Command submission core for a memory-mapped translation unit.
//!
//! The centrepiece is a bounded command ring shared by any number of
//! submitting threads and one hardware consumer. A submitter reserves its
//! slots with a single compare-and-exchange on a packed producer/consumer
//! word, fills them without further synchronization, and flags them in a
//! wrap-polarity validity bitmap. One submitter per gathered batch is
//! elected *owner* and publishes the whole batch through the producer
//! register, strictly in reservation order. An optional trailing sync
//! barrier lets a submitter wait until the consumer has drained
//! everything it queued.
//!
//! The complementary event queue drains fault and stall notifications the
//! consumer produces, with batched wakeups so callers can wait for drain
//! progress cheaply.
//!
//! Hardware is reached only through the [`RegisterFile`] capability and
//! the shared [`QueueMem`] slot storage, so a pure-software consumer can
//! stand in for the device; the tests do exactly that.

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]

extern crate alloc;

mod cmd;
mod cmdq;
mod device;
mod error;
mod evtq;
mod lock;
mod poll;
mod queue;
mod regs;
mod stream;
mod valid_map;

#[cfg(test)]
mod sim;

pub use cmd::{Cmd, ResumeResp};
pub use device::{Config, Tmu};
pub use error::{Error, Result};
pub use evtq::{EventCode, EvtEnt};
pub use poll::PollPolicy;
pub use regs::{ConsError, Features, GlobalError, QueueMem, Reg, RegisterFile};
pub use stream::Stream;
