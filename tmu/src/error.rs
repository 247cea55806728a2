// SPDX-License-Identifier: MPL-2.0

//! Error definitions shared by the command and event paths.

use core::sync::atomic::{AtomicU32, Ordering};

/// Errors surfaced by queue operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// A bounded poll expired before the consumer made progress.
    ///
    /// Retryable; the reservation or barrier it interrupted is not rolled
    /// back.
    Timeout,
    /// The hardware overflowed a queue; the affected entries are lost.
    Overflow,
    /// The consumer rejected a malformed queue entry.
    IllegalCommand,
    /// The consumer could not fetch queue memory.
    FetchAbort,
    /// The request needs a capability this device does not have.
    Unsupported,
}

pub type Result<T> = core::result::Result<T, Error>;

/// Counting limiter for messages emitted from polling paths.
///
/// One message is allowed per window of `interval` calls, starting with
/// the first.
pub(crate) struct RateLimit {
    interval: u32,
    count: AtomicU32,
}

impl RateLimit {
    pub(crate) const fn new(interval: u32) -> Self {
        Self {
            interval,
            count: AtomicU32::new(0),
        }
    }

    /// Returns whether the caller may emit its message.
    pub(crate) fn check(&self) -> bool {
        self.count.fetch_add(1, Ordering::Relaxed) % self.interval == 0
    }
}
