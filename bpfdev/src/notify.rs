// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Nathaniel Bennett <me[at]nathanielbennett[dotcom]>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Reader wakeups: poll readiness, async wakers and signal-driven I/O notification.

use std::task::Waker;

use bitflags::bitflags;

/// Highest signal number that may be configured for async notification.
pub const MAX_SIGNAL: i32 = 64;

/// Identity of a process issuing descriptor operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Credentials {
    /// Real user ID.
    pub uid: u32,
    /// Effective user ID.
    pub euid: u32,
}

impl Credentials {
    #[inline]
    pub const fn root() -> Self {
        Self { uid: 0, euid: 0 }
    }

    #[inline]
    pub const fn user(uid: u32) -> Self {
        Self { uid, euid: uid }
    }

    /// Whether the credentials carry superuser privileges.
    #[inline]
    pub fn is_privileged(&self) -> bool {
        self.euid == 0
    }
}

/// The recipient of async I/O signals.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SigTarget {
    Process(i32),
    ProcessGroup(i32),
}

impl SigTarget {
    /// Interprets a `TIOCSPGRP`-style owner: positive values name a process, negative values a
    /// process group, and 0 clears the owner.
    #[inline]
    pub fn from_pgid(pgid: i32) -> Option<Self> {
        match pgid {
            0 => None,
            p if p > 0 => Some(SigTarget::Process(p)),
            g => Some(SigTarget::ProcessGroup(g.checked_neg().unwrap_or(i32::MAX))),
        }
    }

    /// The `TIOCGPGRP`-style encoding of this target.
    #[inline]
    pub fn as_pgid(&self) -> i32 {
        match *self {
            SigTarget::Process(p) => p,
            SigTarget::ProcessGroup(g) => -g,
        }
    }
}

/// Everything needed to deliver an async I/O signal, captured when the owner was set.
///
/// The credentials are those of the process that armed the notification, not of whoever happens
/// to trigger delivery; they are never re-derived at delivery time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NotifyContract {
    pub target: SigTarget,
    pub signal: i32,
    pub cred: Credentials,
}

/// Delivers signals to processes. Implemented by the host's process table.
pub trait SignalSink: Send + Sync {
    /// Sends `contract.signal` to `contract.target`, subject to a permission check against
    /// `contract.cred`.
    fn deliver(&self, contract: &NotifyContract);
}

/// A [`SignalSink`] that discards every signal.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoSignals;

impl SignalSink for NoSignals {
    #[inline]
    fn deliver(&self, _contract: &NotifyContract) {}
}

bitflags! {
    /// Readiness events reported by [`Bpf::poll()`](crate::Bpf::poll).
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PollEvents: u16 {
        const IN = libc::POLLIN as u16;
        const PRI = libc::POLLPRI as u16;
        const OUT = libc::POLLOUT as u16;
        const ERR = libc::POLLERR as u16;
        const HUP = libc::POLLHUP as u16;
        const RDNORM = libc::POLLRDNORM as u16;
        const WRNORM = libc::POLLWRNORM as u16;
    }
}

impl PollEvents {
    /// Events signalling that a read would not block.
    pub const READABLE: PollEvents = PollEvents::IN.union(PollEvents::RDNORM);
    /// Events signalling that a write would not block.
    pub const WRITABLE: PollEvents = PollEvents::OUT.union(PollEvents::WRNORM);
}

/// Wakers registered by async readers and event loops waiting for readability.
#[derive(Debug, Default)]
pub(crate) struct WakerList {
    wakers: Vec<Waker>,
}

impl WakerList {
    pub fn register(&mut self, waker: &Waker) {
        if !self.wakers.iter().any(|w| w.will_wake(waker)) {
            self.wakers.push(waker.clone());
        }
    }

    /// Wakes and forgets every registered waker.
    pub fn wake_all(&mut self) {
        for waker in self.wakers.drain(..) {
            waker.wake();
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.wakers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::Wake;

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn pgid_encoding() {
        assert_eq!(SigTarget::from_pgid(0), None);
        assert_eq!(SigTarget::from_pgid(42), Some(SigTarget::Process(42)));
        assert_eq!(SigTarget::from_pgid(-7), Some(SigTarget::ProcessGroup(7)));
        assert_eq!(SigTarget::ProcessGroup(7).as_pgid(), -7);
    }

    #[test]
    fn wakers_are_deduplicated_and_consumed() {
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(counter.clone());

        let mut list = WakerList::default();
        list.register(&waker);
        list.register(&waker);
        assert_eq!(list.len(), 1);

        list.wake_all();
        list.wake_all();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn privilege() {
        assert!(Credentials::root().is_privileged());
        assert!(!Credentials::user(1000).is_privileged());
        assert!(!Credentials { uid: 0, euid: 1000 }.is_privileged());
    }
}
