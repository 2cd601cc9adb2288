// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Nathaniel Bennett <me[at]nathanielbennett[dotcom]>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Per-listener capture state.
//!
//! Locking: a tap's listener list is acquired before a descriptor's `filters`, which is acquired
//! before `inner`, which is acquired before an interface's promiscuous count. Control operations
//! additionally hold `ctl` for their whole duration.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::task::Waker;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};

use crate::buffer::{CaptureBuffers, CatchOutcome, Timestamp};
use crate::error::{BpfError, Result};
use crate::filter::{self, FilterDirection, PacketFilter, PacketStatistics, Program};
use crate::interface::{packet_time, withdraw_promiscuous, Direction, Tap, Verdict};
use crate::notify::{
    Credentials, NotifyContract, PollEvents, SigTarget, SignalSink, WakerList, MAX_SIGNAL,
};
use crate::packet::PacketView;

/// Lifecycle state of a capture descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorState {
    /// Open but not attached to any interface.
    Open,
    /// Attached to an interface and receiving packets.
    Bound,
    /// Closed; no further operations succeed.
    Closed,
}

/// What happens to packets that a descriptor's read filter accepts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum FilterDrop {
    /// Capture the packet and let the interface process it normally.
    #[default]
    Pass = 0,
    /// Capture the packet and ask the interface to drop it.
    Capture = 1,
    /// Ask the interface to drop the packet without capturing it.
    Drop = 2,
}

impl FilterDrop {
    #[inline]
    fn from_u8(value: u8) -> Self {
        match value {
            1 => FilterDrop::Capture,
            2 => FilterDrop::Drop,
            _ => FilterDrop::Pass,
        }
    }
}

impl TryFrom<u32> for FilterDrop {
    type Error = BpfError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(FilterDrop::Pass),
            1 => Ok(FilterDrop::Capture),
            2 => Ok(FilterDrop::Drop),
            _ => Err(BpfError::InvalidArgument("unknown filter-drop mode")),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Filters {
    pub read: Option<Program>,
    pub write: Option<Program>,
}

/// Mutable descriptor state, guarded by [`Descriptor::inner`].
pub(crate) struct DescriptorInner {
    pub bound: Option<Weak<Tap>>,
    pub buffers: Option<CaptureBuffers>,
    pub bufsize: u32,
    pub promisc: bool,
    pub rtout: Option<Duration>,
    pub rd_start: Option<Instant>,
    pub nonblocking: bool,
    pub immediate: bool,
    pub hdrcmplt: bool,
    pub locked: bool,
    pub async_io: bool,
    pub signal: i32,
    pub owner: Option<(SigTarget, Credentials)>,
    pub interrupts: u64,
    pub closed: bool,
    pub wakers: WakerList,
}

impl DescriptorInner {
    #[inline]
    fn tap(&self) -> Option<Arc<Tap>> {
        self.bound.as_ref().and_then(Weak::upgrade)
    }

    #[inline]
    fn readable(&self) -> bool {
        self.buffers.as_ref().map_or(false, |b| {
            b.has_hold() || (self.immediate && b.store_len() > 0)
        })
    }

    #[inline]
    fn read_timed_out(&self) -> bool {
        match (self.rd_start, self.rtout) {
            (Some(start), Some(rtout)) => start.elapsed() >= rtout,
            _ => false,
        }
    }
}

/// A capture descriptor: one consumer of packets from one interface tap.
pub(crate) struct Descriptor {
    unit: u32,
    pub(crate) ctl: Mutex<()>,
    pub(crate) filters: RwLock<Filters>,
    pub(crate) inner: Mutex<DescriptorInner>,
    readable: Condvar,
    dirfilt: AtomicU8,
    fildrop: AtomicU8,
    received: AtomicU64,
    dropped: AtomicU64,
    captured: AtomicU64,
    signals: Arc<dyn SignalSink>,
}

impl Descriptor {
    pub fn new(unit: u32, bufsize: u32, signals: Arc<dyn SignalSink>) -> Arc<Self> {
        Arc::new(Self {
            unit,
            ctl: Mutex::new(()),
            filters: RwLock::new(Filters::default()),
            inner: Mutex::new(DescriptorInner {
                bound: None,
                buffers: None,
                bufsize,
                promisc: false,
                rtout: None,
                rd_start: None,
                nonblocking: false,
                immediate: false,
                hdrcmplt: false,
                locked: false,
                async_io: false,
                signal: libc::SIGIO,
                owner: None,
                interrupts: 0,
                closed: false,
                wakers: WakerList::default(),
            }),
            readable: Condvar::new(),
            dirfilt: AtomicU8::new(0),
            fildrop: AtomicU8::new(FilterDrop::Pass as u8),
            received: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            captured: AtomicU64::new(0),
            signals,
        })
    }

    #[inline]
    pub fn unit(&self) -> u32 {
        self.unit
    }

    pub fn state(&self) -> DescriptorState {
        let st = self.inner.lock();
        if st.closed {
            DescriptorState::Closed
        } else if st.tap().is_some() {
            DescriptorState::Bound
        } else {
            DescriptorState::Open
        }
    }

    /// The tap the descriptor is attached to, if any.
    #[inline]
    pub fn tap(&self) -> Option<Arc<Tap>> {
        self.inner.lock().tap()
    }

    // Capture path

    /// Offers one packet to this descriptor.
    pub(crate) fn tap_packet(
        &self,
        pkt: &dyn PacketView,
        wirelen: u32,
        direction: Direction,
        hdrlen: usize,
        tstamp: &mut Option<Timestamp>,
    ) -> Verdict {
        self.received.fetch_add(1, Ordering::Relaxed);
        if self.direction_filter().intersects(direction) {
            return Verdict::Pass;
        }

        let filters = self.filters.read();
        let snaplen = filter::evaluate(filters.read.as_ref(), pkt, wirelen);
        if snaplen == 0 {
            return Verdict::Pass;
        }

        let fildrop = self.filter_drop();
        let verdict = match fildrop {
            FilterDrop::Pass => Verdict::Pass,
            _ => Verdict::Drop,
        };
        if fildrop == FilterDrop::Drop {
            return verdict;
        }

        let tstamp = packet_time(tstamp);
        let contract = {
            let mut st = self.inner.lock();
            let wake_anyway = st.immediate || st.read_timed_out();
            let Some(buffers) = st.buffers.as_mut() else {
                debug_assert!(false, "listener attached without buffers");
                return verdict;
            };

            match buffers.catch(pkt, snaplen as usize, wirelen, hdrlen, tstamp) {
                CatchOutcome::Stored { rotated } => {
                    self.captured.fetch_add(1, Ordering::Relaxed);
                    if rotated || wake_anyway {
                        self.wakeup(&mut st)
                    } else {
                        None
                    }
                }
                CatchOutcome::Dropped => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    None
                }
            }
        };
        drop(filters);

        self.deliver(contract);
        verdict
    }

    /// Wakes blocked readers and registered wakers.
    ///
    /// Returns the signal to deliver, if async notification is armed. Delivery must happen after
    /// `st` is released (see [`deliver()`](Self::deliver)).
    pub(crate) fn wakeup(&self, st: &mut DescriptorInner) -> Option<NotifyContract> {
        self.readable.notify_all();
        st.wakers.wake_all();

        if !st.async_io || st.signal == 0 {
            return None;
        }

        st.owner.map(|(target, cred)| NotifyContract {
            target,
            signal: st.signal,
            cred,
        })
    }

    #[inline]
    pub(crate) fn deliver(&self, contract: Option<NotifyContract>) {
        if let Some(contract) = contract {
            self.signals.deliver(&contract);
        }
    }

    // Binding

    /// Attaches the descriptor to `tap`, detaching it from any other tap first.
    ///
    /// Buffers are allocated on the first bind. Captured data is discarded in every case. If
    /// withdrawing the promiscuous request from the previous interface fails, the descriptor is
    /// still attached to `tap` and the withdrawal error is returned.
    pub(crate) fn bind(self: &Arc<Self>, tap: &Arc<Tap>) -> Result<()> {
        {
            let mut st = self.inner.lock();
            if st.buffers.is_none() {
                log::debug!("bpf{}: allocating {} byte buffers", self.unit, st.bufsize);
                st.buffers = Some(CaptureBuffers::new(st.bufsize as usize));
            }
        }

        let current = self.tap();
        let mut withdrawn = Ok(());
        if !current.map_or(false, |t| Arc::ptr_eq(&t, tap)) {
            withdrawn = self.detach();
            tap.attach(self)?;
        }

        self.flush();
        withdrawn
    }

    /// Detaches the descriptor from its tap and withdraws its promiscuous-mode request.
    ///
    /// Detaching an unbound descriptor does nothing.
    pub(crate) fn detach(&self) -> Result<()> {
        let Some(tap) = self.tap() else {
            self.inner.lock().bound = None;
            return Ok(());
        };

        if tap.detach(self) {
            withdraw_promiscuous(tap.interface())?;
        }

        Ok(())
    }

    /// Detaches the descriptor and wakes every waiter; subsequent reads fail with `EIO`.
    pub(crate) fn close(&self) -> Result<()> {
        {
            let mut st = self.inner.lock();
            if st.closed {
                return Ok(());
            }
            st.closed = true;
        }

        let res = self.detach();
        let contract = {
            let mut st = self.inner.lock();
            self.wakeup(&mut st)
        };
        self.deliver(contract);

        log::debug!("bpf{} closed", self.unit);
        res
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    // Filters and buffers

    /// Installs (or with `None` or an empty filter, removes) a filter program and discards
    /// captured data.
    pub(crate) fn set_filter(
        &self,
        filter: Option<&PacketFilter>,
        direction: FilterDirection,
        max_insns: usize,
    ) -> Result<()> {
        let program = match filter {
            Some(f) if !f.is_empty() => Some(Program::new(f, max_insns)?),
            _ => None,
        };

        let mut filters = self.filters.write();
        log::debug!(
            "bpf{}: installing {:?} filter ({} instructions)",
            self.unit,
            direction,
            program.as_ref().map_or(0, |p| p.instructions().len())
        );
        match direction {
            FilterDirection::Read => filters.read = program,
            FilterDirection::Write => filters.write = program,
        }

        let mut st = self.inner.lock();
        self.reset(&mut st);
        Ok(())
    }

    /// Discards captured data and zeroes the packet counters.
    pub(crate) fn flush(&self) {
        let mut st = self.inner.lock();
        self.reset(&mut st);
    }

    fn reset(&self, st: &mut DescriptorInner) {
        if let Some(buffers) = st.buffers.as_mut() {
            buffers.reset();
        }
        self.received.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
        self.captured.store(0, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn buffer_len(&self) -> u32 {
        self.inner.lock().bufsize
    }

    /// Sets the size of the capture buffers. Only permitted while unbound.
    pub(crate) fn set_buffer_len(&self, len: u32) -> Result<()> {
        let mut st = self.inner.lock();
        if st.tap().is_some() {
            return Err(BpfError::InvalidArgument(
                "buffer size cannot change while attached to an interface",
            ));
        }

        if st.buffers.as_ref().map_or(false, |b| b.bufsize() != len as usize) {
            st.buffers = None;
        }
        st.bufsize = len;
        log::debug!("bpf{}: buffer size set to {}", self.unit, len);
        Ok(())
    }

    pub(crate) fn stats(&self) -> PacketStatistics {
        PacketStatistics {
            received: self.received.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            captured: self.captured.load(Ordering::Relaxed),
        }
    }

    /// Bytes immediately available to a read.
    pub(crate) fn readable_bytes(&self) -> usize {
        let st = self.inner.lock();
        st.buffers
            .as_ref()
            .map_or(0, |b| b.hold_len() + b.store_len())
    }

    // Settings

    pub(crate) fn set_promiscuous(&self, cred: Credentials) -> Result<()> {
        let Some(tap) = self.tap() else {
            return Err(BpfError::InvalidArgument("descriptor is not attached to an interface"));
        };

        if !cred.is_privileged() {
            return Err(BpfError::PermissionDenied("promiscuous mode requires privileges"));
        }

        tap.enable_promiscuous(self)
    }

    #[inline]
    pub(crate) fn is_promiscuous(&self) -> bool {
        self.inner.lock().promisc
    }

    #[inline]
    pub(crate) fn read_timeout(&self) -> Option<Duration> {
        self.inner.lock().rtout
    }

    /// Sets the read timeout; `None` or a zero duration waits forever.
    #[inline]
    pub(crate) fn set_read_timeout(&self, timeout: Option<Duration>) {
        self.inner.lock().rtout = timeout.filter(|t| !t.is_zero());
    }

    #[inline]
    pub(crate) fn set_immediate(&self, immediate: bool) {
        self.inner.lock().immediate = immediate;
    }

    #[inline]
    pub(crate) fn nonblocking(&self) -> bool {
        self.inner.lock().nonblocking
    }

    #[inline]
    pub(crate) fn set_nonblocking(&self, nonblocking: bool) {
        self.inner.lock().nonblocking = nonblocking;
    }

    #[inline]
    pub(crate) fn header_complete(&self) -> bool {
        self.inner.lock().hdrcmplt
    }

    #[inline]
    pub(crate) fn set_header_complete(&self, hdrcmplt: bool) {
        self.inner.lock().hdrcmplt = hdrcmplt;
    }

    /// Directions whose packets this descriptor ignores.
    #[inline]
    pub(crate) fn direction_filter(&self) -> Direction {
        Direction::from_bits_truncate(self.dirfilt.load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn set_direction_filter(&self, dirfilt: Direction) {
        self.dirfilt.store(dirfilt.bits(), Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn filter_drop(&self) -> FilterDrop {
        FilterDrop::from_u8(self.fildrop.load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn set_filter_drop(&self, fildrop: FilterDrop) {
        self.fildrop.store(fildrop as u8, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn is_locked(&self) -> bool {
        self.inner.lock().locked
    }

    /// Locks the descriptor against further configuration. Irreversible.
    #[inline]
    pub(crate) fn lock(&self) {
        self.inner.lock().locked = true;
    }

    #[inline]
    pub(crate) fn set_async(&self, enabled: bool) {
        self.inner.lock().async_io = enabled;
    }

    /// The signal owner in `TIOCGPGRP` encoding (0 if none).
    #[inline]
    pub(crate) fn owner(&self) -> i32 {
        self.inner.lock().owner.map_or(0, |(target, _)| target.as_pgid())
    }

    /// Arms (or with 0, disarms) signal delivery, snapshotting the caller's credentials.
    pub(crate) fn set_owner(&self, pgid: i32, cred: Credentials) {
        self.inner.lock().owner = SigTarget::from_pgid(pgid).map(|target| (target, cred));
    }

    #[inline]
    pub(crate) fn signal(&self) -> i32 {
        self.inner.lock().signal
    }

    pub(crate) fn set_signal(&self, signal: i32) -> Result<()> {
        if !(0..=MAX_SIGNAL).contains(&signal) {
            return Err(BpfError::InvalidArgument("signal number out of range"));
        }
        self.inner.lock().signal = signal;
        Ok(())
    }

    // Reading

    /// Copies the next buffer of capture records into `buf`, blocking as configured.
    ///
    /// `buf` must be exactly the descriptor's buffer size. Returns 0 when the read timeout
    /// expires without any captured data.
    pub(crate) fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut st = self.inner.lock();
        if buf.len() != st.bufsize as usize {
            return Err(BpfError::InvalidArgument(
                "read buffer length must equal the descriptor buffer size",
            ));
        }

        let started = Instant::now();
        let deadline = st.rtout.map(|t| started + t);
        st.rd_start = st.rtout.map(|_| started);
        let interrupts = st.interrupts;

        let ready = self.wait_for_hold(&mut st, deadline, interrupts);
        st.rd_start = None;
        if !ready? {
            return Ok(0);
        }

        let Some((hold, hlen)) = st.buffers.as_mut().and_then(CaptureBuffers::take_hold) else {
            return Ok(0);
        };
        drop(st);

        buf[..hlen].copy_from_slice(&hold[..hlen]);

        if let Some(buffers) = self.inner.lock().buffers.as_mut() {
            buffers.release(hold);
        }

        Ok(hlen)
    }

    /// Waits until the hold buffer holds data. Returns `false` if the read timeout expired first.
    fn wait_for_hold(
        &self,
        st: &mut MutexGuard<'_, DescriptorInner>,
        deadline: Option<Instant>,
        interrupts: u64,
    ) -> Result<bool> {
        loop {
            if st.closed {
                return Err(BpfError::Detached);
            }

            if st.buffers.as_ref().map_or(false, CaptureBuffers::has_hold) {
                return Ok(true);
            }

            if st.tap().is_none() {
                // Packets captured before the interface went away are still handed out.
                let rotated = st
                    .buffers
                    .as_mut()
                    .map_or(false, |b| b.store_len() > 0 && b.rotate());
                if rotated {
                    return Ok(true);
                }
                return Err(BpfError::Detached);
            }

            if st.interrupts != interrupts {
                return Err(BpfError::Interrupted);
            }

            let immediate = st.immediate;
            let nonblocking = st.nonblocking;
            let Some(buffers) = st.buffers.as_mut() else {
                return Err(BpfError::Detached);
            };

            if (immediate || nonblocking) && buffers.store_len() > 0 && buffers.rotate() {
                return Ok(true);
            }

            if nonblocking {
                return Err(BpfError::WouldBlock);
            }

            match deadline {
                None => self.readable.wait(st),
                Some(deadline) => {
                    if self.readable.wait_until(st, deadline).timed_out() {
                        let Some(buffers) = st.buffers.as_mut() else {
                            return Err(BpfError::Detached);
                        };

                        return Ok(buffers.has_hold()
                            || (buffers.store_len() > 0 && buffers.rotate()));
                    }
                }
            }
        }
    }

    /// Causes every read currently blocked on this descriptor to fail with `EINTR`.
    pub(crate) fn interrupt(&self) {
        let mut st = self.inner.lock();
        st.interrupts = st.interrupts.wrapping_add(1);
        self.readable.notify_all();
    }

    /// Reports which of `events` are ready.
    ///
    /// If the descriptor is not readable and a read timeout is configured, the timeout starts
    /// counting from the first poll.
    pub(crate) fn poll(&self, events: PollEvents) -> PollEvents {
        let mut st = self.inner.lock();
        let mut revents = events & PollEvents::WRITABLE;

        if events.intersects(PollEvents::READABLE) {
            if st.closed || st.tap().is_none() {
                revents |= (events & PollEvents::READABLE) | PollEvents::HUP;
            } else if st.readable() {
                revents |= events & PollEvents::READABLE;
            } else if st.rtout.is_some() && st.rd_start.is_none() {
                st.rd_start = Some(Instant::now());
            }
        }

        revents
    }

    /// Registers `waker` to be woken the next time the descriptor becomes readable.
    #[inline]
    pub(crate) fn register_waker(&self, waker: &Waker) {
        self.inner.lock().wakers.register(waker);
    }
}

impl std::fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Descriptor")
            .field("unit", &self.unit)
            .field("state", &self.state())
            .finish()
    }
}
