// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Nathaniel Bennett <me[at]nathanielbennett[dotcom]>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The open-descriptor handle and its control commands.

use std::sync::Arc;
use std::task::Waker;
use std::time::Duration;

use parking_lot::MutexGuard;

use crate::descriptor::{Descriptor, DescriptorState, FilterDrop};
use crate::dlt::LinkType;
use crate::error::{BpfError, Result};
use crate::filter::{FilterDirection, PacketFilter, PacketStatistics};
use crate::interface::{Direction, Tap};
use crate::notify::{Credentials, PollEvents};
use crate::registry::CaptureRegistry;
use crate::write;

/// Major version of the capture record format.
pub const BPF_MAJOR_VERSION: u16 = 1;
/// Minor version of the capture record format.
pub const BPF_MINOR_VERSION: u16 = 1;

/// The version of the filter language and capture record format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BpfVersion {
    pub major: u16,
    pub minor: u16,
}

/// A control command issued against an open descriptor.
#[derive(Clone, Copy, Debug)]
pub enum Ioctl<'a> {
    /// `BIOCGBLEN`
    GetBufferLen,
    /// `BIOCSBLEN`
    SetBufferLen(u32),
    /// `BIOCSETF`
    SetFilter(Option<&'a PacketFilter>),
    /// `BIOCSETWF`
    SetWriteFilter(Option<&'a PacketFilter>),
    /// `BIOCFLUSH`
    Flush,
    /// `BIOCPROMISC`
    Promiscuous,
    /// `BIOCGDLT`
    GetLinkType,
    /// `BIOCGDLTLIST`
    GetLinkTypeList,
    /// `BIOCSDLT`
    SetLinkType(LinkType),
    /// `BIOCGETIF`
    GetInterface,
    /// `BIOCSETIF`
    SetInterface(&'a str),
    /// `BIOCGRTIMEOUT`
    GetReadTimeout,
    /// `BIOCSRTIMEOUT`
    SetReadTimeout(Option<Duration>),
    /// `BIOCGSTATS`
    GetStats,
    /// `BIOCIMMEDIATE`
    Immediate(bool),
    /// `BIOCVERSION`
    Version,
    /// `BIOCGHDRCMPLT`
    GetHeaderComplete,
    /// `BIOCSHDRCMPLT`
    SetHeaderComplete(bool),
    /// `BIOCGDIRFILT`
    GetDirectionFilter,
    /// `BIOCSDIRFILT`
    SetDirectionFilter(Direction),
    /// `BIOCGFILDROP`
    GetFilterDrop,
    /// `BIOCSFILDROP`
    SetFilterDrop(FilterDrop),
    /// `BIOCLOCK`
    Lock,
    /// `FIONREAD`
    BytesReadable,
    /// `FIONBIO`
    NonBlocking(bool),
    /// `FIOASYNC`
    Async(bool),
    /// `TIOCGPGRP`
    GetOwner,
    /// `TIOCSPGRP`
    SetOwner(i32),
    /// `BIOCGRSIG`
    GetSignal,
    /// `BIOCSRSIG`
    SetSignal(i32),
}

impl Ioctl<'_> {
    /// Whether the command may be issued on a locked descriptor.
    pub fn permitted_when_locked(&self) -> bool {
        matches!(
            self,
            Ioctl::GetBufferLen
                | Ioctl::Flush
                | Ioctl::GetLinkType
                | Ioctl::GetLinkTypeList
                | Ioctl::GetInterface
                | Ioctl::GetReadTimeout
                | Ioctl::SetReadTimeout(_)
                | Ioctl::GetStats
                | Ioctl::Version
                | Ioctl::GetSignal
                | Ioctl::GetHeaderComplete
                | Ioctl::BytesReadable
                | Ioctl::Lock
                | Ioctl::Immediate(_)
                | Ioctl::GetOwner
                | Ioctl::GetDirectionFilter
                | Ioctl::NonBlocking(_)
        )
    }
}

/// The result of a successful control command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IoctlReply {
    Done,
    BufferLen(u32),
    LinkType(LinkType),
    LinkTypes(Vec<LinkType>),
    Interface(String),
    ReadTimeout(Option<Duration>),
    Stats(PacketStatistics),
    Version(BpfVersion),
    Flag(bool),
    Direction(Direction),
    FilterDrop(FilterDrop),
    Bytes(usize),
    Owner(i32),
    Signal(i32),
}

/// An open capture descriptor.
///
/// Closing happens on [`close()`](Self::close) or when the handle is dropped.
pub struct Bpf {
    registry: Arc<CaptureRegistry>,
    desc: Arc<Descriptor>,
    cred: Credentials,
}

impl Bpf {
    pub(crate) fn new(registry: Arc<CaptureRegistry>, desc: Arc<Descriptor>, cred: Credentials) -> Self {
        Self {
            registry,
            desc,
            cred,
        }
    }

    /// The unit number of the descriptor.
    #[inline]
    pub fn unit(&self) -> u32 {
        self.desc.unit()
    }

    #[inline]
    pub fn state(&self) -> DescriptorState {
        self.desc.state()
    }

    /// The credentials used for privilege checks and for arming signal delivery.
    #[inline]
    pub fn credentials(&self) -> Credentials {
        self.cred
    }

    #[inline]
    pub fn set_credentials(&mut self, cred: Credentials) {
        self.cred = cred;
    }

    /// Serializes a control command, rejecting it if the descriptor is closed or locked against
    /// it.
    fn enter(&self, cmd: &Ioctl<'_>) -> Result<MutexGuard<'_, ()>> {
        let ctl = self.desc.ctl.lock();
        if self.desc.is_closed() {
            return Err(BpfError::Detached);
        }

        if self.desc.is_locked() && !cmd.permitted_when_locked() {
            return Err(BpfError::PermissionDenied("descriptor is locked"));
        }

        Ok(ctl)
    }

    /// Issues a control command.
    pub fn ioctl(&self, cmd: Ioctl<'_>) -> Result<IoctlReply> {
        Ok(match cmd {
            Ioctl::GetBufferLen => IoctlReply::BufferLen(self.buffer_len()?),
            Ioctl::SetBufferLen(len) => IoctlReply::BufferLen(self.set_buffer_len(len)?),
            Ioctl::SetFilter(filter) => {
                self.set_filter(filter)?;
                IoctlReply::Done
            }
            Ioctl::SetWriteFilter(filter) => {
                self.set_write_filter(filter)?;
                IoctlReply::Done
            }
            Ioctl::Flush => {
                self.flush()?;
                IoctlReply::Done
            }
            Ioctl::Promiscuous => {
                self.set_promiscuous()?;
                IoctlReply::Done
            }
            Ioctl::GetLinkType => IoctlReply::LinkType(self.link_type()?),
            Ioctl::GetLinkTypeList => IoctlReply::LinkTypes(self.link_types()?),
            Ioctl::SetLinkType(dlt) => {
                self.set_link_type(dlt)?;
                IoctlReply::Done
            }
            Ioctl::GetInterface => IoctlReply::Interface(self.interface()?),
            Ioctl::SetInterface(name) => {
                self.set_interface(name)?;
                IoctlReply::Done
            }
            Ioctl::GetReadTimeout => IoctlReply::ReadTimeout(self.read_timeout()?),
            Ioctl::SetReadTimeout(timeout) => {
                self.set_read_timeout(timeout)?;
                IoctlReply::Done
            }
            Ioctl::GetStats => IoctlReply::Stats(self.stats()?),
            Ioctl::Immediate(immediate) => {
                self.set_immediate(immediate)?;
                IoctlReply::Done
            }
            Ioctl::Version => IoctlReply::Version(self.version()?),
            Ioctl::GetHeaderComplete => IoctlReply::Flag(self.header_complete()?),
            Ioctl::SetHeaderComplete(hdrcmplt) => {
                self.set_header_complete(hdrcmplt)?;
                IoctlReply::Done
            }
            Ioctl::GetDirectionFilter => IoctlReply::Direction(self.direction_filter()?),
            Ioctl::SetDirectionFilter(dirfilt) => {
                self.set_direction_filter(dirfilt)?;
                IoctlReply::Done
            }
            Ioctl::GetFilterDrop => IoctlReply::FilterDrop(self.filter_drop()?),
            Ioctl::SetFilterDrop(fildrop) => {
                self.set_filter_drop(fildrop)?;
                IoctlReply::Done
            }
            Ioctl::Lock => {
                self.lock()?;
                IoctlReply::Done
            }
            Ioctl::BytesReadable => IoctlReply::Bytes(self.readable_bytes()?),
            Ioctl::NonBlocking(nonblocking) => {
                self.set_nonblocking(nonblocking)?;
                IoctlReply::Done
            }
            Ioctl::Async(enabled) => {
                self.set_async(enabled)?;
                IoctlReply::Done
            }
            Ioctl::GetOwner => IoctlReply::Owner(self.owner()?),
            Ioctl::SetOwner(pgid) => {
                self.set_owner(pgid)?;
                IoctlReply::Done
            }
            Ioctl::GetSignal => IoctlReply::Signal(self.signal()?),
            Ioctl::SetSignal(signal) => {
                self.set_signal(signal)?;
                IoctlReply::Done
            }
        })
    }

    /// The size of the descriptor's capture buffers; reads must supply a buffer of exactly this
    /// length.
    pub fn buffer_len(&self) -> Result<u32> {
        let _ctl = self.enter(&Ioctl::GetBufferLen)?;
        Ok(self.desc.buffer_len())
    }

    /// Requests a buffer size, returning the size actually configured.
    ///
    /// The request is clamped to the registry's permitted range. The buffer size can only be
    /// changed before the descriptor is bound to an interface.
    pub fn set_buffer_len(&self, len: u32) -> Result<u32> {
        let _ctl = self.enter(&Ioctl::SetBufferLen(len))?;
        let len = self.registry.config().clamp_bufsize(len);
        self.desc.set_buffer_len(len)?;
        Ok(len)
    }

    /// Installs a read filter (or, with `None`, removes it), discarding captured packets.
    pub fn set_filter(&self, filter: Option<&PacketFilter>) -> Result<()> {
        let _ctl = self.enter(&Ioctl::SetFilter(filter))?;
        let max_insns = self.registry.config().max_insns();
        self.desc.set_filter(filter, FilterDirection::Read, max_insns)
    }

    /// Installs a filter that every written packet must fully pass.
    pub fn set_write_filter(&self, filter: Option<&PacketFilter>) -> Result<()> {
        let _ctl = self.enter(&Ioctl::SetWriteFilter(filter))?;
        let max_insns = self.registry.config().max_insns();
        self.desc.set_filter(filter, FilterDirection::Write, max_insns)
    }

    /// Discards captured packets and zeroes the packet counters.
    pub fn flush(&self) -> Result<()> {
        let _ctl = self.enter(&Ioctl::Flush)?;
        self.desc.flush();
        Ok(())
    }

    /// Places the bound interface in promiscuous mode for as long as this descriptor stays
    /// attached to it. Requires a privileged caller.
    pub fn set_promiscuous(&self) -> Result<()> {
        let _ctl = self.enter(&Ioctl::Promiscuous)?;
        self.desc.set_promiscuous(self.cred)
    }

    /// Whether this descriptor holds a promiscuous-mode request on its interface.
    #[inline]
    pub fn is_promiscuous(&self) -> bool {
        self.desc.is_promiscuous()
    }

    pub fn link_type(&self) -> Result<LinkType> {
        let _ctl = self.enter(&Ioctl::GetLinkType)?;
        Ok(self.bound_tap()?.link_type())
    }

    /// Every link type the bound interface can present packets in.
    pub fn link_types(&self) -> Result<Vec<LinkType>> {
        let _ctl = self.enter(&Ioctl::GetLinkTypeList)?;
        let tap = self.bound_tap()?;
        Ok(self.registry.link_types(tap.interface()))
    }

    /// Switches to another link type of the bound interface, discarding captured packets.
    pub fn set_link_type(&self, dlt: LinkType) -> Result<()> {
        let _ctl = self.enter(&Ioctl::SetLinkType(dlt))?;
        let tap = self.bound_tap()?;
        if tap.link_type() == dlt {
            return Ok(());
        }

        let Some(target) = self.registry.find_tap_dlt(tap.interface(), dlt) else {
            return Err(BpfError::InvalidArgument("link type not supported by interface"));
        };

        self.desc.bind(&target)
    }

    /// The name of the bound interface.
    pub fn interface(&self) -> Result<String> {
        let _ctl = self.enter(&Ioctl::GetInterface)?;
        Ok(self.bound_tap()?.interface().name().to_owned())
    }

    /// Attaches to the named interface, discarding captured packets.
    ///
    /// When the interface offers several link types, the lowest-numbered one is chosen.
    pub fn set_interface(&self, name: &str) -> Result<()> {
        let _ctl = self.enter(&Ioctl::SetInterface(name))?;
        let Some(tap) = self.registry.find_tap(name) else {
            return Err(BpfError::NoDevice("no such interface"));
        };

        self.desc.bind(&tap)
    }

    pub fn read_timeout(&self) -> Result<Option<Duration>> {
        let _ctl = self.enter(&Ioctl::GetReadTimeout)?;
        Ok(self.desc.read_timeout())
    }

    /// Limits how long a read blocks. `None` (or a zero duration) blocks indefinitely.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        let _ctl = self.enter(&Ioctl::SetReadTimeout(timeout))?;
        self.desc.set_read_timeout(timeout);
        Ok(())
    }

    pub fn stats(&self) -> Result<PacketStatistics> {
        let _ctl = self.enter(&Ioctl::GetStats)?;
        Ok(self.desc.stats())
    }

    /// Returns from reads as soon as any packet is captured rather than when a buffer fills.
    pub fn set_immediate(&self, immediate: bool) -> Result<()> {
        let _ctl = self.enter(&Ioctl::Immediate(immediate))?;
        self.desc.set_immediate(immediate);
        Ok(())
    }

    pub fn version(&self) -> Result<BpfVersion> {
        let _ctl = self.enter(&Ioctl::Version)?;
        Ok(BpfVersion {
            major: BPF_MAJOR_VERSION,
            minor: BPF_MINOR_VERSION,
        })
    }

    pub fn header_complete(&self) -> Result<bool> {
        let _ctl = self.enter(&Ioctl::GetHeaderComplete)?;
        Ok(self.desc.header_complete())
    }

    /// When set, written packets carry their own link-layer source address.
    pub fn set_header_complete(&self, hdrcmplt: bool) -> Result<()> {
        let _ctl = self.enter(&Ioctl::SetHeaderComplete(hdrcmplt))?;
        self.desc.set_header_complete(hdrcmplt);
        Ok(())
    }

    pub fn direction_filter(&self) -> Result<Direction> {
        let _ctl = self.enter(&Ioctl::GetDirectionFilter)?;
        Ok(self.desc.direction_filter())
    }

    /// Ignores packets travelling in any of the given directions.
    pub fn set_direction_filter(&self, dirfilt: Direction) -> Result<()> {
        let _ctl = self.enter(&Ioctl::SetDirectionFilter(dirfilt))?;
        self.desc.set_direction_filter(dirfilt);
        Ok(())
    }

    pub fn filter_drop(&self) -> Result<FilterDrop> {
        let _ctl = self.enter(&Ioctl::GetFilterDrop)?;
        Ok(self.desc.filter_drop())
    }

    pub fn set_filter_drop(&self, fildrop: FilterDrop) -> Result<()> {
        let _ctl = self.enter(&Ioctl::SetFilterDrop(fildrop))?;
        self.desc.set_filter_drop(fildrop);
        Ok(())
    }

    /// Locks the descriptor so that only a small set of harmless commands remain available.
    /// There is no way to unlock a descriptor.
    pub fn lock(&self) -> Result<()> {
        let _ctl = self.enter(&Ioctl::Lock)?;
        self.desc.lock();
        Ok(())
    }

    /// Bytes a read would return immediately.
    pub fn readable_bytes(&self) -> Result<usize> {
        let _ctl = self.enter(&Ioctl::BytesReadable)?;
        Ok(self.desc.readable_bytes())
    }

    #[inline]
    pub fn nonblocking(&self) -> bool {
        self.desc.nonblocking()
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        let _ctl = self.enter(&Ioctl::NonBlocking(nonblocking))?;
        self.desc.set_nonblocking(nonblocking);
        Ok(())
    }

    /// Enables signal delivery to the owner (see [`set_owner()`](Self::set_owner)) whenever
    /// captured data becomes readable.
    pub fn set_async(&self, enabled: bool) -> Result<()> {
        let _ctl = self.enter(&Ioctl::Async(enabled))?;
        self.desc.set_async(enabled);
        Ok(())
    }

    pub fn owner(&self) -> Result<i32> {
        let _ctl = self.enter(&Ioctl::GetOwner)?;
        Ok(self.desc.owner())
    }

    /// Sets the signal recipient: a process if positive, a process group if negative, nobody if
    /// zero. The handle's current credentials are recorded for later delivery.
    pub fn set_owner(&self, pgid: i32) -> Result<()> {
        let _ctl = self.enter(&Ioctl::SetOwner(pgid))?;
        self.desc.set_owner(pgid, self.cred);
        Ok(())
    }

    pub fn signal(&self) -> Result<i32> {
        let _ctl = self.enter(&Ioctl::GetSignal)?;
        Ok(self.desc.signal())
    }

    pub fn set_signal(&self, signal: i32) -> Result<()> {
        let _ctl = self.enter(&Ioctl::SetSignal(signal))?;
        self.desc.set_signal(signal)
    }

    fn bound_tap(&self) -> Result<Arc<Tap>> {
        self.desc
            .tap()
            .ok_or(BpfError::InvalidArgument("descriptor is not attached to an interface"))
    }

    // Data path

    /// Reads one buffer of capture records into `buf`, which must be exactly
    /// [`buffer_len()`](Self::buffer_len) bytes long.
    ///
    /// Returns the number of bytes of records written to the start of `buf` (0 if the read
    /// timeout expired with nothing captured). Use [`CaptureRecords`](crate::CaptureRecords) to
    /// iterate over them.
    #[inline]
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.desc.read(buf)
    }

    /// Injects one link-layer packet on the bound interface.
    pub fn write(&self, packet: &[u8]) -> Result<usize> {
        let max_packet = self.registry.config().max_packet();
        write::inject(&self.desc, packet, max_packet)
    }

    /// Reports which of `events` are ready without blocking.
    #[inline]
    pub fn poll(&self, events: PollEvents) -> PollEvents {
        self.desc.poll(events)
    }

    /// Registers a waker to be woken the next time captured data becomes available (or the
    /// descriptor is detached).
    #[inline]
    pub fn register_waker(&self, waker: &Waker) {
        self.desc.register_waker(waker)
    }

    /// Interrupts every read currently blocked on this descriptor; they fail with `EINTR`.
    #[inline]
    pub fn interrupt(&self) {
        self.desc.interrupt()
    }

    /// Detaches the descriptor and releases its unit. Closing more than once has no effect.
    pub fn close(&self) -> Result<()> {
        let _ctl = self.desc.ctl.lock();
        let res = self.desc.close();
        self.registry.release(&self.desc);
        res
    }
}

impl Drop for Bpf {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("bpf{}: error while closing: {}", self.unit(), e);
        }
    }
}

impl std::fmt::Debug for Bpf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bpf")
            .field("unit", &self.desc.unit())
            .field("state", &self.desc.state())
            .finish()
    }
}
