// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Nathaniel Bennett <me[at]nathanielbennett[dotcom]>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Network interfaces and the capture taps attached to them.
//!
//! A network driver exposes each interface as a [`NetInterface`] and registers one or more
//! [`Tap`]s for it (one per link-layer encapsulation it can present packets in). For every
//! packet it sends or receives, the driver checks the tap's [`TapCookie`]: when no descriptor is
//! listening the cookie is empty and the driver skips the capture path entirely, otherwise it
//! hands the packet to [`Tap::mtap()`] and honours the returned [`Verdict`].
//!
//! ```ignore
//! if let Some(tap) = cookie.load() {
//!     if tap.mtap(&ContiguousPacket::new(&frame), Direction::IN) == Verdict::Drop {
//!         return; // consumed by the capture path
//!     }
//! }
//! ```

use std::io;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use bitflags::bitflags;
use parking_lot::{Mutex, RwLock};

use crate::buffer::{capture_hdrlen, Timestamp};
use crate::descriptor::{Descriptor, DescriptorInner};
use crate::dlt::{AddressFamily, LinkType, ETHER_ADDR_LEN};
use crate::error::{BpfError, Result};
use crate::packet::{PacketView, SegmentedPacket};

bitflags! {
    /// Direction of a packet relative to the interface it was observed on.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Direction: u8 {
        /// Received by the interface.
        const IN = 1;
        /// Sent by the interface.
        const OUT = 2;
    }
}

bitflags! {
    /// Administrative state of a network interface.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct InterfaceFlags: u32 {
        const UP = 0x1;
        const LOOPBACK = 0x8;
        const RUNNING = 0x40;
        const PROMISC = 0x100;
    }
}

/// What a driver must do with a packet after offering it to the capture path.
#[must_use]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Continue processing the packet normally.
    Pass,
    /// A descriptor with filter-drop enabled matched the packet; the driver must not deliver it
    /// further up the network stack.
    Drop,
}

/// A packet injected through a capture descriptor, handed to the driver for transmission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundPacket {
    /// How the driver should interpret `link_header`.
    pub family: AddressFamily,
    /// Link-layer addressing supplied by the writer (empty for headerless link types).
    pub link_header: Vec<u8>,
    /// The packet body following the link header.
    pub payload: Vec<u8>,
}

/// Hooks a network driver provides to the capture subsystem.
pub trait LinkDriver: Send + Sync {
    /// Transmits an injected packet on `ifp`.
    fn output(&self, ifp: &NetInterface, pkt: OutboundPacket) -> io::Result<()>;

    /// Switches the hardware in or out of promiscuous mode.
    #[inline]
    fn set_promiscuous(&self, _ifp: &NetInterface, _on: bool) -> io::Result<()> {
        Ok(())
    }
}

/// A network interface as seen by the capture subsystem.
pub struct NetInterface {
    name: String,
    lladdr: [u8; ETHER_ADDR_LEN],
    mtu: AtomicU32,
    flags: AtomicU32,
    pcount: Mutex<u32>,
    driver: Arc<dyn LinkDriver>,
}

impl NetInterface {
    /// Creates an interface that is administratively up, with an MTU of 1500.
    pub fn new(name: &str, driver: Arc<dyn LinkDriver>) -> Self {
        Self {
            name: name.to_owned(),
            lladdr: [0; ETHER_ADDR_LEN],
            mtu: AtomicU32::new(1500),
            flags: AtomicU32::new((InterfaceFlags::UP | InterfaceFlags::RUNNING).bits()),
            pcount: Mutex::new(0),
            driver,
        }
    }

    #[inline]
    pub fn with_lladdr(mut self, lladdr: [u8; ETHER_ADDR_LEN]) -> Self {
        self.lladdr = lladdr;
        self
    }

    #[inline]
    pub fn with_mtu(self, mtu: u32) -> Self {
        self.mtu.store(mtu, Ordering::Relaxed);
        self
    }

    #[inline]
    pub fn with_flags(self, flags: InterfaceFlags) -> Self {
        self.flags.store(flags.bits(), Ordering::Relaxed);
        self
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The hardware address used as the source of injected Ethernet frames.
    #[inline]
    pub fn lladdr(&self) -> [u8; ETHER_ADDR_LEN] {
        self.lladdr
    }

    #[inline]
    pub fn mtu(&self) -> usize {
        self.mtu.load(Ordering::Relaxed) as usize
    }

    #[inline]
    pub fn set_mtu(&self, mtu: u32) {
        self.mtu.store(mtu, Ordering::Relaxed);
    }

    #[inline]
    pub fn flags(&self) -> InterfaceFlags {
        InterfaceFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_up(&self) -> bool {
        self.flags().contains(InterfaceFlags::UP)
    }

    /// Brings the interface administratively up or down.
    ///
    /// Bringing an interface up re-applies promiscuous mode if any descriptor still requests it.
    pub fn set_up(&self, up: bool) -> io::Result<()> {
        let pcount = self.pcount.lock();
        if up {
            self.flags.fetch_or(InterfaceFlags::UP.bits(), Ordering::AcqRel);
            if *pcount > 0 {
                self.driver.set_promiscuous(self, true)?;
            }
        } else {
            self.flags.fetch_and(!InterfaceFlags::UP.bits(), Ordering::AcqRel);
        }
        Ok(())
    }

    #[inline]
    pub fn is_promiscuous(&self) -> bool {
        self.flags().contains(InterfaceFlags::PROMISC)
    }

    /// The number of outstanding promiscuous-mode requests.
    #[inline]
    pub fn promiscuity(&self) -> u32 {
        *self.pcount.lock()
    }

    #[inline]
    pub fn driver(&self) -> &Arc<dyn LinkDriver> {
        &self.driver
    }

    /// Adds or removes one promiscuous-mode request.
    ///
    /// The hardware is only reconfigured on the first request and after the last one is removed,
    /// and only while the interface is up. A failed enable leaves the request count unchanged.
    pub fn set_promiscuous(&self, on: bool) -> io::Result<()> {
        let mut pcount = self.pcount.lock();
        if on {
            *pcount += 1;
            if *pcount > 1 {
                return Ok(());
            }
            self.flags.fetch_or(InterfaceFlags::PROMISC.bits(), Ordering::AcqRel);
        } else {
            if *pcount == 0 {
                return Err(io::Error::from_raw_os_error(libc::EINVAL));
            }
            *pcount -= 1;
            if *pcount > 0 {
                return Ok(());
            }
            self.flags.fetch_and(!InterfaceFlags::PROMISC.bits(), Ordering::AcqRel);
        }

        if !self.is_up() {
            return Ok(());
        }

        let res = self.driver.set_promiscuous(self, on);
        if res.is_err() && on {
            *pcount -= 1;
            self.flags.fetch_and(!InterfaceFlags::PROMISC.bits(), Ordering::AcqRel);
        }
        res
    }
}

impl std::fmt::Debug for NetInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetInterface")
            .field("name", &self.name)
            .field("mtu", &self.mtu())
            .field("flags", &self.flags())
            .finish()
    }
}

/// The enablement cell a driver checks before offering a packet to a tap.
///
/// The cookie holds its tap exactly while at least one descriptor is attached to it.
#[derive(Default)]
pub struct TapCookie {
    tap: ArcSwapOption<Tap>,
}

impl TapCookie {
    /// Returns the tap if any descriptor is listening on it.
    #[inline]
    pub fn load(&self) -> Option<Arc<Tap>> {
        self.tap.load_full()
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.tap.load().is_some()
    }
}

/// The attachment point of capture descriptors on an interface, for one link type.
pub struct Tap {
    ifp: Arc<NetInterface>,
    dlt: LinkType,
    hdrlen: usize,
    cookie: Arc<TapCookie>,
    listeners: RwLock<Vec<Arc<Descriptor>>>,
    dead: AtomicBool,
}

impl Tap {
    pub(crate) fn new(ifp: Arc<NetInterface>, dlt: LinkType, link_hdrlen: usize) -> Arc<Self> {
        Arc::new(Self {
            ifp,
            dlt,
            hdrlen: capture_hdrlen(link_hdrlen),
            cookie: Arc::new(TapCookie::default()),
            listeners: RwLock::new(Vec::new()),
            dead: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn interface(&self) -> &Arc<NetInterface> {
        &self.ifp
    }

    #[inline]
    pub fn link_type(&self) -> LinkType {
        self.dlt
    }

    #[inline]
    pub fn cookie(&self) -> &Arc<TapCookie> {
        &self.cookie
    }

    /// The number of descriptors currently attached.
    #[inline]
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Offers a packet held in `pkt` to every attached descriptor.
    #[inline]
    pub fn mtap(&self, pkt: &dyn PacketView, direction: Direction) -> Verdict {
        self.dispatch(pkt, pkt.len() as u32, direction)
    }

    /// Offers a packet of which only a prefix (`pkt`) is available; `wirelen` is its full length.
    #[inline]
    pub fn mtap_partial(&self, pkt: &dyn PacketView, wirelen: u32, direction: Direction) -> Verdict {
        debug_assert!(wirelen as usize >= pkt.len());
        self.dispatch(pkt, wirelen, direction)
    }

    /// Offers a packet composed of a link header prepended to a separately stored payload.
    pub fn mtap_hdr(&self, hdr: &[u8], payload: &[u8], direction: Direction) -> Verdict {
        let pkt = SegmentedPacket::with_header(hdr, payload);
        self.dispatch(&pkt, pkt.len() as u32, direction)
    }

    /// Offers a payload preceded by a 4-byte network-order address family (loopback framing).
    #[inline]
    pub fn mtap_af(&self, af: u32, payload: &[u8], direction: Direction) -> Verdict {
        self.mtap_hdr(&af.to_be_bytes(), payload, direction)
    }

    fn dispatch(&self, pkt: &dyn PacketView, wirelen: u32, direction: Direction) -> Verdict {
        // The list may be empty if the last listener detached after the caller loaded the cookie.
        let listeners = self.listeners.read();
        let mut tstamp = None;
        let mut verdict = Verdict::Pass;
        for d in listeners.iter() {
            if d.tap_packet(pkt, wirelen, direction, self.hdrlen, &mut tstamp) == Verdict::Drop {
                verdict = Verdict::Drop;
            }
        }

        verdict
    }

    /// Links `d` into the listener list.
    pub(crate) fn attach(self: &Arc<Self>, d: &Arc<Descriptor>) -> Result<()> {
        let mut listeners = self.listeners.write();
        if self.dead.load(Ordering::Acquire) {
            return Err(BpfError::NoDevice("interface is being detached"));
        }

        {
            let mut st = d.inner.lock();
            debug_assert!(st.buffers.is_some(), "attaching a descriptor without buffers");
            st.bound = Some(Arc::downgrade(self));
        }

        listeners.push(d.clone());
        if listeners.len() == 1 {
            self.cookie.tap.store(Some(self.clone()));
        }

        log::debug!(
            "bpf{} attached to {} ({:?})",
            d.unit(),
            self.ifp.name(),
            self.dlt
        );
        Ok(())
    }

    /// Unlinks `d` from the listener list.
    ///
    /// Returns whether `d` had requested promiscuous mode through this tap; the caller is
    /// responsible for withdrawing that request from the interface.
    pub(crate) fn detach(&self, d: &Descriptor) -> bool {
        let mut listeners = self.listeners.write();
        listeners.retain(|l| !ptr::eq(Arc::as_ptr(l), d));
        if listeners.is_empty() {
            self.cookie.tap.store(None);
        }

        let mut st = d.inner.lock();
        let promisc = self.unlink(&mut st);
        log::debug!("bpf{} detached from {}", d.unit(), self.ifp.name());
        promisc
    }

    /// Requests promiscuous mode on the interface on behalf of `d`.
    pub(crate) fn enable_promiscuous(&self, d: &Descriptor) -> Result<()> {
        let _listeners = self.listeners.write();
        let mut st = d.inner.lock();
        if !self.is_bound_to(&st) {
            return Err(BpfError::InvalidArgument("descriptor is not attached to an interface"));
        }

        if st.promisc {
            return Ok(());
        }

        self.ifp.set_promiscuous(true).map_err(BpfError::Driver)?;
        st.promisc = true;
        Ok(())
    }

    /// Forcibly detaches every descriptor, waking their readers.
    ///
    /// Afterwards the tap refuses new attachments. Calling this more than once is harmless.
    pub(crate) fn teardown(&self) {
        let mut listeners = self.listeners.write();
        self.dead.store(true, Ordering::Release);
        self.cookie.tap.store(None);

        for d in listeners.drain(..) {
            let (promisc, contract) = {
                let mut st = d.inner.lock();
                let promisc = self.unlink(&mut st);
                (promisc, d.wakeup(&mut st))
            };
            d.deliver(contract);

            if promisc {
                if let Err(e) = withdraw_promiscuous(&self.ifp) {
                    log::error!(
                        "bpf{}: failed to leave promiscuous mode on {}: {}",
                        d.unit(),
                        self.ifp.name(),
                        e
                    );
                }
            }
        }

        log::info!("bpf: {} ({:?}) detached", self.ifp.name(), self.dlt);
    }

    /// The length of the capture header preceding each packet captured on this tap.
    #[inline]
    pub fn hdrlen(&self) -> usize {
        self.hdrlen
    }

    #[inline]
    fn is_bound_to(&self, st: &DescriptorInner) -> bool {
        st.bound
            .as_ref()
            .map_or(false, |w| ptr::eq(Weak::as_ptr(w), self))
    }

    fn unlink(&self, st: &mut DescriptorInner) -> bool {
        if !self.is_bound_to(st) {
            return false;
        }

        st.bound = None;
        std::mem::take(&mut st.promisc)
    }
}

impl std::fmt::Debug for Tap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tap")
            .field("interface", &self.ifp.name())
            .field("dlt", &self.dlt)
            .field("hdrlen", &self.hdrlen)
            .finish()
    }
}

/// Withdraws one promiscuous-mode request, tolerating errors that only mean the interface can no
/// longer be (or already is not) promiscuous.
pub(crate) fn withdraw_promiscuous(ifp: &NetInterface) -> Result<()> {
    match ifp.set_promiscuous(false) {
        Ok(()) => Ok(()),
        Err(e) if matches!(e.raw_os_error(), Some(libc::EINVAL | libc::ENODEV | libc::ENXIO)) => {
            log::warn!("bpf: ignoring promiscuous mode error on {}: {}", ifp.name(), e);
            Ok(())
        }
        Err(e) => Err(BpfError::Driver(e)),
    }
}

/// Captures the current time once per packet, on first use.
#[inline]
pub(crate) fn packet_time(tstamp: &mut Option<Timestamp>) -> Timestamp {
    *tstamp.get_or_insert_with(Timestamp::now)
}
