// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Nathaniel Bennett <me[at]nathanielbennett[dotcom]>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bpfdev::dlt::AddressFamily;
use bpfdev::{
    BpfConfig, CaptureRegistry, ContiguousPacket, Direction, LinkDriver, LinkType, NetInterface,
    OutboundPacket, TapCookie, Verdict,
};

pub const AF_INET: u32 = 2;
pub const LLADDR: [u8; 6] = [0x02, 0x00, 0x5e, 0x10, 0x20, 0x30];

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn registry() -> Arc<CaptureRegistry> {
    init_logging();
    CaptureRegistry::new(BpfConfig::builder().max_units(8).build().unwrap())
}

/// A loopback driver: everything sent is captured again as outbound traffic.
#[derive(Default)]
pub struct Loopback {
    cookie: Mutex<Option<Arc<TapCookie>>>,
    pub sent: Mutex<Vec<OutboundPacket>>,
}

impl LinkDriver for Loopback {
    fn output(&self, _ifp: &NetInterface, pkt: OutboundPacket) -> io::Result<()> {
        let af = match pkt.family {
            AddressFamily::Other(af) => af,
            _ => AF_INET,
        };

        let cookie = self.cookie.lock().unwrap().clone();
        if let Some(tap) = cookie.and_then(|c| c.load()) {
            let _ = tap.mtap_af(af, &pkt.payload, Direction::OUT);
        }

        self.sent.lock().unwrap().push(pkt);
        Ok(())
    }
}

pub struct Lo0 {
    pub ifp: Arc<NetInterface>,
    pub driver: Arc<Loopback>,
    pub cookie: Arc<TapCookie>,
}

impl Lo0 {
    pub fn attach(registry: &CaptureRegistry) -> Self {
        let driver = Arc::new(Loopback::default());
        let ifp = Arc::new(NetInterface::new("lo0", driver.clone()).with_mtu(32768));
        let cookie = registry.attach_interface(&ifp, LinkType::LOOP, 4);
        *driver.cookie.lock().unwrap() = Some(cookie.clone());
        Self {
            ifp,
            driver,
            cookie,
        }
    }

    /// Delivers an inbound packet with the given address family, as the loopback input path would.
    pub fn input(&self, af: u32, payload: &[u8]) -> Option<Verdict> {
        self.cookie
            .load()
            .map(|tap| tap.mtap_af(af, payload, Direction::IN))
    }
}

/// An Ethernet driver double recording transmitted frames and promiscuous-mode changes.
#[derive(Default)]
pub struct Ethernet {
    pub sent: Mutex<Vec<OutboundPacket>>,
    pub promisc_changes: AtomicUsize,
    /// Errno returned when promiscuous mode is switched off (0 for success).
    pub promisc_off_errno: AtomicI32,
    /// Errno returned by output (0 for success).
    pub output_errno: AtomicI32,
}

impl LinkDriver for Ethernet {
    fn output(&self, _ifp: &NetInterface, pkt: OutboundPacket) -> io::Result<()> {
        match self.output_errno.load(Ordering::SeqCst) {
            0 => {
                self.sent.lock().unwrap().push(pkt);
                Ok(())
            }
            errno => Err(io::Error::from_raw_os_error(errno)),
        }
    }

    fn set_promiscuous(&self, _ifp: &NetInterface, on: bool) -> io::Result<()> {
        if !on {
            let errno = self.promisc_off_errno.load(Ordering::SeqCst);
            if errno != 0 {
                return Err(io::Error::from_raw_os_error(errno));
            }
        }
        self.promisc_changes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct Em {
    pub ifp: Arc<NetInterface>,
    pub driver: Arc<Ethernet>,
    pub cookie: Arc<TapCookie>,
}

impl Em {
    pub fn attach(registry: &CaptureRegistry, name: &str) -> Self {
        let driver = Arc::new(Ethernet::default());
        let ifp = Arc::new(NetInterface::new(name, driver.clone()).with_lladdr(LLADDR));
        let cookie = registry.attach_interface(&ifp, LinkType::EN10MB, 14);
        Self {
            ifp,
            driver,
            cookie,
        }
    }

    pub fn tap(&self, frame: &[u8], direction: Direction) -> Option<Verdict> {
        self.cookie
            .load()
            .map(|tap| tap.mtap(&ContiguousPacket::new(frame), direction))
    }
}

/// An Ethernet frame of `len` bytes carrying an IPv4 ethertype.
pub fn ether_frame(len: usize, fill: u8) -> Vec<u8> {
    let mut frame = vec![fill; len];
    frame[..6].copy_from_slice(&[0xff; 6]);
    frame[6..12].copy_from_slice(&[0xaa; 6]);
    frame[12..14].copy_from_slice(&[0x08, 0x00]);
    frame
}
