// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Nathaniel Bennett <me[at]nathanielbennett[dotcom]>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Data link types (`DLT_*`) reported to readers of capture records.

use std::fmt;

/// The framing format of packets captured on (or injected into) an interface tap.
///
/// Interfaces may register taps with link types not listed here, so this is an open set of values
/// rather than an exhaustive enum.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkType(pub u32);

impl LinkType {
    pub const NULL: LinkType = LinkType(0);
    pub const EN10MB: LinkType = LinkType(1);
    pub const EN3MB: LinkType = LinkType(2);
    pub const AX25: LinkType = LinkType(3);
    pub const PRONET: LinkType = LinkType(4);
    pub const CHAOS: LinkType = LinkType(5);
    pub const IEEE802: LinkType = LinkType(6);
    pub const ARCNET: LinkType = LinkType(7);
    pub const SLIP: LinkType = LinkType(8);
    pub const PPP: LinkType = LinkType(9);
    pub const FDDI: LinkType = LinkType(10);
    pub const ATM_RFC1483: LinkType = LinkType(11);
    pub const LOOP: LinkType = LinkType(12);
    pub const ENC: LinkType = LinkType(13);
    pub const RAW: LinkType = LinkType(14);
    pub const SLIP_BSDOS: LinkType = LinkType(15);
    pub const PPP_BSDOS: LinkType = LinkType(16);
    pub const PFSYNC: LinkType = LinkType(18);
    pub const PPP_ETHER: LinkType = LinkType(51);
    pub const IEEE802_11: LinkType = LinkType(105);
    pub const PFLOG: LinkType = LinkType(117);
    pub const IEEE802_11_RADIO: LinkType = LinkType(127);
    pub const USBPCAP: LinkType = LinkType(249);

    /// The raw numeric value of the link type.
    #[inline]
    pub fn value(&self) -> u32 {
        self.0
    }

    /// A short symbolic name for well-known link types.
    pub fn name(&self) -> Option<&'static str> {
        Some(match *self {
            Self::NULL => "NULL",
            Self::EN10MB => "EN10MB",
            Self::EN3MB => "EN3MB",
            Self::AX25 => "AX25",
            Self::PRONET => "PRONET",
            Self::CHAOS => "CHAOS",
            Self::IEEE802 => "IEEE802",
            Self::ARCNET => "ARCNET",
            Self::SLIP => "SLIP",
            Self::PPP => "PPP",
            Self::FDDI => "FDDI",
            Self::ATM_RFC1483 => "ATM_RFC1483",
            Self::LOOP => "LOOP",
            Self::ENC => "ENC",
            Self::RAW => "RAW",
            Self::SLIP_BSDOS => "SLIP_BSDOS",
            Self::PPP_BSDOS => "PPP_BSDOS",
            Self::PFSYNC => "PFSYNC",
            Self::PPP_ETHER => "PPP_ETHER",
            Self::IEEE802_11 => "IEEE802_11",
            Self::PFLOG => "PFLOG",
            Self::IEEE802_11_RADIO => "IEEE802_11_RADIO",
            Self::USBPCAP => "USBPCAP",
            _ => return None,
        })
    }

    /// How injected packets are framed for this link type, or `None` if packets cannot be
    /// injected on it.
    pub(crate) fn write_framing(&self) -> Option<WriteFraming> {
        match *self {
            Self::SLIP => Some(WriteFraming::Headerless(AddressFamily::Inet)),
            Self::PPP | Self::IEEE802_11 | Self::IEEE802_11_RADIO | Self::RAW | Self::NULL => {
                Some(WriteFraming::Headerless(AddressFamily::Unspec))
            }
            Self::EN10MB => Some(WriteFraming::Ethernet),
            Self::LOOP => Some(WriteFraming::AddressFamilyWord),
            _ => None,
        }
    }
}

impl fmt::Debug for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "DLT_{}", name),
            None => write!(f, "LinkType({})", self.0),
        }
    }
}

impl From<u32> for LinkType {
    #[inline]
    fn from(value: u32) -> Self {
        LinkType(value)
    }
}

/// The address family a driver should use when sending an injected packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressFamily {
    /// The destination is encoded in the supplied link header.
    Unspec,
    /// The payload is an IPv4 datagram.
    Inet,
    /// The link header is complete and must be transmitted as-is.
    HeaderComplete,
    /// An explicit family taken from a loopback address-family word.
    Other(u32),
}

/// Length of an Ethernet header in bytes.
pub const ETHER_HDR_LEN: usize = 14;
/// Length of an Ethernet hardware address in bytes.
pub const ETHER_ADDR_LEN: usize = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WriteFraming {
    /// No link header is supplied by the writer.
    Headerless(AddressFamily),
    /// The writer supplies a full 14-byte Ethernet header.
    Ethernet,
    /// The writer supplies a 4-byte network-order address family.
    AddressFamilyWord,
}

impl WriteFraming {
    /// Number of leading bytes of a written packet that hold link-layer addressing.
    #[inline]
    pub(crate) fn header_len(&self) -> usize {
        match self {
            WriteFraming::Headerless(_) => 0,
            WriteFraming::Ethernet => ETHER_HDR_LEN,
            WriteFraming::AddressFamilyWord => 4,
        }
    }
}
