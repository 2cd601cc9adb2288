// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Nathaniel Bennett <me[at]nathanielbennett[dotcom]>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Packet injection through a bound descriptor.

use crate::descriptor::Descriptor;
use crate::dlt::{AddressFamily, WriteFraming, ETHER_ADDR_LEN};
use crate::error::{BpfError, Result};
use crate::filter;
use crate::interface::OutboundPacket;
use crate::packet::ContiguousPacket;

/// Offset of the source address within an Ethernet header.
const ETHER_SHOST_OFFSET: usize = ETHER_ADDR_LEN;

/// Frames `data` for the descriptor's link type and hands it to the interface driver.
///
/// The driver is called with no descriptor lock held, so a driver that loops the packet back
/// into the capture path may do so synchronously.
pub(crate) fn inject(d: &Descriptor, data: &[u8], max_packet: usize) -> Result<usize> {
    let hdrcmplt = d.header_complete();
    let Some(tap) = d.tap() else {
        return Err(BpfError::NoDevice("descriptor is not attached to an interface"));
    };

    let ifp = tap.interface();
    if !ifp.is_up() {
        return Err(BpfError::NetworkDown);
    }

    if data.is_empty() {
        return Ok(0);
    }

    if data.len() > max_packet {
        return Err(BpfError::MessageSize {
            len: data.len(),
            limit: max_packet,
        });
    }

    let dlt = tap.link_type();
    let Some(framing) = dlt.write_framing() else {
        return Err(BpfError::UnsupportedLink(dlt.value()));
    };

    let hlen = framing.header_len();
    if data.len() < hlen {
        return Err(BpfError::InvalidArgument("packet shorter than its link header"));
    }

    {
        let filters = d.filters.read();
        let accepted = filter::evaluate(
            filters.write.as_ref(),
            &ContiguousPacket::new(data),
            data.len() as u32,
        );
        if (accepted as usize) < data.len() {
            return Err(BpfError::PermissionDenied("packet rejected by write filter"));
        }
    }

    let (hdr, payload) = data.split_at(hlen);
    if payload.len() > ifp.mtu() {
        return Err(BpfError::MessageSize {
            len: payload.len(),
            limit: ifp.mtu(),
        });
    }

    let mut link_header = hdr.to_vec();
    let family = match framing {
        WriteFraming::Headerless(AddressFamily::Unspec) | WriteFraming::Ethernet if hdrcmplt => {
            AddressFamily::HeaderComplete
        }
        WriteFraming::Headerless(af) => af,
        WriteFraming::Ethernet => {
            link_header[ETHER_SHOST_OFFSET..ETHER_SHOST_OFFSET + ETHER_ADDR_LEN]
                .copy_from_slice(&ifp.lladdr());
            AddressFamily::Unspec
        }
        WriteFraming::AddressFamilyWord => {
            let af = u32::from_be_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]);
            AddressFamily::Other(af)
        }
    };

    let pkt = OutboundPacket {
        family,
        link_header,
        payload: payload.to_vec(),
    };

    ifp.driver()
        .output(ifp, pkt)
        .map_err(BpfError::Driver)?;

    Ok(data.len())
}
