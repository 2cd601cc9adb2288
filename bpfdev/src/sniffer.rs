// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Nathaniel Bennett <me[at]nathanielbennett[dotcom]>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::io;
use std::sync::Arc;

use crate::buffer::{CaptureRecord, CaptureRecords};
use crate::device::Bpf;
use crate::filter::PacketFilter;
use crate::notify::Credentials;
use crate::registry::CaptureRegistry;

/// A device capable of transmitting and receiving arbitrary link-layer (i.e., L2) packets on a
/// single interface.
///
/// A `Sniffer` receives all packets passing _in either direction_ through its interface,
/// including those it transmits itself when the interface loops them back.
pub struct Sniffer {
    bpf: Bpf,
    buf: Vec<u8>,
    filled: usize,
    offset: usize,
}

impl Sniffer {
    /// Creates a new `Sniffer` listening on the interface named `iface`, using superuser
    /// credentials.
    ///
    /// The sniffer will not capture new packets until [`activate()`](Self::activate) is called.
    #[inline]
    pub fn new(registry: &Arc<CaptureRegistry>, iface: &str) -> io::Result<Self> {
        Self::with_credentials(registry, iface, Credentials::root())
    }

    /// Creates a new `Sniffer` on behalf of a process with credentials `cred`.
    pub fn with_credentials(
        registry: &Arc<CaptureRegistry>,
        iface: &str,
        cred: Credentials,
    ) -> io::Result<Self> {
        let bpf = registry.open_any(cred)?;
        bpf.flush()?;
        bpf.set_interface(iface)?;
        bpf.set_filter(Some(&PacketFilter::reject_all()))?;
        bpf.set_immediate(true)?;

        let buflen = bpf.buffer_len()? as usize;
        Ok(Self {
            bpf,
            buf: vec![0; buflen],
            filled: 0,
            offset: 0,
        })
    }

    /// Activates the `Sniffer` to begin capturing packets.
    ///
    /// If `filter` is set to `None`, the `Sniffer` will capture all packets being both transmitted
    /// and received on the interface. Otherwise, the specified filter will be used to determine
    /// what kinds of packets should be captured or dropped.
    ///
    /// Any outstanding packets, including those already read from the descriptor but not yet
    /// returned by [`recv()`](Self::recv), are flushed on activation. This ensures that every
    /// packet received following activation adheres to `filter`.
    pub fn activate(&mut self, filter: Option<PacketFilter>) -> io::Result<()> {
        self.bpf.flush()?;
        self.filled = 0;
        self.offset = 0;

        let filter = filter.unwrap_or_else(PacketFilter::accept_all);
        self.bpf.set_filter(Some(&filter))?;
        Ok(())
    }

    /// Stops the sniffer from capturing packets.
    ///
    /// Packets already returned by a read remain available through [`recv()`](Self::recv);
    /// packets still held by the descriptor are flushed.
    pub fn deactivate(&mut self) -> io::Result<()> {
        self.bpf.set_filter(Some(&PacketFilter::reject_all()))?;
        Ok(())
    }

    /// Indicates whether nonblocking I/O is enabled.
    ///
    /// When enabled, calls to [`recv()`](Self::recv) return an error of kind
    /// [`io::ErrorKind::WouldBlock`] if no packet is immediately available.
    #[inline]
    pub fn nonblocking(&self) -> bool {
        self.bpf.nonblocking()
    }

    #[inline]
    pub fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()> {
        self.bpf.set_nonblocking(nonblocking)?;
        Ok(())
    }

    /// Sends a packet out on the interface the `Sniffer` is associated with.
    ///
    /// The structure of the packet depends on the link type of the interface. A `Sniffer` does
    /// not need to be activated to send packets.
    #[inline]
    pub fn send(&mut self, packet: &[u8]) -> io::Result<usize> {
        Ok(self.bpf.write(packet)?)
    }

    /// Receives the next captured packet.
    ///
    /// Fails with [`io::ErrorKind::TimedOut`] if a read timeout is configured on the underlying
    /// descriptor and it expires before any packet is captured.
    pub fn recv(&mut self) -> io::Result<CaptureRecord<'_>> {
        if self.offset >= self.filled {
            self.filled = 0;
            self.offset = 0;

            let len = self.bpf.read(&mut self.buf)?;
            if len == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "no packets captured before the read timeout",
                ));
            }
            self.filled = len;
        }

        let mut records = CaptureRecords::new(&self.buf[self.offset..self.filled]);
        let Some(record) = records.next() else {
            self.offset = self.filled;
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "malformed capture record",
            ));
        };

        self.offset = self.filled - records.remaining().len();
        Ok(record)
    }

    /// Receives the next captured packet into `buf`, returning the number of bytes copied.
    ///
    /// The packet is truncated if `buf` is too small to hold it.
    pub fn recv_into(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.recv()?.data();
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok(len)
    }

    /// The underlying capture descriptor.
    #[inline]
    pub fn bpf(&self) -> &Bpf {
        &self.bpf
    }
}
