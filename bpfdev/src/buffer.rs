// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Nathaniel Bennett <me[at]nathanielbennett[dotcom]>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Capture buffers and the capture record format.
//!
//! Each bound descriptor owns two buffers of `bufsize` bytes which rotate through three roles:
//!
//! - **store**: the buffer captured packets are currently appended to;
//! - **hold**: a full buffer waiting to be handed to a reader;
//! - **free**: an empty buffer ready to replace the store buffer.
//!
//! When a record does not fit in the store buffer, the store buffer becomes the hold buffer and
//! the free buffer becomes the new store buffer. If no free buffer is available (the reader has
//! not yet drained the hold buffer) the record is dropped. Producers never wait for readers.
//!
//! Within a buffer, records are laid out back to back, each aligned to [`BPF_ALIGNMENT`]:
//!
//! ```text
//! +----------------+---------+-----------------------+---------+----------------+
//! | CaptureHeader  | padding | packet (caplen bytes) | padding | CaptureHeader  | ...
//! +----------------+---------+-----------------------+---------+----------------+
//! |<----- hdrlen ----------->|
//! ```
//!
//! `hdrlen` is chosen so that the network-layer header following the link-layer header of the
//! captured packet starts on an aligned boundary.

use std::mem;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::packet::PacketView;

/// Alignment of capture records within a buffer.
pub const BPF_ALIGNMENT: usize = mem::size_of::<u32>();

/// Size in bytes of an encoded [`CaptureHeader`] (excluding padding).
pub const SIZEOF_BPF_HDR: usize = 18;

/// Rounds `x` up to the next multiple of [`BPF_ALIGNMENT`].
#[allow(non_snake_case)]
#[inline]
pub const fn BPF_WORDALIGN(x: usize) -> usize {
    (x + (BPF_ALIGNMENT - 1)) & !(BPF_ALIGNMENT - 1)
}

/// Computes the capture header length for a link layer whose header is `link_hdrlen` bytes.
///
/// The returned length, added to `link_hdrlen`, is a multiple of [`BPF_ALIGNMENT`].
#[inline]
pub const fn capture_hdrlen(link_hdrlen: usize) -> usize {
    BPF_WORDALIGN(link_hdrlen + SIZEOF_BPF_HDR) - link_hdrlen
}

/// Wall-clock time at which a packet was captured.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub sec: u32,
    pub usec: u32,
}

impl Timestamp {
    #[inline]
    pub fn now() -> Self {
        Self::from(SystemTime::now())
    }

    #[inline]
    pub fn to_system_time(&self) -> SystemTime {
        UNIX_EPOCH
            + Duration::from_secs(self.sec as u64)
            + Duration::from_micros(self.usec as u64)
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.sec == 0 && self.usec == 0
    }
}

impl From<SystemTime> for Timestamp {
    fn from(time: SystemTime) -> Self {
        let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            sec: since_epoch.as_secs() as u32,
            usec: since_epoch.subsec_micros(),
        }
    }
}

/// The fixed header preceding every captured packet in a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureHeader {
    /// Time of capture.
    pub tstamp: Timestamp,
    /// Number of packet bytes present in the record.
    pub caplen: u32,
    /// Length of the packet on the wire.
    pub datalen: u32,
    /// Offset from the start of the record to the packet bytes.
    pub hdrlen: u16,
}

impl CaptureHeader {
    /// Encodes the header into the first [`SIZEOF_BPF_HDR`] bytes of `dst` (native byte order).
    pub fn write_to(&self, dst: &mut [u8]) {
        dst[0..4].copy_from_slice(&self.tstamp.sec.to_ne_bytes());
        dst[4..8].copy_from_slice(&self.tstamp.usec.to_ne_bytes());
        dst[8..12].copy_from_slice(&self.caplen.to_ne_bytes());
        dst[12..16].copy_from_slice(&self.datalen.to_ne_bytes());
        dst[16..18].copy_from_slice(&self.hdrlen.to_ne_bytes());
    }

    /// Decodes a header from the start of `src`, if enough bytes are present.
    pub fn parse(src: &[u8]) -> Option<Self> {
        let src = src.get(..SIZEOF_BPF_HDR)?;
        let u32_at = |i: usize| u32::from_ne_bytes([src[i], src[i + 1], src[i + 2], src[i + 3]]);

        Some(Self {
            tstamp: Timestamp {
                sec: u32_at(0),
                usec: u32_at(4),
            },
            caplen: u32_at(8),
            datalen: u32_at(12),
            hdrlen: u16::from_ne_bytes([src[16], src[17]]),
        })
    }
}

/// Result of offering a packet to a descriptor's buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CatchOutcome {
    /// The record was stored. `rotated` indicates a full store buffer was moved to hold.
    Stored { rotated: bool },
    /// No space was available and the record was discarded.
    Dropped,
}

/// The store/hold/free buffer set of a bound descriptor.
#[derive(Debug)]
pub(crate) struct CaptureBuffers {
    bufsize: usize,
    store: Vec<u8>,
    slen: usize,
    hold: Option<Vec<u8>>,
    hlen: usize,
    free: Option<Vec<u8>>,
}

impl CaptureBuffers {
    /// Allocates a store and a free buffer of `bufsize` bytes each.
    pub fn new(bufsize: usize) -> Self {
        Self {
            bufsize,
            store: vec![0; bufsize],
            slen: 0,
            hold: None,
            hlen: 0,
            free: Some(vec![0; bufsize]),
        }
    }

    #[inline]
    pub fn bufsize(&self) -> usize {
        self.bufsize
    }

    /// Bytes of captured data in the store buffer.
    #[inline]
    pub fn store_len(&self) -> usize {
        self.slen
    }

    /// Bytes of captured data in the hold buffer (0 if there is none).
    #[inline]
    pub fn hold_len(&self) -> usize {
        self.hlen
    }

    #[inline]
    pub fn has_hold(&self) -> bool {
        self.hold.is_some()
    }

    /// Appends a capture record for `pkt`, rotating the store buffer if it is full.
    ///
    /// At most `snaplen` bytes of the packet are recorded, further limited by the bytes available
    /// in `pkt` and by the buffer size. `hdrlen` is the capture header length of the tap the
    /// packet arrived on (see [`capture_hdrlen()`]).
    pub fn catch<P: PacketView + ?Sized>(
        &mut self,
        pkt: &P,
        snaplen: usize,
        wirelen: u32,
        hdrlen: usize,
        tstamp: Timestamp,
    ) -> CatchOutcome {
        debug_assert!(hdrlen >= SIZEOF_BPF_HDR && hdrlen < self.bufsize);

        let totlen = (hdrlen + snaplen.min(pkt.len())).min(self.bufsize);
        let caplen = totlen - hdrlen;

        let mut curlen = BPF_WORDALIGN(self.slen);
        let mut rotated = false;
        if curlen + totlen > self.bufsize {
            if !self.rotate() {
                return CatchOutcome::Dropped;
            }
            rotated = true;
            curlen = 0;
        }

        let record = &mut self.store[curlen..curlen + totlen];
        if pkt.read(0, &mut record[hdrlen..]).is_err() {
            debug_assert!(false, "packet shorter than its reported length");
            return CatchOutcome::Dropped;
        }

        CaptureHeader {
            tstamp,
            caplen: caplen as u32,
            datalen: wirelen,
            hdrlen: hdrlen as u16,
        }
        .write_to(record);
        record[SIZEOF_BPF_HDR..hdrlen].fill(0);

        self.slen = curlen + totlen;
        CatchOutcome::Stored { rotated }
    }

    /// Moves the store buffer to hold and the free buffer to store.
    ///
    /// Returns `false` (leaving all buffers untouched) if no free buffer is available.
    pub fn rotate(&mut self) -> bool {
        let Some(free) = self.free.take() else {
            return false;
        };

        debug_assert!(self.hold.is_none());
        let full = mem::replace(&mut self.store, free);
        self.hold = Some(full);
        self.hlen = self.slen;
        self.slen = 0;
        true
    }

    /// Removes the hold buffer so that it can be copied out without holding any lock.
    ///
    /// Returns the buffer together with the number of valid bytes in it. The buffer must be handed
    /// back with [`release()`](Self::release) once the copy completes.
    pub fn take_hold(&mut self) -> Option<(Vec<u8>, usize)> {
        let hold = self.hold.take()?;
        let hlen = mem::replace(&mut self.hlen, 0);
        Some((hold, hlen))
    }

    /// Returns a drained hold buffer to the free slot.
    ///
    /// A buffer taken from a previous buffer set (the descriptor was resized or reset while the
    /// copy was in progress) is simply dropped.
    pub fn release(&mut self, buf: Vec<u8>) {
        if self.free.is_none() && buf.len() == self.bufsize {
            self.free = Some(buf);
        }
    }

    /// Discards all captured data.
    pub fn reset(&mut self) {
        if let Some(hold) = self.hold.take() {
            debug_assert!(self.free.is_none());
            self.free = Some(hold);
        }
        self.slen = 0;
        self.hlen = 0;
    }
}

/// A single captured packet within a buffer returned by a read.
#[derive(Clone, Copy, Debug)]
pub struct CaptureRecord<'a> {
    header: CaptureHeader,
    data: &'a [u8],
}

impl<'a> CaptureRecord<'a> {
    /// The captured bytes of the packet.
    #[inline]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    #[inline]
    pub fn header(&self) -> &CaptureHeader {
        &self.header
    }

    /// The original length of the packet on the wire.
    ///
    /// This may be greater than [`captured_len()`](Self::captured_len) if the packet was truncated
    /// by the filter's snapshot length or by the buffer size.
    #[inline]
    pub fn original_len(&self) -> usize {
        self.header.datalen as usize
    }

    /// The number of packet bytes present in the record.
    #[inline]
    pub fn captured_len(&self) -> usize {
        self.data.len()
    }

    /// Indicates whether the packet was truncated.
    #[inline]
    pub fn truncated(&self) -> bool {
        self.original_len() != self.captured_len()
    }

    /// A timestamp indicating when the packet was captured.
    #[inline]
    pub fn timestamp(&self) -> Timestamp {
        self.header.tstamp
    }
}

/// An iterator over the capture records contained in a buffer returned by a read.
#[derive(Clone, Debug)]
pub struct CaptureRecords<'a> {
    rem: &'a [u8],
}

impl<'a> CaptureRecords<'a> {
    #[inline]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { rem: buf }
    }

    /// The bytes not yet consumed by the iterator.
    #[inline]
    pub fn remaining(&self) -> &'a [u8] {
        self.rem
    }
}

impl<'a> Iterator for CaptureRecords<'a> {
    type Item = CaptureRecord<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let header = CaptureHeader::parse(self.rem)?;

        let caplen = header.caplen as usize;
        let hdrlen = header.hdrlen as usize;
        if hdrlen < SIZEOF_BPF_HDR {
            self.rem = &[];
            return None;
        }

        let unpadded_len = hdrlen + caplen;
        let Some(data) = self.rem.get(hdrlen..unpadded_len) else {
            self.rem = &[];
            return None;
        };

        self.rem = self.rem.get(BPF_WORDALIGN(unpadded_len)..).unwrap_or(&[]);
        Some(CaptureRecord { header, data })
    }
}
