// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Nathaniel Bennett <me[at]nathanielbennett[dotcom]>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Read-only views over packets handed to the capture path by network drivers.
//!
//! Drivers may hold a packet as a single contiguous buffer or as a chain of segments (for
//! instance, a link-layer header prepended to a payload held elsewhere). The filter engine and
//! the capture buffers only ever access packet bytes through [`PacketView`], so neither needs to
//! know how the packet is stored.

/// A read touched bytes outside of the captured portion of a packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("packet access out of bounds")]
pub struct OutOfBounds;

/// Random-access, bounds-checked view of the bytes of a packet.
pub trait PacketView {
    /// The number of bytes available to read (the captured length).
    fn len(&self) -> usize;

    /// Copies `dst.len()` bytes starting at `offset` into `dst`.
    ///
    /// Fails without touching `dst` if any part of the range lies beyond [`len()`](Self::len).
    fn read(&self, offset: usize, dst: &mut [u8]) -> Result<(), OutOfBounds>;

    #[inline]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn read_u8(&self, offset: usize) -> Result<u8, OutOfBounds> {
        let mut b = [0u8; 1];
        self.read(offset, &mut b)?;
        Ok(b[0])
    }

    /// Reads a big-endian (network order) 16-bit value.
    #[inline]
    fn read_u16(&self, offset: usize) -> Result<u16, OutOfBounds> {
        let mut b = [0u8; 2];
        self.read(offset, &mut b)?;
        Ok(u16::from_be_bytes(b))
    }

    /// Reads a big-endian (network order) 32-bit value.
    #[inline]
    fn read_u32(&self, offset: usize) -> Result<u32, OutOfBounds> {
        let mut b = [0u8; 4];
        self.read(offset, &mut b)?;
        Ok(u32::from_be_bytes(b))
    }
}

impl PacketView for [u8] {
    #[inline]
    fn len(&self) -> usize {
        <[u8]>::len(self)
    }

    #[inline]
    fn read(&self, offset: usize, dst: &mut [u8]) -> Result<(), OutOfBounds> {
        let end = offset.checked_add(dst.len()).ok_or(OutOfBounds)?;
        let src = self.get(offset..end).ok_or(OutOfBounds)?;
        dst.copy_from_slice(src);
        Ok(())
    }
}

/// A packet stored as one contiguous buffer.
#[derive(Clone, Copy, Debug)]
pub struct ContiguousPacket<'a> {
    data: &'a [u8],
}

impl<'a> ContiguousPacket<'a> {
    #[inline]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    #[inline]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }
}

impl PacketView for ContiguousPacket<'_> {
    #[inline]
    fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    fn read(&self, offset: usize, dst: &mut [u8]) -> Result<(), OutOfBounds> {
        self.data.read(offset, dst)
    }
}

/// A packet stored as an ordered chain of segments.
///
/// Reads may span any number of segment boundaries. Empty segments are permitted and skipped.
#[derive(Clone, Debug)]
pub struct SegmentedPacket<'a> {
    segments: Vec<&'a [u8]>,
    len: usize,
}

impl<'a> SegmentedPacket<'a> {
    pub fn new(segments: Vec<&'a [u8]>) -> Self {
        let len = segments.iter().map(|s| s.len()).sum();
        Self { segments, len }
    }

    /// Builds a two-segment chain consisting of `header` followed by `payload`.
    #[inline]
    pub fn with_header(header: &'a [u8], payload: &'a [u8]) -> Self {
        Self::new(vec![header, payload])
    }

    #[inline]
    pub fn segments(&self) -> &[&'a [u8]] {
        &self.segments
    }
}

impl PacketView for SegmentedPacket<'_> {
    #[inline]
    fn len(&self) -> usize {
        self.len
    }

    fn read(&self, offset: usize, dst: &mut [u8]) -> Result<(), OutOfBounds> {
        let end = offset.checked_add(dst.len()).ok_or(OutOfBounds)?;
        if end > self.len {
            return Err(OutOfBounds);
        }

        let mut skip = offset;
        let mut written = 0;
        for segment in &self.segments {
            if written == dst.len() {
                break;
            }

            if skip >= segment.len() {
                skip -= segment.len();
                continue;
            }

            let avail = &segment[skip..];
            let n = avail.len().min(dst.len() - written);
            dst[written..written + n].copy_from_slice(&avail[..n]);
            written += n;
            skip = 0;
        }

        debug_assert_eq!(written, dst.len());
        Ok(())
    }
}
