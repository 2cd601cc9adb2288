// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Nathaniel Bennett <me[at]nathanielbennett[dotcom]>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Packet filtering: classic BPF programs and the engine that evaluates them.
//!
//! A [`PacketFilter`] is an unvalidated list of instructions supplied by a user. Installing it on
//! a descriptor validates it and freezes it into a [`Program`], which is what the capture and
//! write paths evaluate with [`evaluate()`].

pub mod insn;
mod interp;
mod verify;

use std::sync::Arc;

pub use insn::{jump, stmt, BpfInsn};
pub use verify::validate;

use crate::error::Result;
use crate::packet::PacketView;

/// Which traffic a filter applies to on a descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterDirection {
    /// Selects packets to capture.
    Read,
    /// Restricts packets the descriptor may inject.
    Write,
}

/// A user-supplied classic BPF program.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PacketFilter {
    insns: Vec<BpfInsn>,
}

impl PacketFilter {
    /// A filter accepting every packet in its entirety.
    #[inline]
    pub fn accept_all() -> Self {
        Self {
            insns: vec![stmt(insn::BPF_RET | insn::BPF_K, u32::MAX)],
        }
    }

    /// A filter rejecting every packet.
    #[inline]
    pub fn reject_all() -> Self {
        Self {
            insns: vec![stmt(insn::BPF_RET | insn::BPF_K, 0)],
        }
    }

    /// A filter accepting every packet, truncated to at most `snaplen` bytes.
    #[inline]
    pub fn snap(snaplen: u32) -> Self {
        Self {
            insns: vec![stmt(insn::BPF_RET | insn::BPF_K, snaplen)],
        }
    }

    #[inline]
    pub fn from_insns(insns: Vec<BpfInsn>) -> Self {
        Self { insns }
    }

    #[inline]
    pub fn instructions(&self) -> &[BpfInsn] {
        &self.insns
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.insns.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }
}

impl From<Vec<BpfInsn>> for PacketFilter {
    fn from(insns: Vec<BpfInsn>) -> Self {
        Self { insns }
    }
}

/// A validated, immutable filter program as installed on a descriptor.
///
/// Cloning is cheap; clones share the same instructions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Program {
    insns: Arc<[BpfInsn]>,
}

impl Program {
    /// Validates `filter` and freezes it into a program.
    pub fn new(filter: &PacketFilter, max_insns: usize) -> Result<Self> {
        validate(filter.instructions(), max_insns)?;
        Ok(Self {
            insns: Arc::from(filter.instructions()),
        })
    }

    #[inline]
    pub fn instructions(&self) -> &[BpfInsn] {
        &self.insns
    }
}

/// Evaluates `program` against `pkt`, returning how many bytes of the packet to accept.
///
/// `wirelen` is the full on-wire length of the packet and `pkt.len()` the number of bytes
/// actually available. A return of 0 rejects the packet; the result never exceeds `wirelen`.
/// A missing program accepts the whole packet.
#[inline]
pub fn evaluate<P: PacketView + ?Sized>(program: Option<&Program>, pkt: &P, wirelen: u32) -> u32 {
    match program {
        None => wirelen,
        Some(prog) => interp::run(prog.instructions(), pkt, wirelen).min(wirelen),
    }
}

/// Packet counters of a capture descriptor.
///
/// Counters are zeroed whenever the descriptor is flushed, including when a new read filter is
/// installed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PacketStatistics {
    pub(crate) received: u64,
    pub(crate) dropped: u64,
    pub(crate) captured: u64,
}

impl PacketStatistics {
    /// Packets seen by the descriptor, whether or not its filter accepted them.
    #[inline]
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Accepted packets discarded because no buffer space was available.
    #[inline]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Accepted packets stored into the descriptor's buffers.
    #[inline]
    pub fn captured(&self) -> u64 {
        self.captured
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ContiguousPacket;

    #[test]
    fn verdict_never_exceeds_wire_length() {
        let data = [0u8; 64];
        let pkt = ContiguousPacket::new(&data);
        let prog = Program::new(&PacketFilter::accept_all(), 512).unwrap();
        assert_eq!(evaluate(Some(&prog), &pkt, 64), 64);

        let prog = Program::new(&PacketFilter::snap(20), 512).unwrap();
        assert_eq!(evaluate(Some(&prog), &pkt, 64), 20);

        let prog = Program::new(&PacketFilter::reject_all(), 512).unwrap();
        assert_eq!(evaluate(Some(&prog), &pkt, 64), 0);
    }

    #[test]
    fn missing_program_accepts_whole_packet() {
        for len in [0usize, 1, 60, 1514] {
            let data = vec![0xaa; len];
            let pkt = ContiguousPacket::new(&data);
            assert_eq!(evaluate(None, &pkt, len as u32), len as u32);
        }
    }

    #[test]
    fn invalid_filters_are_refused() {
        assert!(Program::new(&PacketFilter::default(), 512).is_err());
        let unterminated = PacketFilter::from_insns(vec![stmt(insn::BPF_LD | insn::BPF_IMM, 0)]);
        assert!(Program::new(&unterminated, 512).is_err());
    }
}
