// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Nathaniel Bennett <me[at]nathanielbennett[dotcom]>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Classic BPF interpreter.
//!
//! Every packet access goes through [`PacketView`], and every failure mode (out-of-bounds load,
//! division by zero, running off the end of the program, unknown opcode) terminates the program
//! with a verdict of 0, i.e. the packet is rejected.

use super::insn::*;
use crate::packet::PacketView;

/// Runs `prog` against `pkt` and returns the raw value of the terminating `RET` instruction.
///
/// `wirelen` is the length of the packet on the wire and is what `BPF_LEN` loads observe;
/// `pkt.len()` bounds every packet load. An empty program accepts the whole packet.
pub fn run<P: PacketView + ?Sized>(prog: &[BpfInsn], pkt: &P, wirelen: u32) -> u32 {
    if prog.is_empty() {
        return u32::MAX;
    }

    let mut a: u32 = 0;
    let mut x: u32 = 0;
    let mut mem = [0u32; BPF_MEMWORDS];
    let mut pc: usize = 0;

    loop {
        let Some(insn) = prog.get(pc) else {
            return 0;
        };
        pc += 1;

        let k = insn.k;
        match insn.class() {
            BPF_RET => {
                return match insn.rval() {
                    BPF_K => k,
                    BPF_A => a,
                    _ => 0,
                };
            }

            BPF_LD => {
                a = match insn.mode() {
                    BPF_ABS => match load(pkt, insn.size(), k as usize) {
                        Some(v) => v,
                        None => return 0,
                    },
                    BPF_IND => {
                        let Some(offset) = x.checked_add(k) else {
                            return 0;
                        };
                        match load(pkt, insn.size(), offset as usize) {
                            Some(v) => v,
                            None => return 0,
                        }
                    }
                    BPF_LEN if insn.size() == BPF_W => wirelen,
                    BPF_IMM => k,
                    BPF_MEM => match mem.get(k as usize) {
                        Some(v) => *v,
                        None => return 0,
                    },
                    _ => return 0,
                };
            }

            BPF_LDX => {
                x = match (insn.mode(), insn.size()) {
                    (BPF_IMM, BPF_W) => k,
                    (BPF_LEN, BPF_W) => wirelen,
                    (BPF_MEM, BPF_W) => match mem.get(k as usize) {
                        Some(v) => *v,
                        None => return 0,
                    },
                    (BPF_MSH, BPF_B) => match pkt.read_u8(k as usize) {
                        Ok(b) => ((b & 0x0f) as u32) << 2,
                        Err(_) => return 0,
                    },
                    _ => return 0,
                };
            }

            BPF_ST | BPF_STX => {
                let val = if insn.class() == BPF_ST { a } else { x };
                match mem.get_mut(k as usize) {
                    Some(slot) => *slot = val,
                    None => return 0,
                }
            }

            BPF_JMP => {
                if insn.op() == BPF_JA {
                    pc = match pc.checked_add(k as usize) {
                        Some(pc) => pc,
                        None => return 0,
                    };
                    continue;
                }

                let operand = if insn.src() == BPF_X { x } else { k };
                let cond = match insn.op() {
                    BPF_JEQ => a == operand,
                    BPF_JGT => a > operand,
                    BPF_JGE => a >= operand,
                    BPF_JSET => a & operand != 0,
                    _ => return 0,
                };

                pc += if cond { insn.jt } else { insn.jf } as usize;
            }

            BPF_ALU => {
                let operand = if insn.src() == BPF_X { x } else { k };
                a = match insn.op() {
                    BPF_ADD => a.wrapping_add(operand),
                    BPF_SUB => a.wrapping_sub(operand),
                    BPF_MUL => a.wrapping_mul(operand),
                    BPF_DIV => match a.checked_div(operand) {
                        Some(v) => v,
                        None => return 0,
                    },
                    BPF_MOD => match a.checked_rem(operand) {
                        Some(v) => v,
                        None => return 0,
                    },
                    BPF_OR => a | operand,
                    BPF_AND => a & operand,
                    BPF_XOR => a ^ operand,
                    BPF_LSH => a.checked_shl(operand).unwrap_or(0),
                    BPF_RSH => a.checked_shr(operand).unwrap_or(0),
                    BPF_NEG => a.wrapping_neg(),
                    _ => return 0,
                };
            }

            BPF_MISC => match insn.misc_op() {
                BPF_TAX => x = a,
                BPF_TXA => a = x,
                _ => return 0,
            },

            _ => return 0,
        }
    }
}

#[inline]
fn load<P: PacketView + ?Sized>(pkt: &P, size: u16, offset: usize) -> Option<u32> {
    match size {
        BPF_W => pkt.read_u32(offset).ok(),
        BPF_H => pkt.read_u16(offset).ok().map(u32::from),
        BPF_B => pkt.read_u8(offset).ok().map(u32::from),
        _ => None,
    }
}
