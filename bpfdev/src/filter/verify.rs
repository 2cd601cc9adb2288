// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Nathaniel Bennett <me[at]nathanielbennett[dotcom]>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Static checks a program must pass before it may be installed on a descriptor.

use super::insn::*;
use crate::error::{BpfError, Result};

/// Checks that `prog` is a well-formed classic BPF program of at most `max_insns` instructions.
///
/// A valid program:
/// - is non-empty and no longer than `max_insns`;
/// - consists only of known opcodes;
/// - only jumps forward to instructions within the program;
/// - only addresses scratch memory words `0..BPF_MEMWORDS`;
/// - never divides (or takes the modulus) by a constant zero;
/// - ends with a `RET` instruction.
pub fn validate(prog: &[BpfInsn], max_insns: usize) -> Result<()> {
    if prog.is_empty() {
        return Err(BpfError::InvalidFilter("empty program"));
    }

    if prog.len() > max_insns {
        return Err(BpfError::InvalidFilter("program too long"));
    }

    let len = prog.len();
    for (pc, insn) in prog.iter().enumerate() {
        // Offsets of jumps are relative to the following instruction.
        let next = pc + 1;

        match insn.class() {
            BPF_LD => match insn.mode() {
                BPF_ABS | BPF_IND => {
                    if !matches!(insn.size(), BPF_W | BPF_H | BPF_B) {
                        return Err(BpfError::InvalidFilter("invalid load size"));
                    }
                }
                BPF_IMM => (),
                BPF_LEN if insn.size() == BPF_W => (),
                BPF_MEM => check_mem(insn.k)?,
                _ => return Err(BpfError::InvalidFilter("invalid load mode")),
            },
            BPF_LDX => match (insn.mode(), insn.size()) {
                (BPF_IMM, BPF_W) | (BPF_LEN, BPF_W) | (BPF_MSH, BPF_B) => (),
                (BPF_MEM, BPF_W) => check_mem(insn.k)?,
                _ => return Err(BpfError::InvalidFilter("invalid index load")),
            },
            BPF_ST | BPF_STX => check_mem(insn.k)?,
            BPF_ALU => match insn.op() {
                BPF_DIV | BPF_MOD => {
                    if insn.src() == BPF_K && insn.k == 0 {
                        return Err(BpfError::InvalidFilter("division by constant zero"));
                    }
                }
                BPF_ADD | BPF_SUB | BPF_MUL | BPF_OR | BPF_AND | BPF_XOR | BPF_LSH | BPF_RSH
                | BPF_NEG => (),
                _ => return Err(BpfError::InvalidFilter("invalid alu operation")),
            },
            BPF_JMP => match insn.op() {
                BPF_JA => {
                    let in_range = (insn.k as usize)
                        .checked_add(next)
                        .map_or(false, |target| target < len);
                    if !in_range {
                        return Err(BpfError::InvalidFilter("jump out of range"));
                    }
                }
                BPF_JEQ | BPF_JGT | BPF_JGE | BPF_JSET => {
                    if next + insn.jt as usize >= len || next + insn.jf as usize >= len {
                        return Err(BpfError::InvalidFilter("jump out of range"));
                    }
                }
                _ => return Err(BpfError::InvalidFilter("invalid jump operation")),
            },
            BPF_RET => {
                if !matches!(insn.rval(), BPF_K | BPF_A) {
                    return Err(BpfError::InvalidFilter("invalid return source"));
                }
            }
            BPF_MISC => {
                if !matches!(insn.misc_op(), BPF_TAX | BPF_TXA) {
                    return Err(BpfError::InvalidFilter("invalid misc operation"));
                }
            }
            _ => return Err(BpfError::InvalidFilter("invalid instruction class")),
        }
    }

    match prog.last() {
        Some(last) if last.class() == BPF_RET => Ok(()),
        _ => Err(BpfError::InvalidFilter("program does not end with a return")),
    }
}

#[inline]
fn check_mem(k: u32) -> Result<()> {
    if (k as usize) < BPF_MEMWORDS {
        Ok(())
    } else {
        Err(BpfError::InvalidFilter("scratch memory index out of range"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 512;

    #[test]
    fn accepts_well_formed_program() {
        let prog = [
            stmt(BPF_LD | BPF_H | BPF_ABS, 12),
            jump(BPF_JMP | BPF_JEQ | BPF_K, 0x0800, 0, 1),
            stmt(BPF_RET | BPF_K, u32::MAX),
            stmt(BPF_RET | BPF_K, 0),
        ];
        assert!(validate(&prog, MAX).is_ok());
    }

    #[test]
    fn rejects_empty_and_oversized() {
        assert!(validate(&[], MAX).is_err());
        let prog = vec![stmt(BPF_RET | BPF_K, 0); 4];
        assert!(validate(&prog, 3).is_err());
        assert!(validate(&prog, 4).is_ok());
    }

    #[test]
    fn rejects_out_of_range_jumps() {
        let prog = [
            jump(BPF_JMP | BPF_JEQ | BPF_K, 0, 0, 1),
            stmt(BPF_RET | BPF_K, 0),
        ];
        assert!(validate(&prog, MAX).is_err());

        let prog = [stmt(BPF_JMP | BPF_JA, 1), stmt(BPF_RET | BPF_K, 0)];
        assert!(validate(&prog, MAX).is_err());

        let prog = [stmt(BPF_JMP | BPF_JA, u32::MAX), stmt(BPF_RET | BPF_K, 0)];
        assert!(validate(&prog, MAX).is_err());
    }

    #[test]
    fn rejects_bad_scratch_and_division() {
        let prog = [stmt(BPF_ST, 16), stmt(BPF_RET | BPF_K, 0)];
        assert!(validate(&prog, MAX).is_err());

        let prog = [stmt(BPF_ALU | BPF_DIV | BPF_K, 0), stmt(BPF_RET | BPF_K, 0)];
        assert!(validate(&prog, MAX).is_err());

        // Division by X is checked at runtime instead.
        let prog = [stmt(BPF_ALU | BPF_DIV | BPF_X, 0), stmt(BPF_RET | BPF_A, 0)];
        assert!(validate(&prog, MAX).is_ok());
    }

    #[test]
    fn requires_trailing_return() {
        let prog = [stmt(BPF_RET | BPF_K, 0), stmt(BPF_LD | BPF_IMM, 0)];
        assert!(validate(&prog, MAX).is_err());
    }

    #[test]
    fn rejects_unknown_opcodes() {
        let prog = [BpfInsn::new(0x00e0, 0, 0, 0), stmt(BPF_RET | BPF_K, 0)];
        assert!(validate(&prog, MAX).is_err());

        let prog = [stmt(BPF_MISC | 0x40, 0), stmt(BPF_RET | BPF_K, 0)];
        assert!(validate(&prog, MAX).is_err());
    }
}
