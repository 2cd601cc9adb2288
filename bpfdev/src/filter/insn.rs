// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Nathaniel Bennett <me[at]nathanielbennett[dotcom]>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Classic BPF instruction encoding.

/// A single classic BPF instruction.
///
/// - `code`: opcode composed of class | size | mode (or class | op | source)
/// - `jt`/`jf`: relative jump offsets taken when a conditional jump is true/false
/// - `k`: generic constant (immediate value, packet offset, scratch index, jump offset)
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BpfInsn {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

const _: () = assert!(std::mem::size_of::<BpfInsn>() == 8);

impl BpfInsn {
    #[inline]
    pub const fn new(code: u16, jt: u8, jf: u8, k: u32) -> Self {
        Self { code, jt, jf, k }
    }

    #[inline]
    pub const fn class(&self) -> u16 {
        self.code & 0x07
    }

    #[inline]
    pub const fn size(&self) -> u16 {
        self.code & 0x18
    }

    #[inline]
    pub const fn mode(&self) -> u16 {
        self.code & 0xe0
    }

    #[inline]
    pub const fn op(&self) -> u16 {
        self.code & 0xf0
    }

    #[inline]
    pub const fn src(&self) -> u16 {
        self.code & 0x08
    }

    #[inline]
    pub const fn rval(&self) -> u16 {
        self.code & 0x18
    }

    #[inline]
    pub const fn misc_op(&self) -> u16 {
        self.code & 0xf8
    }
}

/// Builds a non-jump instruction (`BPF_STMT`).
#[inline]
pub const fn stmt(code: u16, k: u32) -> BpfInsn {
    BpfInsn::new(code, 0, 0, k)
}

/// Builds a jump instruction (`BPF_JUMP`).
#[inline]
pub const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> BpfInsn {
    BpfInsn::new(code, jt, jf, k)
}

// Instruction classes
pub const BPF_LD: u16 = 0x00;
pub const BPF_LDX: u16 = 0x01;
pub const BPF_ST: u16 = 0x02;
pub const BPF_STX: u16 = 0x03;
pub const BPF_ALU: u16 = 0x04;
pub const BPF_JMP: u16 = 0x05;
pub const BPF_RET: u16 = 0x06;
pub const BPF_MISC: u16 = 0x07;

// ld/ldx sizes
pub const BPF_W: u16 = 0x00;
pub const BPF_H: u16 = 0x08;
pub const BPF_B: u16 = 0x10;

// ld/ldx modes
pub const BPF_IMM: u16 = 0x00;
pub const BPF_ABS: u16 = 0x20;
pub const BPF_IND: u16 = 0x40;
pub const BPF_MEM: u16 = 0x60;
pub const BPF_LEN: u16 = 0x80;
pub const BPF_MSH: u16 = 0xa0;

// alu operations
pub const BPF_ADD: u16 = 0x00;
pub const BPF_SUB: u16 = 0x10;
pub const BPF_MUL: u16 = 0x20;
pub const BPF_DIV: u16 = 0x30;
pub const BPF_OR: u16 = 0x40;
pub const BPF_AND: u16 = 0x50;
pub const BPF_LSH: u16 = 0x60;
pub const BPF_RSH: u16 = 0x70;
pub const BPF_NEG: u16 = 0x80;
pub const BPF_MOD: u16 = 0x90;
pub const BPF_XOR: u16 = 0xa0;

// jmp operations
pub const BPF_JA: u16 = 0x00;
pub const BPF_JEQ: u16 = 0x10;
pub const BPF_JGT: u16 = 0x20;
pub const BPF_JGE: u16 = 0x30;
pub const BPF_JSET: u16 = 0x40;

// operand sources
pub const BPF_K: u16 = 0x00;
pub const BPF_X: u16 = 0x08;

// ret values
pub const BPF_A: u16 = 0x10;

// misc operations
pub const BPF_TAX: u16 = 0x00;
pub const BPF_TXA: u16 = 0x80;

/// Number of 32-bit scratch memory words available to a program.
pub const BPF_MEMWORDS: usize = 16;
