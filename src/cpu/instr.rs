//! The 6502 instruction table: 151 documented opcodes plus the
//! undocumented set, with addressing modes, base cycle costs, and the
//! page-boundary penalty flag.
//!
//! Undocumented mnemonics follow the oldstyle names (ASO/LSE/DCM/INS...)
//! so the table reads like the classic extra-instruction listings.

/// Addressing mode of one table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrMode {
    Imp,
    Acc,
    Imm,
    Abs,
    AbsX,
    AbsY,
    Ind,
    IndX,
    IndY,
    Zp,
    ZpX,
    ZpY,
    Rel,
}

/// Operation kind.  `Unk` marks the twelve halt slots; those are also
/// where the drive installs its synthetic trap opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    // Documented
    Adc, And, Asl, Bcc, Bcs, Beq, Bit, Bmi, Bne, Bpl, Brk, Bvc, Bvs, Clc,
    Cld, Cli, Clv, Cmp, Cpx, Cpy, Dec, Dex, Dey, Eor, Inc, Inx, Iny, Jmp,
    Jsr, Lda, Ldx, Ldy, Lsr, Nop, Ora, Pha, Php, Pla, Plp, Rol, Ror, Rti,
    Rts, Sbc, Sec, Sed, Sei, Sta, Stx, Sty, Tax, Tay, Tsx, Txa, Txs, Tya,
    // Undocumented
    Alr, Anc, Arr, Aso, Axa, Axs, Dcm, Ins, Lax, Lse, Oal, Rla, Rra, Sax,
    Say, Skb, Skw, Tas, Xaa, Xas, Las,
    // Halt / unassigned
    Unk,
}

/// One decoded table entry.
#[derive(Debug, Clone, Copy)]
pub struct Instr {
    pub op: Op,
    pub mode: AddrMode,
    pub cycles: u8,
    /// One extra cycle when the effective address crosses a page.
    pub page_penalty: bool,
}

const fn i(op: Op, mode: AddrMode, cycles: u8) -> Instr {
    Instr { op, mode, cycles, page_penalty: false }
}

const fn p(op: Op, mode: AddrMode, cycles: u8) -> Instr {
    Instr { op, mode, cycles, page_penalty: true }
}

use AddrMode::*;
use Op::*;

/// Decode table indexed by opcode byte.
#[rustfmt::skip]
pub static INSTRUCTIONS: [Instr; 256] = [
    // 0x00
    i(Brk, Imp, 7), i(Ora, IndX, 6), i(Unk, Imp, 2), i(Aso, IndX, 8),
    i(Skb, Zp, 3),  i(Ora, Zp, 3),   i(Asl, Zp, 5),  i(Aso, Zp, 5),
    i(Php, Imp, 3), i(Ora, Imm, 2),  i(Asl, Acc, 2), i(Anc, Imm, 2),
    i(Skw, Abs, 4), i(Ora, Abs, 4),  i(Asl, Abs, 6), i(Aso, Abs, 6),
    // 0x10
    i(Bpl, Rel, 2), p(Ora, IndY, 5), i(Unk, Imp, 2), i(Aso, IndY, 8),
    i(Skb, ZpX, 4), i(Ora, ZpX, 4),  i(Asl, ZpX, 6), i(Aso, ZpX, 6),
    i(Clc, Imp, 2), p(Ora, AbsY, 4), i(Nop, Imp, 2), i(Aso, AbsY, 7),
    p(Skw, AbsX, 4), p(Ora, AbsX, 4), i(Asl, AbsX, 7), i(Aso, AbsX, 7),
    // 0x20
    i(Jsr, Abs, 6), i(And, IndX, 6), i(Unk, Imp, 2), i(Rla, IndX, 8),
    i(Bit, Zp, 3),  i(And, Zp, 3),   i(Rol, Zp, 5),  i(Rla, Zp, 5),
    i(Plp, Imp, 4), i(And, Imm, 2),  i(Rol, Acc, 2), i(Anc, Imm, 2),
    i(Bit, Abs, 4), i(And, Abs, 4),  i(Rol, Abs, 6), i(Rla, Abs, 6),
    // 0x30
    i(Bmi, Rel, 2), p(And, IndY, 5), i(Unk, Imp, 2), i(Rla, IndY, 8),
    i(Skb, ZpX, 4), i(And, ZpX, 4),  i(Rol, ZpX, 6), i(Rla, ZpX, 6),
    i(Sec, Imp, 2), p(And, AbsY, 4), i(Nop, Imp, 2), i(Rla, AbsY, 7),
    p(Skw, AbsX, 4), p(And, AbsX, 4), i(Rol, AbsX, 7), i(Rla, AbsX, 7),
    // 0x40
    i(Rti, Imp, 6), i(Eor, IndX, 6), i(Unk, Imp, 2), i(Lse, IndX, 8),
    i(Skb, Zp, 3),  i(Eor, Zp, 3),   i(Lsr, Zp, 5),  i(Lse, Zp, 5),
    i(Pha, Imp, 3), i(Eor, Imm, 2),  i(Lsr, Acc, 2), i(Alr, Imm, 2),
    i(Jmp, Abs, 3), i(Eor, Abs, 4),  i(Lsr, Abs, 6), i(Lse, Abs, 6),
    // 0x50
    i(Bvc, Rel, 2), p(Eor, IndY, 5), i(Unk, Imp, 2), i(Lse, IndY, 8),
    i(Skb, ZpX, 4), i(Eor, ZpX, 4),  i(Lsr, ZpX, 6), i(Lse, ZpX, 6),
    i(Cli, Imp, 2), p(Eor, AbsY, 4), i(Nop, Imp, 2), i(Lse, AbsY, 7),
    p(Skw, AbsX, 4), p(Eor, AbsX, 4), i(Lsr, AbsX, 7), i(Lse, AbsX, 7),
    // 0x60
    i(Rts, Imp, 6), i(Adc, IndX, 6), i(Unk, Imp, 2), i(Rra, IndX, 8),
    i(Skb, Zp, 3),  i(Adc, Zp, 3),   i(Ror, Zp, 5),  i(Rra, Zp, 5),
    i(Pla, Imp, 4), i(Adc, Imm, 2),  i(Ror, Acc, 2), i(Arr, Imm, 2),
    i(Jmp, Ind, 5), i(Adc, Abs, 4),  i(Ror, Abs, 6), i(Rra, Abs, 6),
    // 0x70
    i(Bvs, Rel, 2), p(Adc, IndY, 5), i(Unk, Imp, 2), i(Rra, IndY, 8),
    i(Skb, ZpX, 4), i(Adc, ZpX, 4),  i(Ror, ZpX, 6), i(Rra, ZpX, 6),
    i(Sei, Imp, 2), p(Adc, AbsY, 4), i(Nop, Imp, 2), i(Rra, AbsY, 7),
    p(Skw, AbsX, 4), p(Adc, AbsX, 4), i(Ror, AbsX, 7), i(Rra, AbsX, 7),
    // 0x80
    i(Skb, Imm, 2), i(Sta, IndX, 6), i(Skb, Imm, 2), i(Axs, IndX, 6),
    i(Sty, Zp, 3),  i(Sta, Zp, 3),   i(Stx, Zp, 3),  i(Axs, Zp, 3),
    i(Dey, Imp, 2), i(Skb, Imm, 2),  i(Txa, Imp, 2), i(Xaa, Imm, 2),
    i(Sty, Abs, 4), i(Sta, Abs, 4),  i(Stx, Abs, 4), i(Axs, Abs, 4),
    // 0x90
    i(Bcc, Rel, 2), i(Sta, IndY, 6), i(Unk, Imp, 2), i(Axa, IndY, 6),
    i(Sty, ZpX, 4), i(Sta, ZpX, 4),  i(Stx, ZpY, 4), i(Axs, ZpY, 4),
    i(Tya, Imp, 2), i(Sta, AbsY, 5), i(Txs, Imp, 2), i(Tas, AbsY, 5),
    i(Say, AbsX, 5), i(Sta, AbsX, 5), i(Xas, AbsY, 5), i(Axa, AbsY, 5),
    // 0xA0
    i(Ldy, Imm, 2), i(Lda, IndX, 6), i(Ldx, Imm, 2), i(Lax, IndX, 6),
    i(Ldy, Zp, 3),  i(Lda, Zp, 3),   i(Ldx, Zp, 3),  i(Lax, Zp, 3),
    i(Tay, Imp, 2), i(Lda, Imm, 2),  i(Tax, Imp, 2), i(Oal, Imm, 2),
    i(Ldy, Abs, 4), i(Lda, Abs, 4),  i(Ldx, Abs, 4), i(Lax, Abs, 4),
    // 0xB0
    i(Bcs, Rel, 2), p(Lda, IndY, 5), i(Unk, Imp, 2), p(Lax, IndY, 5),
    i(Ldy, ZpX, 4), i(Lda, ZpX, 4),  i(Ldx, ZpY, 4), i(Lax, ZpY, 4),
    i(Clv, Imp, 2), p(Lda, AbsY, 4), i(Tsx, Imp, 2), p(Las, AbsY, 4),
    p(Ldy, AbsX, 4), p(Lda, AbsX, 4), p(Ldx, AbsY, 4), p(Lax, AbsY, 4),
    // 0xC0
    i(Cpy, Imm, 2), i(Cmp, IndX, 6), i(Skb, Imm, 2), i(Dcm, IndX, 8),
    i(Cpy, Zp, 3),  i(Cmp, Zp, 3),   i(Dec, Zp, 5),  i(Dcm, Zp, 5),
    i(Iny, Imp, 2), i(Cmp, Imm, 2),  i(Dex, Imp, 2), i(Sax, Imm, 2),
    i(Cpy, Abs, 4), i(Cmp, Abs, 4),  i(Dec, Abs, 6), i(Dcm, Abs, 6),
    // 0xD0
    i(Bne, Rel, 2), p(Cmp, IndY, 5), i(Unk, Imp, 2), i(Dcm, IndY, 8),
    i(Skb, ZpX, 4), i(Cmp, ZpX, 4),  i(Dec, ZpX, 6), i(Dcm, ZpX, 6),
    i(Cld, Imp, 2), p(Cmp, AbsY, 4), i(Nop, Imp, 2), i(Dcm, AbsY, 7),
    p(Skw, AbsX, 4), p(Cmp, AbsX, 4), i(Dec, AbsX, 7), i(Dcm, AbsX, 7),
    // 0xE0
    i(Cpx, Imm, 2), i(Sbc, IndX, 6), i(Skb, Imm, 2), i(Ins, IndX, 8),
    i(Cpx, Zp, 3),  i(Sbc, Zp, 3),   i(Inc, Zp, 5),  i(Ins, Zp, 5),
    i(Inx, Imp, 2), i(Sbc, Imm, 2),  i(Nop, Imp, 2), i(Sbc, Imm, 2),
    i(Cpx, Abs, 4), i(Sbc, Abs, 4),  i(Inc, Abs, 6), i(Ins, Abs, 6),
    // 0xF0
    i(Beq, Rel, 2), p(Sbc, IndY, 5), i(Unk, Imp, 2), i(Ins, IndY, 8),
    i(Skb, ZpX, 4), i(Sbc, ZpX, 4),  i(Inc, ZpX, 6), i(Ins, ZpX, 6),
    i(Sed, Imp, 2), p(Sbc, AbsY, 4), i(Nop, Imp, 2), i(Ins, AbsY, 7),
    p(Skw, AbsX, 4), p(Sbc, AbsX, 4), i(Inc, AbsX, 7), i(Ins, AbsX, 7),
];
