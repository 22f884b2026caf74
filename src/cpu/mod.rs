//! MOS 6502/6510 CPU core.
//!
//! Table-driven: one decode table entry per opcode byte (see
//! [`instr::INSTRUCTIONS`]), executed atomically with respect to external
//! observers.  Cycle accounting is static cost + page-cross penalties;
//! DMA stalls from the VIC are consumed as a counter before each step
//! rather than by spinning on a bus-available flag, which keeps the
//! co-scheduling deterministic.
//!
//! The same core runs the 6510 mainboard CPU and the 1541 drive CPU.  The
//! drive installs synthetic trap opcodes into the halt slots; `step`
//! reports those back to the caller instead of executing them.

pub mod instr;

use instr::{AddrMode, Instr, Op, INSTRUCTIONS};
use log::warn;

pub const NMI_VECTOR: u16 = 0xFFFA;
pub const RESET_VECTOR: u16 = 0xFFFC;
pub const IRQ_VECTOR: u16 = 0xFFFE;

const SP_BASE: u16 = 0x0100;

/// Address bus seen by the CPU.
pub trait Bus {
    fn read(&mut self, addr: u16) -> u8;
    fn write(&mut self, addr: u16, value: u8);

    /// Cycles the CPU must burn before its next access (VIC bus steal).
    /// Buses without contention keep the default.
    fn take_stall(&mut self) -> u32 {
        0
    }
}

/// Processor status flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    pub c: bool,
    pub z: bool,
    pub i: bool,
    pub d: bool,
    pub b: bool,
    pub v: bool,
    pub n: bool,
}

impl Flags {
    /// Pack to the stack layout.  Bit 5 always reads as set.
    pub fn to_byte(self, brk: bool) -> u8 {
        (self.c as u8)
            | (self.z as u8) << 1
            | (self.i as u8) << 2
            | (self.d as u8) << 3
            | (brk as u8) << 4
            | 1 << 5
            | (self.v as u8) << 6
            | (self.n as u8) << 7
    }

    pub fn from_byte(bits: u8) -> Self {
        Self {
            c: bits & 0x01 != 0,
            z: bits & 0x02 != 0,
            i: bits & 0x04 != 0,
            d: bits & 0x08 != 0,
            b: false,
            v: bits & 0x40 != 0,
            n: bits & 0x80 != 0,
        }
    }
}

/// Outcome of one `step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    Normal,
    /// A registered synthetic opcode was fetched; PC points past it.
    Trap { opcode: u8, at: u16 },
    /// An unassigned opcode was skipped.
    Unknown(u8),
}

enum Operand {
    None,
    Acc,
    Addr(u16),
}

pub struct Cpu {
    pub pc: u16,
    pub sp: u8,
    pub a: u8,
    pub x: u8,
    pub y: u8,
    pub flags: Flags,
    /// Committed cycle count.
    pub cycles: u64,

    irq_sources: u8,
    nmi_sources: u8,
    last_nmi_state: bool,

    /// Synthetic opcodes (drive ROM patches) reported as traps.
    traps: [bool; 256],
    warned: [bool; 256],
}

impl Cpu {
    pub fn new() -> Self {
        Self {
            pc: 0,
            sp: 0xFF,
            a: 0,
            x: 0,
            y: 0,
            flags: Flags { i: true, ..Flags::default() },
            cycles: 0,
            irq_sources: 0,
            nmi_sources: 0,
            last_nmi_state: false,
            traps: [false; 256],
            warned: [false; 256],
        }
    }

    /// Hardware reset: reload PC from the reset vector, set I.
    pub fn reset(&mut self, bus: &mut impl Bus) {
        self.sp = 0xFF;
        self.flags = Flags { i: true, ..Flags::default() };
        self.irq_sources = 0;
        self.nmi_sources = 0;
        self.last_nmi_state = false;
        self.pc = self.read_word(bus, RESET_VECTOR);
        self.cycles += 6;
    }

    // ── Interrupt lines ───────────────────────────────────────

    /// OR `source` into (or clear it from) the IRQ line set.  The line is
    /// asserted iff the set is non-empty.
    pub fn set_irq(&mut self, source: u8, asserted: bool) {
        if asserted {
            self.irq_sources |= source;
        } else {
            self.irq_sources &= !source;
        }
    }

    /// Same for the NMI line.  NMI is edge-sensitive: only a 0→1
    /// transition of the aggregate line vectors.
    pub fn set_nmi(&mut self, source: u8, asserted: bool) {
        if asserted {
            self.nmi_sources |= source;
        } else {
            self.nmi_sources &= !source;
        }
    }

    pub fn irq_line(&self) -> bool {
        self.irq_sources != 0
    }

    pub fn nmi_line(&self) -> bool {
        self.nmi_sources != 0
    }

    /// The 6502 SO pin.  The 1541 wires it to the disk controller's
    /// byte-ready signal.
    pub fn set_overflow_pin(&mut self) {
        self.flags.v = true;
    }

    // ── Trap opcodes ──────────────────────────────────────────

    /// Register a synthetic opcode.  `step` returns
    /// [`StepResult::Trap`] when it fetches one.
    pub fn install_trap(&mut self, opcode: u8) {
        self.traps[opcode as usize] = true;
    }

    pub fn clear_traps(&mut self) {
        self.traps = [false; 256];
    }

    pub(crate) fn save(&self, w: &mut crate::snapshot::SnapshotWriter) {
        w.u16(self.pc);
        w.u8(self.sp);
        w.u8(self.a);
        w.u8(self.x);
        w.u8(self.y);
        w.u8(self.flags.to_byte(self.flags.b));
        w.u64(self.cycles);
        w.u8(self.irq_sources);
        w.u8(self.nmi_sources);
        w.bool(self.last_nmi_state);
    }

    pub(crate) fn restore(
        &mut self,
        r: &mut crate::snapshot::SnapshotReader<'_>,
    ) -> crate::error::Result<()> {
        self.pc = r.u16()?;
        self.sp = r.u8()?;
        self.a = r.u8()?;
        self.x = r.u8()?;
        self.y = r.u8()?;
        self.flags = Flags::from_byte(r.u8()?);
        self.cycles = r.u64()?;
        self.irq_sources = r.u8()?;
        self.nmi_sources = r.u8()?;
        self.last_nmi_state = r.bool()?;
        Ok(())
    }

    // ── Execution ─────────────────────────────────────────────

    /// Execute one instruction (or vector to an interrupt handler).
    pub fn step(&mut self, bus: &mut impl Bus) -> StepResult {
        self.cycles += bus.take_stall() as u64;

        // NMI: edge-triggered on the aggregate line.
        let nmi_now = self.nmi_sources != 0;
        let nmi_edge = nmi_now && !self.last_nmi_state;
        self.last_nmi_state = nmi_now;
        if nmi_edge {
            self.vector(bus, NMI_VECTOR);
            return StepResult::Normal;
        }

        // IRQ: level-sensitive, gated by I.
        if self.irq_sources != 0 && !self.flags.i {
            self.vector(bus, IRQ_VECTOR);
            return StepResult::Normal;
        }

        let at = self.pc;
        let opcode = bus.read(at);
        self.pc = self.pc.wrapping_add(1);

        if self.traps[opcode as usize] {
            self.cycles += 2;
            return StepResult::Trap { opcode, at };
        }

        let instr = INSTRUCTIONS[opcode as usize];
        if instr.op == Op::Unk {
            if !self.warned[opcode as usize] {
                warn!("unknown opcode {opcode:#04x} at {at:#06x}, skipping");
                self.warned[opcode as usize] = true;
            }
            self.cycles += instr.cycles as u64;
            return StepResult::Unknown(opcode);
        }

        self.cycles += instr.cycles as u64;
        let operand = self.resolve(bus, &instr);
        self.exec(bus, instr.op, operand);
        StepResult::Normal
    }

    /// Push PC and status, set I, load the handler address.  Charges the
    /// 7-cycle interrupt sequence.
    fn vector(&mut self, bus: &mut impl Bus, vec: u16) {
        self.push(bus, (self.pc >> 8) as u8);
        self.push(bus, (self.pc & 0xFF) as u8);
        self.push(bus, self.flags.to_byte(false));
        self.flags.i = true;
        self.pc = self.read_word(bus, vec);
        self.cycles += 7;
    }

    // ── Addressing ────────────────────────────────────────────

    fn resolve(&mut self, bus: &mut impl Bus, instr: &Instr) -> Operand {
        match instr.mode {
            AddrMode::Imp => Operand::None,
            AddrMode::Acc => Operand::Acc,
            AddrMode::Imm => {
                let addr = self.pc;
                self.pc = self.pc.wrapping_add(1);
                Operand::Addr(addr)
            }
            AddrMode::Zp => Operand::Addr(self.fetch(bus) as u16),
            AddrMode::ZpX => Operand::Addr(self.fetch(bus).wrapping_add(self.x) as u16),
            AddrMode::ZpY => Operand::Addr(self.fetch(bus).wrapping_add(self.y) as u16),
            AddrMode::Abs => Operand::Addr(self.fetch_word(bus)),
            AddrMode::AbsX => {
                let base = self.fetch_word(bus);
                let addr = base.wrapping_add(self.x as u16);
                self.page_penalty(instr, base, addr);
                Operand::Addr(addr)
            }
            AddrMode::AbsY => {
                let base = self.fetch_word(bus);
                let addr = base.wrapping_add(self.y as u16);
                self.page_penalty(instr, base, addr);
                Operand::Addr(addr)
            }
            AddrMode::Ind => {
                // 6502 quirk: the pointer high byte does not carry
                // across a page.
                let ptr = self.fetch_word(bus);
                let lo = bus.read(ptr) as u16;
                let hi_addr = (ptr & 0xFF00) | (ptr.wrapping_add(1) & 0x00FF);
                let hi = bus.read(hi_addr) as u16;
                Operand::Addr(lo | (hi << 8))
            }
            AddrMode::IndX => {
                let zp = self.fetch(bus).wrapping_add(self.x);
                let lo = bus.read(zp as u16) as u16;
                let hi = bus.read(zp.wrapping_add(1) as u16) as u16;
                Operand::Addr(lo | (hi << 8))
            }
            AddrMode::IndY => {
                let zp = self.fetch(bus);
                let lo = bus.read(zp as u16) as u16;
                let hi = bus.read(zp.wrapping_add(1) as u16) as u16;
                let base = lo | (hi << 8);
                let addr = base.wrapping_add(self.y as u16);
                self.page_penalty(instr, base, addr);
                Operand::Addr(addr)
            }
            AddrMode::Rel => {
                let offset = self.fetch(bus) as i8;
                Operand::Addr(self.pc.wrapping_add(offset as u16))
            }
        }
    }

    fn page_penalty(&mut self, instr: &Instr, base: u16, addr: u16) {
        if instr.page_penalty && (base & 0xFF00) != (addr & 0xFF00) {
            self.cycles += 1;
        }
    }

    fn fetch(&mut self, bus: &mut impl Bus) -> u8 {
        let v = bus.read(self.pc);
        self.pc = self.pc.wrapping_add(1);
        v
    }

    fn fetch_word(&mut self, bus: &mut impl Bus) -> u16 {
        let lo = self.fetch(bus) as u16;
        let hi = self.fetch(bus) as u16;
        lo | (hi << 8)
    }

    fn read_word(&mut self, bus: &mut impl Bus, addr: u16) -> u16 {
        let lo = bus.read(addr) as u16;
        let hi = bus.read(addr.wrapping_add(1)) as u16;
        lo | (hi << 8)
    }

    // ── Stack ─────────────────────────────────────────────────

    fn push(&mut self, bus: &mut impl Bus, value: u8) {
        bus.write(SP_BASE + self.sp as u16, value);
        self.sp = self.sp.wrapping_sub(1);
    }

    fn pop(&mut self, bus: &mut impl Bus) -> u8 {
        self.sp = self.sp.wrapping_add(1);
        bus.read(SP_BASE + self.sp as u16)
    }

    // ── Flag helpers ──────────────────────────────────────────

    fn set_nz(&mut self, value: u8) {
        self.flags.z = value == 0;
        self.flags.n = value & 0x80 != 0;
    }

    // ── Operation dispatch ────────────────────────────────────

    fn load(&mut self, bus: &mut impl Bus, operand: &Operand) -> u8 {
        match operand {
            Operand::Acc => self.a,
            Operand::Addr(addr) => bus.read(*addr),
            Operand::None => 0,
        }
    }

    fn store(&mut self, bus: &mut impl Bus, operand: &Operand, value: u8) {
        match operand {
            Operand::Acc => self.a = value,
            Operand::Addr(addr) => bus.write(*addr, value),
            Operand::None => {}
        }
    }

    fn exec(&mut self, bus: &mut impl Bus, op: Op, operand: Operand) {
        match op {
            // ── Loads / stores / transfers ──
            Op::Lda => {
                self.a = self.load(bus, &operand);
                self.set_nz(self.a);
            }
            Op::Ldx => {
                self.x = self.load(bus, &operand);
                self.set_nz(self.x);
            }
            Op::Ldy => {
                self.y = self.load(bus, &operand);
                self.set_nz(self.y);
            }
            Op::Sta => self.store(bus, &operand, self.a),
            Op::Stx => self.store(bus, &operand, self.x),
            Op::Sty => self.store(bus, &operand, self.y),
            Op::Tax => {
                self.x = self.a;
                self.set_nz(self.x);
            }
            Op::Tay => {
                self.y = self.a;
                self.set_nz(self.y);
            }
            Op::Txa => {
                self.a = self.x;
                self.set_nz(self.a);
            }
            Op::Tya => {
                self.a = self.y;
                self.set_nz(self.a);
            }
            Op::Tsx => {
                self.x = self.sp;
                self.set_nz(self.x);
            }
            Op::Txs => self.sp = self.x,

            // ── Arithmetic ──
            Op::Adc => {
                let d = self.load(bus, &operand);
                self.adc(d);
            }
            Op::Sbc => {
                let d = self.load(bus, &operand);
                self.sbc(d);
            }
            Op::Cmp => {
                let d = self.load(bus, &operand);
                self.compare(self.a, d);
            }
            Op::Cpx => {
                let d = self.load(bus, &operand);
                self.compare(self.x, d);
            }
            Op::Cpy => {
                let d = self.load(bus, &operand);
                self.compare(self.y, d);
            }
            Op::Inc => {
                let v = self.load(bus, &operand).wrapping_add(1);
                self.store(bus, &operand, v);
                self.set_nz(v);
            }
            Op::Dec => {
                let v = self.load(bus, &operand).wrapping_sub(1);
                self.store(bus, &operand, v);
                self.set_nz(v);
            }
            Op::Inx => {
                self.x = self.x.wrapping_add(1);
                self.set_nz(self.x);
            }
            Op::Iny => {
                self.y = self.y.wrapping_add(1);
                self.set_nz(self.y);
            }
            Op::Dex => {
                self.x = self.x.wrapping_sub(1);
                self.set_nz(self.x);
            }
            Op::Dey => {
                self.y = self.y.wrapping_sub(1);
                self.set_nz(self.y);
            }

            // ── Logic ──
            Op::And => {
                self.a &= self.load(bus, &operand);
                self.set_nz(self.a);
            }
            Op::Ora => {
                self.a |= self.load(bus, &operand);
                self.set_nz(self.a);
            }
            Op::Eor => {
                self.a ^= self.load(bus, &operand);
                self.set_nz(self.a);
            }
            Op::Bit => {
                let d = self.load(bus, &operand);
                self.flags.z = self.a & d == 0;
                self.flags.n = d & 0x80 != 0;
                self.flags.v = d & 0x40 != 0;
            }

            // ── Shifts / rotates ──
            Op::Asl => {
                let d = self.load(bus, &operand);
                let v = self.asl(d);
                self.store(bus, &operand, v);
            }
            Op::Lsr => {
                let d = self.load(bus, &operand);
                let v = self.lsr(d);
                self.store(bus, &operand, v);
            }
            Op::Rol => {
                let d = self.load(bus, &operand);
                let v = self.rol(d);
                self.store(bus, &operand, v);
            }
            Op::Ror => {
                let d = self.load(bus, &operand);
                let v = self.ror(d);
                self.store(bus, &operand, v);
            }

            // ── Branches ──
            Op::Bcc => self.branch(&operand, !self.flags.c),
            Op::Bcs => self.branch(&operand, self.flags.c),
            Op::Bne => self.branch(&operand, !self.flags.z),
            Op::Beq => self.branch(&operand, self.flags.z),
            Op::Bpl => self.branch(&operand, !self.flags.n),
            Op::Bmi => self.branch(&operand, self.flags.n),
            Op::Bvc => self.branch(&operand, !self.flags.v),
            Op::Bvs => self.branch(&operand, self.flags.v),

            // ── Jumps / subroutines ──
            Op::Jmp => {
                if let Operand::Addr(addr) = operand {
                    self.pc = addr;
                }
            }
            Op::Jsr => {
                if let Operand::Addr(addr) = operand {
                    let ret = self.pc.wrapping_sub(1);
                    self.push(bus, (ret >> 8) as u8);
                    self.push(bus, (ret & 0xFF) as u8);
                    self.pc = addr;
                }
            }
            Op::Rts => {
                let lo = self.pop(bus) as u16;
                let hi = self.pop(bus) as u16;
                self.pc = (lo | (hi << 8)).wrapping_add(1);
            }
            Op::Rti => {
                let bits = self.pop(bus);
                self.flags = Flags::from_byte(bits);
                let lo = self.pop(bus) as u16;
                let hi = self.pop(bus) as u16;
                self.pc = lo | (hi << 8);
            }
            Op::Brk => {
                // BRK pushes PC past its padding byte, B set.
                let ret = self.pc.wrapping_add(1);
                self.push(bus, (ret >> 8) as u8);
                self.push(bus, (ret & 0xFF) as u8);
                self.push(bus, self.flags.to_byte(true));
                self.flags.i = true;
                self.pc = self.read_word(bus, IRQ_VECTOR);
            }

            // ── Stack ops ──
            Op::Pha => self.push(bus, self.a),
            Op::Pla => {
                self.a = self.pop(bus);
                self.set_nz(self.a);
            }
            Op::Php => {
                let bits = self.flags.to_byte(true);
                self.push(bus, bits);
            }
            Op::Plp => {
                let bits = self.pop(bus);
                self.flags = Flags::from_byte(bits);
            }

            // ── Flag ops ──
            Op::Clc => self.flags.c = false,
            Op::Sec => self.flags.c = true,
            Op::Cli => self.flags.i = false,
            Op::Sei => self.flags.i = true,
            Op::Clv => self.flags.v = false,
            Op::Cld => self.flags.d = false,
            Op::Sed => self.flags.d = true,
            Op::Nop => {}

            // ── Undocumented ──
            Op::Aso => {
                let d = self.load(bus, &operand);
                let v = self.asl(d);
                self.store(bus, &operand, v);
                self.a |= v;
                self.set_nz(self.a);
            }
            Op::Rla => {
                let d = self.load(bus, &operand);
                let v = self.rol(d);
                self.store(bus, &operand, v);
                self.a &= v;
                self.set_nz(self.a);
            }
            Op::Lse => {
                let d = self.load(bus, &operand);
                let v = self.lsr(d);
                self.store(bus, &operand, v);
                self.a ^= v;
                self.set_nz(self.a);
            }
            Op::Rra => {
                let d = self.load(bus, &operand);
                let v = self.ror(d);
                self.store(bus, &operand, v);
                self.adc(v);
            }
            Op::Axs => {
                let v = self.a & self.x;
                self.store(bus, &operand, v);
            }
            Op::Lax => {
                let d = self.load(bus, &operand);
                self.a = d;
                self.x = d;
                self.set_nz(d);
            }
            Op::Dcm => {
                let v = self.load(bus, &operand).wrapping_sub(1);
                self.store(bus, &operand, v);
                self.compare(self.a, v);
            }
            Op::Ins => {
                let v = self.load(bus, &operand).wrapping_add(1);
                self.store(bus, &operand, v);
                self.sbc(v);
            }
            Op::Alr => {
                let d = self.load(bus, &operand);
                self.a &= d;
                self.a = self.lsr(self.a);
            }
            Op::Arr => {
                let d = self.load(bus, &operand);
                let and = self.a & d;
                self.a = (and >> 1) | ((self.flags.c as u8) << 7);
                self.set_nz(self.a);
                self.flags.c = self.a & 0x40 != 0;
                self.flags.v = ((self.a >> 6) ^ (self.a >> 5)) & 1 != 0;
            }
            Op::Xaa => {
                let d = self.load(bus, &operand);
                self.a = self.x & d;
                self.set_nz(self.a);
            }
            Op::Oal => {
                let d = self.load(bus, &operand);
                let v = (self.a | 0xEE) & d;
                self.a = v;
                self.x = v;
                self.set_nz(v);
            }
            Op::Sax => {
                let d = self.load(bus, &operand);
                let ax = self.a & self.x;
                self.flags.c = ax >= d;
                self.x = ax.wrapping_sub(d);
                self.set_nz(self.x);
            }
            Op::Skb | Op::Skw => {
                let _ = self.load(bus, &operand);
            }
            Op::Axa => {
                if let Operand::Addr(addr) = operand {
                    let v = self.a & self.x & ((addr >> 8) as u8).wrapping_add(1);
                    bus.write(addr, v);
                }
            }
            Op::Say => {
                if let Operand::Addr(addr) = operand {
                    let v = self.y & ((addr >> 8) as u8).wrapping_add(1);
                    bus.write(addr, v);
                }
            }
            Op::Xas => {
                if let Operand::Addr(addr) = operand {
                    let v = self.x & ((addr >> 8) as u8).wrapping_add(1);
                    bus.write(addr, v);
                }
            }
            Op::Tas => {
                if let Operand::Addr(addr) = operand {
                    self.sp = self.a & self.x;
                    let v = self.sp & ((addr >> 8) as u8).wrapping_add(1);
                    bus.write(addr, v);
                }
            }
            Op::Anc => {
                let d = self.load(bus, &operand);
                self.a &= d;
                self.set_nz(self.a);
                self.flags.c = self.flags.n;
            }
            Op::Las => {
                let d = self.load(bus, &operand);
                let v = d & self.sp;
                self.a = v;
                self.x = v;
                self.sp = v;
                self.set_nz(v);
            }

            Op::Unk => unreachable!("filtered in step"),
        }
    }

    // ── ALU helpers ───────────────────────────────────────────

    fn adc(&mut self, d: u8) {
        let a = self.a;
        let carry = self.flags.c as u16;
        if self.flags.d {
            let mut lo = (a & 0x0F) as u16 + (d & 0x0F) as u16 + carry;
            if lo > 9 {
                lo += 6;
            }
            let mut hi = (a >> 4) as u16 + (d >> 4) as u16 + (lo > 0x0F) as u16;
            let bin = a as u16 + d as u16 + carry;
            self.flags.z = bin & 0xFF == 0;
            self.flags.n = hi & 0x08 != 0;
            let r = ((hi << 4) | (lo & 0x0F)) & 0xFF;
            self.flags.v =
                (a ^ d) & 0x80 == 0 && (a as u16 ^ r) & 0x80 != 0;
            if hi > 9 {
                hi += 6;
            }
            self.flags.c = hi > 0x0F;
            self.a = (((hi << 4) | (lo & 0x0F)) & 0xFF) as u8;
        } else {
            let sum = a as u16 + d as u16 + carry;
            let r = sum as u8;
            self.flags.c = sum > 0xFF;
            self.flags.v = (a ^ d) & 0x80 == 0 && (a ^ r) & 0x80 != 0;
            self.a = r;
            self.set_nz(r);
        }
    }

    fn sbc(&mut self, d: u8) {
        let a = self.a;
        let borrow = !self.flags.c as u16;
        let bin = (a as u16).wrapping_sub(d as u16).wrapping_sub(borrow);
        let r = bin as u8;
        self.flags.v = (a ^ r) & 0x80 != 0 && (a ^ d) & 0x80 != 0;
        self.flags.c = bin < 0x100;
        self.set_nz(r);
        if self.flags.d {
            let mut lo = (a & 0x0F) as i16 - (d & 0x0F) as i16 - borrow as i16;
            let mut hi = (a >> 4) as i16 - (d >> 4) as i16;
            if lo < 0 {
                lo += 10;
                hi -= 1;
            }
            if hi < 0 {
                hi += 10;
            }
            self.a = (((hi as u8) << 4) | (lo as u8 & 0x0F)) & 0xFF;
        } else {
            self.a = r;
        }
    }

    fn compare(&mut self, reg: u8, d: u8) {
        self.flags.c = reg >= d;
        self.set_nz(reg.wrapping_sub(d));
    }

    fn asl(&mut self, d: u8) -> u8 {
        self.flags.c = d & 0x80 != 0;
        let v = d << 1;
        self.set_nz(v);
        v
    }

    fn lsr(&mut self, d: u8) -> u8 {
        self.flags.c = d & 0x01 != 0;
        let v = d >> 1;
        self.set_nz(v);
        v
    }

    fn rol(&mut self, d: u8) -> u8 {
        let v = (d << 1) | self.flags.c as u8;
        self.flags.c = d & 0x80 != 0;
        self.set_nz(v);
        v
    }

    fn ror(&mut self, d: u8) -> u8 {
        let v = (d >> 1) | ((self.flags.c as u8) << 7);
        self.flags.c = d & 0x01 != 0;
        self.set_nz(v);
        v
    }

    fn branch(&mut self, operand: &Operand, taken: bool) {
        if !taken {
            return;
        }
        if let Operand::Addr(target) = operand {
            self.cycles += 1;
            if (self.pc & 0xFF00) != (target & 0xFF00) {
                self.cycles += 1;
            }
            self.pc = *target;
        }
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ram {
        mem: Vec<u8>,
    }

    impl Ram {
        fn new() -> Self {
            Self { mem: vec![0; 0x10000] }
        }

        fn load(&mut self, addr: u16, bytes: &[u8]) {
            self.mem[addr as usize..addr as usize + bytes.len()].copy_from_slice(bytes);
        }
    }

    impl Bus for Ram {
        fn read(&mut self, addr: u16) -> u8 {
            self.mem[addr as usize]
        }
        fn write(&mut self, addr: u16, value: u8) {
            self.mem[addr as usize] = value;
        }
    }

    fn cpu_at(pc: u16) -> Cpu {
        let mut cpu = Cpu::new();
        cpu.pc = pc;
        cpu
    }

    #[test]
    fn lda_sta_roundtrip() {
        let mut bus = Ram::new();
        bus.load(0x1000, &[0xA9, 0x42, 0x8D, 0x00, 0x20]); // LDA #$42; STA $2000
        let mut cpu = cpu_at(0x1000);
        cpu.step(&mut bus);
        cpu.step(&mut bus);
        assert_eq!(bus.mem[0x2000], 0x42);
        assert_eq!(cpu.cycles, 2 + 4);
    }

    #[test]
    fn page_cross_penalty_on_lda_abs_x() {
        let mut bus = Ram::new();
        bus.load(0x1000, &[0xBD, 0xFF, 0x20]); // LDA $20FF,X
        let mut cpu = cpu_at(0x1000);
        cpu.x = 1;
        cpu.step(&mut bus);
        assert_eq!(cpu.cycles, 5); // 4 + 1 page cross
    }

    #[test]
    fn store_abs_x_never_pays_penalty() {
        let mut bus = Ram::new();
        bus.load(0x1000, &[0x9D, 0xFF, 0x20]); // STA $20FF,X
        let mut cpu = cpu_at(0x1000);
        cpu.x = 1;
        cpu.a = 7;
        cpu.step(&mut bus);
        assert_eq!(cpu.cycles, 5);
        assert_eq!(bus.mem[0x2100], 7);
    }

    #[test]
    fn branch_cycle_accounting() {
        // A branch costs its base cycles, +1 taken, +2 across a page.
        let mut bus = Ram::new();
        bus.load(0x1000, &[0xD0, 0x02]); // BNE +2 (taken, same page)
        let mut cpu = cpu_at(0x1000);
        cpu.flags.z = false;
        cpu.step(&mut bus);
        assert_eq!(cpu.cycles, 3);
        assert_eq!(cpu.pc, 0x1004);

        // Not taken: base cost only.
        let mut bus = Ram::new();
        bus.load(0x1000, &[0xD0, 0x02]);
        let mut cpu = cpu_at(0x1000);
        cpu.flags.z = true;
        cpu.step(&mut bus);
        assert_eq!(cpu.cycles, 2);

        // Taken across a page: +2.
        let mut bus = Ram::new();
        bus.load(0x10FD, &[0xD0, 0x10]);
        let mut cpu = cpu_at(0x10FD);
        cpu.flags.z = false;
        cpu.step(&mut bus);
        assert_eq!(cpu.cycles, 4);
    }

    #[test]
    fn adc_overflow_flag() {
        let mut bus = Ram::new();
        bus.load(0x1000, &[0x69, 0x50]); // ADC #$50
        let mut cpu = cpu_at(0x1000);
        cpu.a = 0x50;
        cpu.step(&mut bus);
        assert_eq!(cpu.a, 0xA0);
        assert!(cpu.flags.v);
        assert!(cpu.flags.n);
        assert!(!cpu.flags.c);
    }

    #[test]
    fn adc_decimal_mode() {
        let mut bus = Ram::new();
        bus.load(0x1000, &[0x69, 0x19]); // ADC #$19 (BCD 19)
        let mut cpu = cpu_at(0x1000);
        cpu.flags.d = true;
        cpu.a = 0x28; // BCD 28
        cpu.step(&mut bus);
        assert_eq!(cpu.a, 0x47); // BCD 47
        assert!(!cpu.flags.c);
    }

    #[test]
    fn sbc_decimal_mode() {
        let mut bus = Ram::new();
        bus.load(0x1000, &[0xE9, 0x19]); // SBC #$19
        let mut cpu = cpu_at(0x1000);
        cpu.flags.d = true;
        cpu.flags.c = true;
        cpu.a = 0x47;
        cpu.step(&mut bus);
        assert_eq!(cpu.a, 0x28);
        assert!(cpu.flags.c);
    }

    #[test]
    fn jmp_indirect_page_wrap_quirk() {
        let mut bus = Ram::new();
        bus.load(0x1000, &[0x6C, 0xFF, 0x20]); // JMP ($20FF)
        bus.mem[0x20FF] = 0x34;
        bus.mem[0x2000] = 0x12; // high byte from $2000, not $2100
        let mut cpu = cpu_at(0x1000);
        cpu.step(&mut bus);
        assert_eq!(cpu.pc, 0x1234);
    }

    #[test]
    fn irq_respects_i_flag_and_vectors() {
        let mut bus = Ram::new();
        bus.load(0x1000, &[0xEA, 0xEA]); // NOPs
        bus.mem[IRQ_VECTOR as usize] = 0x00;
        bus.mem[IRQ_VECTOR as usize + 1] = 0x30;
        let mut cpu = cpu_at(0x1000);
        cpu.flags.i = true;
        cpu.set_irq(1, true);
        cpu.step(&mut bus);
        assert_eq!(cpu.pc, 0x1001); // masked

        cpu.flags.i = false;
        let before = cpu.cycles;
        cpu.step(&mut bus);
        assert_eq!(cpu.pc, 0x3000);
        assert!(cpu.flags.i);
        assert_eq!(cpu.cycles - before, 7);
    }

    #[test]
    fn nmi_is_edge_triggered() {
        let mut bus = Ram::new();
        bus.load(0x1000, &[0xEA, 0xEA, 0xEA]);
        bus.mem[NMI_VECTOR as usize] = 0x00;
        bus.mem[NMI_VECTOR as usize + 1] = 0x40;
        bus.mem[0x4000] = 0xEA;
        let mut cpu = cpu_at(0x1000);
        cpu.set_nmi(1, true);
        cpu.step(&mut bus);
        assert_eq!(cpu.pc, 0x4000);
        // Line still held: no second vectoring.
        cpu.step(&mut bus);
        assert_eq!(cpu.pc, 0x4001);
    }

    #[test]
    fn undocumented_lax_loads_both() {
        let mut bus = Ram::new();
        bus.load(0x1000, &[0xA7, 0x10]); // LAX $10
        bus.mem[0x10] = 0x5A;
        let mut cpu = cpu_at(0x1000);
        cpu.step(&mut bus);
        assert_eq!(cpu.a, 0x5A);
        assert_eq!(cpu.x, 0x5A);
    }

    #[test]
    fn undocumented_aso_shifts_and_ors() {
        let mut bus = Ram::new();
        bus.load(0x1000, &[0x07, 0x10]); // ASO $10
        bus.mem[0x10] = 0x81;
        let mut cpu = cpu_at(0x1000);
        cpu.a = 0x01;
        cpu.step(&mut bus);
        assert_eq!(bus.mem[0x10], 0x02);
        assert_eq!(cpu.a, 0x03);
        assert!(cpu.flags.c);
    }

    #[test]
    fn unknown_opcode_advances_one_byte() {
        let mut bus = Ram::new();
        bus.load(0x1000, &[0x02, 0xEA]);
        let mut cpu = cpu_at(0x1000);
        let r = cpu.step(&mut bus);
        assert_eq!(r, StepResult::Unknown(0x02));
        assert_eq!(cpu.pc, 0x1001);
    }

    #[test]
    fn trap_opcode_reported() {
        let mut bus = Ram::new();
        bus.load(0x1000, &[0x12]);
        let mut cpu = cpu_at(0x1000);
        cpu.install_trap(0x12);
        let r = cpu.step(&mut bus);
        assert_eq!(r, StepResult::Trap { opcode: 0x12, at: 0x1000 });
    }

    #[test]
    fn overflow_pin_sets_v() {
        let mut cpu = Cpu::new();
        assert!(!cpu.flags.v);
        cpu.set_overflow_pin();
        assert!(cpu.flags.v);
    }

    #[test]
    fn brk_pushes_past_padding_byte() {
        let mut bus = Ram::new();
        bus.load(0x1000, &[0x00, 0xFF]); // BRK + padding
        bus.mem[IRQ_VECTOR as usize] = 0x00;
        bus.mem[IRQ_VECTOR as usize + 1] = 0x50;
        let mut cpu = cpu_at(0x1000);
        cpu.step(&mut bus);
        assert_eq!(cpu.pc, 0x5000);
        assert!(cpu.flags.i);
        // Pushed return address is $1002, status has B set.
        assert_eq!(bus.mem[0x01FF], 0x10);
        assert_eq!(bus.mem[0x01FE], 0x02);
        assert_eq!(bus.mem[0x01FD] & 0x10, 0x10);
    }

    #[test]
    fn jsr_rts_roundtrip() {
        let mut bus = Ram::new();
        bus.load(0x1000, &[0x20, 0x00, 0x20]); // JSR $2000
        bus.load(0x2000, &[0x60]); // RTS
        let mut cpu = cpu_at(0x1000);
        cpu.step(&mut bus);
        assert_eq!(cpu.pc, 0x2000);
        cpu.step(&mut bus);
        assert_eq!(cpu.pc, 0x1003);
        assert_eq!(cpu.cycles, 6 + 6);
    }

    #[test]
    fn sbc_sets_borrow_flags() {
        let mut bus = Ram::new();
        bus.load(0x1000, &[0xE9, 0x40]); // SBC #$40
        let mut cpu = cpu_at(0x1000);
        cpu.a = 0x30;
        cpu.flags.c = true;
        cpu.step(&mut bus);
        assert_eq!(cpu.a, 0xF0);
        assert!(!cpu.flags.c); // borrow occurred
        assert!(cpu.flags.n);
    }

    #[test]
    fn undocumented_anc_copies_n_into_c() {
        let mut bus = Ram::new();
        bus.load(0x1000, &[0x0B, 0xF0]); // ANC #$F0
        let mut cpu = cpu_at(0x1000);
        cpu.a = 0x80;
        cpu.step(&mut bus);
        assert_eq!(cpu.a, 0x80);
        assert!(cpu.flags.n);
        assert!(cpu.flags.c);
    }

    #[test]
    fn undocumented_sax_subtracts_into_x() {
        let mut bus = Ram::new();
        bus.load(0x1000, &[0xCB, 0x05]); // SAX #$05
        let mut cpu = cpu_at(0x1000);
        cpu.a = 0x0F;
        cpu.x = 0x07; // A & X = 7
        cpu.step(&mut bus);
        assert_eq!(cpu.x, 0x02);
        assert!(cpu.flags.c);
    }

    #[test]
    fn undocumented_dcm_decrements_then_compares() {
        let mut bus = Ram::new();
        bus.load(0x1000, &[0xC7, 0x10]); // DCM $10
        bus.mem[0x10] = 0x43;
        let mut cpu = cpu_at(0x1000);
        cpu.a = 0x42;
        cpu.step(&mut bus);
        assert_eq!(bus.mem[0x10], 0x42);
        assert!(cpu.flags.z); // A == M after decrement
        assert!(cpu.flags.c);
    }

    #[test]
    fn undocumented_ins_increments_then_sbcs() {
        let mut bus = Ram::new();
        bus.load(0x1000, &[0xE7, 0x10]); // INS $10
        bus.mem[0x10] = 0x0F;
        let mut cpu = cpu_at(0x1000);
        cpu.a = 0x20;
        cpu.flags.c = true;
        cpu.step(&mut bus);
        assert_eq!(bus.mem[0x10], 0x10);
        assert_eq!(cpu.a, 0x10);
    }

    #[test]
    fn undocumented_las_masks_stack_pointer() {
        let mut bus = Ram::new();
        bus.load(0x1000, &[0xBB, 0x00, 0x20]); // LAS $2000,Y
        bus.mem[0x2005] = 0x0F;
        let mut cpu = cpu_at(0x1000);
        cpu.y = 5;
        cpu.sp = 0xF3;
        cpu.step(&mut bus);
        assert_eq!(cpu.a, 0x03);
        assert_eq!(cpu.x, 0x03);
        assert_eq!(cpu.sp, 0x03);
    }

    #[test]
    fn undocumented_axs_stores_a_and_x() {
        let mut bus = Ram::new();
        bus.load(0x1000, &[0x87, 0x10]); // AXS $10
        let mut cpu = cpu_at(0x1000);
        cpu.a = 0xF0;
        cpu.x = 0x3C;
        cpu.flags.z = false;
        cpu.step(&mut bus);
        assert_eq!(bus.mem[0x10], 0x30);
        // Store only: no flag update.
        assert!(!cpu.flags.z);
    }

    #[test]
    fn skb_and_skw_consume_operands() {
        let mut bus = Ram::new();
        bus.load(0x1000, &[0x80, 0x12, 0x0C, 0x34, 0x12]); // SKB #; SKW abs
        let mut cpu = cpu_at(0x1000);
        cpu.step(&mut bus);
        assert_eq!(cpu.pc, 0x1002);
        cpu.step(&mut bus);
        assert_eq!(cpu.pc, 0x1005);
        assert_eq!(cpu.cycles, 2 + 4);
    }

    #[test]
    fn php_always_pushes_b_set() {
        let mut bus = Ram::new();
        bus.load(0x1000, &[0x08]); // PHP
        let mut cpu = cpu_at(0x1000);
        cpu.step(&mut bus);
        assert_eq!(bus.mem[0x01FF] & 0x30, 0x30);
    }

    #[test]
    fn indirect_x_wraps_in_zero_page() {
        let mut bus = Ram::new();
        bus.load(0x1000, &[0xA1, 0xFE]); // LDA ($FE,X)
        bus.mem[0xFF] = 0x00; // pointer low at $FF
        bus.mem[0x00] = 0x30; // pointer high wraps to $00
        bus.mem[0x3000] = 0x77;
        let mut cpu = cpu_at(0x1000);
        cpu.x = 1;
        cpu.step(&mut bus);
        assert_eq!(cpu.a, 0x77);
    }
}
