//! The machine: a 6510 on the system bus, the drive on its own
//! timeline, and the scheduler that keeps every chip honest.
//!
//! Per instruction the main loop (1) lets the CPU execute, (2) drives
//! the VIC pipeline up to the CPU's cycle, (3) services every chip
//! whose `next_update` has been crossed, (4) samples the IRQ/NMI
//! lines, then (5) lets the drive catch up.  The IEC bus is the only
//! synchronization surface between the two CPU timelines.

use log::{info, warn};

use crate::banks::{
    Bank, BasicRomBank, CharacterRomBank, ColorRamBank, KernalRomBank, SystemRamBank,
};
use crate::chip::{self, irq_source, IoChip};
use crate::cia::{self, Cia};
use crate::config::Config;
use crate::cpu::{Bus, Cpu, StepResult};
use crate::drive::handler::DriveHandler;
use crate::drive::Drive;
use crate::error::{Error, Result};
use crate::event::{EventSink, HostEvent};
use crate::iec::{IecBus, IecLine, CONTROLLER};
use crate::joystick::Joystick;
use crate::keyboard::KeyboardMatrix;
use crate::mmu::{Mmu, PageSource};
use crate::perf::PerfMeter;
use crate::roms::RomSet;
use crate::sid::Sid;
use crate::snapshot::{SnapshotReader, SnapshotWriter, VERSION};
use crate::vic::{Vic, VicMemory};

/// Cycles after reset before the machine reports itself ready.
const BOOT_READY_CYCLES: u64 = 2_000_000;

// ── System bus ────────────────────────────────────────────────

/// Everything the 6510 can reach, plus the serial bus heading out the
/// back.
pub struct SystemBus {
    pub mmu: Mmu,
    pub ram: SystemRamBank,
    pub kernal: KernalRomBank,
    pub basic: BasicRomBank,
    pub chargen: CharacterRomBank,
    pub color_ram: ColorRamBank,

    pub vic: Vic,
    pub cia1: Cia,
    pub cia2: Cia,
    pub sid: Sid,

    pub keyboard: KeyboardMatrix,
    pub joystick1: Joystick,
    pub joystick2: Joystick,

    pub iec: IecBus,

    /// VIC bank from CIA2 port A (already un-inverted).
    vic_bank: u8,
    /// Main CPU cycle mirror, so chip reads see current counters.
    cycle: u64,
    /// VIC cycles consumed so far.
    vic_cycles: u64,
    /// Set when CIA2 moved a serial line; the machine pokes the drive.
    iec_dirty: bool,
}

impl SystemBus {
    fn new(sample_rate: u32) -> Self {
        Self {
            mmu: Mmu::new(),
            ram: SystemRamBank::new(),
            kernal: KernalRomBank::new(),
            basic: BasicRomBank::new(),
            chargen: CharacterRomBank::new(),
            color_ram: ColorRamBank::new(),
            vic: Vic::new(),
            cia1: Cia::new("cia1"),
            cia2: Cia::new("cia2"),
            sid: Sid::new(sample_rate),
            keyboard: KeyboardMatrix::new(),
            joystick1: Joystick::new(),
            joystick2: Joystick::new(),
            iec: IecBus::new(),
            vic_bank: 0,
            cycle: 0,
            vic_cycles: 0,
            iec_dirty: false,
        }
    }

    pub fn vic_bank(&self) -> u8 {
        self.vic_bank
    }

    /// Advance the VIC pipeline to the CPU's committed cycle.
    fn run_vic_to(&mut self, target: u64) {
        let mem = VicMemory {
            ram: &self.ram.ram,
            char_rom: self.chargen.rom_ref(),
            color_ram: self.color_ram.as_slice(),
            bank: self.vic_bank,
        };
        self.vic.run_to(target, &mut self.vic_cycles, &mem);
    }

    /// Service the lazily-clocked chips.
    fn service_chips(&mut self, cycle: u64) {
        let mut chips: [&mut dyn IoChip; 3] = [&mut self.cia1, &mut self.cia2, &mut self.sid];
        chip::service(&mut chips, cycle);
    }

    fn take_iec_dirty(&mut self) -> bool {
        std::mem::take(&mut self.iec_dirty)
    }

    /// CIA2 port A: the low bits drive ATN/CLK/DATA on the serial bus,
    /// the two high bits select the VIC bank (inverted).
    fn sync_cia2_port(&mut self) {
        let pa = self.cia2.port_a_output();
        self.vic_bank = (!pa >> 6) & 0x03;
        self.iec.set(CONTROLLER, IecLine::Atn, pa & 0x01 != 0);
        self.iec.set(CONTROLLER, IecLine::Clk, pa & 0x02 != 0);
        self.iec.set(CONTROLLER, IecLine::Data, pa & 0x04 != 0);
        self.iec_dirty = true;
    }

    // ── IO window ($D000-$DFFF) ───────────────────────────────

    fn io_read(&mut self, addr: u16) -> u8 {
        match (addr >> 8) & 0x0F {
            0x0..=0x3 => self.vic.read((addr & 0x3F) as u8),
            0x4..=0x7 => {
                self.sid.update(self.cycle);
                self.sid.read((addr & 0x1F) as u8)
            }
            0x8..=0xB => self.color_ram.peek(addr),
            0xC => {
                self.cia1.update(self.cycle);
                let reg = (addr & 0x0F) as u8;
                match reg {
                    cia::PRA => {
                        // Port A reads fold in the matrix rows selected
                        // by port B, and joystick 2.
                        let cols = self.cia1.port_b_output() & self.joystick1.lines();
                        self.cia1.read(cia::PRA)
                            & self.keyboard.read_rows(cols)
                            & self.joystick2.lines()
                    }
                    cia::PRB => {
                        let rows = self.cia1.port_a_output() & self.joystick2.lines();
                        self.cia1.read(cia::PRB)
                            & self.keyboard.read_columns(rows)
                            & self.joystick1.lines()
                    }
                    _ => self.cia1.read(reg),
                }
            }
            0xD => {
                self.cia2.update(self.cycle);
                let reg = (addr & 0x0F) as u8;
                let mut value = self.cia2.read(reg);
                if reg == cia::PRA {
                    // CLK/DATA read back the wire, the OR of every
                    // open-collector contribution.
                    value &= !0x06;
                    if self.iec.clk() {
                        value |= 0x02;
                    }
                    if self.iec.data() {
                        value |= 0x04;
                    }
                }
                value
            }
            // IO1/IO2: nothing connected, the bus floats.
            _ => self.mmu.floating_bus_byte(),
        }
    }

    fn io_write(&mut self, addr: u16, value: u8) {
        match (addr >> 8) & 0x0F {
            0x0..=0x3 => self.vic.write((addr & 0x3F) as u8, value),
            0x4..=0x7 => {
                self.sid.update(self.cycle);
                self.sid.write((addr & 0x1F) as u8, value);
            }
            0x8..=0xB => self.color_ram.poke(addr, value),
            0xC => {
                self.cia1.update(self.cycle);
                self.cia1.write((addr & 0x0F) as u8, value);
            }
            0xD => {
                self.cia2.update(self.cycle);
                let reg = (addr & 0x0F) as u8;
                self.cia2.write(reg, value);
                if reg == cia::PRA || reg == cia::DDRA {
                    self.sync_cia2_port();
                }
            }
            _ => {}
        }
    }
}

impl Bus for SystemBus {
    fn read(&mut self, addr: u16) -> u8 {
        if addr < 2 {
            return self.mmu.read_port(addr);
        }
        match self.mmu.read_source(addr) {
            PageSource::Ram => self.ram.peek(addr),
            PageSource::BasicRom => self.basic.peek(addr),
            PageSource::KernalRom => self.kernal.peek(addr),
            PageSource::CharRom => self.chargen.peek(addr),
            PageSource::Io => self.io_read(addr),
        }
    }

    fn write(&mut self, addr: u16, value: u8) {
        if addr < 2 {
            self.mmu.write_port(addr, value);
            self.ram.poke(addr, value);
            return;
        }
        match self.mmu.write_source(addr) {
            PageSource::Io => {
                // Writes land in the RAM underneath as well.
                self.ram.poke(addr, value);
                self.io_write(addr, value);
            }
            _ => self.ram.poke(addr, value),
        }
    }

    fn take_stall(&mut self) -> u32 {
        self.vic.take_stall()
    }
}

// ── The machine ───────────────────────────────────────────────

pub struct C64 {
    pub cpu: Cpu,
    pub bus: SystemBus,
    pub drive: Drive,
    pub perf: PerfMeter,

    config: Config,
    events: EventSink,
    running: bool,
    fatal: Option<String>,
}

impl C64 {
    pub fn new(config: Config) -> Self {
        let mut c64 = Self {
            cpu: Cpu::new(),
            bus: SystemBus::new(config.sample_rate),
            drive: Drive::new(config.drive_level.into()),
            perf: PerfMeter::new(config.throttle, config.frame_skip),
            config,
            events: EventSink::disconnected(),
            running: true,
            fatal: None,
        };
        c64.bus.vic.set_frame_skip(c64.config.frame_skip);
        c64.reset();
        c64
    }

    /// Wire up the host event channel; returns the receiving end.
    pub fn connect_events(&mut self, capacity: usize) -> crossbeam_channel::Receiver<HostEvent> {
        let (sink, rx) = EventSink::channel(capacity);
        self.bus.vic.set_event_sink(sink.clone());
        self.bus.sid.set_event_sink(sink.clone());
        self.drive.set_event_sink(sink.clone());
        self.events = sink;
        rx
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn load_roms(&mut self, roms: &RomSet) {
        self.bus.kernal.set(Some(&roms.kernal));
        self.bus.basic.set(Some(&roms.basic));
        self.bus.chargen.set(Some(&roms.chargen));
        if let Some(ref dos) = roms.drive {
            self.drive.set_rom(dos);
        }
        info!("system ROMs installed");
    }

    pub fn attach_disk(&mut self, handler: Box<dyn DriveHandler>) {
        self.drive.attach_handler(handler);
    }

    pub fn detach_disk(&mut self) -> Option<Box<dyn DriveHandler>> {
        self.drive.detach_handler()
    }

    pub fn reset(&mut self) {
        self.bus.mmu.reset();
        self.bus.vic.reset();
        self.bus.cia1.reset();
        self.bus.cia2.reset();
        self.bus.sid.reset();
        self.bus.color_ram.reset();
        self.bus.ram.reset();
        self.bus.keyboard.reset();
        self.bus.joystick1.reset();
        self.bus.joystick2.reset();
        self.bus.iec.reset();
        self.bus.vic_bank = 0;
        self.bus.iec_dirty = false;
        self.cpu.reset(&mut self.bus);
        self.drive.reset(&mut self.bus.iec);
        self.perf.reset();
        self.running = true;
        self.fatal = None;
    }

    /// True once the machine has run long enough for the Kernal to
    /// have finished its boot housekeeping.
    pub fn is_ready(&self) -> bool {
        self.cpu.cycles > BOOT_READY_CYCLES
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Host stop/pause; takes effect at the instruction boundary.
    pub fn set_running(&mut self, running: bool) {
        self.running = running;
    }

    pub fn fatal_error(&self) -> Option<&str> {
        self.fatal.as_deref()
    }

    // ── Input ─────────────────────────────────────────────────

    pub fn key_down(&mut self, row: u8, col: u8) {
        self.bus.keyboard.key_down(row, col);
    }

    pub fn key_up(&mut self, row: u8, col: u8) {
        self.bus.keyboard.key_up(row, col);
    }

    // ── Execution ─────────────────────────────────────────────

    /// Execute one instruction and bring the rest of the machine up
    /// to date.
    pub fn step(&mut self) {
        if !self.running {
            return;
        }

        let result = self.cpu.step(&mut self.bus);
        if let StepResult::Unknown(op) = result {
            if self.config.fatal_decode {
                let msg = format!("unknown opcode {op:#04x} near {:#06x}", self.cpu.pc);
                warn!("{msg}");
                self.events.emit(HostEvent::Fault(msg.clone()));
                self.fatal = Some(msg);
                self.running = false;
                return;
            }
        }

        let now = self.cpu.cycles;
        self.bus.cycle = now;
        self.bus.run_vic_to(now);
        self.bus.service_chips(now);

        // Interrupt lines: level for IRQ, edge handled inside the CPU
        // for NMI.  The NMI line follows the NMI source set only.
        self.cpu.set_irq(irq_source::VIC, self.bus.vic.irq_asserted());
        self.cpu.set_irq(irq_source::CIA1, self.bus.cia1.irq_asserted());
        self.cpu.set_nmi(irq_source::CIA2, self.bus.cia2.irq_asserted());

        // Drive timeline: poked on serial line changes, then allowed
        // to catch up to the main CPU.
        if self.bus.take_iec_dirty() {
            self.drive.on_bus_activity(now, &mut self.bus.iec);
        }
        if self.drive.next_update() <= now {
            self.drive.run_to(now, &mut self.bus.iec);
        }

        if let Some(fault) = self.drive.iec.fault.take() {
            let msg = fault.to_string();
            self.events.emit(HostEvent::Fault(msg.clone()));
            self.fatal = Some(msg);
            self.running = false;
        }
    }

    /// Run until the VIC finishes the current frame, then apply the
    /// performance meter's advice.
    pub fn run_frame(&mut self) {
        let frame = self.bus.vic.frame_count();
        while self.running && self.bus.vic.frame_count() == frame {
            self.step();
        }
        let advice = self.perf.frame_boundary(self.cpu.cycles);
        self.bus.vic.set_frame_skip(advice.frame_skip);
        if let Some(nap) = advice.sleep {
            std::thread::sleep(nap);
        }
    }

    // ── Snapshot ──────────────────────────────────────────────

    /// Serialize the whole system in the stable component order.
    pub fn snapshot(&self) -> Vec<u8> {
        let mut w = SnapshotWriter::new();
        w.u32(VERSION);

        self.bus.cia1.save(&mut w);
        self.bus.cia2.save(&mut w);
        w.marker();

        self.bus.keyboard.save(&mut w);
        w.marker();

        self.bus.joystick1.save(&mut w);
        self.bus.joystick2.save(&mut w);
        w.marker();

        self.bus.iec.save(&mut w);
        w.marker();

        self.bus.sid.save(&mut w);
        w.marker();

        self.bus.vic.save(&mut w);
        w.marker();

        // The CPU section carries its address space: RAM, color RAM,
        // and the processor port.
        self.cpu.save(&mut w);
        self.bus.mmu.save(&mut w);
        w.bytes(&self.bus.ram.ram[..]);
        w.bytes(self.bus.color_ram.as_slice());
        w.u64(self.bus.vic_cycles);
        w.marker();

        self.drive.save(&mut w);
        w.marker();

        w.into_bytes()
    }

    /// Restore a snapshot.  Marker or version mismatches are fatal and
    /// leave the machine stopped.
    pub fn restore_snapshot(&mut self, bytes: &[u8]) -> Result<()> {
        let mut r = SnapshotReader::new(bytes);
        let version = r.u32()?;
        if version != VERSION {
            return Err(Error::Serialization(format!(
                "snapshot version {version}, this build reads {VERSION}"
            )));
        }

        self.bus.cia1.restore(&mut r)?;
        self.bus.cia2.restore(&mut r)?;
        r.expect_marker("cias")?;

        self.bus.keyboard.restore(&mut r)?;
        r.expect_marker("keyboard")?;

        self.bus.joystick1.restore(&mut r)?;
        self.bus.joystick2.restore(&mut r)?;
        r.expect_marker("joysticks")?;

        self.bus.iec.restore(&mut r)?;
        r.expect_marker("iec bus")?;

        self.bus.sid.restore(&mut r)?;
        r.expect_marker("sid")?;

        self.bus.vic.restore(&mut r)?;
        r.expect_marker("vic")?;

        self.cpu.restore(&mut r)?;
        self.bus.mmu.restore(&mut r)?;
        r.bytes_into(&mut self.bus.ram.ram[..])?;
        {
            let mut color = [0u8; 0x400];
            r.bytes_into(&mut color)?;
            for (i, v) in color.iter().enumerate() {
                self.bus.color_ram.poke(i as u16, *v);
            }
        }
        self.bus.vic_cycles = r.u64()?;
        r.expect_marker("cpu")?;

        self.drive.restore(&mut r)?;
        r.expect_marker("drives")?;

        // Derived wiring comes back from register state, not the
        // stream.
        self.bus.sync_cia2_port();
        self.bus.cycle = self.cpu.cycles;
        self.running = true;
        self.fatal = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vic::{CYCLES_PER_LINE, RASTER_LINES};

    fn machine() -> C64 {
        C64::new(Config::default())
    }

    /// Plant a tiny program in always-RAM space and aim the CPU at it.
    fn inject(c64: &mut C64, addr: u16, program: &[u8]) {
        for (i, &b) in program.iter().enumerate() {
            c64.bus.ram.ram[addr as usize + i] = b;
        }
        c64.cpu.pc = addr;
    }

    #[test]
    fn reset_boots_from_kernal_vector() {
        let mut c64 = machine();
        // Stub Kernal parks the CPU at $FCE2.
        assert_eq!(c64.cpu.pc, 0xFCE2);
        for _ in 0..100 {
            c64.step();
        }
        assert_eq!(c64.cpu.pc, 0xFCE2);
        assert!(c64.is_running());
        assert!(!c64.is_ready()); // not enough cycles yet
    }

    #[test]
    fn processor_port_banks_io_in_and_out() {
        let mut c64 = machine();
        // Power-on: IO visible, a VIC write lands in the chip.
        c64.bus.write(0xD020, 14);
        assert_eq!(c64.bus.vic.regs[0x20], 14);
        // Bank everything out: the same address is plain RAM.
        c64.bus.write(0x0001, 0x30);
        c64.bus.write(0xD020, 0x55);
        assert_eq!(c64.bus.read(0xD020), 0x55);
        assert_eq!(c64.bus.vic.regs[0x20], 14);
    }

    #[test]
    fn raster_irq_vectors_through_fffe() {
        let mut c64 = machine();
        // Raster compare at line $37, raster IRQ enabled.
        c64.bus.write(0xD012, 0x37);
        c64.bus.write(0xD01A, 0x01);
        // CLI; JMP * in RAM.
        inject(&mut c64, 0xC000, &[0x58, 0x4C, 0x01, 0xC0]);

        let mut vectored_at_line = None;
        for _ in 0..(RASTER_LINES * CYCLES_PER_LINE * 2) {
            c64.step();
            // The stub Kernal's IRQ entry is $FF48.
            if c64.cpu.pc == 0xFF48 {
                vectored_at_line = Some(c64.bus.vic.raster_line());
                break;
            }
        }
        assert_eq!(vectored_at_line, Some(0x37));
        assert!(c64.cpu.flags.i);
    }

    #[test]
    fn cia1_timer_interrupts_the_cpu() {
        let mut c64 = machine();
        inject(&mut c64, 0xC000, &[0x58, 0x4C, 0x01, 0xC0]);
        // Timer A: latch 1000, continuous, interrupt enabled.
        c64.bus.write(0xDC0D, 0x81);
        c64.bus.write(0xDC04, 0xE8);
        c64.bus.write(0xDC05, 0x03);
        c64.bus.write(0xDC0E, 0x01);

        let mut vectored = false;
        for _ in 0..4000 {
            c64.step();
            if c64.cpu.pc == 0xFF48 {
                vectored = true;
                break;
            }
        }
        assert!(vectored);
        // Acknowledging through the ICR read drops the line.
        let icr = c64.bus.read(0xDC0D);
        assert_eq!(icr & 0x81, 0x81);
        assert!(!c64.bus.cia1.irq_asserted());
    }

    #[test]
    fn keyboard_reaches_cia1_port_reads() {
        let mut c64 = machine();
        c64.key_down(1, 2);
        // Select row 1 (active low) on port A, read columns on port B.
        c64.bus.write(0xDC02, 0xFF); // DDRA all output
        c64.bus.write(0xDC00, !(1 << 1));
        let cols = c64.bus.read(0xDC01);
        assert_eq!(cols, 0xFF & !(1 << 2));
        c64.key_up(1, 2);
        assert_eq!(c64.bus.read(0xDC01), 0xFF);
    }

    #[test]
    fn cia2_port_moves_serial_lines_and_vic_bank() {
        let mut c64 = machine();
        c64.bus.write(0xDD02, 0xFF); // DDRA output
        // ATN + CLK asserted on the low bits, VIC bank 2 on the
        // inverted high bits.
        c64.bus.write(0xDD00, 0x40 | 0x03);
        assert!(c64.bus.iec.atn());
        assert!(c64.bus.iec.clk());
        assert!(!c64.bus.iec.data());
        assert_eq!(c64.bus.vic_bank(), 2);
        // Reading the port reflects the wire state on CLK/DATA.
        let pa = c64.bus.read(0xDD00);
        assert_eq!(pa & 0x02, 0x02); // CLK pulled
        assert_eq!(pa & 0x04, 0x00); // DATA released
    }

    #[test]
    fn vic_stall_charges_the_cpu() {
        let mut c64 = machine();
        // Enable the display so bad lines occur.
        c64.bus.write(0xD011, 0x10);
        inject(&mut c64, 0xC000, &[0x4C, 0x00, 0xC0]); // JMP *

        // Two frames' worth of stepping; the machine must keep the
        // VIC and CPU timelines glued together throughout.
        let frames = c64.bus.vic.frame_count();
        while c64.bus.vic.frame_count() < frames + 2 {
            c64.step();
        }
        assert_eq!(c64.bus.vic_cycles, c64.cpu.cycles);
    }

    #[test]
    fn snapshot_roundtrip_restores_execution() {
        let mut a = machine();
        inject(&mut a, 0xC000, &[0xE8, 0x4C, 0x01, 0xC0]); // INX; JMP loop
        a.bus.write(0xDC04, 0x10); // give CIA1 some timer state
        a.bus.write(0xDC0E, 0x01);
        a.key_down(3, 4);
        for _ in 0..500 {
            a.step();
        }

        let bytes = a.snapshot();
        let mut b = machine();
        b.restore_snapshot(&bytes).unwrap();

        assert_eq!(b.cpu.pc, a.cpu.pc);
        assert_eq!(b.cpu.x, a.cpu.x);
        assert_eq!(b.cpu.cycles, a.cpu.cycles);
        assert_eq!(b.bus.vic.raster_line(), a.bus.vic.raster_line());
        assert_eq!(b.bus.keyboard.rows(), a.bus.keyboard.rows());

        // Both machines must continue identically.
        for _ in 0..2000 {
            a.step();
            b.step();
            assert_eq!(a.cpu.pc, b.cpu.pc);
            assert_eq!(a.cpu.cycles, b.cpu.cycles);
            assert_eq!(a.cpu.x, b.cpu.x);
        }
    }

    #[test]
    fn snapshot_marker_corruption_is_refused() {
        let a = machine();
        let mut bytes = a.snapshot();
        // Stomp the first marker (after the two CIA blocks).
        let pos = bytes.iter().position(|&b| b == crate::snapshot::MARKER).unwrap();
        bytes[pos] = 0x00;
        let mut b = machine();
        assert!(matches!(
            b.restore_snapshot(&bytes),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn snapshot_sample_rate_mismatch_is_refused() {
        let a = machine();
        let bytes = a.snapshot();
        let mut config = Config::default();
        config.sample_rate = 48_000;
        let mut b = C64::new(config);
        assert!(matches!(
            b.restore_snapshot(&bytes),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn frame_events_reach_the_host() {
        let mut c64 = machine();
        let rx = c64.connect_events(64);
        inject(&mut c64, 0xC000, &[0x4C, 0x00, 0xC0]);
        let f = c64.bus.vic.frame_count();
        while c64.bus.vic.frame_count() == f {
            c64.step();
        }
        let mut saw_frame = false;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, HostEvent::FrameReady { .. }) {
                saw_frame = true;
            }
        }
        assert!(saw_frame);
    }
}
