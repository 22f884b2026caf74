//! The 1541 drive subsystem.
//!
//! Two emulation levels hide behind one type:
//!
//! - **Full**: the drive's own 6502 runs DOS ROM code against two VIAs
//!   while the disk rotates underneath the head.  Six ROM entry points
//!   are replaced with synthetic opcodes that trap into host-speed
//!   routines (the job loop, ROM test, the idle wait, an open-file
//!   trace, and the write-path sync hunters).
//! - **IecOnly**: no CPU at all; an [`IecDrive`] state machine speaks
//!   the serial protocol directly against the handler.
//!
//! Either way the drive sleeps after ~a second of inactivity and an
//! ATN edge from the controller wakes it and resynchronizes its clock.

pub mod bus;
pub mod gcr;
pub mod handler;
pub mod iec_drive;
pub mod via;

use log::{debug, info, warn};

use bus::DriveBus;
use handler::{DriveHandler, SECTORS_PER_TRACK};
use iec_drive::IecDrive;

use crate::chip::{irq_source, IoChip, NEVER};
use crate::cpu::{Cpu, StepResult};
use crate::event::{EventSink, HostEvent};
use crate::iec::{IecBus, IecLine, DEVICE_8};

/// Disk rotation: CPU cycles per GCR byte under the head.
pub const INTERVAL_MOVE_TO_NEXT_BYTE: u64 = 30;
/// Idle cycles before the drive powers down its emulation.
pub const DEACTIVATION_CYCLES: u64 = 1_000_000;

// Patched DOS ROM entry points and the synthetic opcodes installed
// there.  These six addresses are the synchronization points between
// emulated 6502 code and host-fast code.
pub const PATCH_JOB_LOOP: u16 = 0xF2B0;
pub const PATCH_ROM_TEST: u16 = 0xEA71;
pub const PATCH_IDLE_WAIT: u16 = 0xEBFF;
pub const PATCH_OPEN_FILE: u16 = 0xD005;
pub const PATCH_WRITE_SYNC: u16 = 0xF56E;
pub const PATCH_WRITE_DONE: u16 = 0xF58A;

pub const TRAP_JOB_LOOP: u8 = 0x02;
pub const TRAP_ROM_TEST: u8 = 0x12;
pub const TRAP_IDLE_WAIT: u8 = 0x22;
pub const TRAP_OPEN_FILE: u8 = 0x32;
pub const TRAP_WRITE_SYNC: u8 = 0x42;
pub const TRAP_WRITE_DONE: u8 = 0x52;

// 1541 job queue layout: job codes from $00, (track, sector) pairs
// from $06, data buffers at $0300-$07FF.
const JOB_SLOTS: usize = 5;
const JOB_TRACK_BASE: usize = 0x06;
const BUFFER_BASE: usize = 0x0300;

const JOB_READ: u8 = 0x80;
const JOB_WRITE: u8 = 0x90;
const JOB_VERIFY: u8 = 0xA0;
const JOB_SEEK: u8 = 0xB0;
const JOB_BUMP: u8 = 0xC0;
const JOB_JUMP: u8 = 0xD0;
const JOB_EXECUTE: u8 = 0xE0;

const JOB_OK: u8 = 0x01;
const JOB_ERROR_NOT_FOUND: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulationLevel {
    Full,
    IecOnly,
}

pub struct Drive {
    pub level: EmulationLevel,
    pub cpu: Cpu,
    pub bus: DriveBus,
    pub iec: IecDrive,

    handler: Option<Box<dyn DriveHandler>>,

    // ── Mechanics (full emulation) ──
    /// Head position in half-tracks, bounded to [2..70]; even values
    /// sit on a full track (track = half_track / 2).
    half_track: u8,
    prev_stepper: u8,
    motor_on: bool,
    led_on: bool,
    sector: u8,
    gcr_sector: Vec<u8>,
    gcr_pos: usize,
    dirty: bool,
    next_rotation: u64,

    sleeping: bool,
    last_activity: u64,
    pub cycles: u64,

    events: EventSink,
}

impl Drive {
    pub fn new(level: EmulationLevel) -> Self {
        let mut drive = Self {
            level,
            cpu: Cpu::new(),
            bus: DriveBus::new(),
            iec: IecDrive::new(DEVICE_8, 8),
            handler: None,
            half_track: 36, // track 18, the directory track
            prev_stepper: 0,
            motor_on: false,
            led_on: false,
            sector: 0,
            gcr_sector: Vec::new(),
            gcr_pos: 0,
            dirty: false,
            next_rotation: 0,
            sleeping: false,
            last_activity: 0,
            cycles: 0,
            events: EventSink::disconnected(),
        };
        drive.install_stub_rom();
        drive.install_traps();
        drive
    }

    pub fn set_event_sink(&mut self, sink: EventSink) {
        self.events = sink;
    }

    /// Load a real 16 KiB DOS ROM; the six patches go back in on top.
    pub fn set_rom(&mut self, rom: &[u8]) {
        let len = rom.len().min(0x4000);
        self.bus.rom[..len].copy_from_slice(&rom[..len]);
        self.install_patches();
        info!("drive: ROM loaded ({len} bytes), patches installed");
    }

    pub fn attach_handler(&mut self, handler: Box<dyn DriveHandler>) {
        self.handler = Some(handler);
        self.load_current_sector();
    }

    /// Detach the image.  A written-to image announces itself first.
    pub fn detach_handler(&mut self) -> Option<Box<dyn DriveHandler>> {
        let handler = self.handler.take()?;
        if handler.was_modified() {
            self.events.emit(HostEvent::DiskModified { label: handler.label() });
        }
        self.gcr_sector.clear();
        Some(handler)
    }

    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    pub fn handler_mut(&mut self) -> Option<&mut dyn DriveHandler> {
        match &mut self.handler {
            Some(b) => Some(&mut **b),
            None => None,
        }
    }

    pub fn track(&self) -> u8 {
        self.half_track / 2
    }

    pub fn is_sleeping(&self) -> bool {
        self.sleeping
    }

    pub fn reset(&mut self, iec_bus: &mut IecBus) {
        self.bus.reset();
        self.cpu = Cpu::new();
        self.install_traps();
        self.cpu.pc = self.bus.reset_vector();
        self.iec.reset(iec_bus);
        self.half_track = 36;
        self.prev_stepper = 0;
        self.motor_on = false;
        self.led_on = false;
        self.sector = 0;
        self.gcr_pos = 0;
        self.dirty = false;
        self.sleeping = false;
        self.load_current_sector();
    }

    pub(crate) fn save(&self, w: &mut crate::snapshot::SnapshotWriter) {
        w.u8(match self.level {
            EmulationLevel::Full => 0,
            EmulationLevel::IecOnly => 1,
        });
        self.cpu.save(w);
        w.bytes(&self.bus.ram);
        self.bus.via1.save(w);
        self.bus.via2.save(w);
        self.iec.save(w);
        w.u8(self.half_track);
        w.u8(self.prev_stepper);
        w.bool(self.motor_on);
        w.bool(self.led_on);
        w.u8(self.sector);
        w.u32(self.gcr_pos as u32);
        w.bool(self.dirty);
        w.u64(self.next_rotation);
        w.bool(self.sleeping);
        w.u64(self.last_activity);
        w.u64(self.cycles);
    }

    pub(crate) fn restore(
        &mut self,
        r: &mut crate::snapshot::SnapshotReader<'_>,
    ) -> crate::error::Result<()> {
        self.level = match r.u8()? {
            0 => EmulationLevel::Full,
            _ => EmulationLevel::IecOnly,
        };
        self.cpu.restore(r)?;
        r.bytes_into(&mut self.bus.ram)?;
        self.bus.via1.restore(r)?;
        self.bus.via2.restore(r)?;
        self.iec.restore(r)?;
        self.half_track = r.u8()?;
        self.prev_stepper = r.u8()?;
        self.motor_on = r.bool()?;
        self.led_on = r.bool()?;
        self.sector = r.u8()?;
        let gcr_pos = r.u32()? as usize;
        self.dirty = r.bool()?;
        self.next_rotation = r.u64()?;
        self.sleeping = r.bool()?;
        self.last_activity = r.u64()?;
        self.cycles = r.u64()?;
        self.install_traps();
        // The surface is re-encoded from the handler rather than
        // carried in the stream.
        self.load_current_sector();
        self.gcr_pos = if self.gcr_sector.is_empty() { 0 } else { gcr_pos % self.gcr_sector.len() };
        Ok(())
    }

    // ── Scheduling ────────────────────────────────────────────

    pub fn next_update(&self) -> u64 {
        if self.sleeping {
            return NEVER;
        }
        match self.level {
            EmulationLevel::IecOnly => self.iec.next_update(),
            EmulationLevel::Full => self.cycles + 1,
        }
    }

    /// The controller moved a line: wake if sleeping and let the
    /// protocol machine observe the change.
    pub fn on_bus_activity(&mut self, now: u64, iec_bus: &mut IecBus) {
        if iec_bus.take_atn_wakeup() && self.sleeping {
            debug!("drive: ATN wake-up, resyncing clock to {now}");
            self.sleeping = false;
            self.cycles = now;
        }
        self.last_activity = now;
        if self.level == EmulationLevel::IecOnly && !self.sleeping {
            let handler: Option<&mut dyn DriveHandler> = match &mut self.handler {
                Some(b) => Some(&mut **b),
                None => None,
            };
            self.iec.update(now, iec_bus, handler);
        }
    }

    /// Advance the drive timeline up to the main CPU's cycle count.
    pub fn run_to(&mut self, target: u64, iec_bus: &mut IecBus) {
        if self.sleeping {
            return;
        }
        match self.level {
            EmulationLevel::IecOnly => {
                let handler: Option<&mut dyn DriveHandler> = match &mut self.handler {
                    Some(b) => Some(&mut **b),
                    None => None,
                };
                self.iec.update(target, iec_bus, handler);
                let handler: Option<&mut dyn DriveHandler> = match &mut self.handler {
                    Some(b) => Some(&mut **b),
                    None => None,
                };
                self.iec.commit_writes(handler);
                self.cycles = target;
                if self.iec.is_idle() && target.saturating_sub(self.last_activity) > DEACTIVATION_CYCLES
                {
                    debug!("drive: idle, going to sleep");
                    self.sleeping = true;
                }
            }
            EmulationLevel::Full => {
                while self.cycles < target && !self.sleeping {
                    self.step_full(iec_bus);
                }
            }
        }
    }

    // ── Full emulation ────────────────────────────────────────

    fn step_full(&mut self, iec_bus: &mut IecBus) {
        // Mirror the serial lines into VIA1's port B inputs.
        self.sync_via1_inputs(iec_bus);

        self.bus.via1.update(self.cycles);
        self.bus.via2.update(self.cycles);

        let before = self.cpu.cycles;
        match self.cpu.step(&mut self.bus) {
            StepResult::Trap { opcode, at } => self.handle_trap(opcode, at),
            StepResult::Unknown(op) => {
                warn!("drive: unknown opcode {op:#04x}");
            }
            StepResult::Normal => {}
        }
        self.cycles += (self.cpu.cycles - before).max(1);

        // Project VIA1 outputs back onto the bus.
        self.sync_via1_outputs(iec_bus);
        // Disk mechanics follow VIA2's port B.
        self.update_mechanics();
        self.rotate_disk();

        self.cpu.set_irq(irq_source::VIA1, self.bus.via1.irq_asserted());
        self.cpu.set_irq(irq_source::VIA2, self.bus.via2.irq_asserted());
    }

    /// VIA1 port B inputs: bit 0 DATA in, bit 2 CLK in, bit 7 ATN in
    /// (inverted); CA1 follows ATN for the edge interrupt.
    fn sync_via1_inputs(&mut self, iec_bus: &IecBus) {
        let mut ext = self.bus.via1.external_b;
        ext = (ext & !0x01) | iec_bus.data() as u8;
        ext = (ext & !0x04) | ((iec_bus.clk() as u8) << 2);
        ext = (ext & !0x80) | ((!iec_bus.atn() as u8) << 7);
        self.bus.via1.external_b = ext;
        self.bus.via1.set_ca1(iec_bus.atn());
    }

    /// VIA1 port B outputs: bit 1 DATA out, bit 3 CLK out, bit 4 ATN
    /// acknowledge (pulls DATA by itself).
    fn sync_via1_outputs(&mut self, iec_bus: &mut IecBus) {
        let pb = self.bus.via1.port_b_output();
        let atn_ack = pb & 0x10 != 0 && iec_bus.atn();
        iec_bus.set(DEVICE_8, IecLine::Data, pb & 0x02 != 0 || atn_ack);
        iec_bus.set(DEVICE_8, IecLine::Clk, pb & 0x08 != 0);
    }

    /// VIA2 port B: stepper, motor, LED, write protect, sync.
    fn update_mechanics(&mut self) {
        let pb = self.bus.via2.port_b_output();

        let motor = pb & 0x04 != 0;
        let led = pb & 0x08 != 0;
        if motor != self.motor_on || led != self.led_on {
            if motor && !self.motor_on {
                // Spin-up: rotation resumes from now, not from the
                // whole idle gap.
                self.next_rotation = self.next_rotation.max(self.cycles);
            }
            self.motor_on = motor;
            self.led_on = led;
            self.events.emit(HostEvent::DriveActivity { motor, led });
        }

        // A ±1 change of the two stepper bits moves the head one
        // half-track.
        let phase = pb & 0x03;
        if phase != self.prev_stepper {
            let delta = (phase as i8 - self.prev_stepper as i8 + 4) % 4;
            match delta {
                1 => self.half_track = (self.half_track + 1).min(70),
                3 => self.half_track = self.half_track.saturating_sub(1).max(2),
                _ => {}
            }
            self.prev_stepper = phase;
            self.sector = 0;
            self.gcr_pos = 0;
            self.load_current_sector();
        }

        // Write-protect sense rides the disk-changed flag: the same
        // photocell flickers on a disk swap.
        let wp = if self.handler.as_ref().map(|h| h.was_modified()).unwrap_or(false) {
            0x10
        } else {
            0
        };
        self.bus.via2.external_b = (self.bus.via2.external_b & !0x10) | wp;
    }

    /// One GCR byte passes under the head roughly every 30 cycles.
    fn rotate_disk(&mut self) {
        if !self.motor_on || self.gcr_sector.is_empty() {
            return;
        }
        while self.next_rotation <= self.cycles {
            self.next_rotation += INTERVAL_MOVE_TO_NEXT_BYTE;

            // Write mode: DDRA fully output and PRA differing from the
            // surface overwrites the byte under the head.
            if self.bus.via2.ddr_a() == 0xFF {
                let out = self.bus.via2.regs[via::PRA as usize];
                if self.gcr_sector[self.gcr_pos] != out {
                    self.gcr_sector[self.gcr_pos] = out;
                    self.dirty = true;
                }
            }

            self.gcr_pos += 1;
            if self.gcr_pos >= self.gcr_sector.len() {
                self.finish_sector();
                if self.gcr_sector.is_empty() {
                    // The image was dropped on a decode failure.
                    return;
                }
            }

            let byte = self.gcr_sector[self.gcr_pos];
            self.bus.via2.external_a = byte;
            let over_sync = byte == gcr::SYNC;
            // Sync-in is active-low on PB7.
            self.bus.via2.external_b =
                (self.bus.via2.external_b & !0x80) | ((!over_sync as u8) << 7);
            if !over_sync {
                // Byte ready: CB1 edge plus the 6502's SO pin quirk.
                self.bus.via2.set_cb1(true);
                self.bus.via2.set_cb1(false);
                self.cpu.set_overflow_pin();
            }
        }
    }

    /// Sector boundary: commit a dirty sector through the handler and
    /// move to the next one on the track.
    fn finish_sector(&mut self) {
        let track = self.track();
        if self.dirty {
            self.dirty = false;
            let off = gcr::data_field_offset();
            let field = &self.gcr_sector[off..off + gcr::DATA_GCR_LEN];
            match gcr::decode_data_field(field) {
                Ok(payload) => {
                    if let Some(h) = self.handler.as_deref_mut() {
                        let r = h
                            .goto_block(track, self.sector)
                            .and_then(|_| h.write_block(&payload));
                        if let Err(e) = r {
                            warn!("drive: write-back failed: {e}");
                        }
                    }
                }
                Err(e) => {
                    // A GCR decode failure on write-back means the
                    // image is corrupt; drop it.
                    warn!("drive: {e}; detaching image");
                    self.detach_handler();
                    self.events.emit(HostEvent::Fault(format!("corrupt disk image: {e}")));
                }
            }
        }

        let per_track = SECTORS_PER_TRACK
            .get((track.max(1) - 1) as usize)
            .copied()
            .unwrap_or(17);
        self.sector = (self.sector + 1) % per_track;
        self.gcr_pos = 0;
        self.load_current_sector();
    }

    fn load_current_sector(&mut self) {
        let track = self.track();
        let on_half_track = self.half_track & 1 != 0;
        let Some(handler) = self.handler.as_deref_mut() else {
            self.gcr_sector.clear();
            return;
        };
        if on_half_track || !(1..=handler::TRACK_COUNT).contains(&track) {
            // Between tracks there is no sync to find.
            self.gcr_sector = vec![0; gcr::SECTOR_GCR_LEN];
            return;
        }
        let id = handler.disk_id();
        match handler.goto_block(track, self.sector) {
            Ok(()) => {
                let payload = handler.read_block();
                self.gcr_sector = gcr::encode_sector(track, self.sector, id, &payload);
            }
            Err(e) => {
                warn!("drive: cannot position to {track}/{}: {e}", self.sector);
                self.gcr_sector = vec![0; gcr::SECTOR_GCR_LEN];
            }
        }
        if self.gcr_pos >= self.gcr_sector.len() {
            self.gcr_pos = 0;
        }
    }

    // ── ROM patches ───────────────────────────────────────────

    /// Minimal stub ROM: reset goes straight to the idle-wait patch.
    fn install_stub_rom(&mut self) {
        self.bus.rom.fill(0xEA); // NOP carpet
        let idle = (PATCH_IDLE_WAIT & 0x3FFF) as usize;
        self.bus.rom[idle] = TRAP_IDLE_WAIT;
        self.bus.rom[0x3FFC] = (PATCH_IDLE_WAIT & 0xFF) as u8;
        self.bus.rom[0x3FFD] = (PATCH_IDLE_WAIT >> 8) as u8;
        self.cpu.pc = PATCH_IDLE_WAIT;
    }

    /// Drop the synthetic opcodes onto the six ROM entry points.
    fn install_patches(&mut self) {
        let rom = &mut self.bus.rom;
        rom[(PATCH_JOB_LOOP & 0x3FFF) as usize] = TRAP_JOB_LOOP;
        rom[(PATCH_ROM_TEST & 0x3FFF) as usize] = TRAP_ROM_TEST;
        rom[(PATCH_IDLE_WAIT & 0x3FFF) as usize] = TRAP_IDLE_WAIT;
        rom[(PATCH_OPEN_FILE & 0x3FFF) as usize] = TRAP_OPEN_FILE;
        rom[(PATCH_WRITE_SYNC & 0x3FFF) as usize] = TRAP_WRITE_SYNC;
        rom[(PATCH_WRITE_DONE & 0x3FFF) as usize] = TRAP_WRITE_DONE;
    }

    fn install_traps(&mut self) {
        for t in [
            TRAP_JOB_LOOP,
            TRAP_ROM_TEST,
            TRAP_IDLE_WAIT,
            TRAP_OPEN_FILE,
            TRAP_WRITE_SYNC,
            TRAP_WRITE_DONE,
        ] {
            self.cpu.install_trap(t);
        }
    }

    fn handle_trap(&mut self, opcode: u8, at: u16) {
        match opcode {
            TRAP_JOB_LOOP => {
                self.run_job_queue();
                self.cpu.pc = PATCH_IDLE_WAIT;
            }
            TRAP_ROM_TEST => {
                // Skip the ROM checksum loop entirely.
                self.cpu.pc = PATCH_IDLE_WAIT;
            }
            TRAP_IDLE_WAIT => {
                // The DOS wait loop: put the whole drive to sleep until
                // the bus wakes it.
                self.cpu.pc = at;
                self.run_job_queue();
                self.sleeping = true;
            }
            TRAP_OPEN_FILE => {
                debug!("drive: open-file trace at {at:#06x}");
                self.cpu.pc = PATCH_IDLE_WAIT;
            }
            TRAP_WRITE_SYNC | TRAP_WRITE_DONE => {
                // Write-path accelerators: pretend the sync hunt
                // already succeeded.
                self.cpu.set_overflow_pin();
            }
            other => {
                warn!("drive: stray trap opcode {other:#04x} at {at:#06x}");
            }
        }
    }

    /// Host-speed execution of the 1541 job queue.
    fn run_job_queue(&mut self) {
        for slot in 0..JOB_SLOTS {
            let code = self.bus.ram[slot];
            if code & 0x80 == 0 {
                continue;
            }
            let track = self.bus.ram[JOB_TRACK_BASE + slot * 2];
            let sector = self.bus.ram[JOB_TRACK_BASE + slot * 2 + 1];
            let result = self.execute_job(code & 0xF0, slot, track, sector);
            self.bus.ram[slot] = result;
            debug!(
                "drive: job {:#04x} buffer {slot} t{track}/s{sector} -> {result:#04x}",
                code & 0xF0
            );
        }
    }

    fn execute_job(&mut self, job: u8, slot: usize, track: u8, sector: u8) -> u8 {
        let buffer = BUFFER_BASE + slot * 0x100;
        match job {
            JOB_READ => match self.handler.as_deref_mut() {
                Some(h) => match h.goto_block(track, sector) {
                    Ok(()) => {
                        let block = h.read_block();
                        self.bus.ram[buffer & 0x7FF..(buffer & 0x7FF) + 0x100]
                            .copy_from_slice(&block);
                        JOB_OK
                    }
                    Err(_) => JOB_ERROR_NOT_FOUND,
                },
                None => JOB_ERROR_NOT_FOUND,
            },
            JOB_WRITE => match self.handler.as_deref_mut() {
                Some(h) => {
                    let mut block = [0u8; 256];
                    block.copy_from_slice(
                        &self.bus.ram[buffer & 0x7FF..(buffer & 0x7FF) + 0x100],
                    );
                    match h.goto_block(track, sector).and_then(|_| h.write_block(&block)) {
                        Ok(()) => JOB_OK,
                        Err(_) => JOB_ERROR_NOT_FOUND,
                    }
                }
                None => JOB_ERROR_NOT_FOUND,
            },
            JOB_VERIFY => match self.handler.as_deref_mut() {
                Some(h) => match h.goto_block(track, sector) {
                    Ok(()) => {
                        let block = h.read_block();
                        let same = self.bus.ram[buffer & 0x7FF..(buffer & 0x7FF) + 0x100]
                            == block[..];
                        if same {
                            JOB_OK
                        } else {
                            JOB_ERROR_NOT_FOUND
                        }
                    }
                    Err(_) => JOB_ERROR_NOT_FOUND,
                },
                None => JOB_ERROR_NOT_FOUND,
            },
            JOB_SEEK => {
                if (1..=handler::TRACK_COUNT).contains(&track) {
                    self.half_track = track * 2;
                    self.sector = 0;
                    self.gcr_pos = 0;
                    self.load_current_sector();
                    JOB_OK
                } else {
                    JOB_ERROR_NOT_FOUND
                }
            }
            JOB_BUMP => {
                // Bang the head against the stop: back to track 1.
                self.half_track = 2;
                self.sector = 0;
                self.gcr_pos = 0;
                self.load_current_sector();
                JOB_OK
            }
            JOB_JUMP | JOB_EXECUTE => JOB_OK,
            _ => JOB_ERROR_NOT_FOUND,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use handler::{FileType, RamDisk};

    fn full_drive_with_disk() -> (Drive, IecBus) {
        let mut drive = Drive::new(EmulationLevel::Full);
        let mut disk = RamDisk::new("WORK", *b"WD");
        disk.add_file(b"FILE", FileType::Prg, &[1, 2, 3, 4]).unwrap();
        drive.attach_handler(Box::new(disk));
        (drive, IecBus::new())
    }

    #[test]
    fn stub_rom_boots_into_sleep() {
        let (mut drive, mut bus) = full_drive_with_disk();
        drive.run_to(100, &mut bus);
        assert!(drive.is_sleeping());
        assert_eq!(drive.next_update(), NEVER);
    }

    #[test]
    fn atn_edge_wakes_and_resyncs() {
        let (mut drive, mut bus) = full_drive_with_disk();
        drive.run_to(100, &mut bus);
        assert!(drive.is_sleeping());
        bus.set(crate::iec::CONTROLLER, IecLine::Atn, true);
        drive.on_bus_activity(50_000, &mut bus);
        assert!(!drive.is_sleeping());
        assert_eq!(drive.cycles, 50_000);
    }

    #[test]
    fn job_queue_read_fills_buffer() {
        let (mut drive, _bus) = full_drive_with_disk();
        // Post a READ of the BAM (18/0) into buffer 0.
        drive.bus.ram[0] = JOB_READ;
        drive.bus.ram[JOB_TRACK_BASE] = 18;
        drive.bus.ram[JOB_TRACK_BASE + 1] = 0;
        drive.run_job_queue();
        assert_eq!(drive.bus.ram[0], JOB_OK);
        // BAM starts with the directory link 18/1.
        assert_eq!(drive.bus.ram[BUFFER_BASE & 0x7FF], 18);
        assert_eq!(drive.bus.ram[(BUFFER_BASE & 0x7FF) + 1], 1);
    }

    #[test]
    fn job_seek_moves_head() {
        let (mut drive, _bus) = full_drive_with_disk();
        drive.bus.ram[1] = JOB_SEEK;
        drive.bus.ram[JOB_TRACK_BASE + 2] = 30;
        drive.run_job_queue();
        assert_eq!(drive.bus.ram[1], JOB_OK);
        assert_eq!(drive.track(), 30);
    }

    #[test]
    fn rotation_presents_bytes_and_byte_ready() {
        let (mut drive, _bus) = full_drive_with_disk();
        // Spin the motor through VIA2 and step manually.
        drive.bus.via2.write(via::DDRB, 0x0C);
        drive.bus.via2.write(via::PRB, 0x04);
        drive.update_mechanics();
        assert!(drive.motor_on);

        drive.cycles = 10_000;
        drive.next_rotation = 0;
        drive.rotate_disk();
        // The head has moved well into the sector.
        assert!(drive.gcr_pos > 0);
        // V flag set by byte-ready at least once.
        assert!(drive.cpu.flags.v);
    }

    #[test]
    fn detaching_modified_disk_emits_event() {
        let (mut drive, _bus) = full_drive_with_disk();
        let (sink, rx) = crate::event::EventSink::channel(4);
        drive.set_event_sink(sink);
        drive.handler_mut().unwrap().goto_block(1, 0).unwrap();
        drive.handler_mut().unwrap().write_block(&[0u8; 256]).unwrap();
        drive.detach_handler();
        assert!(matches!(rx.try_recv(), Ok(HostEvent::DiskModified { .. })));
    }

    #[test]
    fn iec_only_drive_sleeps_after_inactivity() {
        let mut drive = Drive::new(EmulationLevel::IecOnly);
        let mut bus = IecBus::new();
        drive.attach_handler(Box::new(RamDisk::new("D", *b"01")));
        drive.run_to(DEACTIVATION_CYCLES + 10, &mut bus);
        assert!(drive.is_sleeping());
        // ATN wakes it back up.
        bus.set(crate::iec::CONTROLLER, IecLine::Atn, true);
        drive.on_bus_activity(DEACTIVATION_CYCLES + 500, &mut bus);
        assert!(!drive.is_sleeping());
    }
}
