//! IEC-only drive emulation: no drive CPU, just a state machine that
//! speaks the byte-level serial protocol directly and satisfies LOAD,
//! SAVE, OPEN, CLOSE, and command-channel requests from the
//! [`DriveHandler`] abstraction.
//!
//! The transfer layer is transition-driven: the machine pokes `update`
//! whenever the controller wiggles a line and whenever the drive's own
//! scheduled action comes due.  Bit timing comes from the tolerance
//! table in [`crate::iec::timing`].

use log::{debug, warn};

use super::handler::{DriveHandler, FileType};
use crate::chip::NEVER;
use crate::error::{Error, Result};
use crate::iec::{atn_command, timing, IecBus, IecLine};

const COMMAND_CHANNEL: u8 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transfer {
    Idle,
    /// ATN seen: we hold DATA until the controller releases CLK.
    AtnAck,
    /// DATA released, waiting for the first bit clock.
    RecvReady { since: u64, eoi: bool },
    /// Pulling DATA to acknowledge an EOI signal.
    RecvEoiAck { until: u64 },
    RecvBits { bits: u8, value: u8, eoi: bool },
    /// Byte ack: holding DATA until the controller goes busy (`armed`)
    /// and then releases CLK for the next ready phase.
    RecvAck { armed: bool },
    /// Waiting for the controller to hand the bus over.
    TalkTurnaround { at: u64, retries: u8 },
    /// Inter-byte delay before offering the next byte.
    TalkHoldoff { until: u64 },
    /// CLK released, waiting for the listener (and the EOI dance).
    TalkReady { eoi_wait_done: bool },
    /// Showing the EOI delay on the final byte.
    TalkEoi { until: u64 },
    TalkBits { bits: u8, value: u8, clk_high: bool, at: u64 },
    TalkWaitAck { since: u64 },
}

#[derive(Default)]
struct Channel {
    open: bool,
    name: Vec<u8>,
    read_data: Option<Vec<u8>>,
    read_pos: usize,
    write_data: Vec<u8>,
}

pub struct IecDrive {
    /// Bus member slot (see [`crate::iec`]).
    member: usize,
    /// Device number on the bus (8..11).
    device: u8,

    state: Transfer,
    next_event: u64,

    listening: bool,
    talking: bool,
    /// Addressed as talker, waiting for the turnaround.
    pending_talk: bool,
    current_channel: u8,
    /// Channel collecting a file name after OPEN.
    open_pending: Option<u8>,

    channels: [Channel; 16],
    command_buffer: Vec<u8>,
    status: Vec<u8>,

    // Last observed bus levels, for edge detection.
    last_atn: bool,
    last_clk: bool,
    last_data: bool,

    /// Set on an illegal protocol re-entry; the machine stops.
    pub fault: Option<Error>,
}

impl IecDrive {
    pub fn new(member: usize, device: u8) -> Self {
        Self {
            member,
            device,
            state: Transfer::Idle,
            next_event: NEVER,
            listening: false,
            talking: false,
            pending_talk: false,
            current_channel: 0,
            open_pending: None,
            channels: Default::default(),
            command_buffer: Vec::new(),
            status: b"00, OK,00,00\r".to_vec(),
            last_atn: false,
            last_clk: false,
            last_data: false,
            fault: None,
        }
    }

    pub fn reset(&mut self, bus: &mut IecBus) {
        bus.set(self.member, IecLine::Clk, false);
        bus.set(self.member, IecLine::Data, false);
        self.state = Transfer::Idle;
        self.next_event = NEVER;
        self.listening = false;
        self.talking = false;
        self.pending_talk = false;
        self.open_pending = None;
        self.channels = Default::default();
        self.command_buffer.clear();
        self.set_status(0, "OK", 0, 0);
        self.fault = None;
    }

    pub fn next_update(&self) -> u64 {
        self.next_event
    }

    pub fn is_idle(&self) -> bool {
        self.state == Transfer::Idle && !self.listening && !self.talking && !self.pending_talk
    }

    fn set_status(&mut self, code: u8, text: &str, track: u8, sector: u8) {
        self.status = format!("{code:02},{text},{track:02},{sector:02}\r").into_bytes();
    }

    pub(crate) fn save(&self, w: &mut crate::snapshot::SnapshotWriter) {
        self.save_transfer(w);
        w.u64(self.next_event);
        w.bool(self.listening);
        w.bool(self.talking);
        w.bool(self.pending_talk);
        w.u8(self.current_channel);
        w.u8(self.open_pending.map(|c| c + 1).unwrap_or(0));
        for ch in &self.channels {
            w.bool(ch.open);
            w.bytes(&ch.name);
            w.bool(ch.read_data.is_some());
            if let Some(ref data) = ch.read_data {
                w.bytes(data);
            }
            w.u32(ch.read_pos as u32);
            w.bytes(&ch.write_data);
        }
        w.bytes(&self.command_buffer);
        w.bytes(&self.status);
        w.bool(self.last_atn);
        w.bool(self.last_clk);
        w.bool(self.last_data);
    }

    pub(crate) fn restore(
        &mut self,
        r: &mut crate::snapshot::SnapshotReader<'_>,
    ) -> crate::error::Result<()> {
        self.restore_transfer(r)?;
        self.next_event = r.u64()?;
        self.listening = r.bool()?;
        self.talking = r.bool()?;
        self.pending_talk = r.bool()?;
        self.current_channel = r.u8()? & 0x0F;
        self.open_pending = match r.u8()? {
            0 => None,
            c => Some((c - 1) & 0x0F),
        };
        for ch in self.channels.iter_mut() {
            ch.open = r.bool()?;
            ch.name = r.bytes()?;
            ch.read_data = if r.bool()? { Some(r.bytes()?) } else { None };
            ch.read_pos = r.u32()? as usize;
            ch.write_data = r.bytes()?;
        }
        self.command_buffer = r.bytes()?;
        self.status = r.bytes()?;
        self.last_atn = r.bool()?;
        self.last_clk = r.bool()?;
        self.last_data = r.bool()?;
        self.fault = None;
        Ok(())
    }

    fn save_transfer(&self, w: &mut crate::snapshot::SnapshotWriter) {
        match self.state {
            Transfer::Idle => w.u8(0),
            Transfer::AtnAck => w.u8(1),
            Transfer::RecvReady { since, eoi } => {
                w.u8(2);
                w.u64(since);
                w.bool(eoi);
            }
            Transfer::RecvEoiAck { until } => {
                w.u8(3);
                w.u64(until);
            }
            Transfer::RecvBits { bits, value, eoi } => {
                w.u8(4);
                w.u8(bits);
                w.u8(value);
                w.bool(eoi);
            }
            Transfer::RecvAck { armed } => {
                w.u8(5);
                w.bool(armed);
            }
            Transfer::TalkTurnaround { at, retries } => {
                w.u8(6);
                w.u64(at);
                w.u8(retries);
            }
            Transfer::TalkHoldoff { until } => {
                w.u8(7);
                w.u64(until);
            }
            Transfer::TalkReady { eoi_wait_done } => {
                w.u8(8);
                w.bool(eoi_wait_done);
            }
            Transfer::TalkEoi { until } => {
                w.u8(9);
                w.u64(until);
            }
            Transfer::TalkBits { bits, value, clk_high, at } => {
                w.u8(10);
                w.u8(bits);
                w.u8(value);
                w.bool(clk_high);
                w.u64(at);
            }
            Transfer::TalkWaitAck { since } => {
                w.u8(11);
                w.u64(since);
            }
        }
    }

    fn restore_transfer(
        &mut self,
        r: &mut crate::snapshot::SnapshotReader<'_>,
    ) -> crate::error::Result<()> {
        self.state = match r.u8()? {
            0 => Transfer::Idle,
            1 => Transfer::AtnAck,
            2 => Transfer::RecvReady { since: r.u64()?, eoi: r.bool()? },
            3 => Transfer::RecvEoiAck { until: r.u64()? },
            4 => Transfer::RecvBits { bits: r.u8()?, value: r.u8()?, eoi: r.bool()? },
            5 => Transfer::RecvAck { armed: r.bool()? },
            6 => Transfer::TalkTurnaround { at: r.u64()?, retries: r.u8()? },
            7 => Transfer::TalkHoldoff { until: r.u64()? },
            8 => Transfer::TalkReady { eoi_wait_done: r.bool()? },
            9 => Transfer::TalkEoi { until: r.u64()? },
            10 => Transfer::TalkBits {
                bits: r.u8()?,
                value: r.u8()?,
                clk_high: r.bool()?,
                at: r.u64()?,
            },
            11 => Transfer::TalkWaitAck { since: r.u64()? },
            other => {
                return Err(crate::error::Error::Serialization(format!(
                    "unknown IEC transfer state {other}"
                )))
            }
        };
        Ok(())
    }

    // ── Transfer layer ────────────────────────────────────────

    /// Advance the protocol machine.  Called on every controller line
    /// change and whenever `next_update` comes due.
    pub fn update(
        &mut self,
        now: u64,
        bus: &mut IecBus,
        handler: Option<&mut dyn DriveHandler>,
    ) {
        if self.fault.is_some() {
            return;
        }

        let atn = bus.get(IecLine::Atn);
        let clk_ctrl = bus.own(crate::iec::CONTROLLER, IecLine::Clk);
        let data_level = bus.get(IecLine::Data);

        // ── ATN edges ──
        if atn && !self.last_atn {
            // Whatever was in flight, ATN yanks every device into
            // command-listening mode.
            self.enter_atn_ack(bus);
        } else if !atn && self.last_atn {
            self.on_atn_released(now, bus);
        }

        // ── CLK edges (controller side) ──
        if clk_ctrl != self.last_clk {
            if clk_ctrl {
                self.on_clk_rise(now, bus, atn);
            } else {
                self.on_clk_fall(now, bus, atn);
            }
        }

        // ── DATA edges ──
        if data_level != self.last_data {
            self.on_data_change(now, bus, data_level);
        }

        self.last_atn = atn;
        self.last_clk = clk_ctrl;
        self.last_data = bus.get(IecLine::Data);

        // ── Scheduled actions ──
        if self.next_event <= now {
            self.next_event = NEVER;
            self.on_timer(now, bus, handler);
        }
    }

    fn enter_atn_ack(&mut self, bus: &mut IecBus) {
        bus.set(self.member, IecLine::Clk, false);
        bus.set(self.member, IecLine::Data, true);
        self.state = Transfer::AtnAck;
        self.next_event = NEVER;
        self.talking = false;
    }

    fn on_atn_released(&mut self, now: u64, bus: &mut IecBus) {
        if self.pending_talk {
            self.state = Transfer::TalkTurnaround { at: now + timing::TURNAROUND, retries: 0 };
            self.next_event = now + timing::TURNAROUND;
        } else if self.listening {
            // Stay in the receive cycle for the data phase.
        } else {
            bus.set(self.member, IecLine::Data, false);
            bus.set(self.member, IecLine::Clk, false);
            self.state = Transfer::Idle;
        }
    }

    fn on_clk_fall(&mut self, now: u64, bus: &mut IecBus, atn: bool) {
        match self.state {
            Transfer::AtnAck | Transfer::RecvAck { armed: true } => {
                // Controller is ready to send: release DATA.
                bus.set(self.member, IecLine::Data, false);
                self.state = Transfer::RecvReady { since: now, eoi: false };
                // EOI only exists outside the command phase.
                if !atn {
                    self.next_event = now + timing::LISTENER_READY_WINDOW;
                }
            }
            // The fall ending the last bit pulse is not a ready phase.
            Transfer::RecvAck { armed: false } => {}
            _ => {}
        }
    }

    fn on_clk_rise(&mut self, now: u64, bus: &mut IecBus, atn: bool) {
        match self.state {
            Transfer::RecvReady { eoi, .. } => {
                // First bit: sample DATA on the rising edge, LSB first.
                let bit = !bus.own(crate::iec::CONTROLLER, IecLine::Data) as u8;
                self.state = Transfer::RecvBits { bits: 1, value: bit, eoi };
                self.next_event = NEVER;
            }
            Transfer::RecvBits { bits, value, eoi } => {
                let bit = !bus.own(crate::iec::CONTROLLER, IecLine::Data) as u8;
                let value = value | (bit << bits);
                if bits + 1 == 8 {
                    bus.set(self.member, IecLine::Data, true);
                    self.state = Transfer::RecvAck { armed: false };
                    self.byte_received(value, atn, eoi);
                } else {
                    self.state = Transfer::RecvBits { bits: bits + 1, value, eoi };
                }
            }
            Transfer::RecvAck { armed: false } => {
                // Controller went busy again after our acknowledge.
                self.state = Transfer::RecvAck { armed: true };
            }
            _ => {}
        }
    }

    fn on_data_change(&mut self, now: u64, _bus: &mut IecBus, data_level: bool) {
        match self.state {
            Transfer::TalkReady { eoi_wait_done } => {
                if !data_level {
                    // Listener ready.  On the final byte, show EOI by
                    // sitting past the listener's window first.
                    if self.sending_last_byte() && !eoi_wait_done {
                        self.state = Transfer::TalkEoi {
                            until: now + timing::WAIT_FOR_EOI + timing::SHOW_EOI,
                        };
                        self.next_event = now + timing::WAIT_FOR_EOI + timing::SHOW_EOI;
                    } else {
                        self.begin_talk_bits(now);
                    }
                }
            }
            Transfer::TalkWaitAck { .. } => {
                if data_level {
                    self.talk_byte_acked(now, _bus);
                }
            }
            _ => {}
        }
    }

    fn on_timer(&mut self, now: u64, bus: &mut IecBus, handler: Option<&mut dyn DriveHandler>) {
        match self.state {
            Transfer::RecvReady { since, eoi } => {
                if !eoi && now.saturating_sub(since) >= timing::LISTENER_READY_WINDOW {
                    // Talker held off: this is the EOI handshake.
                    bus.set(self.member, IecLine::Data, true);
                    self.state = Transfer::RecvEoiAck { until: now + timing::EOI_ACK_PULSE };
                    self.next_event = now + timing::EOI_ACK_PULSE;
                }
            }
            Transfer::RecvEoiAck { until } => {
                if now >= until {
                    bus.set(self.member, IecLine::Data, false);
                    self.state = Transfer::RecvReady { since: now, eoi: true };
                }
            }
            Transfer::TalkTurnaround { at, retries } => {
                if now < at {
                    self.next_event = at;
                    return;
                }
                let ctrl_clk = bus.own(crate::iec::CONTROLLER, IecLine::Clk);
                let ctrl_data = bus.own(crate::iec::CONTROLLER, IecLine::Data);
                if !ctrl_clk && ctrl_data {
                    // Take CLK, release DATA, and start talking.
                    bus.set(self.member, IecLine::Clk, true);
                    bus.set(self.member, IecLine::Data, false);
                    self.pending_talk = false;
                    self.talking = true;
                    self.prepare_talk_data(handler);
                    self.state = Transfer::TalkHoldoff { until: now + timing::SEND_DELAY };
                    self.next_event = now + timing::SEND_DELAY;
                } else if retries < 200 {
                    self.state =
                        Transfer::TalkTurnaround { at: now + timing::TURNAROUND, retries: retries + 1 };
                    self.next_event = now + timing::TURNAROUND;
                } else {
                    warn!("iec: turnaround abandoned, controller never handed over");
                    self.pending_talk = false;
                    self.state = Transfer::Idle;
                }
            }
            Transfer::TalkHoldoff { until } => {
                if now >= until {
                    if self.peek_talk_byte().is_some() {
                        bus.set(self.member, IecLine::Clk, false);
                        self.state = Transfer::TalkReady { eoi_wait_done: false };
                        // Poll in case the listener is already ready.
                        self.next_event = now + timing::KEEP_WRITE_STEADY;
                    } else {
                        // Nothing to say: release the bus.
                        bus.set(self.member, IecLine::Clk, false);
                        self.talking = false;
                        self.state = Transfer::Idle;
                    }
                }
            }
            Transfer::TalkReady { eoi_wait_done } => {
                // Re-check the listener's DATA without an edge.
                if !bus.get(IecLine::Data) {
                    if self.sending_last_byte() && !eoi_wait_done {
                        self.state = Transfer::TalkEoi {
                            until: now + timing::WAIT_FOR_EOI + timing::SHOW_EOI,
                        };
                        self.next_event = now + timing::WAIT_FOR_EOI + timing::SHOW_EOI;
                    } else {
                        self.begin_talk_bits(now);
                    }
                } else {
                    self.next_event = now + timing::KEEP_WRITE_STEADY;
                }
            }
            Transfer::TalkEoi { until } => {
                if now >= until {
                    self.begin_talk_bits(now);
                }
            }
            Transfer::TalkBits { bits, value, clk_high, at } => {
                if now < at {
                    self.next_event = at;
                    return;
                }
                self.step_talk_bits(now, bus, bits, value, clk_high);
            }
            Transfer::TalkWaitAck { since } => {
                if bus.get(IecLine::Data) {
                    self.talk_byte_acked(now, bus);
                } else if now.saturating_sub(since) >= timing::WAIT_FOR_WRITE_ACK {
                    warn!("iec: listener never acknowledged, dropping transfer");
                    bus.set(self.member, IecLine::Clk, false);
                    bus.set(self.member, IecLine::Data, false);
                    self.talking = false;
                    self.state = Transfer::Idle;
                } else {
                    self.next_event = now + timing::KEEP_WRITE_STEADY;
                }
            }
            Transfer::Idle
            | Transfer::AtnAck
            | Transfer::RecvBits { .. }
            | Transfer::RecvAck { .. } => {}
        }
    }

    fn begin_talk_bits(&mut self, now: u64) {
        if matches!(self.state, Transfer::TalkBits { .. }) {
            self.fault = Some(Error::BusConsistency(
                "talk bit sequence re-entered while already sending".into(),
            ));
            return;
        }
        self.state = Transfer::TalkBits { bits: 0, value: 0, clk_high: false, at: now };
        self.next_event = now;
    }

    /// One half-step of the bit clock: set DATA then raise CLK, later
    /// drop CLK, eight times over.
    fn step_talk_bits(&mut self, now: u64, bus: &mut IecBus, bits: u8, mut value: u8, clk_high: bool) {
        if bits == 0 && !clk_high {
            value = match self.peek_talk_byte() {
                Some((byte, _)) => byte,
                None => {
                    self.state = Transfer::Idle;
                    return;
                }
            };
        }

        if !clk_high {
            // Put the (inverted) bit on DATA, then clock it in.
            let bit = (value >> bits) & 1;
            bus.set(self.member, IecLine::Data, bit == 0);
            bus.set(self.member, IecLine::Clk, true);
            self.state = Transfer::TalkBits {
                bits,
                value,
                clk_high: true,
                at: now + timing::KEEP_WRITE_STEADY,
            };
            self.next_event = now + timing::KEEP_WRITE_STEADY;
        } else {
            bus.set(self.member, IecLine::Clk, false);
            if bits + 1 == 8 {
                // Byte complete: release DATA, go busy, await the ack.
                bus.set(self.member, IecLine::Data, false);
                bus.set(self.member, IecLine::Clk, true);
                self.state = Transfer::TalkWaitAck { since: now };
                self.next_event = now + timing::KEEP_WRITE_STEADY;
            } else {
                self.state = Transfer::TalkBits {
                    bits: bits + 1,
                    value,
                    clk_high: false,
                    at: now + timing::KEEP_WRITE_STEADY,
                };
                self.next_event = now + timing::KEEP_WRITE_STEADY;
            }
        }
    }

    fn talk_byte_acked(&mut self, now: u64, bus: &mut IecBus) {
        let was_last = self.sending_last_byte();
        let ch = &mut self.channels[self.current_channel as usize];
        ch.read_pos += 1;
        if was_last {
            debug!("iec: transfer complete on channel {}", self.current_channel);
            bus.set(self.member, IecLine::Clk, false);
            bus.set(self.member, IecLine::Data, false);
            self.state = Transfer::Idle;
            self.next_event = NEVER;
        } else {
            self.state = Transfer::TalkHoldoff { until: now + timing::SEND_DELAY };
            self.next_event = now + timing::SEND_DELAY;
        }
    }

    fn peek_talk_byte(&self) -> Option<(u8, bool)> {
        let ch = &self.channels[self.current_channel as usize];
        let data = ch.read_data.as_ref()?;
        let byte = *data.get(ch.read_pos)?;
        Some((byte, ch.read_pos + 1 == data.len()))
    }

    fn sending_last_byte(&self) -> bool {
        matches!(self.peek_talk_byte(), Some((_, true)))
    }

    // ── DOS layer ─────────────────────────────────────────────

    fn byte_received(&mut self, byte: u8, under_atn: bool, eoi: bool) {
        if under_atn {
            self.command_byte(byte);
        } else if self.listening {
            self.data_byte(byte, eoi);
        }
    }

    fn command_byte(&mut self, byte: u8) {
        match byte & 0xF0 {
            atn_command::LISTEN => {
                if byte & 0x1F == self.device {
                    debug!("iec: LISTEN {}", self.device);
                    self.listening = true;
                }
            }
            atn_command::UNLISTEN => {
                debug!("iec: UNLISTEN");
                self.finish_listening();
                self.listening = false;
            }
            atn_command::TALK => {
                if byte & 0x1F == self.device {
                    debug!("iec: TALK {}", self.device);
                    self.pending_talk = true;
                }
            }
            atn_command::UNTALK => {
                self.talking = false;
                self.pending_talk = false;
            }
            atn_command::DATA => {
                self.current_channel = byte & 0x0F;
            }
            atn_command::CLOSE => {
                if self.listening {
                    self.close_channel(byte & 0x0F);
                }
            }
            atn_command::OPEN => {
                if self.listening {
                    let ch = byte & 0x0F;
                    self.current_channel = ch;
                    self.open_pending = Some(ch);
                    self.channels[ch as usize].name.clear();
                }
            }
            other => {
                warn!("iec: unrecognized ATN command {other:#04x}");
            }
        }
    }

    fn data_byte(&mut self, byte: u8, _eoi: bool) {
        if let Some(ch) = self.open_pending {
            self.channels[ch as usize].name.push(byte);
        } else if self.current_channel == COMMAND_CHANNEL {
            self.command_buffer.push(byte);
        } else {
            let ch = &mut self.channels[self.current_channel as usize];
            if ch.open {
                ch.write_data.push(byte);
            }
        }
    }

    /// UNLISTEN wraps up whatever the listen phase was doing.
    fn finish_listening(&mut self) {
        if let Some(chn) = self.open_pending.take() {
            if chn == COMMAND_CHANNEL {
                // OPEN 15,"command" executes immediately.
                let cmd = std::mem::take(&mut self.channels[chn as usize].name);
                self.execute_command(&cmd);
            } else {
                self.channels[chn as usize].open = true;
                self.channels[chn as usize].read_data = None;
                self.channels[chn as usize].read_pos = 0;
                self.channels[chn as usize].write_data.clear();
            }
        }
        if !self.command_buffer.is_empty() {
            let cmd = std::mem::take(&mut self.command_buffer);
            self.execute_command(&cmd);
        }
    }

    fn close_channel(&mut self, chn: u8) {
        let ch = &mut self.channels[chn as usize];
        ch.open = false;
        ch.read_data = None;
        ch.read_pos = 0;
        // A SAVE stream is committed by `commit_writes` at update time;
        // the buffered data stays until then.
    }

    fn execute_command(&mut self, cmd: &[u8]) {
        let text: Vec<u8> = cmd.iter().copied().take_while(|&b| b != 0x0D).collect();
        debug!("iec: command channel: {:?}", String::from_utf8_lossy(&text));
        match text.first() {
            Some(b'I') | Some(b'V') => self.set_status(0, " OK", 0, 0),
            Some(b'U') => self.set_status(73, "CBM DOS V2.6 1541", 0, 0),
            _ => self.set_status(31, "SYNTAX ERROR", 0, 0),
        }
    }

    /// Fill the selected channel's read buffer for a TALK.
    fn prepare_talk_data(&mut self, handler: Option<&mut dyn DriveHandler>) {
        let chn = self.current_channel as usize;
        if self.current_channel == COMMAND_CHANNEL {
            let status = std::mem::replace(&mut self.status, b"00, OK,00,00\r".to_vec());
            self.channels[chn].read_data = Some(status);
            self.channels[chn].read_pos = 0;
            return;
        }

        if self.channels[chn].read_data.is_some() {
            // Resuming a transfer in progress.
            return;
        }

        let name = self.channels[chn].name.clone();
        let Some(handler) = handler else {
            self.set_status(74, "DRIVE NOT READY", 0, 0);
            self.channels[chn].read_data = Some(Vec::new());
            self.channels[chn].read_pos = 0;
            return;
        };

        let result: Result<Vec<u8>> = if name.first() == Some(&b'$') {
            Ok(directory_listing(handler))
        } else {
            handler.read_file(&name, FileType::Prg)
        };

        match result {
            Ok(data) => {
                self.set_status(0, " OK", 0, 0);
                self.channels[chn].read_data = Some(data);
            }
            Err(e) => {
                debug!("iec: read failed: {e}");
                self.set_status(62, "FILE NOT FOUND", 0, 0);
                self.channels[chn].read_data = Some(Vec::new());
            }
        }
        self.channels[chn].read_pos = 0;
    }

    /// Commit buffered SAVE data on closed channels.  Called by the
    /// drive whenever it services this state machine.
    pub fn commit_writes(&mut self, handler: Option<&mut dyn DriveHandler>) {
        let Some(handler) = handler else { return };
        for ch in self.channels.iter_mut() {
            if !ch.open && !ch.write_data.is_empty() {
                let data = std::mem::take(&mut ch.write_data);
                let name = ch.name.clone();
                match handler.write_file(&name, FileType::Prg, &data) {
                    Ok(()) => debug!("iec: saved {} bytes", data.len()),
                    Err(e) => {
                        warn!("iec: save failed: {e}");
                        self.status = b"26,WRITE PROTECT ON,00,00\r".to_vec();
                    }
                }
            }
        }
    }
}

/// Build the BASIC program a directory LOAD returns: load address
/// $0401, one line per entry with the block count as line number.
pub fn directory_listing(handler: &dyn DriveHandler) -> Vec<u8> {
    let mut out = vec![0x01, 0x04];
    let mut addr: u16 = 0x0401;

    let mut push_line = |out: &mut Vec<u8>, addr: &mut u16, line_no: u16, content: &[u8]| {
        let next = *addr + 4 + content.len() as u16 + 1;
        out.extend_from_slice(&next.to_le_bytes());
        out.extend_from_slice(&line_no.to_le_bytes());
        out.extend_from_slice(content);
        out.push(0x00);
        *addr = next;
    };

    // Header: reverse-video label + id.
    let label = handler.label();
    let id = handler.disk_id();
    let mut head = vec![0x12, b'"'];
    let label_bytes = label.as_bytes();
    for i in 0..16 {
        head.push(label_bytes.get(i).copied().unwrap_or(b' '));
    }
    head.extend_from_slice(b"\" ");
    head.push(id[0]);
    head.push(id[1]);
    head.extend_from_slice(b" 2A");
    push_line(&mut out, &mut addr, 0, &head);

    for entry in handler.directory_entries() {
        let name = entry.display_name();
        let mut content = Vec::new();
        // Column padding the way the DOS prints it.
        let blocks = entry.blocks;
        let pad = if blocks < 10 { 3 } else if blocks < 100 { 2 } else { 1 };
        content.extend(std::iter::repeat(b' ').take(pad));
        content.push(b'"');
        content.extend_from_slice(&name);
        content.push(b'"');
        for _ in name.len()..17 {
            content.push(b' ');
        }
        content.extend_from_slice(entry.file_type.tag().as_bytes());
        push_line(&mut out, &mut addr, blocks, &content);
    }

    let free = 664u16; // nominal free count on a fresh disk
    push_line(&mut out, &mut addr, free, b"BLOCKS FREE.");
    out.extend_from_slice(&[0x00, 0x00]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::handler::RamDisk;
    use crate::iec::{CONTROLLER, DEVICE_8};

    struct TestController {
        now: u64,
    }

    impl TestController {
        fn new() -> Self {
            Self { now: 1000 }
        }

        fn pump(&mut self, drive: &mut IecDrive, bus: &mut IecBus, disk: &mut RamDisk) {
            drive.update(self.now, bus, Some(disk));
        }

        fn advance(
            &mut self,
            cycles: u64,
            drive: &mut IecDrive,
            bus: &mut IecBus,
            disk: &mut RamDisk,
        ) {
            let target = self.now + cycles;
            while self.now < target {
                self.now += 10;
                self.pump(drive, bus, disk);
            }
        }

        fn set(&mut self, bus: &mut IecBus, line: IecLine, v: bool) {
            bus.set(CONTROLLER, line, v);
        }

        /// Bit-bang one byte to the drive, Kernal style.
        fn send_byte(
            &mut self,
            byte: u8,
            drive: &mut IecDrive,
            bus: &mut IecBus,
            disk: &mut RamDisk,
        ) {
            // Ready phase: release CLK, wait for the drive to release
            // DATA.
            self.set(bus, IecLine::Clk, false);
            self.advance(60, drive, bus, disk);
            assert!(!bus.own(DEVICE_8, IecLine::Data), "listener not ready");

            for bit in 0..8 {
                let value = (byte >> bit) & 1;
                self.set(bus, IecLine::Data, value == 0);
                self.set(bus, IecLine::Clk, true);
                self.advance(30, drive, bus, disk);
                self.set(bus, IecLine::Clk, false);
                self.advance(30, drive, bus, disk);
            }
            self.set(bus, IecLine::Data, false);
            self.set(bus, IecLine::Clk, true);
            self.advance(30, drive, bus, disk);
            assert!(bus.own(DEVICE_8, IecLine::Data), "byte not acknowledged");
        }

        /// Clock one byte out of the drive as the listening controller.
        fn recv_byte(
            &mut self,
            drive: &mut IecDrive,
            bus: &mut IecBus,
            disk: &mut RamDisk,
        ) -> (u8, bool) {
            // Wait for the talker to offer a byte (CLK released).
            let mut guard = 0;
            while bus.own(DEVICE_8, IecLine::Clk) {
                self.advance(50, drive, bus, disk);
                guard += 1;
                assert!(guard < 10_000, "talker never offered a byte");
            }
            // Signal ready-for-data.
            self.set(bus, IecLine::Data, false);
            self.pump(drive, bus, disk);

            let mut value = 0u8;
            let mut eoi = false;
            let start = self.now;
            let mut last_clk = bus.own(DEVICE_8, IecLine::Clk);
            let mut bits = 0;
            while bits < 8 {
                self.advance(10, drive, bus, disk);
                let clk = bus.own(DEVICE_8, IecLine::Clk);
                if clk && !last_clk {
                    let bit = !bus.own(DEVICE_8, IecLine::Data) as u8;
                    value |= bit << bits;
                    bits += 1;
                }
                last_clk = clk;
                if bits == 0 && self.now - start > timing::WAIT_FOR_EOI + 50 && !eoi {
                    eoi = true; // talker is showing EOI
                }
                assert!(self.now - start < 1_000_000, "bit clock stalled");
            }
            // Acknowledge the byte.
            self.set(bus, IecLine::Data, true);
            self.advance(120, drive, bus, disk);
            (value, eoi)
        }
    }

    fn atn_command(
        ctl: &mut TestController,
        bytes: &[u8],
        drive: &mut IecDrive,
        bus: &mut IecBus,
        disk: &mut RamDisk,
    ) {
        ctl.set(bus, IecLine::Atn, true);
        ctl.set(bus, IecLine::Clk, true);
        ctl.pump(drive, bus, disk);
        assert!(bus.own(DEVICE_8, IecLine::Data), "no listener on ATN");
        for &b in bytes {
            ctl.send_byte(b, drive, bus, disk);
        }
        ctl.set(bus, IecLine::Atn, false);
        ctl.pump(drive, bus, disk);
    }

    #[test]
    fn listen_command_over_the_wire() {
        let mut bus = IecBus::new();
        let mut drive = IecDrive::new(DEVICE_8, 8);
        let mut disk = RamDisk::new("TEST", *b"01");
        let mut ctl = TestController::new();

        atn_command(&mut ctl, &[0x28], &mut drive, &mut bus, &mut disk);
        assert!(drive.listening);

        atn_command(&mut ctl, &[0x3F], &mut drive, &mut bus, &mut disk);
        assert!(!drive.listening);
    }

    #[test]
    fn load_directory_returns_basic_listing() {
        let mut bus = IecBus::new();
        let mut drive = IecDrive::new(DEVICE_8, 8);
        let mut disk = RamDisk::new("GAMES", *b"GD");
        disk.add_file(b"RASTER DEMO", FileType::Prg, &[0x01, 0x08, 0x00]).unwrap();
        let mut ctl = TestController::new();

        // LISTEN 8, OPEN channel 0, "$", UNLISTEN.
        atn_command(&mut ctl, &[0x28, 0xF0], &mut drive, &mut bus, &mut disk);
        ctl.send_byte(b'$', &mut drive, &mut bus, &mut disk);
        atn_command(&mut ctl, &[0x3F], &mut drive, &mut bus, &mut disk);

        // TALK 8, channel 0, turnaround.
        ctl.set(&mut bus, IecLine::Atn, true);
        ctl.set(&mut bus, IecLine::Clk, true);
        ctl.pump(&mut drive, &mut bus, &mut disk);
        ctl.send_byte(0x48, &mut drive, &mut bus, &mut disk);
        ctl.send_byte(0x60, &mut drive, &mut bus, &mut disk);
        // Turnaround: release ATN and CLK, pull DATA.
        ctl.set(&mut bus, IecLine::Clk, false);
        ctl.set(&mut bus, IecLine::Data, true);
        ctl.set(&mut bus, IecLine::Atn, false);
        ctl.advance(200, &mut drive, &mut bus, &mut disk);
        assert!(bus.own(DEVICE_8, IecLine::Clk), "drive did not take CLK");

        // First two bytes are the $0401 load address.
        let (b0, _) = ctl.recv_byte(&mut drive, &mut bus, &mut disk);
        let (b1, _) = ctl.recv_byte(&mut drive, &mut bus, &mut disk);
        assert_eq!([b0, b1], [0x01, 0x04]);

        // Drain the rest and check the listing contains the file name.
        let mut rest = Vec::new();
        for _ in 0..4096 {
            let (b, _) = ctl.recv_byte(&mut drive, &mut bus, &mut disk);
            rest.push(b);
            if matches!(drive.state, Transfer::Idle) {
                break;
            }
        }
        let text: Vec<u8> = rest.clone();
        let hay = String::from_utf8_lossy(&text);
        assert!(hay.contains("RASTER DEMO"), "listing: {hay}");
        assert!(hay.contains("BLOCKS FREE"));
    }

    #[test]
    fn directory_listing_shape() {
        let mut disk = RamDisk::new("GAMES", *b"GD");
        disk.add_file(b"HELLO", FileType::Prg, &[0, 1, 2]).unwrap();
        let listing = directory_listing(&disk);
        assert_eq!(&listing[0..2], &[0x01, 0x04]);
        // Ends with the double zero link.
        assert_eq!(&listing[listing.len() - 2..], &[0x00, 0x00]);
        let text = String::from_utf8_lossy(&listing);
        assert!(text.contains("GAMES"));
        assert!(text.contains("HELLO"));
        assert!(text.contains("PRG"));
    }

    #[test]
    fn command_channel_status_roundtrip() {
        let mut bus = IecBus::new();
        let mut drive = IecDrive::new(DEVICE_8, 8);
        let mut disk = RamDisk::new("D", *b"01");
        drive.set_status(0, " OK", 0, 0);
        drive.current_channel = 15;
        drive.prepare_talk_data(Some(&mut disk));
        let data = drive.channels[15].read_data.clone().unwrap();
        assert_eq!(&data[..3], b"00,");
        // Status resets to OK after being read out.
        assert_eq!(&drive.status[..3], b"00,");
        let _ = bus;
    }

    #[test]
    fn unknown_file_sets_error_status() {
        let mut drive = IecDrive::new(DEVICE_8, 8);
        let mut disk = RamDisk::new("D", *b"01");
        drive.channels[2].name = b"MISSING".to_vec();
        drive.current_channel = 2;
        drive.prepare_talk_data(Some(&mut disk));
        assert_eq!(&drive.status[..2], b"62");
    }
}
