//! MOS 6581 (SID) sound generator.
//!
//! Three voices feed a mixer clocked at the host sample rate.  The chip
//! is serviced lazily: `next_update` names the cycle of the next output
//! sample and `update` mixes everything due.  Mixed samples are packed
//! as little-endian signed 16-bit PCM and handed to the host both
//! through `take_audio` and as `AudioBlock` events.
//!
//! Filter DSP is deliberately pass-through: the filter-select bits only
//! route voices through an identity pre-mix.

pub mod envelope;
pub mod voice;

use log::trace;
use voice::Voice;

use crate::chip::IoChip;
use crate::event::{EventSink, HostEvent};
use crate::CPU_FREQUENCY;

// ── Register offsets ($D400 + n) ──────────────────────────────

const FC_LO: u8 = 0x15;
const FC_HI: u8 = 0x16;
const RES_FILT: u8 = 0x17;
const MODE_VOL: u8 = 0x18;
const PADDLE1: u8 = 0x19;
const PADDLE2: u8 = 0x1A;
const RANDOM_GENERATOR: u8 = 0x1B;
const ENVELOPE3_OUTPUT: u8 = 0x1C;

/// Samples per emitted audio block event.
const AUDIO_BLOCK_SAMPLES: usize = 512;

/// Sync-source wiring: voice 0 ← 2, 1 ← 0, 2 ← 1.
const SYNC_SOURCE: [usize; 3] = [2, 0, 1];

pub struct Sid {
    pub regs: [u8; 0x20],
    /// Write-bus latch: most registers read back the last byte written.
    last_written: u8,

    voices: [Voice; 3],
    volume: u8,
    filter_select: u8,

    sample_rate: u32,
    /// Fixed-point cycle accumulator for the sample clock (24.8).
    cycles_per_sample_fp: u64,
    next_sample_fp: u64,

    pcm: Vec<u8>,
    events: EventSink,
}

impl Sid {
    pub fn new(sample_rate: u32) -> Self {
        let sample_rate = sample_rate.max(1);
        let cycles_per_sample_fp = ((CPU_FREQUENCY as u64) << 8) / sample_rate as u64;
        Self {
            regs: [0; 0x20],
            last_written: 0,
            voices: std::array::from_fn(|i| Voice::new(i, sample_rate)),
            volume: 0,
            filter_select: 0,
            sample_rate,
            cycles_per_sample_fp,
            next_sample_fp: cycles_per_sample_fp,
            pcm: Vec::new(),
            events: EventSink::disconnected(),
        }
    }

    pub fn set_event_sink(&mut self, sink: EventSink) {
        self.events = sink;
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        let sample_rate = sample_rate.max(1);
        self.sample_rate = sample_rate;
        self.cycles_per_sample_fp = ((CPU_FREQUENCY as u64) << 8) / sample_rate as u64;
        for v in self.voices.iter_mut() {
            v.set_sample_rate(sample_rate);
        }
    }

    /// Drain the pending PCM bytes (LE i16 mono).
    pub fn take_audio(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pcm)
    }

    pub fn voice(&self, n: usize) -> &Voice {
        &self.voices[n]
    }

    pub(crate) fn save(&self, w: &mut crate::snapshot::SnapshotWriter) {
        w.u32(self.sample_rate);
        w.bytes(&self.regs);
        w.u8(self.last_written);
        w.u8(self.volume);
        w.u8(self.filter_select);
        w.u64(self.next_sample_fp);
        for v in &self.voices {
            v.save(w);
        }
    }

    /// Restore refuses a snapshot taken at a different sample rate:
    /// the envelope tables and the sample clock would no longer line
    /// up with the recorded state.
    pub(crate) fn restore(
        &mut self,
        r: &mut crate::snapshot::SnapshotReader<'_>,
    ) -> crate::error::Result<()> {
        let rate = r.u32()?;
        if rate != self.sample_rate {
            return Err(crate::error::Error::Serialization(format!(
                "snapshot sample rate {rate} differs from configured {}",
                self.sample_rate
            )));
        }
        r.bytes_into(&mut self.regs)?;
        self.last_written = r.u8()?;
        self.volume = r.u8()?;
        self.filter_select = r.u8()?;
        self.next_sample_fp = r.u64()?;
        for v in self.voices.iter_mut() {
            v.restore(r)?;
        }
        self.pcm.clear();
        Ok(())
    }

    // ── Mixing ────────────────────────────────────────────────

    fn mix_sample(&mut self) {
        // Advance all accumulators first so hard sync sees this
        // sample's wrap state.
        for v in self.voices.iter_mut() {
            v.advance();
        }
        for i in 0..3 {
            if self.voices[SYNC_SOURCE[i]].wrapped {
                self.voices[i].hard_sync();
            }
        }
        for i in 0..3 {
            let ring = self.voices[SYNC_SOURCE[i]].osc_index();
            self.voices[i].oscillate(ring);
        }

        // The filter-enable bits select a pre-mix; the filter itself is
        // an identity, so routed and unrouted voices sum the same way.
        let mut sum: i32 = 0;
        for (i, v) in self.voices.iter_mut().enumerate() {
            let out = v.output();
            let _routed = self.filter_select & (1 << i) != 0;
            sum += out;
        }

        let sample = (((sum >> 2) * self.volume as i32) >> 3).clamp(-0x2000, 0x1FFF) as i16;
        self.pcm.extend_from_slice(&sample.to_le_bytes());

        if self.pcm.len() >= AUDIO_BLOCK_SAMPLES * 2 && self.events.is_connected() {
            let block = std::mem::take(&mut self.pcm);
            self.events.emit(HostEvent::AudioBlock(block));
        }
    }
}

impl IoChip for Sid {
    fn read(&mut self, reg: u8) -> u8 {
        match reg & 0x1F {
            PADDLE1 | PADDLE2 => 0,
            RANDOM_GENERATOR => (self.voices[2].osc_output >> 4) as u8,
            ENVELOPE3_OUTPUT => self.voices[2].envelope.level as u8,
            _ => self.last_written,
        }
    }

    fn write(&mut self, reg: u8, data: u8) {
        let reg = reg & 0x1F;
        self.regs[reg as usize] = data;
        self.last_written = data;
        trace!("sid write {reg:#04x} = {data:#04x}");

        match reg {
            0x00..=0x14 => {
                let v = (reg / 7) as usize;
                let field = reg % 7;
                let voice = &mut self.voices[v];
                match field {
                    0 => voice.frequency = (voice.frequency & 0xFF00) | data as u16,
                    1 => voice.frequency = (voice.frequency & 0x00FF) | ((data as u16) << 8),
                    2 => voice.pulse_width = (voice.pulse_width & 0x0F00) | data as u16,
                    3 => {
                        voice.pulse_width =
                            (voice.pulse_width & 0x00FF) | (((data & 0x0F) as u16) << 8)
                    }
                    4 => voice.set_control(data),
                    5 => {
                        voice.envelope.attack_rate = data >> 4;
                        voice.envelope.decay_rate = data & 0x0F;
                    }
                    _ => {
                        voice.envelope.set_sustain(data >> 4);
                        voice.envelope.release_rate = data & 0x0F;
                    }
                }
            }
            FC_LO | FC_HI => {
                // Cutoff registers are latched but the filter is
                // pass-through; expression kept as the original wrote
                // it, operator precedence and all.
                let cutoff = self.regs[FC_LO as usize] as u16
                    & (0x07 + self.regs[FC_HI as usize] as u16) << 3;
                trace!("sid cutoff latch {cutoff}");
            }
            RES_FILT => self.filter_select = data & 0x07,
            MODE_VOL => self.volume = data & 0x0F,
            _ => {}
        }
    }

    fn next_update(&self) -> u64 {
        self.next_sample_fp >> 8
    }

    fn update(&mut self, cycle: u64) {
        let target_fp = cycle << 8;
        while self.next_sample_fp <= target_fp {
            self.next_sample_fp += self.cycles_per_sample_fp;
            self.mix_sample();
        }
    }

    fn reset(&mut self) {
        self.regs.fill(0);
        self.last_written = 0;
        self.volume = 0;
        self.filter_select = 0;
        for v in self.voices.iter_mut() {
            v.reset();
        }
        self.pcm.clear();
        self.next_sample_fp = self.cycles_per_sample_fp;
    }
}
