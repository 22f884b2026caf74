//! SID ADSR envelope generator.
//!
//! The envelope is a real-valued level in [0, 255] driven per output
//! sample.  Attack ramps linearly, decay and release fall exponentially
//! through per-rate multipliers precomputed for the host sample rate.

/// Attack times in seconds, per the 6581 datasheet.
pub const ATTACK_TIMES: [f64; 16] = [
    0.002, 0.008, 0.016, 0.024, 0.038, 0.056, 0.068, 0.080,
    0.100, 0.250, 0.500, 0.800, 1.000, 3.000, 5.000, 8.000,
];

/// Decay / release times in seconds (three times the attack slope).
pub const DECAY_TIMES: [f64; 16] = [
    0.006, 0.024, 0.048, 0.072, 0.114, 0.168, 0.204, 0.240,
    0.300, 0.750, 1.500, 2.400, 3.000, 9.000, 15.000, 24.000,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Attack,
    Decay,
    Sustain,
    Release,
    Finished,
}

#[derive(Clone)]
pub struct Envelope {
    pub phase: Phase,
    /// Current level, 0..=255.
    pub level: f64,

    pub attack_rate: u8,
    pub decay_rate: u8,
    pub sustain: u8,
    pub release_rate: u8,

    gate: bool,

    // Per-sample steps for the current sample rate.
    attack_steps: [f64; 16],
    decay_factors: [f64; 16],
}

impl Envelope {
    pub fn new(sample_rate: u32) -> Self {
        let mut env = Self {
            phase: Phase::Finished,
            level: 0.0,
            attack_rate: 0,
            decay_rate: 0,
            sustain: 0,
            release_rate: 0,
            gate: false,
            attack_steps: [0.0; 16],
            decay_factors: [0.0; 16],
        };
        env.set_sample_rate(sample_rate);
        env
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        let sr = sample_rate.max(1) as f64;
        for i in 0..16 {
            self.attack_steps[i] = 255.0 / (ATTACK_TIMES[i] * sr);
            // Falls from 255 to ~1 over the nominal decay time.
            self.decay_factors[i] = (1.0 / 255.0_f64).powf(1.0 / (DECAY_TIMES[i] * sr));
        }
    }

    pub fn reset(&mut self) {
        self.phase = Phase::Finished;
        self.level = 0.0;
        self.gate = false;
        self.attack_rate = 0;
        self.decay_rate = 0;
        self.sustain = 0;
        self.release_rate = 0;
    }

    /// Gate bit from the voice control register.  Rising edge restarts
    /// the attack, falling edge forces release.
    pub fn set_gate(&mut self, gate: bool) {
        if gate && !self.gate {
            self.phase = Phase::Attack;
        } else if !gate && self.gate {
            self.phase = Phase::Release;
        }
        self.gate = gate;
    }

    /// Sustain level as an envelope value (4-bit nibble doubled out).
    fn sustain_level(&self) -> f64 {
        ((self.sustain << 4) | self.sustain) as f64
    }

    /// A sustain write below the current level drops the voice into
    /// release.
    pub fn set_sustain(&mut self, sustain: u8) {
        self.sustain = sustain & 0x0F;
        if self.phase == Phase::Sustain && self.sustain_level() <= self.level {
            self.phase = Phase::Release;
        }
    }

    pub(crate) fn save(&self, w: &mut crate::snapshot::SnapshotWriter) {
        w.u8(match self.phase {
            Phase::Attack => 0,
            Phase::Decay => 1,
            Phase::Sustain => 2,
            Phase::Release => 3,
            Phase::Finished => 4,
        });
        w.f64(self.level);
        w.u8(self.attack_rate);
        w.u8(self.decay_rate);
        w.u8(self.sustain);
        w.u8(self.release_rate);
        w.bool(self.gate);
    }

    pub(crate) fn restore(
        &mut self,
        r: &mut crate::snapshot::SnapshotReader<'_>,
    ) -> crate::error::Result<()> {
        self.phase = match r.u8()? {
            0 => Phase::Attack,
            1 => Phase::Decay,
            2 => Phase::Sustain,
            3 => Phase::Release,
            _ => Phase::Finished,
        };
        self.level = r.f64()?;
        self.attack_rate = r.u8()? & 0x0F;
        self.decay_rate = r.u8()? & 0x0F;
        self.sustain = r.u8()? & 0x0F;
        self.release_rate = r.u8()? & 0x0F;
        self.gate = r.bool()?;
        Ok(())
    }

    /// Advance one sample; returns the current level.
    pub fn step(&mut self) -> f64 {
        match self.phase {
            Phase::Attack => {
                self.level += self.attack_steps[self.attack_rate as usize];
                if self.level >= 255.0 {
                    self.level = 255.0;
                    self.phase = Phase::Decay;
                }
            }
            Phase::Decay => {
                self.level *= self.decay_factors[self.decay_rate as usize];
                if self.level <= self.sustain_level() {
                    self.level = self.sustain_level();
                    self.phase = Phase::Sustain;
                }
            }
            Phase::Sustain => {
                self.level = self.sustain_level().min(self.level);
            }
            Phase::Release => {
                self.level *= self.decay_factors[self.release_rate as usize];
                if self.level < 1.0 {
                    self.level = 0.0;
                    self.phase = Phase::Finished;
                }
            }
            Phase::Finished => {}
        }
        self.level
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_rise_attacks_to_peak_then_decays() {
        let mut env = Envelope::new(44_100);
        env.attack_rate = 0; // 2 ms
        env.decay_rate = 0;
        env.sustain = 8;
        env.set_gate(true);
        assert_eq!(env.phase, Phase::Attack);

        // 2 ms at 44.1 kHz is ~88 samples; give it slack.
        for _ in 0..200 {
            env.step();
        }
        assert_eq!(env.phase, Phase::Sustain);
        assert!((env.level - 136.0).abs() < 1.0); // 0x88
    }

    #[test]
    fn gate_fall_releases_to_silence() {
        let mut env = Envelope::new(44_100);
        env.attack_rate = 0;
        env.sustain = 15;
        env.release_rate = 0; // 6 ms
        env.set_gate(true);
        for _ in 0..200 {
            env.step();
        }
        env.set_gate(false);
        assert_eq!(env.phase, Phase::Release);
        for _ in 0..2000 {
            env.step();
        }
        assert_eq!(env.phase, Phase::Finished);
        assert_eq!(env.level, 0.0);
    }

    #[test]
    fn sustain_write_below_level_forces_release() {
        let mut env = Envelope::new(44_100);
        env.attack_rate = 0;
        env.sustain = 15;
        env.set_gate(true);
        for _ in 0..200 {
            env.step();
        }
        assert_eq!(env.phase, Phase::Sustain);
        env.set_sustain(4);
        assert_eq!(env.phase, Phase::Release);
    }
}
